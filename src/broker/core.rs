use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::api::codec::{JsonCodec, WireCodec};
use crate::api::protocol::Message;
use crate::config::BrokerSettings;
use crate::domain::datastore::Datastore;
use crate::domain::transaction::{ClientId, TransactionTable};
use crate::error::{Error, Result};
use crate::broker::{monitor, worker};

/// Routes broker-originated messages back to the gateway connection they
/// belong to. Workers and the reservation monitor share one handle.
#[derive(Clone, Debug, Default)]
pub struct BrokerBackend {
    clients: Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<Message>>>>,
}

impl BrokerBackend {
    fn register(&self, id: ClientId, tx: mpsc::UnboundedSender<Message>) {
        self.clients.lock().expect("BrokerBackend lock poisoned").insert(id, tx);
    }

    fn unregister(&self, id: ClientId) {
        self.clients.lock().expect("BrokerBackend lock poisoned").remove(&id);
    }

    /// Queues `msg` on the writer task of `id`.
    pub fn send(&self, id: ClientId, msg: Message) -> Result<()> {
        let guard = self.clients.lock().expect("BrokerBackend lock poisoned");
        match guard.get(&id) {
            Some(tx) if tx.send(msg).is_ok() => Ok(()),
            _ => Err(Error::ClientGone(id.0)),
        }
    }
}

/// Inbound frames waiting for a worker. Workers lock the receiver just
/// long enough to pull one unit, so frames are served in arrival order
/// regardless of which worker picks them up.
pub type WorkQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(ClientId, Message)>>>;

struct RunningCore {
    shutdown: CancellationToken,
    local_addr: SocketAddr,
}

/// The replica-local allocation service: router listener, worker pool and
/// reservation monitor. Activation binds the public endpoint; deactivation
/// releases it and cancels every task. Both are idempotent, the
/// Binary-Star controller calls them freely on every tick.
pub struct BrokerCore {
    settings: BrokerSettings,
    store: Datastore,
    active: Arc<AtomicBool>,
    running: Option<RunningCore>,
}

impl BrokerCore {
    pub fn new(settings: BrokerSettings, store: Datastore) -> Self {
        Self { settings, store, active: Arc::new(AtomicBool::new(false)), running: None }
    }

    pub fn is_active(&self) -> bool {
        self.running.is_some()
    }

    /// Shared flag mirroring the activation state, for observers that do
    /// not own the core (tests, health probes).
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Binds the router endpoint and spawns the proxy, workers and
    /// monitor. Safe to call while already active.
    ///
    /// # Returns
    /// Returns the bound router address.
    pub async fn activate(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(self.settings.bind).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let queue: WorkQueue = Arc::new(tokio::sync::Mutex::new(work_rx));
        let backend = BrokerBackend::default();
        let table = TransactionTable::new();

        tokio::spawn(run_router(listener, work_tx, backend.clone(), shutdown.clone()));
        for worker_id in 0..self.settings.workers {
            tokio::spawn(worker::run_worker(
                worker_id,
                queue.clone(),
                backend.clone(),
                self.store.clone(),
                table.clone(),
                self.settings.ack_timeout,
                shutdown.clone(),
            ));
        }
        tokio::spawn(monitor::run_monitor(table, backend, self.store.clone(), self.settings.monitor_poll, shutdown.clone()));

        self.active.store(true, Ordering::SeqCst);
        self.running = Some(RunningCore { shutdown, local_addr });
        log::info!("Broker core active on {} ({} workers)", local_addr, self.settings.workers);
        Ok(local_addr)
    }

    /// Releases the router endpoint and signals every task to stop.
    /// In-flight transactions are abandoned; the next active replica's
    /// monitor times their reservations out.
    pub fn deactivate(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            self.active.store(false, Ordering::SeqCst);
            log::info!("Broker core deactivated; router endpoint {} released", running.local_addr);
        }
    }
}

async fn run_router(
    listener: TcpListener,
    work_tx: mpsc::UnboundedSender<(ClientId, Message)>,
    backend: BrokerBackend,
    shutdown: CancellationToken,
) {
    let mut next_client = 0u64;
    loop {
        tokio::select! {
            // Dropping the listener here is what releases the endpoint.
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Router accept failed: {}", e);
                        continue;
                    }
                };
                next_client += 1;
                let id = ClientId(next_client);
                log::debug!("Gateway {} connected as {}", peer, id);

                let (out_tx, out_rx) = mpsc::unbounded_channel();
                backend.register(id, out_tx);

                let framed = Framed::new(stream, JsonCodec::new());
                let (sink, stream) = framed.split();
                tokio::spawn(run_client_writer(id, sink, out_rx, shutdown.clone()));
                tokio::spawn(run_client_reader(id, stream, work_tx.clone(), backend.clone(), shutdown.clone()));
            }
        }
    }
}

async fn run_client_writer(
    id: ClientId,
    mut sink: SplitSink<Framed<TcpStream, WireCodec>, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        log::debug!("Write to {} failed: {}", id, e);
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

async fn run_client_reader(
    id: ClientId,
    mut stream: SplitStream<Framed<TcpStream, WireCodec>>,
    work_tx: mpsc::UnboundedSender<(ClientId, Message)>,
    backend: BrokerBackend,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(msg)) => {
                    if work_tx.send((id, msg)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    // The length prefix was consumed, the stream stays framed.
                    log::warn!("Dropping undecodable frame from {}: {}", id, e);
                }
                None => break,
            }
        }
    }
    backend.unregister(id);
    log::debug!("Gateway {} disconnected", id);
}
