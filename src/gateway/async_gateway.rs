use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::api::codec::{JsonCodec, ReplyCodec, WireCodec};
use crate::api::protocol::{AckDecision, Message, ProgramRequest, ResStatus, Resolution, TransactionId, new_transaction_id};
use crate::config::{GatewaySettings, HB_INTERVAL};
use crate::domain::datastore::{Datastore, OUTCOME_FAILURE, OUTCOME_SUCCESS, metric_kind};
use crate::error::Result;
use crate::gateway::EndpointSelector;
use crate::gateway::programs::ProgramRegistry;

/// One program request waiting for its final RES.
struct PendingRequest {
    request: ProgramRequest,
    received_at: Instant,
    reply: oneshot::Sender<Resolution>,
}

/// Gateway-side context of one in-flight transaction.
struct TxEntry {
    program_name: String,
    reply: oneshot::Sender<Resolution>,
    /// When the connection task read the program request.
    received_at: Instant,
    /// When the gateway loop started processing it.
    started: Instant,
    sol_sent: Instant,
    ack_sent: Option<Instant>,
}

/// The canonical faculty gateway: a request/reply listener toward the
/// programs and one framed link toward whichever broker replica the
/// heartbeat observers currently consider live. All transaction state
/// lives inside the single gateway loop.
pub struct Gateway {
    settings: GatewaySettings,
    store: Datastore,
    selector: EndpointSelector,
    listener: TcpListener,
}

impl Gateway {
    pub async fn bind(settings: GatewaySettings, store: Datastore, selector: EndpointSelector) -> Result<Self> {
        let listener = TcpListener::bind(settings.listen).await?;
        Ok(Self { settings, store, selector, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Gateway { settings, store, selector, listener } = self;
        log::info!("Facultad '{}' (id {}) lista en {}", settings.faculty_name, settings.faculty_id, listener.local_addr()?);

        let (req_tx, mut req_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_program_listener(listener, req_tx, shutdown.clone()));

        let mut programs = ProgramRegistry::new(store.clone(), settings.faculty_id, settings.semester.clone());
        let mut table: HashMap<TransactionId, TxEntry> = HashMap::new();
        let mut link: Option<Framed<TcpStream, WireCodec>> = None;
        let mut link_target: Option<String> = None;

        let mut retarget = tokio::time::interval(HB_INTERVAL / 2);
        let mut gc = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),

                pending = req_rx.recv() => {
                    let Some(pending) = pending else { return Ok(()) };
                    handle_program_request(&settings, &store, &mut programs, &mut table, &mut link, pending).await;
                }

                frame = async { link.as_mut().expect("branch guarded on link").next().await }, if link.is_some() => match frame {
                    Some(Ok(msg)) => handle_broker_message(&settings, &store, &mut table, &mut link, msg).await,
                    Some(Err(e)) => log::warn!("Dropping undecodable broker frame: {}", e),
                    None => {
                        log::warn!("Broker link closed by the peer");
                        link = None;
                        link_target = None;
                    }
                },

                _ = retarget.tick() => {
                    retarget_link(&selector, &mut link, &mut link_target).await;
                }

                _ = gc.tick() => {
                    collect_stale(&settings, &store, &mut table);
                }
            }
        }
    }
}

/// Reconnects the broker link whenever the live endpoint flips, or when
/// the previous connection broke while the target stayed the same.
async fn retarget_link(selector: &EndpointSelector, link: &mut Option<Framed<TcpStream, WireCodec>>, link_target: &mut Option<String>) {
    let desired = selector.current().map(str::to_string);
    let flip = desired != *link_target;
    if !flip && !(desired.is_some() && link.is_none()) {
        return;
    }

    if flip && link_target.is_some() {
        log::info!("Leaving broker endpoint {}", link_target.as_deref().unwrap_or("-"));
    }
    *link = None;
    *link_target = None;

    let Some(addr) = desired else {
        log::warn!("Ningún servidor disponible");
        return;
    };
    match tokio::time::timeout(HB_INTERVAL, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => {
            log::info!("Conectado al broker activo en {}", addr);
            *link = Some(Framed::new(stream, JsonCodec::new()));
            *link_target = Some(addr);
        }
        Ok(Err(e)) => log::warn!("Failed to connect to broker {}: {}", addr, e),
        Err(_) => log::warn!("Connection attempt to broker {} timed out", addr),
    }
}

async fn handle_program_request(
    settings: &GatewaySettings,
    store: &Datastore,
    programs: &mut ProgramRegistry,
    table: &mut HashMap<TransactionId, TxEntry>,
    link: &mut Option<Framed<TcpStream, WireCodec>>,
    pending: PendingRequest,
) {
    let PendingRequest { request, received_at, reply } = pending;
    let started = Instant::now();
    let transaction_id = new_transaction_id();
    log::info!(
        "SOL {} de programa '{}' ({} salones, {} laboratorios)",
        transaction_id,
        request.programa,
        request.salones,
        request.laboratorios
    );

    let program_id = match programs.resolve(&request.programa) {
        Ok(id) => id,
        Err(e) => {
            log::error!("Failed to register program '{}': {}", request.programa, e);
            let res = Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string());
            return finish(store, settings, &request.programa, received_at, started, reply, res);
        }
    };

    let Some(framed) = link.as_mut() else {
        log::error!("No hay servidor activo para SOL {}", transaction_id);
        let res = Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyNoServer, "No active server");
        return finish(store, settings, &request.programa, received_at, started, reply, res);
    };

    let sol = Message::Sol {
        transaction_id: transaction_id.clone(),
        programa: request.programa.clone(),
        salones: request.salones,
        laboratorios: request.laboratorios,
        faculty_id: settings.faculty_id,
        program_id,
        facultad: settings.faculty_name.clone(),
        semester: settings.semester.clone(),
    };

    match framed.send(sol).await {
        Ok(()) => {
            table.insert(
                transaction_id.clone(),
                TxEntry { program_name: request.programa, reply, received_at, started, sol_sent: Instant::now(), ack_sent: None },
            );
            log::debug!("SOL {} reenviada al broker activo", transaction_id);
        }
        Err(e) => {
            log::error!("Failed to send SOL {}: {}", transaction_id, e);
            *link = None;
            let res = Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string());
            finish(store, settings, &request.programa, received_at, started, reply, res);
        }
    }
}

async fn handle_broker_message(
    settings: &GatewaySettings,
    store: &Datastore,
    table: &mut HashMap<TransactionId, TxEntry>,
    link: &mut Option<Framed<TcpStream, WireCodec>>,
    msg: Message,
) {
    match msg {
        Message::Prop { transaction_id, data } => {
            let Some(entry) = table.get(&transaction_id) else {
                log::warn!("PROP for untracked transaction {}", transaction_id);
                return;
            };
            let src = format!("Facultad:{}", settings.faculty_id);
            if let Err(e) = store.record_elapsed(metric_kind::SOL_PROP_ROUNDTRIP, entry.sol_sent, &src, "SERVER") {
                log::error!("Failed to record metric: {}", e);
            }
            log::info!(
                "PROP {} recibida ({} salones, {} laboratorios, {} aulas móviles); enviando ACK",
                transaction_id,
                data.salones_propuestos,
                data.laboratorios_propuestos,
                data.aulas_moviles
            );

            let ack = Message::Ack { transaction_id: transaction_id.clone(), confirm: AckDecision::Accept, reason: None };
            let sent = match link.as_mut() {
                Some(framed) => framed.send(ack).await.map_err(|e| e.to_string()),
                None => Err("broker link lost".to_string()),
            };
            match sent {
                Ok(()) => {
                    if let Some(entry) = table.get_mut(&transaction_id) {
                        entry.ack_sent = Some(Instant::now());
                    }
                }
                Err(e) => {
                    log::error!("Failed to send ACK {}: {}", transaction_id, e);
                    *link = None;
                    if let Some(entry) = table.remove(&transaction_id) {
                        let res = Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e);
                        finish(store, settings, &entry.program_name, entry.received_at, entry.started, entry.reply, res);
                    }
                }
            }
        }

        Message::Res(resolution) => {
            let Some(entry) = table.remove(&resolution.transaction_id) else {
                log::warn!("RES for untracked transaction {}", resolution.transaction_id);
                return;
            };
            if let Some(ack_sent) = entry.ack_sent {
                let src = format!("Facultad:{}", settings.faculty_id);
                if let Err(e) = store.record_elapsed(metric_kind::ACK_RES_ROUNDTRIP, ack_sent, &src, "SERVER") {
                    log::error!("Failed to record metric: {}", e);
                }
            }
            finish(store, settings, &entry.program_name, entry.received_at, entry.started, entry.reply, resolution);
        }

        other => log::warn!("Unexpected broker frame for transaction {}", other.transaction_id()),
    }
}

/// Expires contexts whose RES never came; the waiting program gets a
/// synthetic timeout RES so every request still sees exactly one reply.
fn collect_stale(settings: &GatewaySettings, store: &Datastore, table: &mut HashMap<TransactionId, TxEntry>) {
    let now = Instant::now();
    let stale: Vec<TransactionId> = table
        .iter()
        .filter(|(_, entry)| now.saturating_duration_since(entry.started) > settings.gc_age)
        .map(|(id, _)| id.clone())
        .collect();

    for transaction_id in stale {
        if let Some(entry) = table.remove(&transaction_id) {
            log::warn!("Transaction {} never resolved; timing out", transaction_id);
            let res = Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyTimeout, "Broker silent beyond expected window");
            finish(store, settings, &entry.program_name, entry.received_at, entry.started, entry.reply, res);
        }
    }
}

/// Delivers the final RES to the program connection and records the
/// closing metrics, failure paths included.
fn finish(
    store: &Datastore,
    settings: &GatewaySettings,
    program_name: &str,
    received_at: Instant,
    started: Instant,
    reply: oneshot::Sender<Resolution>,
    resolution: Resolution,
) {
    let src = format!("Facultad:{}", settings.faculty_id);
    let dst = format!("Programa:{}", program_name);
    let outcome = if resolution.status.is_accepted() { OUTCOME_SUCCESS } else { OUTCOME_FAILURE };

    let recorded = [
        store.record_elapsed(metric_kind::FACULTY_PROCESSING_TOTAL_MS, started, &src, &dst),
        store.record_elapsed(metric_kind::PROGRAM_RESPONSE_TOTAL_MS, received_at, &src, &dst),
        store.record_metric(metric_kind::REQUEST_OUTCOME, outcome, &src, &dst),
    ];
    for result in recorded {
        if let Err(e) = result {
            log::error!("Failed to record gateway metric: {}", e);
        }
    }

    log::info!("RES {} para '{}': {}", resolution.transaction_id, program_name, resolution.status);
    if reply.send(resolution).is_err() {
        log::debug!("Program '{}' hung up before the reply", program_name);
    }
}

async fn run_program_listener(listener: TcpListener, req_tx: mpsc::UnboundedSender<PendingRequest>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log::warn!("Program accept failed: {}", e);
                        continue;
                    }
                };
                tokio::spawn(handle_program_conn(stream, req_tx.clone()));
            }
        }
    }
}

/// One request, one reply, per TCP peer.
async fn handle_program_conn(stream: TcpStream, req_tx: mpsc::UnboundedSender<PendingRequest>) {
    let mut framed = Framed::new(stream, ReplyCodec::new());
    let received_at = Instant::now();

    match framed.next().await {
        Some(Ok(request)) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if req_tx.send(PendingRequest { request, received_at, reply: reply_tx }).is_err() {
                return;
            }
            if let Ok(resolution) = reply_rx.await {
                if let Err(e) = framed.send(Message::Res(resolution)).await {
                    log::debug!("Failed to write the reply: {}", e);
                }
            }
        }
        Some(Err(e)) => {
            log::warn!("Undecodable program request: {}", e);
            let res = Resolution::gateway_error(new_transaction_id(), ResStatus::ErrorFacultyDecodeError, e.to_string());
            let _ = framed.send(Message::Res(res)).await;
        }
        None => {}
    }
}
