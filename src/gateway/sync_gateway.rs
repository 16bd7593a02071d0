use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::api::codec::{JsonCodec, ReplyCodec};
use crate::api::protocol::{AckDecision, Message, ProgramRequest, ResStatus, Resolution, new_transaction_id};
use crate::config::{CLIENT_TIMEOUT, GatewaySettings, HB_INTERVAL};
use crate::domain::datastore::{Datastore, OUTCOME_FAILURE, OUTCOME_SUCCESS, metric_kind};
use crate::error::Result;
use crate::gateway::EndpointSelector;
use crate::gateway::programs::ProgramRegistry;

/// Load-balancing-broker variant of the gateway: every transaction runs
/// on its own fresh broker connection, fully synchronously, so there is
/// no transaction table to keep. Program requests serialize inside the
/// process.
pub struct SyncGateway {
    settings: GatewaySettings,
    store: Datastore,
    selector: EndpointSelector,
    listener: TcpListener,
}

impl SyncGateway {
    pub async fn bind(settings: GatewaySettings, store: Datastore, selector: EndpointSelector) -> Result<Self> {
        let listener = TcpListener::bind(settings.listen).await?;
        Ok(Self { settings, store, selector, listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let SyncGateway { settings, store, selector, listener } = self;
        log::info!("Facultad '{}' (id {}, modo lbb) lista en {}", settings.faculty_name, settings.faculty_id, listener.local_addr()?);

        let mut programs = ProgramRegistry::new(store.clone(), settings.faculty_id, settings.semester.clone());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("Program accept failed: {}", e);
                            continue;
                        }
                    };
                    serve_one_program(&settings, &store, &selector, &mut programs, stream).await;
                }
            }
        }
    }
}

async fn serve_one_program(
    settings: &GatewaySettings,
    store: &Datastore,
    selector: &EndpointSelector,
    programs: &mut ProgramRegistry,
    stream: TcpStream,
) {
    let mut framed = Framed::new(stream, ReplyCodec::new());
    let received_at = Instant::now();

    let request = match framed.next().await {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            log::warn!("Undecodable program request: {}", e);
            let res = Resolution::gateway_error(new_transaction_id(), ResStatus::ErrorFacultyDecodeError, e.to_string());
            let _ = framed.send(Message::Res(res)).await;
            return;
        }
        None => return,
    };

    let started = Instant::now();
    let resolution = run_transaction(settings, store, selector, programs, &request).await;

    let src = format!("Facultad:{}", settings.faculty_id);
    let dst = format!("Programa:{}", request.programa);
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

    log::info!("RES {} para '{}': {}", resolution.transaction_id, request.programa, resolution.status);
    if let Err(e) = framed.send(Message::Res(resolution)).await {
        log::debug!("Failed to write the reply: {}", e);
    }
}

/// One full SOL→PROP→ACK→RES exchange over a dedicated connection.
async fn run_transaction(
    settings: &GatewaySettings,
    store: &Datastore,
    selector: &EndpointSelector,
    programs: &mut ProgramRegistry,
    request: &ProgramRequest,
) -> Resolution {
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
        Err(e) => return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string()),
    };

    let Some(endpoint) = selector.current().map(str::to_string) else {
        log::error!("No hay servidor activo para SOL {}", transaction_id);
        return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyNoServer, "No active server");
    };

    let stream = match tokio::time::timeout(HB_INTERVAL, TcpStream::connect(&endpoint)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string()),
        Err(_) => return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, "connect timed out"),
    };
    let mut link = Framed::new(stream, JsonCodec::<Message, Message>::new());

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
    if let Err(e) = link.send(sol).await {
        return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string());
    }
    let sol_sent = Instant::now();
    let src = format!("Facultad:{}", settings.faculty_id);

    // First broker message: the PROP, or an early RES (DENIED).
    match recv_message(&mut link).await {
        BrokerTurn::Message(Message::Res(resolution)) => resolution,
        BrokerTurn::Message(Message::Prop { transaction_id: prop_tx, data }) if prop_tx == transaction_id => {
            if let Err(e) = store.record_elapsed(metric_kind::SOL_PROP_ROUNDTRIP, sol_sent, &src, "SERVER") {
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
            if let Err(e) = link.send(ack).await {
                return Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, e.to_string());
            }
            let ack_sent = Instant::now();

            match recv_message(&mut link).await {
                BrokerTurn::Message(Message::Res(resolution)) => {
                    if let Err(e) = store.record_elapsed(metric_kind::ACK_RES_ROUNDTRIP, ack_sent, &src, "SERVER") {
                        log::error!("Failed to record metric: {}", e);
                    }
                    resolution
                }
                BrokerTurn::Message(_) => {
                    Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyUnexpectedFinalRes, "Expected a final RES")
                }
                BrokerTurn::Timeout => {
                    Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyTimeout, "Broker silent beyond expected window")
                }
                BrokerTurn::Broken(reason) => Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, reason),
            }
        }
        BrokerTurn::Message(_) => {
            Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyUnexpectedFinalRes, "Expected a PROP or RES")
        }
        BrokerTurn::Timeout => Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultyTimeout, "Broker silent beyond expected window"),
        BrokerTurn::Broken(reason) => Resolution::gateway_error(transaction_id, ResStatus::ErrorFacultySendFailed, reason),
    }
}

enum BrokerTurn {
    Message(Message),
    Timeout,
    Broken(String),
}

async fn recv_message(link: &mut Framed<TcpStream, JsonCodec<Message, Message>>) -> BrokerTurn {
    match tokio::time::timeout(CLIENT_TIMEOUT, link.next()).await {
        Ok(Some(Ok(msg))) => BrokerTurn::Message(msg),
        Ok(Some(Err(e))) => BrokerTurn::Broken(e.to_string()),
        Ok(None) => BrokerTurn::Broken("broker closed the connection".to_string()),
        Err(_) => BrokerTurn::Timeout,
    }
}
