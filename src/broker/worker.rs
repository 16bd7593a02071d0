use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::api::protocol::{AckDecision, Message, Resolution, TransactionId};
use crate::broker::core::{BrokerBackend, WorkQueue};
use crate::domain::datastore::{Datastore, metric_kind};
use crate::domain::proposal::compute_proposal;
use crate::domain::transaction::{ClientId, TransactionContext, TransactionTable};
use crate::error::{Error, Result};

/// One worker of the broker pool. Pulls frames from the shared fan-out
/// queue and runs the SOL/ACK state machine; PROP and RES go back through
/// the backend. Exits promptly on shutdown.
pub async fn run_worker(
    worker_id: usize,
    queue: WorkQueue,
    backend: BrokerBackend,
    store: Datastore,
    table: TransactionTable,
    ack_timeout: Duration,
    shutdown: CancellationToken,
) {
    log::debug!("Worker-{} started", worker_id);
    loop {
        let unit = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                unit = rx.recv() => unit,
            }
        };
        let Some((client, msg)) = unit else { return };

        let result = match msg {
            Message::Sol { transaction_id, programa, salones, laboratorios, faculty_id, program_id, facultad, semester } => handle_sol(
                worker_id,
                client,
                SolFields { transaction_id, programa, salones, laboratorios, faculty_id, program_id, facultad, semester },
                &backend,
                &store,
                &table,
                ack_timeout,
            ),
            Message::Ack { transaction_id, confirm, reason } => {
                handle_ack(worker_id, transaction_id, confirm, reason, &backend, &store, &table)
            }
            other => {
                log::warn!("Worker-{}: unexpected frame for transaction {} from {}", worker_id, other.transaction_id(), client);
                Ok(())
            }
        };
        if let Err(e) = result {
            // Internal failures never kill the worker.
            log::error!("Worker-{}: {}", worker_id, e);
        }
    }
}

struct SolFields {
    transaction_id: TransactionId,
    programa: String,
    salones: u32,
    laboratorios: u32,
    faculty_id: i64,
    program_id: i64,
    facultad: String,
    semester: String,
}

fn handle_sol(
    worker_id: usize,
    client: ClientId,
    sol: SolFields,
    backend: &BrokerBackend,
    store: &Datastore,
    table: &TransactionTable,
    ack_timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    log::info!(
        "Worker-{}: SOL {} from '{}' ({}: {} salones, {} laboratorios)",
        worker_id,
        sol.transaction_id,
        sol.facultad,
        sol.programa,
        sol.salones,
        sol.laboratorios
    );

    store.ensure_faculty(sol.faculty_id, &sol.facultad, &sol.semester)?;
    store.ensure_program(sol.program_id, sol.faculty_id, &sol.programa, &sol.semester)?;

    let (cls_free, lab_free) = store.free_counts()?;
    let proposal = compute_proposal(sol.salones, sol.laboratorios, cls_free, lab_free);

    // Nothing left to offer for a non-empty request: shortage, not an
    // empty reservation.
    if proposal.is_empty() && (sol.salones > 0 || sol.laboratorios > 0) {
        let reason = if sol.salones > 0 { Error::ShortageClass } else { Error::ShortageLab }.to_string();
        log::warn!("Worker-{}: DENIED {} for '{}': {}", worker_id, sol.transaction_id, sol.facultad, reason);
        return backend.send(client, Message::Res(Resolution::denied(sol.transaction_id, reason)));
    }

    // The allocator re-derives the mobile-lab substitution from the lab
    // shortfall, marking the adapted rooms inside the same transaction.
    let lab_demand = proposal.laboratorios_propuestos + proposal.aulas_moviles;
    match store.allocate_rooms(proposal.salones_propuestos, lab_demand, sol.faculty_id, sol.program_id) {
        Ok(reservation_id) => {
            if let Err(e) = store.record_elapsed(metric_kind::SOL_PROP, started, &sol.facultad, "SERVER") {
                log::error!("Failed to record metric: {}", e);
            }

            let ctx = TransactionContext {
                client,
                reservation_id,
                proposal,
                faculty_name: sol.facultad.clone(),
                deadline: Instant::now() + ack_timeout,
            };
            if !table.insert(sol.transaction_id.clone(), ctx) {
                log::warn!("Worker-{}: transaction id {} is still alive, dropping duplicate SOL", worker_id, sol.transaction_id);
                store.fail_reservation(reservation_id)?;
                return Ok(());
            }

            log::info!(
                "Worker-{}: PROP {} reserved {} rooms (reservation {})",
                worker_id,
                sol.transaction_id,
                proposal.total_rooms(),
                reservation_id
            );
            backend.send(client, Message::Prop { transaction_id: sol.transaction_id, data: proposal })
        }
        Err(e) if e.is_shortage() => {
            log::warn!("Worker-{}: DENIED {} for '{}': {}", worker_id, sol.transaction_id, sol.facultad, e);
            backend.send(client, Message::Res(Resolution::denied(sol.transaction_id, e.to_string())))
        }
        Err(e) => Err(e),
    }
}

fn handle_ack(
    worker_id: usize,
    transaction_id: TransactionId,
    confirm: AckDecision,
    reason: Option<String>,
    backend: &BrokerBackend,
    store: &Datastore,
    table: &TransactionTable,
) -> Result<()> {
    // Whoever removed the context first (ACK or the timeout sweep) owns
    // the resolution.
    let Some(ctx) = table.remove(&transaction_id) else {
        log::debug!("Worker-{}: ACK for unknown or already resolved transaction {}", worker_id, transaction_id);
        return Ok(());
    };

    let started = Instant::now();
    let resolution = match confirm {
        AckDecision::Accept => {
            store.confirm_reservation(ctx.reservation_id)?;
            log::info!("Worker-{}: reservation {} confirmed for '{}' ({})", worker_id, ctx.reservation_id, ctx.faculty_name, transaction_id);
            Resolution::accepted(transaction_id, ctx.proposal)
        }
        AckDecision::Reject => {
            store.fail_reservation(ctx.reservation_id)?;
            let reason = reason.unwrap_or_else(|| "Rechazado por facultad".to_string());
            log::info!(
                "Worker-{}: reservation {} canceled for '{}' ({}): {}",
                worker_id,
                ctx.reservation_id,
                ctx.faculty_name,
                transaction_id,
                reason
            );
            Resolution::canceled(transaction_id, reason)
        }
    };
    if let Err(e) = store.record_elapsed(metric_kind::PROP_RES, started, &ctx.faculty_name, "SERVER") {
        log::error!("Failed to record metric: {}", e);
    }

    backend.send(ctx.client, Message::Res(resolution))
}
