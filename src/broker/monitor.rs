use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::api::protocol::{Message, Resolution};
use crate::broker::core::BrokerBackend;
use crate::domain::datastore::Datastore;
use crate::domain::transaction::TransactionTable;

/// Sweeps the transaction table for PROP-without-ACK entries past their
/// deadline, rolling the reservation back and notifying the gateway.
/// Co-resident with the worker pool; one instance per active core.
pub async fn run_monitor(
    table: TransactionTable,
    backend: BrokerBackend,
    store: Datastore,
    poll: Duration,
    shutdown: CancellationToken,
) {
    log::debug!("Reservation monitor started (poll every {:?})", poll);
    let mut ticker = tokio::time::interval(poll);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                for (transaction_id, ctx) in table.take_expired(Instant::now()) {
                    log::warn!(
                        "No ACK for transaction {} from '{}' within the window; canceling reservation {}",
                        transaction_id,
                        ctx.faculty_name,
                        ctx.reservation_id
                    );
                    if let Err(e) = store.fail_reservation(ctx.reservation_id) {
                        log::error!("Failed to roll back reservation {}: {}", ctx.reservation_id, e);
                    }

                    let resolution = Resolution::canceled(transaction_id, "timeout");
                    if backend.send(ctx.client, Message::Res(resolution)).is_err() {
                        log::debug!("{} disconnected before the timeout RES could be delivered", ctx.client);
                    }
                }
            }
        }
    }
}
