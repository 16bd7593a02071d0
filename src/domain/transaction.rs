use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::api::protocol::{Proposal, TransactionId};

/// Opaque routing token of one gateway connection at the broker router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Broker-side state of one transaction between PROP and its ACK.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub client: ClientId,
    pub reservation_id: i64,
    pub proposal: Proposal,
    pub faculty_name: String,
    pub deadline: Instant,
}

/// Outstanding transaction contexts, keyed by transaction id.
///
/// Workers and the reservation monitor both mutate the table; a single
/// lock protects it. The ACK/timeout race resolves on `remove`: whoever
/// takes the context first owns the resolution, the loser sees None.
#[derive(Clone, Debug, Default)]
pub struct TransactionTable {
    inner: Arc<Mutex<HashMap<TransactionId, TransactionContext>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, TransactionContext>> {
        self.inner.lock().expect("TransactionTable lock poisoned")
    }

    /// Registers a context. Returns false (and leaves the existing entry
    /// untouched) if the transaction id is still alive, which would mean
    /// an id was reused mid-flight.
    pub fn insert(&self, id: TransactionId, ctx: TransactionContext) -> bool {
        let mut guard = self.lock();
        if guard.contains_key(&id) {
            return false;
        }
        guard.insert(id, ctx);
        true
    }

    /// Takes the context out of the table, claiming the right to resolve
    /// the transaction.
    pub fn remove(&self, id: &str) -> Option<TransactionContext> {
        self.lock().remove(id)
    }

    /// Drains every context whose deadline has passed.
    pub fn take_expired(&self, now: Instant) -> Vec<(TransactionId, TransactionContext)> {
        let mut guard = self.lock();
        let expired: Vec<TransactionId> = guard.iter().filter(|(_, ctx)| ctx.deadline <= now).map(|(id, _)| id.clone()).collect();
        expired
            .into_iter()
            .map(|id| {
                let ctx = guard.remove(&id).expect("expired id vanished under the lock");
                (id, ctx)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
