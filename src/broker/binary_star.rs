use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::broker::core::BrokerCore;
use crate::config::HB_INTERVAL;
use crate::domain::datastore::Datastore;
use crate::heartbeat::PeerLiveness;

/// Configured role of this replica. The acting role can differ: a backup
/// that took over registers itself as PRIMARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum Role {
    Primary,
    Backup,
}

impl Role {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Role::Primary => "PRIMARY",
            Role::Backup => "BACKUP",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Two-replica active/passive failover. Evaluates the activation state
/// machine once per heartbeat interval against the peer's liveness
/// window and drives the broker core accordingly:
///
/// - PRIMARY binds as soon as it runs and never voluntarily lets go.
/// - BACKUP binds only while the peer is silent, and releases the
///   endpoint the moment the peer comes back.
pub struct BinaryStar {
    role: Role,
    host: String,
    store: Datastore,
    peer: PeerLiveness,
    core: BrokerCore,
}

impl BinaryStar {
    pub fn new(role: Role, host: String, core: BrokerCore, store: Datastore, peer: PeerLiveness) -> Self {
        Self { role, host, store, peer, core }
    }

    /// Shared activation flag of the underlying core.
    pub fn active_flag(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.core.active_flag()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("{} replica '{}' watching peer heartbeats", self.role, self.host);
        let mut ticker = tokio::time::interval(HB_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.core.deactivate();
                    return;
                }
                _ = ticker.tick() => self.evaluate().await,
            }
        }
    }

    async fn evaluate(&mut self) {
        let peer_alive = self.peer.is_alive();

        match self.role {
            Role::Primary => {
                if !self.core.is_active() {
                    self.try_activate().await;
                }
            }
            Role::Backup => {
                if peer_alive && self.core.is_active() {
                    log::info!("Primary recovered; releasing the endpoint");
                    self.core.deactivate();
                } else if !peer_alive && !self.core.is_active() {
                    log::warn!("Peer silent beyond the liveness window; taking over");
                    self.try_activate().await;
                }
            }
        }

        let acting = if self.core.is_active() { Role::Primary } else { Role::Backup };
        if let Err(e) = self.store.register_server_role(&self.host, acting.as_sql()) {
            log::error!("Failed to register server role: {}", e);
        }
    }

    async fn try_activate(&mut self) {
        // A failed bind (stale socket, split peer still holding the port)
        // is retried on the next tick.
        if let Err(e) = self.core.activate().await {
            log::error!("Failed to activate broker core: {}", e);
        }
    }
}
