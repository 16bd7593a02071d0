pub mod async_gateway;
pub mod programs;
pub mod sync_gateway;

use crate::heartbeat::PeerLiveness;

/// One broker replica as a gateway sees it: router address plus the
/// liveness its observer keeps fresh.
#[derive(Clone, Debug)]
pub struct BrokerEndpoint {
    pub addr: String,
    pub liveness: PeerLiveness,
}

impl BrokerEndpoint {
    pub fn new(addr: impl Into<String>, liveness: PeerLiveness) -> Self {
        Self { addr: addr.into(), liveness }
    }
}

/// Picks the broker endpoint to talk to: the primary while it is alive,
/// the backup while only the backup is, nothing otherwise. At most one
/// endpoint is ever selected.
#[derive(Clone, Debug)]
pub struct EndpointSelector {
    primary: BrokerEndpoint,
    backup: BrokerEndpoint,
}

impl EndpointSelector {
    pub fn new(primary: BrokerEndpoint, backup: BrokerEndpoint) -> Self {
        Self { primary, backup }
    }

    pub fn current(&self) -> Option<&str> {
        if self.primary.liveness.is_alive() {
            Some(&self.primary.addr)
        } else if self.backup.liveness.is_alive() {
            Some(&self.backup.addr)
        } else {
            None
        }
    }
}
