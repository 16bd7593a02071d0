use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interval between heartbeat ticks on the publish endpoint.
pub const HB_INTERVAL: Duration = Duration::from_secs(1);

/// Number of missed heartbeat intervals before a peer is declared dead.
pub const HB_LIVENESS: u32 = 3;

/// Worker tasks pulling from the broker fan-out queue.
pub const WORKER_COUNT: usize = 5;

/// How long the broker holds a PENDING reservation waiting for the ACK.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Sweep period of the reservation monitor. Must stay below HB_INTERVAL/2.
pub const MONITOR_POLL: Duration = Duration::from_millis(400);

/// Gateway transaction contexts older than this are garbage-collected.
pub const GATEWAY_GC_AGE: Duration = Duration::from_secs(30);

/// Client-side end-to-end timeout for one program request.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

pub const INITIAL_CLASSROOMS: u32 = 380;
pub const INITIAL_LABS: u32 = 60;
pub const DEFAULT_SEMESTER: &str = "2025-2";

pub const DEFAULT_BROKER_PORT: u16 = 5555;
pub const DEFAULT_GATEWAY_PORT: u16 = 6000;
pub const DEFAULT_HB_PORT: u16 = 7000;

/// Maximum silence before a heartbeat peer is declared dead.
pub fn liveness_window() -> Duration {
    HB_INTERVAL * HB_LIVENESS
}

/// Directory all binaries log into.
pub const LOG_DIR: &str = "logs";

/// Log file of one component, e.g. `logs/broker.log`.
pub fn log_file(component: &str) -> PathBuf {
    Path::new(LOG_DIR).join(format!("{}.log", component))
}

/// Runtime parameters of one broker replica core.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Public router endpoint the active replica binds.
    pub bind: SocketAddr,
    pub workers: usize,
    pub ack_timeout: Duration,
    pub monitor_poll: Duration,
}

impl BrokerSettings {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, workers: WORKER_COUNT, ack_timeout: ACK_TIMEOUT, monitor_poll: MONITOR_POLL }
    }
}

/// Runtime parameters of one faculty gateway process.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub faculty_id: i64,
    pub faculty_name: String,
    pub semester: String,
    /// Program-facing request/reply listener.
    pub listen: SocketAddr,
    pub gc_age: Duration,
}
