use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use campus_allocator::broker::binary_star::{BinaryStar, Role};
use campus_allocator::broker::core::BrokerCore;
use campus_allocator::config::{self, BrokerSettings};
use campus_allocator::domain::datastore::Datastore;
use campus_allocator::heartbeat::{self, HeartbeatPublisher, PeerLiveness};
use campus_allocator::logger;

/// Replicated allocation broker. Run one PRIMARY and one BACKUP; the
/// Binary-Star controller decides which of them binds the router
/// endpoint.
#[derive(Parser, Debug)]
#[command(name = "broker")]
struct Args {
    /// Configured role of this replica.
    #[arg(long, value_enum)]
    role: Role,

    /// Host or IP of the peer replica.
    #[arg(long)]
    peer: String,

    /// Public router endpoint to bind while active.
    #[arg(long, default_value = "0.0.0.0:5555")]
    bind: SocketAddr,

    /// Local heartbeat publish port.
    #[arg(long, default_value_t = config::DEFAULT_HB_PORT)]
    hb_port: u16,

    /// Heartbeat port of the peer replica.
    #[arg(long, default_value_t = config::DEFAULT_HB_PORT)]
    peer_hb_port: u16,

    /// SQLite database on the shared mount.
    #[arg(long, default_value = "classroom.db")]
    db: PathBuf,

    #[arg(long, default_value = config::DEFAULT_SEMESTER)]
    semester: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init("broker");

    let store = Datastore::open(&args.db, &args.semester).context("opening the shared datastore")?;
    store.seed_inventory().context("seeding the room inventory")?;
    let (cls_free, lab_free) = store.free_counts()?;
    log::info!("Recursos iniciales: {} salones, {} laboratorios libres", cls_free, lab_free);

    let shutdown = CancellationToken::new();

    let publisher = HeartbeatPublisher::bind(SocketAddr::from(([0, 0, 0, 0], args.hb_port)))
        .await
        .context("binding the heartbeat endpoint")?;
    tokio::spawn(publisher.run(shutdown.child_token()));

    let peer_liveness = PeerLiveness::new(config::liveness_window());
    let peer_endpoint = format!("{}:{}", args.peer, args.peer_hb_port);
    tokio::spawn(heartbeat::run_observer(peer_endpoint, peer_liveness.clone(), shutdown.child_token()));

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let core = BrokerCore::new(BrokerSettings::new(args.bind), store.clone());
    let star = BinaryStar::new(args.role, host, core, store, peer_liveness);
    let star_task = tokio::spawn(star.run(shutdown.child_token()));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("Cerrando servidor");
    shutdown.cancel();
    let _ = star_task.await;
    Ok(())
}
