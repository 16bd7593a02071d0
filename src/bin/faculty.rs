use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use campus_allocator::config::{self, GatewaySettings};
use campus_allocator::domain::datastore::Datastore;
use campus_allocator::gateway::async_gateway::Gateway;
use campus_allocator::gateway::sync_gateway::SyncGateway;
use campus_allocator::gateway::{BrokerEndpoint, EndpointSelector};
use campus_allocator::heartbeat::{self, PeerLiveness};
use campus_allocator::logger;

/// Faculty gateway between the academic programs and the replicated
/// broker.
#[derive(Parser, Debug)]
#[command(name = "faculty")]
struct Args {
    #[arg(long)]
    faculty_id: i64,

    #[arg(long, default_value = config::DEFAULT_SEMESTER)]
    semester: String,

    #[arg(long, default_value = "Ingeniería")]
    faculty_name: String,

    /// Port of the program-facing request/reply listener.
    #[arg(long, default_value_t = config::DEFAULT_GATEWAY_PORT)]
    port: u16,

    /// Host or IP of the primary broker replica.
    #[arg(long, default_value = "127.0.0.1")]
    primary: String,

    /// Host or IP of the backup broker replica.
    #[arg(long, default_value = "127.0.0.1")]
    backup: String,

    #[arg(long, default_value_t = config::DEFAULT_BROKER_PORT)]
    broker_port: u16,

    #[arg(long, default_value_t = config::DEFAULT_HB_PORT)]
    hb_port: u16,

    /// SQLite database on the shared mount.
    #[arg(long, default_value = "classroom.db")]
    db: PathBuf,

    /// Run the load-balancing-broker variant: one fresh broker
    /// connection per transaction, no transaction table.
    #[arg(long)]
    lbb: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init("faculty");

    let store = Datastore::open(&args.db, &args.semester).context("opening the shared datastore")?;
    store.ensure_faculty(args.faculty_id, &args.faculty_name, &args.semester)?;

    let shutdown = CancellationToken::new();

    let primary_liveness = PeerLiveness::new(config::liveness_window());
    let backup_liveness = PeerLiveness::new(config::liveness_window());
    tokio::spawn(heartbeat::run_observer(
        format!("{}:{}", args.primary, args.hb_port),
        primary_liveness.clone(),
        shutdown.child_token(),
    ));
    tokio::spawn(heartbeat::run_observer(
        format!("{}:{}", args.backup, args.hb_port),
        backup_liveness.clone(),
        shutdown.child_token(),
    ));

    let selector = EndpointSelector::new(
        BrokerEndpoint::new(format!("{}:{}", args.primary, args.broker_port), primary_liveness),
        BrokerEndpoint::new(format!("{}:{}", args.backup, args.broker_port), backup_liveness),
    );

    let settings = GatewaySettings {
        faculty_id: args.faculty_id,
        faculty_name: args.faculty_name,
        semester: args.semester,
        listen: SocketAddr::from(([0, 0, 0, 0], args.port)),
        gc_age: config::GATEWAY_GC_AGE,
    };

    let gateway_task = if args.lbb {
        let gateway = SyncGateway::bind(settings, store, selector).await.context("binding the program listener")?;
        tokio::spawn(gateway.run(shutdown.child_token()))
    } else {
        let gateway = Gateway::bind(settings, store, selector).await.context("binding the program listener")?;
        tokio::spawn(gateway.run(shutdown.child_token()))
    };

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("Cerrando facultad");
    shutdown.cancel();
    let _ = gateway_task.await;
    Ok(())
}
