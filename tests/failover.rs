use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use campus_allocator::broker::binary_star::{BinaryStar, Role};
use campus_allocator::broker::core::BrokerCore;
use campus_allocator::config::{BrokerSettings, liveness_window};
use campus_allocator::domain::datastore::Datastore;
use campus_allocator::heartbeat::{self, HeartbeatPublisher, PeerLiveness};

fn fresh_store() -> (tempfile::TempDir, Datastore) {
    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(dir.path().join("classroom.db"), "2025-2").unwrap();
    store.seed_inventory().unwrap();
    (dir, store)
}

fn replica(role: Role, host: &str, store: &Datastore, peer: PeerLiveness) -> BinaryStar {
    let core = BrokerCore::new(BrokerSettings::new("127.0.0.1:0".parse().unwrap()), store.clone());
    BinaryStar::new(role, host.to_string(), core, store.clone(), peer)
}

#[tokio::test]
async fn backup_takes_over_when_the_primary_goes_silent() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();

    // Primary replica plus its heartbeat publisher.
    let primary_stop = shutdown.child_token();
    let publisher = HeartbeatPublisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let primary_hb = publisher.local_addr().unwrap();
    tokio::spawn(publisher.run(primary_stop.clone()));

    let primary = replica(Role::Primary, "alpha", &store, PeerLiveness::new(liveness_window()));
    let primary_active = primary.active_flag();
    tokio::spawn(primary.run(primary_stop.clone()));

    // Backup replica observing the primary.
    let peer_liveness = PeerLiveness::new(liveness_window());
    tokio::spawn(heartbeat::run_observer(primary_hb.to_string(), peer_liveness.clone(), shutdown.child_token()));

    let backup = replica(Role::Backup, "beta", &store, peer_liveness);
    let backup_active = backup.active_flag();
    tokio::spawn(backup.run(shutdown.child_token()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(primary_active.load(Ordering::SeqCst), "primary binds unconditionally");
    assert!(!backup_active.load(Ordering::SeqCst), "backup idles while the peer is alive");

    // Kill the primary (publisher and controller together).
    primary_stop.cancel();

    // Takeover happens within the liveness window plus one heartbeat.
    tokio::time::sleep(liveness_window() + Duration::from_secs(2)).await;
    assert!(backup_active.load(Ordering::SeqCst), "backup must bind after the window expires");

    shutdown.cancel();
}

#[tokio::test]
async fn backup_yields_when_the_primary_comes_back() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();

    // The backup starts alone: its peer has never been seen.
    let peer_liveness = PeerLiveness::new(liveness_window());
    let backup = replica(Role::Backup, "beta", &store, peer_liveness.clone());
    let backup_active = backup.active_flag();
    tokio::spawn(backup.run(shutdown.child_token()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(backup_active.load(Ordering::SeqCst), "lone backup stands in for the primary");

    // Primary heartbeats reappear.
    let publisher = HeartbeatPublisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let primary_hb = publisher.local_addr().unwrap();
    tokio::spawn(publisher.run(shutdown.child_token()));
    tokio::spawn(heartbeat::run_observer(primary_hb.to_string(), peer_liveness, shutdown.child_token()));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!backup_active.load(Ordering::SeqCst), "backup releases the endpoint once the peer is back");

    shutdown.cancel();
}
