use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use campus_allocator::api::codec::{JsonCodec, WireCodec};
use campus_allocator::api::protocol::{AckDecision, Message, ResStatus};
use campus_allocator::broker::core::BrokerCore;
use campus_allocator::config::BrokerSettings;
use campus_allocator::domain::datastore::{Datastore, metric_kind};

fn fresh_store() -> (tempfile::TempDir, Datastore) {
    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(dir.path().join("classroom.db"), "2025-2").unwrap();
    store.seed_inventory().unwrap();
    (dir, store)
}

async fn start_broker(store: Datastore, ack_timeout: Duration) -> (BrokerCore, SocketAddr) {
    let mut settings = BrokerSettings::new("127.0.0.1:0".parse().unwrap());
    settings.ack_timeout = ack_timeout;
    settings.monitor_poll = Duration::from_millis(50);

    let mut core = BrokerCore::new(settings, store);
    let addr = core.activate().await.unwrap();
    (core, addr)
}

async fn connect(addr: SocketAddr) -> Framed<TcpStream, WireCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), JsonCodec::new())
}

fn sol(transaction_id: &str, salones: u32, laboratorios: u32) -> Message {
    Message::Sol {
        transaction_id: transaction_id.into(),
        programa: "IngSw".into(),
        salones,
        laboratorios,
        faculty_id: 1,
        program_id: 1,
        facultad: "Ingenieria".into(),
        semester: "2025-2".into(),
    }
}

fn ack(transaction_id: &str, confirm: AckDecision, reason: Option<&str>) -> Message {
    Message::Ack { transaction_id: transaction_id.into(), confirm, reason: reason.map(str::to_string) }
}

async fn recv(link: &mut Framed<TcpStream, WireCodec>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), link.next()).await.expect("broker stayed silent").expect("link closed").expect("bad frame")
}

#[tokio::test]
async fn accepted_round_trip_reserves_and_confirms() {
    let (_dir, store) = fresh_store();
    let (_core, addr) = start_broker(store.clone(), Duration::from_secs(5)).await;
    let mut link = connect(addr).await;

    link.send(sol("11111111", 3, 1)).await.unwrap();
    let (transaction_id, data) = match recv(&mut link).await {
        Message::Prop { transaction_id, data } => (transaction_id, data),
        other => panic!("expected PROP, got {:?}", other),
    };
    assert_eq!(transaction_id, "11111111");
    assert_eq!((data.salones_propuestos, data.laboratorios_propuestos, data.aulas_moviles), (3, 1, 0));

    link.send(ack("11111111", AckDecision::Accept, None)).await.unwrap();
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Accepted);
    assert_eq!(res.proposal(), Some(data));

    assert_eq!(store.busy_room_count().unwrap(), 4);
    assert_eq!(store.metric_count(metric_kind::SOL_PROP).unwrap(), 1);
    assert_eq!(store.metric_count(metric_kind::PROP_RES).unwrap(), 1);
}

#[tokio::test]
async fn rejected_ack_cancels_and_frees_the_rooms() {
    let (_dir, store) = fresh_store();
    let (_core, addr) = start_broker(store.clone(), Duration::from_secs(5)).await;
    let mut link = connect(addr).await;

    link.send(sol("22222222", 2, 0)).await.unwrap();
    let Message::Prop { .. } = recv(&mut link).await else { panic!("expected PROP") };

    link.send(ack("22222222", AckDecision::Reject, Some("sin presupuesto"))).await.unwrap();
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Canceled);
    assert_eq!(res.reason.as_deref(), Some("sin presupuesto"));

    assert_eq!(store.busy_room_count().unwrap(), 0);
}

#[tokio::test]
async fn missing_ack_times_out_into_a_canceled_res() {
    let (_dir, store) = fresh_store();
    let (_core, addr) = start_broker(store.clone(), Duration::from_millis(200)).await;
    let mut link = connect(addr).await;

    link.send(sol("33333333", 1, 1)).await.unwrap();
    let Message::Prop { .. } = recv(&mut link).await else { panic!("expected PROP") };
    assert_eq!(store.busy_room_count().unwrap(), 2);

    // Never ACK: the monitor must roll the reservation back.
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Canceled);
    assert_eq!(res.reason.as_deref(), Some("timeout"));

    assert_eq!(store.busy_room_count().unwrap(), 0);
    assert_eq!(store.adapted_room_count().unwrap(), 0);

    // A late ACK for the swept transaction is silently dropped.
    link.send(ack("33333333", AckDecision::Accept, None)).await.unwrap();
    link.send(sol("33334444", 1, 0)).await.unwrap();
    let Message::Prop { transaction_id, .. } = recv(&mut link).await else { panic!("expected PROP") };
    assert_eq!(transaction_id, "33334444");
}

#[tokio::test]
async fn exhausted_inventory_is_denied_with_a_classroom_reason() {
    let (_dir, store) = fresh_store();
    store.ensure_faculty(1, "Ingenieria", "2025-2").unwrap();
    store.ensure_program(1, 1, "IngSw", "2025-2").unwrap();
    let everything = store.allocate_rooms(380, 60, 1, 1).unwrap();
    store.confirm_reservation(everything).unwrap();

    let (_core, addr) = start_broker(store.clone(), Duration::from_secs(5)).await;
    let mut link = connect(addr).await;

    link.send(sol("44444444", 1, 0)).await.unwrap();
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Denied);
    assert!(res.reason.unwrap_or_default().contains("aulas"));
}

#[tokio::test]
async fn depleted_labs_are_substituted_with_adapted_classrooms() {
    let (_dir, store) = fresh_store();
    store.ensure_faculty(1, "Ingenieria", "2025-2").unwrap();
    store.ensure_program(1, 1, "IngSw", "2025-2").unwrap();
    let labs = store.allocate_rooms(0, 60, 1, 1).unwrap();
    store.confirm_reservation(labs).unwrap();

    let (_core, addr) = start_broker(store.clone(), Duration::from_secs(5)).await;
    let mut link = connect(addr).await;

    link.send(sol("55555555", 2, 2)).await.unwrap();
    let Message::Prop { data, .. } = recv(&mut link).await else { panic!("expected PROP") };
    assert_eq!((data.salones_propuestos, data.laboratorios_propuestos, data.aulas_moviles), (2, 0, 2));

    link.send(ack("55555555", AckDecision::Accept, None)).await.unwrap();
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Accepted);

    assert_eq!(store.adapted_room_count().unwrap(), 2);
    assert_eq!(store.busy_room_count().unwrap(), 64);
}

#[tokio::test]
async fn concurrent_requests_drain_the_inventory_fairly() {
    let (_dir, store) = fresh_store();
    store.ensure_faculty(1, "Ingenieria", "2025-2").unwrap();
    store.ensure_program(1, 1, "IngSw", "2025-2").unwrap();

    // Leave exactly 50 free classrooms.
    let bulk = store.allocate_rooms(330, 60, 1, 1).unwrap();
    store.confirm_reservation(bulk).unwrap();

    let (_core, addr) = start_broker(store.clone(), Duration::from_secs(5)).await;

    let mut tasks = Vec::new();
    for i in 0..50u32 {
        tasks.push(tokio::spawn(async move {
            let mut link = connect(addr).await;
            let tx = format!("{:08x}", i);
            link.send(sol(&tx, 1, 0)).await.unwrap();
            let Message::Prop { .. } = recv(&mut link).await else { panic!("expected PROP") };
            link.send(ack(&tx, AckDecision::Accept, None)).await.unwrap();
            let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
            res.status
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), ResStatus::Accepted);
    }
    assert_eq!(store.busy_room_count().unwrap(), 440);

    // The 51st request finds nothing left.
    let mut link = connect(addr).await;
    link.send(sol("99999999", 1, 0)).await.unwrap();
    let Message::Res(res) = recv(&mut link).await else { panic!("expected RES") };
    assert_eq!(res.status, ResStatus::Denied);
}

#[tokio::test]
async fn activation_is_idempotent_and_deactivation_releases_the_port() {
    let (_dir, store) = fresh_store();
    let (mut core, addr) = start_broker(store, Duration::from_secs(5)).await;

    assert_eq!(core.activate().await.unwrap(), addr);
    assert!(core.is_active());

    core.deactivate();
    assert!(!core.is_active());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TcpStream::connect(addr).await.is_err(), "router endpoint must be released");

    // A former backup can bind again later.
    let addr2 = core.activate().await.unwrap();
    assert!(TcpStream::connect(addr2).await.is_ok());
    core.deactivate();
}
