use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use campus_allocator::api::codec::RequestCodec;
use campus_allocator::api::protocol::{Message, ProgramRequest, ResStatus, Resolution};
use campus_allocator::broker::core::BrokerCore;
use campus_allocator::config::{BrokerSettings, GATEWAY_GC_AGE, GatewaySettings, liveness_window};
use campus_allocator::domain::datastore::{Datastore, metric_kind};
use campus_allocator::gateway::async_gateway::Gateway;
use campus_allocator::gateway::sync_gateway::SyncGateway;
use campus_allocator::gateway::{BrokerEndpoint, EndpointSelector};
use campus_allocator::heartbeat::{self, HeartbeatPublisher, PeerLiveness};

fn fresh_store() -> (tempfile::TempDir, Datastore) {
    let dir = tempfile::tempdir().unwrap();
    let store = Datastore::open(dir.path().join("classroom.db"), "2025-2").unwrap();
    store.seed_inventory().unwrap();
    store.ensure_faculty(1, "Ingenieria", "2025-2").unwrap();
    (dir, store)
}

fn settings(listen: SocketAddr) -> GatewaySettings {
    GatewaySettings { faculty_id: 1, faculty_name: "Ingenieria".into(), semester: "2025-2".into(), listen, gc_age: GATEWAY_GC_AGE }
}

/// Broker replica plus a live heartbeat publisher, and a selector whose
/// primary observer follows that publisher.
async fn live_broker(store: &Datastore, shutdown: &CancellationToken) -> (BrokerCore, SocketAddr, EndpointSelector) {
    let mut core = BrokerCore::new(BrokerSettings::new("127.0.0.1:0".parse().unwrap()), store.clone());
    let broker_addr = core.activate().await.unwrap();

    let publisher = HeartbeatPublisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let hb_addr = publisher.local_addr().unwrap();
    tokio::spawn(publisher.run(shutdown.child_token()));

    let primary_liveness = PeerLiveness::new(liveness_window());
    tokio::spawn(heartbeat::run_observer(hb_addr.to_string(), primary_liveness.clone(), shutdown.child_token()));

    let selector = EndpointSelector::new(
        BrokerEndpoint::new(broker_addr.to_string(), primary_liveness),
        BrokerEndpoint::new("127.0.0.1:1", PeerLiveness::new(liveness_window())),
    );
    (core, broker_addr, selector)
}

async fn request(gateway: SocketAddr, programa: &str, salones: u32, laboratorios: u32) -> Resolution {
    let stream = TcpStream::connect(gateway).await.unwrap();
    let mut framed = Framed::new(stream, RequestCodec::new());
    framed.send(ProgramRequest { programa: programa.into(), salones, laboratorios }).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .expect("gateway stayed silent")
        .expect("gateway closed the connection")
        .expect("bad reply frame");
    match reply {
        Message::Res(res) => res,
        other => panic!("expected a final RES, got {:?}", other),
    }
}

#[tokio::test]
async fn program_request_travels_the_whole_chain() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();
    let (_core, _broker_addr, selector) = live_broker(&store, &shutdown).await;

    let gateway = Gateway::bind(settings("127.0.0.1:0".parse().unwrap()), store.clone(), selector).await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run(shutdown.child_token()));

    // Let the observer mark the publisher and the gateway pick the link.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let res = request(gateway_addr, "IngSw", 3, 1).await;
    assert_eq!(res.status, ResStatus::Accepted);
    let proposal = res.proposal().expect("accepted RES carries the proposal");
    assert_eq!((proposal.salones_propuestos, proposal.laboratorios_propuestos, proposal.aulas_moviles), (3, 1, 0));

    assert_eq!(store.busy_room_count().unwrap(), 4);
    for kind in [
        metric_kind::SOL_PROP,
        metric_kind::PROP_RES,
        metric_kind::SOL_PROP_ROUNDTRIP,
        metric_kind::ACK_RES_ROUNDTRIP,
        metric_kind::FACULTY_PROCESSING_TOTAL_MS,
        metric_kind::PROGRAM_RESPONSE_TOTAL_MS,
        metric_kind::REQUEST_OUTCOME,
    ] {
        assert!(store.metric_count(kind).unwrap() >= 1, "metric '{}' not recorded", kind);
    }

    shutdown.cancel();
}

#[tokio::test]
async fn without_a_live_broker_the_gateway_answers_no_server() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();

    // Both observers silent: no endpoint is ever selected.
    let selector = EndpointSelector::new(
        BrokerEndpoint::new("127.0.0.1:1", PeerLiveness::new(liveness_window())),
        BrokerEndpoint::new("127.0.0.1:2", PeerLiveness::new(liveness_window())),
    );
    let gateway = Gateway::bind(settings("127.0.0.1:0".parse().unwrap()), store.clone(), selector).await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run(shutdown.child_token()));

    let res = request(gateway_addr, "IngSw", 1, 0).await;
    assert_eq!(res.status, ResStatus::ErrorFacultyNoServer);
    assert_eq!(res.transaction_id.len(), 8);

    // The failure path still records outcome metrics.
    assert!(store.metric_count(metric_kind::REQUEST_OUTCOME).unwrap() >= 1);
    assert!(store.metric_count(metric_kind::FACULTY_PROCESSING_TOTAL_MS).unwrap() >= 1);

    shutdown.cancel();
}

#[tokio::test]
async fn lbb_gateway_runs_the_same_protocol_per_connection() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();
    let (_core, _broker_addr, selector) = live_broker(&store, &shutdown).await;

    let gateway = SyncGateway::bind(settings("127.0.0.1:0".parse().unwrap()), store.clone(), selector).await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run(shutdown.child_token()));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let res = request(gateway_addr, "Medicina", 2, 1).await;
    assert_eq!(res.status, ResStatus::Accepted);
    let proposal = res.proposal().unwrap();
    assert_eq!((proposal.salones_propuestos, proposal.laboratorios_propuestos, proposal.aulas_moviles), (2, 1, 0));
    assert_eq!(store.busy_room_count().unwrap(), 3);

    shutdown.cancel();
}

#[tokio::test]
async fn garbage_requests_get_a_decode_error_res() {
    let (_dir, store) = fresh_store();
    let shutdown = CancellationToken::new();

    let selector = EndpointSelector::new(
        BrokerEndpoint::new("127.0.0.1:1", PeerLiveness::new(liveness_window())),
        BrokerEndpoint::new("127.0.0.1:2", PeerLiveness::new(liveness_window())),
    );
    let gateway = Gateway::bind(settings("127.0.0.1:0".parse().unwrap()), store, selector).await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run(shutdown.child_token()));

    let stream = TcpStream::connect(gateway_addr).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::from_static(b"{ this is not json")).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), framed.next()).await.unwrap().unwrap().unwrap();
    let reply: Message = serde_json::from_slice(&frame).unwrap();
    let res = match reply {
        Message::Res(res) => res,
        other => panic!("expected a RES, got {:?}", other),
    };
    assert_eq!(res.status, ResStatus::ErrorFacultyDecodeError);

    shutdown.cancel();
}
