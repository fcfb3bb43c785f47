//! Coordinator tests against in-process partition replicas over gRPC
//! loopback transports.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

use skerry_balancer::keys::PREPARE_COMMIT_DECISION_KEY;
use skerry_balancer::Balancer;
use skerry_partition::{partition_service, Partition, QueuedMsg};
use skerry_proto::v1::SetRequest;
use skerry_storage::mem::MemEngine;
use skerry_storage::Engine;
use skerry_types::SkerryError;

struct TestPartition {
    partition: Arc<Partition<MemEngine>>,
    addr: String,
    server: JoinHandle<()>,
}

async fn spawn_partition() -> TestPartition {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let partition = Arc::new(Partition::new(Arc::new(MemEngine::new())));
    let service = partition_service(partition.clone());
    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .ok();
    });

    TestPartition { partition, addr, server }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_phase_commit_happy_path() {
    let p1 = spawn_partition().await;
    let p2 = spawn_partition().await;

    let engine = Arc::new(MemEngine::new());
    let balancer = Balancer::new(engine.clone(), 1).await.unwrap();
    balancer.register_partition(&p1.addr).await.unwrap();
    balancer.register_partition(&p2.addr).await.unwrap();

    // Both replicas cover the whole domain; the write commits on both.
    balancer.set(b"domain-key", b"value").await.unwrap();
    assert_eq!(p1.partition.timestamp().await, 1);
    assert_eq!(p2.partition.timestamp().await, 1);

    let outcome = balancer.get(b"domain-key").await.unwrap();
    let stored = outcome.stored.expect("value present");
    assert_eq!(stored.lamport, 1);
    assert_eq!(stored.value, b"value");
    assert!(outcome.offline.is_empty());

    // Reads consume a tick too, so the delete carries lamport 3.
    assert_eq!(balancer.next_lamport_for_key(b"domain-key").await, 3);
    balancer.delete(b"domain-key").await.unwrap();

    let outcome = balancer.get(b"domain-key").await.unwrap();
    assert!(outcome.stored.is_none());
    assert_eq!(p1.partition.timestamp().await, 4);
    assert_eq!(p2.partition.timestamp().await, 4);

    // The decision record never outlives the protocol.
    assert!(matches!(
        engine.get(PREPARE_COMMIT_DECISION_KEY).await,
        Err(SkerryError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_replica_aborts_the_commit() {
    let p1 = spawn_partition().await;
    let p2 = spawn_partition().await;

    let engine = Arc::new(MemEngine::new());
    let balancer = Balancer::new(engine.clone(), 1).await.unwrap();
    balancer.register_partition(&p1.addr).await.unwrap();
    balancer.register_partition(&p2.addr).await.unwrap();

    // Take the second replica down; prepare must fail and the outcome abort.
    p2.server.abort();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = balancer.set(b"k", b"v").await;
    assert!(matches!(err, Err(SkerryError::PrepareAborted)));

    // The aborted round did not advance the range clock or touch the
    // surviving replica.
    assert_eq!(balancer.next_lamport_for_key(b"k").await, 1);
    assert_eq!(p1.partition.timestamp().await, 0);

    // The decision record was written and cleared.
    assert!(matches!(
        engine.get(PREPARE_COMMIT_DECISION_KEY).await,
        Err(SkerryError::NotFound)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_replays_a_persisted_commit_decision() {
    let p1 = spawn_partition().await;

    let engine = Arc::new(MemEngine::new());
    let balancer = Balancer::new(engine.clone(), 0).await.unwrap();
    balancer.register_partition(&p1.addr).await.unwrap();

    // Simulate a crash after the decision was persisted but before the
    // broadcast: the replica still holds its locked message.
    p1.partition
        .prepare(QueuedMsg::Set(SetRequest {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lamport: 1,
            client_id: 0,
        }))
        .await
        .unwrap();
    engine.set(PREPARE_COMMIT_DECISION_KEY, b"commit").await.unwrap();

    balancer.recover_pending_decision().await.unwrap();

    // The locked message was committed and the record cleared.
    assert_eq!(p1.partition.timestamp().await, 1);
    assert!(matches!(
        engine.get(PREPARE_COMMIT_DECISION_KEY).await,
        Err(SkerryError::NotFound)
    ));
}

#[tokio::test]
async fn coverage_survives_coordinator_restart() {
    let engine = Arc::new(MemEngine::new());
    {
        let balancer = Balancer::new(engine.clone(), 4).await.unwrap();
        assert_eq!(balancer.coverage().await.ticks().len(), 5);
    }
    // A different goal on reopen does not reseed an existing coverage.
    let balancer = Balancer::new(engine, 0).await.unwrap();
    assert_eq!(balancer.coverage().await.ticks().len(), 5);
}

#[tokio::test]
async fn client_clocks_are_strictly_sequenced() {
    let engine = Arc::new(MemEngine::new());
    let balancer = Balancer::new(engine, 0).await.unwrap();

    let c1 = balancer.next_client_id().await;
    let c2 = balancer.next_client_id().await;
    assert_eq!(c1, 1);
    assert_eq!(c2, 2);

    assert!(balancer.validate_client(c1, 1).await.is_ok());
    assert!(matches!(
        balancer.validate_client(c1, 0).await,
        Err(SkerryError::StaleTimestamp { .. })
    ));
    assert!(matches!(
        balancer.validate_client(c1, 2).await,
        Err(SkerryError::TimestampNotNext { .. })
    ));

    // The clock advances even when the request failed.
    balancer.increment_client(c1).await;
    assert_eq!(balancer.client_clock(c1).await, 1);
    assert!(balancer.validate_client(c1, 2).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_prefer_the_freshest_replica_and_drop_dead_ones() {
    let p1 = spawn_partition().await;
    let p2 = spawn_partition().await;

    let engine = Arc::new(MemEngine::new());
    let balancer = Balancer::new(engine, 1).await.unwrap();
    balancer.register_partition(&p1.addr).await.unwrap();
    balancer.register_partition(&p2.addr).await.unwrap();

    balancer.set(b"k", b"v1").await.unwrap();

    p2.server.abort();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let outcome = balancer.get(b"k").await.unwrap();
    assert_eq!(outcome.stored.unwrap().value, b"v1");
    assert_eq!(outcome.offline, vec![p2.addr.clone()]);

    // The dead replica is gone from the view; the next read stops noticing it.
    let outcome = balancer.get(b"k").await.unwrap();
    assert!(outcome.offline.is_empty());
}
