//! End-to-end tests: real HTTP servers over real consensus replicas on
//! loopback listeners, driven through the cluster-aware and sharded clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

use skerry_client::{ClusterClient, ShardedClient};
use skerry_consensus::{raft_service, RaftConfig, RaftReplica};
use skerry_server::{router, AppState, LEADER_HEADER};
use skerry_storage::mem::{MemEngine, MemLogStore};
use skerry_storage::Engine;
use skerry_types::SkerryError;

fn fast_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval_ms: 50,
        election_timeout_min_ms: 150,
        election_timeout_max_ms: 300,
        snapshot_threshold: 8192,
        apply_timeout_ms: 5000,
    }
}

struct TestNode {
    http_addr: String,
    raft_addr: String,
    engine: Arc<MemEngine>,
    replica: Option<Arc<RaftReplica<MemEngine, MemLogStore>>>,
}

/// Boot a node: engine, optional replica with its cluster gRPC listener, and
/// the HTTP surface.
async fn spawn_node(node_id: &str, replicated: bool, joining: bool) -> TestNode {
    let engine = Arc::new(MemEngine::new());

    let (replica, raft_addr) = if replicated {
        let raft_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let raft_addr = raft_listener.local_addr().unwrap().to_string();
        let replica = RaftReplica::start(
            node_id.to_string(),
            raft_addr.clone(),
            fast_config(),
            engine.clone(),
            Arc::new(MemLogStore::new()),
            joining,
        )
        .await
        .unwrap();
        let service = raft_service(replica.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(raft_listener))
                .await
                .ok();
        });
        (Some(replica), raft_addr)
    } else {
        (None, String::new())
    };

    let state = Arc::new(AppState {
        node_id: node_id.to_string(),
        engine: engine.clone(),
        replica: replica.clone(),
        shards: None,
    });
    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = format!("http://{}", http_listener.local_addr().unwrap());
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.ok();
    });

    TestNode { http_addr, raft_addr, engine, replica }
}

fn raw_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn single_node_bootstrap_round_trip() {
    let node = spawn_node("n1", true, false).await;
    let client = ClusterClient::new(&[node.http_addr.as_str()]);

    client.put("foo", b"bar").await.unwrap();
    assert_eq!(client.get("foo").await.unwrap(), b"bar");

    client.delete("foo").await.unwrap();
    assert!(matches!(client.get("foo").await, Err(SkerryError::NotFound)));

    // Deleting again surfaces the engine's verdict through consensus.
    assert!(matches!(client.delete("foo").await, Err(SkerryError::NotFound)));

    let status = client.status().await.unwrap();
    assert!(status.contains("\"node_id\":\"n1\""));
    assert!(status.contains("\"is_leader\":true"));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_key_is_rejected() {
    let node = spawn_node("n1", true, false).await;
    let resp = raw_client()
        .put(format!("{}/v1/keys/", node.http_addr))
        .body("x".to_string())
        .send()
        .await
        .unwrap();
    // No key segment: the route does not match.
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_redirects_with_leader_header() {
    let n1 = spawn_node("n1", true, false).await;
    let n2 = spawn_node("n2", true, true).await;

    // Join n2 through the leader's HTTP surface, as the joining node would.
    let resp = raw_client()
        .post(format!("{}/v1/join", n1.http_addr))
        .json(&serde_json::json!({"node_id": "n2", "raft_addr": n2.raft_addr}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);

    // Wait for the follower to learn the leader via heartbeats.
    let mut learned = false;
    for _ in 0..100 {
        let status = n2.replica.as_ref().unwrap().status().await;
        if status.leader_addr == n1.raft_addr {
            learned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(learned, "follower should learn the leader address");

    // Mutations on the follower redirect and name the leader.
    let resp = raw_client()
        .put(format!("{}/v1/keys/foo", n2.http_addr))
        .body("bar".to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        resp.headers().get(LEADER_HEADER).unwrap().to_str().unwrap(),
        n1.raft_addr
    );

    // Writing through the leader replicates to the follower's engine.
    let client = ClusterClient::new(&[n1.http_addr.as_str()]);
    client.put("foo", b"bar").await.unwrap();

    let mut replicated = false;
    for _ in 0..100 {
        if n2.engine.get(b"foo").await.ok().as_deref() == Some(b"bar") {
            replicated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(replicated, "follower should serve the replicated value");
    assert_eq!(client.get("foo").await.unwrap(), b"bar");
}

#[tokio::test(flavor = "multi_thread")]
async fn join_on_follower_redirects() {
    let n1 = spawn_node("n1", true, false).await;
    let n2 = spawn_node("n2", true, true).await;

    raw_client()
        .post(format!("{}/v1/join", n1.http_addr))
        .json(&serde_json::json!({"node_id": "n2", "raft_addr": n2.raft_addr}))
        .send()
        .await
        .unwrap();

    for _ in 0..100 {
        if !n2.replica.as_ref().unwrap().status().await.leader_addr.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let resp = raw_client()
        .post(format!("{}/v1/join", n2.http_addr))
        .json(&serde_json::json!({"node_id": "n3", "raft_addr": "127.0.0.1:1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test(flavor = "multi_thread")]
async fn join_validation() {
    let plain = spawn_node("n1", false, false).await;
    let resp = raw_client()
        .post(format!("{}/v1/join", plain.http_addr))
        .json(&serde_json::json!({"node_id": "x", "raft_addr": "y"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let replicated = spawn_node("n2", true, false).await;
    let resp = raw_client()
        .post(format!("{}/v1/join", replicated.http_addr))
        .json(&serde_json::json!({"node_id": "", "raft_addr": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn replication_disabled_writes_through() {
    let node = spawn_node("n1", false, false).await;
    let client = ClusterClient::new(&[node.http_addr.as_str()]);

    client.put("k", b"v").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), b"v");
    assert_eq!(node.engine.get(b"k").await.unwrap(), b"v");

    let status = client.status().await.unwrap();
    assert!(status.contains("\"is_leader\":false"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sharded_routing_pins_keys_to_ring_owners() {
    let nodes =
        vec![spawn_node("n1", false, false).await, spawn_node("n2", false, false).await, spawn_node("n3", false, false).await];
    let addrs: Vec<String> = nodes.iter().map(|n| n.http_addr.clone()).collect();
    let client = ShardedClient::new(&addrs, 150);

    for i in 0..100 {
        let key = format!("k-{i}");
        client.put(&key, format!("v-{i}").as_bytes()).await.unwrap();
    }

    let raw = raw_client();
    for i in 0..100 {
        let key = format!("k-{i}");
        let owner = client.responsible_node(&key).unwrap();

        // The owner serves the key directly.
        let resp =
            raw.get(format!("{owner}/v1/keys/{key}")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(resp.bytes().await.unwrap(), format!("v-{i}").as_bytes());

        // Nobody else has it.
        for other in addrs.iter().filter(|a| **a != owner) {
            let resp =
                raw.get(format!("{other}/v1/keys/{key}")).send().await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        }

        // And the sharded client reads it back identically.
        assert_eq!(client.get(&key).await.unwrap(), format!("v-{i}").as_bytes());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn shard_admin_disabled_without_shard_state() {
    let node = spawn_node("n1", false, false).await;
    let resp =
        raw_client().get(format!("{}/v1/shards", node.http_addr)).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}
