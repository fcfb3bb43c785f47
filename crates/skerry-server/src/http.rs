//! The HTTP/JSON key API: `PUT`/`GET`/`DELETE /v1/keys/{k}` with leader
//! redirection, join and status endpoints, and the shard admin surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tonic_reflection::server::Builder as ReflectionBuilder;

use skerry_consensus::{raft_service, RaftReplica};
use skerry_storage::{Engine, LogStore};
use skerry_types::{Command, SkerryError};

use crate::state::AppState;

/// Header naming the current leader's consensus address on redirects.
pub const LEADER_HEADER: &str = "x-consensus-leader";

pub fn router<E: Engine, L: LogStore>(state: Arc<AppState<E, L>>) -> Router {
    Router::new()
        .route(
            "/v1/keys/:key",
            put(put_key::<E, L>).get(get_key::<E, L>).delete(delete_key::<E, L>),
        )
        .route("/v1/join", post(join::<E, L>))
        .route("/v1/status", get(status::<E, L>))
        .route("/v1/shards", get(shards_list::<E, L>))
        .route("/v1/shards/assign", post(shards_assign::<E, L>))
        .route("/v1/shards/status", get(shards_status::<E, L>))
        .layer(Extension(state))
}

/// Serve the HTTP API until the listener fails.
pub async fn serve_http<E: Engine, L: LogStore>(
    addr: SocketAddr,
    state: Arc<AppState<E, L>>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http server listening");
    axum::serve(listener, router(state)).await.map_err(Into::into)
}

/// Serve the consensus gRPC surface (with reflection) on the cluster address.
pub async fn serve_cluster<E: Engine, L: LogStore>(
    addr: SocketAddr,
    replica: Arc<RaftReplica<E, L>>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(skerry_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .expect("failed to build reflection service");
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(raft_service(replica))
        .add_service(reflection)
        .serve(addr)
        .await
        .map_err(Into::into)
}

fn redirect(leader_addr: &str) -> Response {
    let mut headers = HeaderMap::new();
    if !leader_addr.is_empty() {
        if let Ok(value) = leader_addr.parse() {
            headers.insert(HeaderName::from_static(LEADER_HEADER), value);
        }
    }
    (StatusCode::TEMPORARY_REDIRECT, headers, "not leader\n").into_response()
}

async fn propose_or_redirect<E: Engine, L: LogStore>(
    state: &AppState<E, L>,
    cmd: Command,
) -> Response {
    let replica = state.replica.as_ref().expect("caller checked replication");
    let status = replica.status().await;
    if !status.is_leader {
        return redirect(&status.leader_addr);
    }
    match replica.propose(cmd).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(SkerryError::NotFound) => {
            (StatusCode::NOT_FOUND, "not found\n").into_response()
        }
        Err(SkerryError::NotLeader { leader }) => redirect(&leader.unwrap_or_default()),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("consensus apply failed: {err}\n"),
        )
            .into_response(),
    }
}

async fn put_key<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Response {
    if key.is_empty() {
        return (StatusCode::BAD_REQUEST, "key required\n").into_response();
    }
    if state.replica.is_some() {
        return propose_or_redirect(
            state.as_ref(),
            Command::Set { key, value: body.to_vec() },
        )
        .await;
    }
    match state.engine.set(key.as_bytes(), &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("set failed: {err}\n"))
                .into_response()
        }
    }
}

/// Reads are always served from the local engine; a follower may lag the
/// leader until the apply pipeline catches up.
async fn get_key<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
    Path(key): Path<String>,
) -> Response {
    match state.engine.get(key.as_bytes()).await {
        Ok(value) => (StatusCode::OK, value).into_response(),
        Err(SkerryError::NotFound) => {
            (StatusCode::NOT_FOUND, "not found\n").into_response()
        }
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("get failed: {err}\n"))
                .into_response()
        }
    }
}

async fn delete_key<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
    Path(key): Path<String>,
) -> Response {
    if state.replica.is_some() {
        return propose_or_redirect(state.as_ref(), Command::Delete { key }).await;
    }
    match state.engine.delete(key.as_bytes()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(SkerryError::NotFound) => {
            (StatusCode::NOT_FOUND, "not found\n").into_response()
        }
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("delete failed: {err}\n"))
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct JoinRequest {
    node_id: String,
    raft_addr: String,
}

async fn join<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
    Json(req): Json<JoinRequest>,
) -> Response {
    let Some(replica) = state.replica.as_ref() else {
        return (StatusCode::BAD_REQUEST, "raft not enabled\n").into_response();
    };
    let status = replica.status().await;
    if !status.is_leader {
        return redirect(&status.leader_addr);
    }
    if req.node_id.is_empty() || req.raft_addr.is_empty() {
        return (StatusCode::BAD_REQUEST, "node_id and raft_addr required\n")
            .into_response();
    }
    match replica.add_voter(req.node_id.clone(), req.raft_addr.clone()).await {
        Ok(()) => {
            tracing::info!(node_id = %req.node_id, raft_addr = %req.raft_addr, "voter added");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(SkerryError::NotLeader { leader }) => redirect(&leader.unwrap_or_default()),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("add voter failed: {err}\n"),
        )
            .into_response(),
    }
}

#[derive(Serialize)]
struct StatusResponse {
    node_id: String,
    status: &'static str,
    is_leader: bool,
    leader_addr: String,
}

async fn status<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
) -> Json<StatusResponse> {
    let (is_leader, leader_addr) = match state.replica.as_ref() {
        Some(replica) => {
            let status = replica.status().await;
            (status.is_leader, status.leader_addr)
        }
        None => (false, String::new()),
    };
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        status: "ok",
        is_leader,
        leader_addr,
    })
}

async fn shards_list<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
) -> Response {
    match state.shards.as_ref() {
        None => (StatusCode::BAD_REQUEST, "shard manager not enabled\n").into_response(),
        Some(shards) => Json(shards.manager.list()).into_response(),
    }
}

#[derive(Deserialize)]
struct AssignRequest {
    shard_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    raft_addr: Option<String>,
}

async fn shards_assign<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
    Json(req): Json<AssignRequest>,
) -> Response {
    let Some(shards) = state.shards.as_ref() else {
        return (StatusCode::BAD_REQUEST, "shard manager not enabled\n").into_response();
    };
    if req.shard_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "shard_id required\n").into_response();
    }
    shards.manager.add_shard(&req.shard_id);
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Serialize)]
struct ShardStatus {
    shard_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    node_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    raft_addr: String,
    is_leader: bool,
}

async fn shards_status<E: Engine, L: LogStore>(
    Extension(state): Extension<Arc<AppState<E, L>>>,
) -> Json<Vec<ShardStatus>> {
    let mut out = Vec::new();
    if let Some(shards) = state.shards.as_ref() {
        let replicas = shards.replicas.read().await;
        for (shard_id, shard) in replicas.iter() {
            out.push(ShardStatus {
                shard_id: shard_id.clone(),
                node_id: shard.node_id.clone(),
                raft_addr: shard.raft_addr.clone(),
                is_leader: shard.replica.is_leader().await,
            });
        }
    }
    out.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
    Json(out)
}
