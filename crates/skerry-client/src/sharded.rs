//! Sharded client: picks the responsible node by consistent hashing, tries
//! it directly, and falls back to cluster-aware leader chasing on redirects.

use reqwest::{Method, StatusCode};

use skerry_ring::Ring;
use skerry_types::SkerryError;

use crate::http::{escape_key, is_redirect, normalize_addr, ClusterClient};

pub struct ShardedClient {
    cluster: ClusterClient,
    ring: Ring,
}

impl ShardedClient {
    /// `replicas` is the virtual-point count per node (non-positive picks the
    /// ring default).
    pub fn new<S: AsRef<str>>(nodes: &[S], replicas: usize) -> Self {
        let cluster = ClusterClient::new(nodes);
        let ring = Ring::new(replicas);
        for node in nodes {
            ring.add_node(&normalize_addr(node.as_ref()));
        }
        ShardedClient { cluster, ring }
    }

    fn node_for(&self, key: &str) -> Result<String, SkerryError> {
        self.ring
            .get_node(key)
            .ok_or_else(|| SkerryError::Transport("no nodes in ring".into()))
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), SkerryError> {
        let node = self.node_for(key)?;
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self
            .cluster
            .do_request_to(&node, Method::PUT, &path, Some(value.to_vec()))
            .await?;

        // A follower answered: let the cluster client chase the leader.
        if is_redirect(resp.status()) {
            let resp =
                self.cluster.do_request(Method::PUT, &path, Some(value.to_vec())).await?;
            return check_mutation(resp, "put").await;
        }
        check_mutation(resp, "put").await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, SkerryError> {
        let node = self.node_for(key)?;
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self.cluster.do_request_to(&node, Method::GET, &path, None).await?;

        let resp = if is_redirect(resp.status()) {
            self.cluster.do_request(Method::GET, &path, None).await?
        } else {
            resp
        };

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SkerryError::NotFound);
        }
        if resp.status().is_success() {
            return resp
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| SkerryError::Transport(e.to_string()));
        }
        Err(failure(resp, "get").await)
    }

    pub async fn delete(&self, key: &str) -> Result<(), SkerryError> {
        let node = self.node_for(key)?;
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self.cluster.do_request_to(&node, Method::DELETE, &path, None).await?;

        let resp = if is_redirect(resp.status()) {
            self.cluster.do_request(Method::DELETE, &path, None).await?
        } else {
            resp
        };

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SkerryError::NotFound);
        }
        check_mutation(resp, "delete").await
    }

    /// The node the ring holds responsible for `key`.
    pub fn responsible_node(&self, key: &str) -> Option<String> {
        self.ring.get_node(key)
    }
}

async fn check_mutation(resp: reqwest::Response, op: &str) -> Result<(), SkerryError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(failure(resp, op).await)
    }
}

async fn failure(resp: reqwest::Response, op: &str) -> SkerryError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    SkerryError::Internal(format!("{op} failed: status={status} body={}", body.trim_end()))
}
