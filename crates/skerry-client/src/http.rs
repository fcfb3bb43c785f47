//! Cluster-aware HTTP client: tries members in order, follows leader
//! redirects via the `x-consensus-leader` header, and caches the discovered
//! leader for subsequent requests.

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Method, StatusCode};

use skerry_types::SkerryError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);
const DEFAULT_RETRY_WAIT: Duration = Duration::from_millis(300);

/// Header carrying the leader's consensus address on 307 responses.
pub const LEADER_HEADER: &str = "x-consensus-leader";

pub struct ClusterClient {
    addrs: Vec<String>,
    http: reqwest::Client,
    /// Cached leader base URL, e.g. `http://127.0.0.1:8080`.
    leader: RwLock<String>,
    try_limit: usize,
    retry_wait: Duration,
}

impl ClusterClient {
    /// Build a client over candidate node addresses. Addresses are
    /// scheme-prefixed, trailing-slash-trimmed and deduplicated, preserving
    /// order.
    pub fn new<S: AsRef<str>>(addrs: &[S]) -> Self {
        let mut unique = Vec::new();
        for addr in addrs {
            let addr = addr.as_ref().trim();
            if addr.is_empty() {
                continue;
            }
            let normalized = normalize_addr(addr);
            if !unique.contains(&normalized) {
                unique.push(normalized);
            }
        }
        let try_limit = unique.len().max(1);
        ClusterClient {
            addrs: unique,
            http: reqwest::Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("http client construction"),
            leader: RwLock::new(String::new()),
            try_limit,
            retry_wait: DEFAULT_RETRY_WAIT,
        }
    }

    pub fn cached_leader(&self) -> String {
        self.leader.read().expect("leader lock poisoned").clone()
    }

    fn set_leader(&self, leader: &str) {
        let mut cached = self.leader.write().expect("leader lock poisoned");
        *cached = leader.trim_end_matches('/').to_string();
    }

    /// Try the request against the cluster, chasing leader redirects. The
    /// returned response may carry any status; callers inspect it.
    pub async fn do_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, SkerryError> {
        let path = ensure_leading_slash(path);

        // A cached leader gets the first attempt.
        let leader = self.cached_leader();
        if !leader.is_empty() {
            if let Ok(resp) = self.do_once(&leader, method.clone(), &path, body.clone()).await
            {
                if !is_redirect(resp.status()) {
                    return Ok(resp);
                }
                if let Some(new_leader) = leader_from_headers(&resp) {
                    let new_leader = normalize_leader_addr(&new_leader);
                    self.set_leader(&new_leader);
                    return self.do_once(&new_leader, method, &path, body).await;
                }
            }
            // Stale cache or unreachable leader: walk the address list.
        }

        for (tries, base) in self.addrs.iter().enumerate() {
            if tries >= self.try_limit {
                break;
            }
            let resp = match self.do_once(base, method.clone(), &path, body.clone()).await {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::debug!(%base, %err, "node attempt failed");
                    tokio::time::sleep(self.retry_wait).await;
                    continue;
                }
            };
            if is_redirect(resp.status()) {
                match leader_from_headers(&resp) {
                    // No hint: hand the redirect to the caller as-is.
                    None => return Ok(resp),
                    Some(new_leader) => {
                        let new_leader = normalize_leader_addr(&new_leader);
                        self.set_leader(&new_leader);
                        return self.do_once(&new_leader, method, &path, body).await;
                    }
                }
            }
            return Ok(resp);
        }

        Err(SkerryError::Transport("all nodes failed or unreachable".into()))
    }

    /// A single attempt against one base URL, no cluster fallback.
    pub async fn do_request_to(
        &self,
        base: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, SkerryError> {
        let path = ensure_leading_slash(path);
        self.do_once(base.trim_end_matches('/'), method, &path, body).await
    }

    async fn do_once(
        &self,
        base: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, SkerryError> {
        let url = format!("{}{}", base.trim_end_matches('/'), path);
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.body(body);
        }
        req.send().await.map_err(|e| SkerryError::Transport(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Key helpers
    // -----------------------------------------------------------------------

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), SkerryError> {
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self.do_request(Method::PUT, &path, Some(value.to_vec())).await?;
        expect_success(resp, "put").await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, SkerryError> {
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self.do_request(Method::GET, &path, None).await?;
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
        Err(unexpected_status(resp, "get").await)
    }

    pub async fn delete(&self, key: &str) -> Result<(), SkerryError> {
        let path = format!("/v1/keys/{}", escape_key(key));
        let resp = self.do_request(Method::DELETE, &path, None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(SkerryError::NotFound);
        }
        expect_success(resp, "delete").await
    }

    /// One node's `/v1/status` body, leader-first.
    pub async fn status(&self) -> Result<String, SkerryError> {
        let resp = self.do_request(Method::GET, "/v1/status", None).await?;
        resp.text().await.map_err(|e| SkerryError::Transport(e.to_string()))
    }
}

async fn expect_success(resp: reqwest::Response, op: &str) -> Result<(), SkerryError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(unexpected_status(resp, op).await)
    }
}

async fn unexpected_status(resp: reqwest::Response, op: &str) -> SkerryError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    SkerryError::Internal(format!("{op} failed: status={status} body={}", body.trim_end()))
}

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TEMPORARY_REDIRECT | StatusCode::FOUND | StatusCode::MOVED_PERMANENTLY
    )
}

pub(crate) fn leader_from_headers(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(LEADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}

pub(crate) fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

pub(crate) fn normalize_addr(addr: &str) -> String {
    let with_scheme = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// Convert a leader identifier into an HTTP base URL. A scheme is kept
/// verbatim; `host:port` is rewritten to the default HTTP port 8080 (the
/// advertised address is the consensus port, not the HTTP one); a bare host
/// gets a plain scheme.
pub(crate) fn normalize_leader_addr(leader: &str) -> String {
    let leader = leader.trim();
    if leader.is_empty() {
        return String::new();
    }
    if leader.starts_with("http://") || leader.starts_with("https://") {
        return leader.trim_end_matches('/').to_string();
    }
    match leader.split_once(':') {
        Some((host, _port)) => format!("http://{host}:8080"),
        None => format!("http://{leader}"),
    }
}

/// Percent-escape a key for use as a single path segment.
pub(crate) fn escape_key(key: &str) -> String {
    const SAFE: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";
    let mut out = String::with_capacity(key.len());
    for &b in key.as_bytes() {
        if SAFE.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_normalized_and_deduped() {
        let client = ClusterClient::new(&[
            "127.0.0.1:8080",
            "http://127.0.0.1:8080",
            "http://127.0.0.1:8080/",
            "",
            "https://other:9090/",
        ]);
        assert_eq!(
            client.addrs,
            vec!["http://127.0.0.1:8080".to_string(), "https://other:9090".to_string()]
        );
        assert_eq!(client.try_limit, 2);
    }

    #[test]
    fn empty_address_list_still_tries_once() {
        let client = ClusterClient::new::<&str>(&[]);
        assert_eq!(client.try_limit, 1);
    }

    #[test]
    fn leader_normalization_policy() {
        assert_eq!(
            normalize_leader_addr("http://node1:8080/"),
            "http://node1:8080"
        );
        assert_eq!(normalize_leader_addr("https://node1:8443"), "https://node1:8443");
        // host:port means the consensus port; rewrite to the HTTP default.
        assert_eq!(normalize_leader_addr("node1:12000"), "http://node1:8080");
        assert_eq!(normalize_leader_addr("node1"), "http://node1");
        assert_eq!(normalize_leader_addr("  "), "");
    }

    #[test]
    fn keys_are_path_escaped() {
        assert_eq!(escape_key("plain-key_1.x~"), "plain-key_1.x~");
        assert_eq!(escape_key("a/b"), "a%2Fb");
        assert_eq!(escape_key("sp ace"), "sp%20ace");
        assert_eq!(escape_key("pct%"), "pct%25");
    }

    #[test]
    fn redirect_statuses() {
        assert!(is_redirect(StatusCode::TEMPORARY_REDIRECT));
        assert!(is_redirect(StatusCode::FOUND));
        assert!(is_redirect(StatusCode::MOVED_PERMANENTLY));
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_FOUND));
    }
}
