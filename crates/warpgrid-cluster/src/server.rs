//! Controller side of node bootstrap.
//!
//! Issues node certificates against single-use join tokens and accepts
//! heartbeats from nodes holding one. Backs `warpd controller` for local
//! clusters and the integration tests.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/certificates` | Exchange a join token + CSR for a certificate |
//! | POST | `/v1/heartbeat` | Node liveness, authenticated by the node certificate |
//!
//! Heartbeats are checked against the CA alone, so a controller restarted
//! from the same CA keeps accepting every node it ever issued to.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use thiserror::Error;
use tracing::{debug, info, warn};

use warpgrid_ca::issuer::ISSUE_PATH;
use warpgrid_ca::{ClusterCa, IssueRequest, IssueResponse, certificate_fingerprint};

use crate::agent::{DEFAULT_HEARTBEAT_INTERVAL, HEARTBEAT_PATH, HeartbeatRequest, HeartbeatResponse};
use crate::identity::{self, IdentityError};

/// Why the controller refused a request.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("invalid join token")]
    InvalidToken,

    #[error("bad certificate request: {0}")]
    BadRequest(String),

    #[error("invalid credential for node {node_id}: {reason}")]
    InvalidCredential { node_id: String, reason: String },
}

impl ControlPlaneError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::InvalidToken | Self::InvalidCredential { .. } => StatusCode::UNAUTHORIZED,
        }
    }
}

impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// A node seen by this controller, through issuance or a heartbeat.
#[derive(Debug, Clone)]
pub struct Member {
    pub node_id: String,
    pub fingerprint: String,
    pub hostname: Option<String>,
    pub runtime: Option<String>,
    pub last_heartbeat: Option<u64>,
    pub heartbeats: u64,
}

/// Controller state: the CA, outstanding join tokens and known members.
pub struct ControlPlane {
    ca: ClusterCa,
    tokens: Mutex<HashSet<String>>,
    members: Mutex<HashMap<String, Member>>,
    heartbeat_interval: Duration,
    issued: AtomicU64,
}

impl ControlPlane {
    /// Create a controller signing with `ca`.
    pub fn new(ca: ClusterCa) -> Self {
        Self {
            ca,
            tokens: Mutex::new(HashSet::new()),
            members: Mutex::new(HashMap::new()),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            issued: AtomicU64::new(0),
        }
    }

    /// Set the heartbeat interval advertised to agents.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create and register a new single-use join token.
    pub fn mint_token(&self) -> Result<String, IdentityError> {
        let token = format!("WGTKN-{}", identity::new_id()?);
        self.add_token(token.clone());
        Ok(token)
    }

    /// Register a join token chosen by the operator.
    pub fn add_token(&self, token: impl Into<String>) {
        lock(&self.tokens).insert(token.into());
    }

    /// Number of certificates issued so far.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn member(&self, node_id: &str) -> Option<Member> {
        lock(&self.members).get(node_id).cloned()
    }

    pub fn members(&self) -> Vec<Member> {
        lock(&self.members).values().cloned().collect()
    }

    /// Sign the node's CSR, consuming its join token.
    pub fn issue(&self, req: &IssueRequest) -> Result<IssueResponse, ControlPlaneError> {
        if req.node_id.is_empty() {
            return Err(ControlPlaneError::BadRequest("node_id is empty".to_string()));
        }

        // Held across signing so a token can only ever be spent once.
        let mut tokens = lock(&self.tokens);
        if !tokens.contains(&req.token) {
            warn!(node_id = %req.node_id, "certificate request with invalid join token");
            return Err(ControlPlaneError::InvalidToken);
        }

        let signed = self
            .ca
            .sign_node_csr(&req.node_id, &req.csr_pem)
            .map_err(|e| ControlPlaneError::BadRequest(e.to_string()))?;
        let fingerprint = certificate_fingerprint(&signed.certificate_pem).ok_or_else(|| {
            ControlPlaneError::BadRequest("signed certificate unreadable".to_string())
        })?;
        tokens.remove(&req.token);
        drop(tokens);

        lock(&self.members).insert(
            req.node_id.clone(),
            Member {
                node_id: req.node_id.clone(),
                fingerprint,
                hostname: None,
                runtime: None,
                last_heartbeat: None,
                heartbeats: 0,
            },
        );
        self.issued.fetch_add(1, Ordering::SeqCst);
        info!(node_id = %req.node_id, "issued node certificate");

        Ok(IssueResponse {
            certificate_pem: signed.certificate_pem,
            ca_certificate_pem: self.ca.cert_pem().to_string(),
            not_after: signed.not_after,
        })
    }

    /// Record a heartbeat from a node presenting a certificate signed by
    /// this controller's CA.
    pub fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse, ControlPlaneError> {
        let now = epoch_secs();
        let cert = self
            .ca
            .verify_node_certificate(&req.node_id, &req.certificate_pem, now)
            .map_err(|reason| {
                warn!(node_id = %req.node_id, %reason, "heartbeat with invalid credential");
                ControlPlaneError::InvalidCredential {
                    node_id: req.node_id.clone(),
                    reason,
                }
            })?;

        let mut members = lock(&self.members);
        let member = members.entry(req.node_id.clone()).or_insert_with(|| {
            info!(node_id = %req.node_id, "node rejoined with existing credential");
            Member {
                node_id: req.node_id.clone(),
                fingerprint: cert.fingerprint.clone(),
                hostname: None,
                runtime: None,
                last_heartbeat: None,
                heartbeats: 0,
            }
        });
        member.fingerprint = cert.fingerprint;
        member.hostname = Some(req.hostname.clone());
        member.runtime = Some(req.runtime.clone());
        member.last_heartbeat = Some(now);
        member.heartbeats += 1;
        debug!(node_id = %req.node_id, count = member.heartbeats, "heartbeat received");

        Ok(HeartbeatResponse {
            acknowledged: true,
            heartbeat_interval_secs: advertised_interval(self.heartbeat_interval),
        })
    }
}

/// Build the controller router.
pub fn build_router(control_plane: Arc<ControlPlane>) -> Router {
    Router::new()
        .route(ISSUE_PATH, post(issue_certificate))
        .route(HEARTBEAT_PATH, post(heartbeat))
        .with_state(control_plane)
}

/// POST /v1/certificates
async fn issue_certificate(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<IssueRequest>,
) -> Result<Json<IssueResponse>, ControlPlaneError> {
    cp.issue(&req).map(Json)
}

/// POST /v1/heartbeat
async fn heartbeat(
    State(cp): State<Arc<ControlPlane>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ControlPlaneError> {
    cp.heartbeat(&req).map(Json)
}

fn advertised_interval(interval: Duration) -> u32 {
    u32::try_from(interval.as_secs()).unwrap_or(u32::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use warpgrid_ca::generate_node_request;

    use super::*;

    fn control_plane() -> Arc<ControlPlane> {
        let cp = ControlPlane::new(ClusterCa::generate().unwrap())
            .with_heartbeat_interval(Duration::from_secs(2));
        cp.add_token("tok-1");
        Arc::new(cp)
    }

    fn issue_request(node_id: &str, token: &str) -> IssueRequest {
        IssueRequest {
            node_id: node_id.to_string(),
            token: token.to_string(),
            csr_pem: generate_node_request(node_id).unwrap().csr_pem,
        }
    }

    fn post_json<T: serde::Serialize>(path: &str, body: &T) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[test]
    fn token_is_single_use() {
        let cp = control_plane();

        cp.issue(&issue_request("node-1", "tok-1")).unwrap();
        let err = cp.issue(&issue_request("node-2", "tok-1")).unwrap_err();

        assert!(matches!(err, ControlPlaneError::InvalidToken));
        assert_eq!(cp.issued_count(), 1);
    }

    #[test]
    fn bad_csr_keeps_token() {
        let cp = control_plane();
        let mut req = issue_request("node-1", "tok-1");
        req.csr_pem = "garbage".to_string();

        assert!(matches!(cp.issue(&req), Err(ControlPlaneError::BadRequest(_))));
        cp.issue(&issue_request("node-1", "tok-1")).unwrap();
    }

    #[test]
    fn minted_tokens_are_unique() {
        let cp = control_plane();
        let a = cp.mint_token().unwrap();
        let b = cp.mint_token().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("WGTKN-"));
    }

    fn heartbeat_request(node_id: &str, certificate_pem: &str) -> HeartbeatRequest {
        HeartbeatRequest {
            node_id: node_id.to_string(),
            hostname: "worker-1".to_string(),
            certificate_pem: certificate_pem.to_string(),
            runtime: "unix:///var/run/docker.sock".to_string(),
        }
    }

    #[test]
    fn heartbeat_authenticates_certificate() {
        let cp = control_plane();
        let resp = cp.issue(&issue_request("node-1", "tok-1")).unwrap();

        let ack = cp.heartbeat(&heartbeat_request("node-1", &resp.certificate_pem)).unwrap();
        assert!(ack.acknowledged);
        assert_eq!(ack.heartbeat_interval_secs, 2);

        let member = cp.member("node-1").unwrap();
        assert_eq!(member.heartbeats, 1);
        assert_eq!(member.hostname.as_deref(), Some("worker-1"));
        assert_eq!(
            Some(member.fingerprint),
            certificate_fingerprint(&resp.certificate_pem)
        );

        // Same certificate presented under another identity.
        assert!(matches!(
            cp.heartbeat(&heartbeat_request("node-2", &resp.certificate_pem)),
            Err(ControlPlaneError::InvalidCredential { .. })
        ));
    }

    #[test]
    fn heartbeat_rejects_certificate_from_another_ca() {
        let cp = control_plane();
        let other = ClusterCa::generate().unwrap();
        let req = generate_node_request("node-1").unwrap();
        let foreign = other.sign_node_csr("node-1", &req.csr_pem).unwrap();

        assert!(matches!(
            cp.heartbeat(&heartbeat_request("node-1", &foreign.certificate_pem)),
            Err(ControlPlaneError::InvalidCredential { .. })
        ));
        assert!(cp.member("node-1").is_none());
    }

    #[test]
    fn restarted_controller_accepts_existing_certificate() {
        let ca = ClusterCa::generate().unwrap();
        let (cert_pem, key_pem) = (ca.cert_pem().to_string(), ca.key_pem());
        let first = ControlPlane::new(ca);
        first.add_token("tok-1");
        let resp = first.issue(&issue_request("node-1", "tok-1")).unwrap();
        drop(first);

        let restarted = ControlPlane::new(ClusterCa::from_pem(&cert_pem, &key_pem).unwrap());
        restarted
            .heartbeat(&heartbeat_request("node-1", &resp.certificate_pem))
            .unwrap();

        assert_eq!(restarted.issued_count(), 0);
        assert_eq!(restarted.member("node-1").unwrap().heartbeats, 1);
    }

    #[test]
    fn huge_interval_saturates() {
        let cp = ControlPlane::new(ClusterCa::generate().unwrap())
            .with_heartbeat_interval(Duration::from_secs(u64::from(u32::MAX) + 10));
        cp.add_token("tok-1");
        let resp = cp.issue(&issue_request("node-1", "tok-1")).unwrap();

        let ack = cp.heartbeat(&heartbeat_request("node-1", &resp.certificate_pem)).unwrap();
        assert_eq!(ack.heartbeat_interval_secs, u32::MAX);
    }

    #[tokio::test]
    async fn issue_route_returns_certificate() {
        let app = build_router(control_plane());

        let resp = app
            .oneshot(post_json(ISSUE_PATH, &issue_request("node-1", "tok-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let issued: IssueResponse = serde_json::from_slice(&body).unwrap();
        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.ca_certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn issue_route_rejects_unknown_token() {
        let app = build_router(control_plane());

        let resp = app
            .oneshot(post_json(ISSUE_PATH, &issue_request("node-1", "nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid join token");
    }

    #[tokio::test]
    async fn heartbeat_route_rejects_unsigned_certificate() {
        let app = build_router(control_plane());
        let hb = heartbeat_request("ghost", "not a certificate");

        let resp = app.oneshot(post_json(HEARTBEAT_PATH, &hb)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
