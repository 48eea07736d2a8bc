//! Node agent: client-side cluster participation.
//!
//! The agent runs on each worker node once bootstrap has produced a
//! credential. It heartbeats to the controller that issued or confirmed
//! the credential, presenting its node certificate, until it is cancelled
//! or the controller refuses the credential. Other controllers in the pool
//! are tried only after a transient failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warpgrid_ca::SecurityConfig;
use warpgrid_ca::transport::{self, HttpResponse};

use crate::executor::ContainerExecutor;
use crate::managers::Managers;

/// Controller path receiving heartbeats.
pub const HEARTBEAT_PATH: &str = "/v1/heartbeat";

/// Default period between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors reported by an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("controller rejected node credential: {0}")]
    Rejected(String),

    #[error("failed to build agent: {0}")]
    Build(String),

    #[error("agent task panicked: {0}")]
    Panicked(String),
}

/// Everything the agent needs, assembled once by bootstrap.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub hostname: String,
    /// Controller chosen during bootstrap; the first heartbeat goes here.
    pub controller: String,
    pub managers: Managers,
    pub executor: ContainerExecutor,
    pub security: SecurityConfig,
}

/// A long-running node agent.
pub trait Agent: Send + 'static {
    /// Run until a terminal error or until `cancel` fires.
    fn run(self, cancel: CancellationToken) -> impl Future<Output = Result<(), AgentError>> + Send;
}

/// Agent → controller liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    pub hostname: String,
    /// PEM-encoded node certificate, checked against the cluster CA.
    pub certificate_pem: String,
    pub runtime: String,
}

/// Controller → agent acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub heartbeat_interval_secs: u32,
}

enum HeartbeatFailure {
    Rejected(String),
    Transient(String),
}

/// The agent that maintains cluster membership.
pub struct NodeAgent {
    config: AgentConfig,
    fingerprint: String,
    /// Heartbeat interval (the controller may override it).
    heartbeat_interval: Duration,
}

impl NodeAgent {
    /// Create a new node agent.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let fingerprint = config
            .security
            .fingerprint()
            .ok_or_else(|| AgentError::Build("credential has no certificate".to_string()))?;
        if config.managers.is_empty() {
            return Err(AgentError::Build("no controller addresses".to_string()));
        }

        Ok(Self {
            config,
            fingerprint,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        })
    }

    /// Set the heartbeat interval used until the controller says otherwise.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    fn next_controller(&self) -> Result<String, AgentError> {
        self.config
            .managers
            .select()
            .map_err(|e| AgentError::Build(e.to_string()))
    }

    async fn heartbeat(&self, controller: &str) -> Result<HeartbeatResponse, HeartbeatFailure> {
        let request = HeartbeatRequest {
            node_id: self.config.node_id.clone(),
            hostname: self.config.hostname.clone(),
            certificate_pem: self.config.security.certificate_pem.clone(),
            runtime: self.config.executor.client().endpoint().to_string(),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| HeartbeatFailure::Transient(format!("encode heartbeat: {e}")))?;

        let resp: HttpResponse =
            transport::post_json(controller, HEARTBEAT_PATH, body, HEARTBEAT_TIMEOUT)
                .await
                .map_err(|e| HeartbeatFailure::Transient(e.to_string()))?;

        if resp.status.is_success() {
            serde_json::from_slice(&resp.body)
                .map_err(|e| HeartbeatFailure::Transient(format!("decode heartbeat response: {e}")))
        } else if resp.status.as_u16() == 401 || resp.status.as_u16() == 403 {
            Err(HeartbeatFailure::Rejected(resp.error_message()))
        } else {
            Err(HeartbeatFailure::Transient(format!(
                "controller returned {}: {}",
                resp.status,
                resp.error_message()
            )))
        }
    }
}

impl Agent for NodeAgent {
    async fn run(mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        let node_id = self.config.node_id.clone();
        let mut controller = self.config.controller.clone();

        info!(
            %node_id,
            %controller,
            fingerprint = %self.fingerprint,
            interval = ?self.heartbeat_interval,
            runtime = %self.config.executor.client().endpoint(),
            "agent started"
        );

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if self.config.security.renewal_due(now) {
            warn!(
                %node_id,
                not_after = self.config.security.not_after,
                "node credential is due for renewal"
            );
        }

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.heartbeat(&controller) => result,
            };

            match result {
                Ok(resp) => {
                    debug!(%node_id, %controller, ack = resp.acknowledged, "heartbeat sent");
                    let interval = Duration::from_secs(u64::from(resp.heartbeat_interval_secs));
                    if !interval.is_zero() && interval != self.heartbeat_interval {
                        info!(%node_id, ?interval, "controller changed heartbeat interval");
                        self.heartbeat_interval = interval;
                    }
                }
                Err(HeartbeatFailure::Rejected(reason)) => {
                    error!(%node_id, %controller, %reason, "controller rejected node credential");
                    return Err(AgentError::Rejected(reason));
                }
                Err(HeartbeatFailure::Transient(reason)) => {
                    warn!(%node_id, %controller, %reason, "heartbeat failed");
                    controller = self.next_controller()?;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
            }
        }

        info!(%node_id, "agent shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use warpgrid_ca::{ClusterCa, generate_node_request};

    use super::*;
    use crate::executor::{RuntimeClient, RuntimeEndpoint};

    fn test_security(node_id: &str) -> SecurityConfig {
        let ca = ClusterCa::generate().unwrap();
        let req = generate_node_request(node_id).unwrap();
        let signed = ca.sign_node_csr(node_id, &req.csr_pem).unwrap();
        SecurityConfig {
            node_id: node_id.to_string(),
            key_pem: req.key_pem,
            certificate_pem: signed.certificate_pem,
            ca_certificate_pem: ca.cert_pem().to_string(),
            controller: "127.0.0.1:4242".to_string(),
            issued_at: 0,
            not_after: signed.not_after,
        }
    }

    fn test_config(managers: &[&str]) -> AgentConfig {
        let endpoint = RuntimeEndpoint::parse("unix:///var/run/docker.sock").unwrap();
        AgentConfig {
            node_id: "node-1".to_string(),
            hostname: "worker-1".to_string(),
            controller: managers.first().copied().unwrap_or_default().to_string(),
            managers: Managers::new(managers.iter().copied()),
            executor: ContainerExecutor::new(RuntimeClient::new(endpoint)),
            security: test_security("node-1"),
        }
    }

    #[test]
    fn agent_creation() {
        let agent = NodeAgent::new(test_config(&["127.0.0.1:4242"])).unwrap();
        assert_eq!(agent.node_id(), "node-1");
        assert_eq!(agent.fingerprint.len(), 64);
    }

    #[test]
    fn agent_requires_controllers() {
        assert!(matches!(
            NodeAgent::new(test_config(&[])),
            Err(AgentError::Build(_))
        ));
    }

    #[test]
    fn agent_requires_certificate() {
        let mut config = test_config(&["127.0.0.1:4242"]);
        config.security.certificate_pem.clear();
        assert!(matches!(NodeAgent::new(config), Err(AgentError::Build(_))));
    }

    #[tokio::test]
    async fn unreachable_controller_is_retried_until_cancelled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let agent = NodeAgent::new(test_config(&[&addr]))
            .unwrap()
            .with_heartbeat_interval(Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(agent.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
