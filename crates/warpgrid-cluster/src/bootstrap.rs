//! Node bootstrap: takes a worker from configuration to a running agent.
//!
//! Steps run strictly in order and the first failure ends the run:
//! 1. Resolve the node identity (override, else stored, else generated)
//! 2. Build the controller pool and select an address
//! 3. Load or bootstrap the node credential against that address
//! 4. Bind the local runtime
//! 5. Assemble `AgentConfig`, build the agent and spawn it
//! 6. Wait for the agent to finish or for cancellation

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warpgrid_ca::{CertificateIssuer, Provisioner, stored_node_id};

use crate::agent::{Agent, AgentConfig, AgentError};
use crate::error::BootstrapError;
use crate::executor::{ContainerExecutor, RuntimeClient, RuntimeEndpoint};
use crate::identity;
use crate::managers::Managers;

/// Controller contacted when none is configured.
pub const DEFAULT_MANAGER: &str = "localhost:4242";
/// Local runtime bound when none is configured.
pub const DEFAULT_ENGINE_ADDR: &str = "unix:///var/run/docker.sock";
/// Where node credentials live when no state directory is configured.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/warpgrid/agent";
/// How long a cancelled agent may take to stop.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Inputs of a bootstrap run.
#[derive(Clone)]
pub struct BootstrapConfig {
    /// Identity override; empty means reuse the stored one or generate.
    pub node_id: String,
    /// Reported hostname; empty means the system hostname.
    pub hostname: String,
    /// Candidate controllers, in preference order.
    pub managers: Vec<String>,
    /// Local runtime endpoint.
    pub engine_addr: String,
    /// Directory holding the persisted credential.
    pub state_dir: PathBuf,
    /// One-time join token, only needed without a stored credential.
    pub join_token: String,
    /// Grace period for the agent after cancellation.
    pub shutdown_grace: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            hostname: String::new(),
            managers: vec![DEFAULT_MANAGER.to_string()],
            engine_addr: DEFAULT_ENGINE_ADDR.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            join_token: String::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("node_id", &self.node_id)
            .field("hostname", &self.hostname)
            .field("managers", &self.managers)
            .field("engine_addr", &self.engine_addr)
            .field("state_dir", &self.state_dir)
            .field("join_token", &if self.join_token.is_empty() { "" } else { "<redacted>" })
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

/// Run the bootstrap sequence and then drive the agent until it stops.
///
/// `build_agent` is called exactly once with the assembled configuration.
/// Cancelling `cancel` before the agent starts aborts with
/// [`BootstrapError::Cancelled`]; cancelling afterwards stops the agent
/// and returns what it reports.
pub async fn run<I, A, F>(
    config: BootstrapConfig,
    issuer: I,
    build_agent: F,
    cancel: CancellationToken,
) -> Result<(), BootstrapError>
where
    I: CertificateIssuer,
    A: Agent,
    F: FnOnce(AgentConfig) -> Result<A, AgentError>,
{
    // Validated before any disk or network access.
    if config.state_dir.as_os_str().is_empty() {
        return Err(BootstrapError::Configuration(
            "state directory must be set".to_string(),
        ));
    }
    let endpoint = RuntimeEndpoint::parse(&config.engine_addr).map_err(BootstrapError::Configuration)?;
    let managers = Managers::parse(&config.managers)?;
    let hostname = resolve_hostname(&config.hostname)?;

    // ── 1. Identity ──────────────────────────────────────────────
    let supplied = if config.node_id.is_empty() {
        stored_node_id(&config.state_dir).unwrap_or_default()
    } else {
        config.node_id.clone()
    };
    if supplied.is_empty() {
        debug!("generating random node identifier");
    }
    let node_id = identity::resolve(&supplied)?;
    info!(%node_id, %hostname, "node identity resolved");

    // ── 2. Controller selection ──────────────────────────────────
    debug!(managers = ?managers.addrs(), "controller pool");
    let controller = managers.select()?;
    info!(%controller, "selected controller");

    // ── 3. Credential ────────────────────────────────────────────
    let provisioner = Provisioner::new(&config.state_dir, issuer);
    let provisioned = provisioner
        .load_or_create(&node_id, &config.join_token, &controller, &cancel)
        .await?;
    let recovered = provisioned.is_recovered();
    let security = provisioned.into_security();
    info!(%node_id, recovered, not_after = security.not_after, "node credential ready");

    // ── 4. Execution binding ─────────────────────────────────────
    let executor = ContainerExecutor::new(RuntimeClient::new(endpoint));
    debug!(runtime = %executor.client().endpoint(), "runtime bound");

    // ── 5. Agent ─────────────────────────────────────────────────
    if cancel.is_cancelled() {
        return Err(BootstrapError::Cancelled);
    }

    let agent = build_agent(AgentConfig {
        node_id: node_id.clone(),
        hostname,
        controller,
        managers,
        executor,
        security,
    })?;

    let agent_cancel = cancel.child_token();
    let handle = tokio::spawn(agent.run(agent_cancel));
    info!(%node_id, "agent started");

    // ── 6. Wait ──────────────────────────────────────────────────
    wait_for_agent(handle, &cancel, config.shutdown_grace).await
}

async fn wait_for_agent(
    mut handle: JoinHandle<Result<(), AgentError>>,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), BootstrapError> {
    tokio::select! {
        joined = &mut handle => agent_outcome(joined),
        _ = cancel.cancelled() => {
            info!("cancellation requested, waiting for agent to stop");
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(joined) => agent_outcome(joined),
                Err(_) => {
                    warn!(?grace, "agent did not stop in time");
                    handle.abort();
                    Err(BootstrapError::Cancelled)
                }
            }
        }
    }
}

fn agent_outcome(joined: Result<Result<(), AgentError>, JoinError>) -> Result<(), BootstrapError> {
    match joined {
        Ok(Ok(())) => {
            info!("agent stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(AgentError::Panicked(e.to_string()).into()),
    }
}

fn resolve_hostname(configured: &str) -> Result<String, BootstrapError> {
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    system_hostname().ok_or_else(|| {
        BootstrapError::Configuration("could not determine system hostname".to_string())
    })
}

/// The kernel's hostname, if it can be read.
pub fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes for the duration
    // of the call.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    (!name.is_empty()).then_some(name)
}
