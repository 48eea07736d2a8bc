//! Agent mode: runs on worker nodes and joins an existing cluster.
//!
//! In this mode, the daemon:
//! 1. Merges flags, environment and the optional TOML file
//! 2. Resolves the node identity and loads or bootstraps its credential
//! 3. Runs the node agent until Ctrl-C or SIGTERM

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use warpgrid_ca::HttpIssuer;
use warpgrid_ca::issuer::DEFAULT_ISSUE_TIMEOUT;
use warpgrid_cluster::agent::DEFAULT_HEARTBEAT_INTERVAL;
use warpgrid_cluster::{BootstrapConfig, NodeAgent, bootstrap};

#[derive(Args)]
pub struct AgentArgs {
    /// Node identifier. Reused from the state directory or generated when empty.
    #[arg(long = "id", env = "WARPGRID_NODE_ID")]
    pub node_id: Option<String>,

    /// Local runtime endpoint (unix:///path or tcp://host:port).
    #[arg(long)]
    pub engine_addr: Option<String>,

    /// Hostname reported to the cluster. Defaults to the system hostname.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Controller address; repeat or comma-separate for several.
    #[arg(short = 'm', long = "manager", value_delimiter = ',')]
    pub managers: Vec<String>,

    /// Directory holding the node credential.
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Join token, needed only on first join.
    #[arg(long, env = "WARPGRID_JOIN_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// TOML file providing any of the settings above.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Certificate issuance timeout in seconds.
    #[arg(long)]
    pub issue_timeout: Option<u64>,

    /// Heartbeat interval in seconds.
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,
}

/// Agent settings read from `--config`.
#[derive(Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentFileConfig {
    pub id: Option<String>,
    pub engine_addr: Option<String>,
    pub hostname: Option<String>,
    pub managers: Option<Vec<String>>,
    pub state_dir: Option<PathBuf>,
    pub token: Option<String>,
    pub issue_timeout_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
}

impl AgentFileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read agent config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse agent config {}", path.display()))
    }
}

/// Fully merged agent settings.
pub struct AgentSettings {
    pub bootstrap: BootstrapConfig,
    pub issue_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl AgentArgs {
    /// Merge with `file`; flags and environment win over the file, the
    /// file wins over built-in defaults.
    pub fn merge(self, file: AgentFileConfig) -> AgentSettings {
        let mut bootstrap = BootstrapConfig::default();

        if let Some(id) = self.node_id.or(file.id) {
            bootstrap.node_id = id;
        }
        if let Some(addr) = self.engine_addr.or(file.engine_addr) {
            bootstrap.engine_addr = addr;
        }
        if let Some(hostname) = self.hostname.or(file.hostname) {
            bootstrap.hostname = hostname;
        }
        if !self.managers.is_empty() {
            bootstrap.managers = self.managers;
        } else if let Some(managers) = file.managers {
            bootstrap.managers = managers;
        }
        if let Some(dir) = self.state_dir.or(file.state_dir) {
            bootstrap.state_dir = dir;
        }
        if let Some(token) = self.token.or(file.token) {
            bootstrap.join_token = token;
        }
        if let Some(secs) = file.shutdown_grace_secs {
            bootstrap.shutdown_grace = Duration::from_secs(secs);
        }

        AgentSettings {
            bootstrap,
            issue_timeout: self
                .issue_timeout
                .or(file.issue_timeout_secs)
                .map_or(DEFAULT_ISSUE_TIMEOUT, Duration::from_secs),
            heartbeat_interval: self
                .heartbeat_interval
                .or(file.heartbeat_interval_secs)
                .map_or(DEFAULT_HEARTBEAT_INTERVAL, Duration::from_secs),
        }
    }
}

/// Run the agent node.
pub async fn run_agent(args: AgentArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    info!("WarpGrid daemon starting in agent mode");

    let file = match &args.config {
        Some(path) => AgentFileConfig::load(path)?,
        None => AgentFileConfig::default(),
    };
    let settings = args.merge(file);
    debug!(config = ?settings.bootstrap, "agent configuration");

    let issuer = HttpIssuer::new().with_timeout(settings.issue_timeout);
    let heartbeat_interval = settings.heartbeat_interval;

    bootstrap::run(
        settings.bootstrap,
        issuer,
        move |config| NodeAgent::new(config).map(|a| a.with_heartbeat_interval(heartbeat_interval)),
        cancel,
    )
    .await
    .context("node bootstrap failed")?;

    info!("agent stopped");
    Ok(())
}
