//! Execution binding: the handle the agent uses to reach the local
//! workload runtime.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::managers::validate_addr;

/// Where the local runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl RuntimeEndpoint {
    /// Parse `unix:///path`, `tcp://host:port` or a bare `host:port`.
    pub fn parse(addr: &str) -> Result<Self, String> {
        let addr = addr.trim();
        if let Some(path) = addr.strip_prefix("unix://") {
            if !path.starts_with('/') {
                return Err(format!("unix socket path must be absolute: {addr:?}"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let hostport = addr.strip_prefix("tcp://").unwrap_or(addr);
        if hostport.contains("://") {
            return Err(format!("unsupported runtime endpoint scheme: {addr:?}"));
        }
        validate_addr(hostport).map_err(|reason| format!("runtime endpoint {addr:?}: {reason}"))?;
        Ok(Self::Tcp(hostport.to_string()))
    }
}

impl fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Client for the local runtime. Construction does not connect.
#[derive(Debug, Clone)]
pub struct RuntimeClient {
    endpoint: RuntimeEndpoint,
}

impl RuntimeClient {
    pub fn new(endpoint: RuntimeEndpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }
}

/// The executor handed to the agent.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    client: Arc<RuntimeClient>,
}

impl ContainerExecutor {
    pub fn new(client: RuntimeClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }
}
