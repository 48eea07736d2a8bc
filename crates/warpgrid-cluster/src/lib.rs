//! warpgrid-cluster: worker-node bootstrap for WarpGrid.
//!
//! Turns a node configuration into a running agent: resolves the node's
//! identity, builds the controller pool, provisions the node credential,
//! binds the local runtime and hands everything to the agent.
//!
//! # Architecture
//!
//! ```text
//! Worker Node
//!   └── bootstrap::run
//!       ├── identity::resolve     → override, stored, or fresh ID
//!       ├── Managers              → round-robin controller pool
//!       ├── Provisioner           → load-or-create node credential
//!       ├── ContainerExecutor     → local runtime binding
//!       └── NodeAgent             → heartbeats until cancelled
//!
//! Controller (dev)
//!   └── ControlPlane (axum)
//!       ├── POST /v1/certificates → join token + CSR → certificate
//!       └── POST /v1/heartbeat    → CA-verified liveness
//! ```

pub mod agent;
pub mod bootstrap;
pub mod error;
pub mod executor;
pub mod identity;
pub mod managers;
pub mod server;

pub use agent::{Agent, AgentConfig, AgentError, NodeAgent};
pub use bootstrap::{BootstrapConfig, run};
pub use error::BootstrapError;
pub use executor::{ContainerExecutor, RuntimeClient, RuntimeEndpoint};
pub use managers::Managers;
pub use server::{ControlPlane, build_router};
