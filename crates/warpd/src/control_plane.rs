//! Controller mode: a development controller for local clusters.
//!
//! In this mode, the daemon:
//! 1. Loads the cluster CA from the data directory, creating it on first start
//! 2. Mints single-use join tokens and prints them to stdout
//! 3. Serves certificate issuance and heartbeats until Ctrl-C or SIGTERM

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use warpgrid_ca::ClusterCa;
use warpgrid_cluster::{ControlPlane, build_router};

const CA_CERT_FILE: &str = "ca.pem";
const CA_KEY_FILE: &str = "ca-key.pem";

#[derive(Args)]
pub struct ControllerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:4242")]
    pub listen: SocketAddr,

    /// Directory holding the cluster CA.
    #[arg(long, default_value = "/var/lib/warpgrid/controller")]
    pub data_dir: PathBuf,

    /// Number of join tokens to mint at startup.
    #[arg(long, default_value = "1")]
    pub tokens: usize,

    /// Heartbeat interval advertised to agents, in seconds.
    #[arg(long, default_value = "5")]
    pub heartbeat_interval: u64,
}

/// Load the cluster CA from `data_dir`, generating and persisting a new one
/// if none exists yet. A lone certificate or key is an error and is left
/// untouched.
pub fn load_or_generate_ca(data_dir: &Path) -> anyhow::Result<ClusterCa> {
    let cert_path = data_dir.join(CA_CERT_FILE);
    let key_path = data_dir.join(CA_KEY_FILE);

    match (cert_path.exists(), key_path.exists()) {
        (true, false) => anyhow::bail!(
            "{} exists without {}; restore the key or remove both",
            cert_path.display(),
            key_path.display()
        ),
        (false, true) => anyhow::bail!(
            "{} exists without {}; restore the certificate or remove both",
            key_path.display(),
            cert_path.display()
        ),
        _ => {}
    }

    if cert_path.exists() {
        let cert_pem = fs::read_to_string(&cert_path)
            .with_context(|| format!("read {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(&key_path)
            .with_context(|| format!("read {}", key_path.display()))?;
        let ca = ClusterCa::from_pem(&cert_pem, &key_pem).context("load cluster CA")?;
        info!(path = %cert_path.display(), "cluster CA loaded");
        return Ok(ca);
    }

    fs::create_dir_all(data_dir).with_context(|| format!("create {}", data_dir.display()))?;
    let ca = ClusterCa::generate().context("generate cluster CA")?;
    write_file(&key_path, ca.key_pem().as_bytes(), 0o600)?;
    write_file(&cert_path, ca.cert_pem().as_bytes(), 0o644)?;
    info!(path = %cert_path.display(), "cluster CA generated");
    Ok(ca)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("write {}", path.display()))
}

/// Run the development controller.
pub async fn run_controller(args: ControllerArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    info!("WarpGrid daemon starting in controller mode");

    let ca = load_or_generate_ca(&args.data_dir)?;
    let control_plane =
        ControlPlane::new(ca).with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval));

    for _ in 0..args.tokens {
        let token = control_plane.mint_token()?;
        println!("{token}");
    }
    info!(count = args.tokens, "join tokens minted");

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(addr = %listener.local_addr()?, "controller listening");

    axum::serve(listener, build_router(Arc::new(control_plane)))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("controller stopped");
    Ok(())
}
