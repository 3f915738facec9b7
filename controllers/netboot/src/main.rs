//! Netboot Controller
//!
//! Provisions bare-metal machines from first power-on to a running OS.
//!
//! This daemon runs the DHCP lease engine, the TFTP boot server and the
//! HTTP mirror/provisioning server from a single YAML configuration.

mod controller;
mod error;
mod logs;

use anyhow::Context;
use controller::Controller;
use netboot_store::{MemoryStore, Repository};
use pxe_server::config::DEFAULT_CONFIG_PATH;
use pxe_server::Config;
use std::env;
use std::sync::Arc;
use tracing::info;

/// `--config=<path>`, then `NETBOOT_CONFIG`, then the default path
fn config_path() -> String {
    env::args()
        .skip(1)
        .find_map(|arg| arg.strip_prefix("--config=").map(str::to_string))
        .or_else(|| env::var("NETBOOT_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = Config::load(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path))?;

    logs::init_logging(&config.log)?;

    info!("Starting Netboot Controller");
    info!("Configuration:");
    info!("  Config file: {}", path);
    info!("  DHCP: {} range {:?}", config.dhcp.bind_addr(), config.dhcp.range());
    info!("  TFTP: {} root {}", config.tftp.bind_addr(), config.tftp.root.display());
    info!("  HTTP: {} root {}", config.http.bind_addr(), config.http.root.display());
    info!("  Default kernel: {}", config.kernels.default);
    info!(
        "  Store: {}",
        config
            .store
            .snapshot
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "in-memory".to_string())
    );

    let store: Arc<dyn Repository> = match &config.store.snapshot {
        Some(snapshot) => Arc::new(
            MemoryStore::open(snapshot)
                .await
                .with_context(|| format!("Failed to open store snapshot {}", snapshot.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    // Initialize and run controller
    let controller = Controller::new(config, store).await?;
    controller.run().await?;

    Ok(())
}
