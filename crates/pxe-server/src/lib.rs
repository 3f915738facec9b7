//! Netboot Provisioning Server
//!
//! Bare-metal provisioning pipeline built on `dhcproto`, `tokio` and `axum`.
//!
//! This server provides:
//! - DHCP lease engine handing out addresses and boot-loader pointers
//! - TFTP boot server for the iPXE loader and per-node boot scripts
//! - iPXE boot script generation per kernel flavour (alpine, k3os, coreos)
//! - HTTP mirror/cache for OS archives, with at most one upstream download
//!   per path no matter how many nodes ask at once
//! - First-boot provisioning endpoints (k3os config, Ignition, SSH keys)
//! - Node stage/status state machine and an administrative API
//!
//! # Boot flow
//!
//! 1. DISCOVER/REQUEST: the node gets a lease, a registered node record and
//!    the boot loader name (options 66/67)
//! 2. TFTP `ipxe.efi`, then `main.ipxe`: the generated script points the
//!    loader at kernel artifacts on the mirror; status becomes `booting`
//! 3. HTTP mirror: artifacts are fetched from the kernel's archive once and
//!    cached under `http.root`
//! 4. First-boot config: the installed OS fetches its config; the node is
//!    `running` and `provisioned`, and later DHCP replies omit 66/67

pub mod api;
pub mod backoff;
pub mod cloud_config;
pub mod commands;
pub mod config;
pub mod dhcp;
pub mod error;
pub mod hardware;
pub mod http;
pub mod ipxe;
pub mod metrics;
pub mod nodes;
pub mod paths;
pub mod server;
#[cfg(test)]
mod test_utils;
pub mod tftp;

pub use config::Config;
pub use error::PxeError;
pub use nodes::{NodeEvent, NodeService};
pub use server::{PxeServer, ServerHandles};
