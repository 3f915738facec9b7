//! Controller-specific error types.
//!
//! This module defines error types specific to the netboot daemon that
//! are not covered by the server and store errors.

use thiserror::Error;

/// Errors that can occur in the netboot daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Service failed: {0}")]
    Service(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Server(#[from] pxe_server::PxeError),

    #[error(transparent)]
    Store(#[from] netboot_store::StoreError),
}
