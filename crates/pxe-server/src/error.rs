//! PXE server errors

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use netboot_store::StoreError;
use thiserror::Error;
use tracing::warn;

/// Errors raised by the DHCP, TFTP and HTTP services
#[derive(Debug, Error)]
pub enum PxeError {
    /// No live node matches the lookup (IP, MAC or id)
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Node references a kernel that does not exist
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// Requested file or directory is absent from a served root
    #[error("{0}")]
    FileNotFound(String),

    /// No live lease matches the lookup
    #[error("Lease not found: {0}")]
    LeaseNotFound(String),

    /// Every address in the configured range is leased
    #[error("No address available in range {0}")]
    AddressExhausted(String),

    /// Upstream archive answered with an error or the transfer failed
    #[error("Upstream fetch failed: {message}")]
    UpstreamFetchFailed {
        /// Upstream HTTP status, if a response was received
        status: Option<u16>,
        message: String,
    },

    /// A TFTP transfer was aborted mid-stream
    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    #[error("DHCP error: {0}")]
    Dhcp(String),

    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote command over the node command channel failed
    #[error("Command error: {0}")]
    Command(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl PxeError {
    /// HTTP status used when this error ends an HTTP request
    pub fn status_code(&self) -> StatusCode {
        match self {
            PxeError::NodeNotFound(_)
            | PxeError::KernelNotFound(_)
            | PxeError::LeaseNotFound(_)
            | PxeError::FileNotFound(_)
            | PxeError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            PxeError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            PxeError::AddressExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            PxeError::UpstreamFetchFailed { status: Some(404), .. } => StatusCode::NOT_FOUND,
            PxeError::UpstreamFetchFailed { .. } => StatusCode::BAD_GATEWAY,
            PxeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this is one of the "entity absent" errors
    pub fn is_not_found(&self) -> bool {
        self.status_code() == StatusCode::NOT_FOUND
    }
}

impl IntoResponse for PxeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PxeError::NodeNotFound("10.1.10.5".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            PxeError::Store(StoreError::NotFound("Node 3".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(PxeError::AddressExhausted("x".into()).status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            PxeError::UpstreamFetchFailed { status: Some(404), message: "gone".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PxeError::UpstreamFetchFailed { status: None, message: "reset".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(PxeError::InvalidRequest("bad".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(PxeError::Command("ssh".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
