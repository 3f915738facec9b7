//! HTTP mirror and provisioning server
//!
//! Routes, by path:
//! - `/k3os/config`, `/coreos/ignition`, `/ssh_keys`, `/apkovl`: first-boot
//!   provisioning for the requesting node (see [`provision`])
//! - `/api/...`, `/metrics`: administration (see [`crate::api`])
//! - anything else: mirror passthrough, keyed by the path's first segment
//!   as kernel name

pub mod mirror;
#[cfg(test)]
mod http_test;
pub mod provision;

pub use mirror::{CacheEntryInfo, CachedFile, Mirror};

use crate::config::ClusterConfig;
use crate::error::PxeError;
use crate::metrics::Metrics;
use crate::nodes::NodeService;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED},
        Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use netboot_store::{NodeStatus, Repository};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state of every HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Repository>,
    pub nodes: Arc<NodeService>,
    pub mirror: Mirror,
    pub cluster: ClusterConfig,
    /// Root uploads (apkovl) are written under
    pub root: PathBuf,
    pub metrics: Metrics,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("mirror", &self.mirror)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Build the complete router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // First-boot provisioning
        .route("/k3os/config", get(provision::k3os_config_handler))
        .route("/coreos/ignition", get(provision::ignition_handler))
        .route("/ssh_keys", get(provision::ssh_keys_handler))
        .route("/apkovl", post(provision::apkovl_handler))
        // Administration
        .merge(crate::api::routes())
        // Mirror passthrough
        .fallback(mirror_handler)
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
///
/// # Returns
///
/// Handle of the serving task, which ends once `shutdown_signal` resolves
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PxeError>>, PxeError> {
    let app = router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PxeError::Http(format!("Cannot bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PxeError::Http(e.to_string()))
    });

    Ok(handle)
}

/// Mirror passthrough for any unrouted path
async fn mirror_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> Result<Response, PxeError> {
    if method != Method::GET && method != Method::HEAD {
        return Ok(StatusCode::METHOD_NOT_ALLOWED.into_response());
    }

    let path = uri.path();
    let name = path.trim_start_matches('/').split('/').next().unwrap_or_default();
    let kernel = state
        .store
        .find_kernel_by_name(name)
        .await?
        .ok_or_else(|| PxeError::KernelNotFound(name.to_string()))?;

    // The installer fetching its modloop is the first sign it is running
    if kernel.name == "alpine" && path.contains("modloop") {
        match state.nodes.lookup_addr(peer.ip()).await {
            Ok(node) => {
                state.nodes.set_status(node.id, NodeStatus::Running).await?;
            }
            Err(e) => warn!("Modloop requested by {} without a node: {}", peer, e),
        }
    }

    let cached = state.mirror.fetch(&kernel, path).await?;
    send_file(&method, &cached).await
}

/// Response for a cached file; bodies are streamed from disk
pub async fn send_file(method: &Method, cached: &CachedFile) -> Result<Response, PxeError> {
    let mime = mime_guess::from_path(&cached.file_path).first_or_octet_stream();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .header(CONTENT_LENGTH, cached.size);
    if let Some(last_modified) = &cached.last_modified {
        builder = builder.header(LAST_MODIFIED, last_modified.as_str());
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        let file = tokio::fs::File::open(&cached.file_path).await?;
        Body::from_stream(ReaderStream::new(file))
    };

    builder.body(body).map_err(|e| PxeError::Http(e.to_string()))
}
