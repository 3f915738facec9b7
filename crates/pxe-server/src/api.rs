//! Administrative API
//!
//! JSON endpoints for operators: cache inspection, lease and kernel
//! listings, node setters and remote actions, plus Prometheus metrics.

use crate::error::PxeError;
use crate::http::{AppState, CacheEntryInfo};
use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use netboot_store::{Kernel, Lease, MacAddress, Node, NodeStage, NodeStatus};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;

/// Admin routes; merged into the main router
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // Mirror cache
        .route("/api/cache", get(list_cache_handler).delete(clear_cache_handler))
        .route("/api/cache/prefetch", post(prefetch_handler))
        // Catalogue
        .route("/api/leases", get(list_leases_handler))
        .route("/api/kernels", get(list_kernels_handler))
        // Nodes
        .route("/api/nodes", get(list_nodes_handler))
        .route("/api/nodes/register", post(register_handler))
        .route("/api/nodes/{id}", get(get_node_handler).delete(remove_node_handler))
        .route("/api/nodes/{id}/stage", post(stage_handler))
        .route("/api/nodes/{id}/status", post(status_handler))
        .route("/api/nodes/{id}/control-node", post(control_node_handler))
        .route("/api/nodes/{id}/group", post(group_handler))
        .route("/api/nodes/{id}/token", post(token_handler))
        .route("/api/nodes/{id}/password", post(password_handler))
        .route("/api/nodes/{id}/authorized-keys", post(authorized_keys_handler))
        .route("/api/nodes/{id}/kernel", post(kernel_handler))
        .route("/api/nodes/{id}/reboot", post(reboot_handler))
        .route("/api/nodes/{id}/commission", post(commission_handler))
        .route("/api/nodes/{id}/system-info", post(system_info_handler))
        .route("/api/nodes/{id}/processes", get(processes_handler))
        // Telemetry
        .route("/metrics", get(metrics_handler))
}

/// Cache clear response
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

/// Prefetch request
#[derive(Debug, Deserialize)]
pub struct PrefetchRequest {
    pub kernel: String,
    pub path: String,
}

/// Node registration request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: Option<MacAddress>,
}

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub stage: NodeStage,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: NodeStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlNodeRequest {
    pub control_node: bool,
}

#[derive(Debug, Deserialize)]
pub struct GroupRequest {
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizedKeysRequest {
    #[serde(default)]
    pub authorized_keys: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KernelRequest {
    pub kernel: String,
}

async fn list_cache_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CacheEntryInfo>> {
    Json(state.mirror.list())
}

async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    Json(ClearResponse {
        cleared: state.mirror.clear(),
    })
}

/// Fill the cache for a path without serving it
async fn prefetch_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PrefetchRequest>,
) -> Result<Json<CacheEntryInfo>, PxeError> {
    let kernel = state
        .store
        .find_kernel_by_name(&request.kernel)
        .await?
        .ok_or_else(|| PxeError::KernelNotFound(request.kernel.clone()))?;

    info!("Prefetching {} for kernel {}", request.path, kernel.name);
    state.mirror.fetch(&kernel, &request.path).await?;
    state
        .mirror
        .get(&request.path)
        .map(Json)
        .ok_or_else(|| PxeError::FileNotFound(format!("{} was evicted", request.path)))
}

async fn list_leases_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Lease>>, PxeError> {
    Ok(Json(state.store.list_leases().await?))
}

async fn list_kernels_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Kernel>>, PxeError> {
    Ok(Json(state.store.list_kernels().await?))
}

async fn list_nodes_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Node>>, PxeError> {
    Ok(Json(state.nodes.list().await?))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, PxeError> {
    let node = state.nodes.register(request.ip, request.mac).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.get(id).await?))
}

async fn remove_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, PxeError> {
    state.nodes.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stage_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<StageRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_stage(id, request.stage).await?))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_status(id, request.status).await?))
}

async fn control_node_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<ControlNodeRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_control_node(id, request.control_node).await?))
}

async fn group_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<GroupRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_group(id, request.group).await?))
}

async fn token_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_token(id, request.token).await?))
}

async fn password_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<PasswordRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_password(id, request.password).await?))
}

async fn authorized_keys_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<AuthorizedKeysRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_authorized_keys(id, request.authorized_keys).await?))
}

async fn kernel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<KernelRequest>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.set_kernel(id, &request.kernel).await?))
}

async fn reboot_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.reboot(id).await?))
}

async fn commission_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.commission(id).await?))
}

async fn system_info_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Node>, PxeError> {
    Ok(Json(state.nodes.system_info(id).await?))
}

async fn processes_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, PxeError> {
    let output = state.nodes.processes(id).await?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], output))
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, PxeError> {
    let body = state.metrics.render()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
