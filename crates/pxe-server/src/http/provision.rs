//! First-boot provisioning endpoints
//!
//! Every endpoint resolves the node from the client address. Serving an OS
//! config is the last step of the pipeline: the node is marked `running`
//! and `provisioned`.

use super::AppState;
use crate::cloud_config;
use crate::error::PxeError;
use crate::paths::safe_join;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::StreamExt;
use netboot_store::{Node, NodeStage, NodeStatus};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

async fn mark_provisioned(state: &AppState, node: &Node) -> Result<(), PxeError> {
    state.nodes.set_status(node.id, NodeStatus::Running).await?;
    state.nodes.advance_stage(node.id, NodeStage::Provisioned).await?;
    Ok(())
}

/// Console password, generated and stored on the first request
async fn bootstrap_password(state: &AppState, node: &Node) -> Result<String, PxeError> {
    if let Some(password) = &node.password {
        return Ok(password.clone());
    }
    let password = uuid::Uuid::new_v4().simple().to_string();
    state.nodes.set_password(node.id, password.clone()).await?;
    info!("Generated password for node {}", node.hostname);
    Ok(password)
}

/// `GET /k3os/config`
pub async fn k3os_config_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, PxeError> {
    let node = state.nodes.lookup_addr(peer.ip()).await?;
    let kernel = state.nodes.kernel_of(&node).await?;
    debug!("k3os config for {} (kernel {})", node.hostname, kernel.name);

    let password = bootstrap_password(&state, &node).await?;
    let control = if node.control_node {
        None
    } else {
        Some(state.nodes.control_node(node.group.as_deref()).await?)
    };

    let config = cloud_config::k3os_config(&node, &password, control.as_ref(), &state.cluster);
    let body = serde_yaml::to_string(&config)
        .map_err(|e| PxeError::Http(format!("Cannot render k3os config: {}", e)))?;

    mark_provisioned(&state, &node).await?;
    info!("Served k3os config to {} ({})", node.hostname, peer);
    Ok(([(CONTENT_TYPE, "application/yaml")], body).into_response())
}

/// `GET /coreos/ignition`
pub async fn ignition_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, PxeError> {
    let node = state.nodes.lookup_addr(peer.ip()).await?;
    state.nodes.kernel_of(&node).await?;

    let config = cloud_config::ignition_config(&node);

    mark_provisioned(&state, &node).await?;
    info!("Served ignition config to {} ({})", node.hostname, peer);
    Ok(Json(config).into_response())
}

/// `GET /ssh_keys`
pub async fn ssh_keys_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, PxeError> {
    let node = state.nodes.lookup_addr(peer.ip()).await?;
    let keys = node
        .authorized_keys
        .ok_or_else(|| PxeError::FileNotFound(format!("Node {} has no authorized keys", node.hostname)))?;

    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], keys).into_response())
}

/// `POST /apkovl`: store the node's Alpine overlay under the kernel's `apkovl` path
pub async fn apkovl_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Body,
) -> Result<Response, PxeError> {
    let node = state.nodes.lookup_addr(peer.ip()).await?;
    let kernel = state.nodes.kernel_of(&node).await?;
    let apkovl = kernel
        .apkovl
        .ok_or_else(|| PxeError::FileNotFound(format!("Kernel {} has no apkovl", kernel.name)))?;

    let target = safe_join(&state.root, &apkovl)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&target).await?;
    let mut stream = body.into_data_stream();
    let mut size: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PxeError::Http(format!("Upload from {} failed: {}", peer, e)))?;
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;

    info!("Stored apkovl of {} at {} ({} bytes)", node.hostname, target.display(), size);
    Ok(StatusCode::OK.into_response())
}
