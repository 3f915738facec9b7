//! Node operations for MemoryStore

use super::{lock, sorted, MemoryStore};
use crate::error::StoreError;
use crate::models::*;
use chrono::Utc;

pub fn get_node(store: &MemoryStore, id: u64) -> Result<Node, StoreError> {
    lock(&store.nodes)
        .get(&id)
        .filter(|n| n.is_live())
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("Node {} not found", id)))
}

pub fn find_node(store: &MemoryStore, predicate: impl Fn(&Node) -> bool) -> Option<Node> {
    let nodes = lock(&store.nodes);
    let mut matches: Vec<&Node> = nodes.values().filter(|&n| n.is_live() && predicate(n)).collect();
    matches.sort_by_key(|n| n.id);
    matches.first().map(|n| (*n).clone())
}

/// Control node for `group`; nodes without a group may join any cluster,
/// so `None` matches the first control node overall.
pub fn find_control_node(store: &MemoryStore, group: Option<&str>) -> Option<Node> {
    find_node(store, |n| {
        n.control_node && group.is_none_or(|g| n.group.as_deref() == Some(g))
    })
}

pub fn list_nodes(store: &MemoryStore) -> Vec<Node> {
    sorted(lock(&store.nodes).values().filter(|n| n.is_live()).cloned().collect())
}

pub fn create_node(store: &MemoryStore, new: NewNode) -> Result<Node, StoreError> {
    let mut nodes = lock(&store.nodes);

    if nodes.values().any(|n| n.is_live() && n.ip == new.ip) {
        return Err(StoreError::Conflict(format!("Node with IP {} already exists", new.ip)));
    }

    let now = Utc::now();
    let node = Node {
        id: store.next_id(),
        hostname: new.hostname,
        ip: new.ip,
        mac: new.mac,
        kernel: new.kernel,
        lease: None,
        stage: NodeStage::default(),
        status: NodeStatus::default(),
        control_node: new.control_node,
        group: new.group,
        token: new.token,
        password: new.password,
        authorized_keys: new.authorized_keys,
        options: NodeOptions::default(),
        labels: Default::default(),
        taints: Vec::new(),
        cores: 0,
        cpu_model: None,
        memory: 0,
        disks: Vec::new(),
        network_interfaces: Vec::new(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };

    nodes.insert(node.id, node.clone());
    Ok(node)
}

pub fn update_node(store: &MemoryStore, node: &Node) -> Result<Node, StoreError> {
    let mut nodes = lock(&store.nodes);

    match nodes.get(&node.id) {
        Some(existing) if existing.is_live() => {}
        _ => return Err(StoreError::NotFound(format!("Node {} not found", node.id))),
    }
    if nodes.values().any(|n| n.is_live() && n.id != node.id && n.ip == node.ip) {
        return Err(StoreError::Conflict(format!("Node with IP {} already exists", node.ip)));
    }

    let mut updated = node.clone();
    updated.updated_at = Utc::now();
    updated.deleted_at = None;
    nodes.insert(updated.id, updated.clone());
    Ok(updated)
}

pub fn delete_node(store: &MemoryStore, id: u64) -> Result<(), StoreError> {
    let mut nodes = lock(&store.nodes);
    match nodes.get_mut(&id) {
        Some(node) if node.is_live() => {
            node.deleted_at = Some(Utc::now());
            Ok(())
        }
        _ => Err(StoreError::NotFound(format!("Node {} not found", id))),
    }
}
