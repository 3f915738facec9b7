//! Node registry and state machine
//!
//! [`NodeService`] owns every mutation of a node's `stage` and `status`.
//! The protocol servers call it at boot milestones (script served, installer
//! running, OS configured); administrators call it for setters and for
//! actions that run over the command channel.
//!
//! Stage moves forward only when driven by the pipeline
//! ([`NodeService::advance_stage`]); [`NodeService::set_stage`] is the
//! administrative override and may move either way.

use crate::commands::CommandExecutor;
use crate::error::PxeError;
use crate::hardware;
use netboot_store::{Kernel, MacAddress, NewNode, Node, NodeStage, NodeStatus, Repository};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Lifecycle notifications for other components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Node was administratively removed; its lease must be released
    Removed(u64),
}

/// Node registry backed by a [`Repository`]
pub struct NodeService {
    store: Arc<dyn Repository>,
    executor: Arc<dyn CommandExecutor>,
    default_kernel: String,
    authorized_keys: PathBuf,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("default_kernel", &self.default_kernel)
            .field("authorized_keys", &self.authorized_keys)
            .finish_non_exhaustive()
    }
}

impl NodeService {
    /// Create a node registry
    ///
    /// # Arguments
    ///
    /// * `store` - Entity repository
    /// * `executor` - Command channel used by administrative actions
    /// * `default_kernel` - Kernel name assigned on registration
    /// * `authorized_keys` - File whose contents seed each node's SSH keys
    pub fn new(
        store: Arc<dyn Repository>,
        executor: Arc<dyn CommandExecutor>,
        default_kernel: impl Into<String>,
        authorized_keys: impl Into<PathBuf>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            executor,
            default_kernel: default_kernel.into(),
            authorized_keys: authorized_keys.into(),
            events,
        }
    }

    /// Subscribe to node lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: NodeEvent) {
        // No subscribers is fine (e.g. in tests)
        if self.events.send(event).is_err() {
            debug!("No subscribers for {:?}", event);
        }
    }

    pub async fn get(&self, id: u64) -> Result<Node, PxeError> {
        match self.store.get_node(id).await {
            Ok(node) => Ok(node),
            Err(netboot_store::StoreError::NotFound(_)) => {
                Err(PxeError::NodeNotFound(format!("id {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Node currently holding `ip`, if any
    pub async fn find_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Node>, PxeError> {
        Ok(self.store.find_node_by_ip(ip).await?)
    }

    /// Node holding `ip`, or `NodeNotFound`
    pub async fn lookup(&self, ip: Ipv4Addr) -> Result<Node, PxeError> {
        self.find_by_ip(ip)
            .await?
            .ok_or_else(|| PxeError::NodeNotFound(format!("ip {}", ip)))
    }

    /// Node behind a peer address; IPv4-mapped IPv6 peers are unwrapped
    pub async fn lookup_addr(&self, addr: IpAddr) -> Result<Node, PxeError> {
        let ip = match addr {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(ip) => ip
                .to_ipv4_mapped()
                .ok_or_else(|| PxeError::NodeNotFound(format!("ip {}", ip)))?,
        };
        self.lookup(ip).await
    }

    pub async fn list(&self) -> Result<Vec<Node>, PxeError> {
        Ok(self.store.list_nodes().await?)
    }

    async fn read_authorized_keys(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.authorized_keys).await {
            Ok(keys) if !keys.trim().is_empty() => Some(keys),
            Ok(_) => None,
            Err(e) => {
                debug!(
                    "No authorized keys at {}: {}",
                    self.authorized_keys.display(),
                    e
                );
                None
            }
        }
    }

    /// Register a new node at `ip`
    ///
    /// The node gets a generated hostname and password, the default kernel
    /// (when it exists) and the configured authorized keys. Fails with a
    /// store `Conflict` when a live node already holds `ip`.
    pub async fn register(&self, ip: Ipv4Addr, mac: Option<MacAddress>) -> Result<Node, PxeError> {
        let kernel = self.store.find_kernel_by_name(&self.default_kernel).await?;
        if kernel.is_none() {
            warn!(
                "Default kernel {} not found; registering {} without a kernel",
                self.default_kernel, ip
            );
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let node = self
            .store
            .create_node(NewNode {
                hostname: format!("node-{}", &id[..8]),
                ip,
                mac,
                kernel: kernel.map(|k| k.id),
                password: Some(uuid::Uuid::new_v4().simple().to_string()),
                authorized_keys: self.read_authorized_keys().await,
                group: None,
                control_node: false,
                token: None,
            })
            .await?;

        info!("Registered node {} at {}", node.hostname, node.ip);
        Ok(node)
    }

    /// Read-modify-write a node
    async fn modify(&self, id: u64, change: impl FnOnce(&mut Node)) -> Result<Node, PxeError> {
        let mut node = self.get(id).await?;
        change(&mut node);
        Ok(self.store.update_node(&node).await?)
    }

    /// Administrative stage change; may move backwards
    pub async fn set_stage(&self, id: u64, stage: NodeStage) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            info!("Node {} changed stage {}->{}", node.hostname, node.stage, stage);
            node.stage = stage;
        })
        .await
    }

    /// Pipeline stage change; a no-op unless `stage` is ahead of the current one
    pub async fn advance_stage(&self, id: u64, stage: NodeStage) -> Result<Node, PxeError> {
        let node = self.get(id).await?;
        if node.stage >= stage {
            debug!("Node {} already at stage {}", node.hostname, node.stage);
            return Ok(node);
        }
        self.set_stage(id, stage).await
    }

    pub async fn set_status(&self, id: u64, status: NodeStatus) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            info!("Node {} changed status {}->{}", node.hostname, node.status, status);
            node.status = status;
        })
        .await
    }

    pub async fn set_control_node(&self, id: u64, control_node: bool) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            info!("Node {} control node {}->{}", node.hostname, node.control_node, control_node);
            node.control_node = control_node;
        })
        .await
    }

    pub async fn set_group(&self, id: u64, group: Option<String>) -> Result<Node, PxeError> {
        self.modify(id, |node| node.group = group).await
    }

    pub async fn set_token(&self, id: u64, token: Option<String>) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            info!("Node {} token updated", node.hostname);
            node.token = token;
        })
        .await
    }

    pub async fn set_password(&self, id: u64, password: String) -> Result<Node, PxeError> {
        self.modify(id, |node| node.password = Some(password)).await
    }

    pub async fn set_authorized_keys(&self, id: u64, keys: Option<String>) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            info!("Node {} authorized keys updated", node.hostname);
            node.authorized_keys = keys;
        })
        .await
    }

    /// Point a node at the kernel named `name`
    pub async fn set_kernel(&self, id: u64, name: &str) -> Result<Node, PxeError> {
        let kernel = self
            .store
            .find_kernel_by_name(name)
            .await?
            .ok_or_else(|| PxeError::KernelNotFound(name.to_string()))?;
        self.modify(id, |node| {
            info!("Node {} kernel -> {}", node.hostname, kernel.name);
            node.kernel = Some(kernel.id);
        })
        .await
    }

    /// Kernel a node boots
    pub async fn kernel_of(&self, node: &Node) -> Result<Kernel, PxeError> {
        let id = node
            .kernel
            .ok_or_else(|| PxeError::KernelNotFound(format!("node {} has no kernel", node.hostname)))?;
        match self.store.get_kernel(id).await {
            Ok(kernel) => Ok(kernel),
            Err(netboot_store::StoreError::NotFound(_)) => Err(PxeError::KernelNotFound(format!("id {}", id))),
            Err(e) => Err(e.into()),
        }
    }

    /// Record the lease a node now holds
    pub async fn bind_lease(&self, id: u64, lease: u64, mac: MacAddress) -> Result<Node, PxeError> {
        self.modify(id, |node| {
            node.lease = Some(lease);
            node.mac = Some(mac);
        })
        .await
    }

    /// Control node of `group`
    ///
    /// A requester without a group joins the first control node found in
    /// any group.
    pub async fn control_node(&self, group: Option<&str>) -> Result<Node, PxeError> {
        self.store
            .find_control_node(group)
            .await?
            .ok_or_else(|| {
                PxeError::NodeNotFound(format!("control node for group {}", group.unwrap_or("*")))
            })
    }

    /// Gather hardware facts over the command channel and store them
    pub async fn system_info(&self, id: u64) -> Result<Node, PxeError> {
        let node = self.get(id).await?;

        let cpuinfo = self.executor.exec(&node, "cat /proc/cpuinfo").await?;
        let meminfo = self.executor.exec(&node, "cat /proc/meminfo").await?;
        let lsblk = self.executor.exec(&node, "lsblk --json --bytes").await?;
        let ip_link = self.executor.exec(&node, "ip link").await?;

        let cpu = hardware::parse_cpuinfo(&cpuinfo);
        let memory = hardware::parse_meminfo(&meminfo);
        let disks = hardware::parse_lsblk(&lsblk)?;
        let interfaces = hardware::parse_ip_link(&ip_link);

        info!(
            "Node {} has {} cores, {} kB memory, {} disks, {} interfaces",
            node.hostname,
            cpu.cores,
            memory,
            disks.len(),
            interfaces.len()
        );

        self.modify(id, |node| {
            node.cores = cpu.cores;
            node.cpu_model = cpu.model;
            node.memory = memory;
            node.disks = disks;
            node.network_interfaces = interfaces;
        })
        .await
    }

    /// Discover hardware, pick the largest disk as install target and mark
    /// the node commissioned
    pub async fn commission(&self, id: u64) -> Result<Node, PxeError> {
        let node = self.system_info(id).await?;

        let disk = hardware::largest_disk(&node.disks)
            .map(|d| format!("/dev/{}", d.name))
            .ok_or_else(|| PxeError::InvalidRequest(format!("Node {} has no disks", node.hostname)))?;

        self.modify(id, |node| {
            info!("Node {} install disk {}", node.hostname, disk);
            node.options.install_disk = Some(disk);
            info!("Node {} changed stage {}->{}", node.hostname, node.stage, NodeStage::Commissioned);
            node.stage = NodeStage::Commissioned;
        })
        .await
    }

    /// Reboot a node and mark it rebooting
    pub async fn reboot(&self, id: u64) -> Result<Node, PxeError> {
        let node = self.get(id).await?;
        self.executor.exec(&node, "sudo reboot").await?;
        self.set_status(id, NodeStatus::Rebooting).await
    }

    /// `ps aux` output from the node
    pub async fn processes(&self, id: u64) -> Result<String, PxeError> {
        let node = self.get(id).await?;
        self.executor.exec(&node, "ps aux").await
    }

    /// Soft-delete a node and announce it so its lease is released
    pub async fn remove(&self, id: u64) -> Result<(), PxeError> {
        let node = self.get(id).await?;
        self.store.delete_node(id).await?;
        info!("Removed node {} ({})", node.hostname, node.ip);
        self.publish(NodeEvent::Removed(id));
        Ok(())
    }
}
