//! In-memory repository
//!
//! [`MemoryStore`] keeps every table in a `HashMap` behind a mutex and can
//! optionally mirror its contents to a JSON snapshot file after each write.
//!
//! The store is organized into entity modules:
//! - `nodes.rs` - node rows and the control-node lookup
//! - `leases.rs` - lease rows and IP/MAC uniqueness
//! - `kernels.rs` - kernel definitions

mod kernels;
mod leases;
mod nodes;

use crate::error::StoreError;
use crate::models::*;
use crate::repository_trait::Repository;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// On-disk layout of a snapshot file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    next_id: u64,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    leases: Vec<Lease>,
    #[serde(default)]
    kernels: Vec<Kernel>,
}

/// In-memory [`Repository`] with optional JSON snapshot persistence
#[derive(Clone, Debug)]
pub struct MemoryStore {
    pub(crate) nodes: Arc<Mutex<HashMap<u64, Node>>>,
    pub(crate) leases: Arc<Mutex<HashMap<u64, Lease>>>,
    pub(crate) kernels: Arc<Mutex<HashMap<u64, Kernel>>>,
    // Counter for generating IDs, shared by all tables
    pub(crate) next_id: Arc<Mutex<u64>>,
    snapshot: Option<PathBuf>,
    // Serializes snapshot writers so temp files never interleave
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store that lives only in memory
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            leases: Arc::new(Mutex::new(HashMap::new())),
            kernels: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            snapshot: None,
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Open a store backed by a snapshot file
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first write.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the JSON snapshot
    ///
    /// # Returns
    ///
    /// The loaded store, or an error if the file exists but cannot be parsed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self::new();

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded snapshot {} ({} nodes, {} leases, {} kernels)",
                    path.display(),
                    snapshot.nodes.len(),
                    snapshot.leases.len(),
                    snapshot.kernels.len()
                );
                store.restore(snapshot);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        store.snapshot = Some(path);
        Ok(store)
    }

    fn restore(&self, snapshot: Snapshot) {
        let highest = snapshot
            .nodes
            .iter()
            .map(|n| n.id)
            .chain(snapshot.leases.iter().map(|l| l.id))
            .chain(snapshot.kernels.iter().map(|k| k.id))
            .max()
            .unwrap_or(0);

        *lock(&self.next_id) = snapshot.next_id.max(highest + 1);
        *lock(&self.nodes) = snapshot.nodes.into_iter().map(|n| (n.id, n)).collect();
        *lock(&self.leases) = snapshot.leases.into_iter().map(|l| (l.id, l)).collect();
        *lock(&self.kernels) = snapshot.kernels.into_iter().map(|k| (k.id, k)).collect();
    }

    /// Write the current contents to the snapshot file, if one is configured
    ///
    /// The file is replaced atomically: contents go to a sibling temp file
    /// which is then renamed over the target.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let _guard = self.flush_lock.lock().await;

        // One table lock at a time; writers take a table before `next_id`
        let nodes = sorted(lock(&self.nodes).values().cloned().collect());
        let leases = sorted(lock(&self.leases).values().cloned().collect());
        let kernels = sorted(lock(&self.kernels).values().cloned().collect());
        let next_id = *lock(&self.next_id);
        let snapshot = Snapshot { next_id, nodes, leases, kernels };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Flushed snapshot {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Generate next ID
    pub(crate) fn next_id(&self) -> u64 {
        let mut id = lock(&self.next_id);
        let current = *id;
        *id += 1;
        current
    }
}

/// Lock a table, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

trait HasId {
    fn id(&self) -> u64;
}

impl HasId for Node {
    fn id(&self) -> u64 {
        self.id
    }
}

impl HasId for Lease {
    fn id(&self) -> u64 {
        self.id
    }
}

impl HasId for Kernel {
    fn id(&self) -> u64 {
        self.id
    }
}

/// Order rows by id so listings and snapshots are stable
fn sorted<T: HasId>(mut rows: Vec<T>) -> Vec<T> {
    rows.sort_by_key(HasId::id);
    rows
}

#[async_trait::async_trait]
impl Repository for MemoryStore {
    // Nodes - delegated to nodes module
    async fn get_node(&self, id: u64) -> Result<Node, StoreError> {
        nodes::get_node(self, id)
    }

    async fn find_node_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Node>, StoreError> {
        Ok(nodes::find_node(self, |n| n.ip == ip))
    }

    async fn find_node_by_mac(&self, mac: &MacAddress) -> Result<Option<Node>, StoreError> {
        Ok(nodes::find_node(self, |n| n.mac.as_ref() == Some(mac)))
    }

    async fn find_control_node(&self, group: Option<&str>) -> Result<Option<Node>, StoreError> {
        Ok(nodes::find_control_node(self, group))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(nodes::list_nodes(self))
    }

    async fn create_node(&self, node: NewNode) -> Result<Node, StoreError> {
        let created = nodes::create_node(self, node)?;
        self.flush().await?;
        Ok(created)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, StoreError> {
        let updated = nodes::update_node(self, node)?;
        self.flush().await?;
        Ok(updated)
    }

    async fn delete_node(&self, id: u64) -> Result<(), StoreError> {
        nodes::delete_node(self, id)?;
        self.flush().await
    }

    // Leases - delegated to leases module
    async fn get_lease(&self, id: u64) -> Result<Lease, StoreError> {
        leases::get_lease(self, id)
    }

    async fn find_lease_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError> {
        Ok(leases::find_lease(self, |l| l.ip == ip))
    }

    async fn find_lease_by_mac(&self, mac: &MacAddress) -> Result<Option<Lease>, StoreError> {
        Ok(leases::find_lease(self, |l| &l.mac == mac))
    }

    async fn find_lease_by_node(&self, node_id: u64) -> Result<Option<Lease>, StoreError> {
        Ok(leases::find_lease(self, |l| l.node == Some(node_id)))
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError> {
        Ok(leases::list_leases(self))
    }

    async fn create_lease(&self, lease: NewLease) -> Result<Lease, StoreError> {
        let created = leases::create_lease(self, lease)?;
        self.flush().await?;
        Ok(created)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError> {
        let updated = leases::update_lease(self, lease)?;
        self.flush().await?;
        Ok(updated)
    }

    async fn delete_lease(&self, id: u64) -> Result<(), StoreError> {
        leases::delete_lease(self, id)?;
        self.flush().await
    }

    // Kernels - delegated to kernels module
    async fn get_kernel(&self, id: u64) -> Result<Kernel, StoreError> {
        kernels::get_kernel(self, id)
    }

    async fn find_kernel_by_name(&self, name: &str) -> Result<Option<Kernel>, StoreError> {
        Ok(kernels::find_kernel_by_name(self, name))
    }

    async fn list_kernels(&self) -> Result<Vec<Kernel>, StoreError> {
        Ok(kernels::list_kernels(self))
    }

    async fn create_kernel(&self, kernel: NewKernel) -> Result<Kernel, StoreError> {
        let created = kernels::create_kernel(self, kernel)?;
        self.flush().await?;
        Ok(created)
    }
}
