//! Repository trait
//!
//! This trait abstracts durable storage of nodes, leases and kernels so the
//! provisioning servers never depend on a concrete backend. [`MemoryStore`]
//! implements it in-process; tests use the same implementation.
//!
//! [`MemoryStore`]: crate::MemoryStore

use crate::error::StoreError;
use crate::models::*;
use std::net::Ipv4Addr;

/// Trait for netboot entity storage
///
/// All lookups exclude soft-deleted rows. `get_*` methods fail with
/// [`StoreError::NotFound`]; `find_*` methods return `Ok(None)` instead.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    // Nodes
    async fn get_node(&self, id: u64) -> Result<Node, StoreError>;
    async fn find_node_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Node>, StoreError>;
    async fn find_node_by_mac(&self, mac: &MacAddress) -> Result<Option<Node>, StoreError>;
    /// First control node, scoped to `group` when one is given
    async fn find_control_node(&self, group: Option<&str>) -> Result<Option<Node>, StoreError>;
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
    async fn create_node(&self, node: NewNode) -> Result<Node, StoreError>;
    async fn update_node(&self, node: &Node) -> Result<Node, StoreError>;
    async fn delete_node(&self, id: u64) -> Result<(), StoreError>;

    // Leases
    async fn get_lease(&self, id: u64) -> Result<Lease, StoreError>;
    async fn find_lease_by_ip(&self, ip: Ipv4Addr) -> Result<Option<Lease>, StoreError>;
    async fn find_lease_by_mac(&self, mac: &MacAddress) -> Result<Option<Lease>, StoreError>;
    async fn find_lease_by_node(&self, node_id: u64) -> Result<Option<Lease>, StoreError>;
    async fn list_leases(&self) -> Result<Vec<Lease>, StoreError>;
    async fn create_lease(&self, lease: NewLease) -> Result<Lease, StoreError>;
    async fn update_lease(&self, lease: &Lease) -> Result<Lease, StoreError>;
    async fn delete_lease(&self, id: u64) -> Result<(), StoreError>;

    // Kernels
    async fn get_kernel(&self, id: u64) -> Result<Kernel, StoreError>;
    async fn find_kernel_by_name(&self, name: &str) -> Result<Option<Kernel>, StoreError>;
    async fn list_kernels(&self) -> Result<Vec<Kernel>, StoreError>;
    async fn create_kernel(&self, kernel: NewKernel) -> Result<Kernel, StoreError>;
}
