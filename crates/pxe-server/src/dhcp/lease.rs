//! Lease Manager
//!
//! Owns the address pool and the DHCP option semantics. Allocation is
//! idempotent per MAC and serialized by a lock held only across the
//! scan-and-create step, so two never-seen MACs discovering at the same
//! time cannot be offered the same address.

use crate::config::DhcpConfig;
use crate::error::PxeError;
use crate::nodes::NodeService;
use chrono::Utc;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode};
use netboot_store::{Lease, MacAddress, NewLease, Node, NodeStage, Repository};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Lease Manager
pub struct LeaseManager {
    store: Arc<dyn Repository>,
    nodes: Arc<NodeService>,
    config: DhcpConfig,
    /// Serializes address selection across concurrent DISCOVERs
    allocation: Mutex<()>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Client hardware address of a DHCP packet
pub fn client_mac(packet: &Message) -> Result<MacAddress, PxeError> {
    MacAddress::from_bytes(packet.chaddr()).ok_or_else(|| {
        PxeError::Dhcp(format!(
            "chaddr of transaction {:#010x} is shorter than 6 bytes",
            packet.xid()
        ))
    })
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Repository>, nodes: Arc<NodeService>, config: DhcpConfig) -> Self {
        Self {
            store,
            nodes,
            config,
            allocation: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DhcpConfig {
        &self.config
    }

    /// Lease for `mac`, creating one at the lowest free address if needed
    ///
    /// # Arguments
    ///
    /// * `mac` - Client hardware address
    ///
    /// # Returns
    ///
    /// The existing live lease for `mac`, or a new one bound to the node at
    /// the chosen address (registered when no node holds it yet). Fails with
    /// `AddressExhausted` when every address in the range is taken.
    pub async fn allocate(&self, mac: MacAddress) -> Result<Lease, PxeError> {
        if let Some(lease) = self.store.find_lease_by_mac(&mac).await? {
            return Ok(lease);
        }

        let _guard = self.allocation.lock().await;

        // Another allocation for this MAC may have finished while we waited
        if let Some(lease) = self.store.find_lease_by_mac(&mac).await? {
            return Ok(lease);
        }

        let ip = self.free_address().await?;
        let node = match self.nodes.find_by_ip(ip).await? {
            Some(node) => node,
            None => self.nodes.register(ip, Some(mac)).await?,
        };

        let lease = self
            .store
            .create_lease(NewLease {
                ip,
                mac,
                node: Some(node.id),
                next_server: self.config.next_server(),
                tftp_server: self.config.tftp_server(),
                boot_file: self.config.boot_file.clone(),
                netmask: self.config.netmask,
                lease_time: self.config.lease_time,
            })
            .await?;
        self.nodes.bind_lease(node.id, lease.id, mac).await?;

        info!("Allocated {} to {} (node {})", lease.ip, mac, node.hostname);
        Ok(lease)
    }

    /// Lowest address in the range not held by a live lease
    async fn free_address(&self) -> Result<Ipv4Addr, PxeError> {
        let (start, end) = self.config.range();
        let mut taken: HashSet<Ipv4Addr> = self
            .store
            .list_leases()
            .await?
            .into_iter()
            .map(|lease| lease.ip)
            .collect();
        taken.insert(self.config.address);
        taken.insert(self.config.next_server());

        (u32::from(start)..=u32::from(end))
            .map(Ipv4Addr::from)
            .find(|ip| !taken.contains(ip))
            .ok_or_else(|| PxeError::AddressExhausted(format!("{}-{}", start, end)))
    }

    /// Node owning `lease`
    async fn owner(&self, lease: &Lease) -> Result<Node, PxeError> {
        match lease.node {
            Some(id) => self.nodes.get(id).await,
            None => self.nodes.lookup(lease.ip).await,
        }
    }

    /// Build the OFFER for a DISCOVER
    ///
    /// Allocates on first contact and records the discover time.
    pub async fn on_discover(&self, packet: &Message) -> Result<Message, PxeError> {
        let mac = client_mac(packet)?;
        let mut lease = self.allocate(mac).await?;
        let node = self.owner(&lease).await?;

        lease.discover_time = Some(Utc::now());
        let lease = self.store.update_lease(&lease).await?;

        debug!("DISCOVER from {}: offering {} to {}", mac, lease.ip, node.hostname);
        Ok(self.build_reply(packet, MessageType::Offer, &lease, &node))
    }

    /// Build the ACK for a REQUEST
    ///
    /// Never allocates: a client must have been offered a lease first.
    pub async fn on_request(&self, packet: &Message) -> Result<Message, PxeError> {
        let mac = client_mac(packet)?;
        let mut lease = self
            .store
            .find_lease_by_mac(&mac)
            .await?
            .ok_or_else(|| PxeError::LeaseNotFound(mac.to_string()))?;
        let node = self.owner(&lease).await?;

        lease.request_time = Some(Utc::now());
        let lease = self.store.update_lease(&lease).await?;

        debug!("REQUEST from {}: acknowledging {} for {}", mac, lease.ip, node.hostname);
        Ok(self.build_reply(packet, MessageType::Ack, &lease, &node))
    }

    /// Release the lease of a removed node so its address can be reused
    pub async fn on_node_removed(&self, node_id: u64) -> Result<(), PxeError> {
        match self.store.find_lease_by_node(node_id).await? {
            Some(lease) => {
                self.store.delete_lease(lease.id).await?;
                info!("Released lease {} ({}) of removed node {}", lease.ip, lease.mac, node_id);
            }
            None => debug!("Removed node {} held no lease", node_id),
        }
        Ok(())
    }

    /// Release every live lease whose owning node is gone
    ///
    /// Catches up on removals whose event was never delivered. Leases are
    /// listed before nodes, so a lease allocated meanwhile always finds its
    /// node in the live set.
    ///
    /// # Returns
    ///
    /// Number of leases released
    pub async fn release_orphaned(&self) -> Result<usize, PxeError> {
        let leases = self.store.list_leases().await?;
        let live: HashSet<u64> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|node| node.id)
            .collect();

        let mut released = 0;
        for lease in leases {
            if let Some(node_id) = lease.node.filter(|id| !live.contains(id)) {
                self.store.delete_lease(lease.id).await?;
                info!("Released lease {} ({}) of removed node {}", lease.ip, lease.mac, node_id);
                released += 1;
            }
        }
        Ok(released)
    }

    /// Assemble an OFFER or ACK answering `request`
    ///
    /// The reply echoes `xid`, `flags` and `chaddr`. Boot options (66/67
    /// and the BOOTP `file` field) are only included until the node is
    /// provisioned, so an installed machine boots from its own disk.
    pub fn build_reply(
        &self,
        request: &Message,
        message_type: MessageType,
        lease: &Lease,
        node: &Node,
    ) -> Message {
        let mut reply = Message::new_with_id(
            request.xid(),
            Ipv4Addr::UNSPECIFIED,
            lease.ip,
            lease.next_server,
            lease.next_server,
            request.chaddr(),
        );
        reply.set_opcode(Opcode::BootReply).set_flags(request.flags());

        let boot = node.stage != NodeStage::Provisioned;
        if boot {
            reply.set_fname(lease.boot_file.as_bytes());
        }

        let config = &self.config;
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(message_type));
        opts.insert(DhcpOption::ServerIdentifier(config.address));
        opts.insert(DhcpOption::SubnetMask(lease.netmask));
        opts.insert(DhcpOption::Router(config.gateways()));
        if !config.dns.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(config.dns.clone()));
        }
        opts.insert(DhcpOption::Hostname(node.hostname.clone()));
        if let Some(domain) = &config.domain_name {
            opts.insert(DhcpOption::DomainName(domain.clone()));
        }
        opts.insert(DhcpOption::BroadcastAddr(config.broadcast()));
        opts.insert(DhcpOption::AddressLeaseTime(lease.lease_time));
        if let Some(renewal) = config.renewal_time {
            opts.insert(DhcpOption::Renewal(renewal));
        }
        if let Some(rebinding) = config.rebinding_time {
            opts.insert(DhcpOption::Rebinding(rebinding));
        }
        if boot {
            opts.insert(DhcpOption::TFTPServerName(lease.tftp_server.as_bytes().to_vec()));
            opts.insert(DhcpOption::BootfileName(lease.boot_file.as_bytes().to_vec()));
        }

        reply
    }
}
