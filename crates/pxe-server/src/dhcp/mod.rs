//! DHCP server
//!
//! Listens on UDP/67, decodes BOOTREQUESTs with `dhcproto` and hands
//! DISCOVER and REQUEST to the [`LeaseManager`]. Each datagram is handled
//! in its own task; a failing packet is logged and dropped without
//! affecting the listener.

pub mod lease;

pub use lease::{client_mac, LeaseManager};

use crate::backoff::{retry_with_backoff, FibonacciBackoff};
use crate::config::DhcpConfig;
use crate::error::PxeError;
use crate::metrics::Metrics;
use crate::nodes::NodeEvent;
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Encodable};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Bind attempts before giving up on the DHCP socket
const BIND_ATTEMPTS: u32 = 8;

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 1500;

/// DHCP listener
#[derive(Debug)]
pub struct DhcpServer {
    leases: Arc<LeaseManager>,
    metrics: Metrics,
}

impl DhcpServer {
    pub fn new(leases: Arc<LeaseManager>, metrics: Metrics) -> Self {
        Self { leases, metrics }
    }

    fn config(&self) -> &DhcpConfig {
        self.leases.config()
    }

    /// Bind the server socket, retrying while the interface comes up
    pub async fn bind(&self) -> Result<UdpSocket, PxeError> {
        let addr = self.config().bind_addr();
        retry_with_backoff(
            &format!("Binding DHCP socket {}", addr),
            BIND_ATTEMPTS,
            FibonacciBackoff::default(),
            || async move {
                let socket = UdpSocket::bind(addr).await?;
                socket.set_broadcast(true)?;
                Ok::<_, PxeError>(socket)
            },
        )
        .await
    }

    /// Receive loop; runs until the socket fails
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<(), PxeError> {
        let socket = Arc::new(socket);
        info!("DHCP server listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;
            let datagram = buf[..len].to_vec();
            let server = self.clone();
            let socket = socket.clone();

            tokio::spawn(async move {
                if let Some(reply) = server.handle_datagram(&datagram, peer).await {
                    server.send(&socket, &reply).await;
                }
            });
        }
    }

    /// Decode a datagram and build the reply, if one is due
    pub async fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Option<Message> {
        let packet = match Message::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping undecodable DHCP packet from {}: {}", peer, e);
                return None;
            }
        };
        if packet.opcode() != Opcode::BootRequest {
            warn!("Dropping non-BOOTREQUEST packet from {}", peer);
            return None;
        }

        if let Some(DhcpOption::ClassIdentifier(class)) = packet.opts().get(OptionCode::ClassIdentifier) {
            debug!(
                "Transaction {:#010x} from {} vendor class {}",
                packet.xid(),
                peer,
                String::from_utf8_lossy(class)
            );
        }

        let result = match packet.opts().msg_type() {
            Some(MessageType::Discover) => self.leases.on_discover(&packet).await,
            Some(MessageType::Request) => self.leases.on_request(&packet).await,
            other => {
                debug!("Ignoring DHCP {:?} from {}", other, peer);
                return None;
            }
        };

        match result {
            Ok(reply) => Some(reply),
            Err(e) => {
                let mac = client_mac(&packet)
                    .map(|m| m.to_string())
                    .unwrap_or_else(|_| "?".to_string());
                warn!("No reply to {} ({}): {}", mac, peer, e);
                None
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, reply: &Message) {
        let kind = match reply.opts().msg_type() {
            Some(MessageType::Offer) => "offer",
            Some(MessageType::Ack) => "ack",
            _ => "other",
        };
        let bytes = match reply.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode DHCP {}: {}", kind, e);
                return;
            }
        };

        let dest = self.config().reply_addr();
        match socket.send_to(&bytes, dest).await {
            Ok(_) => {
                info!("Sent DHCP {} {} to {}", kind, reply.yiaddr(), dest);
                self.metrics.dhcp_replies.with_label_values(&[kind]).inc();
            }
            Err(e) => warn!("Failed to send DHCP {} to {}: {}", kind, dest, e),
        }
    }
}

/// Release leases of removed nodes until the event channel closes
pub async fn watch_node_events(
    leases: Arc<LeaseManager>,
    mut events: broadcast::Receiver<NodeEvent>,
) -> Result<(), PxeError> {
    loop {
        match events.recv().await {
            Ok(NodeEvent::Removed(id)) => {
                if let Err(e) = leases.on_node_removed(id).await {
                    warn!("Failed to release lease of node {}: {}", id, e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Node event watcher lagged, {} events missed", missed);
                match leases.release_orphaned().await {
                    Ok(released) => info!("Released {} leases of removed nodes", released),
                    Err(e) => warn!("Failed to release leases of removed nodes: {}", e),
                }
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
