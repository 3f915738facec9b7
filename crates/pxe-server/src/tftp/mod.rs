//! TFTP boot server
//!
//! Serves read requests from `tftp.root`. Two filenames are reserved:
//!
//! - the boot loader (`ipxe.efi`): served as a static file
//! - the boot script (`main.ipxe`): generated per requesting node, after
//!   which the node's status becomes `booting`
//!
//! Any other name is a static file, optionally resumed from an `offset`.
//! Failures abort the transfer with a TFTP error packet; a missing file is
//! never answered with an empty transfer.

pub mod packet;
pub mod transfer;

pub use packet::{ErrorCode, Packet};
pub use transfer::{negotiate, Negotiated, TransferLimits};

use crate::backoff::{retry_with_backoff, FibonacciBackoff};
use crate::config::TftpConfig;
use crate::error::PxeError;
use crate::ipxe::BootScriptGenerator;
use crate::metrics::Metrics;
use crate::nodes::NodeService;
use crate::paths::safe_join;
use netboot_store::{NodeStatus, Repository};
use packet::Options;
use std::io::Cursor;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncSeekExt};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use transfer::Transfer;

/// Bind attempts before giving up on the TFTP socket
const BIND_ATTEMPTS: u32 = 8;

/// Largest request datagram accepted
const MAX_REQUEST: usize = 1024;

/// Payload resolved for a read request
enum Payload {
    /// Generated in memory; its exact length is known up front
    Script(Vec<u8>),
    File { file: tokio::fs::File, path: PathBuf, size: u64 },
}

impl Payload {
    fn size(&self) -> u64 {
        match self {
            Payload::Script(bytes) => bytes.len() as u64,
            Payload::File { size, .. } => *size,
        }
    }
}

/// TFTP error code for a failed lookup
fn error_code(error: &PxeError) -> ErrorCode {
    match error {
        e if e.is_not_found() => ErrorCode::FileNotFound,
        PxeError::InvalidRequest(_) => ErrorCode::AccessViolation,
        _ => ErrorCode::NotDefined,
    }
}

/// TFTP boot server
pub struct TftpServer {
    config: TftpConfig,
    store: Arc<dyn Repository>,
    nodes: Arc<NodeService>,
    generator: BootScriptGenerator,
    metrics: Metrics,
}

impl std::fmt::Debug for TftpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpServer")
            .field("config", &self.config)
            .field("generator", &self.generator)
            .finish_non_exhaustive()
    }
}

impl TftpServer {
    pub fn new(
        config: TftpConfig,
        store: Arc<dyn Repository>,
        nodes: Arc<NodeService>,
        generator: BootScriptGenerator,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            store,
            nodes,
            generator,
            metrics,
        }
    }

    fn limits(&self) -> TransferLimits {
        TransferLimits {
            timeout: Duration::from_secs(self.config.timeout_secs),
            retries: self.config.retries,
            max_block_size: self.config.max_block_size,
        }
    }

    /// Bind the well-known port, retrying while the interface comes up
    pub async fn bind(&self) -> Result<UdpSocket, PxeError> {
        let addr = self.config.bind_addr();
        retry_with_backoff(
            &format!("Binding TFTP socket {}", addr),
            BIND_ATTEMPTS,
            FibonacciBackoff::default(),
            || async move { Ok::<_, PxeError>(UdpSocket::bind(addr).await?) },
        )
        .await
    }

    /// Request loop; each RRQ is served from its own task and socket
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<(), PxeError> {
        info!("TFTP server listening on {}", socket.local_addr()?);

        let mut buf = vec![0u8; MAX_REQUEST];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await?;

            match Packet::decode(&buf[..len]) {
                Ok(Packet::Rrq { filename, mode, options }) => {
                    debug!("[{}] ({}) read request, mode {}, options {:?}", peer, filename, mode, options);
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _ = server.read_request(peer, &filename, &options).await;
                    });
                }
                Ok(Packet::Wrq { filename, .. }) => {
                    warn!("[{}] ({}) write request refused", peer, filename);
                    let refusal = Packet::error(ErrorCode::AccessViolation, "Write requests are not supported");
                    let _ = socket.send_to(&refusal.encode(), peer).await;
                }
                Ok(other) => debug!("[{}] ignoring {:?} on the request port", peer, other),
                Err(e) => warn!("[{}] dropping request: {}", peer, e),
            }
        }
    }

    /// Serve one read request from a fresh transfer socket
    ///
    /// Logs the outcome with the requester's address and the filename and
    /// sends a TFTP error packet on any failure.
    ///
    /// # Returns
    ///
    /// Payload bytes delivered
    pub async fn read_request(&self, peer: SocketAddr, filename: &str, options: &Options) -> Result<u64, PxeError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(self.config.address), 0)).await?;
        let mut transfer = Transfer::new(socket, peer, self.config.retries);

        let result = self.run(&mut transfer, peer, filename, options).await;
        match &result {
            Ok(bytes) => {
                info!("[{}] ({}) done, {} bytes", peer, filename, bytes);
                self.metrics.tftp_transfers.with_label_values(&["served"]).inc();
            }
            Err(e) => {
                warn!("[{}] ({}) {}", peer, filename, e);
                self.metrics.tftp_transfers.with_label_values(&["aborted"]).inc();
            }
        }
        result
    }

    async fn run(
        &self,
        transfer: &mut Transfer,
        peer: SocketAddr,
        filename: &str,
        options: &Options,
    ) -> Result<u64, PxeError> {
        let payload = match self.resolve(peer, filename).await {
            Ok(payload) => payload,
            Err(e) => {
                transfer.send_error(error_code(&e), &e.to_string()).await;
                return Err(e);
            }
        };

        let negotiated = match negotiate(options, payload.size(), &self.limits()) {
            Ok(negotiated) => negotiated,
            Err(refusal) => {
                transfer.send_error(refusal.code, &refusal.message).await;
                return Err(PxeError::TransferAborted(refusal.message));
            }
        };

        let mut reader: Box<dyn AsyncRead + Unpin + Send> = match payload {
            Payload::Script(bytes) => {
                let mut cursor = Cursor::new(bytes);
                cursor.set_position(negotiated.offset);
                Box::new(cursor)
            }
            Payload::File { mut file, path, size } => {
                if negotiated.offset > 0 {
                    file.seek(std::io::SeekFrom::Start(negotiated.offset)).await?;
                }
                info!("Sending file {} size {} to {}", path.display(), size, peer);
                Box::new(file)
            }
        };

        transfer.send(&mut reader, &negotiated).await
    }

    async fn resolve(&self, peer: SocketAddr, filename: &str) -> Result<Payload, PxeError> {
        let name = filename.trim_start_matches('/');
        if name == self.config.boot_script {
            return self.boot_script(peer).await.map(Payload::Script);
        }
        if name == self.config.boot_loader {
            debug!("[{}] ({}) serving boot loader", peer, filename);
        }
        self.static_file(filename).await
    }

    /// Generate the requesting node's boot script and mark it booting
    async fn boot_script(&self, peer: SocketAddr) -> Result<Vec<u8>, PxeError> {
        let node = self.nodes.lookup_addr(peer.ip()).await?;
        let kernel = self.nodes.kernel_of(&node).await?;
        let lease = match self.store.find_lease_by_node(node.id).await? {
            Some(lease) => lease,
            None => self
                .store
                .find_lease_by_ip(node.ip)
                .await?
                .ok_or_else(|| PxeError::LeaseNotFound(format!("ip {}", node.ip)))?,
        };

        info!("[{}] ({}) serving boot file...", peer, self.config.boot_script);
        let script = self.generator.generate(&node, &kernel, &lease);
        self.nodes.set_status(node.id, NodeStatus::Booting).await?;
        Ok(script.into_bytes())
    }

    async fn static_file(&self, filename: &str) -> Result<Payload, PxeError> {
        let path = safe_join(&self.config.root, filename)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PxeError::FileNotFound(format!("File {} not found", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            return Err(PxeError::FileNotFound(format!("File {} is a directory", path.display())));
        }

        let file = tokio::fs::File::open(&path).await?;
        Ok(Payload::File {
            file,
            path,
            size: metadata.len(),
        })
    }
}
