//! Netboot server wiring
//!
//! [`PxeServer`] builds the shared components (node registry, lease
//! manager, boot script generator, mirror) from a [`Config`] and starts the
//! DHCP, TFTP and HTTP listeners plus the node event watcher, each on its
//! own task.

use crate::commands::{CommandExecutor, SshCommandExecutor};
use crate::config::Config;
use crate::dhcp::{self, DhcpServer, LeaseManager};
use crate::error::PxeError;
use crate::http::{self, AppState, Mirror};
use crate::ipxe::BootScriptGenerator;
use crate::metrics::Metrics;
use crate::nodes::NodeService;
use crate::tftp::TftpServer;
use netboot_store::Repository;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Handles of the running services
#[derive(Debug)]
pub struct ServerHandles {
    pub dhcp: JoinHandle<Result<(), PxeError>>,
    pub tftp: JoinHandle<Result<(), PxeError>>,
    pub http: JoinHandle<Result<(), PxeError>>,
    pub node_events: JoinHandle<Result<(), PxeError>>,
}

impl ServerHandles {
    /// Stop the UDP listeners and the event watcher
    ///
    /// The HTTP server stops on its own once its shutdown signal fires.
    pub fn abort_listeners(&self) {
        self.dhcp.abort();
        self.tftp.abort();
        self.node_events.abort();
    }
}

/// Netboot provisioning server
pub struct PxeServer {
    config: Config,
    store: Arc<dyn Repository>,
    metrics: Metrics,
    nodes: Arc<NodeService>,
    leases: Arc<LeaseManager>,
    mirror: Mirror,
}

impl std::fmt::Debug for PxeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PxeServer")
            .field("config", &self.config)
            .field("nodes", &self.nodes)
            .field("mirror", &self.mirror)
            .finish_non_exhaustive()
    }
}

impl PxeServer {
    /// Create a server that reaches nodes over SSH
    pub fn new(config: Config, store: Arc<dyn Repository>) -> Result<Self, PxeError> {
        let executor = Arc::new(SshCommandExecutor::new(
            config.ssh.user.clone(),
            config.ssh.private_key.clone(),
        ));
        Self::with_executor(config, store, executor)
    }

    /// Create a server with a custom command channel
    pub fn with_executor(
        config: Config,
        store: Arc<dyn Repository>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, PxeError> {
        config.validate()?;

        let metrics = Metrics::new()?;
        let nodes = Arc::new(NodeService::new(
            store.clone(),
            executor,
            config.kernels.default.clone(),
            config.ssh.authorized_keys.clone(),
        ));
        let leases = Arc::new(LeaseManager::new(store.clone(), nodes.clone(), config.dhcp.clone()));

        let client = reqwest::Client::builder()
            .user_agent(concat!("netboot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PxeError::Http(format!("Failed to create HTTP client: {}", e)))?;
        let mirror = Mirror::new(config.http.root.clone(), client, metrics.clone());

        Ok(Self {
            config,
            store,
            metrics,
            nodes,
            leases,
            mirror,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nodes(&self) -> &Arc<NodeService> {
        &self.nodes
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Boot script generator for the configured HTTP port and cluster
    pub fn generator(&self) -> BootScriptGenerator {
        BootScriptGenerator::new(
            self.config.http.port,
            self.config.kernels.debug,
            self.config.cluster.domain.clone(),
        )
    }

    /// Shared state for the HTTP router
    pub fn http_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            store: self.store.clone(),
            nodes: self.nodes.clone(),
            mirror: self.mirror.clone(),
            cluster: self.config.cluster.clone(),
            root: self.config.http.root.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Create configured kernels that do not exist yet
    ///
    /// # Returns
    ///
    /// Number of kernels created
    pub async fn seed_kernels(&self) -> Result<usize, PxeError> {
        let mut created = 0;
        for kernel in &self.config.kernels.seed {
            if self.store.find_kernel_by_name(&kernel.name).await?.is_some() {
                continue;
            }
            let kernel = self.store.create_kernel(kernel.clone()).await?;
            info!("Seeded kernel {} {}", kernel.name, kernel.version);
            created += 1;
        }
        Ok(created)
    }

    /// Bind every listener and start serving
    ///
    /// # Arguments
    ///
    /// * `shutdown_signal` - Resolves when the HTTP server should drain and stop
    pub async fn start(
        &self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<ServerHandles, PxeError> {
        info!("Starting netboot server");

        // Subscribe before any listener can remove a node
        let events = self.nodes.subscribe();

        let dhcp_server = Arc::new(DhcpServer::new(self.leases.clone(), self.metrics.clone()));
        let socket = dhcp_server.bind().await?;
        let dhcp = tokio::spawn(async move { dhcp_server.serve(socket).await });

        let tftp_server = Arc::new(TftpServer::new(
            self.config.tftp.clone(),
            self.store.clone(),
            self.nodes.clone(),
            self.generator(),
            self.metrics.clone(),
        ));
        let socket = tftp_server.bind().await?;
        let tftp = tokio::spawn(async move { tftp_server.serve(socket).await });

        let http = http::serve(self.config.http.bind_addr(), self.http_state(), shutdown_signal).await?;

        let leases = self.leases.clone();
        let node_events = tokio::spawn(async move { dhcp::watch_node_events(leases, events).await });

        Ok(ServerHandles {
            dhcp,
            tftp,
            http,
            node_events,
        })
    }
}
