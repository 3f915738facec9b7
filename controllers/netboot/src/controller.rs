//! Main controller implementation.
//!
//! This module contains the `Controller` struct that starts the netboot
//! services and supervises them until one fails or a shutdown signal
//! arrives.

use crate::error::ControllerError;
use netboot_store::Repository;
use pxe_server::{Config, PxeServer, ServerHandles};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Netboot daemon supervising the DHCP, TFTP and HTTP services.
pub struct Controller {
    handles: ServerHandles,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    /// Creates the server, seeds kernels and starts every service.
    pub async fn new(config: Config, store: Arc<dyn Repository>) -> Result<Self, ControllerError> {
        info!("Initializing netboot controller");

        let server = PxeServer::new(config, store)?;
        let seeded = server.seed_kernels().await?;
        if seeded > 0 {
            info!("Seeded {} kernels", seeded);
        }

        let (shutdown, mut signal) = watch::channel(false);
        let handles = server
            .start(async move {
                let _ = signal.changed().await;
            })
            .await?;

        Ok(Self { handles, shutdown })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Netboot controller running");

        // Services run forever; any exit is a failure
        let result = tokio::select! {
            result = &mut self.handles.dhcp => exited("DHCP server", result),
            result = &mut self.handles.tftp => exited("TFTP server", result),
            result = &mut self.handles.http => exited("HTTP server", result),
            result = &mut self.handles.node_events => exited("Node event watcher", result),
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
        };

        let _ = self.shutdown.send(true);
        self.handles.abort_listeners();
        if !self.handles.http.is_finished() {
            match (&mut self.handles.http).await {
                Ok(Err(e)) => warn!("HTTP server stopped with error: {}", e),
                Err(e) if !e.is_cancelled() => warn!("HTTP server panicked: {}", e),
                _ => {}
            }
        }

        info!("Netboot controller stopped");
        result
    }
}

fn exited(
    service: &str,
    result: Result<Result<(), pxe_server::PxeError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Service(format!("{} exited", service))),
        Ok(Err(e)) => Err(ControllerError::Service(format!("{} error: {}", service, e))),
        Err(e) => Err(ControllerError::Service(format!("{} panicked: {}", service, e))),
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
