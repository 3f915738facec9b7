//! Prometheus counters for the provisioning services

use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

/// Counters shared by the DHCP, TFTP and HTTP services
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// DHCP replies sent, by message type (`offer`, `ack`)
    pub dhcp_replies: IntCounterVec,
    /// TFTP transfers finished, by result (`served`, `aborted`)
    pub tftp_transfers: IntCounterVec,
    /// Mirror requests, by result (`hit`, `wait`, `miss`, `error`)
    pub mirror_requests: IntCounterVec,
    /// Upstream downloads, by result (`ok`, `disk`, `failed`)
    pub mirror_downloads: IntCounterVec,
}

impl Metrics {
    /// Create and register all counters in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dhcp_replies = IntCounterVec::new(
            Opts::new("netboot_dhcp_replies_total", "DHCP replies sent"),
            &["type"],
        )?;
        let tftp_transfers = IntCounterVec::new(
            Opts::new("netboot_tftp_transfers_total", "TFTP transfers finished"),
            &["result"],
        )?;
        let mirror_requests = IntCounterVec::new(
            Opts::new("netboot_mirror_requests_total", "Mirror requests by cache outcome"),
            &["result"],
        )?;
        let mirror_downloads = IntCounterVec::new(
            Opts::new("netboot_mirror_downloads_total", "Mirror cache fills"),
            &["result"],
        )?;

        registry.register(Box::new(dhcp_replies.clone()))?;
        registry.register(Box::new(tftp_transfers.clone()))?;
        registry.register(Box::new(mirror_requests.clone()))?;
        registry.register(Box::new(mirror_downloads.clone()))?;

        Ok(Self {
            registry,
            dhcp_replies,
            tftp_transfers,
            mirror_requests,
            mirror_downloads,
        })
    }

    /// Render the registry in the text exposition format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
