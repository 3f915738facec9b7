//! Server configuration
//!
//! One YAML document drives every service. All sections and keys are
//! optional; an empty document (or a missing file) yields a server for the
//! `10.1.10.0/24` provisioning network with leases `.10`-`.99`.
//!
//! ```yaml
//! dhcp:
//!   address: 10.1.10.1
//!   range: [10.1.10.10, 10.1.10.99]
//!   dns: [1.1.1.1, 8.8.8.8]
//! tftp:
//!   root: ./public
//! http:
//!   port: 80
//! kernels:
//!   default: alpine
//!   seed:
//!     - name: alpine
//!       version: 3.14.0
//!       vmlinuz: /alpine/netboot/3.14.0/vmlinuz-lts
//!       initramfs: /alpine/netboot/3.14.0/initramfs-lts
//!       archive: https://dl-cdn.alpinelinux.org
//! ```

use crate::error::PxeError;
use netboot_store::NewKernel;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/netboot/config.yaml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dhcp: DhcpConfig,
    pub tftp: TftpConfig,
    pub http: HttpConfig,
    pub kernels: KernelsConfig,
    pub cluster: ClusterConfig,
    pub ssh: SshConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

/// DHCP lease engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// Server IP; also the server identifier (option 54)
    pub address: Ipv4Addr,
    pub port: u16,
    pub client_port: u16,
    /// Inclusive lease range; defaults to `.10`-`.99` of the server /24
    pub range: Option<[Ipv4Addr; 2]>,
    pub netmask: Ipv4Addr,
    /// Option 3; defaults to `[address]`
    pub gateways: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    /// Option 28; defaults to `x.y.z.255` of the server /24
    pub broadcast: Option<Ipv4Addr>,
    pub domain_name: Option<String>,
    /// Lease duration in seconds
    pub lease_time: u32,
    pub renewal_time: Option<u32>,
    pub rebinding_time: Option<u32>,
    pub boot_file: String,
    pub next_server: Option<Ipv4Addr>,
    pub tftp_server: Option<String>,
    /// Destination for OFFER/ACK datagrams
    pub reply_address: Ipv4Addr,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 1, 10, 1),
            port: 67,
            client_port: 68,
            range: None,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateways: Vec::new(),
            dns: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            broadcast: None,
            domain_name: None,
            lease_time: 86400,
            renewal_time: None,
            rebinding_time: None,
            boot_file: "ipxe.efi".to_string(),
            next_server: None,
            tftp_server: None,
            reply_address: Ipv4Addr::BROADCAST,
        }
    }
}

impl DhcpConfig {
    fn in_subnet(&self, last: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.address.octets();
        Ipv4Addr::new(a, b, c, last)
    }

    /// Inclusive `(start, end)` of the lease range
    pub fn range(&self) -> (Ipv4Addr, Ipv4Addr) {
        match self.range {
            Some([start, end]) => (start, end),
            None => (self.in_subnet(10), self.in_subnet(99)),
        }
    }

    pub fn gateways(&self) -> Vec<Ipv4Addr> {
        if self.gateways.is_empty() {
            vec![self.address]
        } else {
            self.gateways.clone()
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.broadcast.unwrap_or_else(|| self.in_subnet(255))
    }

    /// Address clients fetch boot files from (`siaddr`, iPXE `${next-server}`)
    pub fn next_server(&self) -> Ipv4Addr {
        self.next_server.unwrap_or(self.address)
    }

    /// Option 66 value
    pub fn tftp_server(&self) -> String {
        self.tftp_server
            .clone()
            .unwrap_or_else(|| self.next_server().to_string())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn reply_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.reply_address, self.client_port))
    }
}

/// TFTP boot server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub address: Ipv4Addr,
    pub port: u16,
    pub root: PathBuf,
    /// Static boot-loader binary served from `root`
    pub boot_loader: String,
    /// Reserved filename answered with a generated iPXE script
    pub boot_script: String,
    /// Seconds to wait for an ACK before retransmitting
    pub timeout_secs: u64,
    pub retries: u32,
    /// Upper bound for a negotiated `blksize`
    pub max_block_size: u16,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 69,
            root: PathBuf::from("./public"),
            boot_loader: "ipxe.efi".to_string(),
            boot_script: "main.ipxe".to_string(),
            timeout_secs: 3,
            retries: 5,
            max_block_size: 1468,
        }
    }
}

impl TftpConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// HTTP mirror and API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Directory mirrored artifacts are stored under
    pub root: PathBuf,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 80,
            root: PathBuf::from("./public"),
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// Kernel catalogue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelsConfig {
    /// Kernel assigned to newly registered nodes
    pub default: String,
    /// Adds network diagnostics to every boot script
    pub debug: bool,
    /// Kernels created at startup when missing
    pub seed: Vec<NewKernel>,
}

impl Default for KernelsConfig {
    fn default() -> Self {
        Self {
            default: "alpine".to_string(),
            debug: false,
            seed: Vec::new(),
        }
    }
}

/// Cluster-wide values written into first-boot OS configs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// k3s `--cluster-domain`
    pub domain: String,
    pub dns_nameservers: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub modules: Vec<String>,
    pub write_files: Vec<serde_json::Value>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            domain: "cluster.local".to_string(),
            dns_nameservers: vec!["1.1.1.1".to_string()],
            ntp_servers: vec!["pool.ntp.org".to_string()],
            modules: vec!["kvm".to_string(), "nvme".to_string()],
            write_files: Vec::new(),
        }
    }
}

/// Remote command channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub private_key: Option<PathBuf>,
    /// File whose contents seed `authorizedKeys` on registration
    pub authorized_keys: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            private_key: None,
            authorized_keys: PathBuf::from("/root/.ssh/authorized_keys"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot file; in-memory only when unset
    pub snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self, PxeError> {
        let config: Config = if text.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| PxeError::Configuration(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PxeError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                info!("Loading configuration from {}", path.display());
                Self::from_yaml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Configuration file {} not found, using defaults", path.display());
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(PxeError::Configuration(format!("{}: {}", path.display(), e))),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), PxeError> {
        let (start, end) = self.dhcp.range();
        let same_subnet = |ip: Ipv4Addr| ip.octets()[..3] == self.dhcp.address.octets()[..3];

        if !same_subnet(start) || !same_subnet(end) {
            return Err(PxeError::Configuration(format!(
                "dhcp.range {}-{} must lie within the /24 of dhcp.address {}",
                start, end, self.dhcp.address
            )));
        }
        if start > end {
            return Err(PxeError::Configuration(format!(
                "dhcp.range start {} is after end {}",
                start, end
            )));
        }
        if self.dhcp.lease_time == 0 {
            return Err(PxeError::Configuration("dhcp.lease_time must be positive".to_string()));
        }
        if self.tftp.boot_loader == self.tftp.boot_script {
            return Err(PxeError::Configuration(
                "tftp.boot_loader and tftp.boot_script must differ".to_string(),
            ));
        }
        if !(8..=65464).contains(&self.tftp.max_block_size) {
            return Err(PxeError::Configuration(format!(
                "tftp.max_block_size {} is outside 8-65464",
                self.tftp.max_block_size
            )));
        }
        if self.tftp.retries == 0 {
            return Err(PxeError::Configuration("tftp.retries must be at least 1".to_string()));
        }
        if self.kernels.default.is_empty() {
            return Err(PxeError::Configuration("kernels.default must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_yaml("").unwrap();

        assert_eq!(config.dhcp.address, Ipv4Addr::new(10, 1, 10, 1));
        assert_eq!(
            config.dhcp.range(),
            (Ipv4Addr::new(10, 1, 10, 10), Ipv4Addr::new(10, 1, 10, 99))
        );
        assert_eq!(config.dhcp.gateways(), vec![Ipv4Addr::new(10, 1, 10, 1)]);
        assert_eq!(config.dhcp.broadcast(), Ipv4Addr::new(10, 1, 10, 255));
        assert_eq!(config.dhcp.tftp_server(), "10.1.10.1");
        assert_eq!(config.tftp.boot_script, "main.ipxe");
        assert_eq!(config.kernels.default, "alpine");
    }

    #[test]
    fn test_partial_document_keeps_other_defaults() {
        let config = Config::from_yaml(
            r#"
dhcp:
  address: 192.168.5.1
  range: [192.168.5.100, 192.168.5.110]
  next_server: 192.168.5.2
http:
  port: 8080
kernels:
  debug: true
  seed:
    - name: k3os
      version: v0.21.5-k3s2r1
      vmlinuz: /k3os/k3os-vmlinuz-amd64
      initramfs: /k3os/k3os-initrd-amd64
      options:
        mode: install
        silent: true
"#,
        )
        .unwrap();

        assert_eq!(config.dhcp.range().0, Ipv4Addr::new(192, 168, 5, 100));
        assert_eq!(config.dhcp.next_server(), Ipv4Addr::new(192, 168, 5, 2));
        assert_eq!(config.dhcp.tftp_server(), "192.168.5.2");
        assert_eq!(config.dhcp.lease_time, 86400);
        assert_eq!(config.http.port, 8080);
        assert!(config.kernels.debug);
        assert_eq!(config.kernels.seed[0].options.mode.as_deref(), Some("install"));
    }

    #[test]
    fn test_range_outside_subnet_is_rejected() {
        let err = Config::from_yaml(
            r#"
dhcp:
  address: 10.1.10.1
  range: [10.1.11.10, 10.1.11.20]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("dhcp.range"));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let err = Config::from_yaml("dhcp:\n  range: [10.1.10.50, 10.1.10.20]\n").unwrap_err();
        assert!(matches!(err, PxeError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config.dhcp.port, 67);
    }
}
