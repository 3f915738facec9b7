//! Netboot entity models
//!
//! Nodes, leases and kernels as stored by a [`Repository`](crate::Repository).
//! All entities carry `created_at`/`updated_at` timestamps and a `deleted_at`
//! marker; a set `deleted_at` means the row is soft-deleted and invisible to
//! every query.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Ethernet hardware address.
///
/// Parsed from `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff` (any case) and
/// always rendered lowercase with colons, so two spellings of the same
/// address compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Build from the first six bytes of a DHCP `chaddr` field.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(StoreError::InvalidMacAddress(format!("{} has {} octets", s, parts.len())));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(StoreError::InvalidMacAddress(format!("{} has octet {:?}", s, part)));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|e| StoreError::InvalidMacAddress(format!("{}: {}", s, e)))?;
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Coarse provisioning lifecycle phase of a node.
///
/// Variants are declared in lifecycle order so `Ord` reflects progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStage {
    #[default]
    Commissioning,
    Commissioned,
    Provisioning,
    Provisioned,
}

impl NodeStage {
    /// Lowercase name as used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStage::Commissioning => "commissioning",
            NodeStage::Commissioned => "commissioned",
            NodeStage::Provisioning => "provisioning",
            NodeStage::Provisioned => "provisioned",
        }
    }
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained runtime condition of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Pending,
    Booting,
    Running,
    Rebooting,
    Failed,
    Unreachable,
}

impl NodeStatus {
    /// Lowercase name as used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Pending => "pending",
            NodeStatus::Booting => "booting",
            NodeStatus::Running => "running",
            NodeStatus::Rebooting => "rebooting",
            NodeStatus::Failed => "failed",
            NodeStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block device discovered during commissioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Kernel device name, e.g. `nvme0n1`
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// `lsblk` device type (`disk`, `rom`, ...)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Network interface discovered during commissioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    pub mac: Option<MacAddress>,
}

/// Free-form per-node options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOptions {
    /// Install target selected during commissioning, e.g. `/dev/sda`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_disk: Option<String>,

    /// Any other option set administratively
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A machine known to the provisioning pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: u64,
    pub hostname: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: Option<MacAddress>,

    /// Kernel id this node boots
    #[serde(default)]
    pub kernel: Option<u64>,
    /// Lease id currently bound to this node
    #[serde(default)]
    pub lease: Option<u64>,

    #[serde(default)]
    pub stage: NodeStage,
    #[serde(default)]
    pub status: NodeStatus,

    #[serde(default)]
    pub control_node: bool,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub authorized_keys: Option<String>,

    #[serde(default)]
    pub options: NodeOptions,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<String>,

    // Hardware facts gathered by commissioning
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub cpu_model: Option<String>,
    /// Memory in kB as reported by `/proc/meminfo`
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Whether the row is live (not soft-deleted).
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Fields required to create a node; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddress>,
    pub kernel: Option<u64>,
    pub password: Option<String>,
    pub authorized_keys: Option<String>,
    pub group: Option<String>,
    pub control_node: bool,
    pub token: Option<String>,
}

/// A DHCP binding of an IP to a MAC plus boot transport metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: u64,
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    /// Owning node id
    #[serde(default)]
    pub node: Option<u64>,
    pub next_server: Ipv4Addr,
    pub tftp_server: String,
    pub boot_file: String,
    pub netmask: Ipv4Addr,
    /// Lease duration in seconds
    pub lease_time: u32,
    #[serde(default)]
    pub discover_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Lease {
    /// Whether the row is live (not soft-deleted).
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Fields required to create a lease.
#[derive(Debug, Clone)]
pub struct NewLease {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
    pub node: Option<u64>,
    pub next_server: Ipv4Addr,
    pub tftp_server: String,
    pub boot_file: String,
    pub netmask: Ipv4Addr,
    pub lease_time: u32,
}

/// CPU architecture of a kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[default]
    X86_64,
    Aarch64,
}

/// OS-specific kernel options (k3os install mode and friends).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KernelOptions {
    /// k3os `k3os.mode`, e.g. `install`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// k3os `k3os.install.silent`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    /// k3os `k3os.install.power_off`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poweroff: Option<bool>,
    /// Path of the first-boot config endpoint on the mirror, e.g. `/k3os/config`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_url: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A named OS boot image definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kernel {
    pub id: u64,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub arch: Arch,

    pub vmlinuz: String,
    pub initramfs: String,
    #[serde(default)]
    pub modloop: Option<String>,
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    /// Upstream origin base URL that mirror paths are appended to
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub apkovl: Option<String>,
    #[serde(default)]
    pub rootfs: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub options: KernelOptions,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Kernel {
    /// Whether the row is live (not soft-deleted).
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Kernel definition as written in configuration; the store assigns id
/// and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NewKernel {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub arch: Arch,
    pub vmlinuz: String,
    pub initramfs: String,
    #[serde(default)]
    pub modloop: Option<String>,
    #[serde(default)]
    pub iso: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub apkovl: Option<String>,
    #[serde(default)]
    pub rootfs: Option<String>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub options: KernelOptions,
}
