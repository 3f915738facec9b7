//! Parsers for hardware facts gathered over the command channel
//!
//! Inputs are the raw outputs of `cat /proc/cpuinfo`, `cat /proc/meminfo`,
//! `lsblk --json --bytes` and `ip link`.

use crate::error::PxeError;
use netboot_store::{Disk, MacAddress, NetworkInterface};

/// Devices never considered install targets
const IGNORED_DISKS: [&str; 3] = ["ram", "loop", "boot"];

/// Processor summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuInfo {
    pub cores: u32,
    pub model: Option<String>,
}

/// Count logical processors and take the first model name
pub fn parse_cpuinfo(text: &str) -> CpuInfo {
    let mut info = CpuInfo::default();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => info.cores += 1,
            "model name" if info.model.is_none() => info.model = Some(value.trim().to_string()),
            _ => {}
        }
    }
    info
}

/// `MemTotal` in kB, or 0 when absent
pub fn parse_meminfo(text: &str) -> u64 {
    text.lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Parse an `lsblk` size: a byte count, or a number with a `B`/`K`/`M`/`G`/`T` suffix
fn parse_size(value: &serde_json::Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let s = value.as_str()?.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let unit = s.chars().last()?;
    let multiplier: u64 = match unit {
        'B' => 1,
        'K' => 1 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        'T' => 1 << 40,
        _ => return None,
    };
    let number: f64 = s[..s.len() - unit.len_utf8()].parse().ok()?;
    Some((number * multiplier as f64) as u64)
}

/// Top-level block devices from `lsblk --json`, minus ram/loop/boot devices
pub fn parse_lsblk(json: &str) -> Result<Vec<Disk>, PxeError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let devices = value
        .get("blockdevices")
        .and_then(|d| d.as_array())
        .ok_or_else(|| PxeError::Command("lsblk output has no blockdevices".to_string()))?;

    let disks = devices
        .iter()
        .filter_map(|device| {
            let name = device.get("name")?.as_str()?;
            if IGNORED_DISKS.iter().any(|ignored| name.contains(ignored)) {
                return None;
            }
            Some(Disk {
                name: name.to_string(),
                size: device.get("size").and_then(parse_size).unwrap_or(0),
                kind: device.get("type").and_then(|t| t.as_str()).map(str::to_string),
            })
        })
        .collect();

    Ok(disks)
}

/// Interfaces from `ip link`, excluding loopback
pub fn parse_ip_link(text: &str) -> Vec<NetworkInterface> {
    let mut interfaces: Vec<NetworkInterface> = Vec::new();

    for line in text.lines() {
        if line.starts_with(|c: char| c.is_ascii_digit()) {
            // "2: eth0: <BROADCAST,MULTICAST,UP> mtu 1500 ..."
            let mut parts = line.splitn(3, ": ");
            let (Some(_), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            let name = name.split('@').next().unwrap_or(name);
            interfaces.push(NetworkInterface {
                name: name.to_string(),
                mac: None,
            });
        } else if let Some(link) = line.trim_start().strip_prefix("link/") {
            // "    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff"
            let address = link.split_whitespace().nth(1);
            if let (Some(current), Some(address)) = (interfaces.last_mut(), address) {
                current.mac = address.parse::<MacAddress>().ok();
            }
        }
    }

    interfaces.retain(|i| i.name != "lo");
    interfaces
}

/// Largest disk by size; first listed wins a tie
pub fn largest_disk(disks: &[Disk]) -> Option<&Disk> {
    disks.iter().rev().max_by_key(|d| d.size)
}
