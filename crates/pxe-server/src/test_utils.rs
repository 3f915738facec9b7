//! Test utilities for unit testing the provisioning services
//!
//! Builders for nodes, kernels and leases plus a scripted command channel.

#![cfg(test)]

use crate::commands::CommandExecutor;
use crate::error::PxeError;
use chrono::Utc;
use netboot_store::{
    Arch, Kernel, KernelOptions, Lease, MacAddress, Node, NodeOptions, NodeStage, NodeStatus,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Helper to create a test node
pub fn create_test_node(id: u64, hostname: &str, ip: Ipv4Addr) -> Node {
    Node {
        id,
        hostname: hostname.to_string(),
        ip,
        mac: None,
        kernel: None,
        lease: None,
        stage: NodeStage::Commissioning,
        status: NodeStatus::Unknown,
        control_node: false,
        group: None,
        token: None,
        password: None,
        authorized_keys: None,
        options: NodeOptions::default(),
        labels: Default::default(),
        taints: Vec::new(),
        cores: 0,
        cpu_model: None,
        memory: 0,
        disks: Vec::new(),
        network_interfaces: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

/// Helper to create a test kernel with alpine-style artifact paths
pub fn create_test_kernel(id: u64, name: &str) -> Kernel {
    Kernel {
        id,
        name: name.to_string(),
        version: "3.14.0".to_string(),
        arch: Arch::X86_64,
        vmlinuz: format!("/{}/netboot/vmlinuz-lts", name),
        initramfs: format!("/{}/netboot/initramfs-lts", name),
        modloop: None,
        iso: None,
        repo: None,
        archive: None,
        apkovl: None,
        rootfs: None,
        cmdline: None,
        options: KernelOptions::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

/// Helper to create a test lease served by 10.1.10.1
pub fn create_test_lease(id: u64, ip: Ipv4Addr, mac: &str) -> Lease {
    Lease {
        id,
        ip,
        mac: mac.parse::<MacAddress>().unwrap(),
        node: None,
        next_server: Ipv4Addr::new(10, 1, 10, 1),
        tftp_server: "10.1.10.1".to_string(),
        boot_file: "ipxe.efi".to_string(),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        lease_time: 86400,
        discover_time: None,
        request_time: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

/// Command channel that answers from a fixed table and records every call
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    responses: HashMap<String, String>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `output`
    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses.insert(command.to_string(), output.to_string());
        self
    }

    /// Commands run so far, as `(hostname, command)`
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn exec(&self, node: &Node, command: &str) -> Result<String, PxeError> {
        self.calls
            .lock()
            .unwrap()
            .push((node.hostname.clone(), command.to_string()));
        Ok(self.responses.get(command).cloned().unwrap_or_default())
    }
}
