//! First-boot OS configuration documents
//!
//! Builders for the k3os `config.yaml` and the CoreOS Ignition document
//! served to a node once its installer asks for them. Both are pure; the
//! HTTP layer handles node lookups and state transitions.

use crate::config::ClusterConfig;
use base64::Engine;
use netboot_store::Node;
use serde::Serialize;
use std::collections::BTreeMap;

/// k3s API server port on control nodes
pub const K3S_API_PORT: u16 = 6443;

/// k3os `config.yaml`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct K3osConfig {
    pub hostname: String,
    pub ssh_authorized_keys: Vec<String>,
    pub write_files: Vec<serde_json::Value>,
    pub init_cmd: Vec<String>,
    pub boot_cmd: Vec<String>,
    pub run_cmd: Vec<String>,
    pub k3os: K3osSection,
}

/// The `k3os:` section of [`K3osConfig`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct K3osSection {
    pub data_sources: Vec<String>,
    pub modules: Vec<String>,
    pub dns_nameservers: Vec<String>,
    pub ntp_servers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<String>,
    pub k3s_args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

/// Split an `authorized_keys` blob into individual keys
pub fn authorized_key_lines(keys: &str) -> Vec<String> {
    keys.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// k3s arguments for a node's role
///
/// Control nodes initialise the cluster and advertise their own IP; every
/// other node joins as an agent.
pub fn k3s_args(node: &Node, cluster_domain: &str) -> Vec<String> {
    if !node.control_node {
        return vec!["agent".to_string()];
    }

    let mut args = vec![
        "server".to_string(),
        "--cluster-init".to_string(),
        "--disable-cloud-controller".to_string(),
        format!("--cluster-domain={}", cluster_domain),
        "--disable=local-storage".to_string(),
        "--disable=servicelb".to_string(),
        "--disable=traefik".to_string(),
        format!("--tls-san={}", node.ip),
    ];
    if let Some(token) = &node.token {
        args.push(format!("--token={}", token));
    }
    args.extend([
        "--kube-apiserver-arg=service-node-port-range=1-65000".to_string(),
        format!("--kube-apiserver-arg=advertise-address={}", node.ip),
        format!("--kube-apiserver-arg=external-hostname={}", node.ip),
    ]);
    args
}

/// Assemble a node's k3os configuration
///
/// # Arguments
///
/// * `node` - Requesting node
/// * `password` - Console password for the `rancher` user
/// * `control` - Control node to join; ignored for control nodes
/// * `cluster` - Cluster-wide settings
pub fn k3os_config(
    node: &Node,
    password: &str,
    control: Option<&Node>,
    cluster: &ClusterConfig,
) -> K3osConfig {
    let server_url = if node.control_node {
        None
    } else {
        control.map(|c| format!("https://{}:{}", c.ip, K3S_API_PORT))
    };

    K3osConfig {
        hostname: node.hostname.clone(),
        ssh_authorized_keys: node
            .authorized_keys
            .as_deref()
            .map(authorized_key_lines)
            .unwrap_or_default(),
        write_files: cluster.write_files.clone(),
        init_cmd: Vec::new(),
        boot_cmd: Vec::new(),
        run_cmd: Vec::new(),
        k3os: K3osSection {
            data_sources: Vec::new(),
            modules: cluster.modules.clone(),
            dns_nameservers: cluster.dns_nameservers.clone(),
            ntp_servers: cluster.ntp_servers.clone(),
            labels: node.labels.clone(),
            taints: node.taints.clone(),
            k3s_args: k3s_args(node, &cluster.domain),
            token: node.token.clone(),
            password: password.to_string(),
            server_url,
        },
    }
}

/// Ignition v3.3.0 document for CoreOS
///
/// Grants the `core` user the node's SSH keys and writes `/etc/hostname`.
pub fn ignition_config(node: &Node) -> serde_json::Value {
    let keys = node
        .authorized_keys
        .as_deref()
        .map(authorized_key_lines)
        .unwrap_or_default();
    let hostname = base64::engine::general_purpose::STANDARD.encode(format!("{}\n", node.hostname));

    serde_json::json!({
        "ignition": { "version": "3.3.0" },
        "passwd": {
            "users": [
                { "name": "core", "sshAuthorizedKeys": keys }
            ]
        },
        "storage": {
            "files": [
                {
                    "path": "/etc/hostname",
                    "mode": 420,
                    "overwrite": true,
                    "contents": {
                        "source": format!("data:text/plain;charset=utf-8;base64,{}", hostname)
                    }
                }
            ]
        }
    })
}
