//! Remote command channel to provisioned nodes
//!
//! Administrative node actions (hardware discovery, reboot, process
//! listing) run shell commands on the target. [`CommandExecutor`] is the
//! seam; [`SshCommandExecutor`] drives the system `ssh` client.

use crate::error::PxeError;
use netboot_store::Node;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Executes a command on a node and returns its standard output
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, node: &Node, command: &str) -> Result<String, PxeError>;
}

/// [`CommandExecutor`] backed by the OpenSSH client in batch mode
#[derive(Debug, Clone)]
pub struct SshCommandExecutor {
    user: String,
    private_key: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl SshCommandExecutor {
    pub fn new(user: impl Into<String>, private_key: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            private_key,
            connect_timeout_secs: 10,
        }
    }

    fn args(&self, node: &Node, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(key) = &self.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.user, node.ip));
        args.push(command.to_string());
        args
    }
}

#[async_trait::async_trait]
impl CommandExecutor for SshCommandExecutor {
    async fn exec(&self, node: &Node, command: &str) -> Result<String, PxeError> {
        debug!("[{}] exec: {}", node.hostname, command);

        let output = Command::new("ssh")
            .args(self.args(node, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PxeError::Command(format!("failed to spawn ssh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PxeError::Command(format!(
                "`{}` on {} exited with {}: {}",
                command,
                node.hostname,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn node() -> Node {
        serde_json::from_value(serde_json::json!({
            "id": 1,
            "hostname": "node-1",
            "ip": "10.1.10.10",
            "createdAt": Utc::now(),
            "updatedAt": Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn test_ssh_args_target_node_ip() {
        let exec = SshCommandExecutor::new("root", Some(PathBuf::from("/etc/netboot/id_ed25519")));
        let args = exec.args(&node(), "ps aux");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/etc/netboot/id_ed25519"));
        assert_eq!(args[args.len() - 2], format!("root@{}", Ipv4Addr::new(10, 1, 10, 10)));
        assert_eq!(args[args.len() - 1], "ps aux");
    }
}
