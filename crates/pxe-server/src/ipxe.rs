//! iPXE boot script generator
//!
//! Turns a (node, kernel, lease) triple into the script a machine runs after
//! chain-loading the iPXE binary. Output is a pure function of the inputs:
//! no clocks, no randomness, no I/O.
//!
//! Every script starts with a diagnostic preamble (next-server, filename,
//! MAC and IP) and the `vmlinuz`/`initramfs` variables. The OS-specific
//! section is selected by kernel name:
//!
//! - `alpine`: netboot with modloop, package repo, optional apkovl overlay
//!   and an `ssh_keys` URL
//! - `k3os`: unattended install, all install parameters on the kernel line
//! - `coreos`: live rootfs plus Ignition first-boot config
//!
//! Any other kernel name yields the preamble only.

use crate::cloud_config;
use netboot_store::{Kernel, Lease, Node};
use std::fmt::Write;
use std::net::Ipv4Addr;

/// Fallback install target when commissioning has not picked one
pub const DEFAULT_INSTALL_DISK: &str = "/dev/sda";

/// Fixed pause after debug diagnostics
const DEBUG_SLEEP_SECS: u32 = 10;

/// Boot script generator
#[derive(Debug, Clone)]
pub struct BootScriptGenerator {
    /// Port of the HTTP mirror as seen by booting machines
    http_port: u16,
    /// Emit `ifstat`/`route`/`ipstat` and a pause before booting
    debug: bool,
    /// k3s cluster domain for control-node arguments
    cluster_domain: String,
}

impl BootScriptGenerator {
    pub fn new(http_port: u16, debug: bool, cluster_domain: impl Into<String>) -> Self {
        Self {
            http_port,
            debug,
            cluster_domain: cluster_domain.into(),
        }
    }

    fn port_suffix(&self) -> String {
        if self.http_port == 80 {
            String::new()
        } else {
            format!(":{}", self.http_port)
        }
    }

    /// Resolve an artifact path against iPXE's `${next-server}`
    fn artifact_url(&self, path: &str) -> String {
        if is_absolute_url(path) {
            return path.to_string();
        }
        format!("http://${{next-server}}{}{}", self.port_suffix(), with_leading_slash(path))
    }

    /// Resolve a path against a concrete server address
    fn server_url(&self, server: Ipv4Addr, path: &str) -> String {
        if is_absolute_url(path) {
            return path.to_string();
        }
        format!("http://{}{}{}", server, self.port_suffix(), with_leading_slash(path))
    }

    /// Generate the boot script for `node`
    ///
    /// # Arguments
    ///
    /// * `node` - Booting node
    /// * `kernel` - Kernel the node is assigned
    /// * `lease` - Node's current lease (supplies next-server, MAC and IP)
    ///
    /// # Returns
    ///
    /// Script text beginning with `#!ipxe`
    pub fn generate(&self, node: &Node, kernel: &Kernel, lease: &Lease) -> String {
        let mut script = String::new();
        self.preamble(&mut script, node, kernel, lease);

        match kernel.name.as_str() {
            "alpine" => self.alpine(&mut script, kernel),
            "k3os" => self.k3os(&mut script, node, kernel, lease),
            "coreos" => self.coreos(&mut script, kernel, lease),
            _ => {}
        }

        script
    }

    fn preamble(&self, script: &mut String, node: &Node, kernel: &Kernel, lease: &Lease) {
        script.push_str("#!ipxe\n\n");
        let _ = writeln!(script, "echo Booting {} with {} {}", node.hostname, kernel.name, kernel.version);
        script.push_str("echo next-server ${next-server}\n");
        script.push_str("echo filename ${filename}\n");
        let _ = writeln!(script, "echo mac {}", lease.mac);
        let _ = writeln!(script, "echo ip {}", lease.ip);

        if self.debug {
            script.push_str("ifstat\nroute\nipstat\n");
            let _ = writeln!(script, "sleep {}", DEBUG_SLEEP_SECS);
        }

        script.push('\n');
        let _ = writeln!(script, "set vmlinuz {}", self.artifact_url(&kernel.vmlinuz));
        let _ = writeln!(script, "set initramfs {}", self.artifact_url(&kernel.initramfs));
    }

    fn alpine(&self, script: &mut String, kernel: &Kernel) {
        let mut line = String::from("kernel ${vmlinuz}");

        let _ = writeln!(script, "set cmdline {}", kernel.cmdline.as_deref().unwrap_or("ip=dhcp"));
        line.push_str(" ${cmdline}");

        if let Some(modloop) = &kernel.modloop {
            let _ = writeln!(script, "set modloop {}", self.artifact_url(modloop));
            line.push_str(" modloop=${modloop}");
        }
        if let Some(repo) = &kernel.repo {
            let _ = writeln!(script, "set repo {}", self.artifact_url(repo));
            line.push_str(" alpine_repo=${repo}");
        }
        if let Some(apkovl) = &kernel.apkovl {
            let _ = write!(line, " apkovl={}", self.artifact_url(apkovl));
        }
        let _ = write!(line, " ssh_keys={}", self.artifact_url("/ssh_keys"));

        script.push('\n');
        script.push_str(&line);
        script.push_str("\ninitrd ${initramfs}\nboot\n");
    }

    fn k3os(&self, script: &mut String, node: &Node, kernel: &Kernel, lease: &Lease) {
        let options = &kernel.options;
        let install_disk = node
            .options
            .install_disk
            .clone()
            .or_else(|| {
                options
                    .extra
                    .get("install_device")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_INSTALL_DISK.to_string());
        let config_url = self.server_url(
            lease.next_server,
            options.config_url.as_deref().unwrap_or("/k3os/config"),
        );

        let mut line = String::from("kernel ${vmlinuz}");
        if let Some(cmdline) = &kernel.cmdline {
            let _ = write!(line, " {}", cmdline);
        }
        if let Some(mode) = &options.mode {
            let _ = write!(line, " k3os.mode={}", mode);
        }
        if let Some(silent) = options.silent {
            let _ = write!(line, " k3os.install.silent={}", silent);
        }
        if let Some(poweroff) = options.poweroff {
            let _ = write!(line, " k3os.install.power_off={}", poweroff);
        }
        let _ = write!(line, " k3os.install.config_url={}", config_url);
        let _ = write!(line, " k3os.install.device={}", install_disk);
        if let Some(iso) = &kernel.iso {
            let _ = write!(line, " k3os.install.iso_url={}", self.server_url(lease.next_server, iso));
        }
        for arg in cloud_config::k3s_args(node, &self.cluster_domain) {
            let _ = write!(line, " k3os.k3s_args={}", arg);
        }

        script.push_str("imgfree\n\n");
        script.push_str(&line);
        script.push_str("\ninitrd ${initramfs}\nboot\n");
    }

    fn coreos(&self, script: &mut String, kernel: &Kernel, lease: &Lease) {
        let config_url = self.server_url(
            lease.next_server,
            kernel.options.config_url.as_deref().unwrap_or("/coreos/ignition"),
        );

        let mut line = String::from("kernel ${vmlinuz} initrd=main");
        if let Some(rootfs) = &kernel.rootfs {
            let _ = write!(line, " coreos.live.rootfs_url={}", self.server_url(lease.next_server, rootfs));
        }
        line.push_str(" ignition.firstboot ignition.platform.id=metal");
        let _ = write!(line, " ignition.config.url={}", config_url);
        if let Some(cmdline) = &kernel.cmdline {
            let _ = write!(line, " {}", cmdline);
        }

        script.push('\n');
        script.push_str(&line);
        script.push_str("\ninitrd --name main ${initramfs}\nboot\n");
    }
}

fn is_absolute_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
