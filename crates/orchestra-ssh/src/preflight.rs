//! Node inspector.
//!
//! Runs a fixed battery of shell probes over an open session and produces a
//! compatibility report. Probe failures are split into two classes: cosmetic
//! fields (OS string, kernel, arch, cgroups) degrade to empty values, while
//! anything the cluster software depends on (distribution, CPU count, RAM,
//! kernel modules) adds an error and sinks the verdict.

use crate::client::RemoteSession;
use crate::error::SshError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Linux distributions the cluster software supports.
pub const SUPPORTED_DISTROS: [&str; 6] = ["ubuntu", "debian", "rhel", "centos", "rocky", "almalinux"];

/// Kernel modules that must be loaded for container networking.
const REQUIRED_MODULES: [&str; 2] = ["overlay", "br_netfilter"];

/// Results of all preflight probes on a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightReport {
    pub os: String,
    pub distribution: String,
    pub kernel_version: String,
    pub arch: String,
    pub cpu_cores: i32,
    pub ram_bytes: i64,
    pub cgroups_v2: bool,
    pub compatible: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl PreflightReport {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Run the full probe battery against a connected session.
pub async fn run_preflight(session: &dyn RemoteSession) -> Result<PreflightReport, SshError> {
    let mut report = PreflightReport::default();
    let mut errors = Vec::new();

    // OS and distribution
    let result = session.exec("cat /etc/os-release").await?;
    parse_os_release(&result.stdout, &mut report);

    let dist_lower = report.distribution.to_lowercase();
    let supported = SUPPORTED_DISTROS.iter().any(|d| dist_lower.contains(d));
    if !supported {
        errors.push(format!("unsupported distribution: {}", report.distribution));
    }

    // Kernel version
    match session.exec("uname -r").await {
        Ok(result) => report.kernel_version = result.stdout.trim().to_string(),
        Err(e) => errors.push(format!("failed to get kernel version: {}", e)),
    }

    // CPU architecture
    match session.exec("uname -m").await {
        Ok(result) => report.arch = result.stdout.trim().to_string(),
        Err(e) => errors.push(format!("failed to detect architecture: {}", e)),
    }

    // CPU cores
    match session.exec("nproc").await {
        Ok(result) => match result.stdout.trim().parse::<i32>() {
            Ok(cores) => report.cpu_cores = cores,
            Err(e) => errors.push(format!("failed to parse CPU cores: {}", e)),
        },
        Err(e) => errors.push(format!("failed to detect CPU cores: {}", e)),
    }

    // RAM
    match session
        .exec("grep MemTotal /proc/meminfo | awk '{print $2}'")
        .await
    {
        Ok(result) => match result.stdout.trim().parse::<i64>() {
            Ok(kb) => report.ram_bytes = kb * 1024,
            Err(e) => errors.push(format!("failed to parse RAM: {}", e)),
        },
        Err(e) => errors.push(format!("failed to detect RAM: {}", e)),
    }

    // cgroups v2
    match session.exec("stat -fc %T /sys/fs/cgroup").await {
        Ok(result) => report.cgroups_v2 = result.stdout.trim() == "cgroup2fs",
        Err(e) => errors.push(format!("failed to check cgroups: {}", e)),
    }

    // Essential kernel modules
    for module in REQUIRED_MODULES {
        let cmd = format!(
            "lsmod | grep -q {} && echo 'loaded' || echo 'not_loaded'",
            module
        );
        match session.exec(&cmd).await {
            Ok(result) if result.stdout.trim() == "loaded" => {}
            _ => errors.push(format!("kernel module {} is not loaded", module)),
        }
    }

    report.compatible = errors.is_empty();
    report.errors = errors;

    debug!(
        distribution = %report.distribution,
        compatible = report.compatible,
        "Preflight probes complete"
    );
    Ok(report)
}

fn parse_os_release(content: &str, report: &mut PreflightReport) {
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match key {
            "ID" => report.distribution = value.to_string(),
            "PRETTY_NAME" => report.os = value.to_string(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ExecOutput;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Scripted session: maps command substrings to canned replies.
    struct StubSession {
        replies: HashMap<&'static str, ExecOutput>,
    }

    impl StubSession {
        fn new() -> Self {
            Self {
                replies: HashMap::new(),
            }
        }

        fn reply(mut self, needle: &'static str, stdout: &str) -> Self {
            self.replies.insert(
                needle,
                ExecOutput {
                    stdout: stdout.to_string(),
                    ..Default::default()
                },
            );
            self
        }
    }

    #[async_trait]
    impl RemoteSession for StubSession {
        async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
            for (needle, output) in &self.replies {
                if command.contains(needle) {
                    return Ok(output.clone());
                }
            }
            Ok(ExecOutput {
                exit_code: 1,
                ..Default::default()
            })
        }

        async fn close(&self) {}
    }

    fn healthy_ubuntu() -> StubSession {
        StubSession::new()
            .reply(
                "os-release",
                "PRETTY_NAME=\"Ubuntu 22.04.4 LTS\"\nID=ubuntu\nVERSION_ID=\"22.04\"\n",
            )
            .reply("uname -r", "5.15.0-105-generic\n")
            .reply("uname -m", "x86_64\n")
            .reply("nproc", "8\n")
            .reply("MemTotal", "16384000\n")
            .reply("stat -fc", "cgroup2fs\n")
            .reply("overlay", "loaded\n")
            .reply("br_netfilter", "loaded\n")
    }

    #[tokio::test]
    async fn test_preflight_healthy_node() {
        let session = healthy_ubuntu();
        let report = run_preflight(&session).await.unwrap();

        assert!(report.compatible);
        assert!(report.errors.is_empty());
        assert_eq!(report.os, "Ubuntu 22.04.4 LTS");
        assert_eq!(report.distribution, "ubuntu");
        assert_eq!(report.kernel_version, "5.15.0-105-generic");
        assert_eq!(report.arch, "x86_64");
        assert_eq!(report.cpu_cores, 8);
        assert_eq!(report.ram_bytes, 16384000 * 1024);
        assert!(report.cgroups_v2);
    }

    #[tokio::test]
    async fn test_preflight_rejects_missing_overlay_on_centos() {
        // CentOS is a supported distro, but without the overlay module the
        // node cannot run container workloads.
        let session = StubSession::new()
            .reply("os-release", "PRETTY_NAME=\"CentOS Linux 6\"\nID=centos\n")
            .reply("uname -r", "2.6.32-754.el6.x86_64\n")
            .reply("uname -m", "x86_64\n")
            .reply("nproc", "4\n")
            .reply("MemTotal", "4096000\n")
            .reply("stat -fc", "tmpfs\n")
            .reply("overlay", "not_loaded\n")
            .reply("br_netfilter", "not_loaded\n");

        let report = run_preflight(&session).await.unwrap();

        assert!(!report.compatible);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("overlay")));
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("br_netfilter")));
        assert!(!report.cgroups_v2);
    }

    #[tokio::test]
    async fn test_preflight_unsupported_distro() {
        let mut session = healthy_ubuntu();
        session.replies.insert(
            "os-release",
            ExecOutput {
                stdout: "PRETTY_NAME=\"Arch Linux\"\nID=arch\n".to_string(),
                ..Default::default()
            },
        );

        let report = run_preflight(&session).await.unwrap();
        assert!(!report.compatible);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("unsupported distribution: arch")));
    }

    #[tokio::test]
    async fn test_preflight_bad_nproc_output() {
        let mut session = healthy_ubuntu();
        session.replies.insert(
            "nproc",
            ExecOutput {
                stdout: "not-a-number\n".to_string(),
                ..Default::default()
            },
        );

        let report = run_preflight(&session).await.unwrap();
        assert!(!report.compatible);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("failed to parse CPU cores")));
    }

    #[tokio::test]
    async fn test_report_json_round_trip() {
        let session = healthy_ubuntu();
        let report = run_preflight(&session).await.unwrap();

        let parsed: PreflightReport = serde_json::from_str(&report.to_json()).unwrap();
        assert!(parsed.compatible);
        assert_eq!(parsed.cpu_cores, 8);
    }
}
