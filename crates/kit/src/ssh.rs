//! SSH access to the guest
//!
//! All connections go to 127.0.0.1 through the QEMU user-mode port forward.
//! Password authentication is driven through sshpass, matching what the
//! kickstart provisions; host-key checking is disabled since the guest is
//! freshly installed every run.

use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::utils::CommandRunExt;

/// Credentials and forwarded port for one guest
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Login user
    pub user: String,
    /// Login password
    pub password: String,
    /// Forwarded host port
    pub port: u16,
}

/// SSH connection configuration options
#[derive(Debug, Clone)]
pub struct SshConnectionOptions {
    /// Connection timeout in seconds (default: 10)
    pub connect_timeout: u32,
    /// SSH log level (default: ERROR)
    pub log_level: String,
    /// Additional SSH options as key-value pairs
    pub extra_options: Vec<(String, String)>,
}

impl Default for SshConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            log_level: "ERROR".to_string(),
            extra_options: vec![],
        }
    }
}

impl SshConnectionOptions {
    /// Create options suitable for quick connectivity tests (short timeout)
    pub fn for_connectivity_test() -> Self {
        Self {
            connect_timeout: 5,
            log_level: "ERROR".to_string(),
            extra_options: vec![],
        }
    }
}

/// Result of one remote command
#[derive(Debug)]
pub struct RemoteOutput {
    /// Remote exit code; -1 when the connection died on a signal
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl RemoteOutput {
    /// Whether the remote command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn ssh_command(target: &SshTarget, options: &SshConnectionOptions) -> Command {
    let mut cmd = Command::new("sshpass");
    cmd.args(["-p", &target.password, "ssh"]);
    cmd.args(["-p", &target.port.to_string()]);
    cmd.args(["-o", "PreferredAuthentications=password"]);
    cmd.args(["-o", "PubkeyAuthentication=no"]);
    cmd.args(["-o", "StrictHostKeyChecking=no"]);
    cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
    cmd.args(["-o", &format!("ConnectTimeout={}", options.connect_timeout)]);
    cmd.args(["-o", &format!("LogLevel={}", options.log_level)]);
    for (key, value) in &options.extra_options {
        cmd.args(["-o", &format!("{key}={value}")]);
    }
    cmd.arg(format!("{}@127.0.0.1", target.user));
    cmd
}

/// Run a command in the guest, capturing output and exit status
pub fn run_remote(
    target: &SshTarget,
    command: &str,
    options: &SshConnectionOptions,
) -> Result<RemoteOutput> {
    let mut cmd = ssh_command(target, options);
    cmd.arg("--").arg(command);
    debug!("+ {}", cmd.to_string_pretty());
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .wrap_err("Failed to execute SSH command")?;
    Ok(RemoteOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

/// Wait for SSH to be ready by polling connection attempts
///
/// Attempts to connect to the VM via SSH until successful or timeout.
/// A guest that never becomes reachable fails the run here instead of
/// hanging it.
pub fn wait_for_ssh_ready(target: &SshTarget, timeout: Duration, interval: Duration) -> Result<()> {
    debug!(
        "Polling SSH connectivity on port {} (timeout: {}s)...",
        target.port,
        timeout.as_secs()
    );
    let start_time = Instant::now();
    let options = SshConnectionOptions::for_connectivity_test();

    while start_time.elapsed() < timeout {
        // Just run 'true' to test connectivity
        if let Ok(output) = run_remote(target, "true", &options) {
            if output.success() {
                debug!("SSH connection successful, VM is ready");
                return Ok(());
            }
            debug!(
                "SSH not ready yet: {}",
                output.stderr.lines().last().unwrap_or("no output")
            );
        }
        thread::sleep(interval);
    }

    Err(eyre!(
        "Timeout waiting for SSH connectivity after {}s",
        timeout.as_secs()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_connection_options() {
        let default_opts = SshConnectionOptions::default();
        assert_eq!(default_opts.connect_timeout, 10);
        assert_eq!(default_opts.log_level, "ERROR");
        assert!(default_opts.extra_options.is_empty());

        let test_opts = SshConnectionOptions::for_connectivity_test();
        assert_eq!(test_opts.connect_timeout, 5);
    }

    #[test]
    fn test_ssh_command_shape() {
        let target = SshTarget {
            user: "ci".to_string(),
            password: "pw".to_string(),
            port: 2222,
        };
        let cmd = ssh_command(&target, &SshConnectionOptions::default());
        let rendered = cmd.to_string_pretty();
        assert!(rendered.starts_with("sshpass -p pw ssh -p 2222"));
        assert!(rendered.contains("StrictHostKeyChecking=no"));
        assert!(rendered.ends_with("ci@127.0.0.1"));
    }

    #[test]
    fn test_reachability_times_out() {
        // Port 1 on localhost refuses immediately; the poll loop must give
        // up once the budget is spent rather than spin forever.
        let target = SshTarget {
            user: "root".to_string(),
            password: "pw".to_string(),
            port: 1,
        };
        let start = Instant::now();
        let r = wait_for_ssh_ready(&target, Duration::from_millis(200), Duration::from_millis(50));
        assert!(r.is_err());
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}
