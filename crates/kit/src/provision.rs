//! Provisioning-boot orchestration
//!
//! Boots the installed disk, waits for the guest's sshd to come up, then
//! walks a fixed ordered command list. The first failing command stops the
//! run and is reported with its output; on success the guest is powered
//! off through systemd.

use std::process::Stdio;
use std::time::Duration;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::qemu::{QemuConfig, VmProcess};
use crate::ssh::{self, RemoteOutput, SshConnectionOptions, SshTarget};

/// Provisioning lifecycle states, in the order a successful run visits them
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProvisionState {
    /// VM process started, guest still coming up
    Booting,
    /// Polling for a reachable sshd
    WaitingForReachability,
    /// Walking the command list
    Executing,
    /// Guest asked to power off
    ShuttingDown,
    /// Pipeline step finished
    Done,
    /// Terminal state reached from any of the above
    Failed,
}

fn trace_state(state: ProvisionState) {
    info!("provisioning state: {state}");
}

/// One remote provisioning command
#[derive(Debug, Clone)]
pub struct ProvisionCommand {
    /// Human-readable description for logs and errors
    pub description: String,
    /// Shell command executed in the guest
    pub command: String,
    /// Whether a non-zero exit aborts the run
    pub fatal: bool,
}

impl ProvisionCommand {
    fn new(description: &str, command: impl Into<String>) -> Self {
        Self {
            description: description.to_string(),
            command: command.into(),
            fatal: true,
        }
    }
}

/// Build the fixed provisioning command list from the run configuration
pub fn provisioning_commands(config: &Config) -> Vec<ProvisionCommand> {
    let mut commands = Vec::new();

    if config.subscription.is_usable() {
        if let (Some(user), Some(password)) = (
            config.subscription.username.as_deref(),
            config.subscription.password.as_deref(),
        ) {
            commands.push(ProvisionCommand {
                description: "Registering Red Hat subscription".to_string(),
                command: format!(
                    "subscription-manager register --username {user} --password {password}"
                ),
                // Updates may still work from pre-configured repos
                fatal: false,
            });
        }
    } else {
        info!("Skipping subscription registration (credentials not provided or default).");
    }

    commands.push(ProvisionCommand::new(
        "Updating system packages",
        "sudo dnf update -y",
    ));
    commands.push(ProvisionCommand::new(
        "Installing Podman and Nginx",
        "sudo dnf install -y container-tools nginx",
    ));
    commands.push(ProvisionCommand::new(
        "Enabling and starting Nginx",
        "sudo systemctl enable --now nginx",
    ));
    for fw_cmd in [
        "sudo firewall-cmd --permanent --add-service=http",
        "sudo firewall-cmd --permanent --add-service=https",
        "sudo firewall-cmd --reload",
    ] {
        commands.push(ProvisionCommand::new(
            &format!("Configuring firewall: {fw_cmd}"),
            fw_cmd,
        ));
    }
    commands.push(ProvisionCommand::new(
        "Setting up custom Nginx landing page",
        "cd /usr/share/nginx/html && \
         sudo mv index.html index.html.bak 2>/dev/null || true && \
         echo '<h1>Hello! Nginx is running on my RHEL VM.</h1>' | sudo tee index.html",
    ));
    commands.push(ProvisionCommand::new(
        "Verifying Nginx installation",
        "curl -s http://localhost | grep -q 'Nginx is running on my RHEL VM'",
    ));
    commands.push(ProvisionCommand::new(
        "Checking Podman version",
        "podman --version",
    ));
    commands.push(ProvisionCommand::new(
        "Demonstrating SELinux enforcement",
        "getenforce && sudo restorecon -v /usr/share/nginx/html/index.html && \
         ls -Z /usr/share/nginx/html/index.html",
    ));

    commands
}

/// Provisioning-boot options
#[derive(Debug)]
pub struct ProvisionBootOpts {
    /// VM configuration booting from the installed disk (no cdrom)
    pub qemu: QemuConfig,
    /// Guest credentials
    pub ssh: SshTarget,
    /// Ordered command list
    pub commands: Vec<ProvisionCommand>,
    /// Reachability budget
    pub ssh_timeout: Duration,
    /// Delay between reachability attempts
    pub poll_interval: Duration,
    /// How long to wait for the guest to power itself off
    pub shutdown_grace: Duration,
}

/// Boot the installed system and run the provisioning sequence
pub fn run(opts: ProvisionBootOpts) -> Result<()> {
    trace_state(ProvisionState::Booting);
    info!(
        "Starting VM ({}) for post-install configuration...",
        opts.qemu.arch.arch
    );
    let mut vm = opts.qemu.spawn(Stdio::null())?;

    // The VmProcess drop guard kills the VM on any error path below
    let result = provision(&opts, &mut vm);
    if result.is_err() {
        trace_state(ProvisionState::Failed);
    }
    result
}

fn provision(opts: &ProvisionBootOpts, vm: &mut VmProcess) -> Result<()> {
    if let Some(status) = vm.try_wait()? {
        return Err(eyre!("VM exited before provisioning began: {status}"));
    }

    trace_state(ProvisionState::WaitingForReachability);
    ssh::wait_for_ssh_ready(&opts.ssh, opts.ssh_timeout, opts.poll_interval)?;

    execute_commands(&opts.commands, |c| {
        ssh::run_remote(&opts.ssh, &c.command, &SshConnectionOptions::default())
    })?;

    trace_state(ProvisionState::ShuttingDown);
    // The poweroff races the SSH connection teardown; either outcome is fine
    let _ = ssh::run_remote(
        &opts.ssh,
        "sudo systemctl poweroff",
        &SshConnectionOptions::default(),
    );
    if vm.wait_timeout(opts.shutdown_grace)?.is_none() {
        warn!("Guest did not power off on its own; terminating the VM");
        vm.terminate(Duration::from_secs(10))?;
    }

    trace_state(ProvisionState::Done);
    Ok(())
}

/// Walk the command list in order, halting at the first fatal failure
///
/// Commands after a failure never run; the error carries the failing
/// command and its captured output for the CI log.
fn execute_commands<F>(commands: &[ProvisionCommand], mut run_cmd: F) -> Result<()>
where
    F: FnMut(&ProvisionCommand) -> Result<RemoteOutput>,
{
    for (i, command) in commands.iter().enumerate() {
        trace_state(ProvisionState::Executing);
        info!(
            "[{}/{}] {}...",
            i + 1,
            commands.len(),
            command.description
        );
        let output = run_cmd(command)?;
        if output.success() {
            info!("[Success] {}", command.description);
            if !output.stdout.is_empty() {
                debug!("{}", output.stdout);
            }
        } else if command.fatal {
            return Err(eyre!(
                "{} failed with status {}\nCommand: {}\nError output: {}",
                command.description,
                output.exit_code,
                command.command,
                output.stderr
            ));
        } else {
            warn!(
                "{} failed with status {} (continuing): {}",
                command.description, output.exit_code, output.stderr
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_output() -> RemoteOutput {
        RemoteOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn failed_output(code: i32) -> RemoteOutput {
        RemoteOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: "boom".to_string(),
        }
    }

    fn fixed_commands(n: usize) -> Vec<ProvisionCommand> {
        (0..n)
            .map(|i| ProvisionCommand::new(&format!("step {i}"), format!("cmd-{i}")))
            .collect()
    }

    #[test]
    fn test_halts_at_first_failure() {
        let commands = fixed_commands(5);
        let mut executed = Vec::new();
        let result = execute_commands(&commands, |c| {
            executed.push(c.command.clone());
            if executed.len() == 3 {
                Ok(failed_output(1))
            } else {
                Ok(ok_output())
            }
        });

        let err = result.unwrap_err();
        assert!(err.to_string().contains("step 2"));
        assert!(err.to_string().contains("boom"));
        // Commands after the failing one never ran
        assert_eq!(executed, vec!["cmd-0", "cmd-1", "cmd-2"]);
    }

    #[test]
    fn test_non_fatal_failure_continues() {
        let mut commands = fixed_commands(3);
        commands[0].fatal = false;
        let mut count = 0;
        let result = execute_commands(&commands, |_| {
            count += 1;
            if count == 1 {
                Ok(failed_output(70))
            } else {
                Ok(ok_output())
            }
        });
        assert!(result.is_ok());
        assert_eq!(count, 3);
    }

    #[test]
    fn test_all_success_runs_everything() {
        let commands = fixed_commands(4);
        let mut count = 0;
        execute_commands(&commands, |_| {
            count += 1;
            Ok(ok_output())
        })
        .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_command_list_order() {
        let mut config = Config::default();
        config.subscription.username = Some("alice".to_string());
        config.subscription.password = Some("pw".to_string());

        let commands = provisioning_commands(&config);
        assert!(commands[0].command.starts_with("subscription-manager register"));
        assert!(!commands[0].fatal);
        assert!(commands[1].command.contains("dnf update"));

        // The landing page is written before the curl verification reads it
        let page = commands
            .iter()
            .position(|c| c.command.contains("tee index.html"))
            .unwrap();
        let verify = commands
            .iter()
            .position(|c| c.command.starts_with("curl"))
            .unwrap();
        assert!(page < verify);

        // SELinux demonstration comes last
        assert!(commands.last().unwrap().command.contains("getenforce"));
    }

    #[test]
    fn test_command_list_without_subscription() {
        let commands = provisioning_commands(&Config::default());
        assert!(commands[0].command.contains("dnf update"));
        assert!(commands.iter().all(|c| c.fatal));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            ProvisionState::WaitingForReachability.to_string(),
            "waiting-for-reachability"
        );
        assert_eq!(ProvisionState::ShuttingDown.to_string(), "shutting-down");
    }
}
