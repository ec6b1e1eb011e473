//! Install-boot orchestration
//!
//! Boots the VM from the remastered ISO and waits for the unattended
//! install to finish. The kickstart ends in `poweroff`, so "the VM process
//! exited cleanly" is the completion signal; a VM that never exits is a
//! hung or failed install and is killed at the timeout.

use std::io::BufRead;
use std::process::Stdio;
use std::time::{Duration, Instant};

use color_eyre::eyre::eyre;
use color_eyre::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{info, warn};

use crate::qemu::QemuConfig;
use crate::ssh::{self, SshConnectionOptions, SshTarget};
use crate::utils::CommandRunExt;

/// Install-boot options
#[derive(Debug)]
pub struct InstallBootOpts {
    /// VM configuration, with the remastered ISO as cdrom
    pub qemu: QemuConfig,
    /// Stream the installer console to stderr
    pub console: bool,
    /// Hard limit on the whole install
    pub timeout: Duration,
    /// When to take the one-shot diagnostic snapshot of installer logs
    pub hang_snapshot: Duration,
    /// Credentials for the installer's debug sshd (inst.sshd/inst.sshpw)
    pub installer_ssh: SshTarget,
}

/// Create a progress spinner shown while waiting for the installer
fn create_install_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Installing...");
    pb
}

/// Run the unattended install to completion
pub fn run(opts: InstallBootOpts) -> Result<()> {
    info!("Starting unattended install ({})...", opts.qemu.arch.arch);
    info!("+ {}", opts.qemu.to_command().to_string_pretty());

    let stdout = if opts.console {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut vm = opts.qemu.spawn(stdout)?;

    // Forward the installer serial console line by line; the reader thread
    // ends on its own when QEMU closes the pipe.
    if let Some(pipe) = vm.take_stdout() {
        std::thread::spawn(move || {
            let reader = std::io::BufReader::new(pipe);
            for line in reader.lines().map_while(|l| l.ok()) {
                eprintln!("{line}");
            }
        });
    }

    let pb = (!opts.console).then(create_install_progress_bar);

    let start = Instant::now();
    let mut snapshotted = false;
    let status = loop {
        if let Some(status) = vm.try_wait()? {
            break status;
        }
        let elapsed = start.elapsed();
        if !snapshotted && elapsed >= opts.hang_snapshot {
            warn!(
                "Install still running after {}s, collecting installer logs",
                elapsed.as_secs()
            );
            debug_snapshot(&opts.installer_ssh);
            snapshotted = true;
        }
        if elapsed >= opts.timeout {
            vm.terminate(Duration::from_secs(10))?;
            return Err(eyre!(
                "Install did not complete within {}s; killed the VM",
                opts.timeout.as_secs()
            ));
        }
        if let Some(pb) = &pb {
            pb.set_message(format!("Installing... ({}s elapsed)", elapsed.as_secs()));
        }
        std::thread::sleep(Duration::from_secs(1));
    };

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    if !status.success() {
        return Err(eyre!("Installation failed: QEMU exited with {status}"));
    }
    info!("Installation completed; VM powered off after {}s", start.elapsed().as_secs());
    Ok(())
}

/// Best-effort grab of the installer's own logs over its debug sshd
///
/// Runs once when the install looks hung; failures here are only warnings
/// since the VM may be wedged before its network even came up.
fn debug_snapshot(installer_ssh: &SshTarget) {
    info!("Attempting to extract installer logs via SSH...");
    let cmd = "echo '--- STORAGE LOG ---'; cat /tmp/storage.log; \
               echo '--- ANACONDA LOG ---'; tail -n 100 /tmp/anaconda.log";
    match ssh::run_remote(installer_ssh, cmd, &SshConnectionOptions::default()) {
        Ok(output) if output.success() => {
            info!("Installer logs:\n{}", output.stdout);
        }
        Ok(output) => {
            warn!(
                "Installer log extraction exited {}: {}",
                output.exit_code, output.stderr
            );
        }
        Err(e) => {
            warn!("Failed to extract installer logs: {e}");
        }
    }
}
