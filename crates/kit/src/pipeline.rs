//! The five-step install pipeline
//!
//! Strictly linear: each step's output is the next step's input, and the
//! first failure aborts the remainder with the step name attached to the
//! error. There is deliberately no retry or partial-continuation logic
//! here; a failed run is simply re-run from the top (the ISO cache makes
//! that cheap).

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use strum::EnumCount;
use tracing::info;

use crate::arch::ArchConfig;
use crate::config::Config;
use crate::install::InstallBootOpts;
use crate::kickstart::KickstartParams;
use crate::provision::ProvisionBootOpts;
use crate::qemu::QemuConfig;
use crate::ssh::SshTarget;
use crate::{fetch, install, kickstart, provision, qemu, remaster};

/// Delay between SSH reachability attempts
pub const SSH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long the guest gets to power itself off after provisioning
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

/// How the kickstart reaches the installer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum KsMedia {
    /// Rebuild the installer ISO with ks.cfg embedded and the boot menu patched
    #[default]
    Remaster,
    /// Attach a small OEMDRV-labeled ISO next to the unmodified installer
    Seed,
}

/// Pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumCount)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    /// Fetch or reuse the installer ISO
    AcquireIso,
    /// Render the unattended-install configuration
    GenerateKickstart,
    /// Produce the boot media carrying the kickstart
    RemasterIso,
    /// Run the unattended install to power-off
    InstallBoot,
    /// Boot the installed disk and run the provisioning commands
    ProvisionBoot,
}

impl Step {
    fn number(self) -> usize {
        self as usize + 1
    }
}

/// Options assembled by the CLI layer
#[derive(Debug)]
pub struct PipelineOpts {
    /// Merged run configuration
    pub config: Config,
    /// Kickstart injection mechanism
    pub ks_media: KsMedia,
    /// Stream the installer console to stderr
    pub console: bool,
    /// Force TCG emulation even when KVM is available
    pub disable_kvm: bool,
    /// Hard limit for the install boot
    pub install_timeout: Duration,
    /// When to take the one-shot installer-log snapshot
    pub hang_snapshot: Duration,
    /// SSH reachability budget for the provisioning boot
    pub ssh_timeout: Duration,
}

fn run_step<T>(step: Step, f: impl FnOnce() -> Result<T>) -> Result<T> {
    info!("[{}/{}] {step}", step.number(), Step::COUNT);
    f().wrap_err_with(|| format!("Pipeline step {step} failed"))
}

/// Execute the whole pipeline
pub fn run(opts: PipelineOpts) -> Result<()> {
    let config = &opts.config;
    config.validate()?;

    let arch = match config.vm.architecture.as_deref() {
        Some(name) => ArchConfig::from_name(name)?,
        None => ArchConfig::detect()?,
    };
    info!(
        "Unattended RHEL install for VM '{}' ({})",
        config.vm.name, arch.arch
    );

    run_step(Step::AcquireIso, || {
        fetch::ensure_iso(&config.iso.path, || config.iso_source())?;
        let len = fetch::verify_readable(&config.iso.path)?;
        info!("Installer ISO: {} ({} MiB)", config.iso.path, len / (1024 * 1024));
        Ok(())
    })?;

    // Run-scoped scratch space for ks.cfg and the optional seed ISO; the
    // guard keeps it alive until the pipeline returns
    let workdir_guard = tempfile::tempdir().wrap_err("Creating working directory")?;
    let workdir = Utf8Path::from_path(workdir_guard.path())
        .ok_or_else(|| eyre!("Non-UTF-8 tempdir path"))?
        .to_owned();

    let ks_params = KickstartParams::from_config(config, arch.console);
    let ks_path = workdir.join("ks.cfg");
    let ks_content = run_step(Step::GenerateKickstart, || {
        let content = kickstart::render(&ks_params);
        std::fs::write(&ks_path, &content)
            .wrap_err_with(|| format!("Writing kickstart to {ks_path}"))?;
        info!("Generated Kickstart file at {ks_path}");
        Ok(content)
    })?;

    let (cdrom, extra_cdrom) = run_step(Step::RemasterIso, || match opts.ks_media {
        KsMedia::Remaster => {
            let output = Utf8PathBuf::from("install-remastered.iso");
            remaster::remaster_iso(&remaster::RemasterRequest {
                source_iso: &config.iso.path,
                kickstart: &ks_content,
                label: arch.iso_label,
                console: arch.console,
                installer_ssh_password: &config.ssh.password,
                output: &output,
            })?;
            Ok((output, None))
        }
        KsMedia::Seed => {
            info!("Building OEMDRV kickstart seed (installer ISO left unmodified)");
            let seed = kickstart::create_seed_iso(&ks_params, &workdir)?;
            Ok((config.iso.path.clone(), Some(seed)))
        }
    })?;

    run_step(Step::InstallBoot, || {
        qemu::create_disk_image(&config.vm.disk_path, config.vm.disk_size)?;
        install::run(InstallBootOpts {
            qemu: QemuConfig {
                arch: arch.clone(),
                memory_mb: config.vm.memory_mb,
                vcpus: config.vm.vcpus,
                disk: config.vm.disk_path.clone(),
                cdrom: Some(cdrom.clone()),
                extra_cdrom: extra_cdrom.clone(),
                ssh_port: config.ssh.port,
                disable_kvm: opts.disable_kvm,
            },
            console: opts.console,
            timeout: opts.install_timeout,
            hang_snapshot: opts.hang_snapshot,
            // The installer's debug sshd always runs as root
            installer_ssh: SshTarget {
                user: "root".to_string(),
                password: config.ssh.password.clone(),
                port: config.ssh.port,
            },
        })
    })?;

    run_step(Step::ProvisionBoot, || {
        provision::run(ProvisionBootOpts {
            qemu: QemuConfig {
                arch: arch.clone(),
                memory_mb: config.vm.memory_mb,
                vcpus: config.vm.vcpus,
                disk: config.vm.disk_path.clone(),
                cdrom: None,
                extra_cdrom: None,
                ssh_port: config.ssh.port,
                disable_kvm: opts.disable_kvm,
            },
            ssh: SshTarget {
                user: config.ssh.user.clone(),
                password: config.ssh.password.clone(),
                port: config.ssh.port,
            },
            commands: provision::provisioning_commands(config),
            ssh_timeout: opts.ssh_timeout,
            poll_interval: SSH_POLL_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    })?;

    info!(
        "All done. Artifacts: {} and {}",
        config.vm.disk_path, cdrom
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        assert_eq!(Step::AcquireIso.to_string(), "acquire-iso");
        assert_eq!(Step::ProvisionBoot.to_string(), "provision-boot");
    }

    #[test]
    fn test_step_numbering() {
        assert_eq!(Step::AcquireIso.number(), 1);
        assert_eq!(Step::ProvisionBoot.number(), 5);
        assert_eq!(Step::COUNT, 5);
    }

    #[test]
    fn test_step_failure_carries_context() {
        let err = run_step(Step::RemasterIso, || -> Result<()> {
            Err(eyre!("xorriso exploded"))
        })
        .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("remaster-iso"));
        assert!(rendered.contains("xorriso exploded"));
    }

    #[test]
    fn test_ks_media_default_is_remaster() {
        assert_eq!(KsMedia::default(), KsMedia::Remaster);
    }
}
