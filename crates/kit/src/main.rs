use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::{Report, Result};

mod arch;
mod config;
mod fetch;
mod install;
mod kickstart;
mod pipeline;
mod provision;
mod qemu;
mod remaster;
mod ssh;
mod utils;

/// Unattended RHEL installation in a local QEMU VM.
///
/// ksvk fetches an installer ISO, injects a generated kickstart, boots a VM
/// to perform the install, then boots the installed system and runs a fixed
/// set of provisioning commands over SSH. Intended for CI runners that need
/// a fresh RHEL image and have no pre-built one.
///
/// Configuration comes from an optional config.yaml plus RHEL_* environment
/// variables (ISO source, guest and subscription credentials); the flags
/// below override resource limits and timeouts.
#[derive(Parser, Debug)]
#[clap(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[clap(long, env = "KSVK_CONFIG", default_value = "config.yaml")]
    config: Utf8PathBuf,

    /// Memory for the VM (e.g. "4G", "2048M"; default from config)
    #[clap(long, env = "KSVK_MEMORY")]
    memory: Option<String>,

    /// Number of vCPUs (default from config)
    #[clap(long, env = "KSVK_VCPUS")]
    vcpus: Option<u32>,

    /// Size of the disk image to install to (e.g. "20G"; default from config)
    #[clap(long, env = "KSVK_DISK_SIZE")]
    disk_size: Option<String>,

    /// Path of the qcow2 disk image (default from config)
    #[clap(long, env = "KSVK_DISK")]
    disk: Option<Utf8PathBuf>,

    /// How the kickstart reaches the installer
    #[clap(long, value_enum, default_value_t)]
    ks_media: pipeline::KsMedia,

    /// Hard limit on the install boot, in seconds
    #[clap(long, env = "KSVK_INSTALL_TIMEOUT", default_value_t = 3600)]
    install_timeout: u64,

    /// Seconds after which a still-running install gets its logs snapshotted
    #[clap(long, default_value_t = 1200)]
    hang_snapshot: u64,

    /// SSH reachability budget for the provisioning boot, in seconds
    #[clap(long, env = "KSVK_SSH_TIMEOUT", default_value_t = 300)]
    ssh_timeout: u64,

    /// Disable installer console streaming to the terminal
    #[clap(long)]
    no_console: bool,

    /// Force software emulation (TCG) even when /dev/kvm is available
    #[clap(long, env = "KSVK_NO_KVM")]
    no_kvm: bool,
}

/// Install and configure the tracing/logging system.
///
/// Sets up structured logging with environment-based filtering,
/// error layer integration, and console output formatting.
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

impl Cli {
    /// Merge file/environment configuration with the CLI overrides
    fn into_pipeline_opts(self) -> Result<pipeline::PipelineOpts> {
        let mut config = config::Config::load(&self.config)?;
        if let Some(memory) = &self.memory {
            config.vm.memory_mb = utils::parse_memory_to_mb(memory)?;
        }
        if let Some(vcpus) = self.vcpus {
            config.vm.vcpus = vcpus;
        }
        if let Some(disk_size) = &self.disk_size {
            config.vm.disk_size = utils::parse_size(disk_size)?;
        }
        if let Some(disk) = self.disk {
            config.vm.disk_path = disk;
        }
        Ok(pipeline::PipelineOpts {
            config,
            ks_media: self.ks_media,
            console: !self.no_console,
            disable_kvm: self.no_kvm,
            install_timeout: Duration::from_secs(self.install_timeout),
            hang_snapshot: Duration::from_secs(self.hang_snapshot),
            ssh_timeout: Duration::from_secs(self.ssh_timeout),
        })
    }
}

/// Main entry point for the ksvk CLI.
///
/// Initializes logging and error handling, then runs the five-step
/// pipeline; any step failure propagates as a non-zero exit status with
/// the failing step named in the error chain.
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    pipeline::run(cli.into_pipeline_opts()?)
}
