//! Kickstart generation for unattended installs
//!
//! Renders the kickstart answering every installer prompt, ending in a
//! `poweroff` so the install boot terminates the VM process on completion.
//! Rendering is a pure function of its parameters: identical inputs produce
//! byte-identical output.

use std::fmt::Write as _;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context;
use color_eyre::Result;
use indoc::writedoc;
use tracing::debug;

use crate::config::{Config, NetworkMode};
use crate::utils::CommandRunExt;

/// Volume label the installer probes for a kickstart on auxiliary media
pub const SEED_ISO_LABEL: &str = "OEMDRV";

/// Everything the kickstart template needs
#[derive(Debug, Clone)]
pub struct KickstartParams {
    /// Initial user; "root" suppresses the separate `user` directive
    pub user: String,
    /// Password for the user and root
    pub password: String,
    /// Guest hostname
    pub hostname: String,
    /// Install target disk device (no /dev/ prefix)
    pub disk_device: String,
    /// Locale
    pub lang: String,
    /// Keyboard layout
    pub keyboard: String,
    /// Timezone
    pub timezone: String,
    /// Serial console device for the bootloader append line
    pub console: String,
    /// Network selection
    pub network: NetworkMode,
    /// Packages and groups for the %packages section
    pub packages: Vec<String>,
}

impl KickstartParams {
    /// Assemble kickstart parameters from the run configuration
    pub fn from_config(config: &Config, console: &str) -> Self {
        Self {
            user: config.ssh.user.clone(),
            password: config.ssh.password.clone(),
            hostname: config.kickstart.hostname.clone(),
            disk_device: config.kickstart.disk_device.clone(),
            lang: config.kickstart.lang.clone(),
            keyboard: config.kickstart.keyboard.clone(),
            timezone: config.kickstart.timezone.clone(),
            console: console.to_string(),
            network: config.kickstart.network.clone(),
            packages: config.kickstart.packages.clone(),
        }
    }
}

/// Render the kickstart text
pub fn render(params: &KickstartParams) -> String {
    let mut out = String::new();

    let network_line = match &params.network {
        NetworkMode::Dhcp => format!(
            "network --bootproto=dhcp --device=link --activate --hostname={}",
            params.hostname
        ),
        NetworkMode::Static {
            ip,
            netmask,
            gateway,
            nameserver,
        } => format!(
            "network --bootproto=static --ip={ip} --netmask={netmask} --gateway={gateway} --nameserver={nameserver} --activate --hostname={}",
            params.hostname
        ),
    };

    // Unwrap safety: writing to a String cannot fail
    writedoc!(
        out,
        "
        # Unattended install configuration generated by ksvk
        text
        lang {lang}
        keyboard {keyboard}
        timezone {timezone} --utc
        {network_line}
        rootpw --plaintext {password}
        ",
        lang = params.lang,
        keyboard = params.keyboard,
        timezone = params.timezone,
        password = params.password,
    )
    .unwrap();

    // A root install gets no separate user; anything else gets a wheel
    // account with the same password.
    if params.user != "root" {
        writeln!(
            out,
            "user --name={} --password={} --plaintext --groups=wheel",
            params.user, params.password
        )
        .unwrap();
    }

    writedoc!(
        out,
        "
        firewall --enabled --service=ssh
        selinux --enforcing
        services --enabled=sshd
        bootloader --location=mbr --append=\"console={console},115200\"
        zerombr
        clearpart --all --initlabel --drives={disk}
        autopart --type=lvm
        %packages
        ",
        console = params.console,
        disk = params.disk_device,
    )
    .unwrap();

    for package in &params.packages {
        writeln!(out, "{package}").unwrap();
    }

    writedoc!(
        out,
        "
        %end
        poweroff
        "
    )
    .unwrap();

    out
}

/// Render the kickstart and write it to the given path
pub fn write(params: &KickstartParams, path: &Utf8Path) -> Result<()> {
    let content = render(params);
    std::fs::write(path, content).wrap_err_with(|| format!("Writing kickstart to {path}"))?;
    debug!("Generated kickstart at {path}");
    Ok(())
}

/// Build a small OEMDRV-labeled ISO carrying only ks.cfg
///
/// The installer scans for a volume with this label and picks up the
/// kickstart from it automatically, which avoids remastering the install
/// media entirely.
pub fn create_seed_iso(params: &KickstartParams, workdir: &Utf8Path) -> Result<Utf8PathBuf> {
    let tree = workdir.join("seed_content");
    std::fs::create_dir_all(&tree).wrap_err("Creating seed content directory")?;
    write(params, &tree.join("ks.cfg"))?;

    let seed_iso = workdir.join("seed.iso");
    if seed_iso.exists() {
        std::fs::remove_file(&seed_iso).wrap_err("Removing stale seed ISO")?;
    }

    std::process::Command::new("xorriso")
        .args(["-as", "mkisofs", "-V", SEED_ISO_LABEL, "-o"])
        .arg(seed_iso.as_str())
        .arg(tree.as_str())
        .run_checked()
        .wrap_err("Creating seed ISO")?;
    Ok(seed_iso)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use similar_asserts::assert_eq;

    use super::*;

    fn test_params() -> KickstartParams {
        KickstartParams {
            user: "ci".to_string(),
            password: "hunter2".to_string(),
            hostname: "rhel-ci".to_string(),
            disk_device: "vda".to_string(),
            lang: "en_US.UTF-8".to_string(),
            keyboard: "us".to_string(),
            timezone: "UTC".to_string(),
            console: "ttyS0".to_string(),
            network: NetworkMode::Dhcp,
            packages: vec![
                "@^minimal-environment".to_string(),
                "openssh-server".to_string(),
            ],
        }
    }

    #[test]
    fn test_render_snapshot() {
        let expected = indoc! {r#"
            # Unattended install configuration generated by ksvk
            text
            lang en_US.UTF-8
            keyboard us
            timezone UTC --utc
            network --bootproto=dhcp --device=link --activate --hostname=rhel-ci
            rootpw --plaintext hunter2
            user --name=ci --password=hunter2 --plaintext --groups=wheel
            firewall --enabled --service=ssh
            selinux --enforcing
            services --enabled=sshd
            bootloader --location=mbr --append="console=ttyS0,115200"
            zerombr
            clearpart --all --initlabel --drives=vda
            autopart --type=lvm
            %packages
            @^minimal-environment
            openssh-server
            %end
            poweroff
        "#};
        assert_eq!(render(&test_params()), expected);
    }

    #[test]
    fn test_render_deterministic() {
        let params = test_params();
        assert_eq!(render(&params), render(&params));
    }

    #[test]
    fn test_root_user_omits_user_line() {
        let mut params = test_params();
        params.user = "root".to_string();
        let content = render(&params);
        assert!(!content.contains("user --name"));
        assert!(content.contains("rootpw --plaintext hunter2"));
    }

    #[test]
    fn test_static_network() {
        let mut params = test_params();
        params.network = NetworkMode::Static {
            ip: "192.0.2.10".to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: "192.0.2.1".to_string(),
            nameserver: "192.0.2.1".to_string(),
        };
        let content = render(&params);
        assert!(content.contains("--bootproto=static --ip=192.0.2.10"));
    }

    #[test]
    fn test_ends_with_poweroff() {
        // The install orchestrator waits on VM exit; the poweroff directive
        // is what triggers it.
        assert!(render(&test_params()).trim_end().ends_with("poweroff"));
    }
}
