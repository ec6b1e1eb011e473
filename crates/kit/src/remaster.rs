//! Installer ISO remastering
//!
//! Unpacks the vendor ISO, drops the generated kickstart into the tree,
//! patches the bootloader configuration so the installer loads it without
//! interaction, and repacks a bootable image. The unpack/repack both go
//! through xorriso, so no loop mounts or elevated privileges are needed.

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::utils::CommandRunExt;

/// Inputs for one remastering pass
#[derive(Debug)]
pub struct RemasterRequest<'a> {
    /// Source installer ISO
    pub source_iso: &'a Utf8Path,
    /// Rendered kickstart content to embed as /ks.cfg
    pub kickstart: &'a str,
    /// Volume label for the output image; also referenced by inst.ks
    pub label: &'a str,
    /// Serial console device for installer output
    pub console: &'a str,
    /// Password for the installer's debug sshd (inst.sshpw)
    pub installer_ssh_password: &'a str,
    /// Where to write the remastered ISO
    pub output: &'a Utf8Path,
}

/// Remaster the installer ISO per the request
pub fn remaster_iso(req: &RemasterRequest) -> Result<()> {
    if !req.source_iso.exists() {
        return Err(eyre!("Installer ISO not found at {}", req.source_iso));
    }
    info!("Remastering {} with embedded kickstart", req.source_iso);

    // The working tree is discarded wholesale on any failure; the next run
    // starts from a fresh extraction.
    let workdir = tempfile::tempdir().wrap_err("Creating remaster workdir")?;
    let tree = workdir.path().join("iso_contents");
    let tree = Utf8Path::from_path(&tree).ok_or_else(|| eyre!("Non-UTF-8 tempdir path"))?;
    std::fs::create_dir(tree)?;

    // Extract the ISO filesystem tree (osirrox is xorriso's extraction mode)
    std::process::Command::new("xorriso")
        .args(["-osirrox", "on", "-indev", req.source_iso.as_str()])
        .args(["-extract", "/", tree.as_str()])
        .run_checked()
        .wrap_err("Extracting ISO contents")?;

    // Extracted files keep the read-only ISO9660 permissions
    std::process::Command::new("chmod")
        .args(["-R", "u+w", tree.as_str()])
        .run_checked()
        .wrap_err("Making ISO tree writable")?;

    std::fs::write(tree.join("ks.cfg"), req.kickstart).wrap_err("Embedding ks.cfg")?;

    let grub_cfg_path = tree.join("EFI/BOOT/grub.cfg");
    if grub_cfg_path.exists() {
        let content = std::fs::read_to_string(&grub_cfg_path).wrap_err("Reading grub.cfg")?;
        let patched = patch_grub_cfg(
            &content,
            req.label,
            req.console,
            req.installer_ssh_password,
        )?;
        std::fs::write(&grub_cfg_path, patched).wrap_err("Writing patched grub.cfg")?;
        debug!("Patched {grub_cfg_path}");
    } else {
        warn!("grub.cfg not found at {grub_cfg_path}; boot menu left unmodified");
    }

    // -e/-isohybrid-gpt-basdat reproduce the EFI boot layout of the source
    std::process::Command::new("xorriso")
        .args(["-as", "mkisofs", "-r", "-J"])
        .args(["-V", req.label])
        .args(["-e", "images/efiboot.img", "-no-emul-boot"])
        .arg("-isohybrid-gpt-basdat")
        .args(["-o", req.output.as_str()])
        .arg(tree.as_str())
        .run_checked()
        .wrap_err("Building remastered ISO")?;

    info!("Remastered ISO written to {}", req.output);
    Ok(())
}

/// Patch a grub.cfg so the install menu entry boots unattended
///
/// Pure string transformation: forces a short timeout and the first menu
/// entry, and rewrites the `linux` lines of install entries to reference
/// the remastered volume label and the embedded kickstart. Media check is
/// dropped since the checksum no longer matches after remastering.
pub fn patch_grub_cfg(
    content: &str,
    label: &str,
    console: &str,
    installer_ssh_password: &str,
) -> Result<String> {
    let label_re = Regex::new(r"hd:LABEL=[^ ]+").wrap_err("Compiling label pattern")?;

    // inst.sshd allows debugging via ssh during the install;
    // inst.sshpw sets a known password for that session.
    let kickstart_args = format!(
        " inst.ks=hd:LABEL={label}:/ks.cfg inst.text inst.sshd inst.sshpw={installer_ssh_password} inst.debug console={console},115200 plymouth.enable=0"
    );

    let mut in_install = false;
    let mut patched = Vec::new();
    for line in content.lines() {
        let mut line = line.to_string();
        if line.trim_start().starts_with("set timeout=") {
            line = "set timeout=1".to_string();
        }
        if line.trim_start().starts_with("set default=") {
            line = "set default=0".to_string();
        }
        if line.contains("menuentry") && line.to_lowercase().contains("install") {
            in_install = true;
        } else if line.contains("menuentry") && in_install && line.contains('}') {
            in_install = false;
        }
        if in_install && line.trim_start().starts_with("linux") {
            line = label_re
                .replace_all(&line, format!("hd:LABEL={label}"))
                .into_owned();
            line = line.replace("rd.live.check", "");
            if !line.contains("inst.ks") {
                line.push_str(&kickstart_args);
            }
        }
        patched.push(line);
    }
    Ok(patched.join("\n"))
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use similar_asserts::assert_eq;

    use super::*;

    const SAMPLE: &str = indoc! {r#"
        set default="1"
        set timeout=60
        menuentry 'Install Red Hat Enterprise Linux 10' --class fedora --class gnu-linux {
        	linuxefi /images/pxeboot/vmlinuz inst.stage2=hd:LABEL=RHEL-10-0-BaseOS-x86_64 rd.live.check quiet
        	initrdefi /images/pxeboot/initrd.img
        }
        menuentry 'Test this media & install Red Hat Enterprise Linux 10' --class fedora {
        	linuxefi /images/pxeboot/vmlinuz inst.stage2=hd:LABEL=RHEL-10-0-BaseOS-x86_64 rd.live.check quiet
        	initrdefi /images/pxeboot/initrd.img
        }
    "#};

    #[test]
    fn test_patch_grub_cfg() {
        let patched = patch_grub_cfg(SAMPLE, "RHEL-10-X86_64", "ttyS0", "password").unwrap();

        assert!(patched.contains("set timeout=1"));
        assert!(patched.contains("set default=0"));
        assert!(!patched.contains("rd.live.check"));
        assert!(patched.contains("hd:LABEL=RHEL-10-X86_64:/ks.cfg"));
        assert!(patched.contains("inst.sshpw=password"));
        assert!(patched.contains("console=ttyS0,115200"));
        // The label rewrite applies to the stage2 reference too
        assert!(patched.contains("inst.stage2=hd:LABEL=RHEL-10-X86_64"));
        assert!(!patched.contains("BaseOS"));
    }

    #[test]
    fn test_patch_inserts_kickstart_once_per_entry() {
        let patched = patch_grub_cfg(SAMPLE, "L", "ttyS0", "pw").unwrap();
        assert_eq!(patched.matches("inst.ks=").count(), 2);

        // Re-patching is idempotent on the kickstart argument
        let repatched = patch_grub_cfg(&patched, "L", "ttyS0", "pw").unwrap();
        assert_eq!(repatched.matches("inst.ks=").count(), 2);
    }

    #[test]
    fn test_patch_leaves_non_install_lines_alone() {
        let content = indoc! {"
            set timeout=60
            menuentry 'Troubleshooting -->' {
            	linuxefi /images/pxeboot/vmlinuz rescue
            }
        "};
        let patched = patch_grub_cfg(content, "L", "ttyS0", "pw").unwrap();
        assert!(!patched.contains("inst.ks="));
        assert!(patched.contains("rescue"));
    }
}
