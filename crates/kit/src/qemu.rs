//! QEMU invocation and VM process lifecycle

use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use color_eyre::eyre::Context;
use color_eyre::Result;
use tracing::{debug, warn};

use crate::arch::ArchConfig;
use crate::utils::CommandRunExt;

/// Complete description of one VM boot
#[derive(Debug, Clone)]
pub struct QemuConfig {
    /// Architecture table entry
    pub arch: ArchConfig,
    /// Memory in MiB
    pub memory_mb: u32,
    /// Number of vCPUs
    pub vcpus: u32,
    /// Primary virtio disk (qcow2)
    pub disk: Utf8PathBuf,
    /// Install media; also switches the boot order to the cdrom
    pub cdrom: Option<Utf8PathBuf>,
    /// Auxiliary cdrom (OEMDRV kickstart seed)
    pub extra_cdrom: Option<Utf8PathBuf>,
    /// Host port forwarded to guest port 22
    pub ssh_port: u16,
    /// Force TCG emulation even when /dev/kvm is usable
    pub disable_kvm: bool,
}

/// Whether hardware acceleration is usable by this process
pub fn host_supports_kvm() -> bool {
    let kvm = std::path::Path::new("/dev/kvm");
    kvm.exists()
        && rustix::fs::access(kvm, rustix::fs::Access::WRITE_OK).is_ok()
}

impl QemuConfig {
    /// Build the QEMU command line
    ///
    /// Falls back from KVM to TCG emulation when /dev/kvm is unavailable,
    /// which is the common case on shared CI runners.
    pub fn to_command(&self) -> Command {
        let accel = if !self.disable_kvm && host_supports_kvm() {
            "kvm"
        } else {
            "tcg"
        };
        let cpu = if accel == "kvm" { "host" } else { "max" };

        let mut cmd = Command::new(self.arch.emulator);
        cmd.args(["-machine", &self.arch.machine_arg(accel)]);
        if let Some(firmware) = self.arch.firmware {
            cmd.args(["-bios", firmware]);
        }
        cmd.args(["-m", &self.memory_mb.to_string()]);
        cmd.args(["-smp", &self.vcpus.to_string()]);
        cmd.args(["-cpu", cpu]);
        cmd.args([
            "-drive",
            &format!("file={},if=virtio,format=qcow2", self.disk),
        ]);
        cmd.args([
            "-netdev",
            &format!("user,id=net0,hostfwd=tcp::{}-:22", self.ssh_port),
        ]);
        cmd.args(["-device", "virtio-net-pci,netdev=net0"]);
        cmd.arg("-nographic");

        if let Some(cdrom) = &self.cdrom {
            cmd.args(["-cdrom", cdrom.as_str()]);
            cmd.args(["-boot", "d"]);
        }
        if let Some(seed) = &self.extra_cdrom {
            cmd.args(["-drive", &format!("file={seed},media=cdrom,readonly=on")]);
        }
        cmd
    }

    /// Spawn the VM with the given stdout disposition
    pub fn spawn(&self, stdout: Stdio) -> Result<VmProcess> {
        let mut cmd = self.to_command();
        debug!("+ {}", cmd.to_string_pretty());
        let child = cmd
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::inherit())
            .spawn()
            .wrap_err("Failed to spawn QEMU")?;
        Ok(VmProcess { child })
    }
}

/// Create the target qcow2 disk image if it does not exist yet
pub fn create_disk_image(path: &camino::Utf8Path, size_bytes: u64) -> Result<()> {
    if path.exists() {
        debug!("Disk image already exists at {path}");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Command::new("qemu-img")
        .args(["create", "-f", "qcow2", path.as_str(), &size_bytes.to_string()])
        .run_checked()
        .wrap_err("Creating disk image")
}

/// A running VM with kill-on-drop semantics
///
/// The pipeline runs one VM at a time; dropping the handle without a clean
/// wait kills the process so a failed step never leaves QEMU running.
#[derive(Debug)]
pub struct VmProcess {
    child: Child,
}

impl VmProcess {
    /// Take the piped stdout for console streaming, if piped at spawn
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().wrap_err("Waiting for QEMU")
    }

    /// Wait for the VM to exit, polling up to the timeout
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// SIGTERM the VM, then SIGKILL it if it ignores the request
    pub fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = rustix::process::Pid::from_raw(self.child.id() as i32);
        if let Some(pid) = pid {
            let _ = rustix::process::kill_process(pid, rustix::process::Signal::TERM);
        }
        if self.wait_timeout(grace)?.is_none() {
            warn!("QEMU did not exit after SIGTERM, killing");
            self.child.kill().wrap_err("Killing QEMU")?;
            self.child.wait().wrap_err("Reaping QEMU")?;
        }
        Ok(())
    }
}

impl Drop for VmProcess {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("Killing still-running VM process");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(cdrom: Option<Utf8PathBuf>) -> QemuConfig {
        QemuConfig {
            arch: ArchConfig::from_name("x86_64").unwrap(),
            memory_mb: 4096,
            vcpus: 2,
            disk: "disk.qcow2".into(),
            cdrom,
            extra_cdrom: None,
            ssh_port: 2222,
            disable_kvm: false,
        }
    }

    #[test]
    fn test_install_boot_command() {
        let cmd = test_config(Some("install-remastered.iso".into())).to_command();
        let rendered = cmd.to_string_pretty();
        assert!(rendered.starts_with("qemu-system-x86_64"));
        assert!(rendered.contains("-cdrom install-remastered.iso"));
        assert!(rendered.contains("-boot d"));
        assert!(rendered.contains("hostfwd=tcp::2222-:22"));
        assert!(rendered.contains("file=disk.qcow2,if=virtio,format=qcow2"));
    }

    #[test]
    fn test_provision_boot_command() {
        let cmd = test_config(None).to_command();
        let rendered = cmd.to_string_pretty();
        assert!(!rendered.contains("-cdrom"));
        assert!(!rendered.contains("-boot d"));
        assert!(rendered.contains("-nographic"));
    }

    #[test]
    fn test_seed_cdrom_attached() {
        let mut config = test_config(Some("install.iso".into()));
        config.extra_cdrom = Some("seed.iso".into());
        let rendered = config.to_command().to_string_pretty();
        assert!(rendered.contains("file=seed.iso,media=cdrom,readonly=on"));
    }
}
