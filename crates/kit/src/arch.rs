//! Architecture detection and configuration utilities
//!
//! This module provides cross-architecture support for QEMU invocation and
//! installer-media conventions, avoiding hardcoded architecture assumptions.

use color_eyre::Result;

/// Architecture configuration for QEMU and installer media
#[derive(Debug, Clone)]
pub struct ArchConfig {
    /// Architecture string (e.g., "x86_64", "aarch64")
    pub arch: &'static str,
    /// QEMU machine type options, without the accel= part
    pub machine: &'static str,
    /// QEMU system emulator binary
    pub emulator: &'static str,
    /// Firmware image required to boot, if any
    pub firmware: Option<&'static str>,
    /// Serial console device the installer should log to
    pub console: &'static str,
    /// Volume label used for the remastered installer ISO
    pub iso_label: &'static str,
}

impl ArchConfig {
    /// Detect host architecture and return appropriate configuration
    pub fn detect() -> Result<Self> {
        Self::from_name(std::env::consts::ARCH)
    }

    /// Look up the configuration for a named architecture
    pub fn from_name(arch: &str) -> Result<Self> {
        match arch {
            "x86_64" => Ok(Self {
                arch: "x86_64",
                machine: "q35",
                emulator: "qemu-system-x86_64",
                firmware: None,
                console: "ttyS0",
                iso_label: "RHEL-10-X86_64",
            }),
            // highmem=on and gic-version=3 for compatibility with large RAM
            "aarch64" => Ok(Self {
                arch: "aarch64",
                machine: "virt,highmem=on,gic-version=3",
                emulator: "qemu-system-aarch64",
                firmware: Some("/usr/share/AAVMF/AAVMF_CODE.fd"),
                console: "ttyAMA0",
                iso_label: "RHEL-10-AARCH64",
            }),
            unsupported => Err(color_eyre::eyre::eyre!(
                "Unsupported architecture: {}. Supported architectures: x86_64, aarch64",
                unsupported
            )),
        }
    }

    /// Build the full -machine argument including the accelerator
    pub fn machine_arg(&self, accel: &str) -> String {
        // The machine type string may already carry options; accel is appended
        // after the base type for both q35 and virt.
        let (base, rest) = match self.machine.split_once(',') {
            Some((base, rest)) => (base, Some(rest)),
            None => (self.machine, None),
        };
        match rest {
            Some(rest) => format!("{base},accel={accel},{rest}"),
            None => format!("{base},accel={accel}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_detection() {
        let arch_config = ArchConfig::detect().unwrap();

        // Should detect the current architecture
        assert_eq!(arch_config.arch, std::env::consts::ARCH);

        // Should have valid configuration
        assert!(!arch_config.machine.is_empty());
        assert!(!arch_config.emulator.is_empty());
        assert!(!arch_config.console.is_empty());
    }

    #[test]
    fn test_from_name() {
        let x86 = ArchConfig::from_name("x86_64").unwrap();
        assert_eq!(x86.emulator, "qemu-system-x86_64");
        assert_eq!(x86.console, "ttyS0");
        assert!(x86.firmware.is_none());

        let arm = ArchConfig::from_name("aarch64").unwrap();
        assert_eq!(arm.emulator, "qemu-system-aarch64");
        assert_eq!(arm.console, "ttyAMA0");
        assert!(arm.firmware.is_some());

        assert!(ArchConfig::from_name("riscv64").is_err());
    }

    #[test]
    fn test_machine_arg() {
        let x86 = ArchConfig::from_name("x86_64").unwrap();
        assert_eq!(x86.machine_arg("kvm"), "q35,accel=kvm");

        let arm = ArchConfig::from_name("aarch64").unwrap();
        assert_eq!(
            arm.machine_arg("tcg"),
            "virt,accel=tcg,highmem=on,gic-version=3"
        );
    }
}
