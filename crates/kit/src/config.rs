//! Run configuration loading
//!
//! Configuration comes from an optional `config.yaml` plus `RHEL_*`
//! environment variable overrides; the environment always wins so secrets
//! never need to live in the file. CLI flags layer on top of this in main.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;
use yaml_rust2::{Yaml, YamlLoader};

/// Placeholder credential value treated the same as "not configured"
pub const SUBSCRIPTION_PLACEHOLDER: &str = "CHANGE_ME";

const GIB: u64 = 1024 * 1024 * 1024;

/// Virtual machine shape and target disk
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Name used in logs only
    pub name: String,
    /// Explicit architecture override; host architecture when unset
    pub architecture: Option<String>,
    /// Memory in MiB
    pub memory_mb: u32,
    /// Number of vCPUs
    pub vcpus: u32,
    /// Target disk size in bytes
    pub disk_size: u64,
    /// Path of the qcow2 disk image the installer writes to
    pub disk_path: Utf8PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "rhel-ci".to_string(),
            architecture: None,
            memory_mb: 4096,
            vcpus: 2,
            disk_size: 20 * GIB,
            disk_path: "disk.qcow2".into(),
        }
    }
}

/// Where to fetch the installer ISO from when it is not cached locally
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Transfer mechanism: "sftp" selects scp; anything else means HTTP
    pub method: Option<String>,
    /// HTTP(S) URL of the ISO
    pub url: Option<String>,
    /// SFTP host
    pub sftp_host: Option<String>,
    /// SFTP port
    pub sftp_port: u16,
    /// Path of the ISO on the SFTP host; a `.gz` suffix triggers decompression
    pub sftp_remote_path: Option<String>,
    /// SFTP user (environment only)
    pub sftp_user: Option<String>,
    /// SFTP password (environment only)
    pub sftp_password: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            method: None,
            url: None,
            sftp_host: None,
            sftp_port: 22,
            sftp_remote_path: None,
            sftp_user: None,
            sftp_password: None,
        }
    }
}

/// Installer ISO location and acquisition settings
#[derive(Debug, Clone)]
pub struct IsoConfig {
    /// Local cache path of the installer ISO
    pub path: Utf8PathBuf,
    /// Download source used when the cache misses
    pub download: DownloadConfig,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            path: default_iso_path(),
            download: DownloadConfig::default(),
        }
    }
}

fn default_iso_path() -> Utf8PathBuf {
    dirs::cache_dir()
        .and_then(|d| Utf8PathBuf::from_path_buf(d).ok())
        .map(|d| d.join("ksvk").join("install.iso"))
        .unwrap_or_else(|| "downloads/install.iso".into())
}

/// Guest credentials, shared by the kickstart and the provisioning SSH client
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Initial user created by the kickstart ("root" suppresses the user line)
    pub user: String,
    /// Password for both the user and root
    pub password: String,
    /// Host TCP port forwarded to guest port 22
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
            port: 2222,
        }
    }
}

/// Red Hat subscription credentials for the provisioning phase
#[derive(Debug, Clone, Default)]
pub struct SubscriptionConfig {
    /// Subscription account name
    pub username: Option<String>,
    /// Subscription account password
    pub password: Option<String>,
}

impl SubscriptionConfig {
    /// Whether registration should be attempted at all
    pub fn is_usable(&self) -> bool {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) => {
                !u.is_empty() && !p.is_empty() && u != SUBSCRIPTION_PLACEHOLDER
            }
            _ => false,
        }
    }
}

/// Guest network selection for the kickstart `network` directive
#[derive(Debug, Clone, Default)]
pub enum NetworkMode {
    /// DHCP on the first connected interface
    #[default]
    Dhcp,
    /// Static addressing
    Static {
        /// Guest IP address
        ip: String,
        /// Netmask
        netmask: String,
        /// Default gateway
        gateway: String,
        /// Nameserver
        nameserver: String,
    },
}

/// Install choices rendered into the kickstart
#[derive(Debug, Clone)]
pub struct KickstartSettings {
    /// Target disk device inside the guest (virtio disks show up as vda)
    pub disk_device: String,
    /// Guest hostname
    pub hostname: String,
    /// Locale
    pub lang: String,
    /// Keyboard layout
    pub keyboard: String,
    /// Timezone
    pub timezone: String,
    /// Network selection
    pub network: NetworkMode,
    /// Package selection (groups and package names)
    pub packages: Vec<String>,
}

impl Default for KickstartSettings {
    fn default() -> Self {
        Self {
            disk_device: "vda".to_string(),
            hostname: "rhel-ci".to_string(),
            lang: "en_US.UTF-8".to_string(),
            keyboard: "us".to_string(),
            timezone: "UTC".to_string(),
            network: NetworkMode::default(),
            packages: vec![
                "@^minimal-environment".to_string(),
                "openssh-server".to_string(),
            ],
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// VM shape
    pub vm: VmConfig,
    /// Installer ISO settings
    pub iso: IsoConfig,
    /// Guest credentials
    pub ssh: SshConfig,
    /// Subscription credentials
    pub subscription: SubscriptionConfig,
    /// Kickstart parameters
    pub kickstart: KickstartSettings,
}

/// A resolved ISO acquisition mechanism
#[derive(Debug, Clone)]
pub enum IsoSource {
    /// Plain HTTP(S) download
    Http {
        /// Source URL
        url: String,
    },
    /// scp from a remote host with password authentication
    Sftp {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
        /// Path of the image on the remote host
        remote_path: String,
        /// Login user
        user: String,
        /// Login password
        password: String,
    },
}

impl Config {
    /// Load configuration: file (when present), then environment overrides
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let mut cfg = Config::default();
        if path.exists() {
            let s = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Reading {path}"))?;
            let docs =
                YamlLoader::load_from_str(&s).wrap_err_with(|| format!("Parsing {path}"))?;
            if let Some(doc) = docs.first() {
                cfg.merge_yaml(doc)?;
            }
        } else {
            debug!("No configuration file at {path}, using defaults");
        }
        cfg.apply_env_overrides(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    fn merge_yaml(&mut self, doc: &Yaml) -> Result<()> {
        let vm = &doc["vm"];
        if let Some(v) = vm["name"].as_str() {
            self.vm.name = v.to_string();
        }
        if let Some(v) = vm["architecture"].as_str() {
            self.vm.architecture = Some(v.to_string());
        }
        if let Some(v) = vm["memory_mb"].as_i64() {
            self.vm.memory_mb = v as u32;
        }
        if let Some(v) = vm["cpu_cores"].as_i64() {
            self.vm.vcpus = v as u32;
        }
        if let Some(v) = vm["disk_size_gb"].as_i64() {
            self.vm.disk_size = (v as u64) * GIB;
        }
        if let Some(v) = vm["disk_path"].as_str() {
            self.vm.disk_path = v.into();
        }

        let os = &doc["os"];
        if let Some(v) = os["iso_path"].as_str() {
            self.iso.path = v.into();
        }
        let dl = &os["download"];
        if let Some(v) = dl["method"].as_str() {
            self.iso.download.method = Some(v.to_string());
        }
        if let Some(v) = dl["url"].as_str() {
            self.iso.download.url = Some(v.to_string());
        }
        let sftp = &dl["sftp"];
        if let Some(v) = sftp["host"].as_str() {
            self.iso.download.sftp_host = Some(v.to_string());
        }
        if let Some(v) = sftp["port"].as_i64() {
            self.iso.download.sftp_port = v as u16;
        }
        if let Some(v) = sftp["remote_path"].as_str() {
            self.iso.download.sftp_remote_path = Some(v.to_string());
        }

        let ssh = &doc["ssh"];
        if let Some(v) = ssh["user"].as_str() {
            self.ssh.user = v.to_string();
        }
        if let Some(v) = ssh["password"].as_str() {
            self.ssh.password = v.to_string();
        }
        if let Some(v) = ssh["port"].as_i64() {
            self.ssh.port = v as u16;
        }

        let sub = &doc["subscription"];
        if let Some(v) = sub["username"].as_str() {
            self.subscription.username = Some(v.to_string());
        }
        if let Some(v) = sub["password"].as_str() {
            self.subscription.password = Some(v.to_string());
        }

        let ks = &doc["kickstart"];
        if let Some(v) = ks["disk_device"].as_str() {
            self.kickstart.disk_device = v.to_string();
        }
        if let Some(v) = ks["hostname"].as_str() {
            self.kickstart.hostname = v.to_string();
        }
        if let Some(v) = ks["lang"].as_str() {
            self.kickstart.lang = v.to_string();
        }
        if let Some(v) = ks["keyboard"].as_str() {
            self.kickstart.keyboard = v.to_string();
        }
        if let Some(v) = ks["timezone"].as_str() {
            self.kickstart.timezone = v.to_string();
        }
        let net = &ks["network"];
        if net.as_str() == Some("dhcp") {
            self.kickstart.network = NetworkMode::Dhcp;
        } else if net["bootproto"].as_str() == Some("static") {
            match (
                net["ip"].as_str(),
                net["netmask"].as_str(),
                net["gateway"].as_str(),
                net["nameserver"].as_str(),
            ) {
                (Some(ip), Some(netmask), Some(gateway), Some(nameserver)) => {
                    self.kickstart.network = NetworkMode::Static {
                        ip: ip.to_string(),
                        netmask: netmask.to_string(),
                        gateway: gateway.to_string(),
                        nameserver: nameserver.to_string(),
                    };
                }
                _ => {
                    return Err(eyre!(
                        "Static network config requires ip, netmask, gateway, and nameserver"
                    ))
                }
            }
        }
        if let Some(v) = ks["packages"].as_vec() {
            let packages: Vec<String> = v
                .iter()
                .filter_map(|p| p.as_str().map(str::to_owned))
                .collect();
            if !packages.is_empty() {
                self.kickstart.packages = packages;
            }
        }
        Ok(())
    }

    /// Apply `RHEL_*` environment overrides; the lookup function is injected
    /// so tests don't have to mutate the process environment.
    pub(crate) fn apply_env_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("RHEL_SSH_USER") {
            self.ssh.user = v;
        }
        if let Some(v) = get("RHEL_SSH_PASS") {
            self.ssh.password = v;
        }
        if let Some(v) = get("RHEL_SUB_USER") {
            self.subscription.username = Some(v);
        }
        if let Some(v) = get("RHEL_SUB_PASS") {
            self.subscription.password = Some(v);
        }
        if let Some(v) = get("RHEL_ISO_URL") {
            self.iso.download.url = Some(v);
        }
        if let Some(v) = get("RHEL_SFTP_HOST") {
            self.iso.download.sftp_host = Some(v);
        }
        if let Some(v) = get("RHEL_SFTP_USER") {
            self.iso.download.sftp_user = Some(v);
        }
        if let Some(v) = get("RHEL_SFTP_PASS") {
            self.iso.download.sftp_password = Some(v);
        }
    }

    /// Check parameters every later step depends on
    pub fn validate(&self) -> Result<()> {
        if self.ssh.password.is_empty() {
            return Err(eyre!(
                "Guest password not set; provide ssh.password in config.yaml or RHEL_SSH_PASS"
            ));
        }
        if self.vm.memory_mb == 0 || self.vm.vcpus == 0 {
            return Err(eyre!("VM memory and vCPU count must be non-zero"));
        }
        if self.vm.disk_size == 0 {
            return Err(eyre!("VM disk size must be non-zero"));
        }
        Ok(())
    }

    /// Resolve the configured download mechanism, if any
    ///
    /// Mirrors the precedence the tool has always had: an explicit
    /// `method: sftp` selects scp and then requires host and credentials;
    /// otherwise a URL (config or `RHEL_ISO_URL`) selects HTTP.
    pub fn iso_source(&self) -> Result<Option<IsoSource>> {
        let dl = &self.iso.download;
        if dl.method.as_deref() == Some("sftp") {
            let host = dl
                .sftp_host
                .clone()
                .ok_or_else(|| eyre!("SFTP host must be set via RHEL_SFTP_HOST or config.yaml"))?;
            let remote_path = dl
                .sftp_remote_path
                .clone()
                .ok_or_else(|| eyre!("SFTP remote_path must be set in config.yaml"))?;
            let (user, password) = match (dl.sftp_user.clone(), dl.sftp_password.clone()) {
                (Some(u), Some(p)) => (u, p),
                _ => {
                    return Err(eyre!(
                        "RHEL_SFTP_USER and RHEL_SFTP_PASS must be set for SFTP download"
                    ))
                }
            };
            return Ok(Some(IsoSource::Sftp {
                host,
                port: dl.sftp_port,
                remote_path,
                user,
                password,
            }));
        }
        Ok(dl.url.clone().map(|url| IsoSource::Http { url }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(s: &str) -> Config {
        let mut cfg = Config::default();
        let docs = YamlLoader::load_from_str(s).unwrap();
        cfg.merge_yaml(&docs[0]).unwrap();
        cfg
    }

    #[test]
    fn test_merge_yaml() {
        let cfg = parse(indoc! {"
            vm:
              name: test-vm
              architecture: aarch64
              memory_mb: 8192
              cpu_cores: 4
              disk_size_gb: 40
            os:
              iso_path: /tmp/test.iso
              download:
                method: sftp
                sftp:
                  host: mirror.example.com
                  port: 2022
                  remote_path: /isos/rhel.iso.gz
            ssh:
              user: ci
              password: hunter2
              port: 2201
            kickstart:
              packages:
                - '@^server-product-environment'
                - vim-enhanced
        "});
        assert_eq!(cfg.vm.name, "test-vm");
        assert_eq!(cfg.vm.architecture.as_deref(), Some("aarch64"));
        assert_eq!(cfg.vm.memory_mb, 8192);
        assert_eq!(cfg.vm.vcpus, 4);
        assert_eq!(cfg.vm.disk_size, 40 * GIB);
        assert_eq!(cfg.iso.path, "/tmp/test.iso");
        assert_eq!(cfg.iso.download.sftp_port, 2022);
        assert_eq!(cfg.ssh.user, "ci");
        assert_eq!(cfg.ssh.port, 2201);
        assert_eq!(
            cfg.kickstart.packages,
            vec!["@^server-product-environment", "vim-enhanced"]
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|k| match k {
            "RHEL_SSH_PASS" => Some("secret".to_string()),
            "RHEL_SUB_USER" => Some("alice".to_string()),
            "RHEL_SUB_PASS" => Some("p".to_string()),
            "RHEL_ISO_URL" => Some("https://example.com/rhel.iso".to_string()),
            _ => None,
        });
        assert_eq!(cfg.ssh.password, "secret");
        assert!(cfg.subscription.is_usable());
        assert!(matches!(
            cfg.iso_source().unwrap(),
            Some(IsoSource::Http { .. })
        ));
    }

    #[test]
    fn test_sftp_requires_credentials() {
        let mut cfg = parse(indoc! {"
            os:
              download:
                method: sftp
                sftp:
                  host: mirror.example.com
                  remote_path: /isos/rhel.iso
        "});
        // No credentials in the environment
        assert!(cfg.iso_source().is_err());

        cfg.apply_env_overrides(|k| match k {
            "RHEL_SFTP_USER" => Some("u".to_string()),
            "RHEL_SFTP_PASS" => Some("p".to_string()),
            _ => None,
        });
        assert!(matches!(
            cfg.iso_source().unwrap(),
            Some(IsoSource::Sftp { port: 22, .. })
        ));
    }

    #[test]
    fn test_network_modes() {
        let cfg = parse(indoc! {"
            kickstart:
              network:
                bootproto: static
                ip: 192.0.2.10
                netmask: 255.255.255.0
                gateway: 192.0.2.1
                nameserver: 192.0.2.1
        "});
        assert!(matches!(
            cfg.kickstart.network,
            NetworkMode::Static { .. }
        ));

        // Partial static addressing is a configuration error, not a silent
        // fallback to DHCP
        let mut cfg = Config::default();
        let docs = YamlLoader::load_from_str(indoc! {"
            kickstart:
              network:
                bootproto: static
                ip: 192.0.2.10
        "})
        .unwrap();
        assert!(cfg.merge_yaml(&docs[0]).is_err());
    }

    #[test]
    fn test_subscription_placeholder_not_usable() {
        let sub = SubscriptionConfig {
            username: Some(SUBSCRIPTION_PLACEHOLDER.to_string()),
            password: Some("x".to_string()),
        };
        assert!(!sub.is_usable());
        assert!(!SubscriptionConfig::default().is_usable());
    }

    #[test]
    fn test_validate() {
        let mut cfg = Config::default();
        // Default config has no password
        assert!(cfg.validate().is_err());
        cfg.ssh.password = "pw".to_string();
        assert!(cfg.validate().is_ok());
    }
}
