//! Configuration management for the CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use virtlane_common::LogFormat;
use virtlane_hypervisor::provision::{DISK_GIB_RANGE, MEMORY_MIB_RANGE, VCPU_RANGE};
use virtlane_hypervisor::ProvisionerConfig;

use crate::cli::Args;

/// Location tried when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtlane/virtlane.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hypervisor: HypervisorConfig,
    pub storage: StorageConfig,
    /// Values used when a create command leaves them out
    pub defaults: DefaultsConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Explicit path must exist; the default location is optional.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.uri {
            self.hypervisor.uri = uri.clone();
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Some(ref dir) = args.disk_dir {
            self.storage.disk_dir = PathBuf::from(dir);
        }

        // Searched first, ahead of the configured directories
        if let Some(ref dir) = args.iso_dir {
            self.storage.iso_dirs.insert(0, PathBuf::from(dir));
        }

        if let Some(ref network) = args.default_network {
            self.defaults.network = network.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    /// Reject settings no command could work with.
    pub fn validate(&self) -> Result<()> {
        if self.hypervisor.uri.trim().is_empty() {
            anyhow::bail!("hypervisor.uri must not be empty");
        }
        if self.hypervisor.backend == HypervisorBackend::Libvirt && !virtlane_hypervisor::libvirt::is_available() {
            anyhow::bail!(
                "hypervisor.backend is libvirt but libvirt support is not compiled in; \
                 rebuild with the `libvirt` feature or use --dev"
            );
        }
        for (key, secs) in [
            ("timeouts.install_secs", self.timeouts.install_secs),
            ("timeouts.clone_secs", self.timeouts.clone_secs),
            ("timeouts.query_secs", self.timeouts.query_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", key);
            }
        }
        if !MEMORY_MIB_RANGE.contains(&self.defaults.memory_mib) {
            anyhow::bail!(
                "defaults.memory_mib must be within {}..={} MiB",
                MEMORY_MIB_RANGE.start(),
                MEMORY_MIB_RANGE.end()
            );
        }
        if !VCPU_RANGE.contains(&self.defaults.vcpus) {
            anyhow::bail!(
                "defaults.vcpus must be within {}..={}",
                VCPU_RANGE.start(),
                VCPU_RANGE.end()
            );
        }
        if !DISK_GIB_RANGE.contains(&self.defaults.disk_gib) {
            anyhow::bail!(
                "defaults.disk_gib must be within {}..={} GiB",
                DISK_GIB_RANGE.start(),
                DISK_GIB_RANGE.end()
            );
        }
        if self.defaults.network.trim().is_empty() {
            anyhow::bail!("defaults.network must not be empty");
        }
        self.logging
            .format
            .parse::<LogFormat>()
            .context("invalid logging.format")?;
        Ok(())
    }

    pub fn provisioner(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            disk_dir: self.storage.disk_dir.clone(),
            install_timeout: self.timeouts.install(),
            clone_timeout: self.timeouts.clone_timeout(),
        }
    }
}

/// Hypervisor connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Connection URI
    pub uri: String,
    pub backend: HypervisorBackend,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            backend: HypervisorBackend::Libvirt,
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Libvirt/QEMU backend
    #[default]
    Libvirt,
    /// In-memory backend for development
    Mock,
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where new disk images are created
    pub disk_dir: PathBuf,
    /// Directories searched for install media
    pub iso_dirs: Vec<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_dir: PathBuf::from("/var/lib/libvirt/images"),
            iso_dirs: vec![
                PathBuf::from("/var/lib/libvirt/images"),
                PathBuf::from("/iso"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub network: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_gib: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            memory_mib: 2048,
            vcpus: 2,
            disk_gib: 40,
        }
    }
}

/// Limits for external tools, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub install_secs: u64,
    pub clone_secs: u64,
    /// Listing helpers (`ip`, `osinfo-query`)
    pub query_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            install_secs: 120,
            clone_secs: 600,
            query_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_secs)
    }

    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// `text` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = Config::default();
        assert_eq!(config.hypervisor.uri, "qemu:///system");
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Libvirt);
        assert_eq!(config.validate().is_ok(), virtlane_hypervisor::libvirt::is_available());

        config.hypervisor.backend = HypervisorBackend::Mock;
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.iso_dirs.len(), 2);
        assert_eq!(config.provisioner().install_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
hypervisor:
  uri: qemu+ssh://root@kvm01/system
  backend: mock

storage:
  disk_dir: /srv/images
  iso_dirs:
    - /srv/iso

defaults:
  network: lab
  memory_mib: 4096

timeouts:
  install_secs: 300

logging:
  level: debug
  format: json
"#;

        let config: Config = serde_yaml::from_str(yaml).expect("Failed to parse YAML");

        assert_eq!(config.hypervisor.uri, "qemu+ssh://root@kvm01/system");
        assert_eq!(config.storage.disk_dir, PathBuf::from("/srv/images"));
        assert_eq!(config.storage.iso_dirs, vec![PathBuf::from("/srv/iso")]);
        assert_eq!(config.defaults.network, "lab");
        assert_eq!(config.defaults.memory_mib, 4096);
        // Unset keys keep their defaults
        assert_eq!(config.defaults.vcpus, 2);
        assert_eq!(config.timeouts.install_secs, 300);
        assert_eq!(config.timeouts.clone_secs, 600);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mock_backend_from_yaml() {
        let config: Config = serde_yaml::from_str("hypervisor:\n  backend: mock\n").unwrap();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.uri, "qemu:///system");
    }

    #[test]
    #[test]
    fn test_libvirt_backend_needs_feature() {
        let config = Config::default();
        let result = config.validate();
        if virtlane_hypervisor::libvirt::is_available() {
            assert!(result.is_ok());
        } else {
            let message = result.unwrap_err().to_string();
            assert!(message.contains("libvirt support is not compiled in"));
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let valid = || {
            let mut config = Config::default();
            config.hypervisor.backend = HypervisorBackend::Mock;
            config
        };
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.timeouts.clone_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.defaults.vcpus = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.defaults.memory_mib = 128;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "virtlane",
            "--dev",
            "--uri",
            "test:///default",
            "--iso-dir",
            "/mnt/iso",
            "--default-network",
            "lab",
            "--log-level",
            "warn",
            "vm",
            "list",
        ])
        .unwrap();

        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.hypervisor.uri, "test:///default");
        assert_eq!(config.storage.iso_dirs[0], PathBuf::from("/mnt/iso"));
        assert_eq!(config.storage.iso_dirs.len(), 3);
        assert_eq!(config.defaults.network, "lab");
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_missing_explicit_config() {
        assert!(Config::load("/nonexistent/virtlane.yaml").is_err());
    }
}
