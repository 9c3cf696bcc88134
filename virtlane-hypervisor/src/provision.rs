//! Provisioning engine: VM creation with `virt-install` and cloning with
//! `virt-clone`.
//!
//! All input is validated before any file or hypervisor object is touched.
//! Existence checks are a courtesy, not a lock: a concurrent creator can still
//! win the race, in which case the tool's own collision error is reported as
//! `AlreadyExists`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::connection::Connection;
use crate::error::{HypervisorError, ResourceKind, Result};
use crate::inspector::Inspector;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::types::*;

/// Longest accepted VM name.
pub const MAX_VM_NAME: usize = 200;

/// Characters that may not appear in VM, network or snapshot names.
const FORBIDDEN_NAME_CHARS: &str = "!@#$%^&*()+={}[]|\\:;\"'<>?/,";

pub const MEMORY_MIB_RANGE: std::ops::RangeInclusive<u64> = 256..=1_048_576;
pub const VCPU_RANGE: std::ops::RangeInclusive<u32> = 1..=128;
pub const DISK_GIB_RANGE: std::ops::RangeInclusive<u64> = 1..=10_000;

/// Reject names that are empty, too long, or contain shell, path or XML
/// special characters or whitespace.
pub fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() || name.trim() != name {
        return Err(HypervisorError::Validation(format!(
            "name '{}' must be non-empty without surrounding whitespace",
            name
        )));
    }
    if name.chars().count() > max_len {
        return Err(HypervisorError::Validation(format!(
            "name '{}' is longer than {} characters",
            name, max_len
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || FORBIDDEN_NAME_CHARS.contains(*c))
    {
        return Err(HypervisorError::Validation(format!(
            "name '{}' contains invalid character {:?}",
            name, c
        )));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err(HypervisorError::Validation(format!(
            "name '{}' must not start with '-' or '.'",
            name
        )));
    }
    Ok(())
}

fn validate_spec(spec: &VmSpec) -> Result<()> {
    validate_name(&spec.name, MAX_VM_NAME)?;
    validate_name(&spec.network.name, MAX_VM_NAME)?;

    if !MEMORY_MIB_RANGE.contains(&spec.memory_mib) {
        return Err(HypervisorError::Validation(format!(
            "memory {} MiB is outside {}..={}",
            spec.memory_mib,
            MEMORY_MIB_RANGE.start(),
            MEMORY_MIB_RANGE.end()
        )));
    }
    if !VCPU_RANGE.contains(&spec.vcpus) {
        return Err(HypervisorError::Validation(format!(
            "vCPU count {} is outside {}..={}",
            spec.vcpus,
            VCPU_RANGE.start(),
            VCPU_RANGE.end()
        )));
    }
    if !DISK_GIB_RANGE.contains(&spec.disk_gib) {
        return Err(HypervisorError::Validation(format!(
            "disk size {} GiB is outside {}..={}",
            spec.disk_gib,
            DISK_GIB_RANGE.start(),
            DISK_GIB_RANGE.end()
        )));
    }
    let variant_ok = !spec.os_variant.is_empty()
        && spec
            .os_variant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !variant_ok {
        return Err(HypervisorError::Validation(format!(
            "invalid OS variant '{}'",
            spec.os_variant
        )));
    }
    // virt-install splits --disk on commas
    if let Some(path) = &spec.disk_path {
        if path.contains(',') || !Path::new(path).is_absolute() {
            return Err(HypervisorError::Validation(format!(
                "disk path '{}' must be absolute and contain no commas",
                path
            )));
        }
    }
    Ok(())
}

/// Settings for the provisioning engine.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Directory for default disk images
    pub disk_dir: PathBuf,
    pub install_timeout: Duration,
    pub clone_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            disk_dir: PathBuf::from("/var/lib/libvirt/images"),
            install_timeout: Duration::from_secs(120),
            clone_timeout: Duration::from_secs(600),
        }
    }
}

pub struct Provisioner {
    conn: Arc<Connection>,
    inspector: Inspector,
    runner: Arc<dyn CommandRunner>,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(conn: Arc<Connection>, runner: Arc<dyn CommandRunner>, config: ProvisionerConfig) -> Self {
        Self {
            inspector: Inspector::new(conn.clone()),
            conn,
            runner,
            config,
        }
    }

    fn disk_path_for(&self, spec: &VmSpec) -> PathBuf {
        match &spec.disk_path {
            Some(path) => PathBuf::from(path),
            None => self.config.disk_dir.join(format!("{}.qcow2", spec.name)),
        }
    }

    fn install_command(&self, spec: &VmSpec, disk_path: &Path) -> CommandSpec {
        let graphics = match spec.graphics {
            GraphicsMode::None => "--graphics=none".to_string(),
            mode => format!("--graphics={},listen=0.0.0.0", mode.as_str()),
        };
        let cmd = CommandSpec::new("virt-install", self.config.install_timeout).args([
            format!("--connect={}", self.conn.uri()),
            format!("--name={}", spec.name),
            format!("--memory={}", spec.memory_mib),
            format!("--vcpus={}", spec.vcpus),
            format!("--os-variant={}", spec.os_variant),
            format!(
                "--disk=path={},size={},format=qcow2,bus=virtio",
                disk_path.display(),
                spec.disk_gib
            ),
            graphics,
            "--noautoconsole".to_string(),
            format!(
                "--network={}={},model=virtio",
                spec.network.kind.as_str(),
                spec.network.name
            ),
        ]);

        match &spec.install_media {
            Some(iso) => cmd.arg(format!("--cdrom={}", iso)),
            None => cmd.args(["--boot=hd", "--import"]),
        }
    }

    /// Map a failed tool run to an error, keeping stderr verbatim.
    fn tool_failure(tool: &str, vm: &str, output: &CommandOutput) -> HypervisorError {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        if detail.contains("already in use") || detail.contains("already exists") {
            return HypervisorError::already_exists(ResourceKind::Vm, vm);
        }
        HypervisorError::ProvisioningFailed {
            tool: tool.to_string(),
            detail: format!("exit code {}: {}", output.exit_code, detail),
        }
    }

    /// Build a new VM from install media or an existing disk image.
    #[instrument(skip(self, spec), fields(vm = %spec.name))]
    pub async fn create_vm(&self, spec: VmSpec) -> Result<ProvisionOutcome> {
        validate_spec(&spec)?;

        let disk_path = self.disk_path_for(&spec);
        if disk_path.exists() {
            return Err(HypervisorError::already_exists(
                ResourceKind::Disk,
                disk_path.display().to_string(),
            ));
        }
        if self.inspector.vm_exists(&spec.name).await? {
            return Err(HypervisorError::already_exists(ResourceKind::Vm, &spec.name));
        }
        if let Some(iso) = &spec.install_media {
            if !Path::new(iso).is_file() {
                return Err(HypervisorError::not_found(ResourceKind::InstallMedia, iso));
            }
        }

        let cmd = self.install_command(&spec, &disk_path);
        info!(
            disk = %disk_path.display(),
            boot = ?spec.boot_device(),
            timeout_secs = cmd.timeout.as_secs(),
            "Running virt-install"
        );
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "virt-install failed");
            return Err(Self::tool_failure("virt-install", &spec.name, &output));
        }

        let uuid = match self.inspector.domain(&spec.name).await {
            Ok(desc) => desc.uuid,
            Err(e) => {
                warn!(error = %e, "Created VM could not be inspected");
                None
            }
        };
        info!(uuid = ?uuid, "VM created");

        Ok(ProvisionOutcome {
            boot: spec.boot_device(),
            name: spec.name,
            uuid,
            disk_path: disk_path.display().to_string(),
            disk_gib: spec.disk_gib,
            memory_mib: spec.memory_mib,
            vcpus: spec.vcpus,
            network: spec.network,
            graphics: spec.graphics,
            os_variant: spec.os_variant,
            install_media: spec.install_media,
        })
    }

    /// Clone a shut-off VM into an independent copy with fresh UUID, MACs
    /// and disk images.
    #[instrument(skip(self))]
    pub async fn clone_vm(&self, source: &str, new_name: &str) -> Result<CloneOutcome> {
        validate_name(new_name, MAX_VM_NAME)?;

        let runtime = self.inspector.vm_state(source).await?;
        if runtime.active {
            return Err(HypervisorError::PreconditionFailed(format!(
                "VM '{}' must be shut off before cloning (state: {})",
                source, runtime.state
            )));
        }
        if self.inspector.vm_exists(new_name).await? {
            return Err(HypervisorError::already_exists(ResourceKind::Vm, new_name));
        }

        let cmd = CommandSpec::new("virt-clone", self.config.clone_timeout).args([
            format!("--connect={}", self.conn.uri()),
            format!("--original={}", source),
            format!("--name={}", new_name),
            "--auto-clone".to_string(),
        ]);
        info!(timeout_secs = cmd.timeout.as_secs(), "Running virt-clone");
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "virt-clone failed");
            return Err(Self::tool_failure("virt-clone", new_name, &output));
        }

        let mut outcome = CloneOutcome {
            source: source.to_string(),
            name: new_name.to_string(),
            uuid: None,
            macs: Vec::new(),
            disks: Vec::new(),
        };
        match self.inspector.domain(new_name).await {
            Ok(desc) => {
                outcome.uuid = desc.uuid;
                outcome.macs = desc.interfaces.into_iter().filter_map(|i| i.mac).collect();
                outcome.disks = desc
                    .disks
                    .into_iter()
                    .filter(DiskDevice::is_disk)
                    .filter_map(|d| d.source)
                    .collect();
            }
            Err(e) => warn!(error = %e, "Clone could not be inspected"),
        }
        info!(uuid = ?outcome.uuid, "VM cloned");
        Ok(outcome)
    }
}
