//! Lifecycle controller: start, stop, reboot and delete.
//!
//! Start, graceful stop and reboot are asynchronous requests to the guest:
//! success means the hypervisor accepted the request, not that the transition
//! finished. Callers poll state (or use [`Lifecycle::stop_and_wait`]) when
//! they need completion.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::error::{HypervisorError, Result};
use crate::inspector::Inspector;
use crate::types::*;

/// Interval between state polls in [`Lifecycle::stop_and_wait`].
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How to stop a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// ACPI shutdown request; the guest may ignore it
    Graceful,
    /// Immediate power off
    Force,
}

pub struct Lifecycle {
    conn: Arc<Connection>,
    inspector: Inspector,
}

impl Lifecycle {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            inspector: Inspector::new(conn.clone()),
            conn,
        }
    }

    /// Start a VM. Already running is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<LifecycleOutcome> {
        let runtime = self.inspector.vm_state(name).await?;
        if runtime.active {
            debug!(state = %runtime.state, "VM already active");
            return Ok(LifecycleOutcome {
                vm: name.to_string(),
                action: LifecycleAction::Start,
                previous_state: runtime.state,
                changed: false,
                note: format!("VM is already {}", runtime.state),
            });
        }

        self.conn.get()?.start_domain(name).await?;
        info!("VM start accepted");
        Ok(LifecycleOutcome {
            vm: name.to_string(),
            action: LifecycleAction::Start,
            previous_state: runtime.state,
            changed: true,
            note: "start accepted; boot completion is not awaited".to_string(),
        })
    }

    /// Stop a VM. Already shut off is a no-op.
    ///
    /// `Graceful` returns once the shutdown request is sent; the VM may
    /// ignore it. `Force` returns once the VM is halted.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str, mode: StopMode) -> Result<LifecycleOutcome> {
        let runtime = self.inspector.vm_state(name).await?;
        let action = match mode {
            StopMode::Graceful => LifecycleAction::Shutdown,
            StopMode::Force => LifecycleAction::ForceStop,
        };
        if !runtime.active {
            return Ok(LifecycleOutcome {
                vm: name.to_string(),
                action,
                previous_state: runtime.state,
                changed: false,
                note: format!("VM is already {}", runtime.state),
            });
        }

        let backend = self.conn.get()?;
        let note = match mode {
            StopMode::Graceful => {
                backend.shutdown_domain(name).await?;
                info!("Shutdown request sent");
                "shutdown requested; the guest may ignore it, poll state to confirm".to_string()
            }
            StopMode::Force => {
                backend.destroy_domain(name).await?;
                info!("VM force stopped");
                "VM halted".to_string()
            }
        };

        Ok(LifecycleOutcome {
            vm: name.to_string(),
            action,
            previous_state: runtime.state,
            changed: true,
            note,
        })
    }

    /// Request a graceful shutdown and poll until the VM is shut off.
    ///
    /// Fails with `Timeout` if it is still active after `timeout`; the
    /// request is not withdrawn and no force stop is attempted.
    #[instrument(skip(self))]
    pub async fn stop_and_wait(&self, name: &str, timeout: Duration) -> Result<LifecycleOutcome> {
        let mut outcome = self.stop(name, StopMode::Graceful).await?;
        if !outcome.changed {
            return Ok(outcome);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let runtime = self.inspector.vm_state(name).await?;
            if !runtime.active {
                info!("VM reached {}", runtime.state);
                outcome.note = format!("VM is {}", runtime.state);
                return Ok(outcome);
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(state = %runtime.state, "VM did not shut down in time");
                return Err(HypervisorError::Timeout {
                    operation: format!("shutdown of '{}'", name),
                    after: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    /// Send a reboot request to a running VM.
    #[instrument(skip(self))]
    pub async fn reboot(&self, name: &str) -> Result<LifecycleOutcome> {
        let runtime = self.inspector.vm_state(name).await?;
        if runtime.state != VmState::Running {
            return Err(HypervisorError::PreconditionFailed(format!(
                "VM '{}' is {}, reboot requires it to be running",
                name, runtime.state
            )));
        }

        self.conn.get()?.reboot_domain(name).await?;
        info!("Reboot request sent");
        Ok(LifecycleOutcome {
            vm: name.to_string(),
            action: LifecycleAction::Reboot,
            previous_state: runtime.state,
            changed: true,
            note: "reboot requested; completion is not awaited".to_string(),
        })
    }

    /// Remove a shut-off VM's definition, optionally deleting its disk images.
    ///
    /// With `remove_storage`, snapshot metadata, managed save images and NVRAM
    /// go with the definition. Without it the definition is undefined plainly,
    /// so the hypervisor refuses a VM that still has snapshots. Only
    /// file-backed `disk` devices are removed, never install media. A disk
    /// that cannot be removed is reported, not fatal.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str, remove_storage: bool) -> Result<DeleteOutcome> {
        let runtime = self.inspector.vm_state(name).await?;
        if runtime.active {
            return Err(HypervisorError::PreconditionFailed(format!(
                "VM '{}' is {}; stop it before deleting",
                name, runtime.state
            )));
        }

        let disks: Vec<String> = if remove_storage {
            self.inspector
                .domain(name)
                .await?
                .disks
                .into_iter()
                .filter(DiskDevice::is_disk)
                .filter_map(|d| d.source)
                .collect()
        } else {
            Vec::new()
        };

        let flags = if remove_storage {
            UndefineFlags::all()
        } else {
            UndefineFlags::default()
        };
        self.conn.get()?.undefine_domain(name, flags).await?;
        info!("VM undefined");

        let mut outcome = DeleteOutcome {
            vm: name.to_string(),
            removed_storage: Vec::new(),
            storage_errors: Vec::new(),
        };
        for path in disks {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path, "Removed disk image");
                    outcome.removed_storage.push(path);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to remove disk image");
                    outcome.storage_errors.push(format!("{}: {}", path, e));
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;
    use crate::traits::Hypervisor;

    fn setup() -> (Arc<MockBackend>, Lifecycle) {
        let backend = Arc::new(MockBackend::new());
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        let conn = Arc::new(Connection::with_backend(backend.clone()));
        (backend, Lifecycle::new(conn))
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (backend, lifecycle) = setup();

        let first = lifecycle.start("web01").await.unwrap();
        assert!(first.changed);
        assert_eq!(first.previous_state, VmState::Shutoff);

        let second = lifecycle.start("web01").await.unwrap();
        assert!(!second.changed);
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_force_stop_twice() {
        let (backend, lifecycle) = setup();
        lifecycle.start("web01").await.unwrap();

        assert!(lifecycle.stop("web01", StopMode::Force).await.unwrap().changed);
        assert!(!lifecycle.stop("web01", StopMode::Force).await.unwrap().changed);
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::Shutoff);

        lifecycle.start("web01").await.unwrap();
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_reboot_requires_running() {
        let (backend, lifecycle) = setup();
        let err = lifecycle.reboot("web01").await.unwrap_err();
        assert!(matches!(err, HypervisorError::PreconditionFailed(_)));

        lifecycle.start("web01").await.unwrap();
        lifecycle.reboot("web01").await.unwrap();
        assert_eq!(backend.reboot_count("web01").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_vm() {
        let (_, lifecycle) = setup();
        assert!(matches!(
            lifecycle.start("ghost").await,
            Err(HypervisorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_and_wait_times_out_when_ignored() {
        let (backend, lifecycle) = setup();
        lifecycle.start("web01").await.unwrap();
        backend.set_ignores_acpi("web01", true).unwrap();

        let err = lifecycle
            .stop_and_wait("web01", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Timeout { .. }));
        assert_eq!(backend.domain_runtime("web01").await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_stop_and_wait_completes() {
        let (_, lifecycle) = setup();
        lifecycle.start("web01").await.unwrap();
        let outcome = lifecycle.stop_and_wait("web01", Duration::from_secs(5)).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.note, "VM is shutoff");
    }

    #[tokio::test]
    async fn test_delete_running_refused() {
        let (backend, lifecycle) = setup();
        lifecycle.start("web01").await.unwrap();
        let err = lifecycle.delete("web01", true).await.unwrap_err();
        assert!(matches!(err, HypervisorError::PreconditionFailed(_)));
        assert!(backend.domain_exists("web01"));
    }

    #[tokio::test]
    async fn test_delete_keeps_snapshots_unless_storage_removed() {
        let (backend, lifecycle) = setup();
        backend
            .create_snapshot("web01", "<domainsnapshot><name>s1</name></domainsnapshot>")
            .await
            .unwrap();

        let err = lifecycle.delete("web01", false).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Hypervisor { .. }));
        assert!(backend.domain_exists("web01"));

        lifecycle.delete("web01", true).await.unwrap();
        assert!(!backend.domain_exists("web01"));
    }

    #[tokio::test]
    async fn test_delete_without_storage() {
        let (backend, lifecycle) = setup();
        let outcome = lifecycle.delete("web01", false).await.unwrap();
        assert!(outcome.removed_storage.is_empty());
        assert!(!backend.domain_exists("web01"));
    }
}
