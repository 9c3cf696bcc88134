//! Snapshot manager.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tracing::{info, instrument, warn};

use crate::connection::Connection;
use crate::error::{HypervisorError, ResourceKind, Result};
use crate::inspector::Inspector;
use crate::provision::validate_name;
use crate::types::*;
use crate::xml::snapshot_xml;

/// Longest accepted snapshot name.
const MAX_SNAPSHOT_NAME: usize = 200;

pub struct Snapshots {
    conn: Arc<Connection>,
    inspector: Inspector,
}

impl Snapshots {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            inspector: Inspector::new(conn.clone()),
            conn,
        }
    }

    /// Capture a snapshot. A running VM gets disk plus memory, a shut-off
    /// one disk only; the outcome says which.
    #[instrument(skip(self, description))]
    pub async fn create(&self, vm: &str, name: &str, description: Option<&str>) -> Result<SnapshotOutcome> {
        validate_name(name, MAX_SNAPSHOT_NAME)?;

        let runtime = self.inspector.vm_state(vm).await?;
        let backend = self.conn.get()?;
        if backend.list_snapshots(vm).await?.iter().any(|s| s == name) {
            return Err(HypervisorError::already_exists(ResourceKind::Snapshot, name));
        }

        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "Snapshot created by virtlane on {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
                )
            });
        backend.create_snapshot(vm, &snapshot_xml(name, &description)).await?;

        let kind = SnapshotKind::from_memory(runtime.active);
        info!(kind = ?kind, state = %runtime.state, "Snapshot created");
        Ok(SnapshotOutcome {
            vm: vm.to_string(),
            snapshot: name.to_string(),
            description,
            kind,
            vm_state: runtime.state,
        })
    }

    /// Every snapshot of a VM, oldest first. Entries whose metadata cannot be
    /// read are returned by name only, with a warning.
    #[instrument(skip(self))]
    pub async fn list(&self, vm: &str) -> Result<Listing<SnapshotInfo>> {
        let backend = self.conn.get()?;
        let names = backend.list_snapshots(vm).await?;

        let mut listing = Listing::default();
        for name in names {
            let decoded = match backend.snapshot_xml(vm, &name).await {
                Ok(xml) => self.conn.decoder().decode_snapshot(&xml),
                Err(e) => Err(e),
            };
            match decoded {
                Ok(desc) => listing.items.push(SnapshotInfo {
                    name: desc.name,
                    description: desc.description,
                    created_at: desc
                        .created_at
                        .and_then(|t| Utc.timestamp_opt(t, 0).single()),
                    state: desc.state,
                    kind: Some(SnapshotKind::from_memory(desc.has_memory)),
                }),
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Snapshot metadata unreadable");
                    listing.warnings.push(format!("{}: {}", name, e));
                    listing.items.push(SnapshotInfo {
                        name,
                        description: None,
                        created_at: None,
                        state: None,
                        kind: None,
                    });
                }
            }
        }

        // Stable: same-second snapshots keep the hypervisor's order
        listing.items.sort_by_key(|s| s.created_at);
        Ok(listing)
    }

    async fn require_snapshot(&self, vm: &str, name: &str) -> Result<()> {
        self.inspector.vm_state(vm).await?;
        if !self.conn.get()?.list_snapshots(vm).await?.iter().any(|s| s == name) {
            return Err(HypervisorError::not_found(ResourceKind::Snapshot, name));
        }
        Ok(())
    }

    /// Restore a VM to a snapshot, discarding everything since.
    #[instrument(skip(self))]
    pub async fn revert(&self, vm: &str, name: &str) -> Result<VmState> {
        self.require_snapshot(vm, name).await?;
        self.conn.get()?.revert_snapshot(vm, name).await?;

        let state = self.inspector.vm_state(vm).await?.state;
        info!(state = %state, "VM reverted to snapshot");
        Ok(state)
    }

    /// Delete a snapshot. Irreversible.
    #[instrument(skip(self))]
    pub async fn delete(&self, vm: &str, name: &str) -> Result<()> {
        self.require_snapshot(vm, name).await?;
        self.conn.get()?.delete_snapshot(vm, name).await?;
        info!("Snapshot deleted");
        Ok(())
    }
}
