//! Integration tests for the orchestration core.
//!
//! Every manager runs against the in-memory backend and the simulated
//! provisioning tools, sharing one connection the way the CLI does.

use std::sync::Arc;
use std::time::Duration;

use virtlane_hypervisor::{
    CommandOutput, Connection, ErrorKind, ErrorReport, Hypervisor, HypervisorError, Inspector,
    InterfaceSpec, Lifecycle, MockBackend, MockRunner, NetworkSpec, Networks, Provisioner,
    ProvisionerConfig, ResourceKind, ScriptedResponse, Snapshots, StopMode, VmSpec, VmState,
};

struct Harness {
    backend: Arc<MockBackend>,
    runner: Arc<MockRunner>,
    conn: Arc<Connection>,
    disk_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_runner(|backend| MockRunner::new(backend).with_disk_files(true))
    }

    fn with_runner(build: impl FnOnce(Arc<MockBackend>) -> MockRunner) -> Self {
        let backend = Arc::new(MockBackend::new());
        backend.seed_vm("web01", 2048, 2, "default").unwrap();
        let runner = Arc::new(build(backend.clone()));
        let conn = Arc::new(Connection::with_backend(backend.clone()));
        Self {
            backend,
            runner,
            conn,
            disk_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::new(self.conn.clone())
    }

    fn networks(&self) -> Networks {
        Networks::new(self.conn.clone())
    }

    fn snapshots(&self) -> Snapshots {
        Snapshots::new(self.conn.clone())
    }

    fn provisioner(&self) -> Provisioner {
        self.provisioner_with_timeout(Duration::from_secs(5))
    }

    fn provisioner_with_timeout(&self, timeout: Duration) -> Provisioner {
        let config = ProvisionerConfig {
            disk_dir: self.disk_dir.path().to_path_buf(),
            install_timeout: timeout,
            clone_timeout: timeout,
        };
        Provisioner::new(self.conn.clone(), self.runner.clone(), config)
    }

    async fn state(&self, vm: &str) -> VmState {
        self.backend.domain_runtime(vm).await.unwrap().state
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Starting a running VM succeeds and changes nothing.
#[tokio::test]
async fn test_start_running_vm_is_noop() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();

    lifecycle.start("web01").await.unwrap();
    let again = lifecycle.start("web01").await.unwrap();

    assert!(!again.changed);
    assert_eq!(again.previous_state, VmState::Running);
    assert_eq!(h.state("web01").await, VmState::Running);
}

/// Force stop twice, then start: both stops succeed and the VM ends up running.
#[tokio::test]
async fn test_force_stop_then_start() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    lifecycle.start("web01").await.unwrap();

    let first = lifecycle.stop("web01", StopMode::Force).await.unwrap();
    let second = lifecycle.stop("web01", StopMode::Force).await.unwrap();
    assert!(first.changed);
    assert!(!second.changed);

    lifecycle.start("web01").await.unwrap();
    assert_eq!(h.state("web01").await, VmState::Running);
}

/// Graceful stop only sends the request; the guest finishes on its own.
#[tokio::test]
async fn test_graceful_stop_is_signal_and_return() {
    let h = Harness::new();
    let lifecycle = h.lifecycle();
    lifecycle.start("web01").await.unwrap();

    let outcome = lifecycle.stop("web01", StopMode::Graceful).await.unwrap();
    assert!(outcome.changed);
    assert_eq!(h.state("web01").await, VmState::ShuttingDown);
    assert_eq!(h.state("web01").await, VmState::Shutoff);
}

/// Deleting with storage removes the definition and the disk image file.
#[tokio::test]
async fn test_delete_removes_storage() {
    let h = Harness::new();
    let created = h.provisioner().create_vm(VmSpec::new("db01")).await.unwrap();
    assert!(std::path::Path::new(&created.disk_path).exists());

    let lifecycle = h.lifecycle();
    lifecycle.stop("db01", StopMode::Force).await.unwrap();
    let outcome = lifecycle.delete("db01", true).await.unwrap();

    assert_eq!(outcome.removed_storage, vec![created.disk_path.clone()]);
    assert!(outcome.storage_errors.is_empty());
    assert!(!std::path::Path::new(&created.disk_path).exists());
    assert!(!h.backend.domain_exists("db01"));
}

/// A missing disk image is reported, not fatal.
#[tokio::test]
async fn test_delete_reports_missing_storage() {
    let h = Harness::new();
    let outcome = h.lifecycle().delete("web01", true).await.unwrap();

    assert!(outcome.removed_storage.is_empty());
    assert_eq!(outcome.storage_errors.len(), 1);
    assert!(!h.backend.domain_exists("web01"));
}

// =============================================================================
// Networks
// =============================================================================

/// A new /24 gets the first host as gateway, a DHCP range inside the hosts,
/// and is active right away.
#[tokio::test]
async fn test_create_network_lab1() {
    let h = Harness::new();
    let outcome = h
        .networks()
        .create_network(NetworkSpec::new("lab1", "10.10.10.0/24"))
        .await
        .unwrap();

    assert_eq!(outcome.gateway, "10.10.10.1");
    assert_eq!(outcome.netmask, "255.255.255.0");
    assert_eq!(outcome.bridge, "virbr-lab1");
    assert!(outcome.active);

    let range = outcome.dhcp_range.unwrap();
    let start: std::net::Ipv4Addr = range.start.parse().unwrap();
    let end: std::net::Ipv4Addr = range.end.parse().unwrap();
    assert!(start >= "10.10.10.2".parse::<std::net::Ipv4Addr>().unwrap());
    assert!(end <= "10.10.10.254".parse::<std::net::Ipv4Addr>().unwrap());
    assert!(start < end);

    let info = Inspector::new(h.conn.clone()).get_network("lab1").await.unwrap();
    assert!(info.summary.active);
    assert_eq!(info.summary.subnet.as_deref(), Some("10.10.10.0/24"));
}

/// An active network cannot be deleted; stopping it first allows the delete.
#[tokio::test]
async fn test_delete_network_requires_stop() {
    let h = Harness::new();
    let networks = h.networks();
    networks
        .create_network(NetworkSpec::new("lab1", "10.10.10.0/24"))
        .await
        .unwrap();

    let err = networks.delete_network("lab1").await.unwrap_err();
    assert!(matches!(err, HypervisorError::PreconditionFailed(_)));

    networks.stop_network("lab1").await.unwrap();
    networks.delete_network("lab1").await.unwrap();
    assert!(!Inspector::new(h.conn.clone()).network_exists("lab1").await.unwrap());
}

/// Stopping a network names the running VMs that lose connectivity.
#[tokio::test]
async fn test_stop_network_reports_affected_vms() {
    let h = Harness::new();
    h.lifecycle().start("web01").await.unwrap();

    let outcome = h.networks().stop_network("default").await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.affected_vms, vec!["web01".to_string()]);

    let again = h.networks().stop_network("default").await.unwrap();
    assert!(!again.changed);
}

/// A network that fails to start is not left behind half-created.
#[tokio::test]
async fn test_create_network_rolls_back_on_start_failure() {
    let h = Harness::new();
    let networks = h.networks();
    networks
        .create_network(NetworkSpec::new("lab1long-a", "10.20.0.0/24"))
        .await
        .unwrap();

    // Same bridge name, so the second network cannot come up
    let result = networks
        .create_network(NetworkSpec::new("lab1long-b", "10.21.0.0/24"))
        .await;
    assert!(result.is_err());
    assert!(!Inspector::new(h.conn.clone()).network_exists("lab1long-b").await.unwrap());
}

/// Detaching an unknown MAC fails and leaves the interfaces untouched.
#[tokio::test]
async fn test_detach_unknown_mac() {
    let h = Harness::new();
    h.lifecycle().start("web01").await.unwrap();
    let before_config = h.backend.interfaces("web01", false).unwrap();
    let before_live = h.backend.interfaces("web01", true).unwrap();

    let err = h
        .networks()
        .detach_interface("web01", "52:54:00:de:ad:00")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HypervisorError::NotFound { kind: ResourceKind::Interface, .. }
    ));

    assert_eq!(h.backend.interfaces("web01", false).unwrap(), before_config);
    assert_eq!(h.backend.interfaces("web01", true).unwrap(), before_live);
}

/// Hot-plug onto a running VM lands in both views and can be removed again.
#[tokio::test]
async fn test_attach_and_detach_live() {
    let h = Harness::new();
    let networks = h.networks();
    networks
        .create_network(NetworkSpec::new("lab1", "10.10.10.0/24"))
        .await
        .unwrap();
    h.lifecycle().start("web01").await.unwrap();

    let attached = networks
        .attach_interface("web01", InterfaceSpec::new("lab1").with_mac("52:54:00:AA:BB:CC"))
        .await
        .unwrap();
    assert_eq!(attached.mac, "52:54:00:aa:bb:cc");
    assert!(attached.live && attached.config);
    assert_eq!(h.backend.interfaces("web01", true).unwrap().len(), 2);
    assert_eq!(h.backend.interfaces("web01", false).unwrap().len(), 2);

    networks.detach_interface("web01", "52:54:00:aa:bb:cc").await.unwrap();
    assert_eq!(h.backend.interfaces("web01", true).unwrap().len(), 1);
    assert_eq!(h.backend.interfaces("web01", false).unwrap().len(), 1);
}

// =============================================================================
// Snapshots
// =============================================================================

/// Revert restores the captured guest state, and reverting again lands in
/// the same place.
#[tokio::test]
async fn test_snapshot_revert_round_trip() {
    let h = Harness::new();
    h.lifecycle().start("web01").await.unwrap();
    h.backend.write_guest_data("web01", "release", "1.0").unwrap();

    let snapshots = h.snapshots();
    snapshots.create("web01", "s1", None).await.unwrap();
    h.backend.write_guest_data("web01", "release", "2.0").unwrap();
    h.backend.write_guest_data("web01", "scratch", "x").unwrap();

    let state = snapshots.revert("web01", "s1").await.unwrap();
    assert_eq!(state, VmState::Running);
    assert_eq!(h.backend.guest_data("web01", "release").unwrap().as_deref(), Some("1.0"));
    assert_eq!(h.backend.guest_data("web01", "scratch").unwrap(), None);

    let again = snapshots.revert("web01", "s1").await.unwrap();
    assert_eq!(again, state);
    assert_eq!(h.backend.guest_data("web01", "release").unwrap().as_deref(), Some("1.0"));
}

/// Deleted snapshots disappear from the listing.
#[tokio::test]
async fn test_snapshot_delete() {
    let h = Harness::new();
    let snapshots = h.snapshots();
    snapshots.create("web01", "s1", Some("first")).await.unwrap();
    snapshots.create("web01", "s2", None).await.unwrap();

    snapshots.delete("web01", "s1").await.unwrap();
    let listing = snapshots.list("web01").await.unwrap();
    let names: Vec<_> = listing.items.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["s2"]);
}

// =============================================================================
// Provisioning
// =============================================================================

/// Names with a space or a semicolon are rejected before any disk is made.
#[tokio::test]
async fn test_create_vm_rejects_bad_names() {
    let h = Harness::new();
    let provisioner = h.provisioner();

    for name in ["my vm", "vm;x"] {
        let err = provisioner.create_vm(VmSpec::new(name)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError, "{}", name);
        assert!(!h.disk_dir.path().join(format!("{}.qcow2", name)).exists());
    }
    assert!(h.runner.calls().is_empty());
    assert_eq!(std::fs::read_dir(h.disk_dir.path()).unwrap().count(), 0);
}

/// Installing from an ISO builds the expected virt-install invocation.
#[tokio::test]
async fn test_create_vm_from_iso() {
    let h = Harness::new();
    let iso = h.disk_dir.path().join("debian-12.iso");
    std::fs::write(&iso, b"iso").unwrap();
    let iso = iso.display().to_string();

    let outcome = h
        .provisioner()
        .create_vm(
            VmSpec::new("db01")
                .with_memory(4096)
                .with_vcpus(4)
                .with_disk_size(20)
                .with_os_variant("debian12")
                .with_install_media(&iso),
        )
        .await
        .unwrap();

    assert!(outcome.uuid.is_some());
    assert_eq!(outcome.install_media.as_deref(), Some(iso.as_str()));
    assert_eq!(h.state("db01").await, VmState::Running);

    let calls = h.runner.calls();
    assert_eq!(calls.len(), 1);
    let cmd = &calls[0];
    assert_eq!(cmd.program, "virt-install");
    assert_eq!(cmd.flag_value("memory"), Some("4096"));
    assert_eq!(cmd.flag_value("cdrom"), Some(iso.as_str()));
    assert_eq!(cmd.flag_value("network"), Some("network=default,model=virtio"));
    assert!(cmd.has_flag("--noautoconsole"));
    assert!(!cmd.has_flag("--import"));
}

/// A missing ISO is reported before the tool runs.
#[tokio::test]
async fn test_create_vm_missing_iso() {
    let h = Harness::new();
    let err = h
        .provisioner()
        .create_vm(VmSpec::new("db01").with_install_media("/nonexistent/os.iso"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HypervisorError::NotFound { kind: ResourceKind::InstallMedia, .. }
    ));
    assert!(h.runner.calls().is_empty());
}

/// Existing names and disk images are refused.
#[tokio::test]
async fn test_create_vm_conflicts() {
    let h = Harness::new();
    let provisioner = h.provisioner();

    let err = provisioner.create_vm(VmSpec::new("web01")).await.unwrap_err();
    assert!(matches!(err, HypervisorError::AlreadyExists { kind: ResourceKind::Vm, .. }));

    std::fs::write(h.disk_dir.path().join("db01.qcow2"), b"").unwrap();
    let err = provisioner.create_vm(VmSpec::new("db01")).await.unwrap_err();
    assert!(matches!(err, HypervisorError::AlreadyExists { kind: ResourceKind::Disk, .. }));
    assert!(h.runner.calls().is_empty());
}

/// A hung install tool surfaces as a timeout.
#[tokio::test]
async fn test_create_vm_timeout() {
    let h = Harness::new();
    h.runner.script("virt-install", ScriptedResponse::Hang);

    let err = h
        .provisioner_with_timeout(Duration::from_millis(50))
        .create_vm(VmSpec::new("db01"))
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::Timeout { .. }));
    assert_eq!(ErrorReport::from(&err).kind, ErrorKind::Timeout);
}

/// A failing tool keeps its stderr.
#[tokio::test]
async fn test_create_vm_tool_failure() {
    let h = Harness::new();
    h.runner.script(
        "virt-install",
        ScriptedResponse::Output(CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "ERROR    Host does not support virtualization type 'hvm'".to_string(),
        }),
    );

    let err = h.provisioner().create_vm(VmSpec::new("db01")).await.unwrap_err();
    match err {
        HypervisorError::ProvisioningFailed { tool, detail } => {
            assert_eq!(tool, "virt-install");
            assert!(detail.contains("exit code 1"));
            assert!(detail.contains("virtualization type 'hvm'"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// Cloning a running VM is refused and defines nothing.
#[tokio::test]
async fn test_clone_running_vm_refused() {
    let h = Harness::new();
    h.lifecycle().start("web01").await.unwrap();

    let err = h.provisioner().clone_vm("web01", "web02").await.unwrap_err();
    assert!(matches!(err, HypervisorError::PreconditionFailed(_)));
    assert!(!h.backend.domain_exists("web02"));
    assert!(h.runner.calls().is_empty());
}

/// A clone gets its own UUID, MACs and disk images.
#[tokio::test]
async fn test_clone_shutoff_vm() {
    let h = Harness::with_runner(MockRunner::new);
    let source = Inspector::new(h.conn.clone()).get_vm("web01").await.unwrap();

    let outcome = h.provisioner().clone_vm("web01", "web02").await.unwrap();
    assert_eq!(outcome.source, "web01");
    assert!(outcome.uuid.is_some());
    assert_ne!(outcome.uuid, source.uuid);
    assert_eq!(outcome.macs.len(), 1);
    assert_ne!(Some(&outcome.macs[0]), source.interfaces[0].mac.as_ref());
    assert_eq!(outcome.disks, vec!["/var/lib/libvirt/images/web01-clone.qcow2".to_string()]);
    assert_eq!(h.state("web02").await, VmState::Shutoff);
}

// =============================================================================
// Connection
// =============================================================================

/// Once closed, every manager reports the connection as gone.
#[tokio::test]
async fn test_operations_after_close() {
    let h = Harness::new();
    h.conn.close().await.unwrap();

    let err = h.lifecycle().start("web01").await.unwrap_err();
    assert!(matches!(err, HypervisorError::NotConnected));
    let err = Inspector::new(h.conn.clone()).list_vms().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}
