//! Command dispatch: one operation per invocation, one JSON document out.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use virtlane_hypervisor::{
    AttachmentKind, CommandRunner, Connection, HypervisorError, Inspector, InterfaceSpec,
    Lifecycle, MediaCatalog, NetworkAttachment, NetworkSpec, Networks, Provisioner, Result,
    Snapshots, StopMode, VmSpec,
};

use crate::cli::{Command, CreateVmArgs, MediaCommand, NetCommand, SnapCommand, VmCommand};
use crate::config::Config;

/// Everything a command needs: the open connection, the tool runner and
/// the resolved configuration.
pub struct Context {
    pub conn: Arc<Connection>,
    pub runner: Arc<dyn CommandRunner>,
    pub config: Config,
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| HypervisorError::Internal(format!("serialize result: {}", e)))
}

pub async fn dispatch(ctx: &Context, command: Command) -> Result<Value> {
    match command {
        Command::Vm { command } => vm(ctx, command).await,
        Command::Net { command } => net(ctx, command).await,
        Command::Snap { command } => snap(ctx, command).await,
        Command::Media { command } => media(ctx, command).await,
    }
}

async fn vm(ctx: &Context, command: VmCommand) -> Result<Value> {
    let inspector = Inspector::new(ctx.conn.clone());
    let lifecycle = Lifecycle::new(ctx.conn.clone());

    match command {
        VmCommand::List => to_json(inspector.list_vms().await?),
        VmCommand::Info { name } => to_json(inspector.get_vm(&name).await?),
        VmCommand::Start { name } => to_json(lifecycle.start(&name).await?),
        VmCommand::Stop { name, force: true, .. } => to_json(lifecycle.stop(&name, StopMode::Force).await?),
        VmCommand::Stop { name, wait: Some(secs), .. } => {
            to_json(lifecycle.stop_and_wait(&name, Duration::from_secs(secs)).await?)
        }
        VmCommand::Stop { name, .. } => to_json(lifecycle.stop(&name, StopMode::Graceful).await?),
        VmCommand::Reboot { name } => to_json(lifecycle.reboot(&name).await?),
        VmCommand::Create(args) => {
            let spec = vm_spec(&ctx.config, args);
            debug!(spec = ?spec, "Resolved VM spec");
            to_json(provisioner(ctx).create_vm(spec).await?)
        }
        VmCommand::Clone { source, name } => to_json(provisioner(ctx).clone_vm(&source, &name).await?),
        VmCommand::Delete { name, remove_storage } => to_json(lifecycle.delete(&name, remove_storage).await?),
    }
}

fn provisioner(ctx: &Context) -> Provisioner {
    Provisioner::new(ctx.conn.clone(), ctx.runner.clone(), ctx.config.provisioner())
}

/// Fill in whatever the command line left out from the configured defaults.
fn vm_spec(config: &Config, args: CreateVmArgs) -> VmSpec {
    let network = match args.bridge {
        Some(bridge) => NetworkAttachment::bridge(bridge),
        None => NetworkAttachment::network(args.network.unwrap_or_else(|| config.defaults.network.clone())),
    };

    let mut spec = VmSpec::new(args.name)
        .with_memory(args.memory.unwrap_or(config.defaults.memory_mib))
        .with_vcpus(args.vcpus.unwrap_or(config.defaults.vcpus))
        .with_disk_size(args.disk_size.unwrap_or(config.defaults.disk_gib))
        .with_os_variant(args.os_variant)
        .with_network(network)
        .with_graphics(args.graphics);
    if let Some(iso) = args.iso {
        spec = spec.with_install_media(iso);
    }
    if let Some(path) = args.disk_path {
        spec = spec.with_disk_path(path);
    }
    spec
}

async fn net(ctx: &Context, command: NetCommand) -> Result<Value> {
    let inspector = Inspector::new(ctx.conn.clone());
    let networks = Networks::new(ctx.conn.clone());

    match command {
        NetCommand::List => to_json(inspector.list_networks().await?),
        NetCommand::Info { name } => to_json(inspector.get_network(&name).await?),
        NetCommand::Create {
            name,
            subnet,
            no_dhcp,
            dhcp_start,
            dhcp_end,
            forward,
            no_autostart,
        } => {
            let mut spec = NetworkSpec::new(name, subnet)
                .with_dhcp(!no_dhcp)
                .with_forward_mode(forward)
                .with_autostart(!no_autostart);
            if let (Some(start), Some(end)) = (dhcp_start, dhcp_end) {
                spec = spec.with_dhcp_range(start, end);
            }
            to_json(networks.create_network(spec).await?)
        }
        NetCommand::Start { name } => to_json(networks.start_network(&name).await?),
        NetCommand::Stop { name } => to_json(networks.stop_network(&name).await?),
        NetCommand::Delete { name } => to_json(networks.delete_network(&name).await?),
        NetCommand::Attach {
            vm,
            network,
            bridge,
            model,
            mac,
        } => {
            let kind = if bridge { AttachmentKind::Bridge } else { AttachmentKind::Network };
            let mut spec = InterfaceSpec::new(network).with_kind(kind).with_model(model);
            if let Some(mac) = mac {
                spec = spec.with_mac(mac);
            }
            to_json(networks.attach_interface(&vm, spec).await?)
        }
        NetCommand::Detach { vm, mac } => to_json(networks.detach_interface(&vm, &mac).await?),
        NetCommand::Bridges => to_json(
            inspector
                .list_host_bridges(ctx.runner.as_ref(), ctx.config.timeouts.query())
                .await,
        ),
    }
}

async fn snap(ctx: &Context, command: SnapCommand) -> Result<Value> {
    let snapshots = Snapshots::new(ctx.conn.clone());

    match command {
        SnapCommand::List { vm } => to_json(snapshots.list(&vm).await?),
        SnapCommand::Create { vm, name, description } => {
            to_json(snapshots.create(&vm, &name, description.as_deref()).await?)
        }
        SnapCommand::Revert { vm, name } => {
            let state = snapshots.revert(&vm, &name).await?;
            info!(vm = %vm, snapshot = %name, "Reverted");
            Ok(serde_json::json!({ "vm": vm, "snapshot": name, "vm_state": state }))
        }
        SnapCommand::Delete { vm, name } => {
            snapshots.delete(&vm, &name).await?;
            Ok(serde_json::json!({ "vm": vm, "snapshot": name, "deleted": true }))
        }
    }
}

async fn media(ctx: &Context, command: MediaCommand) -> Result<Value> {
    let catalog = MediaCatalog::new(ctx.config.storage.iso_dirs.clone());

    match command {
        MediaCommand::Isos => to_json(catalog.list_isos().await),
        MediaCommand::OsVariants => to_json(
            catalog
                .list_os_variants(ctx.runner.as_ref(), ctx.config.timeouts.query())
                .await?,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use virtlane_hypervisor::{MockBackend, MockRunner};

    use crate::cli::Args;

    fn context() -> Context {
        let backend = Arc::new(MockBackend::new());
        backend.seed_vm("web01", 1024, 1, "default").unwrap();
        Context {
            conn: Arc::new(Connection::with_backend(backend.clone())),
            runner: Arc::new(MockRunner::new(backend)),
            config: Config::default(),
        }
    }

    async fn run(ctx: &Context, argv: &[&str]) -> Result<Value> {
        let mut full = vec!["virtlane"];
        full.extend_from_slice(argv);
        let args = Args::try_parse_from(full).unwrap();
        dispatch(ctx, args.command).await
    }

    #[tokio::test]
    async fn test_vm_start_and_list() {
        let ctx = context();
        let started = run(&ctx, &["vm", "start", "web01"]).await.unwrap();
        assert_eq!(started["changed"], true);
        assert_eq!(started["previous_state"], "shutoff");

        let listing = run(&ctx, &["vm", "list"]).await.unwrap();
        assert_eq!(listing["items"][0]["name"], "web01");
        assert_eq!(listing["items"][0]["state"], "running");
    }

    #[tokio::test]
    async fn test_errors_carry_kind() {
        let ctx = context();
        let err = run(&ctx, &["vm", "info", "ghost"]).await.unwrap_err();
        let report = virtlane_hypervisor::ErrorReport::from(&err);
        assert_eq!(serde_json::to_value(&report).unwrap()["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_create_uses_configured_defaults() {
        let mut ctx = context();
        let dir = tempfile::tempdir().unwrap();
        ctx.config.storage.disk_dir = dir.path().to_path_buf();
        ctx.config.defaults.memory_mib = 1024;

        let created = run(&ctx, &["vm", "create", "db01", "--graphics", "none"]).await.unwrap();
        assert_eq!(created["memory_mib"], 1024);
        assert_eq!(created["vcpus"], 2);
        assert_eq!(created["network"]["name"], "default");
        assert_eq!(created["graphics"], "none");
        assert_eq!(created["disk_path"], dir.path().join("db01.qcow2").display().to_string());
    }

    #[tokio::test]
    async fn test_network_roundtrip() {
        let ctx = context();
        let created = run(&ctx, &["net", "create", "lab1", "10.10.10.0/24"]).await.unwrap();
        assert_eq!(created["gateway"], "10.10.10.1");
        assert_eq!(created["active"], true);

        let err = run(&ctx, &["net", "delete", "lab1"]).await.unwrap_err();
        assert!(matches!(err, HypervisorError::PreconditionFailed(_)));
        run(&ctx, &["net", "stop", "lab1"]).await.unwrap();
        let deleted = run(&ctx, &["net", "delete", "lab1"]).await.unwrap();
        assert_eq!(deleted["network"], "lab1");
    }

    #[tokio::test]
    async fn test_snapshot_commands() {
        let ctx = context();
        run(&ctx, &["snap", "create", "web01", "s1", "--description", "base"]).await.unwrap();
        let listing = run(&ctx, &["snap", "list", "web01"]).await.unwrap();
        assert_eq!(listing["items"][0]["description"], "base");

        let reverted = run(&ctx, &["snap", "revert", "web01", "s1"]).await.unwrap();
        assert_eq!(reverted["vm_state"], "shutoff");
        run(&ctx, &["snap", "delete", "web01", "s1"]).await.unwrap();
    }
}
