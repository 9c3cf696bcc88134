//! # virtlane
//!
//! Command-line entrypoint for the orchestration core. Each invocation opens
//! one hypervisor connection, runs one operation and prints one JSON
//! document on stdout. Logs go to stderr.
//!
//! ## Usage
//! ```bash
//! virtlane vm list
//! virtlane --uri qemu+ssh://root@kvm01/system vm stop web01 --wait 60
//! virtlane net create lab1 10.10.10.0/24
//! virtlane --dev snap create demo-vm before-upgrade
//! ```
//!
//! Exit codes: 0 on success, 1 when the operation fails, 2 when the
//! connection cannot be opened.

use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use virtlane_hypervisor::{
    CommandRunner, Connection, ErrorReport, HypervisorError, MockBackend, MockRunner,
};

mod cli;
mod commands;
mod config;

use cli::Args;
use commands::Context;
use config::{Config, HypervisorBackend};

/// Exit code when the operation itself failed.
const EXIT_FAILED: i32 = 1;
/// Exit code when no connection could be opened.
const EXIT_NO_CONNECTION: i32 = 2;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the configured level applies
    let config = Config::resolve(&args).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    virtlane_common::init(&config.logging.level, config.logging.format.parse()?)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        uri = %config.hypervisor.uri,
        backend = ?config.hypervisor.backend,
        "virtlane starting"
    );

    let (conn, runner) = match open(&config).await {
        Ok(opened) => opened,
        Err(e) => {
            error!(error = %e, uri = %config.hypervisor.uri, "Failed to connect to hypervisor");
            print_error(&e);
            std::process::exit(EXIT_NO_CONNECTION);
        }
    };

    let ctx = Context {
        conn: conn.clone(),
        runner,
        config,
    };
    let result = commands::dispatch(&ctx, args.command).await;

    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close hypervisor connection");
    }

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Operation failed");
            print_error(&e);
            std::process::exit(EXIT_FAILED);
        }
    }
}

/// Open the configured backend together with the matching tool runner.
async fn open(config: &Config) -> virtlane_hypervisor::Result<(Arc<Connection>, Arc<dyn CommandRunner>)> {
    match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend");
            let backend = Arc::new(MockBackend::with_uri(config.hypervisor.uri.clone()));
            backend.seed_vm("demo-vm", config.defaults.memory_mib, config.defaults.vcpus, "default")?;
            let runner: Arc<dyn CommandRunner> = Arc::new(MockRunner::new(backend.clone()));
            Ok((Arc::new(Connection::with_backend(backend)), runner))
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                let conn = Connection::open(&config.hypervisor.uri).await?;
                let runner: Arc<dyn CommandRunner> = Arc::new(virtlane_hypervisor::TokioCommandRunner::new());
                Ok((Arc::new(conn), runner))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                Err(HypervisorError::ConnectionFailed(
                    "libvirt support not compiled in; rebuild with the `libvirt` feature or use --dev".to_string(),
                ))
            }
        }
    }
}

/// Structured failure payload on stdout.
fn print_error(err: &HypervisorError) {
    let payload = serde_json::json!({ "error": ErrorReport::from(err) });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
    );
}
