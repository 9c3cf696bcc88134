//! # virtlane Hypervisor
//!
//! VM lifecycle and resource orchestration over a libvirt-style hypervisor.
//!
//! Every manager works through one shared [`Connection`], which owns the
//! backend handle and the XML decoder. Resources are addressed by name and
//! re-read from the hypervisor on every call, so nothing is cached.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┬───────────┬─────────────┬──────────┬───────────┐
//! │ Inspector │ Lifecycle │ Provisioner │ Networks │ Snapshots │
//! └─────┬─────┴─────┬─────┴──────┬──────┴────┬─────┴─────┬─────┘
//!       └───────────┴──────┬─────┴───────────┴───────────┘
//!                          ▼                 (virt-install,
//!                 ┌─────────────────┐         virt-clone via
//!                 │   Connection    │         CommandRunner)
//!                 └────────┬────────┘
//!                          │ Hypervisor trait
//!              ┌───────────┴───────────┐
//!              ▼                       ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ LibvirtBackend  │     │   MockBackend   │
//!     │  (virt crate)   │     │   (in-memory)   │
//!     └─────────────────┘     └─────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtlane_hypervisor::{Connection, Lifecycle, MockBackend, StopMode};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(MockBackend::new());
//!     backend.seed_vm("web01", 2048, 2, "default").unwrap();
//!
//!     let conn = Arc::new(Connection::with_backend(backend));
//!     let lifecycle = Lifecycle::new(conn.clone());
//!     lifecycle.start("web01").await.unwrap();
//!     lifecycle.stop("web01", StopMode::Force).await.unwrap();
//!     conn.close().await.unwrap();
//! }
//! ```

pub mod connection;
pub mod decoder;
pub mod error;
pub mod inspector;
pub mod libvirt;
pub mod lifecycle;
pub mod media;
pub mod mock;
pub mod network;
pub mod provision;
pub mod runner;
pub mod snapshot;
pub mod traits;
pub mod types;
pub mod xml;

pub use connection::Connection;
pub use decoder::{DescriptorDecoder, LibvirtXmlDecoder, XmlElement};
pub use error::{ErrorKind, ErrorReport, HypervisorError, ResourceKind, Result};
pub use inspector::Inspector;
pub use lifecycle::{Lifecycle, StopMode};
pub use media::{IsoImage, MediaCatalog, OsVariants};
pub use mock::{MockBackend, MockRunner, ScriptedResponse};
pub use network::{
    generate_mac_address,
    ForwardMode,
    InterfaceOutcome,
    InterfaceSpec,
    NetworkOutcome,
    NetworkSpec,
    NetworkStateOutcome,
    Networks,
    Subnet,
};
pub use provision::{validate_name, Provisioner, ProvisionerConfig};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};
pub use snapshot::Snapshots;
pub use traits::Hypervisor;
pub use types::*;

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
