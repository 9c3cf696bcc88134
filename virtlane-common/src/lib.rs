//! # virtlane Common
//!
//! Shared utilities for the virtlane components.
//!
//! ## Logging
//!
//! ```no_run
//! use virtlane_common::{init, LogFormat};
//!
//! init("info", LogFormat::Text).unwrap();
//! tracing::info!(vm = "web01", "Starting VM");
//! ```

pub mod logging;

pub use logging::{init, init_logging, init_logging_json, LogFormat};
