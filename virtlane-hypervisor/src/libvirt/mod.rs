//! Libvirt/QEMU backend.
//!
//! The backend itself needs the `libvirt` feature and the system libvirt
//! library. The error mapping in [`errors`] is plain Rust and always built.

#[cfg(feature = "libvirt")]
mod backend;
pub mod errors;

#[cfg(feature = "libvirt")]
pub use backend::LibvirtBackend;

/// Whether this build can open libvirt connections.
pub fn is_available() -> bool {
    cfg!(feature = "libvirt")
}
