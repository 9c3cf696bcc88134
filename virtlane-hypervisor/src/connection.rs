//! Connection manager.
//!
//! Owns the single hypervisor connection for the process. Managers receive an
//! `Arc<Connection>` at construction and fetch the backend through
//! [`Connection::get`] on every operation, so once [`Connection::close`] has
//! run every later call fails with `NotConnected`.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::decoder::{DescriptorDecoder, LibvirtXmlDecoder};
use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;

pub struct Connection {
    uri: String,
    backend: RwLock<Option<Arc<dyn Hypervisor>>>,
    decoder: Arc<dyn DescriptorDecoder>,
}

impl Connection {
    /// Open a libvirt connection to `uri`.
    #[cfg(feature = "libvirt")]
    pub async fn open(uri: &str) -> Result<Self> {
        let backend = crate::libvirt::LibvirtBackend::open(uri).await?;
        Ok(Self::with_backend(Arc::new(backend)))
    }

    /// Wrap an already connected backend.
    pub fn with_backend(backend: Arc<dyn Hypervisor>) -> Self {
        let uri = backend.uri().to_string();
        info!(uri = %uri, "Hypervisor connection opened");
        Self {
            uri,
            backend: RwLock::new(Some(backend)),
            decoder: Arc::new(LibvirtXmlDecoder::new()),
        }
    }

    /// Replace the descriptor decoder used by the managers.
    pub fn with_decoder(mut self, decoder: Arc<dyn DescriptorDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// The backend, or `NotConnected` once closed.
    pub fn get(&self) -> Result<Arc<dyn Hypervisor>> {
        let guard = self
            .backend
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".into()))?;
        guard.clone().ok_or(HypervisorError::NotConnected)
    }

    pub fn decoder(&self) -> &dyn DescriptorDecoder {
        self.decoder.as_ref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_open(&self) -> bool {
        self.backend.read().map(|b| b.is_some()).unwrap_or(false)
    }

    /// Release the connection. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let backend = {
            let mut guard = self
                .backend
                .write()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".into()))?;
            guard.take()
        };

        match backend {
            Some(backend) => {
                backend.close().await?;
                info!(uri = %self.uri, "Hypervisor connection closed");
            }
            None => warn!(uri = %self.uri, "Connection already closed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    #[tokio::test]
    async fn test_get_after_close_fails() {
        let conn = Connection::with_backend(Arc::new(MockBackend::new()));
        assert!(conn.is_open());
        assert!(conn.get().is_ok());

        conn.close().await.unwrap();
        assert!(!conn.is_open());
        assert!(matches!(conn.get(), Err(HypervisorError::NotConnected)));

        // Idempotent
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_uri_from_backend() {
        let conn = Connection::with_backend(Arc::new(MockBackend::with_uri("test:///default")));
        assert_eq!(conn.uri(), "test:///default");
    }
}
