use super::Manifest;
use crate::transport::{Scheme, Transport};
use crate::{Result, UpdateError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resolves a manifest locator (URL or path) into a parsed [`Manifest`].
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn get_manifest(&self, locator: &str, cancel: &CancellationToken) -> Result<Manifest>;
}

/// Loads manifests over the update transport, or from local disk when the
/// locator is not a supported URL.
pub struct TransportManifestSource {
    transport: Arc<dyn Transport>,
}

impl TransportManifestSource {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn read_local(path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| {
            UpdateError::Manifest(format!("Cannot read manifest {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl ManifestSource for TransportManifestSource {
    async fn get_manifest(&self, locator: &str, cancel: &CancellationToken) -> Result<Manifest> {
        let bytes = if Scheme::of(locator).is_ok() {
            info!("Fetching manifest from {}", crate::transport::redact(locator));
            self.transport.fetch_to_memory(locator, cancel).await?
        } else {
            debug!("Reading manifest from {}", locator);
            Self::read_local(Path::new(locator)).await?
        };

        let manifest = Manifest::from_json(&bytes)?;
        debug!("Manifest lists {} file(s)", manifest.len());
        Ok(manifest)
    }
}
