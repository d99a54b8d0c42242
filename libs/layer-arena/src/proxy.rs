//! Per-request view over the arena.
//!
//! A [`FetchProxy`] is created for one unit of work (e.g. one scan). It
//! fetches batches of layers concurrently and keeps a [`Lease`] for every
//! layer it populated. Closing the proxy releases exactly those leases.

use std::sync::Arc;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::arena::{Arena, Lease};
use crate::error::{CleanupError, ProxyError};
use crate::layer::Layer;
use crate::realize::LayerRequest;

/// Tracks the cached files fetched for one set of layers.
#[derive(Debug)]
pub struct FetchProxy {
    arena: Arc<Arena>,
    leases: Mutex<Vec<Lease>>,
}

impl FetchProxy {
    pub(crate) fn new(arena: Arc<Arena>) -> Self {
        Self {
            arena,
            leases: Mutex::new(Vec::new()),
        }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Number of references this proxy currently holds.
    pub fn leases(&self) -> usize {
        self.leases.lock().len()
    }

    /// Populate every layer locally.
    ///
    /// All layers are fetched concurrently. The first failure fails the
    /// whole batch and stops waiting on the rest; layers that already
    /// completed keep their references until [`FetchProxy::close`].
    ///
    /// Cancelling `cancel` stops the wait but not the underlying downloads,
    /// which finish for the benefit of other waiters.
    pub async fn fetch<L: Layer>(
        &self,
        cancel: &CancellationToken,
        layers: &[L],
    ) -> Result<(), ProxyError> {
        try_join_all(layers.iter().map(|layer| self.fetch_one(cancel, layer))).await?;
        Ok(())
    }

    async fn fetch_one<L: Layer>(
        &self,
        cancel: &CancellationToken,
        layer: &L,
    ) -> Result<(), ProxyError> {
        let digest = layer.digest().to_string();
        loop {
            let pending = self.arena.realize_shared(LayerRequest::from_layer(layer));
            let realized = tokio::select! {
                result = pending => result.map_err(|source| ProxyError::Layer {
                    digest: digest.clone(),
                    source,
                })?,
                _ = cancel.cancelled() => {
                    return Err(ProxyError::Cancelled { digest });
                }
            };

            // Taking the lease and recording it must not be split by an
            // await, or a dropped batch could leak the reference.
            let Some(lease) = self.arena.acquire(&digest, &realized) else {
                debug!(digest = %digest, "cached layer was evicted before use, fetching again");
                continue;
            };
            layer
                .set_local_path(lease.path())
                .map_err(|source| ProxyError::SetLocal {
                    digest: digest.clone(),
                    source,
                })?;
            self.leases.lock().push(lease);
            return Ok(());
        }
    }

    /// Mark all the layers' backing files as unused.
    ///
    /// This may delete the backing files. Leases are handed back once, so
    /// calling this again only releases what was fetched since.
    pub fn close(&self) -> Result<(), CleanupError> {
        let leases = std::mem::take(&mut *self.leases.lock());
        let mut errors = CleanupError::default();
        for lease in leases {
            if let Err(err) = lease.release() {
                errors.push(err);
            }
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use tempfile::TempDir;

    use crate::digest::Digest;
    use crate::layer::RemoteLayer;

    #[tokio::test]
    async fn test_invalid_layer_fails_batch_without_references() {
        let dir = TempDir::new().unwrap();
        let arena = Arc::new(Arena::new(Client::new(), dir.path()));
        let proxy = arena.fetcher();

        let layers = [RemoteLayer::new(Digest::sha256_of(b"x"), "")];
        let err = proxy
            .fetch(&CancellationToken::new(), &layers)
            .await
            .unwrap_err();

        assert!(err.fetch_error().is_some_and(|e| e.is_validation()));
        assert!(layers[0].local_path().is_none());
        assert_eq!(proxy.leases(), 0);
        assert_eq!(arena.tracked(), 0);
        proxy.close().unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = TempDir::new().unwrap();
        let arena = Arc::new(Arena::new(Client::new(), dir.path()));
        let proxy = arena.fetcher();

        let layers: [RemoteLayer; 0] = [];
        proxy.fetch(&CancellationToken::new(), &layers).await.unwrap();
        proxy.close().unwrap();
        proxy.close().unwrap();
    }
}
