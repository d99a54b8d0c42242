//! Layer descriptors handed to the arena.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::digest::Digest;

/// Errors from recording a layer's local path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("local path already set to {}", existing.display())]
    AlreadySet { existing: PathBuf },
}

/// A remote layer the arena can fetch.
///
/// The arena only reads the descriptor; the single write is
/// [`Layer::set_local_path`], called once the cached file is verified and
/// referenced.
pub trait Layer: Send + Sync {
    /// Digest of the blob as served by the remote.
    fn digest(&self) -> &Digest;

    /// Absolute URI the blob is fetched from.
    fn uri(&self) -> &str;

    /// Headers forwarded unmodified with the request.
    fn headers(&self) -> &HeaderMap;

    /// Record where the decompressed layer lives on disk.
    fn set_local_path(&self, path: &Path) -> Result<(), LayerError>;
}

/// Plain [`Layer`] implementation.
#[derive(Debug)]
pub struct RemoteLayer {
    digest: Digest,
    uri: String,
    headers: HeaderMap,
    local: OnceLock<PathBuf>,
}

impl RemoteLayer {
    pub fn new(digest: Digest, uri: impl Into<String>) -> Self {
        Self {
            digest,
            uri: uri.into(),
            headers: HeaderMap::new(),
            local: OnceLock::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Path of the cached file, once fetched.
    pub fn local_path(&self) -> Option<&Path> {
        self.local.get().map(PathBuf::as_path)
    }
}

impl Layer for RemoteLayer {
    fn digest(&self) -> &Digest {
        &self.digest
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn set_local_path(&self, path: &Path) -> Result<(), LayerError> {
        self.local
            .set(path.to_path_buf())
            .map_err(|_| LayerError::AlreadySet {
                existing: self.local.get().cloned().unwrap_or_default(),
            })
    }
}
