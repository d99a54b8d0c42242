//! Error types for layer fetching and cache cleanup.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::compression::Compression;
use crate::layer::LayerError;

/// Errors from realizing a single layer.
///
/// One realization may be observed by many waiters, so these reach callers
/// behind an [`Arc`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("empty uri for layer {digest}")]
    EmptyUri { digest: String },

    #[error("failed to parse remote path uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("digest is empty")]
    EmptyDigest,

    #[error("unable to create file {}: {source}", path.display())]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status code: {status}{}", body_excerpt(.body_start))]
    UnexpectedStatus {
        status: StatusCode,
        body_start: Option<String>,
    },

    #[error("unknown content-type {0:?}")]
    UnknownContentType(String),

    #[error("{compression} decompression failed: {source}")]
    Decompress {
        compression: Compression,
        #[source]
        source: io::Error,
    },

    #[error("reading layer body failed: {0}")]
    Body(#[source] io::Error),

    #[error("validation failed: got {actual:?}, expected {expected:?}")]
    VerificationFailed { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("layer realization aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// Returns true if the layer was rejected before any I/O happened.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FetchError::EmptyUri { .. } | FetchError::InvalidUri { .. } | FetchError::EmptyDigest
        )
    }

    /// Returns true if the downloaded bytes did not match the digest.
    pub fn is_verification(&self) -> bool {
        matches!(self, FetchError::VerificationFailed { .. })
    }
}

fn body_excerpt(body_start: &Option<String>) -> String {
    match body_start {
        Some(body) => format!(" (body starts: {body:?})"),
        None => String::new(),
    }
}

/// Errors from a fetch proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("encountered error while fetching layer {digest}: {source}")]
    Layer {
        digest: String,
        #[source]
        source: Arc<FetchError>,
    },

    #[error("fetch of layer {digest} cancelled")]
    Cancelled { digest: String },

    #[error("unable to record local path for layer {digest}: {source}")]
    SetLocal {
        digest: String,
        #[source]
        source: LayerError,
    },
}

impl ProxyError {
    /// The realization error behind this failure, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            ProxyError::Layer { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Failure to remove one cached file.
#[derive(Debug, Error)]
#[error("unable to remove {}: {source}", path.display())]
pub struct RemoveError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Every removal failure from a bulk release, reported together.
#[derive(Debug, Default)]
pub struct CleanupError {
    pub failures: Vec<RemoveError>,
}

impl CleanupError {
    pub(crate) fn push(&mut self, err: RemoveError) {
        self.failures.push(err);
    }

    pub(crate) fn into_result(self) -> Result<(), CleanupError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CleanupError {}
