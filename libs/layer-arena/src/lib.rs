//! plfm-vt Layer Arena
//!
//! Fetches content-addressed filesystem layers, decompresses and verifies
//! them, and keeps one cached copy per digest on local disk shared by any
//! number of concurrent consumers.
//!
//! ## Architecture
//!
//! ```text
//! Arena                  (cache root, digest -> refcount)
//! ├── DedupGroup         (one in-flight realization per digest)
//! │   └── realize        (GET -> hash tee -> decompress -> verify -> file)
//! └── FetchProxy(n)      (per unit of work; owns its leases)
//! ```
//!
//! A caller obtains a [`FetchProxy`] from the [`Arena`], fetches a batch of
//! [`Layer`]s through it, reads the files at each layer's local path, and
//! closes the proxy. The file for a digest is deleted when the last proxy
//! referencing it closes.
//!
//! ## Modules
//!
//! - `arena`: refcounted cache directory and leases
//! - `proxy`: concurrent batch fetches scoped to one consumer
//! - `realize`: the fetch/decompress/verify pipeline
//! - `group`: per-key deduplication of in-flight work
//! - `compression`: magic-number and media type detection

pub mod arena;
pub mod compression;
pub mod config;
pub mod digest;
pub mod error;
pub mod group;
pub mod layer;
pub mod proxy;
mod realize;

pub use arena::{Arena, Lease, Realized};
pub use compression::{detect_compression, Compression, MediaType};
pub use config::ArenaConfig;
pub use digest::{Algorithm, Digest, DigestError};
pub use error::{CleanupError, FetchError, ProxyError, RemoveError};
pub use layer::{Layer, LayerError, RemoteLayer};
pub use proxy::FetchProxy;
