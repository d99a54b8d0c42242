//! The fetch arena: a shared cache directory of verified layers.
//!
//! Every cached file is backed by a refcount entry. An entry is seeded at
//! zero when a realization starts, grows by one for every [`Lease`] handed
//! out, and when the last lease is released the file is deleted and the
//! entry dropped.
//!
//! Entries carry a generation. A lease can only be taken against the
//! generation that produced the file, so a waiter holding a result from a
//! realization whose file has since been evicted cannot resurrect the entry;
//! it has to realize the layer again.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::ArenaConfig;
use crate::error::{CleanupError, FetchError, RemoveError};
use crate::group::{DedupGroup, SharedResult};
use crate::proxy::FetchProxy;
use crate::realize::LayerRequest;

/// Outcome of a successful realization.
#[derive(Debug, Clone)]
pub struct Realized {
    pub(crate) path: PathBuf,
    pub(crate) generation: u64,
}

impl Realized {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug)]
struct RefEntry {
    refs: usize,
    generation: u64,
}

/// Owner of the cache directory and the refcounts of the files in it.
pub struct Arena {
    pub(crate) client: Client,
    root: PathBuf,
    group: DedupGroup<Realized, FetchError>,
    refs: Mutex<HashMap<String, RefEntry>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("root", &self.root)
            .field("tracked", &self.tracked())
            .field("realizations", &self.group.len())
            .finish_non_exhaustive()
    }
}

impl Arena {
    /// Create an arena over `root`, fetching with `client`.
    ///
    /// The directory must already exist; see [`Arena::open`].
    pub fn new(client: Client, root: impl Into<PathBuf>) -> Self {
        Self {
            client,
            root: root.into(),
            group: DedupGroup::new(),
            refs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Create the configured root directory and an arena over it.
    pub fn open(client: Client, config: &ArenaConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.root_dir)?;
        Ok(Self::new(client, config.root_dir.clone()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A new proxy holding its own set of references into this arena.
    pub fn fetcher(self: &Arc<Self>) -> FetchProxy {
        FetchProxy::new(Arc::clone(self))
    }

    /// Current refcount for `digest`, if the arena tracks it.
    pub fn refcount(&self, digest: &str) -> Option<usize> {
        self.refs.lock().get(digest).map(|entry| entry.refs)
    }

    /// Number of digests with a refcount entry, including ones mid-fetch.
    pub fn tracked(&self) -> usize {
        self.refs.lock().len()
    }

    /// Whether a realization for `digest` is running or its result is cached.
    pub fn is_realized_or_pending(&self, digest: &str) -> bool {
        self.group.contains(digest)
    }

    /// Join, or start, the realization of `request`'s digest.
    pub(crate) fn realize_shared(
        self: &Arc<Self>,
        request: LayerRequest,
    ) -> SharedResult<Realized, FetchError> {
        let arena = Arc::clone(self);
        let key = request.key.clone();
        self.group.run(&key, move || arena.realize(request))
    }

    /// Cache path for `key`, seeding its refcount entry at zero.
    ///
    /// An existing entry is left alone so a concurrent release never sees
    /// the digest disappear mid-fetch.
    pub(crate) fn register(&self, key: &str) -> (PathBuf, u64) {
        let fresh = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut refs = self.refs.lock();
        let entry = refs.entry(key.to_string()).or_insert(RefEntry {
            refs: 0,
            generation: fresh,
        });
        (self.root.join(key), entry.generation)
    }

    /// Drop the zero-count entry left by a failed realization.
    pub(crate) fn abandon(&self, key: &str, generation: u64) {
        let mut refs = self.refs.lock();
        if refs
            .get(key)
            .is_some_and(|entry| entry.refs == 0 && entry.generation == generation)
        {
            refs.remove(key);
        }
    }

    /// Take a reference to a realized file.
    ///
    /// Returns `None` if the file was evicted after `realized` was produced.
    pub(crate) fn acquire(self: &Arc<Self>, key: &str, realized: &Realized) -> Option<Lease> {
        let mut refs = self.refs.lock();
        let entry = refs
            .get_mut(key)
            .filter(|entry| entry.generation == realized.generation)?;
        entry.refs += 1;
        debug!(digest = %key, refs = entry.refs, "acquired layer reference");

        Some(Lease {
            arena: Arc::clone(self),
            digest: key.to_string(),
            path: realized.path.clone(),
            generation: realized.generation,
            live: true,
        })
    }

    /// Release one reference to `digest` taken against `generation`,
    /// deleting its file at zero.
    ///
    /// Returns the remaining count. Releasing a digest the arena no longer
    /// tracks (after [`Arena::close`]), or one that has since been realized
    /// again, is a no-op that reports zero.
    pub(crate) fn decrement_ref(
        &self,
        digest: &str,
        generation: u64,
    ) -> Result<usize, RemoveError> {
        let mut refs = self.refs.lock();
        let Some(entry) = refs.get_mut(digest) else {
            warn!(digest = %digest, "release of untracked layer ignored");
            return Ok(0);
        };
        if entry.generation != generation {
            warn!(
                digest = %digest,
                generation,
                current = entry.generation,
                "release of stale layer reference ignored"
            );
            return Ok(0);
        }
        if entry.refs == 0 {
            warn!(digest = %digest, "release of unreferenced layer ignored");
            return Ok(0);
        }

        entry.refs -= 1;
        let remaining = entry.refs;
        debug!(digest = %digest, refs = remaining, "released layer reference");
        if remaining > 0 {
            return Ok(remaining);
        }

        let removed = remove_cached(&self.root.join(digest));
        refs.remove(digest);
        self.group.forget(digest);
        info!(digest = %digest, "removed unreferenced layer");
        removed.map(|()| 0)
    }

    /// Remove every file left in the arena.
    ///
    /// It's not an error to have active fetchers, but their files are
    /// unlinked underneath them.
    pub fn close(&self) -> Result<(), CleanupError> {
        let mut refs = self.refs.lock();
        if !refs.is_empty() {
            warn!(
                arena = %self.root.display(),
                count = refs.len(),
                "seem to have active fetchers"
            );
            info!(arena = %self.root.display(), "clearing arena");
        }

        let mut errors = CleanupError::default();
        for (digest, _) in refs.drain() {
            self.group.forget(&digest);
            if let Err(err) = remove_cached(&self.root.join(&digest)) {
                errors.push(err);
            }
        }
        self.group.forget_all();
        errors.into_result()
    }
}

/// Remove a cached file; one that is already gone is not an error.
fn remove_cached(path: &Path) -> Result<(), RemoveError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RemoveError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// One counted reference to a cached layer file.
///
/// Released explicitly with [`Lease::release`], or on drop with any error
/// logged.
pub struct Lease {
    arena: Arc<Arena>,
    digest: String,
    path: PathBuf,
    generation: u64,
    live: bool,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("digest", &self.digest)
            .field("path", &self.path)
            .finish()
    }
}

impl Lease {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give the reference back, returning the digest's remaining count.
    pub fn release(mut self) -> Result<usize, RemoveError> {
        self.live = false;
        self.arena.decrement_ref(&self.digest, self.generation)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        if let Err(err) = self.arena.decrement_ref(&self.digest, self.generation) {
            warn!(digest = %self.digest, error = %err, "unable to release layer");
        }
    }
}
