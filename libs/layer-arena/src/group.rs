//! Per-key deduplication of in-flight work.
//!
//! At most one unit of work runs per key. Every caller asking for the same key
//! while that work is in flight gets a clone of the same shared future and so
//! observes the identical outcome.
//!
//! The work is spawned onto the runtime rather than driven by its waiters:
//! callers that stop waiting do not cancel it, and the result is still
//! available to whoever asks next. Successful results stay cached until
//! [`DedupGroup::forget`]; failures are dropped as soon as they complete so
//! the next request starts over.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::task::JoinError;

/// Shared handle to the outcome of one deduplicated execution.
pub type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, Arc<E>>>>;

struct Slot<V, E> {
    id: u64,
    result: SharedResult<V, E>,
}

pub struct DedupGroup<V, E> {
    slots: Arc<Mutex<HashMap<String, Slot<V, E>>>>,
    next_id: AtomicU64,
}

impl<V, E> Default for DedupGroup<V, E> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<V, E> DedupGroup<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: From<JoinError> + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the execution for `key`, starting it with `work` if none exists.
    ///
    /// `work` is only called when a new execution starts.
    pub fn run<F, Fut>(&self, key: &str, work: F) -> SharedResult<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return slot.result.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fut = work();
        let owner = Arc::clone(&self.slots);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            let result = fut.await.map_err(Arc::new);
            if result.is_err() {
                let mut slots = owner.lock();
                if slots.get(&owned_key).is_some_and(|slot| slot.id == id) {
                    slots.remove(&owned_key);
                }
            }
            result
        });

        let owner = Arc::clone(&self.slots);
        let owned_key = key.to_string();
        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    // The task panicked before it could clear its own slot.
                    let mut slots = owner.lock();
                    if slots.get(&owned_key).is_some_and(|slot| slot.id == id) {
                        slots.remove(&owned_key);
                    }
                    Err(Arc::new(E::from(join_err)))
                }
            }
        }
        .boxed()
        .shared();

        slots.insert(
            key.to_string(),
            Slot {
                id,
                result: result.clone(),
            },
        );
        result
    }

    /// Drop any execution or cached result for `key`.
    ///
    /// Existing waiters keep their handle; the next [`DedupGroup::run`] starts
    /// fresh.
    pub fn forget(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    pub fn forget_all(&self) {
        self.slots.lock().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("boom")]
        Boom,
        #[error("join: {0}")]
        Join(#[from] JoinError),
    }

    type Group = DedupGroup<u32, TestError>;

    fn counting_work(
        calls: &Arc<AtomicUsize>,
        outcome: Result<u32, ()>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, TestError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                outcome.map_err(|()| TestError::Boom)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..8)
            .map(|_| group.run("sha256:aa", counting_work(&calls, Ok(7))))
            .collect();
        let results = futures_util::future::join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| matches!(r, Ok(7))));
    }

    #[tokio::test]
    async fn test_success_is_retained_until_forget() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(group.run("k", counting_work(&calls, Ok(1))).await.unwrap(), 1);
        assert!(group.contains("k"));
        assert_eq!(group.run("k", counting_work(&calls, Ok(2))).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        group.forget("k");
        assert!(!group.contains("k"));
        assert_eq!(group.run("k", counting_work(&calls, Ok(2))).await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_shared_but_not_retained() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = group.run("k", counting_work(&calls, Err(())));
        let second = group.run("k", counting_work(&calls, Ok(9)));
        let (first, second) = tokio::join!(first, second);

        let (first, second) = (first.unwrap_err(), second.unwrap_err());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(*first, TestError::Boom));

        // Give the spawned task a moment to clear its slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(group.is_empty());
        assert_eq!(group.run("k", counting_work(&calls, Ok(9))).await.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_work_continues_when_waiters_give_up() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let waiter = group.run("k", counting_work(&calls, Ok(3)));
        let gave_up = tokio::time::timeout(Duration::from_millis(5), waiter).await;
        assert!(gave_up.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(group.run("k", counting_work(&calls, Ok(4))).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forgotten_failure_does_not_clear_newer_slot() {
        let group = Group::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let failing = group.run("k", counting_work(&calls, Err(())));
        group.forget("k");
        let fresh = group.run("k", counting_work(&calls, Ok(5)));

        assert!(failing.await.is_err());
        assert_eq!(fresh.await.unwrap(), 5);
        assert!(group.contains("k"));
    }
}
