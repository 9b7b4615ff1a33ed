use std::fmt;
use std::future::Future;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tracing::trace;

use crate::core::errors::BatchError;

type SharedOutcome = Shared<BoxFuture<'static, Result<Value, BatchError>>>;

/// Per-context cache that collapses concurrent identical-key async calls
/// into a single execution.
///
/// The first call for a key stores its future *before* the future settles,
/// so concurrent calls arriving in the same scheduling tick observe and
/// share the same pending work. Entries are never evicted for the life of
/// the owning [`Context`](crate::context::Context); a failure is cached
/// as-is and never retried.
pub struct DedupeCache {
    entries: DashMap<String, SharedOutcome>,
}

impl DedupeCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of distinct keys seen so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a call for `key` is in flight or already settled
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Run `producer` at most once for `key`, sharing its outcome with
    /// every concurrent and later caller.
    pub async fn dedupe<F, Fut>(&self, key: &str, producer: F) -> Result<Value, BatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let shared = match self.entries.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                trace!(key, "dedupe hit, sharing cached outcome");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let owned = key.to_string();
                let fut = producer()
                    .map(move |res| res.map_err(|err| BatchError::dedupe_failed(owned, &err)))
                    .boxed()
                    .shared();
                entry.insert(fut.clone());
                fut
            }
        };
        shared.await
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DedupeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupeCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
