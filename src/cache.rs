use crate::store::{Store, StoreError};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Title → page id resolution, shared by every worker of a run.
///
/// Entries live for the whole process and are never evicted: dumps are finite
/// and the map is bounded by the number of distinct titles seen. A miss always
/// goes to the store, so a title that was not found yet can still resolve once
/// its page has been written. Two workers missing the same title at the same
/// time may both query the store; the second write of the entry is harmless.
pub struct PageCache {
    store: Arc<dyn Store>,
    entries: Mutex<FxHashMap<String, i64>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            entries: Mutex::new(FxHashMap::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<String, i64>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `title` (case-insensitively) to a page id. `Ok(None)` means the
    /// store has no such page; that outcome is not cached.
    pub async fn lookup(&self, title: &str) -> Result<Option<i64>, StoreError> {
        let key = title.to_lowercase();

        let cached = self.entries().get(&key).copied();
        if let Some(id) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(id));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let found = self.store.find_page_id(&key).await?;
        match found {
            Some(id) => {
                self.entries().insert(key, id);
                Ok(Some(id))
            }
            None => {
                trace!(title = %key, "Page not found");
                Ok(None)
            }
        }
    }

    /// Overwrites the entry for `title`. Called right after a page is committed.
    pub fn record(&self, title: &str, id: i64) {
        self.entries().insert(title.to_lowercase(), id);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
