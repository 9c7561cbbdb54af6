//! Content-addressed cache of resolved tables.
//!
//! Keys are SHA-256 digests of the input bytes. Each key owns a slot with its
//! own lock, so concurrent requests for the same content compute it once while
//! requests for other content are not held up. Entries live until [`ResolutionCache::clear`]
//! or until the cache is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::resolve::Resolved;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn of(content: &[u8]) -> ContentKey {
        ContentKey(Sha256::digest(content).into())
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

type Slot = Arc<Mutex<Option<Arc<Resolved>>>>;

#[derive(Debug, Default)]
pub struct ResolutionCache {
    slots: Mutex<HashMap<ContentKey, Slot>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic while holding the lock leaves the map itself consistent
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached table for `content`, computing it with `resolve` on
    /// a miss. Errors are passed through and nothing is stored for them.
    pub fn get_or_try_insert_with<E>(
        &self,
        content: &[u8],
        resolve: impl FnOnce() -> Result<Resolved, E>,
    ) -> Result<Arc<Resolved>, E> {
        let key = ContentKey::of(content);
        let slot = Arc::clone(lock(&self.slots).entry(key).or_default());

        let mut entry = lock(&slot);
        if let Some(hit) = entry.as_ref() {
            trace!(%key, "resolution cache hit");
            return Ok(Arc::clone(hit));
        }
        trace!(%key, "resolution cache miss");
        let resolved = match resolve() {
            Ok(resolved) => Arc::new(resolved),
            Err(e) => {
                // slot lock before map lock; nothing takes them the other way round
                let mut slots = lock(&self.slots);
                if slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(&key);
                }
                return Err(e);
            }
        };
        *entry = Some(Arc::clone(&resolved));
        Ok(resolved)
    }

    pub fn get(&self, content: &[u8]) -> Option<Arc<Resolved>> {
        let slot = lock(&self.slots).get(&ContentKey::of(content)).cloned()?;
        let entry = lock(&slot);
        entry.clone()
    }

    pub fn contains(&self, content: &[u8]) -> bool {
        self.get(content).is_some()
    }

    /// Number of stored tables. Slots whose computation failed do not count.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|s| lock(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }
}
