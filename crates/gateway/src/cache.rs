//! Snapshot cells backing the read-through caches.
//!
//! One polling task per service rebuilds (or incrementally patches) each
//! snapshot and swaps it in; readers clone an `Arc` and never hold a lock
//! across a suspension point. Incremental caches keep a `last_updated`
//! watermark so a refresh only touches rows changed since the previous one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

/// Single-writer / many-reader snapshot holder.
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Arc::new(T::default())),
        }
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// Immutable snapshot; cheap to take, valid across awaits.
    pub fn load(&self) -> Arc<T> {
        self.inner.read().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write() = Arc::new(value);
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Clone the current snapshot, patch it, swap it in.
    pub fn update(&self, patch: impl FnOnce(&mut T)) {
        let mut next = (*self.load()).clone();
        patch(&mut next);
        self.store(next);
    }
}

/// Incremental-refresh watermark. `None` means the cache has never been
/// loaded and the next poll must be a full one.
#[derive(Default)]
pub struct Watermark {
    inner: Mutex<Option<DateTime<Utc>>>,
}

impl Watermark {
    pub fn get(&self) -> Option<DateTime<Utc>> {
        *self.inner.lock()
    }

    /// Advance to the newest row timestamp seen, never backwards.
    pub fn advance(&self, seen: Option<DateTime<Utc>>) {
        if let Some(ts) = seen {
            let mut guard = self.inner.lock();
            if guard.map(|current| ts > current).unwrap_or(true) {
                *guard = Some(ts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_swap_is_visible() {
        let cell = SnapshotCell::new(vec![1, 2]);
        let before = cell.load();
        cell.update(|v| v.push(3));
        assert_eq!(*before, vec![1, 2]);
        assert_eq!(*cell.load(), vec![1, 2, 3]);
    }

    #[test]
    fn watermark_never_regresses() {
        let wm = Watermark::default();
        assert_eq!(wm.get(), None);
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(10);
        wm.advance(Some(t1));
        wm.advance(Some(t0));
        assert_eq!(wm.get(), Some(t1));
        wm.advance(None);
        assert_eq!(wm.get(), Some(t1));
    }
}
