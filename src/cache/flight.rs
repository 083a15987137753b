//! Per-key async locks used to single-flight cache fills.
//!
//! A request that misses the cache takes the lock for its key, re-checks the
//! store, and only then fetches upstream.  Requests for the same key queue
//! behind the first one and find the blob already written; requests for
//! different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// One key's lock plus the number of holders and waiters using it.
#[derive(Debug, Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    slots: Slots,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Cancel-safe: dropping the returned future while it is still queued
    /// releases the waiter's claim on the map entry.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let (lease, lock) = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.entry(key.to_string()).or_default();
            slot.users += 1;
            let lease = Lease {
                key: key.to_string(),
                slots: Arc::clone(&self.slots),
            };
            (lease, Arc::clone(&slot.lock))
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            _guard: guard,
            _lease: lease,
        }
    }

    /// Number of keys that currently have a holder or waiter.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held while a cache fill for one key is in progress.
#[derive(Debug)]
pub struct KeyGuard {
    // Field order matters: the key is released before the lease is dropped.
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

/// A holder's or waiter's claim on a map entry.  The last one out removes it.
#[derive(Debug)]
struct Lease {
    key: String,
    slots: Slots,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("song.mp3").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0, "entries are dropped once idle");
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock("a.mp3").await;
        let b = tokio::time::timeout(Duration::from_millis(200), locks.lock("b.mp3")).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn entry_survives_while_waiter_queued() {
        let locks = KeyLocks::new();
        let first = locks.lock("x.wav").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("x.wav").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert_eq!(locks.active(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_entry() {
        let locks = KeyLocks::new();
        let first = locks.lock("y.ogg").await;

        let queued = tokio::time::timeout(Duration::from_millis(20), locks.lock("y.ogg")).await;
        assert!(queued.is_err());
        assert_eq!(locks.active(), 1);

        drop(first);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn waiter_aborted_after_release_leaves_no_entry() {
        let locks = KeyLocks::new();
        let first = locks.lock("z.mp3").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("z.mp3").await;
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert_eq!(locks.active(), 0);
    }
}
