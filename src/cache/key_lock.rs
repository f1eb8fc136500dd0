//! Mutexes addressed by arbitrary string keys.
//!
//! The cache locks per entry, and entries come and go with whatever paths a
//! program touches, so the mutexes live in a map and are reference counted:
//! a key's slot exists only while some thread holds or waits for it. This
//! keeps the map bounded by the number of concurrent operations instead of
//! the number of paths ever seen.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

#[derive(Debug)]
struct Slot {
    lock: Arc<Mutex<()>>,
    users: usize,
}

/// Collection of reference-counted keyed mutexes.
#[derive(Debug, Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        KeyLocks::default()
    }

    /// Block until the key's mutex is held.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.register(key);
        let guard = Some(lock.lock_arc());

        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard,
        }
    }

    /// Try to take the key's mutex without blocking.
    ///
    /// The returned guard reports whether the mutex was actually acquired;
    /// either way it participates in the slot's reference count.
    pub fn try_lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.register(key);
        let guard = lock.try_lock_arc();

        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard,
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }

    fn register(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(Mutex::new(())),
            users: 0,
        });
        slot.users += 1;
        Arc::clone(&slot.lock)
    }

    fn unregister(&self, key: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.users -= 1;
            if slot.users == 0 {
                slots.remove(key);
            }
        }
    }
}

/// Holds (or records the failed attempt on) one keyed mutex.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyGuard<'_> {
    /// Whether the mutex is actually held by this guard.
    pub fn acquired(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before the slot bookkeeping so a waiter can take
        // over the same slot.
        self.guard.take();
        self.locks.unregister(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn slots_are_reclaimed_after_use() {
        let locks = KeyLocks::new();

        {
            let _a = locks.lock("a");
            let _b = locks.lock("b");
            assert_eq!(locks.active(), 2);
        }

        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let locks = KeyLocks::new();

        let held = locks.lock("key");
        assert!(held.acquired());

        let attempt = locks.try_lock("key");
        assert!(!attempt.acquired());

        let other = locks.try_lock("other");
        assert!(other.acquired());
    }

    #[test]
    fn lock_becomes_available_after_release() {
        let locks = KeyLocks::new();

        drop(locks.lock("key"));
        assert!(locks.try_lock("key").acquired());
    }

    #[test]
    fn contended_sections_are_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);

            threads.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let _guard = locks.lock("shared");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_micros(50));
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }
}
