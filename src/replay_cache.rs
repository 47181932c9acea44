//! Server-side replay cache for handshake ids.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// How often the sweeper wakes to evict expired ids.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Returns the current Unix timestamp in seconds.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

/// A set of recently seen handshake ids with time-based eviction.
///
/// Every present id was first observed at most `tolerance` seconds ago,
/// up to the sweeper's wake-up granularity. `check` performs the
/// check-and-insert in a single write-locked critical section so that two
/// concurrent handshakes with the same id cannot both pass.
///
/// After [`close`] the cache conservatively reports every id as already
/// seen: refusing a handshake is always safe, accepting one past shutdown
/// is not.
///
/// [`close`]: ReplayCache::close
#[derive(Debug)]
pub(crate) struct ReplayCache {
    seen: Arc<RwLock<HashMap<u64, u64>>>,
    running: Arc<AtomicBool>,
    stop: Mutex<Option<mpsc::Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayCache {
    /// Creates the cache and starts its background sweeper.
    pub(crate) fn start(tolerance: u64) -> Self {
        let seen = Arc::new(RwLock::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel();

        let sweeper = {
            let seen = Arc::clone(&seen);
            thread::Builder::new()
                .name("stcp-replay-sweeper".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(SWEEP_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => {
                            let evicted = evict_expired(&seen, unix_seconds(), tolerance);
                            if evicted > 0 {
                                tracing::debug!(evicted, "replay cache sweep");
                            }
                        }
                        // Stop signal, or the cache was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                })
                .expect("spawn replay sweeper thread")
        };

        Self {
            seen,
            running,
            stop: Mutex::new(Some(stop_tx)),
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Returns `true` if `id` was already seen (or the cache is shut down);
    /// otherwise records it with the given timestamp and returns `false`.
    pub(crate) fn check(&self, id: u64, now: u64) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return true;
        }
        let mut seen = self.seen.write().unwrap();
        if seen.contains_key(&id) {
            return true;
        }
        seen.insert(id, now);
        false
    }

    /// Stops the sweeper and marks the cache closed. Idempotent.
    pub(crate) fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(stop) = self.stop.lock().unwrap().take() {
            let _ = stop.send(());
        }
        if let Some(sweeper) = self.sweeper.lock().unwrap().take() {
            let _ = sweeper.join();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.read().unwrap().len()
    }
}

impl Drop for ReplayCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn evict_expired(seen: &RwLock<HashMap<u64, u64>>, now: u64, tolerance: u64) -> usize {
    let mut seen = seen.write().unwrap();
    let before = seen.len();
    seen.retain(|_, first_seen| now.saturating_sub(*first_seen) <= tolerance);
    before - seen.len()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_and_insert() {
        let cache = ReplayCache::start(120);
        let now = unix_seconds();
        assert!(!cache.check(42, now));
        assert!(cache.check(42, now));
        assert!(!cache.check(43, now));
        cache.close();
    }

    #[test]
    fn test_eviction_keeps_fresh_entries() {
        let cache = ReplayCache::start(120);
        let t0 = 1000;
        assert!(!cache.check(1, t0));
        assert!(!cache.check(2, t0 + 100));
        assert!(!cache.check(3, t0 + 200));

        // Entries older than the tolerance go away, the rest stay.
        assert_eq!(evict_expired(&cache.seen, t0 + 200, 120), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.check(2, t0 + 200));

        // An evicted id may be seen again.
        assert!(!cache.check(1, t0 + 200));
        cache.close();
    }

    #[test]
    fn test_closed_cache_refuses_everything() {
        let cache = ReplayCache::start(120);
        cache.close();
        cache.close();
        assert!(cache.check(7, unix_seconds()));
        assert!(cache.check(8, unix_seconds()));
    }
}
