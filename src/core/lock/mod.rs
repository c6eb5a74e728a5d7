//! Advisory locking with expiry, retry and jitter
//!
//! A [`LockCoordinator`] acquires TTL-bounded, mutually exclusive locks on a
//! [`LockBackend`]. Acquisition retries a bounded number of times, sleeping
//! `retry_delay + rand(0..=retry_jitter)` between attempts, then fails with
//! `LockTimeout`. Locks are released by [`LockGuard`] on every exit path,
//! including unwinding.
//!
//! Locks are cooperative: they only exclude callers that ask for them. The
//! commit-log store maps every key to one repository-wide lock file, the
//! key-value store locks per collection.

mod file;

pub use file::FileLockBackend;

use crate::config::LockConfig;
use crate::error::{RepoError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Storage that can hold advisory locks
pub trait LockBackend: Send + Sync {
    /// Try once to take `key` for `ttl`. Returns false when someone else
    /// holds an unexpired lock.
    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release `key` if it is still held with `token`. Returns false when the
    /// lock expired and was taken over meanwhile.
    fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Acquires and releases advisory locks according to a [`LockConfig`]
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        LockCoordinator { backend, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Default hold time from the configuration
    pub fn default_hold(&self) -> Duration {
        Duration::from_millis(self.config.hold_ms)
    }

    /// Acquire a single lock
    pub fn acquire(&self, key: &str, hold: Duration) -> Result<LockGuard<'_>> {
        self.acquire_all(&[key.to_string()], hold)
    }

    /// Acquire several locks at once
    ///
    /// Keys are deduplicated and taken in sorted order so that two callers
    /// asking for overlapping sets cannot deadlock. If any key times out, the
    /// keys already taken are released before the error is returned.
    pub fn acquire_all(&self, keys: &[String], hold: Duration) -> Result<LockGuard<'_>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let token = new_token();
        let started = Instant::now();
        let mut guard = LockGuard {
            coordinator: self,
            held: Vec::with_capacity(keys.len()),
            token,
            started,
            ttl: hold,
        };

        for key in keys {
            self.acquire_one(&key, &guard.token, hold)?;
            guard.held.push(key);
        }

        Ok(guard)
    }

    fn acquire_one(&self, key: &str, token: &str, ttl: Duration) -> Result<()> {
        let attempts = self.config.retry_count.saturating_add(1);
        let mut rng = rand::thread_rng();

        for attempt in 1..=attempts {
            if self.backend.try_acquire(key, token, ttl)? {
                debug!("Acquired lock {} on attempt {}", key, attempt);
                return Ok(());
            }

            if attempt < attempts {
                let jitter = if self.config.retry_jitter_ms > 0 {
                    rng.gen_range(0..=self.config.retry_jitter_ms)
                } else {
                    0
                };
                std::thread::sleep(Duration::from_millis(self.config.retry_delay_ms + jitter));
            }
        }

        debug!("Giving up on lock {} after {} attempts", key, attempts);
        Err(RepoError::LockTimeout {
            key: key.to_string(),
            attempts,
        })
    }

    fn release(&self, key: &str, token: &str) {
        match self.backend.release(key, token) {
            Ok(true) => debug!("Released lock {}", key),
            Ok(false) => warn!("Lock {} expired before release", key),
            Err(e) => warn!("Failed to release lock {}: {}", key, e),
        }
    }
}

/// Proof that a set of locks is held; releases them on drop
pub struct LockGuard<'a> {
    coordinator: &'a LockCoordinator,
    held: Vec<String>,
    token: String,
    started: Instant,
    ttl: Duration,
}

impl LockGuard<'_> {
    /// Whether `key` is one of the held locks
    pub fn covers(&self, key: &str) -> bool {
        self.held.iter().any(|k| k == key)
    }

    pub fn keys(&self) -> &[String] {
        &self.held
    }

    /// Time left before the locks may expire, accounting for clock drift
    pub fn remaining(&self) -> Duration {
        let drift = self.ttl.mul_f64(self.coordinator.config.drift_factor) + Duration::from_millis(2);
        self.ttl
            .saturating_sub(drift)
            .saturating_sub(self.started.elapsed())
    }

    /// Fail with `LockTimeout` once the locks may have expired
    ///
    /// Called right before a commit: past this point another writer may
    /// have taken the locks over.
    pub fn ensure_live(&self) -> Result<()> {
        if self.remaining().is_zero() {
            let key = self.held.first().cloned().unwrap_or_default();
            warn!("Lock {} expired before the commit", key);
            return Err(RepoError::LockTimeout { key, attempts: 0 });
        }
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        for key in self.held.iter().rev() {
            self.coordinator.release(key, &self.token);
        }
    }
}

fn new_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TableBackend {
        held: Mutex<HashMap<String, (String, Instant)>>,
    }

    impl LockBackend for TableBackend {
        fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
            let mut held = self.held.lock();
            if let Some((_, expires)) = held.get(key) {
                if *expires > Instant::now() {
                    return Ok(false);
                }
            }
            held.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
            Ok(true)
        }

        fn release(&self, key: &str, token: &str) -> Result<bool> {
            let mut held = self.held.lock();
            match held.get(key) {
                Some((t, _)) if t == token => {
                    held.remove(key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            retry_count: 3,
            retry_delay_ms: 1,
            retry_jitter_ms: 1,
            drift_factor: 0.01,
            hold_ms: 1_000,
        }
    }

    fn coordinator() -> (LockCoordinator, Arc<TableBackend>) {
        let backend = Arc::new(TableBackend::default());
        (LockCoordinator::new(backend.clone(), fast_config()), backend)
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (locks, backend) = coordinator();
        {
            let guard = locks.acquire("lock:a", Duration::from_secs(5)).unwrap();
            assert!(guard.covers("lock:a"));
            assert!(!guard.covers("lock:b"));
            assert_eq!(backend.held.lock().len(), 1);
        }
        assert!(backend.held.lock().is_empty());
    }

    #[test]
    fn test_timeout_when_held() {
        let (locks, _backend) = coordinator();
        let _guard = locks.acquire("lock:a", Duration::from_secs(5)).unwrap();

        match locks.acquire("lock:a", Duration::from_secs(5)) {
            Err(RepoError::LockTimeout { key, attempts }) => {
                assert_eq!(key, "lock:a");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected LockTimeout, got {:?}", other.map(|g| g.keys().to_vec())),
        };
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let (locks, _backend) = coordinator();
        let first = locks.acquire("lock:a", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let second = locks.acquire("lock:a", Duration::from_secs(5)).unwrap();
        assert!(second.covers("lock:a"));
        drop(first);
        drop(second);
    }

    #[test]
    fn test_acquire_all_dedups_and_rolls_back() {
        let (locks, backend) = coordinator();
        let keys = vec!["lock:b".to_string(), "lock:a".to_string(), "lock:b".to_string()];
        {
            let guard = locks.acquire_all(&keys, Duration::from_secs(5)).unwrap();
            assert_eq!(guard.keys(), &["lock:a".to_string(), "lock:b".to_string()]);
        }

        let _blocker = locks.acquire("lock:b", Duration::from_secs(5)).unwrap();
        assert!(locks.acquire_all(&keys, Duration::from_secs(5)).is_err());
        // lock:a was released again after lock:b timed out
        assert_eq!(backend.held.lock().len(), 1);
    }

    #[test]
    fn test_expired_guard_refuses_commit() {
        let (locks, _backend) = coordinator();
        let live = locks.acquire("lock:a", Duration::from_secs(5)).unwrap();
        assert!(live.ensure_live().is_ok());
        drop(live);

        let short = locks.acquire("lock:a", Duration::from_millis(1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        match short.ensure_live() {
            Err(RepoError::LockTimeout { key, attempts }) => {
                assert_eq!(key, "lock:a");
                assert_eq!(attempts, 0);
            }
            other => panic!("expected LockTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let (locks, _backend) = coordinator();
        let locks = Arc::new(LockCoordinator::new(
            locks.backend.clone(),
            LockConfig {
                retry_count: 1_000,
                ..fast_config()
            },
        ));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let _guard = locks.acquire("lock:shared", Duration::from_secs(5)).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(200));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
