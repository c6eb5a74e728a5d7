//! Lock files for the commit-log store
//!
//! Each lock key becomes a file named after the xxh3 hash of the key. The
//! file is created with `create_new`, so creation is the atomic test-and-set.
//! It records the owner token and an expiry; an expired file may be taken
//! over by the next caller.
//!
//! A lock file is only ever removed while holding its `.takeover` marker,
//! itself created with `create_new`. Takeover re-checks the expiry under the
//! marker, so two callers that both saw the same expired file cannot both
//! replace it.

use super::LockBackend;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Markers older than this were left behind by a crashed process
const MARKER_STALE: Duration = Duration::from_secs(1);

/// How many times `release` polls for a busy marker, 1ms apart
const RELEASE_POLLS: u32 = 2_000;

/// Exclusive right to remove one lock file; dropping it removes the marker
struct TakeoverMarker {
    path: PathBuf,
}

impl Drop for TakeoverMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove takeover marker {:?}: {}", self.path, e);
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    key: String,
    token: String,
    expires_at_ms: u64,
}

/// Advisory locks stored as files in a directory
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileLockBackend {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:016x}.lock", xxh3_64(key.as_bytes())))
    }

    fn read_record(path: &Path) -> Option<LockRecord> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn is_stale(path: &Path, ttl: Duration) -> bool {
        match Self::read_record(path) {
            Some(record) => record.expires_at_ms <= now_ms(),
            // Half-written or corrupt record: stale once older than the ttl
            None => Self::age(path).map_or(false, |age| age > ttl),
        }
    }

    fn age(path: &Path) -> Option<Duration> {
        fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
    }

    /// Claim the takeover marker of `lock`, or `None` while someone else holds it
    fn claim_marker(lock: &Path) -> Result<Option<TakeoverMarker>> {
        let path = lock.with_extension("takeover");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(TakeoverMarker { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if Self::age(&path).map_or(false, |age| age > MARKER_STALE) {
                    warn!("Removing abandoned takeover marker {:?}", path);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(&self, path: &Path, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let record = LockRecord {
            key: key.to_string(),
            token: token.to_string(),
            expires_at_ms: now_ms() + ttl.as_millis() as u64,
        };
        file.write_all(&serde_json::to_vec(&record)?)?;
        file.sync_all()?;
        Ok(true)
    }
}

impl LockBackend for FileLockBackend {
    fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(key);

        if self.try_create(&path, key, token, ttl)? {
            return Ok(true);
        }

        if !Self::is_stale(&path, ttl) {
            return Ok(false);
        }

        let _marker = match Self::claim_marker(&path)? {
            Some(marker) => marker,
            None => return Ok(false),
        };
        // Another caller may have replaced the file before we got the marker
        if !Self::is_stale(&path, ttl) {
            return Ok(false);
        }

        warn!("Taking over expired lock {} at {:?}", key, path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.try_create(&path, key, token, ttl)
    }

    fn release(&self, key: &str, token: &str) -> Result<bool> {
        let path = self.lock_path(key);

        let mut marker = None;
        for _ in 0..RELEASE_POLLS {
            marker = Self::claim_marker(&path)?;
            if marker.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        let _marker = match marker {
            Some(marker) => marker,
            None => {
                debug!("Leaving lock {} to expire, takeover marker stayed busy", key);
                return Ok(false);
            }
        };

        match Self::read_record(&path) {
            Some(record) if record.token == token => {
                fs::remove_file(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
