//! Append-only commit log
//!
//! One JSON record per line in `.history/commits.log`. Each record names its
//! parent, so the log forms a single chain. The id is a SHA-256 over the
//! record content; the CRC32 checksum covers the serialized record with the
//! checksum field zeroed.
//!
//! A crash during an append can leave a last line without its newline. That
//! torn tail is ignored when reading and cut off by the next append.

use crate::error::{RepoError, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One commit of the repository history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub parent: Option<String>,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub message: String,
    /// Paths written by the commit, relative to the repository root
    #[serde(default)]
    pub staged: Vec<String>,
    /// Paths deleted by the commit
    #[serde(default)]
    pub removed: Vec<String>,
    pub checksum: u32,
}

impl CommitRecord {
    fn new(parent: Option<String>, message: &str, staged: Vec<String>, removed: Vec<String>) -> Result<Self> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut hasher = Sha256::new();
        hasher.update(parent.as_deref().unwrap_or("").as_bytes());
        hasher.update(timestamp.as_bytes());
        hasher.update(message.as_bytes());
        for path in staged.iter().chain(removed.iter()) {
            hasher.update([0u8]);
            hasher.update(path.as_bytes());
        }
        let id = format!("{:x}", hasher.finalize());

        let mut record = CommitRecord {
            id,
            parent,
            timestamp,
            message: message.to_string(),
            staged,
            removed,
            checksum: 0,
        };
        record.checksum = record.compute_checksum()?;
        Ok(record)
    }

    fn compute_checksum(&self) -> Result<u32> {
        let mut unsealed = self.clone();
        unsealed.checksum = 0;
        Ok(crc32fast::hash(&serde_json::to_vec(&unsealed)?))
    }

    /// Whether the stored checksum matches the record content
    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum()
            .map(|sum| sum == self.checksum)
            .unwrap_or(false)
    }
}

const TAIL_BLOCK: u64 = 4096;

/// End of the log as found on disk
struct Tail {
    head: Option<String>,
    /// Length up to and including the last newline
    complete_len: u64,
    len: u64,
}

impl Tail {
    fn torn_bytes(&self) -> u64 {
        self.len - self.complete_len
    }
}

/// Handle on the commit log file

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    head: Mutex<Option<String>>,
}

impl Journal {
    pub const FILE_NAME: &'static str = "commits.log";

    /// Open the journal at `path`, reading the current head if it exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tail = Self::read_tail(&path)?;
        if tail.torn_bytes() > 0 {
            warn!(
                "Ignoring {} bytes of an unfinished commit at the end of {:?}",
                tail.torn_bytes(),
                path
            );
        }
        Ok(Journal {
            path,
            head: Mutex::new(tail.head),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn head(&self) -> Option<String> {
        self.head.lock().clone()
    }

    /// Append a new commit on top of the current head
    ///
    /// The head is re-read from disk, so handles in other processes that
    /// appended meanwhile are chained onto. Callers serialize appends with
    /// the repository lock. A torn tail is truncated before writing.
    pub fn append(&self, message: &str, staged: Vec<String>, removed: Vec<String>) -> Result<CommitRecord> {
        let mut head = self.head.lock();
        let tail = Self::read_tail(&self.path)?;
        *head = tail.head.clone();
        let record = CommitRecord::new(head.clone(), message, staged, removed)?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if tail.torn_bytes() > 0 {
            warn!(
                "Truncating {} bytes of an unfinished commit from {:?}",
                tail.torn_bytes(),
                self.path
            );
            file.set_len(tail.complete_len)?;
        }
        file.write_all(&line)?;
        file.sync_all()?;

        *head = Some(record.id.clone());
        Ok(record)
    }

    /// All commits, oldest first
    pub fn records(&self) -> Result<Vec<CommitRecord>> {
        Self::read_records(&self.path)
    }

    /// Check every checksum and the parent chain
    pub fn verify(&self) -> Result<usize> {
        let records = self.records()?;
        let mut expected_parent: Option<&str> = None;

        for (n, record) in records.iter().enumerate() {
            if !record.verify_checksum() {
                return Err(RepoError::StorageFailure(format!(
                    "commit {} ({}) has a bad checksum",
                    n, record.id
                )));
            }
            if record.parent.as_deref() != expected_parent {
                return Err(RepoError::StorageFailure(format!(
                    "commit {} ({}) does not follow {:?}",
                    n, record.id, expected_parent
                )));
            }
            expected_parent = Some(&record.id);
        }

        Ok(records.len())
    }

    /// Find the last complete record, reading backwards from the end of the file
    fn read_tail(path: &Path) -> Result<Tail> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(Tail {
                    head: None,
                    complete_len: 0,
                    len: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        let mut tail: Vec<u8> = Vec::new();
        let mut offset = len;
        let mut complete_len = None;
        loop {
            let step = TAIL_BLOCK.min(offset);
            offset -= step;
            let mut block = vec![0u8; step as usize];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut block)?;
            block.extend_from_slice(&tail);
            tail = block;

            if complete_len.is_none() {
                complete_len = tail
                    .iter()
                    .rposition(|&b| b == b'\n')
                    .map(|pos| offset + pos as u64 + 1);
            }

            if let Some(end) = complete_len {
                let body = &tail[..(end - offset) as usize];
                let mut lines: Vec<&[u8]> = body.split(|&b| b == b'\n').collect();
                lines.pop();
                // The first line may continue in the block before this one
                let skip = if offset == 0 { 0 } else { 1 };
                let last = lines
                    .iter()
                    .skip(skip)
                    .rev()
                    .find(|line| line.iter().any(|b| !b.is_ascii_whitespace()));
                if let Some(last) = last {
                    let record: CommitRecord = serde_json::from_slice(last)?;
                    return Ok(Tail {
                        head: Some(record.id),
                        complete_len: end,
                        len,
                    });
                }
            }

            if offset == 0 {
                return Ok(Tail {
                    head: None,
                    complete_len: complete_len.unwrap_or(0),
                    len,
                });
            }
        }
    }

    fn read_records(path: &Path) -> Result<Vec<CommitRecord>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<&[u8]> = bytes.split(|&b| b == b'\n').collect();
        if let Some(torn) = lines.pop() {
            if !torn.is_empty() {
                warn!("Skipping {} bytes of an unfinished commit in {:?}", torn.len(), path);
            }
        }

        let mut records = Vec::new();
        for line in lines {
            if line.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            records.push(serde_json::from_slice(line)?);
        }
        Ok(records)
    }
}
