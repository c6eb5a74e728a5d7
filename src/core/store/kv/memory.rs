//! Thread-safe in-process key-value store
//!
//! Implements the subset of Redis semantics the repository needs: hashes,
//! sets, sorted sets and strings with a TTL. `exec` applies a batch under a
//! single lock, so other callers observe all of it or none of it.

use super::{KvClient, KvCommand};
use crate::error::{RepoError, Result};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Value {
    Str {
        value: String,
        expires: Option<Instant>,
    },
    Hash(AHashMap<String, Vec<u8>>),
    Set(AHashSet<String>),
    /// Kept sorted by (score, member)
    ZSet(Vec<(f64, String)>),
}

impl Value {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Value::Str { expires: Some(at), .. } if *at <= now)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Str { .. } => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }
}

fn wrong_type(key: &str, found: &Value, wanted: &str) -> RepoError {
    RepoError::StorageFailure(format!(
        "WRONGTYPE {} holds a {}, expected a {}",
        key,
        found.type_name(),
        wanted
    ))
}

/// In-memory [`KvClient`]
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: Mutex<AHashMap<String, Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .values()
            .filter(|v| !v.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live<'a>(data: &'a mut AHashMap<String, Value>, key: &str) -> Option<&'a Value> {
        if data.get(key).map_or(false, |v| v.is_expired(Instant::now())) {
            data.remove(key);
        }
        data.get(key)
    }

    fn apply(data: &mut AHashMap<String, Value>, command: KvCommand) -> Result<()> {
        match command {
            KvCommand::HSet { key, fields } => {
                let entry = data.entry(key.clone()).or_insert_with(|| Value::Hash(AHashMap::new()));
                match entry {
                    Value::Hash(map) => map.extend(fields),
                    other => return Err(wrong_type(&key, other, "hash")),
                }
            }
            KvCommand::HIncrBy { key, field, delta } => {
                let entry = data.entry(key.clone()).or_insert_with(|| Value::Hash(AHashMap::new()));
                match entry {
                    Value::Hash(map) => {
                        let current = match map.get(&field) {
                            Some(bytes) => parse_int(bytes)?,
                            None => 0,
                        };
                        map.insert(field, (current + delta).to_string().into_bytes());
                    }
                    other => return Err(wrong_type(&key, other, "hash")),
                }
            }
            KvCommand::SAdd { key, member } => {
                let entry = data.entry(key.clone()).or_insert_with(|| Value::Set(AHashSet::new()));
                match entry {
                    Value::Set(set) => {
                        set.insert(member);
                    }
                    other => return Err(wrong_type(&key, other, "set")),
                }
            }
            KvCommand::SRem { key, member } => {
                let emptied = match data.get_mut(&key) {
                    None => false,
                    Some(Value::Set(set)) => {
                        set.remove(&member);
                        set.is_empty()
                    }
                    Some(other) => return Err(wrong_type(&key, other, "set")),
                };
                if emptied {
                    data.remove(&key);
                }
            }
            KvCommand::ZAdd { key, score, member } => {
                let entry = data.entry(key.clone()).or_insert_with(|| Value::ZSet(Vec::new()));
                match entry {
                    Value::ZSet(members) => {
                        members.retain(|(_, m)| *m != member);
                        let at = members
                            .iter()
                            .position(|(s, m)| (*s, m.as_str()) > (score, member.as_str()))
                            .unwrap_or(members.len());
                        members.insert(at, (score, member));
                    }
                    other => return Err(wrong_type(&key, other, "zset")),
                }
            }
            KvCommand::ZRem { key, member } => {
                let emptied = match data.get_mut(&key) {
                    None => false,
                    Some(Value::ZSet(members)) => {
                        members.retain(|(_, m)| *m != member);
                        members.is_empty()
                    }
                    Some(other) => return Err(wrong_type(&key, other, "zset")),
                };
                if emptied {
                    data.remove(&key);
                }
            }
            KvCommand::Del { key } => {
                data.remove(&key);
            }
        }
        Ok(())
    }
}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RepoError::StorageFailure("hash value is not an integer".to_string()))
}

impl KvClient for MemoryKv {
    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(None),
            Some(Value::Hash(map)) => Ok(map.get(field).cloned()),
            Some(other) => Err(wrong_type(key, other, "hash")),
        }
    }

    fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(map)) => {
                let mut fields: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                fields.sort();
                Ok(fields)
            }
            Some(other) => Err(wrong_type(key, other, "hash")),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock();
        Ok(Self::live(&mut data, key).is_some())
    }

    fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(other) => Err(wrong_type(key, other, "set")),
        }
    }

    fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, other, "set")),
        }
    }

    fn scard(&self, key: &str) -> Result<usize> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len()),
            Some(other) => Err(wrong_type(key, other, "set")),
        }
    }

    fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(None),
            Some(Value::ZSet(members)) => Ok(members
                .iter()
                .find(|(_, m)| m == member)
                .map(|(score, _)| *score)),
            Some(other) => Err(wrong_type(key, other, "zset")),
        }
    }

    fn zrange(&self, key: &str) -> Result<Vec<String>> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => Ok(members.iter().map(|(_, m)| m.clone()).collect()),
            Some(other) => Err(wrong_type(key, other, "zset")),
        }
    }

    fn zcard(&self, key: &str) -> Result<usize> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            None => Ok(0),
            Some(Value::ZSet(members)) => Ok(members.len()),
            Some(other) => Err(wrong_type(key, other, "zset")),
        }
    }

    fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut data = self.data.lock();
        if Self::live(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Value::Str {
                value: value.to_string(),
                expires: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut data = self.data.lock();
        match Self::live(&mut data, key) {
            Some(Value::Str { value: current, .. }) if current == value => {
                data.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn exec(&self, commands: Vec<KvCommand>) -> Result<()> {
        let mut data = self.data.lock();
        let now = Instant::now();

        // Apply to copies of the touched keys, publish only if every command succeeds
        let mut touched: Vec<String> = Vec::new();
        let mut scratch: AHashMap<String, Value> = AHashMap::new();
        for command in &commands {
            let key = command.key();
            if touched.iter().any(|k| k == key) {
                continue;
            }
            touched.push(key.to_string());
            if let Some(value) = data.get(key).filter(|v| !v.is_expired(now)) {
                scratch.insert(key.to_string(), value.clone());
            }
        }

        for command in commands {
            Self::apply(&mut scratch, command)?;
        }

        for key in touched {
            match scratch.remove(&key) {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
