//! Repository configuration
//!
//! Configuration can be built in code or loaded from TOML:
//!
//! ```toml
//! base_model = "<scxml xmlns=\"http://www.w3.org/2005/07/scxml\" version=\"1.0\"/>"
//!
//! [backend]
//! kind = "commit_log"
//! path = "/var/lib/machines"
//! remote = "/mnt/mirror/machines"
//!
//! [lock]
//! retry_count = 10
//! retry_delay_ms = 200
//! retry_jitter_ms = 200
//! drift_factor = 0.01
//! hold_ms = 5000
//! ```

use crate::error::{RepoError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Model given to `version1` of every new machine
pub const DEFAULT_BASE_MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<scxml xmlns="http://www.w3.org/2005/07/scxml" version="1.0" initial="idle">
    <state id="idle"/>
</scxml>
"#;

/// Lock acquisition policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LockConfig {
    /// Retries after the first failed attempt
    #[validate(range(max = 10000))]
    pub retry_count: u32,

    /// Base delay between attempts
    pub retry_delay_ms: u64,

    /// Upper bound of the random delay added to each retry
    pub retry_jitter_ms: u64,

    /// Expected clock drift, as a fraction of the hold time
    #[validate(range(min = 0.0, max = 0.5))]
    pub drift_factor: f64,

    /// Maximum time a lock is held before it expires
    #[validate(range(min = 1))]
    pub hold_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 200,
            drift_factor: 0.01,
            hold_ms: 5_000,
        }
    }
}

/// Which entity store backs the repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// File tree with a commit log, optionally mirrored to `remote`
    CommitLog {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote: Option<PathBuf>,
    },
    /// In-process key-value store
    KeyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_base_model")]
    pub base_model: String,

    pub backend: BackendConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

fn default_base_model() -> String {
    DEFAULT_BASE_MODEL.to_string()
}

impl RepositoryConfig {
    pub fn commit_log<P: AsRef<Path>>(path: P) -> Self {
        RepositoryConfig {
            backend: BackendConfig::CommitLog {
                path: path.as_ref().to_path_buf(),
                remote: None,
            },
            lock: LockConfig::default(),
            base_model: default_base_model(),
        }
    }

    pub fn key_value() -> Self {
        RepositoryConfig {
            backend: BackendConfig::KeyValue,
            lock: LockConfig::default(),
            base_model: default_base_model(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: RepositoryConfig =
            toml::from_str(source).map_err(|e| RepoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RepoError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.lock
            .validate()
            .map_err(|e| RepoError::Config(e.to_string()))?;

        if self.base_model.trim().is_empty() {
            return Err(RepoError::Config("base_model cannot be empty".to_string()));
        }

        if let BackendConfig::CommitLog { path, remote } = &self.backend {
            if path.as_os_str().is_empty() {
                return Err(RepoError::Config("commit_log path cannot be empty".to_string()));
            }
            if remote.as_deref() == Some(path.as_path()) {
                return Err(RepoError::Config(
                    "remote must differ from the repository path".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Repository-level feature flags, stored as the `config` record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryFlags {
    #[serde(default)]
    pub simulation: bool,

    /// Flags this crate does not know about, kept as-is
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RepositoryFlags {
    pub const FILE_NAME: &'static str = "config.json";
}
