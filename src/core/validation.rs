//! Validation for machine names and sequence keys
//!
//! Machine names end up as path components of the commit-log tree and as
//! segments of key-value keys, so they are restricted to a conservative
//! character set. Child keys (`version3`, `instance12`, ...) are always
//! minted by the allocator and follow the `<prefix><n>` shape.

use crate::error::{RepoError, Result};
use regex::Regex;
use std::fmt;

/// Validated machine name
///
/// # Rules
/// - Letters, digits, `_`, `-` and `.` only
/// - Must not start with `.` or `-`
/// - Length: 1-128 characters
///
/// # Examples
///
/// ```
/// use machine_vault::MachineName;
///
/// assert!(MachineName::new("deadline").is_ok());
/// assert!(MachineName::new("order_flow.v2").is_ok());
/// assert!(MachineName::new("../etc").is_err());
/// assert!(MachineName::new("a:b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineName(String);

impl MachineName {
    const PATTERN: &'static str = r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$";

    const MAX_LENGTH: usize = 128;

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(MachineName(name))
    }

    fn validate(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(RepoError::InvalidName(
                "machine name cannot be empty".to_string(),
            ));
        }

        if name.len() > Self::MAX_LENGTH {
            return Err(RepoError::InvalidName(format!(
                "machine name too long (max {} characters)",
                Self::MAX_LENGTH
            )));
        }

        let re = Regex::new(Self::PATTERN).map_err(|e| RepoError::InvalidName(e.to_string()))?;
        if !re.is_match(name) {
            return Err(RepoError::InvalidName(format!(
                "machine name '{}' may only contain letters, digits, '_', '-' and '.'",
                name
            )));
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl AsRef<str> for MachineName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dense, 1-based child key such as `version1` or `snapshot42`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceName {
    prefix: &'static str,
    number: u64,
}

impl SequenceName {
    pub fn new(prefix: &'static str, number: u64) -> Self {
        SequenceName { prefix, number }
    }

    /// Parse `key` as `<prefix><n>` with `n >= 1`
    pub fn parse(prefix: &'static str, key: &str) -> Option<Self> {
        let digits = key.strip_prefix(prefix)?;
        if digits.is_empty() || digits.starts_with('0') {
            return None;
        }
        digits
            .parse::<u64>()
            .ok()
            .map(|number| SequenceName { prefix, number })
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    pub fn number(&self) -> u64 {
        self.number
    }
}

impl fmt::Display for SequenceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.number)
    }
}
