//! One-way sealing of versions
//!
//! A version starts unsealed. Sealing validates its model and flips
//! `isSealed`; nothing flips it back. Model edits require an unsealed
//! version, instance creation and new versions require a sealed one.

use crate::entity::VersionInfo;
use crate::error::{RepoError, Result, StateViolation};
use std::sync::Arc;
use tracing::debug;

/// SCXML namespace expected on the root element
pub const SCXML_NAMESPACE: &str = "http://www.w3.org/2005/07/scxml";

/// Yes/no oracle deciding whether a model may be sealed
///
/// `Ok(false)` rejects the model, `Err` reports that validation itself
/// failed. Both prevent sealing.
pub trait ModelValidator: Send + Sync {
    fn validate(&self, model: &[u8]) -> std::result::Result<bool, String>;
}

impl<F> ModelValidator for F
where
    F: Fn(&[u8]) -> std::result::Result<bool, String> + Send + Sync,
{
    fn validate(&self, model: &[u8]) -> std::result::Result<bool, String> {
        self(model)
    }
}

/// Structural check: UTF-8 text whose root element is `scxml` in the SCXML
/// namespace. Does not validate the document body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScxmlRootValidator;

impl ModelValidator for ScxmlRootValidator {
    fn validate(&self, model: &[u8]) -> std::result::Result<bool, String> {
        let text = std::str::from_utf8(model).map_err(|e| format!("model is not UTF-8: {}", e))?;
        let Some(tag) = root_tag(text) else {
            return Ok(false);
        };

        let name_end = tag
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .unwrap_or(tag.len());
        let name = &tag[..name_end];
        let local = name.rsplit(':').next().unwrap_or(name);

        Ok(local == "scxml" && tag.contains(SCXML_NAMESPACE))
    }
}

/// Text of the first element's start tag, without the leading `<`
fn root_tag(text: &str) -> Option<&str> {
    let mut rest = text.trim_start_matches('\u{feff}');
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("<?") {
            rest = &after[after.find("?>")? + 2..];
        } else if let Some(after) = rest.strip_prefix("<!--") {
            rest = &after[after.find("-->")? + 3..];
        } else if let Some(after) = rest.strip_prefix("<!") {
            rest = &after[after.find('>')? + 1..];
        } else if let Some(after) = rest.strip_prefix('<') {
            let end = after.find('>')?;
            return Some(&after[..end]);
        } else {
            return None;
        }
    }
}

/// Enforces the seal transition and the checks that depend on it
#[derive(Clone)]
pub struct SealGuard {
    validator: Arc<dyn ModelValidator>,
}

impl SealGuard {
    pub fn new(validator: Arc<dyn ModelValidator>) -> Self {
        SealGuard { validator }
    }

    /// Payload mutations need an unsealed version
    pub fn ensure_unsealed(info: &VersionInfo) -> Result<()> {
        if info.is_sealed {
            return Err(RepoError::InvalidState(StateViolation::VersionSealed));
        }
        Ok(())
    }

    /// Instances can only be created under a sealed version
    pub fn ensure_sealed(info: &VersionInfo) -> Result<()> {
        if !info.is_sealed {
            return Err(RepoError::InvalidState(StateViolation::VersionNotSealed));
        }
        Ok(())
    }

    /// A new version needs the latest one sealed
    pub fn ensure_previous_sealed(previous: &VersionInfo) -> Result<()> {
        if !previous.is_sealed {
            return Err(RepoError::InvalidState(StateViolation::PreviousVersionNotSealed));
        }
        Ok(())
    }

    /// Validate `model` and return the sealed form of `info`
    ///
    /// An empty model is rejected without consulting the validator.
    pub fn seal(&self, info: &VersionInfo, model: &[u8]) -> Result<VersionInfo> {
        if info.is_sealed {
            return Err(RepoError::InvalidState(StateViolation::AlreadySealed));
        }
        if model.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(RepoError::InvalidModel("model is empty".to_string()));
        }

        match self.validator.validate(model) {
            Ok(true) => {}
            Ok(false) => {
                return Err(RepoError::InvalidModel("rejected by validator".to_string()));
            }
            Err(reason) => return Err(RepoError::InvalidModel(reason)),
        }

        debug!("Model of {} bytes passed validation", model.len());
        Ok(VersionInfo {
            is_sealed: true,
            payload: info.payload.clone(),
        })
    }
}

impl Default for SealGuard {
    fn default() -> Self {
        SealGuard::new(Arc::new(ScxmlRootValidator))
    }
}
