/// Identity guard: tells a freshly started process whether it is the
/// supervised child or the parent that still has to spawn one.
///
/// The decision rests on a single environment key/value pair that the parent
/// injects into the child's environment. Anything else (missing variable,
/// different value, non-UTF-8 value) means "not yet a child".
use crate::config::GuardConfig;
use crate::error::WrapError;
use std::ffi::OsStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityGuard {
    key: String,
    value: String,
}

impl IdentityGuard {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Check the current process environment.
    pub fn is_child(&self) -> bool {
        self.matches(std::env::var_os(&self.key).as_deref())
    }

    /// Check an observed value for the guard key.
    pub fn matches(&self, observed: Option<&OsStr>) -> bool {
        observed.is_some_and(|v| v == OsStr::new(&self.value))
    }

    /// The pair must survive `Command::env` unchanged.
    pub(crate) fn validate(&self) -> Result<(), WrapError> {
        if self.key.is_empty() {
            return Err(WrapError::config("guard key must not be empty"));
        }
        if self.key.contains('=') || self.key.contains('\0') {
            return Err(WrapError::config(format!(
                "guard key {:?} is not a valid environment variable name",
                self.key
            )));
        }
        if self.value.contains('\0') {
            return Err(WrapError::config("guard value must not contain NUL"));
        }
        Ok(())
    }
}

impl Default for IdentityGuard {
    fn default() -> Self {
        GuardConfig::default().into()
    }
}

impl From<GuardConfig> for IdentityGuard {
    fn from(config: GuardConfig) -> Self {
        let config = config.normalized();
        Self::new(config.key, config.value)
    }
}
