use crate::error::WrapError;
use serde::Deserialize;
use std::path::Path;

/// Environment key injected into the child so it knows it is already supervised.
pub const DEFAULT_GUARD_KEY: &str = "FAULTWRAP_2eb692cf86b865a1e26507775c45a753b0cbdcaf";
/// Value paired with [`DEFAULT_GUARD_KEY`].
pub const DEFAULT_GUARD_VALUE: &str = "ae07d73683f44135ad7b5a419645d3bc28415276";

/// Every Rust panic report begins with `thread '<name>'`.
pub const DEFAULT_MARKER: &str = "thread '";
/// Appears right after the thread name in a genuine panic report.
pub const DEFAULT_VERIFICATION_TOKEN: &str = "panicked at";
pub const DEFAULT_WINDOW: usize = 512;

/// Top-level settings loaded from a TOML file (e.g. `faultwrap.toml`).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WrapSettings {
    pub guard: GuardConfig,
    pub detector: DetectorConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub marker: String,
    pub verification_token: String,
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub signals: Vec<String>,
}

// --- Default implementations ---

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_GUARD_KEY.to_string(),
            value: DEFAULT_GUARD_VALUE.to_string(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            verification_token: DEFAULT_VERIFICATION_TOKEN.to_string(),
            window: DEFAULT_WINDOW,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signals: vec![
                "SIGINT".to_string(),
                "SIGTERM".to_string(),
                "SIGHUP".to_string(),
            ],
        }
    }
}

impl GuardConfig {
    /// Empty fields fall back to the defaults, so a settings file may set only one of them.
    pub fn normalized(mut self) -> Self {
        if self.key.is_empty() {
            self.key = DEFAULT_GUARD_KEY.to_string();
        }
        if self.value.is_empty() {
            self.value = DEFAULT_GUARD_VALUE.to_string();
        }
        self
    }
}

impl DetectorConfig {
    pub(crate) fn validate(&self) -> Result<(), WrapError> {
        if self.marker.is_empty() {
            return Err(WrapError::config("detector marker must not be empty"));
        }
        if self.verification_token.is_empty() {
            return Err(WrapError::config(
                "detector verification_token must not be empty",
            ));
        }
        if self.window == 0 {
            return Err(WrapError::config("detector window must be non-zero"));
        }
        if self.window < self.verification_token.len() {
            return Err(WrapError::config(format!(
                "detector window ({}) is shorter than the verification token ({} bytes)",
                self.window,
                self.verification_token.len()
            )));
        }
        Ok(())
    }
}

/// Load settings from a TOML file.
///
/// A missing file yields the defaults; an unreadable or malformed file is a
/// configuration error, since supervising with half-applied settings would
/// be surprising.
pub fn load_settings(path: &Path) -> Result<WrapSettings, WrapError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(WrapSettings::default());
        }
        Err(e) => {
            return Err(WrapError::config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let mut settings: WrapSettings = toml::from_str(&contents)
        .map_err(|e| WrapError::config(format!("failed to parse {}: {}", path.display(), e)))?;
    settings.guard = settings.guard.normalized();
    Ok(settings)
}
