// ABOUTME: Configuration for the build system manager and its fallback settings
// ABOUTME: Loaded from the [build_settings] table of a TOML file with env overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Result;

/// Extra inputs to the fallback settings computer. Fixed at construction so
/// fallback computation stays a pure function of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackOptions {
    /// Appended to C and Objective-C fallback arguments
    #[serde(default)]
    pub c_flags: Vec<String>,

    /// Appended to C++ and Objective-C++ fallback arguments
    #[serde(default)]
    pub cxx_flags: Vec<String>,

    /// Appended to Swift fallback arguments
    #[serde(default)]
    pub swift_flags: Vec<String>,

    /// SDK root (`-sdk` for Swift, `-isysroot` for C-family)
    #[serde(default)]
    pub sdk: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Coalesce window for change notifications (default: 100ms)
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Upper bound on a first resolution before fallback is served (default: 3000ms)
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,

    /// Upper bound on one delegate's handling of a change batch (default: 5000ms)
    #[serde(default = "default_delegate_timeout_ms")]
    pub delegate_timeout_ms: u64,

    /// Capacity of backend event channels (default: 256)
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    pub fallback: FallbackOptions,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            delegate_timeout_ms: default_delegate_timeout_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            fallback: FallbackOptions::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    build_settings: Option<ManagerConfig>,
}

impl ManagerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn delegate_timeout(&self) -> Duration {
        Duration::from_millis(self.delegate_timeout_ms)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = duration_millis(debounce);
        self
    }

    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout_ms = duration_millis(timeout);
        self
    }

    pub fn with_delegate_timeout(mut self, timeout: Duration) -> Self {
        self.delegate_timeout_ms = duration_millis(timeout);
        self
    }

    /// Parse the `[build_settings]` table out of a TOML document. A document
    /// without the table yields defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        Ok(file.build_settings.unwrap_or_default())
    }

    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No build settings config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            debounce_ms = config.debounce_ms,
            fallback_timeout_ms = config.fallback_timeout_ms,
            "Loaded build settings configuration"
        );
        Ok(config)
    }

    /// Apply `BUILDSCOPE_*` environment variable overrides.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = lookup("BUILDSCOPE_DEBOUNCE_MS") {
            match value.parse() {
                Ok(ms) => self.debounce_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid BUILDSCOPE_DEBOUNCE_MS"),
            }
        }
        if let Some(value) = lookup("BUILDSCOPE_FALLBACK_TIMEOUT_MS") {
            match value.parse() {
                Ok(ms) => self.fallback_timeout_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid BUILDSCOPE_FALLBACK_TIMEOUT_MS"),
            }
        }
        if let Some(value) = lookup("BUILDSCOPE_DELEGATE_TIMEOUT_MS") {
            match value.parse() {
                Ok(ms) => self.delegate_timeout_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid BUILDSCOPE_DELEGATE_TIMEOUT_MS"),
            }
        }
        if let Some(sdk) = lookup("BUILDSCOPE_SDK") {
            self.fallback.sdk = Some(PathBuf::from(sdk));
        }
        self
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// Default value functions
fn default_debounce_ms() -> u64 {
    100
}
fn default_fallback_timeout_ms() -> u64 {
    3000
}
fn default_delegate_timeout_ms() -> u64 {
    5000
}
fn default_event_channel_capacity() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn parses_partial_table_with_defaults() {
        let config = ManagerConfig::from_toml_str(
            r#"
[build_settings]
debounce_ms = 40

[build_settings.fallback]
cxx_flags = ["-std=c++20"]
"#,
        )
        .unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(40));
        assert_eq!(config.fallback_timeout_ms, 3000);
        assert_eq!(config.fallback.cxx_flags, vec!["-std=c++20".to_string()]);
    }

    #[test]
    fn missing_table_and_missing_file_yield_defaults() {
        assert_eq!(
            ManagerConfig::from_toml_str("[other]\nkey = 1\n").unwrap(),
            ManagerConfig::default()
        );

        let tmp = TempDir::new().unwrap();
        let config = ManagerConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = ManagerConfig::default()
            .with_debounce(Duration::MAX)
            .with_delegate_timeout(Duration::from_millis(250));
        assert_eq!(config.debounce_ms, u64::MAX);
        assert_eq!(config.delegate_timeout(), Duration::from_millis(250));
        assert_eq!(duration_millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("buildscope.toml");
        std::fs::write(&path, "[build_settings]\nfallback_timeout_ms = 10\n").unwrap();
        assert_eq!(ManagerConfig::load(&path).unwrap().fallback_timeout_ms, 10);

        std::fs::write(&path, "[build_settings]\ndebounce_ms = \"soon\"\n").unwrap();
        assert!(ManagerConfig::load(&path).is_err());
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("BUILDSCOPE_DEBOUNCE_MS", "25"),
            ("BUILDSCOPE_FALLBACK_TIMEOUT_MS", "later"),
            ("BUILDSCOPE_SDK", "/sdk"),
        ]
        .into_iter()
        .collect();
        let config = ManagerConfig::default()
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.debounce_ms, 25);
        assert_eq!(config.fallback_timeout_ms, 3000);
        assert_eq!(config.fallback.sdk, Some(PathBuf::from("/sdk")));
    }
}
