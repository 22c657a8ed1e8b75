//! Host and surface configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```toml
//! host_origin = "http://localhost:5173"
//! console_capacity = 200
//!
//! [surface]
//! timeout_ms = 2000
//! allowed_origins = ["https://api.example.com"]
//! ```

use crate::error::ConfigError;
use crate::message::DEFAULT_LOG_CAPACITY;
use crate::shim::WILDCARD_ORIGIN;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Capabilities granted to the rendering surface, as in a frame's
/// `sandbox` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub allow_scripts: bool,
    pub allow_same_origin: bool,
    pub allow_popups: bool,
    pub allow_top_navigation: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allow_scripts: true,
            allow_same_origin: false,
            allow_popups: false,
            allow_top_navigation: false,
        }
    }
}

impl SandboxPolicy {
    /// Value for a frame `sandbox` attribute.
    pub fn attribute(&self) -> String {
        [
            (self.allow_scripts, "allow-scripts"),
            (self.allow_same_origin, "allow-same-origin"),
            (self.allow_popups, "allow-popups"),
            (self.allow_top_navigation, "allow-top-navigation"),
        ]
        .iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, token)| *token)
        .collect::<Vec<_>>()
        .join(" ")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allow_scripts && self.allow_same_origin {
            return Err(ConfigError::Invalid(
                "allow-scripts together with allow-same-origin lets framed content remove its own sandbox"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Limits and capabilities for each isolated surface.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub policy: SandboxPolicy,
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Execution budget for loading one document (default: 5000ms, None = unlimited)
    pub timeout_ms: Option<u64>,
    /// Origins `fetch()` may reach (empty = fetch disabled)
    pub allowed_origins: Vec<String>,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            policy: SandboxPolicy::default(),
            max_heap_size: Some(64 * 1024 * 1024),
            timeout_ms: Some(5_000),
            allowed_origins: vec![],
        }
    }
}

impl SurfaceConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration for a [`SandboxHost`](crate::SandboxHost).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Origin of the hosting page; targeted messages must match it.
    pub host_origin: String,
    /// Origin the injected shim addresses its messages to.
    pub target_origin: String,
    /// Title for synthesized documents.
    pub title: String,
    /// Inject the capability lockdown into built documents.
    pub lockdown: bool,
    pub console_capacity: usize,
    /// Clear the console when a run starts.
    pub clear_on_run: bool,
    /// Quiet period after the last edit before an automatic run.
    pub debounce_ms: u64,
    pub surface: SurfaceConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_origin: String::from("http://localhost"),
            target_origin: WILDCARD_ORIGIN.to_string(),
            title: crate::document::DEFAULT_TITLE.to_string(),
            lockdown: true,
            console_capacity: DEFAULT_LOG_CAPACITY,
            clear_on_run: true,
            debounce_ms: 500,
            surface: SurfaceConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.surface.policy.validate()?;
        if self.console_capacity == 0 {
            return Err(ConfigError::Invalid("console_capacity must be at least 1".to_string()));
        }
        url::Url::parse(&self.host_origin)
            .map_err(|e| ConfigError::Invalid(format!("host_origin '{}': {}", self.host_origin, e)))?;
        if self.target_origin != WILDCARD_ORIGIN {
            url::Url::parse(&self.target_origin)
                .map_err(|e| ConfigError::Invalid(format!("target_origin '{}': {}", self.target_origin, e)))?;
        }
        for origin in &self.surface.allowed_origins {
            url::Url::parse(origin)
                .map_err(|e| ConfigError::Invalid(format!("allowed origin '{}': {}", origin, e)))?;
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_policy_is_scripts_only() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.attribute(), "allow-scripts");
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_scripts_with_same_origin_rejected() {
        let policy = SandboxPolicy {
            allow_same_origin: true,
            ..Default::default()
        };
        assert_eq!(policy.attribute(), "allow-scripts allow-same-origin");
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = HostConfig::from_toml_str(
            r#"
            host_origin = "http://localhost:5173"
            console_capacity = 200

            [surface]
            timeout_ms = 2000
            allowed_origins = ["https://api.example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.host_origin, "http://localhost:5173");
        assert_eq!(config.console_capacity, 200);
        assert_eq!(config.target_origin, "*");
        assert!(config.lockdown);
        assert_eq!(config.surface.timeout(), Some(Duration::from_millis(2000)));
        assert_eq!(config.surface.max_heap_size, Some(64 * 1024 * 1024));
        assert_eq!(config.surface.policy, SandboxPolicy::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(HostConfig::from_toml_str("console_capacity = 0").is_err());
        assert!(HostConfig::from_toml_str("target_origin = \"not a url\"").is_err());
        assert!(HostConfig::from_toml_str("host_origin = \"localhost\"").is_err());
        assert!(HostConfig::from_toml_str("[surface.policy]\nallow_same_origin = true").is_err());
        assert!(HostConfig::from_toml_str("lockdown = \"yes\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "title = \"Studio\"\ndebounce_ms = 250").unwrap();

        let config = HostConfig::load(file.path()).unwrap();
        assert_eq!(config.title, "Studio");
        assert_eq!(config.debounce(), Duration::from_millis(250));
    }

    #[test]
    fn test_load_missing_file() {
        let err = HostConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
