//! Client Configuration
//!
//! Configuration for the multiplexer and its HTTP collaborators, loaded from
//! `~/.config/chatmux/client.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://localhost:8080/api"
//! user_id = "1"
//! request_timeout_secs = 300
//!
//! [streaming]
//! max_concurrent_streams = 16
//! channel_capacity = 256
//! error_display_ms = 3000
//! title_max_chars = 30
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default API root of the chat server
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api";

/// Environment variable overriding [`MuxConfig::base_url`]
pub const ENV_BASE_URL: &str = "CHATMUX_BASE_URL";
/// Environment variable overriding [`MuxConfig::user_id`]
pub const ENV_USER_ID: &str = "CHATMUX_USER_ID";
/// Environment variable overriding [`MuxConfig::auth_token`]
pub const ENV_TOKEN: &str = "CHATMUX_TOKEN";
/// Environment variable overriding [`MuxConfig::max_concurrent_streams`]
pub const ENV_MAX_STREAMS: &str = "CHATMUX_MAX_STREAMS";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// API root, e.g. `http://localhost:8080/api`
    pub base_url: Option<String>,
    /// Value sent as `X-User-Id`
    pub user_id: Option<String>,
    /// Bearer token
    pub auth_token: Option<String>,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Streaming section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingToml {
    /// Cap on concurrently open sessions
    pub max_concurrent_streams: Option<usize>,
    /// Capacity of the session event channel
    pub channel_capacity: Option<usize>,
    /// How long a failed stream stays in the `error` stage
    pub error_display_ms: Option<u64>,
    /// Length of a provisional conversation title
    pub title_max_chars: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Server settings
    pub server: ServerToml,
    /// Streaming settings
    pub streaming: StreamingToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Resolved client configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxConfig {
    /// API root of the chat server
    pub base_url: String,
    /// Value sent as `X-User-Id`
    pub user_id: String,
    /// Bearer token, if any
    pub auth_token: Option<String>,
    /// Whole-request timeout in seconds
    pub request_timeout_secs: u64,
    /// How long a failed stream stays in the `error` stage, in milliseconds
    pub error_display_ms: u64,
    /// Length of a provisional conversation title, in characters
    pub title_max_chars: usize,
    /// Cap on concurrently open sessions
    pub max_concurrent_streams: usize,
    /// Capacity of the session event channel
    pub channel_capacity: usize,
    /// File the configuration was loaded from, if any
    pub config_file_path: Option<PathBuf>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_id: "1".to_string(),
            auth_token: None,
            request_timeout_secs: 300,
            error_display_ms: 3000,
            title_max_chars: 30,
            max_concurrent_streams: 16,
            channel_capacity: 256,
            config_file_path: None,
        }
    }
}

impl MuxConfig {
    /// Whole-request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Error display window
    #[must_use]
    pub fn error_display(&self) -> Duration {
        Duration::from_millis(self.error_display_ms)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an empty base URL or a zero
    /// limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError("base_url is empty".into()));
        }
        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_streams must be at least 1".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.title_max_chars == 0 {
            return Err(ConfigError::ValidationError(
                "title_max_chars must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chatmux/client.toml` or the platform equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chatmux").join("client.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// resulting values are invalid. A missing file is not an error.
pub fn load_config() -> Result<MuxConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the resulting
/// values are invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<MuxConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment overrides through `env`
fn load_with_env<F>(path: Option<PathBuf>, env: F) -> Result<MuxConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = MuxConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());

            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut MuxConfig, toml: &ClientToml) {
    if let Some(ref url) = toml.server.base_url {
        config.base_url = url.clone();
    }
    if let Some(ref user) = toml.server.user_id {
        config.user_id = user.clone();
    }
    if toml.server.auth_token.is_some() {
        config.auth_token = toml.server.auth_token.clone();
    }
    if let Some(secs) = toml.server.request_timeout_secs {
        config.request_timeout_secs = secs;
    }

    if let Some(max) = toml.streaming.max_concurrent_streams {
        config.max_concurrent_streams = max;
    }
    if let Some(capacity) = toml.streaming.channel_capacity {
        config.channel_capacity = capacity;
    }
    if let Some(ms) = toml.streaming.error_display_ms {
        config.error_display_ms = ms;
    }
    if let Some(chars) = toml.streaming.title_max_chars {
        config.title_max_chars = chars;
    }
}

fn apply_env_config<F>(config: &mut MuxConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env(ENV_BASE_URL) {
        config.base_url = url;
    }
    if let Some(user) = env(ENV_USER_ID) {
        config.user_id = user;
    }
    if let Some(token) = env(ENV_TOKEN) {
        config.auth_token = Some(token).filter(|t| !t.is_empty());
    }
    if let Some(max) = env(ENV_MAX_STREAMS) {
        match max.parse::<usize>() {
            Ok(n) => config.max_concurrent_streams = n,
            Err(_) => tracing::warn!(value = %max, "Ignoring non-numeric {ENV_MAX_STREAMS}"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,
    /// User id override
    pub user_id: Option<String>,
    /// Token override
    pub auth_token: Option<String>,
}

impl ConfigOverrides {
    /// Apply every override that is set
    pub fn apply(&self, config: &mut MuxConfig) {
        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }
        if let Some(ref user) = self.user_id {
            config.user_id = user.clone();
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = MuxConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.error_display(), Duration::from_secs(3));
        assert_eq!(config.max_concurrent_streams, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("chatmux/client.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[server]
base_url = "https://campus.example/api"
user_id = "42"
auth_token = "abc"

[streaming]
max_concurrent_streams = 4
error_display_ms = 1500
"#,
        );

        let config = load_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.base_url, "https://campus.example/api");
        assert_eq!(config.user_id, "42");
        assert_eq!(config.auth_token.as_deref(), Some("abc"));
        assert_eq!(config.max_concurrent_streams, 4);
        assert_eq!(config.error_display_ms, 1500);
        // Untouched values keep their defaults
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_graceful() {
        let config =
            load_with_env(Some(PathBuf::from("/nonexistent/chatmux.toml")), no_env).unwrap();
        assert_eq!(config, MuxConfig::default());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[server\nbase_url = 1");
        let result = load_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[server]\nbase_url = \"http://file/api\"\nuser_id = \"7\"\n");
        let env: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://env/api"),
            (ENV_MAX_STREAMS, "2"),
            (ENV_TOKEN, "secret"),
        ]
        .into_iter()
        .collect();

        let config = load_with_env(Some(file.path().to_path_buf()), |k| {
            env.get(k).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.base_url, "http://env/api");
        assert_eq!(config.user_id, "7");
        assert_eq!(config.max_concurrent_streams, 2);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_bad_env_number_ignored() {
        let config = load_with_env(None, |k| {
            (k == ENV_MAX_STREAMS).then(|| "many".to_string())
        })
        .unwrap();
        assert_eq!(config.max_concurrent_streams, 16);
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        let file = write_config("[streaming]\nmax_concurrent_streams = 0\n");
        let result = load_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));

        let config = MuxConfig {
            base_url: "  ".into(),
            ..MuxConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = MuxConfig::default();
        let overrides = ConfigOverrides {
            base_url: Some("http://cli/api".into()),
            ..ConfigOverrides::default()
        };
        overrides.apply(&mut config);
        assert_eq!(config.base_url, "http://cli/api");
        assert_eq!(config.user_id, "1");
    }

    #[test]
    fn test_config_error_display() {
        let read_err = ConfigError::ReadError {
            path: PathBuf::from("/x/client.toml"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(read_err.to_string().contains("/x/client.toml"));

        let validation_err = ConfigError::ValidationError("bad".to_string());
        assert_eq!(validation_err.to_string(), "Invalid configuration: bad");
    }
}
