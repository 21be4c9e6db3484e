//! Call configuration

use crate::peer::DEFAULT_CANDIDATE_BUFFER_CAPACITY;
use crate::rtc::RtcConfig;
use crate::signaling::DEFAULT_SESSIONS_COLLECTION;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default capacity of the call event channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 100;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File contents are not valid configuration JSON
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values are out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings for one call controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Peer connection settings
    pub rtc: RtcConfig,
    /// Remote candidates held before the remote description is applied
    pub candidate_buffer_capacity: usize,
    /// Capacity of the broadcast event channel
    pub event_channel_capacity: usize,
    /// Delete session documents when the caller hangs up
    pub teardown_on_hangup: bool,
    /// Top-level collection holding session documents
    pub sessions_collection: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            rtc: RtcConfig::default(),
            candidate_buffer_capacity: DEFAULT_CANDIDATE_BUFFER_CAPACITY,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            teardown_on_hangup: true,
            sessions_collection: DEFAULT_SESSIONS_COLLECTION.to_string(),
        }
    }
}

impl CallConfig {
    /// Load and validate a JSON configuration file
    ///
    /// Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded call config");
        Ok(config)
    }

    /// Parse and validate configuration JSON
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`]
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rtc.ice_servers.is_empty() {
            return Err(ConfigError::Invalid("no ICE servers configured".into()));
        }
        for server in &self.rtc.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server without URLs".into()));
            }
            if let Some(bad) = server
                .urls
                .iter()
                .find(|url| !(url.starts_with("stun:") || url.starts_with("turn:")))
            {
                return Err(ConfigError::Invalid(format!(
                    "unsupported ICE server URL: {bad}"
                )));
            }
        }
        if self.candidate_buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "candidate_buffer_capacity must be positive".into(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_channel_capacity must be positive".into(),
            ));
        }
        if self.sessions_collection.is_empty() || self.sessions_collection.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "bad sessions collection name: {:?}",
                self.sessions_collection
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rtc::IceServer;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.candidate_buffer_capacity, 32);
        assert_eq!(config.event_channel_capacity, 100);
        assert_eq!(config.sessions_collection, "calls");
        assert!(config.teardown_on_hangup);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CallConfig::from_json_str(r#"{"teardown_on_hangup": false}"#).unwrap();
        assert!(!config.teardown_on_hangup);
        assert_eq!(config.rtc, RtcConfig::default());
        assert_eq!(config.candidate_buffer_capacity, 32);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"rtc": {{"ice_servers": [{{"urls": ["turn:relay.example.org:3478"]}}]}}, "sessions_collection": "rooms"}}"#
        )
        .unwrap();

        let config = CallConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.sessions_collection, "rooms");
        assert_eq!(
            config.rtc.ice_servers,
            vec![IceServer {
                urls: vec!["turn:relay.example.org:3478".to_string()]
            }]
        );
        assert_eq!(config.rtc.ice_candidate_pool_size, 10);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = CallConfig::from_json_file(dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            CallConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = CallConfig::default();
        config.rtc.ice_servers[0].urls.push("http://example.org".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CallConfig::default();
        config.rtc.ice_servers.clear();
        assert!(config.validate().is_err());

        let config = CallConfig {
            candidate_buffer_capacity: 0,
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CallConfig {
            sessions_collection: "a/b".into(),
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
