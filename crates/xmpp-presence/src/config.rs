//! Configuration for the presence subsystem.
//!
//! Loaded from a TOML document; every field is optional:
//!
//! ```toml
//! hosts = ["example.com", "chat.example.com"]
//! versioning = true
//! stream_buffer = 256
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::hosts::LocalHosts;
use crate::PresenceError;

/// Presence subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Domains served by this server
    pub hosts: Vec<String>,
    /// Emit `ver` on roster pushes (XEP-0237 style versioning)
    pub versioning: bool,
    /// Outbound channel capacity of each stream opened by
    /// [`LocalRouter::connect`](crate::LocalRouter::connect)
    pub stream_buffer: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".into()],
            versioning: false,
            stream_buffer: 256,
        }
    }
}

impl PresenceConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, PresenceError> {
        let config: Self = toml::from_str(s)
            .map_err(|e| PresenceError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PresenceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PresenceError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// The configured local domains.
    pub fn local_hosts(&self) -> LocalHosts {
        LocalHosts::new(self.hosts.iter().cloned())
    }

    fn validate(&self) -> Result<(), PresenceError> {
        if self.hosts.is_empty() {
            return Err(PresenceError::config("At least one host must be configured"));
        }
        if self.stream_buffer == 0 {
            return Err(PresenceError::config("stream_buffer must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::Hosts;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PresenceConfig::default();
        assert_eq!(config.hosts, vec!["localhost".to_string()]);
        assert!(!config.versioning);
        assert_eq!(config.stream_buffer, 256);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = PresenceConfig::from_toml_str("versioning = true").unwrap();
        assert!(config.versioning);
        assert_eq!(config.hosts, vec!["localhost".to_string()]);
    }

    #[test]
    fn test_invalid_documents() {
        assert!(PresenceConfig::from_toml_str("versioning = \"yes\"").is_err());
        assert!(PresenceConfig::from_toml_str("hosts = []").is_err());
        assert!(PresenceConfig::from_toml_str("stream_buffer = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hosts = [\"example.com\", \"Chat.Example.com\"]").unwrap();
        writeln!(file, "stream_buffer = 16").unwrap();

        let config = PresenceConfig::load(file.path()).unwrap();
        assert_eq!(config.stream_buffer, 16);

        let hosts = config.local_hosts();
        assert!(hosts.is_local_host("example.com"));
        assert!(hosts.is_local_host("chat.example.com"));
        assert!(!hosts.is_local_host("localhost"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PresenceConfig::load("/nonexistent/presence.toml").unwrap_err();
        assert!(matches!(err, PresenceError::Config(_)));
    }
}
