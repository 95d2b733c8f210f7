//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RdmtError, Result};

/// Engine configuration, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmtConfig {
    /// Maximum number of concurrent connections (slots per buffer class).
    pub max_connections: usize,
    /// Size of each bulk slot in bytes.
    pub bulk_size: usize,
    /// Command credits a connection starts with. Each exchange spends one and
    /// gets it back on completion. Only one exchange runs per connection at a
    /// time, so values above 1 leave headroom but never widen that window.
    pub initial_credits: u32,
    /// Depth of each connection's completion queue.
    pub cq_depth: usize,
    /// Default timeout for one event-loop wait, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Address a server listens on.
    pub listen_addr: String,
}

impl Default for RdmtConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            bulk_size: 4096,
            initial_credits: 1,
            cq_depth: 64,
            poll_timeout_ms: 1000,
            listen_addr: String::from("127.0.0.1:1701"),
        }
    }
}

impl RdmtConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RdmtConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RdmtError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| RdmtError::Config(e.to_string()))?
            }
            _ => {
                return Err(RdmtError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(RdmtError::Config("max_connections must be > 0".into()));
        }
        if self.bulk_size == 0 {
            return Err(RdmtError::Config("bulk_size must be > 0".into()));
        }
        if self.initial_credits == 0 {
            return Err(RdmtError::Config("initial_credits must be > 0".into()));
        }
        if self.cq_depth == 0 {
            return Err(RdmtError::Config("cq_depth must be > 0".into()));
        }
        Ok(())
    }

    /// The default event-loop wait timeout.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RdmtConfig::default();
        assert_eq!(config.max_connections, 16);
        assert_eq!(config.bulk_size, 4096);
        assert_eq!(config.initial_credits, 1);
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.listen_addr, "127.0.0.1:1701");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_connections = 2\nbulk_size = 64\n").unwrap();

        let config = RdmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.bulk_size, 64);
        assert_eq!(config.initial_credits, 1);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"cq_depth": 8, "listen_addr": "10.0.0.1:9000"}}"#).unwrap();

        let config = RdmtConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cq_depth, 8);
        assert_eq!(config.listen_addr, "10.0.0.1:9000");
        assert_eq!(config.max_connections, 16);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::new().unwrap();
        let err = RdmtConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, RdmtError::Config(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "bulk_size = 0").unwrap();
        assert!(RdmtConfig::from_file(file.path()).is_err());

        let config = RdmtConfig {
            initial_credits: 0,
            ..RdmtConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
