//! Server Configuration

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Configuration for a [`LineServer`](crate::LineServer).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listening socket binds to. Port 0 asks the OS for an
    /// ephemeral port; the bound address is available from
    /// [`LineServer::local_addr`](crate::LineServer::local_addr) after `start`.
    pub bind_addr: SocketAddr,
    /// Every `purge_interval`-th accepted connection triggers a scan that
    /// removes disconnected connections from the registry before the new
    /// connection is registered.
    pub purge_interval: u64,
    /// How long `stop` waits for the accept task to exit after the shutdown
    /// signal is sent.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7070".parse().expect("valid default bind address"),
            purge_interval: 20,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: ServerConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = ServerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.purge_interval == 0 {
            bail!("purge_interval must be at least 1");
        }
        if self.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.purge_interval, 20);
    }

    #[test]
    fn zero_purge_interval_is_rejected() {
        let config = ServerConfig {
            purge_interval: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind_addr = \"127.0.0.1:9000\"").unwrap();
        writeln!(file, "shutdown_timeout = \"2s\"").unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.purge_interval, 20);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = ServerConfig::from_file(Path::new("/nonexistent/linesock.toml")).unwrap();
        assert_eq!(config.purge_interval, ServerConfig::default().purge_interval);
    }
}
