use thiserror::Error;

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DATA_DIR: &str = "data/blockchain";
pub const DEFAULT_KEY_FILE: &str = "medical_encryption.key";
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 3;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Node configuration
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Host to bind the HTTP server to
    pub host: String,

    /// Port to bind the HTTP server to
    pub port: u16,

    /// Block storage directory; `None` keeps the chain in memory only
    pub data_dir: Option<PathBuf>,

    /// Path of the durable encryption secret
    pub key_file: PathBuf,

    /// Timeout for fetching a peer's chain
    pub peer_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            data_dir: Some(PathBuf::from(DEFAULT_DATA_DIR)),
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
            peer_timeout: Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS),
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from `LEDGER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary variable lookup
    ///
    /// Unset variables take their defaults. An empty `LEDGER_DATA_DIR`
    /// disables persistence.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = NodeConfig::default();

        if let Some(host) = lookup("LEDGER_HOST") {
            config.host = host;
        }

        if let Some(port) = lookup("LEDGER_PORT") {
            config.port = parse("LEDGER_PORT", &port)?;
        }

        if let Some(data_dir) = lookup("LEDGER_DATA_DIR") {
            config.data_dir = match data_dir.trim() {
                "" => None,
                dir => Some(PathBuf::from(dir)),
            };
        }

        if let Some(key_file) = lookup("LEDGER_KEY_FILE") {
            config.key_file = PathBuf::from(key_file);
        }

        if let Some(timeout) = lookup("LEDGER_PEER_TIMEOUT_SECS") {
            config.peer_timeout = Duration::from_secs(parse("LEDGER_PEER_TIMEOUT_SECS", &timeout)?);
        }

        Ok(config)
    }

    /// Address the HTTP server binds to
    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.bind_address(), ("127.0.0.1".to_string(), 5000));
        assert_eq!(config.data_dir, Some(PathBuf::from("data/blockchain")));
        assert_eq!(config.peer_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("LEDGER_HOST", "0.0.0.0"),
            ("LEDGER_PORT", "5001"),
            ("LEDGER_DATA_DIR", "/var/lib/medchain"),
            ("LEDGER_KEY_FILE", "/etc/medchain/key"),
            ("LEDGER_PEER_TIMEOUT_SECS", "10"),
        ]))
        .unwrap();

        assert_eq!(config.bind_address(), ("0.0.0.0".to_string(), 5001));
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/medchain")));
        assert_eq!(config.key_file, PathBuf::from("/etc/medchain/key"));
        assert_eq!(config.peer_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_empty_data_dir_disables_persistence() {
        let config = NodeConfig::from_lookup(lookup(&[("LEDGER_DATA_DIR", "")])).unwrap();
        assert_eq!(config.data_dir, None);
    }

    #[test]
    fn test_malformed_values() {
        assert_eq!(
            NodeConfig::from_lookup(lookup(&[("LEDGER_PORT", "http")])),
            Err(ConfigError::Invalid {
                key: "LEDGER_PORT".into(),
                value: "http".into()
            })
        );
        assert!(NodeConfig::from_lookup(lookup(&[("LEDGER_PORT", "70000")])).is_err());
        assert!(NodeConfig::from_lookup(lookup(&[("LEDGER_PEER_TIMEOUT_SECS", "-1")])).is_err());
    }
}
