//! Pool configuration file.
//!
//! The file is a single JSON object. Every key is optional; a missing or
//! undecodable file leaves the defaults in place with a warning.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Donation address used when no payout address is configured.
pub const DEFAULT_BTCADDRESS: &str = "1PKN98VN2z5gwSGZvGKS2bj8aADZBkyhkZ";

/// Coinbase signature limit in bytes.
pub const MAX_BTCSIG_LEN: usize = 38;

/// Credentials for one bitcoin daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtcdConfig {
    /// `host:port` of the daemon's RPC interface.
    pub url: String,
    pub auth: String,
    pub pass: String,
}

impl Default for BtcdConfig {
    fn default() -> Self {
        Self {
            url: "localhost:8332".to_string(),
            auth: "user".to_string(),
            pass: "pass".to_string(),
        }
    }
}

impl BtcdConfig {
    /// Split `url` into host and port, defaulting the port to 8332.
    pub fn host_port(&self) -> (&str, &str) {
        self.url.rsplit_once(':').unwrap_or((self.url.as_str(), "8332"))
    }
}

/// Settings read from `<name>.conf`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub btcd: Vec<BtcdConfig>,
    pub btcaddress: String,
    pub btcsig: Option<String>,
    /// Milliseconds between block checks.
    pub blockpoll: u32,
    /// Seconds between work updates.
    pub update_interval: u32,
    /// Address the connector listens on.
    pub serverurl: String,
    pub mindiff: i64,
    pub startdiff: i64,
    pub logdir: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            btcd: vec![BtcdConfig::default()],
            btcaddress: DEFAULT_BTCADDRESS.to_string(),
            btcsig: None,
            blockpoll: 500,
            update_interval: 30,
            serverurl: "0.0.0.0:3333".to_string(),
            mindiff: 1,
            startdiff: 42,
            logdir: PathBuf::from("logs"),
        }
    }
}

impl PoolConfig {
    /// Decode a config from JSON text and normalise it.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(text)?;
        config.normalise();
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read config file, using defaults");
                return Self::default();
            }
        };
        match Self::from_json(&text) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Json decode error for config file");
                Self::default()
            }
        }
    }

    fn normalise(&mut self) {
        if self.btcd.is_empty() {
            self.btcd.push(BtcdConfig::default());
        }
        if let Some(sig) = self.btcsig.as_mut()
            && sig.len() > MAX_BTCSIG_LEN
        {
            tracing::warn!(sig = %sig, "Signature too long, truncating to 38 bytes");
            let mut end = MAX_BTCSIG_LEN;
            while !sig.is_char_boundary(end) {
                end -= 1;
            }
            sig.truncate(end);
        }
        if self.logdir.as_os_str().is_empty() {
            self.logdir = PathBuf::from("logs");
        }
    }

    /// Create the log directory and its `users` and `pool` subdirectories.
    pub fn create_log_dirs(&self) -> std::io::Result<()> {
        crate::paths::ensure_dir(&self.logdir)?;
        crate::paths::ensure_dir(self.logdir.join("users"))?;
        crate::paths::ensure_dir(self.logdir.join("pool"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.btcd, vec![BtcdConfig::default()]);
        assert_eq!(config.serverurl, "0.0.0.0:3333");
        assert_eq!(config.logdir, PathBuf::from("logs"));
        assert_eq!(config.blockpoll, 500);
        assert_eq!(config.startdiff, 42);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = PoolConfig::from_json(
            r#"{"btcd":[{"url":"10.0.0.2:18332","auth":"rpc"}],"serverurl":"127.0.0.1:0"}"#,
        )
        .unwrap();
        assert_eq!(config.btcd.len(), 1);
        assert_eq!(config.btcd[0].url, "10.0.0.2:18332");
        assert_eq!(config.btcd[0].auth, "rpc");
        assert_eq!(config.btcd[0].pass, "pass");
        assert_eq!(config.serverurl, "127.0.0.1:0");
        assert_eq!(config.mindiff, 1);
    }

    #[test]
    fn test_empty_btcd_array_gets_default_entry() {
        let config = PoolConfig::from_json(r#"{"btcd":[]}"#).unwrap();
        assert_eq!(config.btcd, vec![BtcdConfig::default()]);
    }

    #[test]
    fn test_long_signature_truncated() {
        let config = PoolConfig::from_json(&format!(r#"{{"btcsig":"{}"}}"#, "x".repeat(50))).unwrap();
        assert_eq!(config.btcsig.unwrap().len(), MAX_BTCSIG_LEN);
    }

    #[test]
    fn test_missing_or_broken_file_uses_defaults() {
        let tmp = tempdir().unwrap();
        assert_eq!(
            PoolConfig::load_or_default(tmp.path().join("missing.conf")),
            PoolConfig::default()
        );

        let broken = tmp.path().join("broken.conf");
        std::fs::write(&broken, "{ not json").unwrap();
        assert_eq!(PoolConfig::load_or_default(&broken), PoolConfig::default());
    }

    #[test]
    fn test_host_port_split() {
        let btcd = BtcdConfig {
            url: "node.example:18332".into(),
            ..Default::default()
        };
        assert_eq!(btcd.host_port(), ("node.example", "18332"));
        let bare = BtcdConfig {
            url: "node.example".into(),
            ..Default::default()
        };
        assert_eq!(bare.host_port(), ("node.example", "8332"));
    }

    #[test]
    fn test_create_log_dirs() {
        let tmp = tempdir().unwrap();
        let config = PoolConfig {
            logdir: tmp.path().join("logs"),
            ..Default::default()
        };
        config.create_log_dirs().unwrap();
        assert!(tmp.path().join("logs/users").is_dir());
        assert!(tmp.path().join("logs/pool").is_dir());
    }
}
