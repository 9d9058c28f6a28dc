//! Cache configuration, loadable from YAML.
//!
//! ```yaml
//! cache_dir: /var/cache/doq
//! store_format: framed
//! retry:
//!   max_attempts: 20
//!   delay_secs: 5
//! network:
//!   transport: socket
//!   proxy:
//!     host: proxy.example.net
//!     port: 3128
//! ```
//!
//! Every field is optional; omitted fields take the defaults below.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::store::{StoreFormat, StoreOptions, DEFAULT_SHARD_LIMIT};
use crate::{Result, TileError};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Persistent cache directory. When absent, or not a directory, the
    /// cache lives in a temporary directory removed on close.
    pub cache_dir: Option<PathBuf>,
    /// Size at which a shard stops accepting new tiles.
    pub shard_limit_bytes: u64,
    /// Layout of newly stored tiles.
    pub store_format: StoreFormat,
    pub retry: RetryConfig,
    pub network: NetworkConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            shard_limit_bytes: DEFAULT_SHARD_LIMIT,
            store_format: StoreFormat::Framed,
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

/// Download retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Download attempts per tile before giving up.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay_secs: u64,
    /// How long the alternate backend is left alone after a failure.
    pub alternate_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1000,
            delay_secs: 10,
            alternate_cooldown_secs: 1000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_secs(self.delay_secs),
        }
    }

    pub fn alternate_cooldown(&self) -> Duration {
        Duration::from_secs(self.alternate_cooldown_secs)
    }
}

/// HTTP implementation used for downloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `reqwest` blocking client.
    #[default]
    Client,
    /// Literal request text over a plain TCP socket.
    Socket,
}

/// Network settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub transport: TransportKind,
    /// Reuse connections to the primary backend.
    pub keep_alive: bool,
    /// Bound on each socket read. No bound when absent.
    pub read_timeout_secs: Option<u64>,
    /// Route every request through this HTTP proxy.
    pub proxy: Option<ProxyConfig>,
    pub primary: BackendConfig,
    pub alternate: BackendConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Client,
            keep_alive: true,
            read_timeout_secs: None,
            proxy: None,
            primary: BackendConfig {
                host: "msrmaps.com".to_string(),
                port: 80,
                expected_address: Some(IpAddr::V4(Ipv4Addr::new(65, 54, 113, 33))),
            },
            alternate: BackendConfig {
                host: "wms.jpl.nasa.gov".to_string(),
                port: 80,
                expected_address: None,
            },
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}

/// One tile server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Address the host must resolve to. A lookup that does not include it
    /// is rejected.
    #[serde(default)]
    pub expected_address: Option<IpAddr>,
}

/// HTTP proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

fn default_http_port() -> u16 {
    80
}

impl CacheConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TileError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TileError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(TileError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.shard_limit_bytes == 0 || self.shard_limit_bytes > i32::MAX as u64 {
            return Err(TileError::Config(format!(
                "shard_limit_bytes must be between 1 and {}",
                i32::MAX
            )));
        }
        for (name, backend) in [
            ("primary", &self.network.primary),
            ("alternate", &self.network.alternate),
        ] {
            if backend.host.trim().is_empty() {
                return Err(TileError::Config(format!("network.{}.host is empty", name)));
            }
        }
        if let Some(proxy) = &self.network.proxy {
            if proxy.host.trim().is_empty() {
                return Err(TileError::Config("network.proxy.host is empty".into()));
            }
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            shard_limit: self.shard_limit_bytes,
            format: self.store_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.shard_limit_bytes, 625 * 1024 * 1024);
        assert_eq!(config.retry.policy().max_attempts, 1000);
        assert_eq!(config.retry.policy().delay, Duration::from_secs(10));
        assert_eq!(config.network.transport, TransportKind::Client);
        assert!(config.network.read_timeout().is_none());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
cache_dir: /tmp/doq
store_format: legacy
retry:
  max_attempts: 3
network:
  transport: socket
  read_timeout_secs: 30
  proxy:
    host: proxy.local
    port: 3128
  primary:
    host: tiles.local
    expected_address: 10.0.0.5
"#;
        let config = CacheConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/doq")));
        assert_eq!(config.store_format, StoreFormat::Legacy);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_secs, 10);
        assert_eq!(config.network.transport, TransportKind::Socket);
        assert_eq!(config.network.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.network.primary.port, 80);
        assert_eq!(
            config.network.primary.expected_address,
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(config.network.proxy.as_ref().map(|p| p.port), Some(3128));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            CacheConfig::from_yaml_str("shard_limit: 10"),
            Err(TileError::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        assert!(CacheConfig::from_yaml_str("retry: {max_attempts: 0}").is_err());
        assert!(CacheConfig::from_yaml_str("shard_limit_bytes: 4294967296").is_err());
        assert!(CacheConfig::from_yaml_str("network: {primary: {host: ''}}").is_err());
        assert!(CacheConfig::from_yaml_str("shard_limit_bytes: 1048576").is_ok());
    }
}
