//! Configuration schema structs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use canon_utils::{alarm_file, session_cache_file, socket_path};

use crate::backoff::Backoff;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub health: HealthConfig,
    pub spawn: SpawnConfig,
    pub orphans: OrphanConfig,
    pub namespace: NamespaceConfig,
    pub storage: StorageConfig,
}

/// Backend transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `unix:///path` or `tcp://host:port`; the runtime socket when unset
    pub addr: Option<String>,
    /// Connect timeout in milliseconds (default: 5000)
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: None,
            connect_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn resolved_addr(&self) -> String {
        self.addr
            .clone()
            .unwrap_or_else(|| format!("unix://{}", socket_path().to_string_lossy()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay in milliseconds (default: 500)
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 30000)
    pub max_delay_ms: u64,
    /// Automatic retries before giving up (default: 10)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Liveness probe interval in seconds (default: 300)
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Window in which an identical spawn is dropped (default: 2000)
    pub suppression_ms: u64,
    /// Delay between attach handshakes (default: 100)
    pub attach_stagger_ms: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            suppression_ms: 2000,
            attach_stagger_ms: 100,
        }
    }
}

impl SpawnConfig {
    pub fn suppression(&self) -> Duration {
        Duration::from_millis(self.suppression_ms)
    }

    pub fn attach_stagger(&self) -> Duration {
        Duration::from_millis(self.attach_stagger_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    /// HTTP base URL of the orphan endpoints; orphan handling is off when
    /// unset
    pub endpoint: Option<String>,
    /// Refresh interval in seconds (default: 60)
    pub refresh_secs: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            refresh_secs: 60,
        }
    }
}

impl OrphanConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Id prefix of sessions this client owns (default: "canon-")
    pub prefix: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: "canon-".to_string(),
        }
    }
}

/// Overrides for state file locations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub cache_file: Option<PathBuf>,
    pub alarm_file: Option<PathBuf>,
}

impl StorageConfig {
    pub fn cache_path(&self) -> PathBuf {
        self.cache_file.clone().unwrap_or_else(session_cache_file)
    }

    pub fn alarm_path(&self) -> PathBuf {
        self.alarm_file.clone().unwrap_or_else(alarm_file)
    }
}
