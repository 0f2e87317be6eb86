use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::time::Duration;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Backoff settings of the reconnection controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first reconnect attempt
    pub initial_delay_ms: u64,
    /// Upper bound of any delay
    pub max_delay_ms: u64,
    /// Reconnect attempts before giving up until the network is restored
    pub max_attempts: u32,
    /// Random extra delay, as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay before reconnect attempt `attempt` (0-based), `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=jitter) * delay as f64;
            (delay + extra as u64).min(self.max_delay_ms)
        } else {
            delay
        };
        Some(Duration::from_millis(delay))
    }
}

/// Settings shared by every connection a registry opens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Sync endpoint, `None` keeps documents local only
    pub endpoint: Option<Url>,
    /// Directory of the local document store
    pub local_store_path: PathBuf,
    /// Debounce window of buffered local writes
    pub write_debounce_ms: u64,
    /// Time allowed for connecting and completing the sync handshake
    pub handshake_timeout_ms: u64,
    /// Token passed to the endpoint
    pub access_token: Option<String>,
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            local_store_path: PathBuf::from(".loresync"),
            write_debounce_ms: 250,
            handshake_timeout_ms: 10_000,
            access_token: None,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(local_store_path: impl Into<PathBuf>) -> Self {
        Self {
            local_store_path: local_store_path.into(),
            ..Self::default()
        }
    }

    /// Set the sync endpoint, e.g. `ws://localhost:3030/sync`
    pub fn with_endpoint(mut self, endpoint: &str) -> SyncResult<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| SyncError::MissingInput(format!("endpoint '{}': {}", endpoint, e)))?;
        if url.host_str().is_none() {
            return Err(SyncError::MissingInput(format!(
                "endpoint '{}' has no host",
                endpoint
            )));
        }
        self.endpoint = Some(url);
        Ok(self)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_write_debounce(mut self, debounce: Duration) -> Self {
        self.write_debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings of the sync server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub storage_path: PathBuf,
    /// When set, clients must present this token
    pub access_token: Option<String>,
    /// Records in a document log before it is rewritten as one state update
    pub compaction_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3030".to_string(),
            storage_path: PathBuf::from("data"),
            access_token: None,
            compaction_threshold: 500,
        }
    }
}

impl ServerConfig {
    /// Read `LORESYNC_BIND`, `LORESYNC_STORAGE`, `LORESYNC_TOKEN` and
    /// `LORESYNC_COMPACT_AFTER`, keeping defaults for unset variables.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let mut config = Self::default();
        if let Some(bind) = lookup("LORESYNC_BIND") {
            config.bind_address = bind;
        }
        if let Some(path) = lookup("LORESYNC_STORAGE") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(token) = lookup("LORESYNC_TOKEN").filter(|t| !t.is_empty()) {
            config.access_token = Some(token);
        }
        if let Some(raw) = lookup("LORESYNC_COMPACT_AFTER") {
            config.compaction_threshold = raw.parse().map_err(|_| {
                SyncError::MissingInput(format!("LORESYNC_COMPACT_AFTER is not a number: {}", raw))
            })?;
        }
        Ok(config)
    }
}
