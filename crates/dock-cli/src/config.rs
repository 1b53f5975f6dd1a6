//! `dock.toml` loading.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dock_core::DebounceConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub debounce: DebounceConfig,
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
}

/// Concurrency and retry limits for snapshot processing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Snapshots processed concurrently.
    pub max_in_flight: usize,
    /// How long a snapshot waits for one buffer key before backing off.
    pub lock_timeout_ms: u64,
    /// Attempts per buffer update (lock timeouts and busy database).
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Attempts to resolve an unknown gateway before dropping the snapshot.
    pub resolve_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            lock_timeout_ms: 2_000,
            retry_attempts: 5,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            resolve_attempts: 3,
        }
    }
}

impl PipelineConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Address for the HTTP intake; stdin only when unset.
    pub listen: Option<SocketAddr>,
}

impl Config {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Config>(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.debounce.validate()?;
        if self.pipeline.max_in_flight == 0 {
            bail!("pipeline.max_in_flight must be at least 1");
        }
        if self.pipeline.retry_attempts == 0 || self.pipeline.resolve_attempts == 0 {
            bail!("pipeline retry and resolve attempts must be at least 1");
        }
        if self.pipeline.retry_base_delay_ms > self.pipeline.retry_max_delay_ms {
            bail!("pipeline.retry_base_delay_ms exceeds retry_max_delay_ms");
        }
        Ok(())
    }
}

/// `--config`, else `DOCK_CONFIG`, else `<data dir>/dock.toml`.
pub fn config_path(explicit: Option<&Path>, default: PathBuf) -> PathBuf {
    explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("DOCK_CONFIG").map(PathBuf::from))
        .unwrap_or(default)
}
