//! Engine configuration
//!
//! Dibaca dari TOML (misalnya `sluice.toml`); semua field punya default.
//! Dari sisi engine config bersifat read-only.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// Tunables untuk connection engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global connection budget
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Per-host connection budget (managed connection dikecualikan)
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: u32,

    /// Connect-established timeout. Tidak diisi = tanpa deadline,
    /// `Some(0)` = deadline sudah lewat (fire di timer tick berikutnya)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Delay sebelum alternate address ikut di-race
    #[serde(default = "default_race_delay_ms")]
    pub race_delay_ms: u64,

    /// Batas retry connect (distinct address diutamakan)
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,

    /// Batas retry name lookup saat resolver churn
    #[serde(default = "default_max_resolve_retries")]
    pub max_resolve_retries: u32,

    /// Interval sweeper tick
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Jumlah wait-queue node yang di-cache
    #[serde(default = "default_node_pool_capacity")]
    pub node_pool_capacity: usize,

    /// Batas total wait-queue entry (cache + heap fallback)
    #[serde(default = "default_max_wait_entries")]
    pub max_wait_entries: usize,

    /// Coalesce buffer outbound kecil sampai ukuran ini (resource-constrained build)
    #[serde(default)]
    pub coalesce_limit: Option<usize>,

    /// Pakai synchronous resolver
    #[serde(default)]
    pub resolve_sync: bool,
}

fn default_max_connections() -> u32 {
    64
}

fn default_max_connections_per_host() -> u32 {
    6
}

fn default_race_delay_ms() -> u64 {
    300
}

fn default_max_connect_retries() -> u32 {
    3
}

fn default_max_resolve_retries() -> u32 {
    2
}

fn default_sweep_interval_ms() -> u64 {
    10
}

fn default_node_pool_capacity() -> usize {
    32
}

fn default_max_wait_entries() -> usize {
    4096
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_host: default_max_connections_per_host(),
            connect_timeout_ms: None,
            race_delay_ms: default_race_delay_ms(),
            max_connect_retries: default_max_connect_retries(),
            max_resolve_retries: default_max_resolve_retries(),
            sweep_interval_ms: default_sweep_interval_ms(),
            node_pool_capacity: default_node_pool_capacity(),
            max_wait_entries: default_max_wait_entries(),
            coalesce_limit: None,
            resolve_sync: false,
        }
    }
}

impl EngineConfig {
    /// Load config dari file TOML
    pub fn load<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("reading {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&text)?;
        info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Parse + validate dari string TOML
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EngineError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_connections == 0 {
            return Err(EngineError::config("max_connections must be at least 1"));
        }
        if self.max_connections_per_host == 0 {
            return Err(EngineError::config(
                "max_connections_per_host must be at least 1",
            ));
        }
        if self.max_connections_per_host > self.max_connections {
            return Err(EngineError::config(
                "max_connections_per_host cannot exceed max_connections",
            ));
        }
        if self.node_pool_capacity < 2 {
            return Err(EngineError::config("node_pool_capacity must be at least 2"));
        }
        if self.max_wait_entries < self.node_pool_capacity {
            return Err(EngineError::config(
                "max_wait_entries must be at least node_pool_capacity",
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(EngineError::config("sweep_interval_ms must be positive"));
        }
        if matches!(self.coalesce_limit, Some(0)) {
            return Err(EngineError::config("coalesce_limit must be positive"));
        }
        Ok(())
    }

    #[inline]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    #[inline]
    pub fn race_delay(&self) -> Duration {
        Duration::from_millis(self.race_delay_ms)
    }

    #[inline]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
