// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use davfs_logging::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::stats::AggregateStats;

/// Per-mount configuration, loadable from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MountConfig {
    /// Daemon control socket
    pub socket_path: PathBuf,
    pub read_only: bool,
    pub sync: SyncPolicy,
    pub transport: TransportPolicy,
    pub stats: SyntheticStats,
    pub logging: LoggingConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/davfs/control.sock"),
            read_only: false,
            sync: SyncPolicy::default(),
            transport: TransportPolicy::default(),
            stats: SyntheticStats::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tuning of the cache synchronization state machine
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SyncPolicy {
    /// Sleep between download progress checks
    pub poll_interval_ms: u64,
    /// A read starting this far beyond the downloaded prefix is fetched out of
    /// band with one `ByteRangeRead`. Zero disables the fallback.
    pub fallback_threshold_bytes: u64,
    /// Upper bound on a single `ByteRangeRead`, `Read` or `Write` request
    pub max_byte_range: u32,
    /// Age after which an open directory's listing is refreshed
    pub dir_refresh_secs: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            fallback_threshold_bytes: 4 * 1024 * 1024,
            max_byte_range: 1024 * 1024,
            dir_refresh_secs: 30,
        }
    }
}

impl SyncPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dir_refresh(&self) -> Duration {
        Duration::from_secs(self.dir_refresh_secs)
    }

    /// Whether a read at `offset` is far enough ahead of `downloaded` to
    /// warrant an out-of-band fetch.
    pub fn wants_fallback(&self, offset: u64, downloaded: u64) -> bool {
        self.fallback_threshold_bytes > 0
            && offset > downloaded.saturating_add(self.fallback_threshold_bytes)
    }
}

/// Socket timeouts applied to every control channel connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransportPolicy {
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            read_timeout_ms: Some(60_000),
            write_timeout_ms: Some(10_000),
        }
    }
}

impl TransportPolicy {
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }
}

/// Statistics reported once the daemon cannot supply aggregate stats
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SyntheticStats {
    pub block_size: u32,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub avail_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
}

impl Default for SyntheticStats {
    fn default() -> Self {
        Self {
            block_size: 4096,
            total_blocks: 1 << 30,
            free_blocks: 1 << 29,
            avail_blocks: 1 << 29,
            total_files: 1 << 20,
            free_files: 1 << 19,
        }
    }
}

impl From<&SyntheticStats> for AggregateStats {
    fn from(stats: &SyntheticStats) -> Self {
        AggregateStats {
            block_size: stats.block_size,
            total_blocks: stats.total_blocks,
            free_blocks: stats.free_blocks,
            avail_blocks: stats.avail_blocks,
            total_files: stats.total_files,
            free_files: stats.free_files,
        }
    }
}

impl MountConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read mount config {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("failed to parse mount config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: MountConfig = toml::from_str(text).context("invalid TOML")?;
        Ok(config)
    }

    /// Collect every problem with this configuration.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.socket_path.as_os_str().is_empty() {
            problems.push("socket-path must not be empty".to_string());
        }
        if self.sync.poll_interval_ms == 0 {
            problems.push("sync.poll-interval-ms must be positive".to_string());
        }
        if self.sync.max_byte_range == 0 {
            problems.push("sync.max-byte-range must be positive".to_string());
        }
        if self.stats.block_size == 0 {
            problems.push("stats.block-size must be positive".to_string());
        }
        if self.stats.free_blocks > self.stats.total_blocks {
            problems.push("stats.free-blocks exceeds stats.total-blocks".to_string());
        }
        if self.stats.avail_blocks > self.stats.free_blocks {
            problems.push("stats.avail-blocks exceeds stats.free-blocks".to_string());
        }
        problems
    }
}
