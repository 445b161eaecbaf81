//! Relay configuration

use crate::engine::{MediaCodec, WorkerSettings};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub workers: WorkerConfig,
    pub router: RouterConfig,
    pub topology: TopologyConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers to spawn (0 = one per available CPU core)
    pub num_workers: usize,
    /// Lowest RTC port handed to workers
    pub rtc_min_port: u16,
    /// Highest RTC port handed to workers
    pub rtc_max_port: u16,
    /// Engine-side log level
    pub log_level: String,
    /// Engine-side log tags
    pub log_tags: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            log_level: "warn".to_string(),
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl WorkerConfig {
    /// Resolve the configured worker count
    #[must_use]
    pub fn effective_num_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            log_level: self.log_level.clone(),
            log_tags: self.log_tags.clone(),
        }
    }
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Codecs every router is created with
    pub media_codecs: Vec<MediaCodec>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![MediaCodec::opus(), MediaCodec::vp8()],
        }
    }
}

/// Placement policy used when assigning participants in multi-router rooms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    #[default]
    LeastParticipants,
    LeastWorkerCpu,
}

/// Scaling and placement parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Progressive activation step: one more router per this many participants
    pub participants_per_router: usize,
    /// Joins needed inside the burst window to activate every router at once
    pub burst_threshold: usize,
    /// Burst window measured from the room's first join (milliseconds)
    pub burst_window_ms: u64,
    pub placement: PlacementKind,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            participants_per_router: 5,
            burst_threshold: 10,
            burst_window_ms: 2000,
            placement: PlacementKind::LeastParticipants,
        }
    }
}

impl TopologyConfig {
    #[must_use]
    pub const fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }
}

/// Background task intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Worker resource usage poll interval (milliseconds)
    pub worker_interval_ms: u64,
    /// Gauge refresh interval (milliseconds)
    pub stats_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            worker_interval_ms: 5000,
            stats_interval_ms: 5000,
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }

    #[must_use]
    pub const fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> crate::Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // ROOMRELAY_TOPOLOGY__BURST_THRESHOLD=20, ROOMRELAY_WORKERS__NUM_WORKERS=4, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> crate::Result<Self> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.rtc_min_port > self.workers.rtc_max_port {
            errors.push(format!(
                "workers.rtc_min_port ({}) is greater than workers.rtc_max_port ({})",
                self.workers.rtc_min_port, self.workers.rtc_max_port
            ));
        }
        if self.router.media_codecs.is_empty() {
            errors.push("router.media_codecs must not be empty".to_string());
        }
        if self.topology.participants_per_router == 0 {
            errors.push("topology.participants_per_router must be at least 1".to_string());
        }
        if self.topology.burst_threshold == 0 {
            errors.push("topology.burst_threshold must be at least 1".to_string());
        }
        if self.monitor.worker_interval_ms == 0 {
            errors.push("monitor.worker_interval_ms must be positive".to_string());
        }
        if self.monitor.stats_interval_ms == 0 {
            errors.push("monitor.stats_interval_ms must be positive".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
