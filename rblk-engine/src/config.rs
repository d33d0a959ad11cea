use rblk_core::{
    DEFAULT_BYTE_CAPACITY, DEFAULT_DISPATCH_QUEUE_CAPACITY, DEFAULT_MAX_SEGMENT_SIZE,
    DEFAULT_MAX_SEGMENTS, DEFAULT_QUEUE_SLOTS, MAX_FABRIC_QUEUE_DEPTH, RblkError, Result,
    RetryPolicy,
};
use rblk_io::TransportKind;
use rblk_net::ConnectOptions;
use rblk_ring::RingLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportSettings,
    pub ring: RingSettings,
    pub fabric: FabricSettings,
    pub tracker: TrackerSettings,
    /// Backoff while the transport or the in-flight window is busy.
    pub dispatch: RetrySettings,
    /// Idle polling of the completion channel.
    pub completion: RetrySettings,
    pub shutdown: ShutdownSettings,
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub kind: TransportKind,
    /// Device size served by the local and ring transports.
    pub capacity: u64,
    /// Completion queue depth of the local transport.
    pub local_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingSettings {
    pub queue_slots: usize,
    pub byte_capacity: usize,
    /// Back the fault areas with files in this directory instead of the heap.
    pub area_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricSettings {
    pub peer: String,
    pub max_queue_depth: u32,
    pub cm_timeout_ms: u64,
    /// Remote region requested from the memory server.
    pub region_size: u64,
    pub retry_count: u8,
    /// Bounded wait for in-flight operations when disconnecting.
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Most segments a single request may carry.
    pub max_segments: usize,
    pub dispatch_queue_capacity: usize,
    pub max_segment_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_us: u64,
    pub spin_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// How long completions are drained after dispatch stops.
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Track per-page fetch counts for refetch statistics.
    pub page_stats: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            kind: TransportKind::Ring,
            capacity: 40 * 1024 * 1024,
            local_queue_depth: MAX_FABRIC_QUEUE_DEPTH as usize,
        }
    }
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            queue_slots: DEFAULT_QUEUE_SLOTS,
            byte_capacity: DEFAULT_BYTE_CAPACITY,
            area_dir: None,
        }
    }
}

impl Default for FabricSettings {
    fn default() -> Self {
        let connect = ConnectOptions::default();
        Self {
            peer: "mem0".into(),
            max_queue_depth: connect.max_queue_depth,
            cm_timeout_ms: 10_000,
            region_size: connect.region_size,
            retry_count: connect.retry_count,
            drain_timeout_ms: 1_000,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_segments: DEFAULT_MAX_SEGMENTS,
            dispatch_queue_capacity: DEFAULT_DISPATCH_QUEUE_CAPACITY,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 100_000,
            backoff_us: 10,
            spin_attempts: 64,
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
        }
    }
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1_000,
            page_stats: false,
        }
    }
}

impl RetrySettings {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_micros(self.backoff_us))
            .with_spin(self.spin_attempts)
    }
}

impl EngineConfig {
    /// Load from a `.toml` or `.json` file.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `Config` if it does not
    /// parse or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Self = match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| RblkError::Config(format!("TOML parse error: {e}")))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| RblkError::Config(format!("JSON parse error: {e}")))?,
            _ => {
                return Err(RblkError::Config(format!(
                    "Unknown config file extension: {ext}"
                )));
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, the format `rblk-bench --generate-config` writes.
    ///
    /// # Errors
    /// Returns `Config` if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RblkError::Config(format!("TOML encode error: {e}")))
    }

    /// # Errors
    /// Returns `Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.transport.capacity == 0 {
            return Err(RblkError::Config("transport.capacity must be non-zero".into()));
        }
        if self.transport.local_queue_depth == 0 {
            return Err(RblkError::Config(
                "transport.local_queue_depth must be non-zero".into(),
            ));
        }
        self.ring_layout().validate()?;
        if self.fabric.max_queue_depth == 0 || self.fabric.max_queue_depth > MAX_FABRIC_QUEUE_DEPTH {
            return Err(RblkError::Config(format!(
                "fabric.max_queue_depth must be within 1..={MAX_FABRIC_QUEUE_DEPTH}"
            )));
        }
        if self.fabric.region_size == 0 {
            return Err(RblkError::Config("fabric.region_size must be non-zero".into()));
        }
        if self.transport.kind == TransportKind::Fabric && self.fabric.peer.is_empty() {
            return Err(RblkError::Config("fabric.peer is required for the fabric transport".into()));
        }
        if self.tracker.max_segments == 0 {
            return Err(RblkError::Config("tracker.max_segments must be non-zero".into()));
        }
        if self.tracker.max_segment_size == 0 {
            return Err(RblkError::Config("tracker.max_segment_size must be non-zero".into()));
        }
        if self.tracker.dispatch_queue_capacity < self.tracker.max_segments {
            return Err(RblkError::Config(format!(
                "tracker.dispatch_queue_capacity ({}) cannot hold a request of max_segments ({})",
                self.tracker.dispatch_queue_capacity, self.tracker.max_segments
            )));
        }
        if self.stats.enabled && self.stats.interval_ms == 0 {
            return Err(RblkError::Config("stats.interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn ring_layout(&self) -> RingLayout {
        RingLayout::new(self.ring.queue_slots, self.ring.byte_capacity)
    }

    #[must_use]
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            max_queue_depth: self.fabric.max_queue_depth,
            region_size: self.fabric.region_size,
            timeout: Duration::from_millis(self.fabric.cm_timeout_ms),
            retry_count: self.fabric.retry_count,
        }
    }

    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.fabric.drain_timeout_ms)
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown.grace_period_ms)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats.interval_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ring.queue_slots, 896);
        assert_eq!(config.ring.byte_capacity, 3584 * 1024);
        assert_eq!(config.fabric.max_queue_depth, 128);
        assert_eq!(config.tracker.max_segments, 256);
        assert_eq!(config.grace_period(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[transport]\nkind = \"fabric\"\n\n[fabric]\npeer = \"10.0.0.2:7471\"\nmax_queue_depth = 32\n\n[tracker]\nmax_segments = 8"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Fabric);
        assert_eq!(config.fabric.peer, "10.0.0.2:7471");
        assert_eq!(config.connect_options().max_queue_depth, 32);
        assert_eq!(config.tracker.max_segments, 8);
        assert_eq!(config.ring.queue_slots, DEFAULT_QUEUE_SLOTS);
    }

    #[test]
    fn test_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"transport": {{"kind": "local"}}, "stats": {{"enabled": false}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.transport.kind, TransportKind::Local);
        assert!(!config.stats.enabled);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(RblkError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = EngineConfig::default();
        config.tracker.max_segments = 0;
        assert!(matches!(config.validate(), Err(RblkError::Config(_))));

        let mut config = EngineConfig::default();
        config.ring.queue_slots = 1;
        assert!(matches!(config.validate(), Err(RblkError::Config(_))));

        let mut config = EngineConfig::default();
        config.fabric.max_queue_depth = 4096;
        assert!(matches!(config.validate(), Err(RblkError::Config(_))));

        let mut config = EngineConfig::default();
        config.tracker.dispatch_queue_capacity = 4;
        assert!(matches!(config.validate(), Err(RblkError::Config(_))));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let text = EngineConfig::default().to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tracker.max_segment_size, DEFAULT_MAX_SEGMENT_SIZE);
        assert_eq!(parsed.transport.kind, TransportKind::Ring);
    }
}
