//! Configuration structures for the EtherCAT link.
//!
//! Supports TOML deserialization with defaults suited to a chain of
//! ultrasound transducer boards on a dedicated network adapter.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Network adapter name. Empty selects the first adapter with a matching chain.
    pub interface: String,

    /// Distributed clock SYNC0 period.
    #[serde(with = "humantime_serde")]
    pub sync0_cycle: Duration,

    /// Process data exchange period.
    #[serde(with = "humantime_serde")]
    pub send_cycle: Duration,

    /// How the cyclic thread waits for its next deadline.
    pub timer_strategy: TimerStrategy,

    /// Slave synchronization mode.
    pub sync_mode: SyncMode,

    /// Period of the health-check thread.
    #[serde(with = "humantime_serde")]
    pub state_check_interval: Duration,

    /// Depth of the outgoing frame queue. Zero means unbounded.
    pub buf_size: usize,

    /// Receive timeout for a single exchange.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Timeout for state transitions during bring-up.
    #[serde(with = "humantime_serde")]
    pub state_timeout: Duration,

    /// Real-time settings for the cyclic thread.
    pub realtime: RealtimeConfig,

    /// Process data layout of each slave.
    pub profile: SlaveProfile,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            sync0_cycle: Duration::from_millis(1),
            send_cycle: Duration::from_millis(1),
            timer_strategy: TimerStrategy::default(),
            sync_mode: SyncMode::default(),
            state_check_interval: Duration::from_millis(100),
            buf_size: 32,
            timeout: Duration::from_millis(2),
            state_timeout: Duration::from_secs(2),
            realtime: RealtimeConfig::default(),
            profile: SlaveProfile::default(),
        }
    }
}

impl LinkConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        debug!(path = %path.display(), bytes = content.len(), "Config file read");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that would make the cyclic loop misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = self.check();
        match &result {
            Ok(()) => debug!(
                interface = %self.interface,
                send_cycle_us = self.send_cycle.as_micros(),
                timer = ?self.timer_strategy,
                sync = ?self.sync_mode,
                "Config validated"
            ),
            Err(e) => warn!(error = %e, "Config rejected"),
        }
        result
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.send_cycle.is_zero() {
            return Err(ConfigError::Invalid("send_cycle must be non-zero".into()));
        }
        if self.sync0_cycle.is_zero() {
            return Err(ConfigError::Invalid("sync0_cycle must be non-zero".into()));
        }
        if self.state_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "state_check_interval must be non-zero".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout must be non-zero".into()));
        }
        self.profile.validate()
    }

    /// Adapter name, or `None` when it should be auto-detected.
    #[must_use]
    pub fn interface(&self) -> Option<&str> {
        let name = self.interface.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Waiting primitive used by the cyclic thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerStrategy {
    /// Spin on the monotonic clock with a CPU relax hint.
    BusyWait,
    /// Sleep until the deadline using the standard thread sleep.
    #[default]
    Sleep,
    /// Absolute-deadline wait on the OS monotonic timer.
    NativeTimer,
}

/// Slave synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Slaves latch outputs on frame arrival.
    FreeRun,
    /// Slaves latch outputs on the distributed clock SYNC0 event.
    #[default]
    Dc,
}

/// Real-time scheduling configuration for the cyclic thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Enable real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy.
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPUs the cyclic thread may run on. Empty leaves affinity untouched.
    pub cpus: Vec<usize>,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            priority: 80,
            cpus: Vec::new(),
            lock_memory: true,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// Start address and length of one sync manager window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmWindow {
    /// Physical start address in ESC memory.
    pub start: u16,
    /// Window length in bytes.
    pub length: u16,
}

/// Process data and mailbox layout shared by every slave in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveProfile {
    /// Output (master to slave) bytes per slave.
    pub output_bytes: u16,
    /// Input (slave to master) bytes per slave.
    pub input_bytes: u16,
    /// SM2 start address for outputs.
    pub output_sm_start: u16,
    /// SM3 start address for inputs.
    pub input_sm_start: u16,
    /// SM0, master to slave mailbox.
    pub mailbox_out: SmWindow,
    /// SM1, slave to master mailbox.
    pub mailbox_in: SmWindow,
}

impl Default for SlaveProfile {
    fn default() -> Self {
        Self {
            output_bytes: 626,
            input_bytes: 2,
            output_sm_start: 0x1100,
            input_sm_start: 0x1E00,
            mailbox_out: SmWindow {
                start: 0x1000,
                length: 128,
            },
            mailbox_in: SmWindow {
                start: 0x1080,
                length: 128,
            },
        }
    }
}

impl SlaveProfile {
    /// Profile with the given process data sizes and default addresses.
    #[must_use]
    pub fn with_sizes(output_bytes: u16, input_bytes: u16) -> Self {
        Self {
            output_bytes,
            input_bytes,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // An 11-bit datagram length caps a single slave's share of a frame.
        if self.output_bytes > 0x7FF || self.input_bytes > 0x7FF {
            return Err(ConfigError::Invalid(format!(
                "process data too large: {} out / {} in",
                self.output_bytes, self.input_bytes
            )));
        }
        let out_end = u32::from(self.output_sm_start) + u32::from(self.output_bytes);
        let in_end = u32::from(self.input_sm_start) + u32::from(self.input_bytes);
        if out_end > 0x1_0000 || in_end > 0x1_0000 {
            return Err(ConfigError::Invalid(
                "sync manager window exceeds ESC memory".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.send_cycle, Duration::from_millis(1));
        assert_eq!(config.timer_strategy, TimerStrategy::Sleep);
        assert_eq!(config.sync_mode, SyncMode::Dc);
        assert!(config.interface().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            interface = "enp3s0"
            send_cycle = "500us"
            sync0_cycle = "500us"
            timer_strategy = "native_timer"
            sync_mode = "free_run"
            state_check_interval = "50ms"
            buf_size = 0

            [realtime]
            enabled = true
            priority = 95
            cpus = [2, 3]

            [profile]
            output_bytes = 64
            input_bytes = 4
        "#;

        let config = LinkConfig::from_toml(toml).unwrap();
        assert_eq!(config.interface(), Some("enp3s0"));
        assert_eq!(config.send_cycle, Duration::from_micros(500));
        assert_eq!(config.timer_strategy, TimerStrategy::NativeTimer);
        assert_eq!(config.sync_mode, SyncMode::FreeRun);
        assert_eq!(config.state_check_interval, Duration::from_millis(50));
        assert_eq!(config.buf_size, 0);
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.cpus, vec![2, 3]);
        assert_eq!(config.profile.output_bytes, 64);
        assert_eq!(config.profile.output_sm_start, 0x1100);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = LinkConfig::default();
        config.interface = "eth1".into();
        config.timer_strategy = TimerStrategy::BusyWait;

        let text = config.to_toml().unwrap();
        let parsed = LinkConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_zero_cycle() {
        let err = LinkConfig::from_toml(r#"send_cycle = "0s""#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("send_cycle")));
    }

    #[test]
    fn test_rejects_oversized_profile() {
        let err = LinkConfig::from_toml("[profile]\noutput_bytes = 4096").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_blank_interface_is_auto() {
        let config = LinkConfig::from_toml(r#"interface = "   ""#).unwrap();
        assert!(config.interface().is_none());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("emem-config-{}.toml", std::process::id()));
        std::fs::write(&path, "interface = \"eth1\"\nbuf_size = 4\n").unwrap();
        let config = LinkConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.interface(), Some("eth1"));
        assert_eq!(config.buf_size, 4);

        let err = LinkConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validate_checks_every_duration() {
        let mut config = LinkConfig::default();
        config.timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("timeout")));

        config.timeout = Duration::from_millis(2);
        config.state_check_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
