//! Configuration management for a hive.
//!
//! [`HiveConfig`] collects the timing of the bee runtime (polling, heartbeats,
//! lease lifetime, expiry sweeps), the defaults merged into every submitted
//! job, and the defaults applied to registered bees. It can be built in code
//! or loaded from TOML, where durations are written as `"150ms"`, `"30s"`,
//! `"5m"`, `"1h"`, `"1d"` or a bare number of milliseconds.
//!
//! ```rust
//! use beehive::config::HiveConfig;
//! use std::time::Duration;
//!
//! let config = HiveConfig::from_toml_str(r#"
//!     poll_interval = "250ms"
//!     lease_duration = "2m"
//!
//!     [job_defaults]
//!     retries = 3
//!     retry_delay = "10s"
//! "#).unwrap();
//!
//! assert_eq!(config.poll_interval, Duration::from_millis(250));
//! assert_eq!(config.job_defaults.retries, 3);
//! // untouched values keep their defaults
//! assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
//! ```

use crate::{BeehiveError, Result, job::JobOptions};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Serialize `std::time::Duration` as human-readable strings with millisecond precision.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis == 0 {
            serializer.serialize_str("0ms")
        } else if millis % 86_400_000 == 0 {
            serializer.serialize_str(&format!("{}d", millis / 86_400_000))
        } else if millis % 3_600_000 == 0 {
            serializer.serialize_str(&format!("{}h", millis / 3_600_000))
        } else if millis % 60_000 == 0 {
            serializer.serialize_str(&format!("{}m", millis / 60_000))
        } else if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{}ms", millis))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(s) => parse_duration(&s).map_err(D::Error::custom),
        }
    }

    /// Parse a duration string like "150ms", "30s", "5m", "1h", "2d" or "90" (milliseconds).
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        if let Ok(ms) = s.parse::<u64>() {
            return Ok(Duration::from_millis(ms));
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration format: {}", s))?;
        let (num_str, suffix) = s.split_at(split);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;

        match suffix {
            "ms" => Ok(Duration::from_millis(num)),
            "s" => Ok(Duration::from_secs(num)),
            "m" => Ok(Duration::from_secs(num * 60)),
            "h" => Ok(Duration::from_secs(num * 3600)),
            "d" => Ok(Duration::from_secs(num * 86400)),
            _ => Err(format!(
                "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                suffix
            )),
        }
    }
}

/// Main configuration of a hive.
///
/// # Examples
///
/// ```rust
/// use beehive::config::HiveConfig;
/// use std::time::Duration;
///
/// let config = HiveConfig::new()
///     .with_poll_interval(Duration::from_millis(200))
///     .with_heartbeat_interval(Duration::from_secs(5))
///     .with_lease_duration(Duration::from_secs(15));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    /// Fallback polling period of every bee, covering missed notifications.
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,

    /// How often a bee refreshes its liveness and the leases it holds.
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,

    /// Lifetime of a lease between heartbeats. Must exceed the heartbeat interval.
    #[serde(with = "duration_str")]
    pub lease_duration: Duration,

    /// How often a bee requeues jobs with lapsed leases and purges expired records.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,

    /// How long a canceled job's record stays readable before deletion.
    #[serde(with = "duration_str")]
    pub canceled_ttl: Duration,

    /// Jobs fetched per pull by bees with unlimited concurrency.
    pub fetch_batch: usize,

    /// Buffer size of the in-process event bus.
    pub channel_capacity: usize,

    /// Defaults merged under every submitted job's options.
    pub job_defaults: JobDefaults,

    /// Defaults for registered bees.
    pub bee_defaults: BeeDefaults,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(1),
            canceled_ttl: Duration::from_secs(60),
            fetch_batch: 5,
            channel_capacity: 1024,
            job_defaults: JobDefaults::default(),
            bee_defaults: BeeDefaults::default(),
        }
    }
}

impl HiveConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: HiveConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_canceled_ttl(mut self, ttl: Duration) -> Self {
        self.canceled_ttl = ttl;
        self
    }

    pub fn with_fetch_batch(mut self, batch: usize) -> Self {
        self.fetch_batch = batch;
        self
    }

    pub fn with_job_defaults(mut self, defaults: JobDefaults) -> Self {
        self.job_defaults = defaults;
        self
    }

    pub fn with_bee_defaults(mut self, defaults: BeeDefaults) -> Self {
        self.bee_defaults = defaults;
        self
    }

    /// Reject configurations under which leases could lapse between heartbeats.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("lease_duration", self.lease_duration),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(BeehiveError::Config(format!("{} must be positive", name)));
            }
        }
        if self.lease_duration <= self.heartbeat_interval {
            return Err(BeehiveError::Config(format!(
                "lease_duration ({:?}) must exceed heartbeat_interval ({:?})",
                self.lease_duration, self.heartbeat_interval
            )));
        }
        if self.fetch_batch == 0 {
            return Err(BeehiveError::Config("fetch_batch must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(BeehiveError::Config(
                "channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Option defaults for submitted jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub priority: i64,
    #[serde(with = "duration_str")]
    pub delay: Duration,
    pub retries: u32,
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    pub progressive_delay: bool,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: Duration::ZERO,
            retries: 5,
            retry_delay: Duration::from_secs(30),
            progressive_delay: false,
            ttl: Duration::from_secs(30 * 60),
        }
    }
}

impl JobDefaults {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn to_options(&self) -> JobOptions {
        JobOptions {
            priority: self.priority,
            delay: self.delay.as_millis() as u64,
            dependencies: Vec::new(),
            retries: self.retries,
            retry_delay: self.retry_delay.as_millis() as u64,
            progressive_delay: self.progressive_delay,
            ttl: self.ttl.as_millis() as u64,
            timeout: None,
        }
    }
}

/// Defaults for registered bees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeeDefaults {
    /// Upper bound on a single worker or hash invocation.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Concurrent executions per bee; unlimited when absent.
    pub concurrency: Option<usize>,
}

impl Default for BeeDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            concurrency: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::duration_str::parse_duration;
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = HiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fetch_batch, 5);
        assert_eq!(config.job_defaults.to_options(), JobOptions::default());
        assert_eq!(config.canceled_ttl, Duration::from_secs(60));
        assert!(config.canceled_ttl < config.job_defaults.ttl);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration(" 90 ").unwrap(), Duration::from_millis(90));
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = HiveConfig::new()
            .with_poll_interval(Duration::from_millis(250))
            .with_canceled_ttl(Duration::from_secs(120))
            .with_job_defaults(JobDefaults::default().with_retries(2));

        let text = config.to_toml_string().unwrap();
        assert!(text.contains("poll_interval = \"250ms\""));
        assert!(text.contains("canceled_ttl = \"2m\""));

        let back = HiveConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_numbers_are_milliseconds() {
        let config = HiveConfig::from_toml_str("sweep_interval = 500").unwrap();
        assert_eq!(config.sweep_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_lease_must_outlive_heartbeat() {
        let config = HiveConfig::new()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_lease_duration(Duration::from_secs(10));
        assert!(matches!(config.validate(), Err(BeehiveError::Config(_))));

        let err = HiveConfig::from_toml_str("heartbeat_interval = \"2m\"").unwrap_err();
        assert!(err.to_string().contains("lease_duration"));
    }

    #[test]
    fn test_invalid_toml_is_a_config_error() {
        let err = HiveConfig::from_toml_str("poll_interval = \"soon\"").unwrap_err();
        assert!(matches!(err, BeehiveError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "fetch_batch = 10\n\n[bee_defaults]\ntimeout = \"3s\"\nconcurrency = 4"
        )
        .unwrap();

        let config = HiveConfig::from_file(file.path()).unwrap();
        assert_eq!(config.fetch_batch, 10);
        assert_eq!(config.bee_defaults.timeout, Duration::from_secs(3));
        assert_eq!(config.bee_defaults.concurrency, Some(4));

        let missing = HiveConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(missing, Err(BeehiveError::Io(_))));
    }
}
