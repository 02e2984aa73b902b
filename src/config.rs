//! Runtime configuration for the provisioner.
//!
//! Values come from CLI flags / environment (see `main.rs`) and are
//! validated once before anything is started.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default controller name
pub const DEFAULT_CONTROLLER_NAME: &str = "ddp-storage-provisioner";

/// Tunables for the controller and its queues
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Controller name used in logs and queue names
    pub controller_name: String,

    /// Worker loops per queue
    pub worker_threads: usize,

    /// Initial retry interval of a failed reconcile; doubles per failure
    pub retry_interval_start: Duration,

    /// Upper bound of the retry interval
    pub retry_interval_max: Duration,

    /// Interval at which every cached object is re-delivered as an update
    pub resync: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            worker_threads: 25,
            retry_interval_start: Duration::from_secs(1),
            retry_interval_max: Duration::from_secs(300),
            resync: Duration::from_secs(600),
        }
    }
}

impl ProvisionerConfig {
    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config(
                "option --worker-threads must be greater than zero".to_string(),
            ));
        }
        if self.resync.is_zero() {
            return Err(Error::Config(
                "option --resync must be greater than zero".to_string(),
            ));
        }
        if self.retry_interval_start > self.retry_interval_max {
            return Err(Error::Config(format!(
                "retry interval start {:?} exceeds retry interval max {:?}",
                self.retry_interval_start, self.retry_interval_max
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration flag such as "1h30m", "5m", "500ms" or "10s".
///
/// A bare number counts as seconds. Zero is rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let duration = if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::DurationParse(format!("{}: {}", s, e)))?
    } else {
        humantime::parse_duration(s).map_err(|e| Error::DurationParse(format!("{}: {}", s, e)))?
    };

    if duration.is_zero() {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
    }

    #[test]
    fn test_parse_duration_sub_second() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1s500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(matches!(
            parse_duration("9999999999999999h"),
            Err(Error::DurationParse(_))
        ));
        assert!(matches!(
            parse_duration("99999999999999999999999"),
            Err(Error::DurationParse(_))
        ));
    }

    #[test]
    fn test_parse_duration_raw_seconds() {
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("  15  ").unwrap(), Duration::from_secs(15));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("1x").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProvisionerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_threads, 25);
        assert_eq!(config.retry_interval_start, Duration::from_secs(1));
        assert_eq!(config.retry_interval_max, Duration::from_secs(300));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ProvisionerConfig {
            worker_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let config = ProvisionerConfig {
            retry_interval_start: Duration::from_secs(600),
            retry_interval_max: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
