use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::comm::collector::DEFAULT_CONNECT_TIMEOUT;
use crate::comm::RetryPolicy;
use crate::error::ConfigError;

/// Inclusive safe interval for a single sensor field
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafeRange {
    pub min: f64,
    pub max: f64,
}

impl SafeRange {
    pub const fn new(min: f64, max: f64) -> Self {
        SafeRange { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Tunables of the reading pipeline, battery model and aggregation cycle
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Readings older than this (relative to the newest) leave the window
    pub window_horizon: time::Duration,
    /// Readings needed in the window before discrepancy checks run
    pub min_window_readings: usize,
    pub temperature_spread_limit: f64,
    pub altitude_spread_limit: f64,
    pub temperature_range: SafeRange,
    pub pressure_range: SafeRange,
    pub altitude_range: SafeRange,
    pub motor_range: SafeRange,

    pub aggregation_period: Duration,

    // Battery drain, all in percent
    pub time_drain_per_sec: f64,
    pub drain_per_read: f64,
    pub drain_per_send: f64,
    pub motor_drain_factor: f64,

    // Battery gates, all in percent
    pub accept_threshold: f64,
    pub send_threshold: f64,
    pub return_to_base_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            window_horizon: time::Duration::seconds(2),
            min_window_readings: 4,
            temperature_spread_limit: 5.0,
            altitude_spread_limit: 1.0,
            temperature_range: SafeRange::new(-10.0, 60.0),
            pressure_range: SafeRange::new(300.0, 1100.0),
            altitude_range: SafeRange::new(0.0, 500.0),
            motor_range: SafeRange::new(0.0, 100.0),
            aggregation_period: Duration::from_secs(2),
            time_drain_per_sec: 0.1,
            drain_per_read: 0.05,
            drain_per_send: 0.2,
            motor_drain_factor: 0.001,
            accept_threshold: 10.0,
            send_threshold: 20.0,
            return_to_base_threshold: 20.0,
        }
    }
}

/// Full service configuration: network endpoints plus pipeline tunables
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub collector_url: Url,
    pub channel_capacity: usize,
    pub collector_retry: RetryPolicy,
    pub collector_connect_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl ServiceConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_string());

        let raw_url =
            env::var("COLLECTOR_URL").unwrap_or_else(|_| "tcp://localhost:9100".to_string());
        let collector_url = Url::parse(&raw_url).map_err(|_| ConfigError::InvalidValue {
            key: "COLLECTOR_URL".into(),
            value: raw_url.clone(),
        })?;

        let channel_capacity = env_or("CHANNEL_CAPACITY", 1024usize)?;
        if channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHANNEL_CAPACITY".into(),
                value: "0".into(),
            });
        }

        let defaults = RetryPolicy::default();
        let collector_retry = RetryPolicy {
            max_attempts: env_or("COLLECTOR_RETRY_ATTEMPTS", defaults.max_attempts)?,
            initial_delay: Duration::from_millis(env_or(
                "COLLECTOR_RETRY_INITIAL_MS",
                defaults.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(env_or(
                "COLLECTOR_RETRY_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
            multiplier: defaults.multiplier,
        };

        let connect_timeout_ms = env_or(
            "COLLECTOR_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        )?;
        if connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COLLECTOR_CONNECT_TIMEOUT_MS".into(),
                value: "0".into(),
            });
        }
        let collector_connect_timeout = Duration::from_millis(connect_timeout_ms);

        let base = PipelineConfig::default();
        let pipeline = PipelineConfig {
            window_horizon: time::Duration::seconds_f64(positive_secs(
                "WINDOW_HORIZON_SECS",
                base.window_horizon.as_seconds_f64(),
            )?),
            aggregation_period: Duration::from_secs_f64(positive_secs(
                "AGGREGATION_PERIOD_SECS",
                base.aggregation_period.as_secs_f64(),
            )?),
            time_drain_per_sec: non_negative("TIME_DRAIN_PER_SEC", base.time_drain_per_sec)?,
            drain_per_read: non_negative("DRAIN_PER_READ", base.drain_per_read)?,
            drain_per_send: non_negative("DRAIN_PER_SEND", base.drain_per_send)?,
            motor_drain_factor: non_negative("MOTOR_DRAIN_FACTOR", base.motor_drain_factor)?,
            accept_threshold: env_or("ACCEPT_THRESHOLD", base.accept_threshold)?,
            send_threshold: env_or("SEND_THRESHOLD", base.send_threshold)?,
            return_to_base_threshold: env_or(
                "RETURN_TO_BASE_THRESHOLD",
                base.return_to_base_threshold,
            )?,
            temperature_range: range_or("TEMPERATURE_RANGE", base.temperature_range)?,
            pressure_range: range_or("PRESSURE_RANGE", base.pressure_range)?,
            altitude_range: range_or("ALTITUDE_RANGE", base.altitude_range)?,
            motor_range: range_or("MOTOR_RANGE", base.motor_range)?,
            ..base
        };

        Ok(ServiceConfig {
            listen_addr,
            collector_url,
            channel_capacity,
            collector_retry,
            collector_connect_timeout,
            pipeline,
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// Seconds that must be finite, positive and at most a day
fn positive_secs(key: &str, default: f64) -> Result<f64, ConfigError> {
    let secs = env_or(key, default)?;
    if secs.is_finite() && secs > 0.0 && secs <= 86_400.0 {
        Ok(secs)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: secs.to_string(),
        })
    }
}

/// Drain rates: finite and never negative, so a level can only fall
fn non_negative(key: &str, default: f64) -> Result<f64, ConfigError> {
    check_non_negative(key, env_or(key, default)?)
}

fn check_non_negative(key: &str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

fn range_or(key: &str, default: SafeRange) -> Result<SafeRange, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_range(key, &raw),
        Err(_) => Ok(default),
    }
}

/// Parse a `min,max` pair such as `-10,60`
fn parse_range(key: &str, raw: &str) -> Result<SafeRange, ConfigError> {
    let (min, max) = raw.split_once(',').ok_or_else(|| ConfigError::InvalidRange {
        key: key.to_string(),
    })?;
    let min: f64 = parse_value(key, min)?;
    let max: f64 = parse_value(key, max)?;
    if min > max {
        return Err(ConfigError::InvalidRange {
            key: key.to_string(),
        });
    }
    Ok(SafeRange::new(min, max))
}
