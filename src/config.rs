use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_UTC_OFFSET_MINUTES;
use crate::time::ParseMode;

/// Process configuration, read from `RIGTIME_*` environment variables.
/// Unset or unparseable values fall back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Venue timezone, minutes such that `UTC = local + offset`.
    pub venue_utc_offset_minutes: i32,
    pub lenient_time_parsing: bool,
    pub watch_reconcile: Duration,
    pub sweep_interval: Duration,
}

/// The subset of [`Config`] the engine itself consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub venue_utc_offset_minutes: i32,
    pub lenient_time_parsing: bool,
}

impl EngineConfig {
    pub fn parse_mode(&self) -> ParseMode {
        if self.lenient_time_parsing {
            ParseMode::Lenient
        } else {
            ParseMode::Strict
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            venue_utc_offset_minutes: 0,
            lenient_time_parsing: false,
            watch_reconcile: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();

        let venue_utc_offset_minutes = parse_var(&lookup, "RIGTIME_VENUE_UTC_OFFSET_MINUTES")
            .filter(|o: &i32| o.abs() <= MAX_UTC_OFFSET_MINUTES)
            .unwrap_or(d.venue_utc_offset_minutes);
        let lenient_time_parsing = lookup("RIGTIME_LENIENT_TIME_PARSING")
            .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(d.lenient_time_parsing);

        Self {
            bind: lookup("RIGTIME_BIND").unwrap_or(d.bind),
            port: parse_var(&lookup, "RIGTIME_PORT").unwrap_or(d.port),
            data_dir: lookup("RIGTIME_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parse_var(&lookup, "RIGTIME_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parse_var(&lookup, "RIGTIME_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parse_var(&lookup, "RIGTIME_METRICS_PORT"),
            venue_utc_offset_minutes,
            lenient_time_parsing,
            watch_reconcile: parse_var(&lookup, "RIGTIME_WATCH_RECONCILE_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.watch_reconcile),
            sweep_interval: parse_var(&lookup, "RIGTIME_SWEEP_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            venue_utc_offset_minutes: self.venue_utc_offset_minutes,
            lenient_time_parsing: self.lenient_time_parsing,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
