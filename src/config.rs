use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::DetectorConfig;
use crate::limits::{MAX_CONFLICT_LOOKBACK_MINUTES, MAX_GRID_STEP_MINUTES};
use crate::model::MINUTE_MS;
use crate::scheduler::{CommitMode, RetryPolicy, SchedulerConfig};

/// Process configuration, read from `MARQUEE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// JSON file with movies and theater layouts; empty catalog if unset.
    pub catalog_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            password: "marquee".into(),
            catalog_path: None,
            metrics_port: None,
            max_connections: 256,
            compact_threshold: 1000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let sched = &defaults.scheduler;
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let step_minutes: i64 = parse(&get, "MARQUEE_GRID_STEP_MINUTES", 10);
        let lookback_minutes: i64 = parse(&get, "MARQUEE_CONFLICT_LOOKBACK_MINUTES", 0);
        let backoff_ms: u64 = parse(
            &get,
            "MARQUEE_RETRY_BACKOFF_MS",
            sched.retry.backoff.as_millis() as u64,
        );

        Self {
            bind: get("MARQUEE_BIND").unwrap_or(defaults.bind),
            port: parse(&get, "MARQUEE_PORT", defaults.port),
            data_dir: get("MARQUEE_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: get("MARQUEE_PASSWORD").unwrap_or(defaults.password),
            catalog_path: get("MARQUEE_CATALOG").map(PathBuf::from),
            metrics_port: get("MARQUEE_METRICS_PORT").and_then(|s| s.parse().ok()),
            max_connections: parse(&get, "MARQUEE_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parse(&get, "MARQUEE_COMPACT_THRESHOLD", defaults.compact_threshold),
            scheduler: SchedulerConfig {
                workers: parse(&get, "MARQUEE_WORKERS", sched.workers).max(1),
                queue_capacity: parse(&get, "MARQUEE_QUEUE_CAPACITY", sched.queue_capacity).max(1),
                retry: RetryPolicy {
                    max_attempts: parse(&get, "MARQUEE_MAX_ATTEMPTS", sched.retry.max_attempts).max(1),
                    backoff: Duration::from_millis(backoff_ms),
                },
                commit_mode: parse(&get, "MARQUEE_COMMIT_MODE", CommitMode::default()),
                detector: DetectorConfig {
                    step_ms: step_minutes.clamp(1, MAX_GRID_STEP_MINUTES) * MINUTE_MS,
                    lookback_ms: lookback_minutes.clamp(0, MAX_CONFLICT_LOOKBACK_MINUTES) * MINUTE_MS,
                },
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("marquee.wal")
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {key}={raw}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.port, 5480);
        assert_eq!(cfg.password, "marquee");
        assert_eq!(cfg.catalog_path, None);
        assert_eq!(cfg.scheduler.commit_mode, CommitMode::Atomic);
        assert_eq!(cfg.scheduler.detector, DetectorConfig::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/marquee.wal"));
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("MARQUEE_PORT", "7000"),
            ("MARQUEE_WORKERS", "8"),
            ("MARQUEE_COMMIT_MODE", "Compensating"),
            ("MARQUEE_GRID_STEP_MINUTES", "5"),
            ("MARQUEE_CONFLICT_LOOKBACK_MINUTES", "240"),
            ("MARQUEE_RETRY_BACKOFF_MS", "50"),
            ("MARQUEE_CATALOG", "/etc/marquee/catalog.json"),
        ]);
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.scheduler.workers, 8);
        assert_eq!(cfg.scheduler.commit_mode, CommitMode::Compensating);
        assert_eq!(cfg.scheduler.detector.step_ms, 5 * MINUTE_MS);
        assert_eq!(cfg.scheduler.detector.lookback_ms, 240 * MINUTE_MS);
        assert_eq!(cfg.scheduler.retry.backoff, Duration::from_millis(50));
        assert_eq!(cfg.catalog_path, Some(PathBuf::from("/etc/marquee/catalog.json")));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = config(&[
            ("MARQUEE_PORT", "not-a-port"),
            ("MARQUEE_COMMIT_MODE", "eventual"),
            ("MARQUEE_WORKERS", "0"),
            ("MARQUEE_GRID_STEP_MINUTES", "-3"),
        ]);
        assert_eq!(cfg.port, 5480);
        assert_eq!(cfg.scheduler.commit_mode, CommitMode::Atomic);
        assert_eq!(cfg.scheduler.workers, 1);
        assert_eq!(cfg.scheduler.detector.step_ms, MINUTE_MS);
    }

    #[test]
    fn huge_minute_values_are_capped() {
        let huge = i64::MAX.to_string();
        let cfg = config(&[
            ("MARQUEE_GRID_STEP_MINUTES", huge.as_str()),
            ("MARQUEE_CONFLICT_LOOKBACK_MINUTES", huge.as_str()),
        ]);
        let detector = cfg.scheduler.detector;
        assert_eq!(detector.step_ms, MAX_GRID_STEP_MINUTES * MINUTE_MS);
        assert_eq!(detector.lookback_ms, MAX_CONFLICT_LOOKBACK_MINUTES * MINUTE_MS);
    }
}
