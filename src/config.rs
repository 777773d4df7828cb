//! Worker-process configuration from the environment.

use std::path::PathBuf;

pub const ENV_DB_PATH: &str = "FUJICAL_DB_PATH";
pub const ENV_LOG: &str = "FUJICAL_LOG";
pub const ENV_CONCURRENCY: &str = "FUJICAL_CONCURRENCY";
pub const ENV_SCHEDULER_ONLY: &str = "FUJICAL_SCHEDULER_ONLY";

#[derive(Debug, Clone)]
pub struct Config {
    /// Relational store and queue backing live in one SQLite file.
    pub db_path: PathBuf,
    /// tracing env-filter directive, e.g. "info" or "fujical=debug".
    pub log_filter: String,
    /// Initial worker concurrency; persisted into settings at startup
    /// when present.
    pub initial_concurrency: Option<u32>,
    /// Scheduler-only mode: keep the nightly pass, skip the worker role.
    pub scheduler_only: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: lookup(ENV_DB_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(default_db_path),
            log_filter: lookup(ENV_LOG).unwrap_or_else(|| "info".to_string()),
            initial_concurrency: lookup(ENV_CONCURRENCY).and_then(|v| v.parse().ok()),
            scheduler_only: lookup(ENV_SCHEDULER_ONLY)
                .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fujical")
        .join("fujical.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        Config::from_lookup(|key| map.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]);
        assert!(cfg.db_path.ends_with(".fujical/fujical.db"));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.initial_concurrency, None);
        assert!(!cfg.scheduler_only);
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            (ENV_DB_PATH, "/var/lib/fujical/events.db"),
            (ENV_LOG, "fujical=debug"),
            (ENV_CONCURRENCY, "4"),
            (ENV_SCHEDULER_ONLY, "true"),
        ]);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/fujical/events.db"));
        assert_eq!(cfg.log_filter, "fujical=debug");
        assert_eq!(cfg.initial_concurrency, Some(4));
        assert!(cfg.scheduler_only);
    }

    #[test]
    fn test_malformed_concurrency_ignored() {
        let cfg = config(&[(ENV_CONCURRENCY, "lots")]);
        assert_eq!(cfg.initial_concurrency, None);
    }
}
