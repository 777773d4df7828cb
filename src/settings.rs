//! Runtime settings: a typed view over `system_settings` with an
//! in-process snapshot cache.
//!
//! Reads go through a 60-second snapshot so job handlers see one
//! consistent set of values for their whole run (they grab the snapshot
//! once at start). Writes persist first, then drop the snapshot and
//! broadcast concurrency changes to the worker supervisor.

use crate::error::{CoreError, Result};
use crate::store::settings::SettingsRepo;
use crate::store::Database;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const MIN_CONCURRENCY: u32 = 1;
pub const MAX_CONCURRENCY: u32 = 10;

const CACHE_TTL: Duration = Duration::from_secs(60);

/// One consistent view of every recognized setting.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub worker_concurrency: u32,
    pub job_delay_ms: u64,
    pub processing_delay_ms: u64,
    pub refraction_coefficient: f64,
    pub observer_eye_height_m: f64,
    pub pearl_illumination_min: f64,
    pub diamond_season_months: Vec<u32>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            worker_concurrency: 1,
            job_delay_ms: 5000,
            processing_delay_ms: 2000,
            refraction_coefficient: 1.02,
            observer_eye_height_m: 1.7,
            pearl_illumination_min: 0.10,
            diamond_season_months: vec![10, 11, 12, 1, 2, 3],
        }
    }
}

struct CachedSnapshot {
    snapshot: Snapshot,
    created: Instant,
}

pub struct RuntimeSettings {
    repo: SettingsRepo,
    cache: Mutex<Option<CachedSnapshot>>,
    concurrency_tx: watch::Sender<u32>,
}

impl RuntimeSettings {
    pub fn new(db: Database) -> Self {
        let repo = SettingsRepo::new(db);
        let initial = load_snapshot(&repo).unwrap_or_default();
        let (concurrency_tx, _) = watch::channel(initial.worker_concurrency);
        Self { repo, cache: Mutex::new(None), concurrency_tx }
    }

    /// Current settings, served from the snapshot cache when fresh.
    pub fn snapshot(&self) -> Snapshot {
        let mut cache = self.cache.lock().expect("settings cache poisoned");
        if let Some(entry) = cache.as_ref() {
            if entry.created.elapsed() < CACHE_TTL {
                return entry.snapshot.clone();
            }
        }
        let snapshot = load_snapshot(&self.repo).unwrap_or_default();
        *cache = Some(CachedSnapshot { snapshot: snapshot.clone(), created: Instant::now() });
        snapshot
    }

    /// Validate, persist, invalidate the snapshot, and notify.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        validate(key, value)?;
        self.repo.set(key, value)?;
        self.clear_cache();
        if key == "worker_concurrency" {
            if let Ok(parsed) = value.parse::<u32>() {
                let _ = self
                    .concurrency_tx
                    .send(parsed.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY));
            }
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        *self.cache.lock().expect("settings cache poisoned") = None;
    }

    pub fn rows(&self) -> Result<Vec<crate::store::settings::SettingRow>> {
        self.repo.all()
    }

    pub fn worker_concurrency(&self) -> u32 {
        self.snapshot().worker_concurrency
    }

    /// Receiver the worker supervisor watches for live resizing.
    pub fn subscribe_concurrency(&self) -> watch::Receiver<u32> {
        self.concurrency_tx.subscribe()
    }
}

fn load_snapshot(repo: &SettingsRepo) -> Result<Snapshot> {
    let defaults = Snapshot::default();
    Ok(Snapshot {
        worker_concurrency: parse_or(repo, "worker_concurrency", defaults.worker_concurrency)?
            .clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
        job_delay_ms: parse_or(repo, "job_delay_ms", defaults.job_delay_ms)?,
        processing_delay_ms: parse_or(repo, "processing_delay_ms", defaults.processing_delay_ms)?,
        refraction_coefficient: parse_or(repo, "refraction_coefficient", defaults.refraction_coefficient)?,
        observer_eye_height_m: parse_or(repo, "observer_eye_height_m", defaults.observer_eye_height_m)?,
        pearl_illumination_min: parse_or(repo, "pearl_illumination_min", defaults.pearl_illumination_min)?,
        diamond_season_months: months_or(repo, defaults.diamond_season_months)?,
    })
}

fn parse_or<T: std::str::FromStr>(repo: &SettingsRepo, key: &str, default: T) -> Result<T> {
    Ok(repo
        .get(key)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(default))
}

fn months_or(repo: &SettingsRepo, default: Vec<u32>) -> Result<Vec<u32>> {
    Ok(repo
        .get("diamond_season_months")?
        .and_then(|v| serde_json::from_str::<Vec<u32>>(&v).ok())
        .filter(|m| !m.is_empty() && m.iter().all(|&x| (1..=12).contains(&x)))
        .unwrap_or(default))
}

fn validate(key: &str, value: &str) -> Result<()> {
    let bad = |detail: &str| {
        Err(CoreError::InvalidInput(format!("setting '{key}' = '{value}': {detail}")))
    };
    match key {
        "worker_concurrency" => match value.parse::<u32>() {
            Ok(n) if (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&n) => Ok(()),
            Ok(_) => bad("outside [1, 10]"),
            Err(_) => bad("not an integer"),
        },
        "job_delay_ms" | "processing_delay_ms" => {
            if value.parse::<u64>().is_ok() { Ok(()) } else { bad("not an integer") }
        }
        "refraction_coefficient" | "observer_eye_height_m" => {
            match value.parse::<f64>() {
                Ok(v) if v.is_finite() && v >= 0.0 => Ok(()),
                _ => bad("not a non-negative number"),
            }
        }
        "pearl_illumination_min" => match value.parse::<f64>() {
            Ok(v) if (0.0..=1.0).contains(&v) => Ok(()),
            _ => bad("not a fraction in [0, 1]"),
        },
        "diamond_season_months" => match serde_json::from_str::<Vec<u32>>(value) {
            Ok(m) if !m.is_empty() && m.iter().all(|&x| (1..=12).contains(&x)) => Ok(()),
            _ => bad("not a non-empty JSON array of months 1..12"),
        },
        _ => bad("unrecognized key"),
    }
}
