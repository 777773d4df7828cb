//! Admin operator surface, exposed to the external HTTP layer at the
//! contract level: queue introspection, concurrency control,
//! recomputation triggers, settings management, admin records.

use crate::error::Result;
use crate::queue::{JobQueue, QueueStats};
use crate::scheduler::Scheduler;
use crate::settings::RuntimeSettings;
use crate::store::admins::{Admin, AdminRepo};
use crate::store::settings::SettingRow;
use std::sync::Arc;

pub struct AdminOps {
    queue: JobQueue,
    settings: Arc<RuntimeSettings>,
    scheduler: Arc<Scheduler>,
    admins: AdminRepo,
}

impl AdminOps {
    pub fn new(
        queue: JobQueue,
        settings: Arc<RuntimeSettings>,
        scheduler: Arc<Scheduler>,
        admins: AdminRepo,
    ) -> Self {
        Self { queue, settings, scheduler, admins }
    }

    // ── Queue ───────────────────────────────────────────────────────

    pub fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats()
    }

    pub fn clear_failed_jobs(&self, older_than_days: u32) -> Result<usize> {
        self.queue.clear_failed(older_than_days)
    }

    // ── Concurrency ─────────────────────────────────────────────────

    pub fn get_concurrency(&self) -> u32 {
        self.settings.worker_concurrency()
    }

    /// Persist the new parallelism; the worker supervisor rebuilds its
    /// generation on the broadcast.
    pub fn set_concurrency(&self, workers: u32) -> Result<()> {
        self.settings.set("worker_concurrency", &workers.to_string())
    }

    // ── Recomputation ───────────────────────────────────────────────

    pub fn trigger_recalculation(
        &self,
        location_id: i64,
        year_from: i32,
        year_to: i32,
    ) -> Result<Option<i64>> {
        self.scheduler.trigger_location(location_id, year_from, year_to)
    }

    pub fn regenerate_all(&self, year_from: i32, year_to: i32) -> Result<usize> {
        self.scheduler.regenerate_all(year_from, year_to)
    }

    // ── Settings ────────────────────────────────────────────────────

    pub fn settings(&self) -> Result<Vec<SettingRow>> {
        self.settings.rows()
    }

    pub fn update_setting(&self, key: &str, value: &str) -> Result<()> {
        self.settings.set(key, value)
    }

    pub fn clear_settings_cache(&self) {
        self.settings.clear_cache()
    }

    // ── Admin records ───────────────────────────────────────────────

    pub fn create_admin(&self, username: &str, email: &str, password: &str) -> Result<Admin> {
        self.admins.create(username, email, password)
    }
}
