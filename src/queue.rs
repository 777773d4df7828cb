//! Persistent priority job queue.
//!
//! The `jobs` table is the single source of truth for scheduling state:
//! no in-process mirror, so a crashed worker process resumes exactly
//! where the table says it left off. Higher priorities drain first,
//! FIFO by eligibility instant within a priority. Failures retry with
//! exponential backoff until `max_attempts`, then park as `failed` for
//! the operator.

use crate::error::{CoreError, Result};
use crate::store::Database;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PRIORITY_HIGH: i64 = 10;
pub const PRIORITY_NORMAL: i64 = 5;
pub const PRIORITY_LOW: i64 = 1;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn weight(self) -> i64 {
        match self {
            Priority::High => PRIORITY_HIGH,
            Priority::Normal => PRIORITY_NORMAL,
            Priority::Low => PRIORITY_LOW,
        }
    }
}

/// Typed job payloads, serialized as tagged JSON in the `payload`
/// column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobPayload {
    /// Recompute every day of `year_from..=year_to` for one location.
    LocationRange { location_id: i64, year_from: i32, year_to: i32 },
    /// One civil month.
    MonthlyRange { location_id: i64, year: i32, month: u32 },
    /// One civil day.
    Daily { location_id: i64, date: NaiveDate },
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::LocationRange { .. } => "location-range",
            JobPayload::MonthlyRange { .. } => "monthly-range",
            JobPayload::Daily { .. } => "daily",
        }
    }

    pub fn location_id(&self) -> i64 {
        match self {
            JobPayload::LocationRange { location_id, .. }
            | JobPayload::MonthlyRange { location_id, .. }
            | JobPayload::Daily { location_id, .. } => *location_id,
        }
    }

    /// Logical identity: re-enqueues of the same work collapse while a
    /// copy is still waiting or delayed.
    pub fn dedup_key(&self) -> String {
        match self {
            JobPayload::LocationRange { location_id, year_from, year_to } => {
                format!("range-{location_id}-{year_from}-{year_to}")
            }
            JobPayload::MonthlyRange { location_id, year, month } => {
                format!("monthly-{year}-{month}-{location_id}")
            }
            JobPayload::Daily { location_id, date } => format!("daily-{location_id}-{date}"),
        }
    }

    /// Per-kind processing deadline.
    pub fn deadline(&self) -> Duration {
        match self {
            JobPayload::LocationRange { .. } => Duration::from_secs(20 * 60),
            JobPayload::MonthlyRange { .. } => Duration::from_secs(5 * 60),
            JobPayload::Daily { .. } => Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub payload: JobPayload,
    pub priority: i64,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub not_before: i64,
}

/// Exponential backoff: base · 2^(attempt−1), capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_ms: 5_000, cap_ms: 5 * 60 * 1_000 }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJobInfo {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub last_error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub waiting: u32,
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
    pub delayed: u32,
    pub recent_failures: Vec<FailedJobInfo>,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db, backoff: BackoffPolicy::default(), max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enqueue a job, optionally delayed. Returns `None` when an
    /// identical logical job is already waiting or delayed — the
    /// pending copy absorbs the enqueue, escalating its priority and
    /// eligibility if the new request is more urgent.
    pub fn enqueue(
        &self,
        payload: &JobPayload,
        priority: Priority,
        delay: Duration,
    ) -> Result<Option<i64>> {
        let now = Utc::now().timestamp_millis();
        let not_before = now + delay.as_millis() as i64;
        let state = if delay.is_zero() { JobState::Waiting } else { JobState::Delayed };
        let json = serde_json::to_string(payload)?;
        let dedup_key = payload.dedup_key();

        self.db
            .with_tx(|tx| {
                let pending: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM jobs
                         WHERE dedup_key = ?1 AND state IN ('waiting', 'delayed')",
                        params![dedup_key],
                        |r| r.get(0),
                    )
                    .optional()?;

                if let Some(id) = pending {
                    tx.execute(
                        "UPDATE jobs SET priority = max(priority, ?2),
                                         not_before = min(not_before, ?3)
                         WHERE id = ?1",
                        params![id, priority.weight(), not_before],
                    )?;
                    return Ok(None);
                }

                tx.execute(
                    "INSERT INTO jobs
                       (kind, payload, dedup_key, location_id, priority, state,
                        not_before, attempts, max_attempts, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                    params![
                        payload.kind(),
                        json,
                        dedup_key,
                        payload.location_id(),
                        priority.weight(),
                        state.as_str(),
                        not_before,
                        self.max_attempts,
                        now,
                    ],
                )?;
                Ok(Some(tx.last_insert_rowid()))
            })
            .map_err(|e| CoreError::QueueUnavailable(e.to_string()))
    }

    /// Claim the next eligible job: highest priority first, then FIFO
    /// by eligibility instant. Due delayed jobs are promoted in the
    /// same transaction, so they become eligible exactly on time.
    pub fn lease(&self) -> Result<Option<Job>> {
        let now = Utc::now().timestamp_millis();
        self.db.with_tx(|tx| {
            tx.execute(
                "UPDATE jobs SET state = 'waiting'
                 WHERE state = 'delayed' AND not_before <= ?1",
                params![now],
            )?;

            let job = tx
                .query_row(
                    "SELECT id, payload, priority, state, attempts, max_attempts,
                            last_error, not_before
                     FROM jobs
                     WHERE state = 'waiting' AND not_before <= ?1
                     ORDER BY priority DESC, not_before ASC, id ASC
                     LIMIT 1",
                    params![now],
                    map_job,
                )
                .optional()?;

            if let Some(mut job) = job {
                tx.execute(
                    "UPDATE jobs SET state = 'active', started_at = ?2 WHERE id = ?1",
                    params![job.id, now],
                )?;
                job.state = JobState::Active;
                Ok(Some(job))
            } else {
                Ok(None)
            }
        })
    }

    pub fn complete(&self, id: i64) -> Result<()> {
        self.db.with(|c| {
            c.execute(
                "UPDATE jobs SET state = 'completed', finished_at = ?2 WHERE id = ?1",
                params![id, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
    }

    /// Record a failure. Retryable errors re-enter as `delayed` with
    /// exponential backoff until attempts are exhausted; everything
    /// else parks as permanently `failed`.
    pub fn fail(&self, id: i64, error: &str, retryable: bool) -> Result<JobState> {
        let now = Utc::now().timestamp_millis();
        self.db.with_tx(|tx| {
            let (attempts, max_attempts): (u32, u32) = tx.query_row(
                "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let attempts = attempts + 1;

            let state = if retryable && attempts < max_attempts {
                let delay = self.backoff.delay_for_attempt(attempts);
                tx.execute(
                    "UPDATE jobs SET state = 'delayed', attempts = ?2, last_error = ?3,
                                     not_before = ?4
                     WHERE id = ?1",
                    params![id, attempts, error, now + delay.as_millis() as i64],
                )?;
                JobState::Delayed
            } else {
                tx.execute(
                    "UPDATE jobs SET state = 'failed', attempts = ?2, last_error = ?3,
                                     finished_at = ?4
                     WHERE id = ?1",
                    params![id, attempts, error, now],
                )?;
                JobState::Failed
            };
            Ok(state)
        })
    }

    /// Put an active job back without burning an attempt (graceful
    /// shutdown path).
    pub fn return_to_waiting(&self, id: i64) -> Result<()> {
        self.db.with(|c| {
            c.execute(
                "UPDATE jobs SET state = 'waiting', started_at = NULL WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }

    /// Crash recovery: anything left `active` by a dead process drains
    /// again.
    pub fn recover_orphans(&self) -> Result<usize> {
        self.db.with(|c| {
            c.execute(
                "UPDATE jobs SET state = 'waiting', started_at = NULL WHERE state = 'active'",
                [],
            )
        })
    }

    /// Drop waiting/delayed jobs aimed at a location that no longer
    /// exists. Active jobs are left alone; their handler tolerates the
    /// vanished target.
    pub fn cancel_pending_for_location(&self, location_id: i64) -> Result<usize> {
        self.db.with(|c| {
            c.execute(
                "DELETE FROM jobs
                 WHERE location_id = ?1 AND state IN ('waiting', 'delayed')",
                params![location_id],
            )
        })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.db.with(|c| {
            let mut stats = QueueStats {
                waiting: 0,
                active: 0,
                completed: 0,
                failed: 0,
                delayed: 0,
                recent_failures: Vec::new(),
            };

            let mut stmt = c.prepare("SELECT state, count(*) FROM jobs GROUP BY state")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?;
            for row in rows {
                let (state, n) = row?;
                match JobState::parse(&state) {
                    Some(JobState::Waiting) => stats.waiting = n,
                    Some(JobState::Active) => stats.active = n,
                    Some(JobState::Completed) => stats.completed = n,
                    Some(JobState::Failed) => stats.failed = n,
                    Some(JobState::Delayed) => stats.delayed = n,
                    None => {}
                }
            }

            let mut stmt = c.prepare(
                "SELECT id, kind, payload, last_error, attempts FROM jobs
                 WHERE state = 'failed' ORDER BY finished_at DESC LIMIT 5",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok(FailedJobInfo {
                    id: r.get(0)?,
                    kind: r.get(1)?,
                    payload: r.get(2)?,
                    last_error: r.get(3)?,
                    attempts: r.get(4)?,
                })
            })?;
            stats.recent_failures = rows.collect::<rusqlite::Result<_>>()?;

            Ok(stats)
        })
    }

    /// Operator clean-up: drop failed jobs older than `days` (0 = all).
    pub fn clear_failed(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - (days as i64) * 86_400_000;
        self.db.with(|c| {
            c.execute(
                "DELETE FROM jobs WHERE state = 'failed' AND coalesce(finished_at, 0) <= ?1",
                params![cutoff],
            )
        })
    }

    /// Graceful close: return all active jobs to waiting so the next
    /// process drains them.
    pub fn close(&self) -> Result<usize> {
        self.recover_orphans()
    }

    #[cfg(test)]
    fn force_eligible(&self, id: i64) {
        self.db
            .with(|c| {
                c.execute("UPDATE jobs SET not_before = 0 WHERE id = ?1", params![id])
            })
            .unwrap();
    }
}

fn map_job(r: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let payload_json: String = r.get(1)?;
    let payload: JobPayload = serde_json::from_str(&payload_json)
        .map_err(|_| rusqlite::Error::InvalidQuery)?;
    let state: String = r.get(3)?;
    Ok(Job {
        id: r.get(0)?,
        payload,
        priority: r.get(2)?,
        state: JobState::parse(&state).unwrap_or(JobState::Waiting),
        attempts: r.get(4)?,
        max_attempts: r.get(5)?,
        last_error: r.get(6)?,
        not_before: r.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> JobQueue {
        JobQueue::new(Database::open_in_memory().unwrap())
    }

    fn daily(location_id: i64, day: u32) -> JobPayload {
        JobPayload::Daily {
            location_id,
            date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
        }
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let q = queue();
        q.enqueue(&daily(1, 1), Priority::Low, Duration::ZERO).unwrap();
        q.enqueue(&daily(1, 2), Priority::High, Duration::ZERO).unwrap();
        q.enqueue(&daily(1, 3), Priority::High, Duration::ZERO).unwrap();
        q.enqueue(&daily(1, 4), Priority::Normal, Duration::ZERO).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| q.lease().unwrap())
            .map(|j| j.payload.dedup_key())
            .collect();
        assert_eq!(
            order,
            vec![
                "daily-1-2025-03-02", // high, enqueued first
                "daily-1-2025-03-03", // high, enqueued second
                "daily-1-2025-03-04", // normal
                "daily-1-2025-03-01", // low
            ]
        );
    }

    #[test]
    fn test_delayed_job_not_eligible_until_due() {
        let q = queue();
        let id = q
            .enqueue(&daily(1, 1), Priority::Normal, Duration::from_secs(3600))
            .unwrap()
            .unwrap();
        assert!(q.lease().unwrap().is_none(), "delayed job leased early");

        q.force_eligible(id);
        let job = q.lease().unwrap().expect("due job must lease");
        assert_eq!(job.id, id);
    }

    #[test]
    fn test_dedup_collapses_waiting_duplicates() {
        let q = queue();
        let first = q.enqueue(&daily(7, 1), Priority::Normal, Duration::ZERO).unwrap();
        let second = q.enqueue(&daily(7, 1), Priority::Normal, Duration::ZERO).unwrap();
        assert!(first.is_some());
        assert!(second.is_none(), "identical waiting job must collapse");

        // Once active, the same logical job may be enqueued again.
        let job = q.lease().unwrap().unwrap();
        assert!(q.enqueue(&daily(7, 1), Priority::Normal, Duration::ZERO).unwrap().is_some());
        q.complete(job.id).unwrap();
    }

    #[test]
    fn test_dedup_escalates_priority_and_eligibility() {
        let q = queue();
        // Parked low-priority copy, not due for an hour.
        q.enqueue(&daily(1, 1), Priority::Low, Duration::from_secs(3600)).unwrap();
        assert!(q.lease().unwrap().is_none());

        // Re-enqueue at high priority with no delay: collapses onto the
        // pending copy and makes it urgent.
        let id = q.enqueue(&daily(1, 1), Priority::High, Duration::ZERO).unwrap();
        assert!(id.is_none(), "dedup must not create a second row");

        let job = q.lease().unwrap().expect("escalated job drains immediately");
        assert_eq!(job.priority, PRIORITY_HIGH);
    }

    #[test]
    fn test_retry_backoff_then_permanent_failure() {
        let q = queue().with_backoff(BackoffPolicy { base_ms: 10_000, cap_ms: 60_000 });
        let id = q.enqueue(&daily(1, 1), Priority::Normal, Duration::ZERO).unwrap().unwrap();

        let job = q.lease().unwrap().unwrap();
        assert_eq!(q.fail(job.id, "storage timeout", true).unwrap(), JobState::Delayed);
        assert!(q.lease().unwrap().is_none(), "backoff must delay the retry");

        q.force_eligible(id);
        let job = q.lease().unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(q.fail(job.id, "storage timeout", true).unwrap(), JobState::Delayed);

        q.force_eligible(id);
        let job = q.lease().unwrap().unwrap();
        // Third failure exhausts max_attempts = 3.
        assert_eq!(q.fail(job.id, "storage timeout", true).unwrap(), JobState::Failed);

        let stats = q.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.recent_failures.len(), 1);
        assert_eq!(stats.recent_failures[0].attempts, 3);
        assert_eq!(stats.recent_failures[0].last_error.as_deref(), Some("storage timeout"));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let q = queue();
        q.enqueue(&daily(1, 1), Priority::Normal, Duration::ZERO).unwrap();
        let job = q.lease().unwrap().unwrap();
        assert_eq!(q.fail(job.id, "cancelled", false).unwrap(), JobState::Failed);
    }

    #[test]
    fn test_backoff_schedule() {
        let b = BackoffPolicy::default();
        assert_eq!(b.delay_for_attempt(1), Duration::from_millis(5_000));
        assert_eq!(b.delay_for_attempt(2), Duration::from_millis(10_000));
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(20_000));
        // Ceiling at five minutes.
        assert_eq!(b.delay_for_attempt(10), Duration::from_millis(300_000));
    }

    #[test]
    fn test_recover_orphans() {
        let q = queue();
        q.enqueue(&daily(1, 1), Priority::Normal, Duration::ZERO).unwrap();
        let job = q.lease().unwrap().unwrap();
        assert_eq!(q.stats().unwrap().active, 1);

        // Simulated crash: nobody completes the job.
        assert_eq!(q.recover_orphans().unwrap(), 1);
        let again = q.lease().unwrap().expect("orphan must drain again");
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 0, "recovery must not burn an attempt");
    }

    #[test]
    fn test_cancel_pending_for_location() {
        let q = queue();
        q.enqueue(&daily(5, 1), Priority::Normal, Duration::ZERO).unwrap();
        q.enqueue(&daily(5, 2), Priority::Normal, Duration::from_secs(60)).unwrap();
        q.enqueue(&daily(6, 1), Priority::Normal, Duration::ZERO).unwrap();

        assert_eq!(q.cancel_pending_for_location(5).unwrap(), 2);
        let job = q.lease().unwrap().expect("other location's job survives");
        assert_eq!(job.payload.location_id(), 6);
    }

    #[test]
    fn test_clear_failed() {
        let q = queue();
        q.enqueue(&daily(1, 1), Priority::Normal, Duration::ZERO).unwrap();
        let job = q.lease().unwrap().unwrap();
        q.fail(job.id, "boom", false).unwrap();
        assert_eq!(q.stats().unwrap().failed, 1);

        assert_eq!(q.clear_failed(0).unwrap(), 1);
        assert_eq!(q.stats().unwrap().failed, 0);
    }

    #[test]
    fn test_payload_roundtrip_and_keys() {
        let payloads = [
            JobPayload::LocationRange { location_id: 3, year_from: 2025, year_to: 2027 },
            JobPayload::MonthlyRange { location_id: 3, year: 2025, month: 9 },
            daily(3, 14),
        ];
        for p in &payloads {
            let json = serde_json::to_string(p).unwrap();
            let back: JobPayload = serde_json::from_str(&json).unwrap();
            assert_eq!(*p, back);
            assert!(json.contains(p.kind()), "tag missing from {json}");
        }
        assert_eq!(payloads[0].dedup_key(), "range-3-2025-2027");
        assert_eq!(payloads[1].dedup_key(), "monthly-2025-9-3");
    }
}
