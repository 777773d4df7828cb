//! Worker pool: drains the job queue, runs the alignment finder, and
//! writes day sets to the event store.
//!
//! Workers are plain tokio tasks coordinated only through the queue —
//! no shared in-process scheduling state. The supervisor watches the
//! `worker_concurrency` channel and rebuilds the loop at the new
//! parallelism: the running generation is asked to stop, in-flight jobs
//! finish or return to waiting, and a fresh generation spawns.

use crate::error::{CoreError, Result};
use crate::finder::{find_day_events, CancelFlag, FinderConfig};
use crate::queue::{Job, JobPayload, JobQueue};
use crate::settings::RuntimeSettings;
use crate::store::events::EventRepo;
use crate::store::locations::LocationRepo;
use crate::store::Database;
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

const IDLE_POLL: Duration = Duration::from_millis(250);
const HEARTBEAT_EVERY: Duration = Duration::from_secs(5 * 60);

/// Everything a worker needs; cheap to clone into each task.
#[derive(Clone)]
pub struct WorkerEnv {
    pub queue: JobQueue,
    pub locations: LocationRepo,
    pub events: EventRepo,
    pub settings: Arc<RuntimeSettings>,
}

impl WorkerEnv {
    pub fn new(db: Database, settings: Arc<RuntimeSettings>) -> Self {
        Self {
            queue: JobQueue::new(db.clone()),
            locations: LocationRepo::new(db.clone()),
            events: EventRepo::new(db),
            settings,
        }
    }
}

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl WorkerPool {
    /// Recover orphans from a previous process, then start the
    /// supervisor and heartbeat.
    pub fn start(env: WorkerEnv) -> Result<Self> {
        let recovered = env.queue.recover_orphans()?;
        if recovered > 0 {
            tracing::info!(recovered, "returned orphaned active jobs to waiting");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(env, shutdown_rx));
        Ok(Self { shutdown_tx, supervisor })
    }

    /// Graceful close: stop leasing, let in-flight jobs wind down or
    /// return to waiting, release the queue.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        if timeout(grace, self.supervisor).await.is_err() {
            tracing::warn!("worker supervisor did not stop within the grace period");
        }
    }
}

async fn supervise(env: WorkerEnv, mut shutdown_rx: watch::Receiver<bool>) {
    let mut concurrency_rx = env.settings.subscribe_concurrency();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_EVERY);
    heartbeat.tick().await; // immediate first tick

    loop {
        let parallelism = *concurrency_rx.borrow();
        tracing::info!(parallelism, "worker generation starting");

        let (stop_tx, _) = watch::channel(false);
        let mut generation = JoinSet::new();
        for index in 0..parallelism {
            generation.spawn(worker_loop(env.clone(), index, stop_tx.subscribe()));
        }

        // Run this generation until the concurrency changes or shutdown.
        let shutting_down = loop {
            tokio::select! {
                changed = concurrency_rx.changed() => {
                    match changed {
                        Ok(()) => break false,
                        // Settings dropped; hold steady until shutdown.
                        Err(_) => { shutdown_rx.changed().await.ok(); break true }
                    }
                }
                _ = shutdown_rx.changed() => break true,
                _ = heartbeat.tick() => log_heartbeat(&env.queue),
            }
        };

        let _ = stop_tx.send(true);
        while generation.join_next().await.is_some() {}

        if shutting_down {
            match env.queue.close() {
                Ok(returned) if returned > 0 => {
                    tracing::info!(returned, "returned in-flight jobs to waiting on shutdown")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "queue close failed"),
            }
            return;
        }
    }
}

/// One worker: lease → process → ack/fail, until told to stop.
async fn worker_loop(env: WorkerEnv, index: u32, mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        match env.queue.lease() {
            Ok(Some(job)) => {
                tracing::debug!(worker = index, job_id = job.id, kind = job.payload.kind(), "processing");
                process_job(&env, &job, &mut stop_rx).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = sleep(IDLE_POLL) => {}
                    _ = stop_rx.changed() => return,
                }
            }
            Err(e) => {
                tracing::error!(worker = index, error = %e, "lease failed");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn process_job(env: &WorkerEnv, job: &Job, stop_rx: &mut watch::Receiver<bool>) {
    let cancel = CancelFlag::default();
    let deadline = job.payload.deadline();

    let outcome = tokio::select! {
        run = timeout(deadline, handle_job(env, job, &cancel)) => match run {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(CoreError::JobTimeout(deadline))
            }
        },
        _ = stop_rx.changed() => {
            cancel.cancel();
            Err(CoreError::Cancelled)
        }
    };

    let ack = match outcome {
        Ok(()) => env.queue.complete(job.id),
        // Shutdown/resize: hand the job back untouched.
        Err(CoreError::Cancelled) => env.queue.return_to_waiting(job.id),
        // The target location vanished mid-flight; completing as a
        // no-op is the contract.
        Err(CoreError::NotFound(what)) => {
            tracing::info!(job_id = job.id, target = %what, "target vanished; completing as no-op");
            env.queue.complete(job.id)
        }
        // Recoverable inconsistency: re-derive, then let the retry
        // recompute against fresh geometry.
        Err(CoreError::StaleDerivedGeometry(location_id)) => {
            let eye = env.settings.snapshot().observer_eye_height_m;
            if let Err(e) = env.locations.reconcile(location_id, eye) {
                tracing::error!(location_id, error = %e, "geometry reconciliation failed");
            }
            env.queue
                .fail(job.id, "stale derived geometry; reconciled and retrying", true)
                .map(|_| ())
        }
        Err(e) => {
            tracing::warn!(job_id = job.id, kind = job.payload.kind(), error = %e, "job failed");
            env.queue.fail(job.id, &e.to_string(), e.is_retryable()).map(|_| ())
        }
    };

    if let Err(e) = ack {
        tracing::error!(job_id = job.id, error = %e, "job acknowledgement failed");
    }
}

async fn handle_job(env: &WorkerEnv, job: &Job, cancel: &CancelFlag) -> Result<()> {
    // One snapshot per job: no mid-job tearing when settings change.
    let snapshot = env.settings.snapshot();

    match &job.payload {
        JobPayload::LocationRange { location_id, year_from, year_to } => {
            for (i, year) in (*year_from..=*year_to).enumerate() {
                if i > 0 {
                    // Pace sustained CPU between years.
                    sleep(Duration::from_millis(snapshot.processing_delay_ms)).await;
                }
                let from = NaiveDate::from_ymd_opt(year, 1, 1)
                    .ok_or_else(|| CoreError::InvalidInput(format!("year {year}")))?;
                let to = NaiveDate::from_ymd_opt(year, 12, 31).expect("valid year end");
                generate_days(env, *location_id, from, to, &snapshot, cancel, job.id).await?;
            }
            Ok(())
        }
        JobPayload::MonthlyRange { location_id, year, month } => {
            let from = NaiveDate::from_ymd_opt(*year, *month, 1)
                .ok_or_else(|| CoreError::InvalidInput(format!("month {year}-{month}")))?;
            let to = end_of_month(*year, *month);
            generate_days(env, *location_id, from, to, &snapshot, cancel, job.id).await
        }
        JobPayload::Daily { location_id, date } => {
            generate_days(env, *location_id, *date, *date, &snapshot, cancel, job.id).await
        }
    }
}

/// Compute and persist every day in `from..=to` for one location. Each
/// day commits in its own transaction, so readers see either the prior
/// complete day set or the new one, and a re-run converges.
async fn generate_days(
    env: &WorkerEnv,
    location_id: i64,
    from: NaiveDate,
    to: NaiveDate,
    snapshot: &crate::settings::Snapshot,
    cancel: &CancelFlag,
    job_id: i64,
) -> Result<()> {
    let location = Arc::new(env.locations.get(location_id)?);
    let cfg = Arc::new(FinderConfig::from(snapshot));

    let total = (to - from).num_days() + 1;
    let progress_step = (total / 100).max(1);
    let mut done: i64 = 0;

    let mut date = from;
    while date <= to {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        // The finder is CPU-bound; keep it off the async workers.
        let drafts = {
            let location = Arc::clone(&location);
            let cfg = Arc::clone(&cfg);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || find_day_events(&location, date, &cfg, &cancel))
                .await
                .map_err(|e| CoreError::InvalidInput(format!("finder task panicked: {e}")))??
        };

        env.events.replace_day(location_id, date, &drafts, date.year())?;

        done += 1;
        if done % progress_step == 0 || done == total {
            tracing::debug!(
                job_id,
                location_id,
                progress = format!("{:.0}%", done as f64 * 100.0 / total as f64),
                "range progress"
            );
        }
        date = date.succ_opt().expect("date within range");
    }
    Ok(())
}

fn end_of_month(year: i32, month: u32) -> NaiveDate {
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .expect("valid month")
        .pred_opt()
        .expect("valid date")
}

/// Five-minute diagnostic record of queue health.
fn log_heartbeat(queue: &JobQueue) {
    match queue.stats() {
        Ok(stats) => tracing::info!(
            waiting = stats.waiting,
            active = stats.active,
            completed = stats.completed,
            failed = stats.failed,
            delayed = stats.delayed,
            "queue heartbeat"
        ),
        Err(e) => tracing::warn!(error = %e, "heartbeat stats failed"),
    }
}
