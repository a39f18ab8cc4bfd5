//! Cron scheduler — converts schedule specifications into inbound
//! envelopes.
//!
//! The scheduler is a pure message producer: it knows nothing about the
//! agent loop. Runtime source of truth is its in-memory job map; the
//! config file is the durable home (written by admin tooling).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use nibot_core::bus::MessageBus;
use nibot_core::config::ScheduledJob;
use nibot_core::types::Envelope;

/// How often the scheduler wakes to look for due jobs.
const TICK: Duration = Duration::from_secs(60);

/// Parse a cron expression, accepting standard five-field syntax.
///
/// The `cron` crate wants a seconds field; five-field expressions get
/// `0` prepended so `"0 9 * * *"` means 09:00:00 daily, as everywhere
/// else.
pub fn parse_cron(expr: &str) -> anyhow::Result<cron::Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid cron expression '{expr}': {e}"))
}

/// Validation for startup: every problem with every job, reported at once
/// alongside the core config checks.
pub fn schedule_errors(jobs: &[ScheduledJob]) -> Vec<String> {
    jobs.iter()
        .filter(|job| !job.cron.is_empty())
        .filter_map(|job| parse_cron(&job.cron).err().map(|e| format!("schedule '{}': {e}", job.id)))
        .collect()
}

// ─────────────────────────────────────────────
// SchedulerManager
// ─────────────────────────────────────────────

pub struct SchedulerManager {
    bus: Arc<MessageBus>,
    jobs: StdMutex<HashMap<String, ScheduledJob>>,
    last_check: StdMutex<DateTime<Utc>>,
    running: AtomicBool,
    shutdown: Notify,
}

impl SchedulerManager {
    pub fn new(bus: Arc<MessageBus>, jobs: Vec<ScheduledJob>) -> Self {
        let map = jobs
            .into_iter()
            .filter(|j| !j.id.is_empty())
            .map(|j| (j.id.clone(), j))
            .collect();
        SchedulerManager {
            bus,
            jobs: StdMutex::new(map),
            last_check: StdMutex::new(Utc::now()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Wake every 60 s and fire every enabled job whose next occurrence
    /// after the previous check has arrived.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(jobs = self.job_count(), "scheduler started");
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => {
                    self.run_due_jobs(Utc::now()).await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
        info!("scheduler exiting");
    }

    /// One scheduling pass at `now`. A job whose cron fails to parse at
    /// fire time is logged and skipped; other jobs continue.
    pub async fn run_due_jobs(&self, now: DateTime<Utc>) {
        let last = *self.last_check.lock().unwrap();
        let jobs: Vec<ScheduledJob> = self.jobs.lock().unwrap().values().cloned().collect();

        for job in jobs {
            if !job.enabled {
                continue;
            }
            match parse_cron(&job.cron) {
                Ok(schedule) => {
                    let due = schedule.after(&last).next().is_some_and(|next| next <= now);
                    if due {
                        self.fire(&job).await;
                    }
                }
                Err(e) => error!(job = %job.id, error = %e, "scheduler job error"),
            }
        }
        *self.last_check.lock().unwrap() = now;
    }

    async fn fire(&self, job: &ScheduledJob) {
        info!(job = %job.id, "scheduler firing job");
        let envelope = Envelope::new(&job.channel, &job.chat_id, "scheduler", &job.prompt)
            .with_meta("scheduled", true)
            .with_meta("job_id", job.id.clone());
        if let Err(e) = self.bus.publish_inbound(envelope).await {
            error!(job = %job.id, error = %e, "failed to publish scheduled message");
        }
    }

    // ── Live-edit surface ──

    pub fn add(&self, job: ScheduledJob) {
        debug!(job = %job.id, cron = %job.cron, "scheduler job added");
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    pub fn remove(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().remove(job_id).is_some()
    }

    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
