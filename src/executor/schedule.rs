//! Cron driven trigger loop of one job.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ElasticError, Result};
use crate::executor::JobRunner;

/// Parse a Quartz style cron expression (seconds first, `?` allowed in the
/// day fields).
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = expression.trim().replace('?', "*");
    Schedule::from_str(&normalized).map_err(|e| ElasticError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub struct JobScheduleController {
    job_name: String,
    schedule: Mutex<Schedule>,
    cron: Mutex<String>,
    misfire: AtomicBool,
    paused: AtomicBool,
    trigger: Notify,
    rescheduled: Notify,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduleController {
    /// The loop stops when `parent` is cancelled or on `shutdown`.
    pub fn new(job_name: &str, cron: &str, misfire: bool, parent: &CancellationToken) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            job_name: job_name.to_string(),
            schedule: Mutex::new(parse_cron(cron)?),
            cron: Mutex::new(cron.to_string()),
            misfire: AtomicBool::new(misfire),
            paused: AtomicBool::new(false),
            trigger: Notify::new(),
            rescheduled: Notify::new(),
            token: parent.child_token(),
            handle: Mutex::new(None),
        }))
    }

    pub fn start(self: &Arc<Self>, runner: Arc<JobRunner>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let controller = self.clone();
        *handle = Some(tokio::spawn(async move {
            controller.run_loop(runner).await;
        }));
        tracing::info!(job = %self.job_name, cron = %self.cron(), "Job scheduled");
    }

    async fn run_loop(self: Arc<Self>, runner: Arc<JobRunner>) {
        loop {
            let next = self.next_fire_time(Utc::now());
            let delay = next
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::MAX);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = self.rescheduled.notified() => continue,
                _ = self.trigger.notified() => {
                    if !self.is_paused() {
                        tracing::debug!(job = %self.job_name, "Job triggered");
                        self.fire(&runner, None).await;
                    }
                }
                _ = tokio::time::sleep(delay), if next.is_some() => {
                    if !self.is_paused() {
                        self.fire(&runner, next).await;
                    }
                }
            }
        }
        tracing::debug!(job = %self.job_name, "Schedule loop stopped");
    }

    /// Run once. If misfire is on and the following fire time already
    /// passed while running, run once more to catch up.
    async fn fire(&self, runner: &JobRunner, fired_at: Option<DateTime<Utc>>) {
        let started = fired_at.unwrap_or_else(Utc::now);
        if let Err(e) = runner.execute().await {
            tracing::error!(job = %self.job_name, error = %e, "Job run failed");
        }
        if self.token.is_cancelled() || self.is_paused() || !self.misfire.load(Ordering::SeqCst) {
            return;
        }
        let missed = self
            .next_fire_time(started)
            .map(|next| next < Utc::now())
            .unwrap_or(false);
        if missed {
            tracing::info!(job = %self.job_name, "Fire time missed during run, firing again");
            if let Err(e) = runner.execute().await {
                tracing::error!(job = %self.job_name, error = %e, "Job run failed");
            }
        }
    }

    fn next_fire_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.lock().after(&after).next()
    }

    pub fn cron(&self) -> String {
        self.cron.lock().clone()
    }

    pub fn reschedule(&self, cron: &str) -> Result<()> {
        let schedule = parse_cron(cron)?;
        *self.schedule.lock() = schedule;
        *self.cron.lock() = cron.to_string();
        self.rescheduled.notify_one();
        tracing::info!(job = %self.job_name, cron = %cron, "Job rescheduled");
        Ok(())
    }

    pub fn set_misfire(&self, misfire: bool) {
        self.misfire.store(misfire, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            tracing::info!(job = %self.job_name, "Job paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            tracing::info!(job = %self.job_name, "Job resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request an immediate run. A request made while a run is in progress
    /// is kept and served afterwards.
    pub fn trigger_job(&self) {
        self.trigger.notify_one();
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}
