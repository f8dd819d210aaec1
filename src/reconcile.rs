//! Periodic self-healing.
//!
//! Watches can miss events. Every tick the reconcile loop checks whether the
//! assignment still names instances that are gone and, if nobody asked for
//! resharding yet, asks for it. The check itself runs at most once per
//! `reconcileIntervalMinutes`; zero disables it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::failover::FailoverService;
use crate::sharding::ShardingService;
use crate::storage::ConfigurationService;

struct ReconcileState {
    last_reconcile: Instant,
    task: Option<(JoinHandle<()>, CancellationToken)>,
}

#[derive(Clone)]
pub struct ReconcileService {
    config: ConfigurationService,
    sharding: ShardingService,
    failover: FailoverService,
    tick: Duration,
    state: Arc<Mutex<ReconcileState>>,
}

impl ReconcileService {
    pub fn new(
        config: ConfigurationService,
        sharding: ShardingService,
        failover: FailoverService,
        tick: Duration,
    ) -> Self {
        Self {
            config,
            sharding,
            failover,
            tick,
            state: Arc::new(Mutex::new(ReconcileState {
                last_reconcile: Instant::now(),
                task: None,
            })),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .task
            .as_ref()
            .map(|(handle, _)| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the loop as a child of `parent`. No-op if already running.
    pub fn start(&self, parent: &CancellationToken) {
        let mut state = self.state.lock();
        if state
            .task
            .as_ref()
            .map(|(handle, _)| !handle.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        let token = parent.child_token();
        let service = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = service.run_one_iteration().await {
                            tracing::warn!(error = %e, "Reconcile iteration failed");
                        }
                    }
                }
            }
            tracing::debug!("Reconcile loop stopped");
        });
        state.task = Some((handle, token));
    }

    pub fn stop(&self) {
        if let Some((_, token)) = self.state.lock().task.take() {
            token.cancel();
        }
    }

    /// One throttled iteration: reconciles when the configured interval has
    /// elapsed since the last one. Returns whether a check ran.
    pub async fn run_one_iteration(&self) -> Result<bool> {
        let config = self.config.load().await?;
        if config.reconcile_interval_minutes == 0 {
            return Ok(false);
        }
        let interval = Duration::from_secs(u64::from(config.reconcile_interval_minutes) * 60);
        {
            let mut state = self.state.lock();
            if state.last_reconcile.elapsed() < interval {
                return Ok(false);
            }
            state.last_reconcile = Instant::now();
        }
        self.reconcile_if_necessary().await?;
        if config.is_failover_enabled() {
            self.failover.failover_if_necessary().await?;
        }
        Ok(true)
    }

    /// Raise the resharding flag if the assignment names offline instances
    /// and no resharding is pending. Static assignments are left alone.
    /// Returns whether the flag was raised.
    pub async fn reconcile_if_necessary(&self) -> Result<bool> {
        let config = self.config.load().await?;
        if self.sharding.is_need_sharding().await? {
            return Ok(false);
        }
        if !self.sharding.has_sharding_info_in_offline_servers().await? {
            return Ok(false);
        }
        if config.static_sharding && self.sharding.has_sharding_info().await? {
            return Ok(false);
        }
        tracing::warn!(job = %config.job_name, "Elastic job: sharding info in offline servers, resharding");
        self.sharding.set_resharding_flag().await?;
        Ok(true)
    }
}
