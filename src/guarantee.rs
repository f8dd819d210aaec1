//! All-instances barrier.
//!
//! Every instance registers the items it is about to run (or just ran)
//! under `guarantee/started` (`guarantee/completed`). The one instance that,
//! under the barrier latch, finds all `shardingTotalCount` items registered
//! runs the distribute-once callback and then deletes the root. The removal
//! of the root is observed by the guarantee listener of every instance and
//! releases the waiters exactly once per round.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::sharding::ShardingContexts;
use crate::storage::{path, ConfigurationService, JobNodeStorage};

/// Callbacks that run once per job run across the whole fleet.
#[async_trait]
pub trait DistributeOnceJobListener: Send + Sync {
    /// Runs on one instance after every item has started.
    async fn before_once(&self, contexts: &ShardingContexts);

    /// Runs on one instance after every item has completed.
    async fn after_once(&self, contexts: &ShardingContexts);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    Started,
    Completed,
}

impl BarrierPhase {
    fn root(&self) -> &'static str {
        match self {
            BarrierPhase::Started => path::GUARANTEE_STARTED_ROOT,
            BarrierPhase::Completed => path::GUARANTEE_COMPLETED_ROOT,
        }
    }

    fn latch(&self) -> &'static str {
        match self {
            BarrierPhase::Started => path::GUARANTEE_STARTED_LATCH,
            BarrierPhase::Completed => path::GUARANTEE_COMPLETED_LATCH,
        }
    }

    fn item_node(&self, item: u32) -> String {
        match self {
            BarrierPhase::Started => path::guarantee_started_node(item),
            BarrierPhase::Completed => path::guarantee_completed_node(item),
        }
    }
}

#[derive(Clone)]
pub struct GuaranteeService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    config: ConfigurationService,
    started_release: Arc<watch::Sender<u64>>,
    completed_release: Arc<watch::Sender<u64>>,
}

impl GuaranteeService {
    pub fn new(storage: JobNodeStorage, job_registry: Arc<JobRegistry>, config: ConfigurationService) -> Self {
        Self {
            storage,
            job_registry,
            config,
            started_release: Arc::new(watch::channel(0).0),
            completed_release: Arc::new(watch::channel(0).0),
        }
    }

    pub async fn register_start(&self, items: &[u32]) -> Result<()> {
        self.register(BarrierPhase::Started, items).await
    }

    pub async fn register_complete(&self, items: &[u32]) -> Result<()> {
        self.register(BarrierPhase::Completed, items).await
    }

    pub async fn is_registered_start_success(&self, items: &[u32]) -> Result<bool> {
        self.is_registered(BarrierPhase::Started, items).await
    }

    pub async fn is_registered_complete_success(&self, items: &[u32]) -> Result<bool> {
        self.is_registered(BarrierPhase::Completed, items).await
    }

    pub async fn is_all_started(&self) -> Result<bool> {
        self.is_all(BarrierPhase::Started).await
    }

    pub async fn is_all_completed(&self) -> Result<bool> {
        self.is_all(BarrierPhase::Completed).await
    }

    pub async fn clear_all_started_info(&self) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(BarrierPhase::Started.root())
            .await
    }

    pub async fn clear_all_completed_info(&self) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(BarrierPhase::Completed.root())
            .await
    }

    /// Called by the guarantee listener when a barrier root disappears.
    pub fn notify_released(&self, phase: BarrierPhase) {
        let sender = match phase {
            BarrierPhase::Started => &self.started_release,
            BarrierPhase::Completed => &self.completed_release,
        };
        sender.send_modify(|round| *round += 1);
        tracing::debug!(job = %self.storage.job_name(), ?phase, "Barrier released");
    }

    pub fn subscribe(&self, phase: BarrierPhase) -> watch::Receiver<u64> {
        match phase {
            BarrierPhase::Started => self.started_release.subscribe(),
            BarrierPhase::Completed => self.completed_release.subscribe(),
        }
    }

    /// Whether `path` is the root of a barrier of this job.
    pub fn barrier_of(&self, path: &str) -> Option<BarrierPhase> {
        [BarrierPhase::Started, BarrierPhase::Completed]
            .into_iter()
            .find(|phase| self.storage.path().full_path(phase.root()) == path)
    }

    /// Register `contexts` as started and wait until every item of the job
    /// has; the last one in runs `before_once`. Returns whether this
    /// instance ran the callback.
    pub async fn before_job_executed(
        &self,
        contexts: &ShardingContexts,
        listener: &dyn DistributeOnceJobListener,
    ) -> Result<bool> {
        self.pass_barrier(BarrierPhase::Started, contexts, listener).await
    }

    /// Register `contexts` as completed and wait until every item of the
    /// job has; the last one in runs `after_once`.
    pub async fn after_job_executed(
        &self,
        contexts: &ShardingContexts,
        listener: &dyn DistributeOnceJobListener,
    ) -> Result<bool> {
        self.pass_barrier(BarrierPhase::Completed, contexts, listener).await
    }

    async fn pass_barrier(
        &self,
        phase: BarrierPhase,
        contexts: &ShardingContexts,
        listener: &dyn DistributeOnceJobListener,
    ) -> Result<bool> {
        let items = contexts.items();
        if items.is_empty() {
            return Ok(false);
        }
        // Subscribe before registering so the release cannot be missed.
        let mut released = self.subscribe(phase);
        self.register(phase, &items).await?;

        let ran = self
            .storage
            .execute_in_leader(phase.latch(), || async {
                if !self.is_all(phase).await? {
                    return Ok(false);
                }
                match phase {
                    BarrierPhase::Started => listener.before_once(contexts).await,
                    BarrierPhase::Completed => listener.after_once(contexts).await,
                }
                self.storage.remove_job_node_if_existed(phase.root()).await?;
                Ok(true)
            })
            .await?;
        if ran {
            tracing::info!(job = %self.storage.job_name(), ?phase, "Distribute-once callback executed");
            return Ok(true);
        }

        // A release may belong to an earlier round whose removal event was
        // still queued; only the removal of our own registration counts.
        let Some(token) = self.job_registry.cancellation_token(self.storage.job_name()) else {
            return Ok(false);
        };
        loop {
            tokio::select! {
                changed = released.changed() => {
                    if changed.is_err() {
                        return Ok(false);
                    }
                }
                _ = token.cancelled() => {
                    tracing::debug!(job = %self.storage.job_name(), ?phase, "Job shut down while waiting on barrier");
                    return Ok(false);
                }
            }
            if !self.is_any_registered(phase, &items).await? {
                return Ok(false);
            }
        }
    }

    async fn register(&self, phase: BarrierPhase, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .fill_ephemeral_job_node(&phase.item_node(item), "")
                .await?;
        }
        Ok(())
    }

    async fn is_registered(&self, phase: BarrierPhase, items: &[u32]) -> Result<bool> {
        for &item in items {
            if !self.storage.is_job_node_existed(&phase.item_node(item)).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_any_registered(&self, phase: BarrierPhase, items: &[u32]) -> Result<bool> {
        for &item in items {
            if self.storage.is_job_node_existed(&phase.item_node(item)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn is_all(&self, phase: BarrierPhase) -> Result<bool> {
        let total = self.config.load().await?.sharding_total_count as usize;
        Ok(self.storage.is_job_node_existed(phase.root()).await?
            && self.storage.get_job_node_num_children(phase.root()).await? == total)
    }
}
