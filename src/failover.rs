//! Failover of items owned by crashed instances.
//!
//! Crashed items are queued under `failover/{item}`. The leader drains the
//! queue under the failover latch, writing a claim `sharding/{item}/failover`
//! naming the instance that takes the item over. Claims are exclusive: the
//! queue entry is removed in the same critical section that writes the
//! claim, and an item with a claim is never queued again until the claim is
//! completed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::election::LeaderService;
use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::sharding::{ExecutionService, ShardingService};
use crate::storage::{path, ConfigurationService, JobNodeStorage};
use crate::topology::{InstanceService, JobInstance};

#[derive(Clone)]
pub struct FailoverService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    config: ConfigurationService,
    leader: LeaderService,
    instances: InstanceService,
    sharding: ShardingService,
    execution: ExecutionService,
}

impl FailoverService {
    pub fn new(
        storage: JobNodeStorage,
        job_registry: Arc<JobRegistry>,
        config: ConfigurationService,
        leader: LeaderService,
        instances: InstanceService,
        sharding: ShardingService,
        execution: ExecutionService,
    ) -> Self {
        Self {
            storage,
            job_registry,
            config,
            leader,
            instances,
            sharding,
            execution,
        }
    }

    /// Queue `item` for failover unless it is already claimed. Runs under
    /// the failover latch so it cannot interleave with a claim.
    pub async fn set_crashed_failover_flag(&self, item: u32) -> Result<()> {
        self.storage
            .execute_in_leader(path::FAILOVER_LATCH, || async {
                if !self.is_failover_assigned(item).await? {
                    self.storage
                        .create_job_node_if_needed(&path::failover_queue_node(item))
                        .await?;
                    tracing::info!(job = %self.storage.job_name(), item, "Item queued for failover");
                }
                Ok(())
            })
            .await
    }

    /// Re-queue an item whose failover owner crashed too.
    pub async fn set_crashed_failover_flag_directly(&self, item: u32) -> Result<()> {
        self.storage
            .execute_in_leader(path::FAILOVER_LATCH, || async {
                self.storage
                    .remove_job_node_if_existed(&path::failover_claim_node(item))
                    .await?;
                self.storage
                    .create_job_node_if_needed(&path::failover_queue_node(item))
                    .await?;
                tracing::info!(job = %self.storage.job_name(), item, "Failover item re-queued");
                Ok(())
            })
            .await
    }

    pub async fn is_failover_assigned(&self, item: u32) -> Result<bool> {
        self.storage
            .is_job_node_existed(&path::failover_claim_node(item))
            .await
    }

    pub async fn queued_items(&self) -> Result<Vec<u32>> {
        let mut items: Vec<u32> = self
            .storage
            .get_job_node_children_keys(path::FAILOVER)
            .await?
            .iter()
            .filter_map(|child| child.parse().ok())
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    /// On the leader, hand every queued item to the least loaded available
    /// instance. Returns the claims made.
    pub async fn failover_if_necessary(&self) -> Result<Vec<(u32, String)>> {
        if self.job_registry.is_shutdown(self.storage.job_name())
            || !self.config.load().await?.is_failover_enabled()
            || !self.leader.is_leader().await?
            || self.queued_items().await?.is_empty()
        {
            return Ok(Vec::new());
        }
        self.storage
            .execute_in_leader(path::FAILOVER_LATCH, || async { self.assign_queued_items().await })
            .await
    }

    async fn assign_queued_items(&self) -> Result<Vec<(u32, String)>> {
        let mut claims = Vec::new();
        let queued = self.queued_items().await?;
        if queued.is_empty() {
            return Ok(claims);
        }
        let candidates = self.instances.get_available_job_instances().await?;
        if candidates.is_empty() {
            tracing::warn!(job = %self.storage.job_name(), "No available instance to fail over to");
            return Ok(claims);
        }
        let mut load = self.instance_load(&candidates).await?;

        for item in queued {
            if !self.is_failover_assigned(item).await? {
                // Candidates are sorted by id, so ties go to the smallest id.
                let Some(target) = candidates
                    .iter()
                    .min_by_key(|instance| load.get(instance.id()).copied().unwrap_or(0))
                else {
                    break;
                };
                self.storage
                    .fill_job_node(&path::failover_claim_node(item), target.id())
                    .await?;
                *load.entry(target.id().to_string()).or_insert(0) += 1;
                tracing::info!(job = %self.storage.job_name(), item, instance = %target, "Failover item claimed");
                claims.push((item, target.id().to_string()));
            }
            self.storage
                .remove_job_node_if_existed(&path::failover_queue_node(item))
                .await?;
        }
        Ok(claims)
    }

    /// Items each candidate is busy with: running items plus failover claims.
    async fn instance_load(&self, candidates: &[JobInstance]) -> Result<BTreeMap<String, usize>> {
        let mut load: BTreeMap<String, usize> = candidates
            .iter()
            .map(|instance| (instance.id().to_string(), 0))
            .collect();
        let total = self.config.load().await?.sharding_total_count;
        for item in 0..total {
            let running = self.execution.running_owner(item).await?;
            let claimed = self
                .storage
                .get_job_node_data(&path::failover_claim_node(item))
                .await?;
            for owner in [running, claimed].into_iter().flatten() {
                if let Some(count) = load.get_mut(&owner) {
                    *count += 1;
                }
            }
        }
        Ok(load)
    }

    /// Release the claims on `items` after their failover run finished.
    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&path::failover_claim_node(item))
                .await?;
        }
        Ok(())
    }

    /// Items claimed by `instance_id`.
    pub async fn get_failover_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for child in self.storage.get_job_node_children_keys(path::SHARDING).await? {
            let Ok(item) = child.parse::<u32>() else { continue };
            let claimant = self
                .storage
                .get_job_node_data(&path::failover_claim_node(item))
                .await?;
            if claimant.as_deref() == Some(instance_id) {
                result.push(item);
            }
        }
        result.sort_unstable();
        Ok(result)
    }

    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(Vec::new());
        }
        let id = self.instances.local_instance().id().to_string();
        self.get_failover_items(&id).await
    }

    /// Local items currently claimed by some other instance.
    pub async fn get_local_taken_items(&self) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for item in self.sharding.get_local_sharding_items().await? {
            if self.is_failover_assigned(item).await? {
                result.push(item);
            }
        }
        Ok(result)
    }

    /// Drop every claim and queue entry, used when failover is switched off.
    pub async fn remove_failover_info(&self) -> Result<()> {
        for child in self.storage.get_job_node_children_keys(path::SHARDING).await? {
            if let Ok(item) = child.parse::<u32>() {
                self.storage
                    .remove_job_node_if_existed(&path::failover_claim_node(item))
                    .await?;
            }
        }
        self.storage.remove_job_node_if_existed(path::FAILOVER).await
    }
}
