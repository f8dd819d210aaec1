use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::election::LeaderService;
use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::sharding::ExecutionService;
use crate::storage::{path, ConfigurationService, JobNodeStorage};
use crate::topology::{InstanceService, ServerService};

/// Owns the item → instance assignment.
///
/// Any instance may raise the resharding flag; only the leader recomputes
/// the assignment, and it clears the flag only after every item has been
/// written. Followers that need the assignment wait for the leader instead
/// of computing it themselves.
#[derive(Clone)]
pub struct ShardingService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    config: ConfigurationService,
    leader: LeaderService,
    servers: ServerService,
    instances: InstanceService,
    execution: ExecutionService,
    poll_interval: Duration,
}

impl ShardingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: JobNodeStorage,
        job_registry: Arc<JobRegistry>,
        config: ConfigurationService,
        leader: LeaderService,
        servers: ServerService,
        instances: InstanceService,
        execution: ExecutionService,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            job_registry,
            config,
            leader,
            servers,
            instances,
            execution,
            poll_interval,
        }
    }

    pub async fn set_resharding_flag(&self) -> Result<()> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(());
        }
        self.storage
            .create_job_node_if_needed(path::SHARDING_NECESSARY)
            .await?;
        tracing::debug!(job = %self.storage.job_name(), "Resharding flag set");
        Ok(())
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.storage
            .is_job_node_existed(path::SHARDING_NECESSARY)
            .await
    }

    /// Recompute the assignment if the flag is set. On the leader this
    /// writes the new map; elsewhere it waits until the leader has.
    pub async fn sharding_if_necessary(&self) -> Result<()> {
        let available = self.instances.get_available_job_instances().await?;
        if !self.is_need_sharding().await? || available.is_empty() {
            return Ok(());
        }
        if !self.leader.is_leader_until_block().await? {
            self.block_until_sharding_completed().await?;
            return Ok(());
        }
        let config = self.config.load().await?;
        if config.monitor_execution {
            self.wait_for_running_items().await?;
        }
        let job = self.storage.job_name().to_string();
        let total = config.sharding_total_count;
        let strategy = config.sharding_strategy_type()?.create();

        // Instances may have come or gone while running items drained.
        let available = self.instances.get_available_job_instances().await?;
        if available.is_empty() {
            tracing::warn!(job = %job, "No available instance left, keeping current sharding");
            return Ok(());
        }
        tracing::debug!(job = %job, total, "Sharding begin");

        self.storage
            .fill_ephemeral_job_node(path::SHARDING_PROCESSING, "")
            .await?;
        self.reset_sharding_info(total).await?;

        let assignment = strategy.sharding(&available, &job, total);
        for (instance, items) in &assignment {
            for &item in items {
                self.storage
                    .fill_job_node(&path::sharding_instance_node(item), instance.id())
                    .await?;
            }
        }
        self.storage
            .remove_job_node_if_existed(path::SHARDING_NECESSARY)
            .await?;
        self.storage
            .remove_job_node_if_existed(path::SHARDING_PROCESSING)
            .await?;

        tracing::info!(
            job = %job,
            total,
            instances = available.len(),
            strategy = strategy.name(),
            "Sharding completed"
        );
        Ok(())
    }

    async fn block_until_sharding_completed(&self) -> Result<()> {
        while !self.leader.is_leader_until_block().await?
            && (self.is_need_sharding().await?
                || self
                    .storage
                    .is_job_node_existed(path::SHARDING_PROCESSING)
                    .await?)
        {
            if self.job_registry.is_shutdown(self.storage.job_name()) {
                break;
            }
            tracing::debug!(job = %self.storage.job_name(), "Sleep short time until sharding completed");
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn wait_for_running_items(&self) -> Result<()> {
        while self.execution.has_any_running_items().await? {
            if self.job_registry.is_shutdown(self.storage.job_name()) {
                break;
            }
            tracing::debug!(job = %self.storage.job_name(), "Sleep short time until other job completed");
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn reset_sharding_info(&self, total: u32) -> Result<()> {
        for item in 0..total {
            self.storage
                .remove_job_node_if_existed(&path::sharding_instance_node(item))
                .await?;
            self.storage
                .create_job_node_if_needed(&path::sharding_item_node(item))
                .await?;
        }
        for child in self.storage.get_job_node_children_keys(path::SHARDING).await? {
            match child.parse::<u32>() {
                Ok(item) if item >= total => {
                    self.storage
                        .remove_job_node_if_existed(&path::sharding_item_node(item))
                        .await?;
                }
                _ => {}
            }
        }
        self.execution.clear_stale_running_info(total).await
    }

    /// Items assigned to `instance_id`, empty when its host is unavailable.
    pub async fn get_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let ip = crate::topology::instance::server_ip_of(instance_id);
        if !self.servers.is_available_server(ip).await? {
            return Ok(Vec::new());
        }
        let total = self.config.load().await?.sharding_total_count;
        let mut result = Vec::new();
        for item in 0..total {
            if self.owner_of(item).await?.as_deref() == Some(instance_id) {
                result.push(item);
            }
        }
        Ok(result)
    }

    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(Vec::new());
        }
        let id = self.instances.local_instance().id().to_string();
        self.get_sharding_items(&id).await
    }

    pub async fn owner_of(&self, item: u32) -> Result<Option<String>> {
        self.storage
            .get_job_node_data(&path::sharding_instance_node(item))
            .await
    }

    /// Whether any assignment has been written yet.
    pub async fn has_sharding_info(&self) -> Result<bool> {
        for child in self.storage.get_job_node_children_keys(path::SHARDING).await? {
            if let Ok(item) = child.parse::<u32>() {
                if self
                    .storage
                    .is_job_node_existed(&path::sharding_instance_node(item))
                    .await?
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether any item is owned by an instance that is not online. An item
    /// with no owner at all counts too.
    pub async fn has_sharding_info_in_offline_servers(&self) -> Result<bool> {
        let online = self.storage.get_job_node_children_keys(path::INSTANCES).await?;
        let total = self.config.load().await?.sharding_total_count;
        for item in 0..total {
            match self.owner_of(item).await? {
                Some(owner) if online.contains(&owner) => {}
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    /// Items of `instance_id` that were running when it went away.
    pub async fn get_crashed_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let ip = crate::topology::instance::server_ip_of(instance_id);
        if !self.servers.is_enable_server(ip).await? {
            return Ok(Vec::new());
        }
        let total = self.config.load().await?.sharding_total_count;
        let mut result = Vec::new();
        for item in 0..total {
            if self.owner_of(item).await?.as_deref() == Some(instance_id)
                && self.execution.running_owner(item).await?.is_some()
            {
                result.push(item);
            }
        }
        Ok(result)
    }

    /// Current owner of every item in `0..total`.
    pub async fn get_assignment(&self) -> Result<BTreeMap<u32, Option<String>>> {
        let total = self.config.load().await?.sharding_total_count;
        let mut result = BTreeMap::new();
        for item in 0..total {
            result.insert(item, self.owner_of(item).await?);
        }
        Ok(result)
    }
}
