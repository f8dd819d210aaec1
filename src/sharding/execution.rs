//! Per-item execution markers: running, misfire and disabled.
//!
//! A running marker holds the id of the instance executing the item. It is
//! persistent so that a crashed owner's items stay visible to failover; a
//! marker whose owner is offline is treated as not running.

use std::sync::Arc;

use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::sharding::ShardingContexts;
use crate::storage::{path, ConfigurationService, JobNodeStorage};
use crate::topology::InstanceService;

#[derive(Clone)]
pub struct ExecutionService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    config: ConfigurationService,
    instances: InstanceService,
}

impl ExecutionService {
    pub fn new(
        storage: JobNodeStorage,
        job_registry: Arc<JobRegistry>,
        config: ConfigurationService,
        instances: InstanceService,
    ) -> Self {
        Self {
            storage,
            job_registry,
            config,
            instances,
        }
    }

    pub async fn register_job_begin(&self, contexts: &ShardingContexts) -> Result<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        self.job_registry.set_job_running(self.storage.job_name(), true);
        if !self.config.load().await?.monitor_execution {
            return Ok(());
        }
        let owner = self.instances.local_instance().id().to_string();
        for item in contexts.items() {
            self.storage.fill_job_node(&path::running_node(item), &owner).await?;
        }
        Ok(())
    }

    pub async fn register_job_completed(&self, contexts: &ShardingContexts) -> Result<()> {
        self.job_registry.set_job_running(self.storage.job_name(), false);
        if !self.config.load().await?.monitor_execution {
            return Ok(());
        }
        self.clear_running_info(&contexts.items()).await
    }

    pub async fn clear_running_info(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&path::running_node(item))
                .await?;
        }
        Ok(())
    }

    pub async fn clear_all_running_info(&self) -> Result<()> {
        let total = self.config.load().await?.sharding_total_count;
        self.clear_running_info(&(0..total).collect::<Vec<_>>()).await
    }

    /// Drop running markers left behind by instances that are gone.
    pub async fn clear_stale_running_info(&self, total: u32) -> Result<()> {
        for item in 0..total {
            if let Some(owner) = self.running_owner(item).await? {
                if !owner.is_empty() && !self.instances.is_online(&owner).await? {
                    self.storage
                        .remove_job_node_if_existed(&path::running_node(item))
                        .await?;
                    tracing::debug!(job = %self.storage.job_name(), item, %owner, "Cleared stale running marker");
                }
            }
        }
        Ok(())
    }

    pub async fn running_owner(&self, item: u32) -> Result<Option<String>> {
        self.storage.get_job_node_data(&path::running_node(item)).await
    }

    /// Running on an instance that is still online.
    pub async fn is_running_item(&self, item: u32) -> Result<bool> {
        match self.running_owner(item).await? {
            Some(owner) if owner.is_empty() => Ok(true),
            Some(owner) => self.instances.is_online(&owner).await,
            None => Ok(false),
        }
    }

    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.config.load().await?.monitor_execution {
            return Ok(false);
        }
        for &item in items {
            if self.is_running_item(item).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn has_any_running_items(&self) -> Result<bool> {
        let total = self.config.load().await?.sharding_total_count;
        self.has_running_items(&(0..total).collect::<Vec<_>>()).await
    }

    /// Mark `items` misfired when any of them is still running.
    pub async fn misfire_if_has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.has_running_items(items).await? {
            return Ok(false);
        }
        self.set_misfire(items).await?;
        Ok(true)
    }

    pub async fn set_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .create_job_node_if_needed(&path::misfire_node(item))
                .await?;
        }
        Ok(())
    }

    pub async fn get_misfired_job_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for &item in items {
            if self.storage.is_job_node_existed(&path::misfire_node(item)).await? {
                result.push(item);
            }
        }
        Ok(result)
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        for &item in items {
            self.storage
                .remove_job_node_if_existed(&path::misfire_node(item))
                .await?;
        }
        Ok(())
    }

    pub async fn get_disabled_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        let mut result = Vec::new();
        for &item in items {
            if self.storage.is_job_node_existed(&path::disabled_node(item)).await? {
                result.push(item);
            }
        }
        Ok(result)
    }

    pub async fn set_item_disabled(&self, item: u32, disabled: bool) -> Result<()> {
        if disabled {
            self.storage
                .create_job_node_if_needed(&path::disabled_node(item))
                .await
        } else {
            self.storage
                .remove_job_node_if_existed(&path::disabled_node(item))
                .await
        }
    }
}
