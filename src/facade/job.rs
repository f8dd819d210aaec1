use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::JobConfig;
use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::sharding::ShardingContexts;

/// What the job runner needs from the coordination layer for one run.
#[derive(Clone)]
pub struct JobFacade {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl JobFacade {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    pub async fn load_config(&self) -> Result<JobConfig> {
        self.services.config.load().await
    }

    /// The items this instance runs next. Failover claims come first; without
    /// any, the normal assignment minus items taken over by others and minus
    /// disabled items.
    pub async fn get_sharding_contexts(&self) -> Result<ShardingContexts> {
        let config = self.load_config().await?;
        let failover_enabled = config.is_failover_enabled();
        if failover_enabled {
            let failover_items = self.services.failover.get_local_failover_items().await?;
            if !failover_items.is_empty() {
                return self.build_contexts(&config, &failover_items, true);
            }
        }

        self.services.sharding.sharding_if_necessary().await?;
        let mut items = self.services.sharding.get_local_sharding_items().await?;
        if failover_enabled {
            let taken = self.services.failover.get_local_taken_items().await?;
            items.retain(|item| !taken.contains(item));
        }
        let disabled = self.services.execution.get_disabled_items(&items).await?;
        items.retain(|item| !disabled.contains(item));
        self.build_contexts(&config, &items, false)
    }

    fn build_contexts(&self, config: &JobConfig, items: &[u32], failover: bool) -> Result<ShardingContexts> {
        let parameters = config.item_parameters()?;
        let item_parameters: BTreeMap<u32, String> = items
            .iter()
            .map(|item| (*item, parameters.get(item).cloned().unwrap_or_default()))
            .collect();
        Ok(ShardingContexts::new(
            &config.job_name,
            self.services.instances.local_instance(),
            config.sharding_total_count,
            &config.job_parameter,
            item_parameters,
            failover,
        ))
    }

    pub async fn register_job_begin(&self, contexts: &ShardingContexts) -> Result<()> {
        self.job_registry.set_job_running(self.services.job_name(), true);
        self.services.execution.register_job_begin(contexts).await
    }

    pub async fn register_job_completed(&self, contexts: &ShardingContexts) -> Result<()> {
        self.services.execution.register_job_completed(contexts).await?;
        if contexts.failover {
            self.services
                .failover
                .update_failover_complete(&contexts.items())
                .await?;
        }
        self.job_registry.set_job_running(self.services.job_name(), false);
        Ok(())
    }

    /// Record a misfire on `items` if any of them is still running.
    pub async fn misfire_if_running(&self, items: &[u32]) -> Result<bool> {
        self.services.execution.misfire_if_has_running_items(items).await
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        self.services.execution.clear_misfire(items).await
    }

    /// Whether a missed run of `items` should be executed now.
    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        if self.job_registry.is_shutdown(self.services.job_name()) {
            return Ok(false);
        }
        let config = self.load_config().await?;
        Ok(config.misfire
            && !self.services.sharding.is_need_sharding().await?
            && !self.services.execution.get_misfired_job_items(items).await?.is_empty())
    }

    pub async fn failover_if_necessary(&self) -> Result<()> {
        if self.load_config().await?.is_failover_enabled() {
            self.services.failover.failover_if_necessary().await?;
        }
        Ok(())
    }
}
