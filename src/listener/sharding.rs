use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;

/// Raises the resharding flag when the item count changes or instances and
/// hosts come and go.
pub struct ShardingListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl ShardingListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    async fn on_config_changed(&self, data: &str) -> Result<()> {
        let job = self.services.job_name();
        let Some(config) = self.services.config.parse_update(data) else {
            return Ok(());
        };
        let current = self.job_registry.current_sharding_total_count(job);
        if current != config.sharding_total_count {
            tracing::info!(job = %job, from = current, to = config.sharding_total_count, "Sharding total count changed");
            self.services.sharding.set_resharding_flag().await?;
            self.job_registry
                .set_current_sharding_total_count(job, config.sharding_total_count);
        }
        Ok(())
    }

    async fn on_topology_changed(&self) -> Result<()> {
        let config = self.services.config.load().await?;
        if config.static_sharding && self.services.sharding.has_sharding_info().await? {
            return Ok(());
        }
        self.services.sharding.set_resharding_flag().await
    }
}

#[async_trait]
impl JobListener for ShardingListener {
    fn name(&self) -> &'static str {
        "sharding"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![
            path::CONFIG.to_string(),
            path::INSTANCES.to_string(),
            path::SERVERS.to_string(),
        ]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        if self.job_registry.is_shutdown(self.services.job_name()) {
            return Ok(());
        }
        let node_path = self.services.storage.path();
        if event.path == node_path.full_path(path::CONFIG) {
            if event.kind != NodeEventKind::Removed {
                self.on_config_changed(&event.data).await?;
            }
            return Ok(());
        }
        let instance_changed = node_path.child_name(path::INSTANCES, &event.path).is_some()
            && event.kind != NodeEventKind::Updated;
        let server_changed = node_path.child_name(path::SERVERS, &event.path).is_some();
        if instance_changed || server_changed {
            self.on_topology_changed().await?;
        }
        Ok(())
    }
}
