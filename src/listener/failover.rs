use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;

const CLAIM_LEAF: &str = "failover";

/// Queues the items of crashed instances, runs claims made for this
/// instance and drops failover state when failover is switched off.
pub struct FailoverListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl FailoverListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    async fn on_instance_crashed(&self, instance_id: &str) -> Result<()> {
        let failover = &self.services.failover;
        let job = self.services.job_name();
        if instance_id == self.services.instances.local_instance().id()
            || !self.services.config.load().await?.is_failover_enabled()
        {
            return Ok(());
        }

        // Items the crashed instance had itself taken over go back to the
        // queue; otherwise its own running items are queued.
        let taken_over = failover.get_failover_items(instance_id).await?;
        if !taken_over.is_empty() {
            tracing::info!(job = %job, instance = %instance_id, items = ?taken_over, "Re-queueing failover items of crashed instance");
            for item in taken_over {
                failover.set_crashed_failover_flag_directly(item).await?;
            }
        } else {
            let crashed = self
                .services
                .sharding
                .get_crashed_sharding_items(instance_id)
                .await?;
            if !crashed.is_empty() {
                tracing::info!(job = %job, instance = %instance_id, items = ?crashed, "Queueing items of crashed instance");
            }
            for item in crashed {
                failover.set_crashed_failover_flag(item).await?;
            }
        }
        failover.failover_if_necessary().await?;
        Ok(())
    }

    fn on_claim(&self, claimant: &str, item: u32) {
        if claimant != self.services.instances.local_instance().id() {
            return;
        }
        if let Some(controller) = self.job_registry.get_schedule_controller(self.services.job_name()) {
            tracing::info!(job = %self.services.job_name(), item, "Failover item claimed for this instance, triggering");
            controller.trigger_job();
        }
    }
}

#[async_trait]
impl JobListener for FailoverListener {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![
            path::INSTANCES.to_string(),
            path::SHARDING.to_string(),
            path::CONFIG.to_string(),
        ]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        if self.job_registry.is_shutdown(self.services.job_name()) {
            return Ok(());
        }
        let node_path = self.services.storage.path();

        if event.kind == NodeEventKind::Removed {
            if let Some(instance_id) = node_path.child_name(path::INSTANCES, &event.path) {
                return self.on_instance_crashed(instance_id).await;
            }
        }

        if event.kind != NodeEventKind::Removed {
            if let Some(item) = node_path.sharding_item_of(&event.path, CLAIM_LEAF) {
                self.on_claim(&event.data, item);
                return Ok(());
            }
        }

        if event.kind == NodeEventKind::Updated && event.path == node_path.full_path(path::CONFIG) {
            if let Some(config) = self.services.config.parse_update(&event.data) {
                if !config.is_failover_enabled() {
                    self.services.failover.remove_failover_info().await?;
                }
            }
        }
        Ok(())
    }
}
