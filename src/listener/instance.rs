use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;
use crate::topology::instance::TRIGGER;

/// Watches this instance's own node: a removal by someone else shuts the
/// instance down, a `TRIGGER` write runs the job once.
pub struct InstanceListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl InstanceListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    fn local_node(&self) -> String {
        let id = self.services.instances.local_instance().id();
        self.services.storage.path().full_path(&path::instance_node(id))
    }

    async fn on_removed(&self) -> Result<()> {
        let job = self.services.job_name();
        let paused = self
            .job_registry
            .get_schedule_controller(job)
            .map(|controller| controller.is_paused())
            .unwrap_or(false);
        // A lost session also drops the node; that is handled on reconnect.
        if paused || !self.services.storage.registry().is_connected() {
            return Ok(());
        }
        if self.services.instances.is_local_instance_online().await? {
            return Ok(());
        }
        tracing::warn!(job = %job, instance = %self.services.instances.local_instance(), "Instance node removed, shutting down");
        self.services.reconcile.stop();
        if let Err(e) = self.services.leader.remove_leader().await {
            tracing::warn!(job = %job, error = %e, "Could not give up leadership");
        }
        self.job_registry.shutdown(job)
    }

    async fn on_trigger(&self) -> Result<()> {
        let job = self.services.job_name();
        self.services.instances.persist_online().await?;
        if let Some(controller) = self.job_registry.get_schedule_controller(job) {
            tracing::info!(job = %job, "Trigger requested");
            controller.trigger_job();
        }
        Ok(())
    }
}

#[async_trait]
impl JobListener for InstanceListener {
    fn name(&self) -> &'static str {
        "instance"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![path::instance_node(self.services.instances.local_instance().id())]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        if self.job_registry.is_shutdown(self.services.job_name()) || event.path != self.local_node() {
            return Ok(());
        }
        match event.kind {
            NodeEventKind::Removed => self.on_removed().await,
            NodeEventKind::Updated if event.data == TRIGGER => self.on_trigger().await,
            _ => Ok(()),
        }
    }
}
