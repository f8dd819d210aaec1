use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;

/// Applies live configuration changes: cron, misfire and execution
/// monitoring.
pub struct ConfigurationListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl ConfigurationListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }
}

#[async_trait]
impl JobListener for ConfigurationListener {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![path::CONFIG.to_string()]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        let job = self.services.job_name();
        if self.job_registry.is_shutdown(job)
            || event.kind != NodeEventKind::Updated
            || event.path != self.services.storage.path().full_path(path::CONFIG)
        {
            return Ok(());
        }
        let Some(config) = self.services.config.parse_update(&event.data) else {
            return Ok(());
        };
        if let Some(controller) = self.job_registry.get_schedule_controller(job) {
            if controller.cron() != config.cron {
                controller.reschedule(&config.cron)?;
            }
            controller.set_misfire(config.misfire);
        }
        if !config.monitor_execution {
            self.services.execution.clear_all_running_info().await?;
        }
        Ok(())
    }
}
