use std::sync::Arc;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::registry::ConnectionState;

/// Pauses the schedule while the session is down and re-registers the
/// instance once it is back.
pub struct ConnectionStateListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl ConnectionStateListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    pub async fn on_state(&self, state: ConnectionState) -> Result<()> {
        let job = self.services.job_name();
        if self.job_registry.is_shutdown(job) {
            return Ok(());
        }
        let Some(controller) = self.job_registry.get_schedule_controller(job) else {
            return Ok(());
        };
        match state {
            ConnectionState::Suspended | ConnectionState::Lost => {
                tracing::warn!(job = %job, ?state, "Registry connection down, pausing job");
                controller.pause();
            }
            ConnectionState::Reconnected => {
                let enabled = self.services.servers.is_local_server_enabled().await?;
                self.services.servers.persist_online(enabled).await?;
                self.services.instances.persist_online().await?;
                let local_items = self.services.sharding.get_local_sharding_items().await?;
                self.services.execution.clear_running_info(&local_items).await?;
                self.services.leader.elect_leader().await?;
                controller.resume();
                tracing::info!(job = %job, "Registry connection restored, job resumed");
            }
        }
        Ok(())
    }
}
