use std::sync::Arc;

use crate::config::JobConfig;
use crate::error::{ElasticError, Result};
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::ListenerManager;

/// Start-up and shut-down of one job instance.
pub struct SchedulerFacade {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
    listeners: ListenerManager,
}

impl SchedulerFacade {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        let listeners = ListenerManager::new(services.clone(), job_registry.clone());
        Self {
            services,
            job_registry,
            listeners,
        }
    }

    /// Publish `config` and return the configuration in effect.
    pub async fn update_job_configuration(&self, config: &JobConfig) -> Result<JobConfig> {
        self.services.config.persist(config).await
    }

    /// Bring this instance into the fleet: listeners first so that no
    /// topology change is missed, then election and the online markers.
    pub async fn register_start_up_info(&self, enabled: bool) -> Result<()> {
        let job = self.services.job_name();
        let token = self
            .job_registry
            .cancellation_token(job)
            .ok_or_else(|| ElasticError::JobNotRegistered(job.to_string()))?;

        self.listeners.start_all_listeners().await?;
        self.services.leader.elect_leader().await?;
        self.services.servers.persist_online(enabled).await?;
        self.services.instances.persist_online().await?;

        let config = self.services.config.load().await?;
        if !(config.static_sharding && self.services.sharding.has_sharding_info().await?) {
            self.services.sharding.set_resharding_flag().await?;
        }
        if !self.services.reconcile.is_running() {
            self.services.reconcile.start(&token);
        }
        self.services.servers.remove_offline_servers().await?;
        tracing::info!(job = %job, instance = %self.services.instances.local_instance(), enabled, "Job instance started");
        Ok(())
    }

    /// Stop background work and give up leadership.
    pub async fn tear_down(&self) -> Result<()> {
        let was_leader = self.services.leader.is_leader().await.unwrap_or(false);
        self.listeners.stop_all_listeners();
        self.services.reconcile.stop();
        if was_leader {
            self.services.leader.remove_leader().await?;
        }
        Ok(())
    }

    /// Leave the fleet: tear down, withdraw the instance node and forget the
    /// job locally. Fails if the job was already shut down.
    pub async fn shutdown_instance(&self) -> Result<()> {
        let job = self.services.job_name();
        if self.job_registry.is_shutdown(job) {
            return Err(ElasticError::JobNotRegistered(job.to_string()));
        }
        if let Err(e) = self.tear_down().await {
            tracing::warn!(job = %job, error = %e, "Tear down incomplete");
        }
        if let Err(e) = self.services.instances.remove_instance().await {
            tracing::warn!(job = %job, error = %e, "Could not remove instance node");
        }
        self.job_registry.shutdown(job)
    }
}
