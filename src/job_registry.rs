//! Process-local state of every job started in this process.
//!
//! One `JobRegistry` is created per process and handed to every service by
//! constructor. Services consult it to learn whether their job has been shut
//! down; registry callbacks arriving after shutdown become no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{ElasticError, Result};
use crate::executor::JobScheduleController;
use crate::topology::JobInstance;

struct JobEntry {
    instance: JobInstance,
    controller: Option<Arc<JobScheduleController>>,
    current_sharding_total_count: u32,
    running: bool,
    token: CancellationToken,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a job started in this process. Returns the job's lifetime
    /// token, cancelled when the job shuts down.
    pub fn register_job(
        &self,
        job_name: &str,
        instance: JobInstance,
        sharding_total_count: u32,
    ) -> Result<CancellationToken> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(job_name) {
            return Err(ElasticError::JobAlreadyRegistered(job_name.to_string()));
        }
        let token = CancellationToken::new();
        jobs.insert(
            job_name.to_string(),
            JobEntry {
                instance,
                controller: None,
                current_sharding_total_count: sharding_total_count,
                running: false,
                token: token.clone(),
            },
        );
        tracing::debug!(job = %job_name, "Job registered");
        Ok(token)
    }

    pub fn set_schedule_controller(&self, job_name: &str, controller: Arc<JobScheduleController>) {
        if let Some(entry) = self.jobs.write().get_mut(job_name) {
            entry.controller = Some(controller);
        }
    }

    pub fn get_schedule_controller(&self, job_name: &str) -> Option<Arc<JobScheduleController>> {
        self.jobs.read().get(job_name).and_then(|e| e.controller.clone())
    }

    pub fn get_job_instance(&self, job_name: &str) -> Option<JobInstance> {
        self.jobs.read().get(job_name).map(|e| e.instance.clone())
    }

    pub fn cancellation_token(&self, job_name: &str) -> Option<CancellationToken> {
        self.jobs.read().get(job_name).map(|e| e.token.clone())
    }

    /// A job that was never registered counts as shut down.
    pub fn is_shutdown(&self, job_name: &str) -> bool {
        self.jobs
            .read()
            .get(job_name)
            .map(|e| e.token.is_cancelled())
            .unwrap_or(true)
    }

    pub fn is_job_running(&self, job_name: &str) -> bool {
        self.jobs.read().get(job_name).map(|e| e.running).unwrap_or(false)
    }

    pub fn set_job_running(&self, job_name: &str, running: bool) {
        if let Some(entry) = self.jobs.write().get_mut(job_name) {
            entry.running = running;
        }
    }

    pub fn current_sharding_total_count(&self, job_name: &str) -> u32 {
        self.jobs
            .read()
            .get(job_name)
            .map(|e| e.current_sharding_total_count)
            .unwrap_or(0)
    }

    pub fn set_current_sharding_total_count(&self, job_name: &str, count: u32) {
        if let Some(entry) = self.jobs.write().get_mut(job_name) {
            entry.current_sharding_total_count = count;
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget a job: cancel its token and stop its schedule. A second call
    /// for the same job fails.
    pub fn shutdown(&self, job_name: &str) -> Result<()> {
        let entry = self
            .jobs
            .write()
            .remove(job_name)
            .ok_or_else(|| ElasticError::JobNotRegistered(job_name.to_string()))?;
        entry.token.cancel();
        if let Some(controller) = entry.controller {
            controller.shutdown();
        }
        tracing::info!(job = %job_name, instance = %entry.instance, "Job shut down");
        Ok(())
    }
}
