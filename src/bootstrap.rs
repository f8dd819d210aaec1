//! Starting and stopping a job on this process.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use elastic_lite::bootstrap::JobScheduler;
//! # use elastic_lite::config::JobConfig;
//! # use elastic_lite::executor::ScriptJobExecutor;
//! # use elastic_lite::registry::MemoryRegistryServer;
//! # async fn run() -> elastic_lite::error::Result<()> {
//! let registry = MemoryRegistryServer::new().connect();
//! let config = JobConfig::new("order-sync", "0/5 * * * * ?", 3);
//! let scheduler = JobScheduler::builder(registry, config, Arc::new(ScriptJobExecutor::new("echo")))
//!     .start()
//!     .await?;
//! scheduler.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::config::{CoordinatorConfig, JobConfig};
use crate::error::Result;
use crate::executor::{JobItemExecutor, JobRunner, JobScheduleController, RunReport};
use crate::facade::{JobFacade, JobServices, SchedulerFacade};
use crate::guarantee::DistributeOnceJobListener;
use crate::job_registry::JobRegistry;
use crate::registry::RegistryCenter;
use crate::topology::{detect_local_ip, JobInstance};

pub struct JobSchedulerBuilder {
    registry: Arc<dyn RegistryCenter>,
    config: JobConfig,
    executor: Arc<dyn JobItemExecutor>,
    job_registry: Option<Arc<JobRegistry>>,
    coordinator: CoordinatorConfig,
    listeners: Vec<Arc<dyn DistributeOnceJobListener>>,
}

impl JobSchedulerBuilder {
    /// Share one job registry between the jobs of a process.
    pub fn with_job_registry(mut self, job_registry: Arc<JobRegistry>) -> Self {
        self.job_registry = Some(job_registry);
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn DistributeOnceJobListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub async fn start(self) -> Result<JobScheduler> {
        self.config.validate()?;
        let job_registry = self.job_registry.unwrap_or_else(JobRegistry::new);
        let host_ip = self.coordinator.host_ip.clone().unwrap_or_else(detect_local_ip);
        let instance = JobInstance::new(host_ip).with_labels(self.coordinator.labels.clone());
        let job_name = self.config.job_name.clone();

        let token = job_registry.register_job(
            &job_name,
            instance.clone(),
            self.config.sharding_total_count,
        )?;
        let services = JobServices::new(
            &job_name,
            self.registry.clone(),
            job_registry.clone(),
            instance.clone(),
            &self.coordinator,
        );
        let facade = SchedulerFacade::new(services.clone(), job_registry.clone());

        let started: Result<Arc<JobScheduleController>> = async {
            let effective = facade.update_job_configuration(&self.config).await?;
            job_registry.set_current_sharding_total_count(&job_name, effective.sharding_total_count);
            let controller = JobScheduleController::new(&job_name, &effective.cron, effective.misfire, &token)?;
            job_registry.set_schedule_controller(&job_name, controller.clone());
            facade.register_start_up_info(!effective.disabled).await?;
            Ok(controller)
        }
        .await;
        let controller = match started {
            Ok(controller) => controller,
            Err(e) => {
                tracing::error!(job = %job_name, error = %e, "Job failed to start");
                let _ = facade.tear_down().await;
                let _ = job_registry.shutdown(&job_name);
                return Err(e);
            }
        };

        let runner = Arc::new(JobRunner::new(
            &job_name,
            JobFacade::new(services.clone(), job_registry.clone()),
            services.guarantee.clone(),
            self.executor,
            self.listeners,
        ));
        controller.start(runner.clone());

        Ok(JobScheduler {
            job_name,
            instance,
            job_registry,
            services,
            facade,
            controller,
            runner,
        })
    }
}

/// A job running on this process.
pub struct JobScheduler {
    job_name: String,
    instance: JobInstance,
    job_registry: Arc<JobRegistry>,
    services: JobServices,
    facade: SchedulerFacade,
    controller: Arc<JobScheduleController>,
    runner: Arc<JobRunner>,
}

impl JobScheduler {
    pub fn builder(
        registry: Arc<dyn RegistryCenter>,
        config: JobConfig,
        executor: Arc<dyn JobItemExecutor>,
    ) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            registry,
            config,
            executor,
            job_registry: None,
            coordinator: CoordinatorConfig::default(),
            listeners: Vec::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    pub fn services(&self) -> &JobServices {
        &self.services
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.job_registry
    }

    pub fn is_shutdown(&self) -> bool {
        self.job_registry.is_shutdown(&self.job_name)
    }

    /// Run the job once on this instance, outside the schedule.
    pub async fn execute_once(&self) -> Result<RunReport> {
        self.runner.execute().await
    }

    /// Ask every online instance of the job to run once.
    pub async fn trigger(&self) -> Result<()> {
        self.services.instances.trigger_all_instances().await
    }

    pub fn pause(&self) {
        self.controller.pause();
    }

    pub fn resume(&self) {
        self.controller.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.controller.is_paused()
    }

    /// Leave the fleet. A second call fails.
    pub async fn shutdown(&self) -> Result<()> {
        self.facade.shutdown_instance().await
    }
}
