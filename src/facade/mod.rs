//! Entry points the scheduler and the job runner use, built on top of the
//! per-job coordination services.

pub mod job;
pub mod scheduler;

use std::sync::Arc;

use crate::config::CoordinatorConfig;
use crate::election::LeaderService;
use crate::failover::FailoverService;
use crate::guarantee::GuaranteeService;
use crate::job_registry::JobRegistry;
use crate::reconcile::ReconcileService;
use crate::registry::RegistryCenter;
use crate::sharding::{ExecutionService, ShardingService};
use crate::storage::{ConfigurationService, JobNodeStorage};
use crate::topology::{InstanceService, JobInstance, ServerService};

pub use job::JobFacade;
pub use scheduler::SchedulerFacade;

/// Every coordination service of one job, wired to the same storage and
/// job registry.
#[derive(Clone)]
pub struct JobServices {
    pub storage: JobNodeStorage,
    pub config: ConfigurationService,
    pub servers: ServerService,
    pub instances: InstanceService,
    pub leader: LeaderService,
    pub execution: ExecutionService,
    pub sharding: ShardingService,
    pub failover: FailoverService,
    pub guarantee: GuaranteeService,
    pub reconcile: ReconcileService,
}

impl JobServices {
    pub fn new(
        job_name: &str,
        registry: Arc<dyn RegistryCenter>,
        job_registry: Arc<JobRegistry>,
        instance: JobInstance,
        coordinator: &CoordinatorConfig,
    ) -> Self {
        let storage = JobNodeStorage::new(registry, job_name);
        let config = ConfigurationService::new(storage.clone());
        let servers = ServerService::new(storage.clone(), job_registry.clone(), instance.server_ip());
        let instances = InstanceService::new(
            storage.clone(),
            job_registry.clone(),
            instance.clone(),
            servers.clone(),
        );
        let leader = LeaderService::new(
            storage.clone(),
            job_registry.clone(),
            instance,
            servers.clone(),
            coordinator.election_poll_interval,
        );
        let execution = ExecutionService::new(
            storage.clone(),
            job_registry.clone(),
            config.clone(),
            instances.clone(),
        );
        let sharding = ShardingService::new(
            storage.clone(),
            job_registry.clone(),
            config.clone(),
            leader.clone(),
            servers.clone(),
            instances.clone(),
            execution.clone(),
            coordinator.sharding_poll_interval,
        );
        let failover = FailoverService::new(
            storage.clone(),
            job_registry.clone(),
            config.clone(),
            leader.clone(),
            instances.clone(),
            sharding.clone(),
            execution.clone(),
        );
        let guarantee = GuaranteeService::new(storage.clone(), job_registry, config.clone());
        let reconcile = ReconcileService::new(
            config.clone(),
            sharding.clone(),
            failover.clone(),
            coordinator.reconcile_tick,
        );
        Self {
            storage,
            config,
            servers,
            instances,
            leader,
            execution,
            sharding,
            failover,
            guarantee,
            reconcile,
        }
    }

    pub fn job_name(&self) -> &str {
        self.storage.job_name()
    }
}
