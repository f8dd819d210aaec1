use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::Result;
use crate::executor::JobItemExecutor;
use crate::facade::JobFacade;
use crate::guarantee::{DistributeOnceJobListener, GuaranteeService};
use crate::sharding::ShardingContexts;

/// What one call to [`JobRunner::execute`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Items executed, in order of the runs (misfire re-runs included).
    pub executed: Vec<u32>,
    /// Items whose executor returned an error.
    pub failed: Vec<u32>,
    /// Whether the items were taken over from a crashed instance.
    pub failover: bool,
    /// The run was skipped because the items were still running; a misfire
    /// was recorded instead.
    pub misfired: bool,
}

/// One run of a job on this instance: resolve the items, pass the
/// barriers, run the items and record the outcome.
pub struct JobRunner {
    job_name: String,
    facade: JobFacade,
    guarantee: GuaranteeService,
    executor: Arc<dyn JobItemExecutor>,
    listeners: Vec<Arc<dyn DistributeOnceJobListener>>,
}

impl JobRunner {
    pub fn new(
        job_name: &str,
        facade: JobFacade,
        guarantee: GuaranteeService,
        executor: Arc<dyn JobItemExecutor>,
        listeners: Vec<Arc<dyn DistributeOnceJobListener>>,
    ) -> Self {
        Self {
            job_name: job_name.to_string(),
            facade,
            guarantee,
            executor,
            listeners,
        }
    }

    pub async fn execute(&self) -> Result<RunReport> {
        let mut report = RunReport::default();
        let contexts = self.facade.get_sharding_contexts().await?;
        if contexts.is_empty() {
            tracing::debug!(job = %self.job_name, "No items to execute");
            self.facade.failover_if_necessary().await?;
            return Ok(report);
        }
        report.failover = contexts.failover;
        let items = contexts.items();

        if self.facade.misfire_if_running(&items).await? {
            tracing::info!(job = %self.job_name, ?items, "Items still running, misfire recorded");
            report.misfired = true;
            return Ok(report);
        }

        self.execute_contexts(&contexts, &mut report).await?;
        while self.facade.is_execute_misfired(&items).await? {
            self.facade.clear_misfire(&items).await?;
            tracing::info!(job = %self.job_name, ?items, "Executing misfired items");
            self.execute_contexts(&contexts, &mut report).await?;
        }

        self.facade.failover_if_necessary().await?;
        Ok(report)
    }

    async fn execute_contexts(&self, contexts: &ShardingContexts, report: &mut RunReport) -> Result<()> {
        for listener in &self.listeners {
            self.guarantee
                .before_job_executed(contexts, listener.as_ref())
                .await?;
        }

        self.facade.register_job_begin(contexts).await?;
        tracing::info!(job = %self.job_name, task = %contexts.task_id, items = ?contexts.items(), "Job run started");

        let mut tasks = JoinSet::new();
        for item in contexts.items() {
            let executor = self.executor.clone();
            let context = contexts.item_context(item);
            tasks.spawn(async move { (item, executor.execute(context).await) });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((item, Ok(()))) => report.executed.push(item),
                Ok((item, Err(e))) => {
                    tracing::error!(job = %self.job_name, item, error = %e, "Item execution failed");
                    report.executed.push(item);
                    report.failed.push(item);
                }
                Err(e) => tracing::error!(job = %self.job_name, error = %e, "Item task panicked"),
            }
        }

        self.facade.register_job_completed(contexts).await?;
        tracing::info!(job = %self.job_name, task = %contexts.task_id, "Job run completed");

        for listener in &self.listeners {
            self.guarantee
                .after_job_executed(contexts, listener.as_ref())
                .await?;
        }
        Ok(())
    }
}
