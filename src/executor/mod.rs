pub mod runner;
pub mod schedule;
pub mod script;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::sharding::ShardingContext;

pub use runner::{JobRunner, RunReport};
pub use schedule::JobScheduleController;
pub use script::ScriptJobExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Simple,
    Script,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobType::Simple => write!(f, "SIMPLE"),
            JobType::Script => write!(f, "SCRIPT"),
        }
    }
}

/// Runs the business logic of one sharding item.
#[async_trait]
pub trait JobItemExecutor: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn execute(&self, context: ShardingContext) -> Result<()>;
}

pub type ItemFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Executor backed by a closure.
pub struct SimpleJobExecutor {
    handler: Arc<dyn Fn(ShardingContext) -> ItemFuture + Send + Sync>,
}

impl SimpleJobExecutor {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ShardingContext) -> ItemFuture + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
        }
    }
}

#[async_trait]
impl JobItemExecutor for SimpleJobExecutor {
    fn job_type(&self) -> JobType {
        JobType::Simple
    }

    async fn execute(&self, context: ShardingContext) -> Result<()> {
        (self.handler)(context).await
    }
}
