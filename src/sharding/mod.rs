pub mod context;
pub mod execution;
pub mod service;
pub mod strategy;

pub use context::{ShardingContext, ShardingContexts};
pub use execution::ExecutionService;
pub use service::ShardingService;
pub use strategy::{JobShardingStrategy, ShardingAssignment, ShardingStrategyType};
