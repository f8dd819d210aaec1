pub mod bootstrap;
pub mod config;
pub mod election;
pub mod error;
pub mod executor;
pub mod facade;
pub mod failover;
pub mod guarantee;
pub mod job_registry;
pub mod listener;
pub mod reconcile;
pub mod registry;
pub mod sharding;
pub mod shutdown;
pub mod storage;
pub mod topology;
