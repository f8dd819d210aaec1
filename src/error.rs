use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElasticError {
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown sharding strategy type: {0}")]
    UnknownShardingStrategy(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Job '{0}' is already registered in this process")]
    JobAlreadyRegistered(String),

    #[error("Job '{0}' is not registered in this process")]
    JobNotRegistered(String),

    #[error("Job configuration not found for '{0}'")]
    ConfigNotFound(String),

    #[error("Registry session expired")]
    SessionExpired,

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Job execution failed: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ElasticError>;
