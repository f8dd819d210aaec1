use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::JobConfig;
use crate::error::{ElasticError, Result};
use crate::storage::{path, JobNodeStorage};

/// Reads and writes the job configuration node.
///
/// Only valid configurations take effect: an invalid registry copy is
/// ignored in favour of the last valid one this process loaded.
#[derive(Clone)]
pub struct ConfigurationService {
    storage: JobNodeStorage,
    last_valid: Arc<Mutex<Option<JobConfig>>>,
}

impl ConfigurationService {
    pub fn new(storage: JobNodeStorage) -> Self {
        Self {
            storage,
            last_valid: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn load(&self) -> Result<JobConfig> {
        let data = self
            .storage
            .get_job_node_data(path::CONFIG)
            .await?
            .filter(|data| !data.is_empty())
            .ok_or_else(|| ElasticError::ConfigNotFound(self.storage.job_name().to_string()))?;
        match JobConfig::from_valid_json(&data) {
            Ok(config) => {
                *self.last_valid.lock() = Some(config.clone());
                Ok(config)
            }
            Err(err) => match self.last_valid.lock().clone() {
                Some(config) => {
                    tracing::warn!(job = %self.storage.job_name(), error = %err, "Invalid job configuration in registry, keeping last valid one");
                    Ok(config)
                }
                None => Err(err),
            },
        }
    }

    /// Parse a configuration update seen on the registry; invalid updates
    /// are logged and dropped.
    pub fn parse_update(&self, data: &str) -> Option<JobConfig> {
        match JobConfig::from_valid_json(data) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(job = %self.storage.job_name(), error = %err, "Ignoring invalid job configuration update");
                None
            }
        }
    }

    /// Persist `config` unless a registry copy exists and `overwrite` is off.
    /// Returns the configuration now in effect.
    pub async fn persist(&self, config: &JobConfig) -> Result<JobConfig> {
        if config.job_name != self.storage.job_name() {
            return Err(ElasticError::InvalidConfig(format!(
                "configuration for '{}' can not be stored under job '{}'",
                config.job_name,
                self.storage.job_name()
            )));
        }
        let existed = self.storage.is_job_node_existed(path::CONFIG).await?;
        if !existed || config.overwrite {
            self.storage
                .fill_job_node(path::CONFIG, &config.to_json()?)
                .await?;
            tracing::info!(job = %config.job_name, overwrite = config.overwrite, "Job configuration persisted");
        } else {
            tracing::info!(job = %config.job_name, "Job configuration exists in registry, keeping it");
        }
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistryServer;

    fn service() -> ConfigurationService {
        let server = MemoryRegistryServer::new();
        ConfigurationService::new(JobNodeStorage::new(server.connect(), "job"))
    }

    #[tokio::test]
    async fn load_without_config_fails() {
        let service = service();
        assert!(matches!(
            service.load().await,
            Err(ElasticError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn registry_copy_wins_without_overwrite() {
        let service = service();
        let first = JobConfig::new("job", "0/5 * * * * ?", 3);
        service.persist(&first).await.unwrap();

        let second = JobConfig::new("job", "0/10 * * * * ?", 5);
        let effective = service.persist(&second).await.unwrap();
        assert_eq!(effective.sharding_total_count, 3);
        assert_eq!(effective.cron, "0/5 * * * * ?");
    }

    #[tokio::test]
    async fn overwrite_replaces_registry_copy() {
        let service = service();
        service
            .persist(&JobConfig::new("job", "0/5 * * * * ?", 3))
            .await
            .unwrap();

        let replacement = JobConfig::new("job", "0/10 * * * * ?", 5).with_overwrite(true);
        let effective = service.persist(&replacement).await.unwrap();
        assert_eq!(effective.sharding_total_count, 5);
    }

    #[tokio::test]
    async fn invalid_registry_copy_keeps_last_valid_config() {
        let service = service();
        service
            .persist(&JobConfig::new("job", "0/5 * * * * ?", 3))
            .await
            .unwrap();

        let mut broken = JobConfig::new("job", "0/5 * * * * ?", 3);
        broken.sharding_total_count = 0;
        service
            .storage
            .fill_job_node(path::CONFIG, &broken.to_json().unwrap())
            .await
            .unwrap();
        assert_eq!(service.load().await.unwrap().sharding_total_count, 3);
        assert!(service.parse_update(&broken.to_json().unwrap()).is_none());
    }

    #[tokio::test]
    async fn invalid_config_without_prior_valid_one_fails() {
        let service = service();
        let mut broken = JobConfig::new("job", "0/5 * * * * ?", 3);
        broken.job_sharding_strategy_type = "NO_SUCH_STRATEGY".to_string();
        service
            .storage
            .fill_job_node(path::CONFIG, &broken.to_json().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            service.load().await,
            Err(ElasticError::UnknownShardingStrategy(_))
        ));
    }

    #[tokio::test]
    async fn rejects_config_of_another_job() {
        let service = service();
        let other = JobConfig::new("other", "0/5 * * * * ?", 1);
        assert!(service.persist(&other).await.is_err());
    }
}
