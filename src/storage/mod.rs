pub mod configuration;
pub mod path;

use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::registry::{RegistryCenter, WatchReceiver};

pub use configuration::ConfigurationService;
pub use path::JobNodePath;

/// Job-scoped access to the registry: every node name is relative to the
/// job root.
#[derive(Clone)]
pub struct JobNodeStorage {
    registry: Arc<dyn RegistryCenter>,
    path: JobNodePath,
}

impl JobNodeStorage {
    pub fn new(registry: Arc<dyn RegistryCenter>, job_name: impl Into<String>) -> Self {
        Self {
            registry,
            path: JobNodePath::new(job_name),
        }
    }

    pub fn job_name(&self) -> &str {
        self.path.job_name()
    }

    pub fn path(&self) -> &JobNodePath {
        &self.path
    }

    pub fn registry(&self) -> &Arc<dyn RegistryCenter> {
        &self.registry
    }

    pub async fn is_job_node_existed(&self, node: &str) -> Result<bool> {
        self.registry.is_existed(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_data(&self, node: &str) -> Result<Option<String>> {
        self.registry.get(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_children_keys(&self, node: &str) -> Result<Vec<String>> {
        self.registry.get_children_keys(&self.path.full_path(node)).await
    }

    pub async fn get_job_node_num_children(&self, node: &str) -> Result<usize> {
        self.registry.get_num_children(&self.path.full_path(node)).await
    }

    /// Create an empty persistent node unless it already exists.
    pub async fn create_job_node_if_needed(&self, node: &str) -> Result<()> {
        if !self.is_job_node_existed(node).await? {
            self.registry.persist(&self.path.full_path(node), "").await?;
        }
        Ok(())
    }

    pub async fn remove_job_node_if_existed(&self, node: &str) -> Result<()> {
        if self.is_job_node_existed(node).await? {
            self.registry.remove(&self.path.full_path(node)).await?;
        }
        Ok(())
    }

    pub async fn fill_job_node(&self, node: &str, value: &str) -> Result<()> {
        self.registry.persist(&self.path.full_path(node), value).await
    }

    /// Replace the data of an existing node without taking it over.
    pub async fn update_job_node(&self, node: &str, value: &str) -> Result<bool> {
        self.registry.update(&self.path.full_path(node), value).await
    }

    pub async fn fill_ephemeral_job_node(&self, node: &str, value: &str) -> Result<()> {
        self.registry
            .persist_ephemeral(&self.path.full_path(node), value)
            .await
    }

    /// Subscribe to changes of a job node and its subtree.
    pub async fn watch(&self, node: &str) -> Result<WatchReceiver> {
        self.registry.watch(&self.path.full_path(node)).await
    }

    /// Run `f` while holding the lock at `latch`. The lock is released
    /// whether or not `f` succeeds.
    pub async fn execute_in_leader<F, Fut, T>(&self, latch: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.registry.acquire_lock(&self.path.full_path(latch)).await?;
        let result = f().await;
        if let Err(e) = lock.release().await {
            tracing::warn!(job = %self.job_name(), latch, error = %e, "Failed to release lock");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistryServer;

    fn storage() -> JobNodeStorage {
        let server = MemoryRegistryServer::new();
        JobNodeStorage::new(server.connect(), "job")
    }

    #[tokio::test]
    async fn create_if_needed_keeps_existing_data() {
        let storage = storage();
        storage.fill_job_node("config", "payload").await.unwrap();
        storage.create_job_node_if_needed("config").await.unwrap();
        assert_eq!(
            storage.get_job_node_data("config").await.unwrap().as_deref(),
            Some("payload")
        );
    }

    #[tokio::test]
    async fn remove_if_existed_tolerates_missing_nodes() {
        let storage = storage();
        storage.remove_job_node_if_existed("missing").await.unwrap();
        storage.fill_job_node("servers/10.0.0.1", "").await.unwrap();
        storage.remove_job_node_if_existed("servers").await.unwrap();
        assert!(!storage.is_job_node_existed("servers/10.0.0.1").await.unwrap());
    }

    #[tokio::test]
    async fn execute_in_leader_returns_closure_result() {
        let storage = storage();
        let value = storage
            .execute_in_leader("leader/election/latch", || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let failed: Result<()> = storage
            .execute_in_leader("leader/election/latch", || async {
                Err(crate::error::ElasticError::Internal("boom".to_string()))
            })
            .await;
        assert!(failed.is_err());

        // The lock was released on the error path.
        let again = storage
            .execute_in_leader("leader/election/latch", || async { Ok(()) })
            .await;
        assert!(again.is_ok());
    }
}
