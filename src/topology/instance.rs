use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::storage::{path, JobNodeStorage};
use crate::topology::ServerService;

/// One participating worker process for one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    job_instance_id: String,
    server_ip: String,
    #[serde(default)]
    labels: Vec<String>,
}

impl JobInstance {
    pub const DELIMITER: &'static str = "@-@";

    /// Instance of the current process on `server_ip`.
    pub fn new(server_ip: impl Into<String>) -> Self {
        Self::with_discriminator(server_ip, std::process::id())
    }

    /// Instance id `{ip}@-@{discriminator}`; the discriminator is the pid
    /// for real processes.
    pub fn with_discriminator(server_ip: impl Into<String>, discriminator: impl fmt::Display) -> Self {
        let server_ip = server_ip.into();
        Self {
            job_instance_id: format!("{}{}{}", server_ip, Self::DELIMITER, discriminator),
            server_ip,
            labels: Vec::new(),
        }
    }

    /// Rebuild an instance from its id as found in the registry.
    pub fn from_id(job_instance_id: impl Into<String>) -> Self {
        let job_instance_id = job_instance_id.into();
        let server_ip = server_ip_of(&job_instance_id).to_string();
        Self {
            job_instance_id,
            server_ip,
            labels: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn id(&self) -> &str {
        &self.job_instance_id
    }

    pub fn server_ip(&self) -> &str {
        &self.server_ip
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl fmt::Display for JobInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_instance_id)
    }
}

/// Host part of an instance id.
pub fn server_ip_of(job_instance_id: &str) -> &str {
    job_instance_id
        .split_once(JobInstance::DELIMITER)
        .map(|(ip, _)| ip)
        .unwrap_or(job_instance_id)
}

/// Payload of the ephemeral `instances/{id}` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(flatten)]
    pub instance: JobInstance,
    pub registered_at: DateTime<Utc>,
}

/// Written into an instance node to ask that instance to run its job once.
pub const TRIGGER: &str = "TRIGGER";

#[derive(Clone)]
pub struct InstanceService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    instance: JobInstance,
    servers: ServerService,
}

impl InstanceService {
    pub fn new(
        storage: JobNodeStorage,
        job_registry: Arc<JobRegistry>,
        instance: JobInstance,
        servers: ServerService,
    ) -> Self {
        Self {
            storage,
            job_registry,
            instance,
            servers,
        }
    }

    pub fn local_instance(&self) -> &JobInstance {
        &self.instance
    }

    /// Publish this instance as online (ephemeral node).
    pub async fn persist_online(&self) -> Result<()> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(());
        }
        let info = InstanceInfo {
            instance: self.instance.clone(),
            registered_at: Utc::now(),
        };
        self.storage
            .fill_ephemeral_job_node(&path::instance_node(self.instance.id()), &serde_json::to_string(&info)?)
            .await?;
        tracing::info!(job = %self.storage.job_name(), instance = %self.instance, "Instance online");
        Ok(())
    }

    pub async fn remove_instance(&self) -> Result<()> {
        self.storage
            .remove_job_node_if_existed(&path::instance_node(self.instance.id()))
            .await
    }

    /// Online instances whose host is enabled, sorted by id.
    pub async fn get_available_job_instances(&self) -> Result<Vec<JobInstance>> {
        let mut result = Vec::new();
        for id in self.storage.get_job_node_children_keys(path::INSTANCES).await? {
            let instance = self.load_instance(&id).await?;
            if self.servers.is_enable_server(instance.server_ip()).await? {
                result.push(instance);
            }
        }
        result.sort();
        Ok(result)
    }

    pub async fn is_online(&self, job_instance_id: &str) -> Result<bool> {
        self.storage
            .is_job_node_existed(&path::instance_node(job_instance_id))
            .await
    }

    pub async fn is_local_instance_online(&self) -> Result<bool> {
        self.is_online(self.instance.id()).await
    }

    /// Ask every online instance to run the job once.
    pub async fn trigger_all_instances(&self) -> Result<()> {
        for id in self.storage.get_job_node_children_keys(path::INSTANCES).await? {
            self.storage
                .update_job_node(&path::instance_node(&id), TRIGGER)
                .await?;
        }
        Ok(())
    }

    async fn load_instance(&self, id: &str) -> Result<JobInstance> {
        let data = self
            .storage
            .get_job_node_data(&path::instance_node(id))
            .await?
            .unwrap_or_default();
        // Labels are best effort: a node holding TRIGGER still names its id.
        Ok(serde_json::from_str::<InstanceInfo>(&data)
            .map(|info| info.instance)
            .unwrap_or_else(|_| JobInstance::from_id(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_joins_ip_and_discriminator() {
        let instance = JobInstance::with_discriminator("10.0.0.1", 42);
        assert_eq!(instance.id(), "10.0.0.1@-@42");
        assert_eq!(instance.server_ip(), "10.0.0.1");
        assert_eq!(instance.to_string(), "10.0.0.1@-@42");
    }

    #[test]
    fn instance_from_id_recovers_server_ip() {
        let instance = JobInstance::from_id("192.168.1.7@-@1001");
        assert_eq!(instance.server_ip(), "192.168.1.7");
        assert_eq!(server_ip_of("no-delimiter"), "no-delimiter");
    }

    #[test]
    fn instances_order_by_id() {
        let mut instances = vec![
            JobInstance::with_discriminator("10.0.0.2", 1),
            JobInstance::with_discriminator("10.0.0.1", 2),
            JobInstance::with_discriminator("10.0.0.1", 1),
        ];
        instances.sort();
        let ids: Vec<&str> = instances.iter().map(JobInstance::id).collect();
        assert_eq!(ids, vec!["10.0.0.1@-@1", "10.0.0.1@-@2", "10.0.0.2@-@1"]);
    }

    #[test]
    fn instance_info_json_round_trips() {
        let info = InstanceInfo {
            instance: JobInstance::with_discriminator("10.0.0.1", 7).with_labels(vec!["gpu".into()]),
            registered_at: Utc::now(),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"jobInstanceId\":\"10.0.0.1@-@7\""));
        let parsed: InstanceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.instance.labels(), &["gpu".to_string()]);
    }
}
