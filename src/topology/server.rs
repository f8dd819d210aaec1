use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ElasticError, Result};
use crate::job_registry::JobRegistry;
use crate::storage::{path, JobNodeStorage};
use crate::topology::instance::server_ip_of;

/// Administrative state of a host, stored in `servers/{ip}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Enabled,
    Disabled,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Enabled => "ENABLED",
            ServerStatus::Disabled => "DISABLED",
        }
    }

    /// Anything but `DISABLED` counts as enabled, including an empty node.
    pub fn from_node_data(data: &str) -> Self {
        if data.trim().eq_ignore_ascii_case("DISABLED") {
            ServerStatus::Disabled
        } else {
            ServerStatus::Enabled
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerStatus {
    type Err = ElasticError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ENABLED" => Ok(ServerStatus::Enabled),
            "DISABLED" => Ok(ServerStatus::Disabled),
            other => Err(ElasticError::InvalidConfig(format!("unknown server status '{}'", other))),
        }
    }
}

/// Per-host registration and availability checks.
#[derive(Clone)]
pub struct ServerService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    local_ip: String,
}

impl ServerService {
    pub fn new(storage: JobNodeStorage, job_registry: Arc<JobRegistry>, local_ip: impl Into<String>) -> Self {
        Self {
            storage,
            job_registry,
            local_ip: local_ip.into(),
        }
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    /// Publish this host with the given administrative state.
    pub async fn persist_online(&self, enabled: bool) -> Result<()> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(());
        }
        let status = if enabled {
            ServerStatus::Enabled
        } else {
            ServerStatus::Disabled
        };
        self.storage
            .fill_job_node(&path::server_node(&self.local_ip), status.as_str())
            .await?;
        tracing::info!(job = %self.storage.job_name(), ip = %self.local_ip, %status, "Server online");
        Ok(())
    }

    /// Set the administrative state of any host.
    pub async fn set_status(&self, ip: &str, status: ServerStatus) -> Result<()> {
        self.storage
            .fill_job_node(&path::server_node(ip), status.as_str())
            .await
    }

    pub async fn has_available_servers(&self) -> Result<bool> {
        for ip in self.storage.get_job_node_children_keys(path::SERVERS).await? {
            if self.is_available_server(&ip).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enabled and running at least one online instance.
    pub async fn is_available_server(&self, ip: &str) -> Result<bool> {
        Ok(self.is_enable_server(ip).await? && self.has_online_instances(ip).await?)
    }

    /// Only an explicit `DISABLED` disables a host; a missing node does not.
    pub async fn is_enable_server(&self, ip: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_job_node_data(&path::server_node(ip))
            .await?
            .map(|data| ServerStatus::from_node_data(&data) == ServerStatus::Enabled)
            .unwrap_or(true))
    }

    pub async fn is_local_server_enabled(&self) -> Result<bool> {
        self.is_enable_server(&self.local_ip).await
    }

    pub async fn has_online_instances(&self, ip: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_job_node_children_keys(path::INSTANCES)
            .await?
            .iter()
            .any(|id| server_ip_of(id) == ip))
    }

    /// Prune host nodes that no longer run any instance.
    pub async fn remove_offline_servers(&self) -> Result<()> {
        let instances = self.storage.get_job_node_children_keys(path::INSTANCES).await?;
        for ip in self.storage.get_job_node_children_keys(path::SERVERS).await? {
            if !instances.iter().any(|id| server_ip_of(id) == ip) {
                self.storage
                    .remove_job_node_if_existed(&path::server_node(&ip))
                    .await?;
                tracing::info!(job = %self.storage.job_name(), %ip, "Removed offline server");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_parsing() {
        assert_eq!(ServerStatus::from_node_data(""), ServerStatus::Enabled);
        assert_eq!(ServerStatus::from_node_data("ENABLED"), ServerStatus::Enabled);
        assert_eq!(ServerStatus::from_node_data("DISABLED"), ServerStatus::Disabled);
        assert_eq!("disabled".parse::<ServerStatus>().unwrap(), ServerStatus::Disabled);
        assert!("paused".parse::<ServerStatus>().is_err());
        assert_eq!(ServerStatus::Enabled.to_string(), "ENABLED");
    }

    #[tokio::test]
    async fn offline_servers_are_pruned() {
        let server = crate::registry::MemoryRegistryServer::new();
        let storage = JobNodeStorage::new(server.connect(), "job");
        let job_registry = JobRegistry::new();
        job_registry
            .register_job("job", crate::topology::JobInstance::new("10.0.0.1"), 1)
            .unwrap();
        let servers = ServerService::new(storage.clone(), job_registry, "10.0.0.1");

        servers.persist_online(true).await.unwrap();
        servers.set_status("10.0.0.2", ServerStatus::Disabled).await.unwrap();
        storage
            .fill_ephemeral_job_node(&path::instance_node("10.0.0.1@-@42"), "")
            .await
            .unwrap();

        assert!(servers.is_available_server("10.0.0.1").await.unwrap());
        assert!(!servers.is_available_server("10.0.0.2").await.unwrap());
        // Hosts never seen count as enabled.
        assert!(servers.is_enable_server("10.0.0.3").await.unwrap());

        servers.remove_offline_servers().await.unwrap();
        assert!(storage.is_job_node_existed(&path::server_node("10.0.0.1")).await.unwrap());
        assert!(!storage.is_job_node_existed(&path::server_node("10.0.0.2")).await.unwrap());
        assert!(servers.has_available_servers().await.unwrap());
    }
}
