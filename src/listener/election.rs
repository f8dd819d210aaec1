use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;
use crate::topology::ServerStatus;

/// Re-elects when the leader node disappears, elects when the local host
/// comes (back) online and steps down when the local host is disabled.
pub struct ElectionListener {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
}

impl ElectionListener {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self { services, job_registry }
    }

    fn is_leader_removed(&self, event: &NodeEvent) -> bool {
        event.kind == NodeEventKind::Removed
            && event.path == self.services.storage.path().full_path(path::LEADER_INSTANCE)
    }

    fn local_server_status(&self, event: &NodeEvent) -> Option<ServerStatus> {
        let ip = self
            .services
            .storage
            .path()
            .child_name(path::SERVERS, &event.path)?;
        if ip != self.services.servers.local_ip() || event.kind == NodeEventKind::Removed {
            return None;
        }
        Some(ServerStatus::from_node_data(&event.data))
    }
}

#[async_trait]
impl JobListener for ElectionListener {
    fn name(&self) -> &'static str {
        "election"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![path::LEADER_INSTANCE.to_string(), path::SERVERS.to_string()]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        if self.job_registry.is_shutdown(self.services.job_name()) {
            return Ok(());
        }
        let leader = &self.services.leader;
        if self.is_leader_removed(event) {
            if self
                .services
                .servers
                .is_available_server(self.services.servers.local_ip())
                .await?
            {
                tracing::info!(job = %self.services.job_name(), "Leader gone, electing");
                leader.elect_leader().await?;
                // Items queued while nobody led are handed out now.
                if leader.is_leader().await? {
                    self.services.failover.failover_if_necessary().await?;
                }
            }
            return Ok(());
        }
        match self.local_server_status(event) {
            Some(ServerStatus::Enabled) if !leader.has_leader().await? => {
                leader.elect_leader().await?;
            }
            Some(ServerStatus::Disabled) if leader.is_leader().await? => {
                tracing::info!(job = %self.services.job_name(), "Local server disabled, stepping down");
                leader.remove_leader().await?;
            }
            _ => {}
        }
        Ok(())
    }
}
