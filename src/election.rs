//! Leader election.
//!
//! The leader is whoever owns the ephemeral `leader/election/instance` node.
//! Candidates create it under the election latch only when it is absent, so
//! at most one instance holds it at a time. When the leader's session ends
//! the node vanishes and the election listener of every live instance runs
//! `elect_leader` again.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;
use crate::job_registry::JobRegistry;
use crate::storage::{path, JobNodeStorage};
use crate::topology::{JobInstance, ServerService};

#[derive(Clone)]
pub struct LeaderService {
    storage: JobNodeStorage,
    job_registry: Arc<JobRegistry>,
    instance: JobInstance,
    servers: ServerService,
    poll_interval: Duration,
}

impl LeaderService {
    pub fn new(
        storage: JobNodeStorage,
        job_registry: Arc<JobRegistry>,
        instance: JobInstance,
        servers: ServerService,
        poll_interval: Duration,
    ) -> Self {
        Self {
            storage,
            job_registry,
            instance,
            servers,
            poll_interval,
        }
    }

    /// Try to become leader. Only creates the leader node when nobody holds it.
    pub async fn elect_leader(&self) -> Result<()> {
        let job = self.storage.job_name().to_string();
        tracing::debug!(job = %job, instance = %self.instance, "Electing leader");
        self.storage
            .execute_in_leader(path::LEADER_LATCH, || async {
                if self.job_registry.is_shutdown(&job) {
                    return Ok(());
                }
                if !self.storage.is_job_node_existed(path::LEADER_INSTANCE).await? {
                    self.storage
                        .fill_ephemeral_job_node(path::LEADER_INSTANCE, self.instance.id())
                        .await?;
                    tracing::info!(job = %job, instance = %self.instance, "Elected as leader");
                }
                Ok(())
            })
            .await
    }

    pub async fn is_leader(&self) -> Result<bool> {
        if self.job_registry.is_shutdown(self.storage.job_name()) {
            return Ok(false);
        }
        Ok(self.leader_instance_id().await?.as_deref() == Some(self.instance.id()))
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.storage.is_job_node_existed(path::LEADER_INSTANCE).await
    }

    pub async fn leader_instance_id(&self) -> Result<Option<String>> {
        self.storage.get_job_node_data(path::LEADER_INSTANCE).await
    }

    /// Wait until some instance leads, electing this one if its host is
    /// available, then report whether this instance is the leader. Gives up
    /// waiting as soon as no host is available.
    pub async fn is_leader_until_block(&self) -> Result<bool> {
        while !self.has_leader().await? && self.servers.has_available_servers().await? {
            if self.job_registry.is_shutdown(self.storage.job_name()) {
                return Ok(false);
            }
            tracing::info!(job = %self.storage.job_name(), "Leader is electing, waiting");
            tokio::time::sleep(self.jittered_poll_interval()).await;
            if self.servers.is_available_server(self.servers.local_ip()).await? {
                self.elect_leader().await?;
            }
        }
        self.is_leader().await
    }

    /// Give up leadership if this instance holds it.
    pub async fn remove_leader(&self) -> Result<()> {
        self.storage
            .execute_in_leader(path::LEADER_LATCH, || async {
                if self.leader_instance_id().await?.as_deref() == Some(self.instance.id()) {
                    self.storage
                        .remove_job_node_if_existed(path::LEADER_INSTANCE)
                        .await?;
                    tracing::info!(job = %self.storage.job_name(), instance = %self.instance, "Leadership relinquished");
                }
                Ok(())
            })
            .await
    }

    fn jittered_poll_interval(&self) -> Duration {
        let base = self.poll_interval.as_millis().max(2) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(base / 2..=base))
    }
}
