//! Reactions to registry changes.
//!
//! Each listener watches a few job nodes. Every watched node gets its own
//! task that feeds events to the listener in order. All tasks hang off one
//! token, a child of the job's token, so they stop with `stop_all_listeners`
//! or when the job shuts down.

mod config;
mod connection;
mod election;
mod failover;
mod guarantee;
mod instance;
mod sharding;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{ElasticError, Result};
use crate::facade::JobServices;
use crate::job_registry::JobRegistry;
use crate::registry::{NodeEvent, WatchReceiver};

pub use config::ConfigurationListener;
pub use connection::ConnectionStateListener;
pub use election::ElectionListener;
pub use failover::FailoverListener;
pub use guarantee::GuaranteeListener;
pub use instance::InstanceListener;
pub use sharding::ShardingListener;

#[async_trait]
pub trait JobListener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Job-relative nodes whose subtrees this listener observes.
    fn watched_nodes(&self) -> Vec<String>;

    async fn on_event(&self, event: &NodeEvent) -> Result<()>;
}

fn spawn_listener(
    job_name: String,
    listener: Arc<dyn JobListener>,
    mut events: WatchReceiver,
    job_registry: Arc<JobRegistry>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if job_registry.is_shutdown(&job_name) {
                        break;
                    }
                    if let Err(e) = listener.on_event(&event).await {
                        tracing::warn!(
                            job = %job_name,
                            listener = listener.name(),
                            path = %event.path,
                            error = %e,
                            "Listener failed to handle event"
                        );
                    }
                }
            }
        }
        tracing::debug!(job = %job_name, listener = listener.name(), "Listener stopped");
    });
}

pub struct ListenerManager {
    services: JobServices,
    job_registry: Arc<JobRegistry>,
    token: Mutex<Option<CancellationToken>>,
}

impl ListenerManager {
    pub fn new(services: JobServices, job_registry: Arc<JobRegistry>) -> Self {
        Self {
            services,
            job_registry,
            token: Mutex::new(None),
        }
    }

    pub async fn start_all_listeners(&self) -> Result<()> {
        let job = self.services.job_name().to_string();
        let parent = self
            .job_registry
            .cancellation_token(&job)
            .ok_or_else(|| ElasticError::JobNotRegistered(job.clone()))?;
        let token = parent.child_token();

        let listeners: Vec<Arc<dyn JobListener>> = vec![
            Arc::new(ElectionListener::new(self.services.clone(), self.job_registry.clone())),
            Arc::new(ShardingListener::new(self.services.clone(), self.job_registry.clone())),
            Arc::new(FailoverListener::new(self.services.clone(), self.job_registry.clone())),
            Arc::new(GuaranteeListener::new(self.services.clone())),
            Arc::new(InstanceListener::new(self.services.clone(), self.job_registry.clone())),
            Arc::new(ConfigurationListener::new(self.services.clone(), self.job_registry.clone())),
        ];
        for listener in listeners {
            for node in listener.watched_nodes() {
                let events = self.services.storage.watch(&node).await?;
                spawn_listener(
                    job.clone(),
                    listener.clone(),
                    events,
                    self.job_registry.clone(),
                    token.clone(),
                );
            }
        }

        let connection = ConnectionStateListener::new(self.services.clone(), self.job_registry.clone());
        let mut states = self.services.storage.registry().connection_states();
        let connection_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = connection_token.cancelled() => break,
                    state = states.recv() => match state {
                        Ok(state) => {
                            if let Err(e) = connection.on_state(state).await {
                                tracing::warn!(error = %e, ?state, "Connection state handling failed");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Connection state events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        if let Some(previous) = self.token.lock().replace(token) {
            previous.cancel();
        }
        tracing::debug!(job = %job, "Listeners started");
        Ok(())
    }

    pub fn stop_all_listeners(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
            tracing::debug!(job = %self.services.job_name(), "Listeners stopped");
        }
    }
}
