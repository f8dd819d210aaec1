use async_trait::async_trait;

use crate::error::Result;
use crate::facade::JobServices;
use crate::listener::JobListener;
use crate::registry::{NodeEvent, NodeEventKind};
use crate::storage::path;

/// Releases local barrier waiters when a barrier root is deleted.
pub struct GuaranteeListener {
    services: JobServices,
}

impl GuaranteeListener {
    pub fn new(services: JobServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobListener for GuaranteeListener {
    fn name(&self) -> &'static str {
        "guarantee"
    }

    fn watched_nodes(&self) -> Vec<String> {
        vec![path::GUARANTEE_ROOT.to_string()]
    }

    async fn on_event(&self, event: &NodeEvent) -> Result<()> {
        if event.kind != NodeEventKind::Removed {
            return Ok(());
        }
        if let Some(phase) = self.services.guarantee.barrier_of(&event.path) {
            self.services.guarantee.notify_released(phase);
        }
        Ok(())
    }
}
