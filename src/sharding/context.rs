use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::topology::JobInstance;

/// What one instance should execute in one run of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingContexts {
    pub task_id: String,
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Items of this instance mapped to their configured parameter.
    pub sharding_item_parameters: BTreeMap<u32, String>,
    /// Whether these items were taken over from a crashed instance.
    pub failover: bool,
}

impl ShardingContexts {
    pub fn new(
        job_name: &str,
        instance: &JobInstance,
        sharding_total_count: u32,
        job_parameter: &str,
        sharding_item_parameters: BTreeMap<u32, String>,
        failover: bool,
    ) -> Self {
        let items: Vec<String> = sharding_item_parameters.keys().map(u32::to_string).collect();
        let task_id = [
            job_name.to_string(),
            items.join(","),
            if failover { "FAILOVER" } else { "READY" }.to_string(),
            instance.id().to_string(),
            Uuid::new_v4().to_string(),
        ]
        .join(JobInstance::DELIMITER);
        Self {
            task_id,
            job_name: job_name.to_string(),
            sharding_total_count,
            job_parameter: job_parameter.to_string(),
            sharding_item_parameters,
            failover,
        }
    }

    pub fn items(&self) -> Vec<u32> {
        self.sharding_item_parameters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sharding_item_parameters.is_empty()
    }

    /// The view handed to an executor for a single item.
    pub fn item_context(&self, item: u32) -> ShardingContext {
        ShardingContext {
            task_id: self.task_id.clone(),
            job_name: self.job_name.clone(),
            sharding_total_count: self.sharding_total_count,
            job_parameter: self.job_parameter.clone(),
            sharding_item: item,
            sharding_parameter: self
                .sharding_item_parameters
                .get(&item)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingContext {
    pub task_id: String,
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    pub sharding_item: u32,
    pub sharding_parameter: String,
}
