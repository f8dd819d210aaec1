//! Registry layout of a job.
//!
//! Node names are relative to the job root `/{jobName}`; `JobNodePath`
//! turns them into absolute registry paths.

pub const CONFIG: &str = "config";
pub const SERVERS: &str = "servers";
pub const INSTANCES: &str = "instances";
pub const SHARDING: &str = "sharding";
pub const FAILOVER: &str = "failover";

pub const LEADER_INSTANCE: &str = "leader/election/instance";
pub const LEADER_LATCH: &str = "leader/election/latch";
pub const SHARDING_NECESSARY: &str = "leader/sharding/necessary";
pub const SHARDING_PROCESSING: &str = "leader/sharding/processing";
pub const FAILOVER_LATCH: &str = "leader/failover/latch";

pub const GUARANTEE_ROOT: &str = "guarantee";
pub const GUARANTEE_STARTED_ROOT: &str = "guarantee/started";
pub const GUARANTEE_COMPLETED_ROOT: &str = "guarantee/completed";
pub const GUARANTEE_STARTED_LATCH: &str = "guarantee/started-latch";
pub const GUARANTEE_COMPLETED_LATCH: &str = "guarantee/completed-latch";

pub fn server_node(ip: &str) -> String {
    format!("{}/{}", SERVERS, ip)
}

pub fn instance_node(instance_id: &str) -> String {
    format!("{}/{}", INSTANCES, instance_id)
}

pub fn sharding_item_node(item: u32) -> String {
    format!("{}/{}", SHARDING, item)
}

pub fn sharding_instance_node(item: u32) -> String {
    format!("{}/{}/instance", SHARDING, item)
}

pub fn running_node(item: u32) -> String {
    format!("{}/{}/running", SHARDING, item)
}

pub fn misfire_node(item: u32) -> String {
    format!("{}/{}/misfire", SHARDING, item)
}

pub fn disabled_node(item: u32) -> String {
    format!("{}/{}/disabled", SHARDING, item)
}

/// Claim marker written when an instance takes over a crashed item.
pub fn failover_claim_node(item: u32) -> String {
    format!("{}/{}/failover", SHARDING, item)
}

/// Queue entry for an item waiting to be failed over.
pub fn failover_queue_node(item: u32) -> String {
    format!("{}/{}", FAILOVER, item)
}

pub fn guarantee_started_node(item: u32) -> String {
    format!("{}/{}", GUARANTEE_STARTED_ROOT, item)
}

pub fn guarantee_completed_node(item: u32) -> String {
    format!("{}/{}", GUARANTEE_COMPLETED_ROOT, item)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    job_name: String,
}

impl JobNodePath {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// `/{jobName}`
    pub fn root(&self) -> String {
        format!("/{}", self.job_name)
    }

    /// Absolute path of a job-relative node.
    pub fn full_path(&self, node: &str) -> String {
        if node.is_empty() {
            self.root()
        } else {
            format!("/{}/{}", self.job_name, node)
        }
    }

    /// Job-relative node name of an absolute path below this job.
    pub fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.root().as_str())?.strip_prefix('/')
    }

    /// Last segment of `path` when it is a direct child of `parent_node`.
    pub fn child_name<'a>(&self, parent_node: &str, path: &'a str) -> Option<&'a str> {
        let rest = self.relative(path)?.strip_prefix(parent_node)?.strip_prefix('/')?;
        (!rest.is_empty() && !rest.contains('/')).then_some(rest)
    }

    /// Item index of a `sharding/{item}/{leaf}` path.
    pub fn sharding_item_of(&self, path: &str, leaf: &str) -> Option<u32> {
        let rest = self.relative(path)?.strip_prefix(SHARDING)?.strip_prefix('/')?;
        let (item, tail) = rest.split_once('/')?;
        (tail == leaf).then(|| item.parse().ok()).flatten()
    }
}
