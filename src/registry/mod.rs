//! Registry center abstraction.
//!
//! A hierarchical key/value namespace with persistent and ephemeral nodes,
//! prefix watches and a distributed lock. Paths are
//! absolute and `/`-separated. Creating a node creates its missing ancestors
//! as persistent, empty nodes; removing a node removes its whole subtree.
//!
//! Ephemeral nodes belong to the client's session and disappear when the
//! session ends. Watches survive session changes.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

pub use etcd::EtcdRegistryCenter;
pub use memory::{MemoryRegistryCenter, MemoryRegistryServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Created,
    Updated,
    Removed,
}

/// A change to a single node below a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub path: String,
    /// New data for created/updated nodes, last known data for removed ones.
    pub data: String,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, path: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            data: data.into(),
        }
    }
}

/// Session state reported by the registry client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The connection dropped; the session may still come back.
    Suspended,
    /// The session is gone and all its ephemeral nodes with it.
    Lost,
    /// A (possibly new) session is established again.
    Reconnected,
}

pub type WatchReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// A held distributed lock. Dropping without `release` also frees the lock
/// once the owning session ends.
#[async_trait]
pub trait DistributedLock: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait RegistryCenter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn is_existed(&self, key: &str) -> Result<bool>;

    /// Names (not full paths) of direct children, sorted ascending.
    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>>;

    async fn get_num_children(&self, key: &str) -> Result<usize> {
        Ok(self.get_children_keys(key).await?.len())
    }

    /// Create or overwrite a persistent node.
    async fn persist(&self, key: &str, value: &str) -> Result<()>;

    /// Replace the data of an existing node, keeping its owner. Returns
    /// `false` when the node does not exist.
    async fn update(&self, key: &str, value: &str) -> Result<bool>;

    /// Create or overwrite an ephemeral node owned by this session.
    async fn persist_ephemeral(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key` and everything below it. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Block until the lock at `key` is held by this session.
    async fn acquire_lock(&self, key: &str) -> Result<Box<dyn DistributedLock>>;

    /// Subscribe to changes of `prefix` and every node below it.
    async fn watch(&self, prefix: &str) -> Result<WatchReceiver>;

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState>;

    fn is_connected(&self) -> bool;

    /// End the session, dropping every ephemeral node it owns.
    async fn close(&self) -> Result<()>;
}

/// Whether `path` is `prefix` itself or lies below it.
pub(crate) fn path_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Every proper ancestor of `path`, outermost first.
pub(crate) fn ancestors(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        result.push(current.clone());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matches_prefix_on_segment_boundary() {
        assert!(path_matches("/job/servers", "/job/servers"));
        assert!(path_matches("/job/servers", "/job/servers/10.0.0.1"));
        assert!(path_matches("/job/servers/", "/job/servers/10.0.0.1"));
        assert!(!path_matches("/job/servers", "/job/serversX"));
        assert!(!path_matches("/job/servers", "/job"));
    }

    #[test]
    fn ancestors_are_listed_outermost_first() {
        assert_eq!(
            ancestors("/job/sharding/0/instance"),
            vec!["/job", "/job/sharding", "/job/sharding/0"]
        );
        assert!(ancestors("/job").is_empty());
    }
}
