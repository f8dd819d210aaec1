//! In-process registry center.
//!
//! A `MemoryRegistryServer` plays the role of the coordination cluster and
//! hands out `MemoryRegistryCenter` clients, each with its own session. It is
//! used for the standalone mode and to simulate a fleet inside one test
//! process: expiring a client's session drops its ephemeral nodes exactly as
//! a crashed process would.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, OwnedMutexGuard};

use super::{
    ancestors, path_matches, ConnectionState, DistributedLock, NodeEvent, NodeEventKind,
    RegistryCenter, WatchReceiver,
};
use crate::error::{ElasticError, Result};

#[derive(Debug, Clone)]
struct MemoryNode {
    data: String,
    owner: Option<u64>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

#[derive(Default)]
struct ServerState {
    nodes: BTreeMap<String, MemoryNode>,
    watchers: Vec<Watcher>,
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    next_session: u64,
}

impl ServerState {
    fn next_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn dispatch(&mut self, events: Vec<NodeEvent>) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            for event in events.iter().filter(|e| path_matches(&watcher.prefix, &e.path)) {
                if watcher.tx.send(event.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }

    fn upsert(&mut self, key: &str, value: &str, owner: Option<u64>) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        for ancestor in ancestors(key) {
            if !self.nodes.contains_key(&ancestor) {
                self.nodes.insert(
                    ancestor.clone(),
                    MemoryNode {
                        data: String::new(),
                        owner: None,
                    },
                );
                events.push(NodeEvent::new(NodeEventKind::Created, ancestor, ""));
            }
        }
        let kind = match self.nodes.get(key) {
            Some(_) => NodeEventKind::Updated,
            None => NodeEventKind::Created,
        };
        self.nodes.insert(
            key.to_string(),
            MemoryNode {
                data: value.to_string(),
                owner,
            },
        );
        events.push(NodeEvent::new(kind, key, value));
        events
    }

    fn remove_subtree(&mut self, key: &str) -> Vec<NodeEvent> {
        let mut doomed: Vec<String> = self
            .nodes
            .range(key.to_string()..)
            .take_while(|(path, _)| path.starts_with(key))
            .filter(|(path, _)| path_matches(key, path))
            .map(|(path, _)| path.clone())
            .collect();
        // Children are reported before their parents.
        doomed.sort_by(|a, b| b.matches('/').count().cmp(&a.matches('/').count()).then(a.cmp(b)));
        doomed
            .into_iter()
            .filter_map(|path| {
                self.nodes
                    .remove(&path)
                    .map(|node| NodeEvent::new(NodeEventKind::Removed, path, node.data))
            })
            .collect()
    }

    fn remove_session_nodes(&mut self, session: u64) -> Vec<NodeEvent> {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        owned
            .iter()
            .flat_map(|path| self.remove_subtree(path))
            .collect()
    }
}

/// The shared namespace all in-process clients talk to.
#[derive(Clone, Default)]
pub struct MemoryRegistryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryRegistryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client with a fresh session.
    pub fn connect(&self) -> Arc<MemoryRegistryCenter> {
        let session = self.state.lock().next_session();
        let (states, _) = broadcast::channel(16);
        Arc::new(MemoryRegistryCenter {
            state: self.state.clone(),
            session: AtomicU64::new(session),
            connected: AtomicBool::new(true),
            states,
        })
    }

    /// Every node currently stored, keyed by path.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .nodes
            .iter()
            .map(|(path, node)| (path.clone(), node.data.clone()))
            .collect()
    }
}

/// A client session against a `MemoryRegistryServer`.
pub struct MemoryRegistryCenter {
    state: Arc<Mutex<ServerState>>,
    session: AtomicU64,
    connected: AtomicBool,
    states: broadcast::Sender<ConnectionState>,
}

impl MemoryRegistryCenter {
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Drop the connection without ending the session.
    pub fn suspend(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.states.send(ConnectionState::Suspended);
    }

    /// End the session as if it timed out: its ephemeral nodes are removed
    /// and the client stays disconnected until `reconnect`.
    pub fn expire_session(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.states.send(ConnectionState::Lost);
        let session = self.session_id();
        let mut state = self.state.lock();
        let events = state.remove_session_nodes(session);
        state.dispatch(events);
    }

    /// Establish a new session after `suspend` or `expire_session`.
    pub fn reconnect(&self) {
        let session = self.state.lock().next_session();
        self.session.store(session, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.states.send(ConnectionState::Reconnected);
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ElasticError::SessionExpired)
        }
    }

    fn write(&self, key: &str, value: &str, ephemeral: bool) -> Result<()> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        let owner = ephemeral.then(|| self.session_id());
        let mut state = self.state.lock();
        let events = state.upsert(&key, value, owner);
        state.dispatch(events);
        Ok(())
    }
}

struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RegistryCenter for MemoryRegistryCenter {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        Ok(self.state.lock().nodes.get(&key).map(|node| node.data.clone()))
    }

    async fn is_existed(&self, key: &str) -> Result<bool> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        Ok(self.state.lock().nodes.contains_key(&key))
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let prefix = format!("{}/", normalize(key)?);
        let state = self.state.lock();
        let children = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| &path[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(String::from)
            .collect();
        Ok(children)
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, value, false)
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get_mut(&key) else {
            return Ok(false);
        };
        node.data = value.to_string();
        let event = NodeEvent::new(NodeEventKind::Updated, key, value);
        state.dispatch(vec![event]);
        Ok(true)
    }

    async fn persist_ephemeral(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, value, true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        let mut state = self.state.lock();
        let events = state.remove_subtree(&key);
        state.dispatch(events);
        Ok(())
    }

    async fn acquire_lock(&self, key: &str) -> Result<Box<dyn DistributedLock>> {
        self.ensure_connected()?;
        let key = normalize(key)?;
        let mutex = self
            .state
            .lock()
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        Ok(Box::new(MemoryLock { _guard: guard }))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let prefix = normalize(prefix)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher { prefix, tx });
        Ok(rx)
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.states.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let session = self.session_id();
            let mut state = self.state.lock();
            let events = state.remove_session_nodes(session);
            state.dispatch(events);
        }
        Ok(())
    }
}

fn normalize(key: &str) -> Result<String> {
    let trimmed = key.trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.contains("//") {
        return Err(ElasticError::Registry(format!("invalid registry path '{}'", key)));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn persist_creates_ancestors() {
        let server = MemoryRegistryServer::new();
        let client = server.connect();
        client.persist("/job/sharding/0/instance", "a").await.unwrap();

        assert!(client.is_existed("/job").await.unwrap());
        assert!(client.is_existed("/job/sharding/0").await.unwrap());
        assert_eq!(
            client.get("/job/sharding/0/instance").await.unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(client.get_children_keys("/job/sharding").await.unwrap(), vec!["0"]);
    }

    #[tokio::test]
    async fn children_are_sorted_and_direct_only() {
        let server = MemoryRegistryServer::new();
        let client = server.connect();
        client.persist("/job/instances/b", "").await.unwrap();
        client.persist("/job/instances/a", "").await.unwrap();
        client.persist("/job/instances/a/nested", "").await.unwrap();
        client.persist("/job/instancesX", "").await.unwrap();

        assert_eq!(
            client.get_children_keys("/job/instances").await.unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(client.get_num_children("/job/instances").await.unwrap(), 2);
        assert!(client.get_children_keys("/missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_drops_subtree_children_first() {
        let server = MemoryRegistryServer::new();
        let client = server.connect();
        client.persist("/job/guarantee/started/0", "").await.unwrap();
        client.persist("/job/guarantee/started/1", "").await.unwrap();
        let mut rx = client.watch("/job/guarantee").await.unwrap();

        client.remove("/job/guarantee/started").await.unwrap();

        let mut removed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.kind, NodeEventKind::Removed);
            removed.push(event.path);
        }
        assert_eq!(removed.last().map(String::as_str), Some("/job/guarantee/started"));
        assert_eq!(removed.len(), 3);
        assert!(!client.is_existed("/job/guarantee/started").await.unwrap());
        assert!(client.is_existed("/job/guarantee").await.unwrap());
    }

    #[tokio::test]
    async fn expired_session_drops_only_its_ephemeral_nodes() {
        let server = MemoryRegistryServer::new();
        let a = server.connect();
        let b = server.connect();
        a.persist_ephemeral("/job/instances/a", "").await.unwrap();
        b.persist_ephemeral("/job/instances/b", "").await.unwrap();
        a.persist("/job/servers/10.0.0.1", "ENABLED").await.unwrap();

        let mut states = a.connection_states();
        a.expire_session();

        assert_eq!(states.recv().await.unwrap(), ConnectionState::Lost);
        assert!(!a.is_connected());
        assert!(a.get("/job/instances/b").await.is_err());
        assert!(!b.is_existed("/job/instances/a").await.unwrap());
        assert!(b.is_existed("/job/instances/b").await.unwrap());
        assert!(b.is_existed("/job/servers/10.0.0.1").await.unwrap());

        a.reconnect();
        assert_eq!(states.recv().await.unwrap(), ConnectionState::Reconnected);
        assert!(a.is_existed("/job/instances/b").await.unwrap());
    }

    #[tokio::test]
    async fn watch_reports_create_update_remove() {
        let server = MemoryRegistryServer::new();
        let client = server.connect();
        client.persist("/job/config", "v1").await.unwrap();
        let mut rx = client.watch("/job/config").await.unwrap();

        client.persist("/job/config", "v2").await.unwrap();
        client.remove("/job/config").await.unwrap();
        client.persist("/job/configX", "ignored").await.unwrap();

        let updated = rx.recv().await.unwrap();
        assert_eq!(updated.kind, NodeEventKind::Updated);
        assert_eq!(updated.data, "v2");
        let removed = rx.recv().await.unwrap();
        assert_eq!(removed.kind, NodeEventKind::Removed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_keeps_ephemeral_owner() {
        let server = MemoryRegistryServer::new();
        let owner = server.connect();
        let other = server.connect();
        owner.persist_ephemeral("/job/instances/a", "info").await.unwrap();

        assert!(other.update("/job/instances/a", "TRIGGER").await.unwrap());
        assert!(!other.update("/job/instances/missing", "TRIGGER").await.unwrap());

        other.expire_session();
        assert!(owner.is_existed("/job/instances/a").await.unwrap());
        owner.expire_session();
        other.reconnect();
        assert!(!other.is_existed("/job/instances/a").await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_mutually_exclusive_across_sessions() {
        let server = MemoryRegistryServer::new();
        let a = server.connect();
        let b = server.connect();

        let held = a.acquire_lock("/job/leader/election/latch").await.unwrap();
        let waiting = tokio::spawn(async move {
            let lock = b.acquire_lock("/job/leader/election/latch").await.unwrap();
            lock.release().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished(), "second session must wait for the lock");

        held.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("lock should be handed over")
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_relative_paths() {
        let server = MemoryRegistryServer::new();
        let client = server.connect();
        assert!(client.persist("job/config", "").await.is_err());
    }
}
