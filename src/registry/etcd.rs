//! Etcd-backed registry center.
//!
//! Sessions are leases: ephemeral nodes are written with the session lease
//! and vanish when keep-alive stops. The hierarchy is emulated by creating
//! empty ancestor keys, so child listing and subtree removal behave like the
//! in-memory registry.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, Event, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, LockOptions, PutOptions, Txn, TxnOp, WatchOptions, WatchStream, Watcher,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    ancestors, path_matches, ConnectionState, DistributedLock, NodeEvent, NodeEventKind,
    RegistryCenter, WatchReceiver,
};
use crate::config::EtcdConfig;
use crate::error::{ElasticError, Result};

pub struct EtcdRegistryCenter {
    client: Client,
    config: EtcdConfig,
    lease_id: Arc<AtomicI64>,
    connected: Arc<AtomicBool>,
    states: broadcast::Sender<ConnectionState>,
    session_token: CancellationToken,
}

impl EtcdRegistryCenter {
    /// Connect with exponential backoff and open a session lease.
    pub async fn connect(config: EtcdConfig) -> Result<Arc<Self>> {
        let mut client = connect_with_backoff(&config).await?;
        let lease_id = client.lease_grant(config.session_ttl, None).await?.id();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        info!(lease_id, ttl = config.session_ttl, namespace = %config.namespace, "Registry session opened");

        let (states, _) = broadcast::channel(16);
        let registry = Arc::new(Self {
            client,
            config,
            lease_id: Arc::new(AtomicI64::new(lease_id)),
            connected: Arc::new(AtomicBool::new(true)),
            states,
            session_token: CancellationToken::new(),
        });
        registry.spawn_session_task(keeper, stream);
        Ok(registry)
    }

    fn key(&self, path: &str) -> String {
        format!("/{}{}", self.config.namespace.trim_matches('/'), path.trim_end_matches('/'))
    }

    fn lease(&self) -> i64 {
        self.lease_id.load(Ordering::SeqCst)
    }

    /// Keep the session lease alive; when it is lost, announce it and keep
    /// trying to open a new one.
    fn spawn_session_task(&self, keeper: LeaseKeeper, stream: LeaseKeepAliveStream) {
        let mut client = self.client.clone();
        let config = self.config.clone();
        let lease_id = self.lease_id.clone();
        let connected = self.connected.clone();
        let states = self.states.clone();
        let token = self.session_token.clone();

        tokio::spawn(async move {
            let mut keeper = keeper;
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = keep_alive(&mut keeper, &mut stream, lease_id.load(Ordering::SeqCst), &config) => {}
                }

                connected.store(false, Ordering::SeqCst);
                let _ = states.send(ConnectionState::Lost);
                warn!(lease_id = lease_id.load(Ordering::SeqCst), "Registry session lost, re-granting");

                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                    }
                    let granted = match client.lease_grant(config.session_ttl, None).await {
                        Ok(resp) => resp.id(),
                        Err(e) => {
                            warn!(error = %e, "Lease grant failed, retrying");
                            continue;
                        }
                    };
                    match client.lease_keep_alive(granted).await {
                        Ok((new_keeper, new_stream)) => {
                            keeper = new_keeper;
                            stream = new_stream;
                            lease_id.store(granted, Ordering::SeqCst);
                            connected.store(true, Ordering::SeqCst);
                            let _ = states.send(ConnectionState::Reconnected);
                            info!(lease_id = granted, "Registry session re-established");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Lease keep-alive failed, retrying"),
                    }
                }
            }
        });
    }

    async fn ensure_ancestors(&self, path: &str) -> Result<()> {
        let mut client = self.client.clone();
        for ancestor in ancestors(path) {
            let key = self.key(&ancestor);
            let txn = Txn::new()
                .when(vec![Compare::create_revision(key.clone(), CompareOp::Equal, 0)])
                .and_then(vec![TxnOp::put(key, "", None)]);
            client.txn(txn).await?;
        }
        Ok(())
    }

    async fn put(&self, path: &str, value: &str, options: Option<PutOptions>) -> Result<()> {
        self.ensure_ancestors(path).await?;
        let mut client = self.client.clone();
        client.put(self.key(path), value, options).await?;
        Ok(())
    }
}

/// Forwards one etcd watch to a listener channel. A failed stream is
/// re-opened with backoff, resuming after the last revision delivered.
struct WatchFeed {
    client: Client,
    key: String,
    watched: String,
    namespace: String,
    config: EtcdConfig,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl WatchFeed {
    async fn run(mut self, watcher: Watcher, stream: WatchStream) {
        let mut current = Some((watcher, stream));
        let mut last_revision = 0;
        let mut backoff = self.backoff();

        loop {
            let (_watcher, mut stream) = match current.take() {
                Some(opened) => opened,
                None => {
                    let Some(delay) = backoff.next_backoff() else {
                        error!(prefix = %self.watched, "Giving up re-opening watch");
                        return;
                    };
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = self.tx.closed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let mut options = WatchOptions::new().with_prefix().with_prev_key();
                    if last_revision > 0 {
                        options = options.with_start_revision(last_revision + 1);
                    }
                    match self.client.watch(self.key.clone(), Some(options)).await {
                        Ok(opened) => {
                            info!(prefix = %self.watched, last_revision, "Watch re-established");
                            opened
                        }
                        Err(e) => {
                            warn!(prefix = %self.watched, error = %e, "Watch re-open failed");
                            continue;
                        }
                    }
                }
            };

            loop {
                let message = tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = self.tx.closed() => return,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        warn!(prefix = %self.watched, "Watch stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(prefix = %self.watched, error = %e, "Watch stream failed");
                        break;
                    }
                };
                if resp.canceled() {
                    if resp.compact_revision() > 0 {
                        // The resume point was compacted away; continue from now.
                        warn!(prefix = %self.watched, compact_revision = resp.compact_revision(), "Watch revision compacted");
                        last_revision = 0;
                    } else {
                        warn!(prefix = %self.watched, "Watch stream canceled");
                    }
                    break;
                }
                backoff.reset();
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    last_revision = last_revision.max(kv.mod_revision());
                    if let Some(node_event) = self.node_event(event) {
                        if self.tx.send(node_event).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn node_event(&self, event: &Event) -> Option<NodeEvent> {
        let kv = event.kv()?;
        let key = kv.key_str().ok()?;
        let path = key.strip_prefix(self.namespace.as_str())?;
        if !path_matches(&self.watched, path) {
            return None;
        }
        let node_event = match event.event_type() {
            EventType::Put => {
                let kind = if kv.version() == 1 {
                    NodeEventKind::Created
                } else {
                    NodeEventKind::Updated
                };
                NodeEvent::new(kind, path, kv.value_str().unwrap_or_default())
            }
            EventType::Delete => {
                let data = event
                    .prev_kv()
                    .and_then(|prev| prev.value_str().ok())
                    .unwrap_or_default();
                NodeEvent::new(NodeEventKind::Removed, path, data)
            }
        };
        Some(node_event)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.backoff_initial,
            max_interval: self.config.backoff_max,
            max_elapsed_time: None,
            multiplier: self.config.backoff_multiplier,
            ..Default::default()
        }
    }
}

async fn connect_with_backoff(config: &EtcdConfig) -> Result<Client> {
    let backoff = ExponentialBackoff {
        initial_interval: config.backoff_initial,
        max_interval: config.backoff_max,
        max_elapsed_time: Some(config.backoff_max_elapsed),
        multiplier: config.backoff_multiplier,
        ..Default::default()
    };
    let endpoints = config.endpoints.clone();

    retry(backoff, || async {
        match Client::connect(&endpoints, None).await {
            Ok(client) => {
                debug!("Connected to etcd");
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, "etcd connection failed, retrying");
                Err(backoff::Error::transient(e))
            }
        }
    })
    .await
    .map_err(ElasticError::from)
}

/// Returns once the lease can no longer be kept alive.
async fn keep_alive(
    keeper: &mut LeaseKeeper,
    stream: &mut LeaseKeepAliveStream,
    lease_id: i64,
    config: &EtcdConfig,
) {
    let mut interval = tokio::time::interval(config.keepalive_interval);
    interval.tick().await;

    loop {
        interval.tick().await;

        if let Err(e) = keeper.keep_alive().await {
            error!(lease_id, error = %e, "Keep-alive send failed");
            return;
        }

        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {
                trace!(lease_id, ttl = resp.ttl(), "Keep-alive OK");
            }
            Ok(Some(_)) => {
                error!(lease_id, "Lease expired");
                return;
            }
            Ok(None) => {
                error!(lease_id, "Keep-alive stream closed");
                return;
            }
            Err(e) => {
                error!(lease_id, error = %e, "Keep-alive failed");
                return;
            }
        }
    }
}

struct EtcdLock {
    client: Client,
    key: Vec<u8>,
}

#[async_trait]
impl DistributedLock for EtcdLock {
    async fn release(self: Box<Self>) -> Result<()> {
        let mut client = self.client.clone();
        client.unlock(self.key.clone()).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryCenter for EtcdRegistryCenter {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(self.key(key), None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str()?.to_string())),
            None => Ok(None),
        }
    }

    async fn is_existed(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.key(key), Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn get_children_keys(&self, key: &str) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let prefix = format!("{}/", self.key(key));
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix().with_keys_only()))
            .await?;
        let mut children = Vec::new();
        for kv in resp.kvs() {
            let rest = &kv.key_str()?[prefix.len()..];
            if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                children.push(child.to_string());
            }
        }
        children.sort();
        children.dedup();
        Ok(children)
    }

    async fn persist(&self, key: &str, value: &str) -> Result<()> {
        self.put(key, value, None).await
    }

    async fn update(&self, key: &str, value: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let key = self.key(key);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key.clone(), CompareOp::NotEqual, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_ignore_lease()),
            )]);
        Ok(client.txn(txn).await?.succeeded())
    }

    async fn persist_ephemeral(&self, key: &str, value: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ElasticError::SessionExpired);
        }
        let options = PutOptions::new().with_lease(self.lease());
        self.put(key, value, Some(options)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        let full = self.key(key);
        client
            .delete(format!("{}/", full), Some(DeleteOptions::new().with_prefix()))
            .await?;
        client.delete(full, None).await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str) -> Result<Box<dyn DistributedLock>> {
        let mut client = self.client.clone();
        let resp = client
            .lock(self.key(key), Some(LockOptions::new().with_lease(self.lease())))
            .await?;
        Ok(Box::new(EtcdLock {
            client: self.client.clone(),
            key: resp.key().to_vec(),
        }))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchReceiver> {
        let watched = prefix.trim_end_matches('/').to_string();
        let key = self.key(&watched);
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(key.clone(), Some(WatchOptions::new().with_prefix().with_prev_key()))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = WatchFeed {
            client,
            key,
            watched,
            namespace: format!("/{}", self.config.namespace.trim_matches('/')),
            config: self.config.clone(),
            token: self.session_token.clone(),
            tx,
        };
        tokio::spawn(feed.run(watcher, stream));
        Ok(rx)
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.states.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.session_token.cancel();
        self.connected.store(false, Ordering::SeqCst);
        let mut client = self.client.clone();
        let lease_id = self.lease();
        match client.lease_revoke(lease_id).await {
            Ok(_) => info!(lease_id, "Registry session closed"),
            Err(e) => warn!(lease_id, error = %e, "Lease revoke failed, ephemeral nodes expire with TTL"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_event(events: &mut WatchReceiver, path: &str, kind: NodeEventKind) -> NodeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event should arrive")
                .expect("watch should stay open");
            if event.path == path && event.kind == kind {
                return event;
            }
        }
    }

    #[tokio::test]
    #[ignore = "needs an etcd cluster at ETCD_ENDPOINTS"]
    async fn watch_delivers_node_lifecycle() {
        let mut config = EtcdConfig::from_env();
        config.namespace = format!("elastic-lite-test-{}", uuid::Uuid::new_v4());
        let registry = EtcdRegistryCenter::connect(config).await.unwrap();

        let mut events = registry.watch("/job/instances").await.unwrap();
        registry.persist_ephemeral("/job/instances/a", "one").await.unwrap();
        let created = next_event(&mut events, "/job/instances/a", NodeEventKind::Created).await;
        assert_eq!(created.data, "one");

        registry.update("/job/instances/a", "two").await.unwrap();
        let updated = next_event(&mut events, "/job/instances/a", NodeEventKind::Updated).await;
        assert_eq!(updated.data, "two");

        registry.remove("/job").await.unwrap();
        let removed = next_event(&mut events, "/job/instances/a", NodeEventKind::Removed).await;
        assert_eq!(removed.data, "two");

        registry.close().await.unwrap();
    }
}
