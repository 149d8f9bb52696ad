//! Watch bridge.
//!
//! Wraps the list/watch machinery for one resource kind behind a typed
//! [`EventHandler`]. The bridge keeps a local read-only cache keyed by
//! `namespace/name`, re-lists through the watcher's own init protocol and
//! treats a bounded number of failed initial syncs as fatal to startup.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::Resource;
use kube_runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Attempts allowed for the initial list before startup is aborted.
pub const DEFAULT_SYNC_ATTEMPTS: u32 = 10;
const SYNC_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Typed callbacks dispatched by the bridge. Handlers run on the watch task,
/// so they should only translate events into queue keys, never block on
/// reconciliation work.
#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    async fn on_add(&self, obj: &K);
    async fn on_update(&self, old: &K, new: &K);
    async fn on_delete(&self, obj: &K);
}

/// Shared read view of the bridge's cache.
pub type Store<K> = Arc<RwLock<HashMap<String, K>>>;

/// `namespace/name` cache key for an object.
pub fn object_key<K>(obj: &K) -> String
where
    K: Resource,
    K::DynamicType: Default,
{
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

/// Bridges a watch stream for one kind into an [`EventHandler`].
pub struct WatchBridge<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    api: Api<K>,
    handler: Arc<dyn EventHandler<K>>,
    store: Store<K>,
    synced_tx: watch::Sender<bool>,
    sync_attempts: u32,
}

impl<K> WatchBridge<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    pub fn new(api: Api<K>, handler: Arc<dyn EventHandler<K>>) -> Self {
        Self::with_store(api, handler, Arc::new(RwLock::new(HashMap::new())))
    }

    /// Build against a caller-owned store, for when other components need
    /// read access to the cache before the bridge exists.
    pub fn with_store(api: Api<K>, handler: Arc<dyn EventHandler<K>>, store: Store<K>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            api,
            handler,
            store,
            synced_tx,
            sync_attempts: DEFAULT_SYNC_ATTEMPTS,
        }
    }

    /// Handle to the local cache. Contents are only meaningful once `run`
    /// has completed its first sync.
    pub fn store(&self) -> Store<K> {
        Arc::clone(&self.store)
    }

    /// Receiver that flips to `true` once the first full list has landed in
    /// the store. Startup sequencing waits on this rather than a fixed
    /// delay; the receiver errors out if the bridge dies before syncing.
    pub fn sync_complete(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Drive the watch until shutdown. Returns an error only when the
    /// initial sync cannot be completed within the attempt bound.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let stream = kube_runtime::watcher(self.api.clone(), watcher::Config::default()).boxed();
        drive(
            self.handler.as_ref(),
            &self.store,
            &self.synced_tx,
            self.sync_attempts,
            stream,
            shutdown,
        )
        .await
    }
}

/// Event pump behind [`WatchBridge::run`]: applies the stream to the store,
/// dispatches handler callbacks and flips the sync signal after the first
/// complete relist.
async fn drive<K>(
    handler: &dyn EventHandler<K>,
    store: &Store<K>,
    synced_tx: &watch::Sender<bool>,
    sync_attempts: u32,
    mut stream: impl Stream<Item = std::result::Result<Event<K>, watcher::Error>> + Unpin,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    K: Resource + Clone,
    K::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut synced = false;
    let mut failed_syncs = 0u32;
    // Objects accumulated between Init and InitDone; swapped into the
    // store atomically so readers never see a half-built relist.
    let mut pending: HashMap<String, K> = HashMap::new();

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => {
                info!(kind, "watch bridge stopping");
                return Ok(());
            }
            event = stream.next() => event,
        };

        match event {
            Some(Ok(Event::Init)) => {
                debug!(kind, "relist started");
                pending.clear();
            }
            Some(Ok(Event::InitApply(obj))) => {
                pending.insert(object_key(&obj), obj);
            }
            Some(Ok(Event::InitDone)) => {
                let fresh = std::mem::take(&mut pending);
                let stale = {
                    let mut store = store.write().await;
                    std::mem::replace(&mut *store, fresh.clone())
                };
                for (key, obj) in &fresh {
                    match stale.get(key) {
                        Some(old) => handler.on_update(old, obj).await,
                        None => handler.on_add(obj).await,
                    }
                }
                // Objects that vanished during a watch gap are reported
                // as deletes, with the last known object.
                for (key, obj) in &stale {
                    if !fresh.contains_key(key) {
                        handler.on_delete(obj).await;
                        debug!(kind, key, "pruned from cache after relist");
                    }
                }
                if !synced {
                    synced = true;
                    let _ = synced_tx.send(true);
                    info!(kind, objects = fresh.len(), "initial cache sync complete");
                }
            }
            Some(Ok(Event::Apply(obj))) => {
                let key = object_key(&obj);
                let old = store.write().await.insert(key, obj.clone());
                match old {
                    Some(old) => handler.on_update(&old, &obj).await,
                    None => handler.on_add(&obj).await,
                }
            }
            Some(Ok(Event::Delete(obj))) => {
                let key = object_key(&obj);
                store.write().await.remove(&key);
                handler.on_delete(&obj).await;
            }
            Some(Err(err)) => {
                if synced {
                    warn!(kind, error = %err, "watch error, stream will resume");
                    continue;
                }
                failed_syncs += 1;
                if failed_syncs >= sync_attempts {
                    error!(kind, attempts = failed_syncs, "initial cache sync failed");
                    return Err(Error::CacheSyncFailed { kind, attempts: failed_syncs });
                }
                warn!(
                    kind,
                    error = %err,
                    attempt = failed_syncs,
                    "initial list failed, retrying"
                );
                tokio::time::sleep(SYNC_RETRY_DELAY).await;
            }
            None => {
                // The watcher stream is unbounded; reaching the end means
                // the client is gone.
                warn!(kind, "watch stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hub;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<Hub> for RecordingHandler {
        async fn on_add(&self, obj: &Hub) {
            self.events.lock().unwrap().push(format!("add {}", object_key(obj)));
        }

        async fn on_update(&self, _old: &Hub, new: &Hub) {
            self.events.lock().unwrap().push(format!("update {}", object_key(new)));
        }

        async fn on_delete(&self, obj: &Hub) {
            self.events.lock().unwrap().push(format!("delete {}", object_key(obj)));
        }
    }

    fn hub(name: &str) -> Hub {
        Hub {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("hub-system".into()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn object_key_is_namespace_slash_name() {
        assert_eq!(object_key(&hub("t1")), "hub-system/t1");
    }

    #[tokio::test]
    async fn first_relist_fills_the_store_and_signals_sync() {
        let handler = RecordingHandler::default();
        let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
        let (synced_tx, synced_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let events: Vec<std::result::Result<Event<Hub>, watcher::Error>> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(hub("t1"))),
            Ok(Event::InitApply(hub("t2"))),
            Ok(Event::InitDone),
        ];
        drive(
            &handler,
            &store,
            &synced_tx,
            3,
            futures::stream::iter(events),
            shutdown_rx,
        )
        .await
        .unwrap();

        assert!(*synced_rx.borrow(), "sync signal should flip on the first InitDone");
        assert_eq!(store.read().await.len(), 2);
        let events = handler.events.lock().unwrap();
        assert!(events.contains(&"add hub-system/t1".to_string()));
        assert!(events.contains(&"add hub-system/t2".to_string()));
    }

    #[tokio::test]
    async fn relist_prunes_vanished_objects_as_deletes() {
        let handler = RecordingHandler::default();
        let store: Store<Hub> = Arc::new(RwLock::new(HashMap::new()));
        let (synced_tx, _synced_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let events: Vec<std::result::Result<Event<Hub>, watcher::Error>> = vec![
            Ok(Event::Init),
            Ok(Event::InitApply(hub("t1"))),
            Ok(Event::InitApply(hub("t2"))),
            Ok(Event::InitDone),
            // Watch gap: t2 is gone by the time the second list lands.
            Ok(Event::Init),
            Ok(Event::InitApply(hub("t1"))),
            Ok(Event::InitDone),
        ];
        drive(
            &handler,
            &store,
            &synced_tx,
            3,
            futures::stream::iter(events),
            shutdown_rx,
        )
        .await
        .unwrap();

        assert_eq!(store.read().await.len(), 1);
        let events = handler.events.lock().unwrap();
        assert!(events.contains(&"delete hub-system/t2".to_string()));
        assert!(events.contains(&"update hub-system/t1".to_string()));
    }
}
