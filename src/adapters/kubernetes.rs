//! Kubernetes Adapters
//!
//! Implements the cache and mutation ports on top of kube-rs: a reflector
//! store fed by a watcher stream, and a thin writer over `Api<K>`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::Storage;
use crate::domain::ports::{CacheEvent, EventHandler, ObjectCache, ObjectWriter};
use crate::error::{Error, Result};

/// Field manager recorded on every write the provisioner makes
pub const FIELD_MANAGER: &str = "storage-provisioner";

/// Bounds shared by every kind the adapters handle
pub trait CachedResource:
    Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static
{
}

impl<K> CachedResource for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

// =============================================================================
// Cache
// =============================================================================

/// Watch-backed cache of one object kind across all namespaces.
///
/// [`run`](Self::run) must be driven for the cache to fill; until the
/// initial listing completes [`has_synced`](ObjectCache::has_synced) is false.
pub struct KubeObjectCache<K: CachedResource> {
    kind: &'static str,
    api: Api<K>,
    reader: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: RwLock<Vec<EventHandler<K>>>,
    synced: AtomicBool,
    resync: Duration,
}

impl<K: CachedResource> KubeObjectCache<K> {
    /// Create a cache watching `K` in every namespace.
    ///
    /// Every `resync` the whole cache is re-delivered as updates.
    pub fn new(client: Client, kind: &'static str, resync: Duration) -> Self {
        let writer = Writer::default();
        let reader = writer.as_reader();
        Self {
            kind,
            api: Api::all(client),
            reader,
            writer: Mutex::new(Some(writer)),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
            resync,
        }
    }

    /// Drive the watch until `cancel` fires. Can only run once.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut writer) = self.writer.lock().take() else {
            warn!(kind = self.kind, "Cache is already running");
            return;
        };

        info!(kind = self.kind, "Starting cache");
        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        let mut resync = tokio::time::interval(self.resync);
        // The first tick completes immediately
        resync.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = resync.tick() => self.resync_all(),
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(&mut writer, event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        info!(kind = self.kind, "Cache stopped");
    }

    fn apply(&self, writer: &mut Writer<K>, event: watcher::Event<K>) {
        match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let old = self.reader.get(&ObjectRef::from_obj(obj));
                let new = Arc::new(obj.clone());
                writer.apply_watcher_event(&event);
                self.dispatch(match old {
                    Some(old) => CacheEvent::Updated { old, new },
                    None => CacheEvent::Added(new),
                });
            }
            watcher::Event::InitDone => {
                writer.apply_watcher_event(&event);
                if !self.synced.swap(true, Ordering::SeqCst) {
                    info!(kind = self.kind, count = self.reader.state().len(), "Cache synced");
                }
            }
            watcher::Event::Init | watcher::Event::Delete(_) => {
                writer.apply_watcher_event(&event);
            }
        }
    }

    fn resync_all(&self) {
        let objects = self.reader.state();
        debug!(kind = self.kind, count = objects.len(), "Resync");
        for obj in objects {
            self.dispatch(CacheEvent::Updated {
                old: Arc::clone(&obj),
                new: obj,
            });
        }
    }

    fn dispatch(&self, event: CacheEvent<K>) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl<K: CachedResource> ObjectCache<K> for KubeObjectCache<K> {
    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        self.reader
            .get(&obj_ref)
            .ok_or_else(|| Error::not_found(self.kind, format!("{}/{}", namespace, name)))
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.reader
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref().unwrap_or_default() == namespace)
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn add_event_handler(&self, handler: EventHandler<K>) {
        self.handlers.write().push(handler);
    }
}

impl<K: CachedResource> std::fmt::Debug for KubeObjectCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectCache")
            .field("kind", &self.kind)
            .field("synced", &self.has_synced())
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// How to build an `Api` handle for a kind in a given namespace
pub trait ApiScope: CachedResource {
    fn scoped_api(client: Client, namespace: &str) -> Api<Self>;
}

impl ApiScope for Storage {
    fn scoped_api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl ApiScope for PersistentVolumeClaim {
    fn scoped_api(client: Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }
}

impl ApiScope for VolumeAttachment {
    fn scoped_api(client: Client, _namespace: &str) -> Api<Self> {
        Api::all(client)
    }
}

/// Mutation adapter writing straight to the API server.
#[derive(Clone)]
pub struct KubeObjectWriter<K> {
    client: Client,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: ApiScope> KubeObjectWriter<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: std::marker::PhantomData,
        }
    }

    fn api_for(&self, obj: &K) -> Api<K> {
        K::scoped_api(self.client.clone(), obj.namespace().as_deref().unwrap_or_default())
    }
}

impl<K> std::fmt::Debug for KubeObjectWriter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeObjectWriter")
            .field("kind", &std::any::type_name::<K>())
            .finish()
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::InvalidObject("object has no name".to_string()))
}

#[async_trait]
impl<K: ApiScope> ObjectWriter<K> for KubeObjectWriter<K> {
    #[instrument(skip(self, obj), fields(namespace = ?obj.namespace()))]
    async fn create(&self, obj: &K) -> Result<K> {
        let created = self.api_for(obj).create(&PostParams::default(), obj).await?;
        debug!(name = %created.name_any(), "Created object");
        Ok(created)
    }

    #[instrument(skip(self, obj), fields(namespace = ?obj.namespace(), name = %obj.name_any()))]
    async fn update(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let updated = self
            .api_for(obj)
            .replace(&name, &PostParams::default(), obj)
            .await?;
        debug!("Replaced object");
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        K::scoped_api(self.client.clone(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        debug!("Deleted object");
        Ok(())
    }

    #[instrument(skip(self, obj, status), fields(namespace = ?obj.namespace(), name = %obj.name_any()))]
    async fn patch_status(&self, obj: &K, status: serde_json::Value) -> Result<()> {
        let name = object_name(obj)?;
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams::apply(FIELD_MANAGER);
        self.api_for(obj)
            .patch_status(&name, &params, &Patch::Merge(&patch))
            .await?;
        debug!("Patched status");
        Ok(())
    }
}
