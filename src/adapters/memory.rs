//! In-memory adapters
//!
//! A cache and a writer over a shared in-process object map. The writer
//! mirrors every mutation into its cache, so the cache plays the role of
//! the API store and the watch at once. Used to run the controller without
//! a cluster.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::domain::ports::{CacheEvent, EventHandler, ObjectCache, ObjectWriter};
use crate::error::{Error, Result};

type ObjectKey = (String, String);

fn key_of<K: Resource>(obj: &K) -> ObjectKey {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

// =============================================================================
// Cache
// =============================================================================

/// In-memory object cache with add/update notifications.
pub struct InMemoryCache<K> {
    kind: &'static str,
    objects: RwLock<BTreeMap<ObjectKey, Arc<K>>>,
    handlers: RwLock<Vec<EventHandler<K>>>,
    synced: AtomicBool,
}

impl<K: Resource + Clone + Send + Sync + 'static> InMemoryCache<K> {
    /// Create an empty cache that reports itself synced.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(true),
        }
    }

    /// Create an empty cache that reports itself not synced.
    pub fn unsynced(kind: &'static str) -> Self {
        let cache = Self::new(kind);
        cache.synced.store(false, Ordering::SeqCst);
        cache
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Insert or replace an object and notify handlers.
    pub fn apply(&self, obj: K) -> Arc<K> {
        let new = Arc::new(obj);
        let old = self.objects.write().insert(key_of(&*new), Arc::clone(&new));
        let event = match old {
            Some(old) => CacheEvent::Updated {
                old,
                new: Arc::clone(&new),
            },
            None => CacheEvent::Added(Arc::clone(&new)),
        };
        self.dispatch(event);
        new
    }

    /// Remove an object without notifying handlers.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.objects
            .write()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Re-deliver every object as an unchanged update.
    pub fn resync(&self) {
        let objects: Vec<_> = self.objects.read().values().cloned().collect();
        for obj in objects {
            self.dispatch(CacheEvent::Updated {
                old: Arc::clone(&obj),
                new: obj,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch(&self, event: CacheEvent<K>) {
        // Handlers run outside the object lock; they may read the cache.
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl<K: Resource + Clone + Send + Sync + 'static> ObjectCache<K> for InMemoryCache<K> {
    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>> {
        self.objects
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(self.kind, format!("{}/{}", namespace, name)))
    }

    fn list(&self, namespace: &str) -> Vec<Arc<K>> {
        self.objects
            .read()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, obj)| Arc::clone(obj))
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn add_event_handler(&self, handler: EventHandler<K>) {
        self.handlers.write().push(handler);
    }
}

impl<K> std::fmt::Debug for InMemoryCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("kind", &self.kind)
            .field("objects", &self.objects.read().len())
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// A mutation recorded by [`InMemoryWriter`]
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Create { namespace: String, name: String },
    Update { namespace: String, name: String },
    Delete { namespace: String, name: String },
    PatchStatus {
        namespace: String,
        name: String,
        status: Value,
    },
}

impl WriteOp {
    /// Whether this operation changed the object itself rather than its status
    pub fn is_object_mutation(&self) -> bool {
        !matches!(self, WriteOp::PatchStatus { .. })
    }
}

/// Writer over an [`InMemoryCache`], recording every successful operation.
///
/// Failures can be injected with [`fail_next`](Self::fail_next); each call
/// consumes one queued error regardless of which operation it is.
pub struct InMemoryWriter<K> {
    store: Arc<InMemoryCache<K>>,
    ops: Mutex<Vec<WriteOp>>,
    failures: Mutex<VecDeque<Error>>,
    resource_version: AtomicU64,
}

impl<K> InMemoryWriter<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(store: Arc<InMemoryCache<K>>) -> Self {
        Self {
            store,
            ops: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            resource_version: AtomicU64::new(1),
        }
    }

    /// Make the next write fail with `error`.
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().push_back(error);
    }

    /// All successful operations, oldest first.
    pub fn ops(&self) -> Vec<WriteOp> {
        self.ops.lock().clone()
    }

    /// Successful operations that changed objects (excludes status patches).
    pub fn object_mutations(&self) -> Vec<WriteOp> {
        self.ops
            .lock()
            .iter()
            .filter(|op| op.is_object_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    fn injected_failure(&self) -> Result<()> {
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: WriteOp) {
        trace!(?op, "Recorded write");
        self.ops.lock().push(op);
    }

    fn next_resource_version(&self) -> String {
        self.resource_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn already_exists(&self, namespace: &str, name: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} {}/{} already exists", self.store.kind, namespace, name),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }))
    }
}

#[async_trait]
impl<K> ObjectWriter<K> for InMemoryWriter<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K> {
        self.injected_failure()?;

        let mut obj = obj.clone();
        if obj.meta().name.is_none() {
            let prefix = obj.meta().generate_name.clone().ok_or_else(|| {
                Error::InvalidObject("object has neither name nor generateName".to_string())
            })?;
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            obj.meta_mut().name = Some(format!("{}{}", prefix, &suffix[..5]));
        }

        let (namespace, name) = key_of(&obj);
        if self.store.get(&namespace, &name).is_ok() {
            return Err(self.already_exists(&namespace, &name));
        }

        obj.meta_mut().uid = Some(uuid::Uuid::new_v4().to_string());
        obj.meta_mut().resource_version = Some(self.next_resource_version());
        self.store.apply(obj.clone());
        self.record(WriteOp::Create { namespace, name });
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.injected_failure()?;

        let (namespace, name) = key_of(obj);
        let current = self.store.get(&namespace, &name)?;

        let mut obj = obj.clone();
        obj.meta_mut().uid = current.uid();
        obj.meta_mut().resource_version = Some(self.next_resource_version());
        self.store.apply(obj.clone());
        self.record(WriteOp::Update { namespace, name });
        Ok(obj)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.injected_failure()?;

        self.store
            .remove(namespace, name)
            .ok_or_else(|| Error::not_found(self.store.kind, format!("{}/{}", namespace, name)))?;
        self.record(WriteOp::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn patch_status(&self, obj: &K, status: Value) -> Result<()> {
        self.injected_failure()?;

        let (namespace, name) = key_of(obj);
        let current = self.store.get(&namespace, &name)?;

        let mut doc = serde_json::to_value(&*current)?;
        merge_patch(&mut doc, &serde_json::json!({ "status": status.clone() }));
        let mut patched: K = serde_json::from_value(doc)?;
        patched.meta_mut().resource_version = Some(self.next_resource_version());

        self.store.apply(patched);
        self.record(WriteOp::PatchStatus {
            namespace,
            name,
            status,
        });
        Ok(())
    }
}

impl<K> std::fmt::Debug for InMemoryWriter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWriter")
            .field("store", &self.store)
            .field("ops", &self.ops.lock().len())
            .finish()
    }
}

/// JSON merge patch (RFC 7386): objects merge recursively, null deletes.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
