//! Domain Ports (Port/Adapter Pattern)
//!
//! The reconciliation core depends only on these traits. Infrastructure
//! adapters implement them.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  ObjectCache │ ObjectWriter │ Reconcile │ Publisher │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  KubeObjectCache │ KubeObjectWriter │ InMemory*     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use super::events::DomainEvent;
use crate::error::Result;

// =============================================================================
// Cache Port
// =============================================================================

/// A change observed by a cache, carrying the current object.
///
/// Deletions are not delivered: the core reacts to a vanished object by
/// dropping the reconcile, never by acting on the deletion itself.
#[derive(Debug)]
pub enum CacheEvent<K> {
    /// Object appeared in the cache
    Added(Arc<K>),
    /// Object changed, or was re-delivered by a resync (`old` == `new`)
    Updated { old: Arc<K>, new: Arc<K> },
}

impl<K> CacheEvent<K> {
    /// The object as it is now
    pub fn object(&self) -> &Arc<K> {
        match self {
            CacheEvent::Added(obj) => obj,
            CacheEvent::Updated { new, .. } => new,
        }
    }
}

impl<K> Clone for CacheEvent<K> {
    fn clone(&self) -> Self {
        match self {
            CacheEvent::Added(obj) => CacheEvent::Added(Arc::clone(obj)),
            CacheEvent::Updated { old, new } => CacheEvent::Updated {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
        }
    }
}

/// Callback invoked for every add/update a cache observes
pub type EventHandler<K> = Arc<dyn Fn(CacheEvent<K>) + Send + Sync>;

/// Read-only, eventually consistent local view of one object kind.
///
/// Cluster-scoped kinds use an empty namespace.
pub trait ObjectCache<K>: Send + Sync {
    /// Look up one object; fails with a not-found error when absent.
    fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>>;

    /// All cached objects in `namespace`.
    fn list(&self, namespace: &str) -> Vec<Arc<K>>;

    /// Whether the initial listing has been fully observed.
    fn has_synced(&self) -> bool;

    /// Register a handler for add/update events.
    fn add_event_handler(&self, handler: EventHandler<K>);
}

// =============================================================================
// Mutation Port
// =============================================================================

/// Write access to the API store for one object kind.
///
/// The store is the arbiter of concurrent writes; conflicts come back as
/// ordinary errors.
#[async_trait]
pub trait ObjectWriter<K>: Send + Sync {
    /// Create an object, honouring `metadata.generateName`.
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an existing object.
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete an object by namespace (empty for cluster scope) and name.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Merge `status` into the status sub-resource of `obj`.
    async fn patch_status(&self, obj: &K, status: serde_json::Value) -> Result<()>;
}

// =============================================================================
// Reconcile Port
// =============================================================================

/// Idempotent reconcile logic for one object kind.
///
/// Implementations must not panic on expected conditions; every failure is
/// returned so the caller can decide between retry and suppression.
#[async_trait]
pub trait Reconcile<K>: Send + Sync {
    async fn reconcile(&self, obj: Arc<K>) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}
