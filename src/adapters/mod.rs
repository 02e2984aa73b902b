//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │   ObjectCache │ ObjectWriter │ EventPublisher              │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ KubeObjectCache │ KubeObjectWriter                          │ │
//! │  │ InMemoryCache │ InMemoryWriter                              │ │
//! │  │ AuditLogPublisher │ MetricsEventPublisher │ FanOutPublisher │ │
//! │  │ InMemoryEventCollector                                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use storage_provisioner::adapters::{KubeObjectCache, KubeObjectWriter};
//! use storage_provisioner::domain::ports::ObjectCache;
//!
//! let claims = Arc::new(KubeObjectCache::<PersistentVolumeClaim>::new(
//!     client.clone(),
//!     "PersistentVolumeClaim",
//!     Duration::from_secs(600),
//! ));
//! tokio::spawn({
//!     let claims = claims.clone();
//!     async move { claims.run(cancel).await }
//! });
//!
//! let claim = claims.get("default", "data")?;
//! ```

mod event_publisher;
mod kubernetes;
mod memory;

pub use event_publisher::{
    AuditLogPublisher, FanOutPublisher, InMemoryEventCollector, MetricsEventPublisher,
};
pub use kubernetes::{ApiScope, CachedResource, KubeObjectCache, KubeObjectWriter, FIELD_MANAGER};
pub use memory::{InMemoryCache, InMemoryWriter, WriteOp};
