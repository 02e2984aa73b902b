//! Domain Layer
//!
//! The seams between the reconciliation core and the outside world.
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the cache facade, the
//!   mutation API, reconcile logic and event publishing
//! - **Events** (`events.rs`) - Domain events for audit and observation
//!
//! # Usage
//!
//! ```ignore
//! use storage_provisioner::domain::{ObjectCache, ObjectWriter, Reconcile};
//!
//! struct MyReconciler {
//!     cache: Arc<dyn ObjectCache<PersistentVolumeClaim>>,
//!     writer: Arc<dyn ObjectWriter<PersistentVolumeClaim>>,
//! }
//!
//! #[async_trait]
//! impl Reconcile<Storage> for MyReconciler {
//!     async fn reconcile(&self, storage: Arc<Storage>) -> Result<()> {
//!         // ...
//!     }
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{CacheEvent, EventHandler, EventPublisher, ObjectCache, ObjectWriter, Reconcile};
