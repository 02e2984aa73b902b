//! Controller module
//!
//! Cascades `Storage` objects into PersistentVolumeClaims and bound claims
//! into VolumeAttachments:
//!
//! - [`StorageReconciler`] ensures each `Storage` owns one claim of the
//!   requested size and records the derived status.
//! - [`ClaimReconciler`] ensures each bound, owned claim has one attachment
//!   on the desired node.
//! - [`Controller`] feeds both from the caches through rate-limited queues.

mod claim;
pub mod common;
pub mod keys;
mod runner;
pub mod status;
mod storage;

pub use claim::ClaimReconciler;
pub use common::{
    Annotations, CSI_ATTACHER_KEY, NODE_NAME_KEY, STORAGECLASS_PROVIDER_KEY,
};
pub use keys::QueueKey;
pub use runner::{Controller, ControllerBuilder, ResourceEvent, SyncLoop, SyncedFn, DEFAULT_NAME};
pub use status::{derive_status, status_patch, sync_status};
pub use storage::StorageReconciler;
