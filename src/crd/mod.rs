//! Custom Resource Definitions
//!
//! This module contains the CRD owned by the provisioner.

mod storage;

pub use storage::{
    ConditionStatus, Storage, StorageCondition, StorageConditionType, StoragePhase, StorageSpec,
    StorageStatus,
};
