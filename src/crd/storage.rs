//! Storage Custom Resource Definition
//!
//! A `Storage` declares the capacity a workload needs and, optionally, the
//! node it should be attached to. The provisioner derives a
//! PersistentVolumeClaim and, once bound, a VolumeAttachment from it.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Storage CRD
// =============================================================================

/// Storage is the desired state of one piece of attached storage.
///
/// The provider (StorageClass) and the CSI attacher are supplied through
/// annotations, see [`crate::controller::Annotations`].
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ddp.mayadata.io",
    version = "v1alpha1",
    kind = "Storage",
    plural = "storages",
    shortname = "stor",
    derive = "PartialEq",
    status = "StorageStatus",
    printcolumn = r#"{"name": "Capacity", "type": "string", "jsonPath": ".spec.capacity"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Capacity of the storage
    #[schemars(with = "String")]
    pub capacity: Quantity,

    /// Name of the node that should attach the storage.
    /// This is optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of the Storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    /// High-level summary of where the storage is in its lifecycle
    #[serde(default)]
    pub phase: StoragePhase,

    /// Current service state of the storage, one entry per condition type
    #[serde(default)]
    pub conditions: Vec<StorageCondition>,

    /// Human readable message indicating details about the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Brief CamelCase reason for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the storage was first acknowledged by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

/// Storage lifecycle phase
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum StoragePhase {
    /// Accepted, but one or more derived resources are not ready yet
    #[default]
    Pending,
    /// Attached to a node
    Attached,
    /// The controller failed to drive the storage forward
    Failed,
}

impl std::fmt::Display for StoragePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoragePhase::Pending => write!(f, "Pending"),
            StoragePhase::Attached => write!(f, "Attached"),
            StoragePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition types tracked on a Storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum StorageConditionType {
    /// All resources of the storage are created
    ResourcesCreated,
    /// The PVC of this storage is bound to a PV
    #[serde(rename = "PVCBound")]
    PvcBound,
    /// A node was selected to attach this storage
    NodeSelected,
    /// The selected node is available
    NodeAvailable,
    /// The storage is undergoing a resize
    VolumeResize,
}

/// Condition status values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Details for one condition of a storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageCondition {
    /// Type of condition
    pub r#type: StorageConditionType,

    /// Status: True, False, or Unknown
    pub status: ConditionStatus,

    /// Last time the condition was checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<DateTime<Utc>>,

    /// Last time the condition transitioned from one status to another
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// One-word CamelCase reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StorageCondition {
    /// Create a condition checked now
    pub fn new(
        r#type: StorageConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            r#type,
            status,
            last_probe_time: Some(now),
            last_transition_time: Some(now),
            reason: Some(reason.into()),
            message,
        }
    }

    /// Equality that ignores both condition timestamps
    pub fn same_state(&self, other: &StorageCondition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl Storage {
    /// Requested node name, empty when none was requested
    pub fn node_name(&self) -> &str {
        self.spec.node_name.as_deref().unwrap_or_default()
    }
}

impl StorageStatus {
    /// Update a condition by type, appending it when absent.
    ///
    /// The transition time of an existing condition is kept unless its
    /// status changes.
    pub fn set_condition(&mut self, mut condition: StorageCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Find a condition by type
    pub fn condition(&self, r#type: StorageConditionType) -> Option<&StorageCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Equality that ignores all timestamps
    pub fn same_state(&self, other: &StorageStatus) -> bool {
        self.phase == other.phase
            && self.message == other.message
            && self.reason == other.reason
            && self.start_time.is_some() == other.start_time.is_some()
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().all(|c| {
                other
                    .condition(c.r#type)
                    .is_some_and(|o| c.same_state(o))
            })
    }
}
