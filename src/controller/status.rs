//! Derived status of a `Storage`.
//!
//! The status is informational only: it is computed from the cache after a
//! pass and never read back as reconcile input.

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::VolumeAttachment;

use crate::crd::{
    ConditionStatus, Storage, StorageCondition, StorageConditionType, StoragePhase, StorageStatus,
};
use crate::domain::ports::ObjectWriter;
use crate::error::{Error, Result};

/// Reason recorded when a pass fails
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Name of the volume the claim is bound to, if any
pub fn bound_volume(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|volume| !volume.is_empty())
}

fn is_attached(attachment: &VolumeAttachment) -> bool {
    attachment.status.as_ref().is_some_and(|s| s.attached)
}

fn condition(r#type: StorageConditionType, ok: bool, reason: &str, otherwise: &str) -> StorageCondition {
    let reason = if ok { reason } else { otherwise };
    StorageCondition::new(r#type, ConditionStatus::from(ok), reason, None)
}

/// Compute the status of `storage` from what the cache shows.
pub fn derive_status(
    storage: &Storage,
    claim: Option<&PersistentVolumeClaim>,
    attachment: Option<&VolumeAttachment>,
    failure: Option<&Error>,
) -> StorageStatus {
    let mut status = storage.status.clone().unwrap_or_default();
    if status.start_time.is_none() {
        status.start_time = Some(Utc::now());
    }

    status.set_condition(condition(
        StorageConditionType::ResourcesCreated,
        claim.is_some(),
        "ClaimCreated",
        "ClaimMissing",
    ));
    status.set_condition(condition(
        StorageConditionType::PvcBound,
        claim.and_then(bound_volume).is_some(),
        "VolumeBound",
        "VolumeNotBound",
    ));
    status.set_condition(condition(
        StorageConditionType::NodeSelected,
        !storage.node_name().is_empty(),
        "NodeRequested",
        "NoNodeRequested",
    ));

    match failure {
        Some(err) => {
            status.phase = StoragePhase::Failed;
            status.reason = Some(REASON_RECONCILE_FAILED.to_string());
            status.message = Some(err.to_string());
        }
        None => {
            status.phase = if attachment.is_some_and(is_attached) {
                StoragePhase::Attached
            } else {
                StoragePhase::Pending
            };
            status.reason = None;
            status.message = None;
        }
    }

    status
}

/// Merge patch body for `desired`. Unset optional fields are sent as null
/// so a recovered pass clears an earlier failure.
pub fn status_patch(desired: &StorageStatus) -> Result<serde_json::Value> {
    let mut patch = serde_json::to_value(desired)?;
    if let Some(fields) = patch.as_object_mut() {
        for field in ["message", "reason"] {
            fields.entry(field).or_insert(serde_json::Value::Null);
        }
    }
    Ok(patch)
}

/// Write `desired` when it differs from the current status.
///
/// Returns whether a write was made.
pub async fn sync_status(
    writer: &dyn ObjectWriter<Storage>,
    storage: &Storage,
    desired: &StorageStatus,
) -> Result<bool> {
    if storage
        .status
        .as_ref()
        .is_some_and(|current| current.same_state(desired))
    {
        return Ok(false);
    }
    writer
        .patch_status(storage, status_patch(desired)?)
        .await?;
    Ok(true)
}
