//! Domain Events
//!
//! Immutable records of the mutations the provisioner performed. They are
//! used for audit logging and let tests observe the cascade without
//! inspecting the API store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a mutation made by a reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Claim Events
    // =========================================================================
    /// A PVC was created for a Storage.
    ClaimCreated {
        namespace: String,
        storage: String,
        claim: String,
        capacity: String,
        storage_class: String,
        timestamp: DateTime<Utc>,
    },

    /// The requested size of a PVC was changed to follow its Storage.
    ClaimResized {
        namespace: String,
        storage: String,
        claim: String,
        old_capacity: Option<String>,
        new_capacity: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Attachment Events
    // =========================================================================
    /// A VolumeAttachment was created for a bound PVC.
    AttachmentCreated {
        attachment: String,
        volume: String,
        node: String,
        attacher: String,
        timestamp: DateTime<Utc>,
    },

    /// A VolumeAttachment was deleted so it can be recreated on another node.
    AttachmentDeleted {
        attachment: String,
        old_node: String,
        new_node: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ClaimCreated { .. } => "ClaimCreated",
            DomainEvent::ClaimResized { .. } => "ClaimResized",
            DomainEvent::AttachmentCreated { .. } => "AttachmentCreated",
            DomainEvent::AttachmentDeleted { .. } => "AttachmentDeleted",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ClaimCreated { timestamp, .. }
            | DomainEvent::ClaimResized { timestamp, .. }
            | DomainEvent::AttachmentCreated { timestamp, .. }
            | DomainEvent::AttachmentDeleted { timestamp, .. } => *timestamp,
        }
    }

    pub fn claim_created(
        namespace: impl Into<String>,
        storage: impl Into<String>,
        claim: impl Into<String>,
        capacity: impl Into<String>,
        storage_class: impl Into<String>,
    ) -> Self {
        DomainEvent::ClaimCreated {
            namespace: namespace.into(),
            storage: storage.into(),
            claim: claim.into(),
            capacity: capacity.into(),
            storage_class: storage_class.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn claim_resized(
        namespace: impl Into<String>,
        storage: impl Into<String>,
        claim: impl Into<String>,
        old_capacity: Option<String>,
        new_capacity: impl Into<String>,
    ) -> Self {
        DomainEvent::ClaimResized {
            namespace: namespace.into(),
            storage: storage.into(),
            claim: claim.into(),
            old_capacity,
            new_capacity: new_capacity.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn attachment_created(
        attachment: impl Into<String>,
        volume: impl Into<String>,
        node: impl Into<String>,
        attacher: impl Into<String>,
    ) -> Self {
        DomainEvent::AttachmentCreated {
            attachment: attachment.into(),
            volume: volume.into(),
            node: node.into(),
            attacher: attacher.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn attachment_deleted(
        attachment: impl Into<String>,
        old_node: impl Into<String>,
        new_node: impl Into<String>,
    ) -> Self {
        DomainEvent::AttachmentDeleted {
            attachment: attachment.into(),
            old_node: old_node.into(),
            new_node: new_node.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(
            DomainEvent::claim_created("ns", "s", "c", "1Gi", "fast").event_type(),
            "ClaimCreated"
        );
        assert_eq!(
            DomainEvent::claim_resized("ns", "s", "c", None, "2Gi").event_type(),
            "ClaimResized"
        );
        assert_eq!(
            DomainEvent::attachment_created("c", "pv", "n1", "csi").event_type(),
            "AttachmentCreated"
        );
        assert_eq!(
            DomainEvent::attachment_deleted("c", "n1", "n2").event_type(),
            "AttachmentDeleted"
        );
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DomainEvent::attachment_deleted("c", "n1", "n2");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "AttachmentDeleted");
        assert_eq!(json["old_node"], "n1");
        assert_eq!(json["new_node"], "n2");
    }
}
