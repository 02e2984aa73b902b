//! Claim reconciler
//!
//! Ensures a bound PersistentVolumeClaim owned by a `Storage` has exactly one
//! VolumeAttachment. The attachment shares the claim's name.
//!
//! When the desired node changes, the attachment is deleted and nothing else
//! happens in that pass. A later pass sees it gone and recreates it on the
//! new node.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::{
    VolumeAttachment, VolumeAttachmentSource, VolumeAttachmentSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::common::{owner_reference, Annotations};
use super::keys::QueueKey;
use super::status::bound_volume;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, ObjectCache, ObjectWriter, Reconcile};
use crate::error::Result;

/// Reconciles bound claims into attachments
pub struct ClaimReconciler {
    attachments: Arc<dyn ObjectCache<VolumeAttachment>>,
    attachment_writer: Arc<dyn ObjectWriter<VolumeAttachment>>,
    events: Arc<dyn EventPublisher>,
}

impl ClaimReconciler {
    pub fn new(
        attachments: Arc<dyn ObjectCache<VolumeAttachment>>,
        attachment_writer: Arc<dyn ObjectWriter<VolumeAttachment>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            attachments,
            attachment_writer,
            events,
        }
    }

    /// Attachment named after the claim, if the cache has one
    fn find_attachment(&self, claim: &PersistentVolumeClaim) -> Result<Option<Arc<VolumeAttachment>>> {
        match self.attachments.get("", &claim.name_any()) {
            Ok(attachment) => Ok(Some(attachment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_attachment(
        &self,
        claim: &PersistentVolumeClaim,
        owner: OwnerReference,
        volume: &str,
    ) -> Result<()> {
        let annotations = Annotations::from_object(claim);
        let node = annotations.require_node()?;
        let attacher = annotations.require_attacher()?;

        let attachment = VolumeAttachment {
            metadata: ObjectMeta {
                name: Some(claim.name_any()),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: VolumeAttachmentSpec {
                attacher: attacher.to_string(),
                node_name: node.to_string(),
                source: VolumeAttachmentSource {
                    persistent_volume_name: Some(volume.to_string()),
                    ..Default::default()
                },
            },
            status: None,
        };

        let created = self.attachment_writer.create(&attachment).await?;
        info!(attachment = %created.name_any(), node, volume, "Created attachment");

        self.publish(DomainEvent::attachment_created(
            created.name_any(),
            volume,
            node,
            attacher,
        ))
        .await;
        Ok(())
    }

    /// Delete the attachment when the claim asks for another node.
    ///
    /// Returns whether the attachment was deleted.
    async fn reconcile_node(
        &self,
        claim: &PersistentVolumeClaim,
        attachment: &VolumeAttachment,
    ) -> Result<bool> {
        let annotations = Annotations::from_object(claim);
        let Some(node) = annotations.desired_node() else {
            return Ok(false);
        };
        let current = attachment.spec.node_name.as_str();
        if node == current {
            return Ok(false);
        }

        let name = attachment.name_any();
        self.attachment_writer.delete("", &name).await?;
        info!(attachment = %name, from = current, to = node, "Deleted attachment for node change");

        self.publish(DomainEvent::attachment_deleted(name, current, node))
            .await;
        Ok(true)
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

impl std::fmt::Debug for ClaimReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimReconciler").finish_non_exhaustive()
    }
}

#[async_trait]
impl Reconcile<PersistentVolumeClaim> for ClaimReconciler {
    #[instrument(skip(self, claim), fields(claim = %QueueKey::for_object(claim.as_ref())))]
    async fn reconcile(&self, claim: Arc<PersistentVolumeClaim>) -> Result<()> {
        let Some(volume) = bound_volume(&claim) else {
            debug!("Reconcile ignored: volume not bound");
            return Ok(());
        };

        let owner = owner_reference(claim.as_ref())?;

        match self.find_attachment(&claim)? {
            None => self.create_attachment(&claim, owner, volume).await,
            Some(attachment) => {
                if !self.reconcile_node(&claim, &attachment).await? {
                    debug!("No change to desired state");
                }
                Ok(())
            }
        }
    }
}
