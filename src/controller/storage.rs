//! Storage reconciler
//!
//! Ensures exactly one PersistentVolumeClaim exists for each `Storage` and
//! that its requested size follows `spec.capacity`.
//!
//! Only the size is converged. Any other drift between the claim and the
//! `Storage` is left alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::common::{
    contains_owner, owner_reference, quantities_equal, requested_storage, Annotations,
};
use super::keys::QueueKey;
use super::status::{derive_status, sync_status};
use crate::crd::Storage;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, ObjectCache, ObjectWriter, Reconcile};
use crate::error::{Error, Result};

/// What a pass did to the claim
#[derive(Debug)]
enum ClaimOutcome {
    Created,
    Resized,
    Unchanged(Arc<PersistentVolumeClaim>),
}

/// Reconciles `Storage` objects into claims
pub struct StorageReconciler {
    claims: Arc<dyn ObjectCache<PersistentVolumeClaim>>,
    claim_writer: Arc<dyn ObjectWriter<PersistentVolumeClaim>>,
    attachments: Arc<dyn ObjectCache<VolumeAttachment>>,
    storage_writer: Arc<dyn ObjectWriter<Storage>>,
    events: Arc<dyn EventPublisher>,
}

impl StorageReconciler {
    pub fn new(
        claims: Arc<dyn ObjectCache<PersistentVolumeClaim>>,
        claim_writer: Arc<dyn ObjectWriter<PersistentVolumeClaim>>,
        attachments: Arc<dyn ObjectCache<VolumeAttachment>>,
        storage_writer: Arc<dyn ObjectWriter<Storage>>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            claims,
            claim_writer,
            attachments,
            storage_writer,
            events,
        }
    }

    /// The claim in the storage's namespace owned by `owner`
    fn find_claim(&self, storage: &Storage, owner: &OwnerReference) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims
            .list(storage.namespace().as_deref().unwrap_or_default())
            .into_iter()
            .find(|claim| contains_owner(claim.owner_references(), owner))
    }

    async fn reconcile_claim(&self, storage: &Storage) -> Result<ClaimOutcome> {
        let owner = owner_reference(storage)?;

        let annotations = Annotations::from_object(storage);
        let provider = annotations.require_provider()?;
        let attacher = annotations.require_attacher()?;

        match self.find_claim(storage, &owner) {
            None => {
                self.create_claim(storage, owner, provider, attacher).await?;
                Ok(ClaimOutcome::Created)
            }
            Some(claim) => {
                if self.resize_claim(storage, &claim).await? {
                    Ok(ClaimOutcome::Resized)
                } else {
                    debug!(claim = %claim.name_any(), "No change to desired state");
                    Ok(ClaimOutcome::Unchanged(claim))
                }
            }
        }
    }

    async fn create_claim(
        &self,
        storage: &Storage,
        owner: OwnerReference,
        provider: &str,
        attacher: &str,
    ) -> Result<()> {
        let namespace = storage.namespace().unwrap_or_default();
        let capacity = storage.spec.capacity.clone();

        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-{}-", namespace, storage.name_any())),
                namespace: Some(namespace.clone()),
                annotations: Some(Annotations::claim_annotations(storage.node_name(), attacher)),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: Some(provider.to_string()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([("storage".to_string(), capacity.clone())])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self.claim_writer.create(&claim).await?;
        info!(claim = %created.name_any(), capacity = %capacity.0, "Created claim");

        self.publish(DomainEvent::claim_created(
            namespace,
            storage.name_any(),
            created.name_any(),
            capacity.0,
            provider,
        ))
        .await;
        Ok(())
    }

    /// Update the claim's requested size when it differs from the capacity.
    ///
    /// Returns whether an update was made.
    async fn resize_claim(&self, storage: &Storage, claim: &PersistentVolumeClaim) -> Result<bool> {
        let capacity = &storage.spec.capacity;
        let current = requested_storage(claim).cloned();
        if current.as_ref().is_some_and(|q| quantities_equal(q, capacity)) {
            return Ok(false);
        }

        let mut updated = claim.clone();
        updated
            .spec
            .get_or_insert_with(Default::default)
            .resources
            .get_or_insert_with(Default::default)
            .requests
            .get_or_insert_with(Default::default)
            .insert("storage".to_string(), capacity.clone());

        self.claim_writer.update(&updated).await?;
        info!(
            claim = %claim.name_any(),
            from = ?current.as_ref().map(|q| q.0.as_str()),
            to = %capacity.0,
            "Resized claim"
        );

        self.publish(DomainEvent::claim_resized(
            storage.namespace().unwrap_or_default(),
            storage.name_any(),
            claim.name_any(),
            current.map(|q| q.0),
            capacity.0.clone(),
        ))
        .await;
        Ok(true)
    }

    /// Best-effort write of the derived status; failures are only logged.
    async fn update_status(
        &self,
        storage: &Storage,
        claim: Option<&PersistentVolumeClaim>,
        failure: Option<&Error>,
    ) {
        let attachment = claim.and_then(|c| self.attachments.get("", &c.name_any()).ok());
        let desired = derive_status(storage, claim, attachment.as_deref(), failure);

        match sync_status(self.storage_writer.as_ref(), storage, &desired).await {
            Ok(true) => debug!(phase = %desired.phase, "Updated status"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to update status"),
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish domain event");
        }
    }
}

impl std::fmt::Debug for StorageReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReconciler").finish_non_exhaustive()
    }
}

#[async_trait]
impl Reconcile<Storage> for StorageReconciler {
    #[instrument(skip(self, storage), fields(storage = %QueueKey::for_object(storage.as_ref())))]
    async fn reconcile(&self, storage: Arc<Storage>) -> Result<()> {
        match self.reconcile_claim(&storage).await {
            Ok(ClaimOutcome::Unchanged(claim)) => {
                self.update_status(&storage, Some(&claim), None).await;
                Ok(())
            }
            // The cache does not show the write yet; the claim event brings
            // this storage back.
            Ok(ClaimOutcome::Created | ClaimOutcome::Resized) => Ok(()),
            Err(err) => {
                let claim = owner_reference(storage.as_ref())
                    .ok()
                    .and_then(|owner| self.find_claim(&storage, &owner));
                self.update_status(&storage, claim.as_deref(), Some(&err))
                    .await;
                Err(err)
            }
        }
    }
}
