//! Helpers shared by the reconcilers: annotation contract, owner references
//! and quantity comparison.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::Storage;
use crate::error::{Error, Result};

// =============================================================================
// Annotations
// =============================================================================

/// StorageClass (provider) that backs the claim
pub const STORAGECLASS_PROVIDER_KEY: &str = "storageprovisioner.ddp.mayadata.io/storageclass-name";

/// CSI attacher responsible for attaching the volume
pub const CSI_ATTACHER_KEY: &str = "storageprovisioner.ddp.mayadata.io/csi-attacher-name";

/// Node the volume should be attached to
pub const NODE_NAME_KEY: &str = "storageprovisioner.ddp.mayadata.io/node-name";

/// The annotations the provisioner reads and writes.
///
/// `None` means the annotation is absent; an empty value is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Annotations {
    pub provider: Option<String>,
    pub attacher: Option<String>,
    pub node: Option<String>,
    object: String,
}

impl Annotations {
    /// Read the provisioner annotations from an object
    pub fn from_object<K: Resource>(obj: &K) -> Self {
        Self::from_meta(obj.meta())
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        let lookup = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .cloned()
        };
        Self {
            provider: lookup(STORAGECLASS_PROVIDER_KEY),
            attacher: lookup(CSI_ATTACHER_KEY),
            node: lookup(NODE_NAME_KEY),
            object: format!(
                "{}/{}",
                meta.namespace.as_deref().unwrap_or_default(),
                meta.name.as_deref().unwrap_or_default()
            ),
        }
    }

    pub fn require_provider(&self) -> Result<&str> {
        self.require(&self.provider, STORAGECLASS_PROVIDER_KEY)
    }

    pub fn require_attacher(&self) -> Result<&str> {
        self.require(&self.attacher, CSI_ATTACHER_KEY)
    }

    pub fn require_node(&self) -> Result<&str> {
        self.require(&self.node, NODE_NAME_KEY)
    }

    /// Desired node, `None` when absent or empty
    pub fn desired_node(&self) -> Option<&str> {
        self.node.as_deref().filter(|node| !node.is_empty())
    }

    fn require<'a>(&self, value: &'a Option<String>, key: &'static str) -> Result<&'a str> {
        value.as_deref().ok_or_else(|| Error::MissingAnnotation {
            key,
            object: self.object.clone(),
        })
    }

    /// Annotations stamped on a new claim
    pub fn claim_annotations(node: &str, attacher: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NODE_NAME_KEY.to_string(), node.to_string()),
            (CSI_ATTACHER_KEY.to_string(), attacher.to_string()),
        ])
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Controller owner reference pointing at `obj`
pub fn owner_reference<K: Resource<DynamicType = ()>>(obj: &K) -> Result<OwnerReference> {
    obj.controller_owner_ref(&()).ok_or_else(|| {
        Error::InvalidObject(format!(
            "{} {} has no name or uid to reference",
            K::kind(&()),
            obj.name_any()
        ))
    })
}

/// Whether `owners` contains `given`, compared by API version, kind, name and uid
pub fn contains_owner(owners: &[OwnerReference], given: &OwnerReference) -> bool {
    owners.iter().any(|o| {
        o.api_version == given.api_version
            && o.kind == given.kind
            && o.name == given.name
            && o.uid == given.uid
    })
}

fn storage_owner(pvc: &PersistentVolumeClaim) -> Option<&OwnerReference> {
    let kind = Storage::kind(&());
    let api_version = Storage::api_version(&());
    pvc.owner_references()
        .iter()
        .find(|o| o.kind == kind && o.api_version == api_version)
}

/// Whether any owner of the claim is a `Storage`
pub fn is_owned_by_storage(pvc: &PersistentVolumeClaim) -> bool {
    storage_owner(pvc).is_some()
}

/// Name of the `Storage` owning the claim
pub fn storage_owner_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    storage_owner(pvc).map(|o| o.name.as_str())
}

// =============================================================================
// Quantities
// =============================================================================

/// Requested storage of a claim
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
}

/// Compare two quantities by value, falling back to their text
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_k8s_quantity(&a.0), parse_k8s_quantity(&b.0)) {
        (Some(a), Some(b)) => a == b,
        _ => a.0.trim() == b.0.trim(),
    }
}

/// Parse a Kubernetes quantity string into a whole number of bytes.
///
/// Arithmetic is exact. Returns `None` for unknown suffixes, values that
/// are not a whole number of bytes (`1.5`, `500m`) and values past `u64`.
pub fn parse_k8s_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    let pos = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(pos);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return None;
    }

    let multiplier: u128 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };

    let mantissa: u128 = format!("{}{}", whole, fraction).parse().ok()?;
    let scale = 10u128.checked_pow(u32::try_from(fraction.len()).ok()?)?;
    let scaled = mantissa.checked_mul(multiplier)?;
    if scaled % scale != 0 {
        return None;
    }
    u64::try_from(scaled / scale).ok()
}
