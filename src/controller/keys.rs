//! Queue key codec
//!
//! Objects travel through the work queues as a single `namespace:name`
//! token. A token that does not split into exactly two parts decodes to an
//! empty key, which callers must skip.

use kube::{Resource, ResourceExt};

const DELIMITER: char = ':';

/// Namespace and name of a queued object
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub namespace: String,
    pub name: String,
}

impl QueueKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object; cluster-scoped objects get an empty namespace
    pub fn for_object<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }

    /// Encode into a queue token
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.namespace, DELIMITER, self.name)
    }

    /// Decode a queue token; malformed tokens yield an empty key
    pub fn decode(token: &str) -> Self {
        let mut parts = token.split(DELIMITER);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), None) => Self::new(namespace, name),
            _ => Self::default(),
        }
    }

    /// Whether the key can be used for a lookup
    pub fn is_usable(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.name.is_empty()
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
