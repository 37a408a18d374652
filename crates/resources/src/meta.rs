//! Object metadata and the trait shared by every resource kind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// API group of the profiling resources.
pub const API_GROUP: &str = "dprofiler.io";

/// API version of the profiling resources.
pub const API_VERSION: &str = "v1alpha1";

fn default_namespace() -> String {
    "default".to_string()
}

/// Metadata carried by every resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Name, unique per namespace and immutable.
    pub name: String,
    /// Namespace the resource lives in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Opaque version assigned by the store on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Store-assigned unique id; differs between a resource and its re-creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Creation time assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata for a new resource.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            resource_version: None,
            uid: None,
            creation_timestamp: None,
        }
    }

    /// Identity of the resource.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Identity of a resource: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Create a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A declarative resource kind the controller can watch and update.
///
/// Implementors are plain serde structs with `metadata`, `spec` and an
/// optional `status` subtree; the controller is the only writer of `status`.
pub trait ResourceObject:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Observed state written by the controller.
    type Status: Clone
        + fmt::Debug
        + Default
        + PartialEq
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static;

    /// Kind name as served by the store.
    const KIND: &'static str;

    /// Plural path segment as served by the store.
    const PLURAL: &'static str;

    /// Resource metadata.
    fn metadata(&self) -> &ObjectMeta;

    /// Mutable resource metadata.
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Current status, if any has been written.
    fn status(&self) -> Option<&Self::Status>;

    /// Replace the status subtree.
    fn set_status(&mut self, status: Self::Status);

    /// Identity of this resource.
    fn key(&self) -> ResourceKey {
        self.metadata().key()
    }

    /// Version of this snapshot, if the store assigned one.
    fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }
}
