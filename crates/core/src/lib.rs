//! apiwatch core types: resource descriptors, discovery snapshots, definer identities
//! and the List/Watch contract the virtual discovery source implements.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod discovery;
pub mod session;

pub use discovery::{
    parse_group_version, CachedDiscovery, DiscoveredResource, DiscoveryClient, DiscoveryGroup,
    Invalidatable, ObjectNotifier, ResourceEventHandler,
};
pub use session::{WatchEvent, WatchSession};

/// Identifies one resource type: a (group, version, resource) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceDescriptor {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn group_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_version(), self.resource)
    }
}

/// Spec portion of one discovered resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSpec {
    /// Plural resource name, e.g. `deployments`.
    pub name: String,
    pub singular_name: String,
    pub namespaced: bool,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub verbs: SmallVec<[String; 8]>,
}

impl ApiResourceSpec {
    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor::new(&self.group, &self.version, &self.name)
    }
}

/// One row of a discovery snapshot. Rebuilt wholesale on every List.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceItem {
    /// `groupVersion + ":" + resource`
    pub name: String,
    pub resource_version: String,
    pub spec: ApiResourceSpec,
}

/// Result of one List call; every item carries `resource_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    pub resource_version: String,
    pub items: Vec<ApiResourceItem>,
}

/// Kind of object that can define resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DefinerKind {
    Crd,
    ApiBinding,
}

impl DefinerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinerKind::Crd => "CustomResourceDefinition",
            DefinerKind::ApiBinding => "APIBinding",
        }
    }
}

/// Identity of a CRD or APIBinding object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefinerId {
    pub kind: DefinerKind,
    pub cluster: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl DefinerId {
    pub fn new(kind: DefinerKind, cluster: impl Into<String>, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { kind, cluster: cluster.into(), namespace, name: name.into() }
    }
}

impl fmt::Display for DefinerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}:{}|{}/{}", self.kind.as_str(), self.cluster, ns, self.name),
            None => write!(f, "{}:{}|{}", self.kind.as_str(), self.cluster, self.name),
        }
    }
}

/// Options for List. Discovery has no selectors, so this carries nothing yet.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {}

/// Options for Watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Must equal the `resource_version` returned by the latest List.
    pub resource_version: String,
    /// Server-side timeout; `None` waits until cancelled.
    pub timeout: Option<Duration>,
}

impl WatchOptions {
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self { resource_version: resource_version.into(), timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The requested version is not the current generation; re-List.
    #[error("resource expired: requested version {requested}, have version {current} in cluster {cluster}")]
    Expired { requested: String, current: String, cluster: String },
    #[error("discovery: {0}")]
    Discovery(#[source] anyhow::Error),
}

impl WatchError {
    pub fn is_expired(&self) -> bool {
        matches!(self, WatchError::Expired { .. })
    }
}

/// A List/Watch source in the shape the informer driver expects.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> Result<ApiResourceList, WatchError>;

    /// Never blocks: either opens a session or fails immediately.
    fn watch(&self, opts: &WatchOptions) -> Result<WatchSession, WatchError>;
}

pub mod prelude {
    pub use super::{
        ApiResourceItem, ApiResourceList, ApiResourceSpec, DefinerId, DefinerKind, ListOptions, ListWatch,
        ResourceDescriptor, WatchError, WatchEvent, WatchOptions, WatchSession,
    };
}
