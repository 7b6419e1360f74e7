//! Collaborator contracts: the polling discovery client, its cache, and definer notifiers.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One preferred group-version as reported by server discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryGroup {
    /// `group/version`, or `v1` for the core group.
    pub group_version: String,
    pub resources: Vec<DiscoveredResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredResource {
    pub name: String,
    pub singular_name: String,
    pub namespaced: bool,
    pub kind: String,
    pub verbs: SmallVec<[String; 8]>,
}

/// Split a `group/version` string. `v1` is the core group; an empty string is allowed.
pub fn parse_group_version(gv: &str) -> Result<(String, String)> {
    let parts: Vec<_> = gv.split('/').collect();
    match parts.as_slice() {
        [""] => Ok((String::new(), String::new())),
        [version] => Ok((String::new(), (*version).to_string())),
        [group, version] => Ok(((*group).to_string(), (*version).to_string())),
        _ => Err(anyhow!("unexpected GroupVersion string: {}", gv)),
    }
}

/// Point-in-time enumeration of the server-preferred resources.
#[async_trait::async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveryGroup>>;
}

#[async_trait::async_trait]
impl<D: DiscoveryClient + ?Sized> DiscoveryClient for Arc<D> {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveryGroup>> {
        (**self).server_preferred_resources().await
    }
}

/// A cache that has to be explicitly invalidated.
pub trait Invalidatable: Send + Sync {
    fn invalidate(&self);
}

/// Discovery client whose results are cached until invalidated.
pub trait CachedDiscovery: DiscoveryClient + Invalidatable {}

impl<T: DiscoveryClient + Invalidatable> CachedDiscovery for T {}

/// Callbacks for object notifications, informer style.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &DynamicObject);

    fn on_update(&self, _old: &DynamicObject, _new: &DynamicObject) {}

    fn on_delete(&self, _obj: &DynamicObject) {}
}

/// Something that notifies handlers like an informer does.
pub trait ObjectNotifier: Send + Sync {
    fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>);
}
