//! Discovery clients: the kube-backed one, an in-memory cache decorator and a mock.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use apiwatch_core::{DiscoveredResource, DiscoveryClient, DiscoveryGroup, Invalidatable};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::Client;
use parking_lot::Mutex;
use tracing::debug;

/// Server-preferred resources via the kube client: the first core version plus
/// the preferred version of every API group. Subresources are skipped.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

fn to_group(list: APIResourceList) -> DiscoveryGroup {
    let resources = list
        .resources
        .into_iter()
        .filter(|r| !r.name.contains('/'))
        .map(|r| DiscoveredResource {
            name: r.name,
            singular_name: r.singular_name,
            namespaced: r.namespaced,
            kind: r.kind,
            verbs: r.verbs.into_iter().collect(),
        })
        .collect();
    DiscoveryGroup { group_version: list.group_version, resources }
}

#[async_trait::async_trait]
impl DiscoveryClient for KubeDiscovery {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveryGroup>> {
        let mut out = Vec::new();
        let core = self.client.list_core_api_versions().await.context("listing core API versions")?;
        if let Some(version) = core.versions.first() {
            let list = self
                .client
                .list_core_api_resources(version)
                .await
                .with_context(|| format!("listing core resources for {}", version))?;
            out.push(to_group(list));
        }
        let groups = self.client.list_api_groups().await.context("listing API groups")?;
        for group in groups.groups {
            let preferred = group.preferred_version.or_else(|| group.versions.first().cloned());
            let Some(gv) = preferred else {
                debug!(group = %group.name, "group has no served versions");
                continue;
            };
            let list = self
                .client
                .list_api_group_resources(&gv.group_version)
                .await
                .with_context(|| format!("listing resources for {}", gv.group_version))?;
            out.push(to_group(list));
        }
        Ok(out)
    }
}

#[derive(Default)]
struct CacheState {
    epoch: u64,
    cached: Option<Arc<Vec<DiscoveryGroup>>>,
}

/// Caches the first discovery result until invalidated. A fetch that started
/// before an invalidation is returned to its caller but not cached.
pub struct MemCacheDiscovery<D> {
    inner: D,
    state: Mutex<CacheState>,
}

impl<D: DiscoveryClient> MemCacheDiscovery<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, state: Mutex::new(CacheState::default()) }
    }

    pub fn is_fresh(&self) -> bool { self.state.lock().cached.is_some() }
}

#[async_trait::async_trait]
impl<D: DiscoveryClient> DiscoveryClient for MemCacheDiscovery<D> {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveryGroup>> {
        let epoch = {
            let st = self.state.lock();
            if let Some(cached) = st.cached.as_ref() {
                return Ok(Vec::clone(cached));
            }
            st.epoch
        };
        let fresh = self.inner.server_preferred_resources().await?;
        let mut st = self.state.lock();
        if st.epoch == epoch {
            st.cached = Some(Arc::new(fresh.clone()));
        }
        Ok(fresh)
    }
}

impl<D: DiscoveryClient> Invalidatable for MemCacheDiscovery<D> {
    fn invalidate(&self) {
        let mut st = self.state.lock();
        st.epoch += 1;
        st.cached = None;
    }
}

/// Simple in-memory discovery for tests and demos.
#[derive(Default)]
pub struct MockDiscovery {
    groups: Mutex<Vec<DiscoveryGroup>>,
    failures: Mutex<VecDeque<String>>,
    calls: Mutex<u64>,
}

impl MockDiscovery {
    pub fn new() -> Self { Self::default() }

    /// Add a group-version; each resource is `(plural, kind)`, namespaced, with the usual verbs.
    pub fn push_group(&self, group_version: &str, resources: &[(&str, &str)]) {
        let resources = resources
            .iter()
            .map(|(name, kind)| DiscoveredResource {
                name: (*name).to_string(),
                singular_name: kind.to_ascii_lowercase(),
                namespaced: true,
                kind: (*kind).to_string(),
                verbs: ["get", "list", "watch", "create", "update", "patch", "delete"].iter().map(|s| s.to_string()).collect(),
            })
            .collect();
        self.groups.lock().push(DiscoveryGroup { group_version: group_version.to_string(), resources });
    }

    pub fn set_groups(&self, groups: Vec<DiscoveryGroup>) { *self.groups.lock() = groups; }

    /// Make the next call fail with `msg`.
    pub fn fail_next(&self, msg: &str) { self.failures.lock().push_back(msg.to_string()); }

    /// Number of calls that reached this client.
    pub fn calls(&self) -> u64 { *self.calls.lock() }
}

#[async_trait::async_trait]
impl DiscoveryClient for MockDiscovery {
    async fn server_preferred_resources(&self) -> Result<Vec<DiscoveryGroup>> {
        *self.calls.lock() += 1;
        if let Some(msg) = self.failures.lock().pop_front() {
            return Err(anyhow!(msg));
        }
        Ok(self.groups.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;

    fn api_resource(name: &str, kind: &str, verbs: &[&str]) -> APIResource {
        APIResource {
            name: name.to_string(),
            singular_name: kind.to_ascii_lowercase(),
            namespaced: true,
            kind: kind.to_string(),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn to_group_skips_subresources_and_keeps_verbs() {
        let list = APIResourceList {
            group_version: "apps/v1".to_string(),
            resources: vec![
                api_resource("deployments", "Deployment", &["get", "list", "watch"]),
                api_resource("deployments/status", "Deployment", &["get", "patch"]),
                api_resource("deployments/scale", "Scale", &["get", "update"]),
            ],
        };
        let group = to_group(list);
        assert_eq!(group.group_version, "apps/v1");
        assert_eq!(group.resources.len(), 1);
        let d = &group.resources[0];
        assert_eq!(d.name, "deployments");
        assert_eq!(d.singular_name, "deployment");
        assert!(d.namespaced);
        assert_eq!(d.kind, "Deployment");
        assert_eq!(d.verbs.as_slice(), ["get", "list", "watch"]);
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let mock = Arc::new(MockDiscovery::new());
        mock.push_group("apps/v1", &[("deployments", "Deployment")]);
        let cache = MemCacheDiscovery::new(Arc::clone(&mock));

        assert_eq!(cache.server_preferred_resources().await.expect("ok").len(), 1);
        mock.push_group("v1", &[("pods", "Pod")]);
        assert_eq!(cache.server_preferred_resources().await.expect("ok").len(), 1);
        assert_eq!(mock.calls(), 1);

        cache.invalidate();
        assert!(!cache.is_fresh());
        assert_eq!(cache.server_preferred_resources().await.expect("ok").len(), 2);
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let mock = Arc::new(MockDiscovery::new());
        mock.push_group("v1", &[("pods", "Pod")]);
        mock.fail_next("boom");
        let cache = MemCacheDiscovery::new(Arc::clone(&mock));
        assert!(cache.server_preferred_resources().await.is_err());
        assert!(!cache.is_fresh());
        assert_eq!(cache.server_preferred_resources().await.expect("ok").len(), 1);
        assert!(cache.is_fresh());
    }
}
