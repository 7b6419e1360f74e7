//! apiwatch schema: enumerate the resource types a definer object (CRD or APIBinding) declares.

#![forbid(unsafe_code)]

use apiwatch_core::{DefinerId, DefinerKind, ResourceDescriptor};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// Annotation kcp stamps on objects with their logical cluster.
pub const CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

const CRD_GROUP: &str = "apiextensions.k8s.io";
const APIBINDING_GROUP: &str = "apis.kcp.io";

#[derive(Debug, thiserror::Error)]
pub enum DefinerError {
    #[error("unexpected definer kind: {0}")]
    UnexpectedKind(String),
    #[error("malformed {kind} {name}: {reason}")]
    Malformed { kind: &'static str, name: String, reason: String },
}

/// Yields the resource types an object currently declares.
///
/// Implementations are pure: the same state always yields the same sequence,
/// and `resources` can be called any number of times.
pub trait EnumerateResources {
    fn resources(&self) -> Box<dyn Iterator<Item = ResourceDescriptor> + '_>;
}

/// Resource types declared by a CustomResourceDefinition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdDefiner {
    pub group: String,
    pub versions: Vec<String>,
    /// Accepted plural; empty until the apiserver has accepted the names.
    pub plural: String,
}

impl EnumerateResources for CrdDefiner {
    fn resources(&self) -> Box<dyn Iterator<Item = ResourceDescriptor> + '_> {
        if self.plural.is_empty() {
            return Box::new(std::iter::empty());
        }
        Box::new(self.versions.iter().map(move |v| ResourceDescriptor::new(&self.group, v, &self.plural)))
    }
}

/// A resource bound by an APIBinding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundResource {
    pub group: String,
    pub resource: String,
    pub storage_versions: Vec<String>,
}

/// Resource types declared by a kcp APIBinding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiBindingDefiner {
    pub bound: Vec<BoundResource>,
}

impl EnumerateResources for ApiBindingDefiner {
    fn resources(&self) -> Box<dyn Iterator<Item = ResourceDescriptor> + '_> {
        Box::new(self.bound.iter().flat_map(|br| {
            br.storage_versions
                .iter()
                .map(move |v| ResourceDescriptor::new(&br.group, v, &br.resource))
        }))
    }
}

/// The closed set of object kinds that can define resource types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Definer {
    Crd(CrdDefiner),
    ApiBinding(ApiBindingDefiner),
}

impl EnumerateResources for Definer {
    fn resources(&self) -> Box<dyn Iterator<Item = ResourceDescriptor> + '_> {
        match self {
            Definer::Crd(d) => d.resources(),
            Definer::ApiBinding(d) => d.resources(),
        }
    }
}

// Wire shapes: only the fields read here.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrdBody {
    #[serde(default)]
    spec: CrdSpec,
    #[serde(default)]
    status: Option<CrdStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct CrdSpec {
    #[serde(default)]
    group: String,
    #[serde(default)]
    versions: Vec<CrdVersion>,
}

#[derive(Debug, Default, Deserialize)]
struct CrdVersion {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrdStatus {
    #[serde(default)]
    accepted_names: Option<CrdNames>,
}

#[derive(Debug, Default, Deserialize)]
struct CrdNames {
    #[serde(default)]
    plural: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiBindingBody {
    #[serde(default)]
    status: Option<ApiBindingStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiBindingStatus {
    #[serde(default)]
    bound_resources: Vec<BoundResourceBody>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundResourceBody {
    #[serde(default)]
    group: String,
    resource: String,
    #[serde(default)]
    storage_versions: Vec<String>,
}

/// Classify an object by its `apiVersion`/`kind`.
pub fn definer_kind(obj: &DynamicObject) -> Result<DefinerKind, DefinerError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| DefinerError::UnexpectedKind("<missing apiVersion/kind>".to_string()))?;
    let group = types.api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    match (group, types.kind.as_str()) {
        (CRD_GROUP, "CustomResourceDefinition") => Ok(DefinerKind::Crd),
        (APIBINDING_GROUP, "APIBinding") => Ok(DefinerKind::ApiBinding),
        _ => Err(DefinerError::UnexpectedKind(format!("{}, Kind={}", types.api_version, types.kind))),
    }
}

/// Identity of a definer object. The cluster comes from the kcp cluster
/// annotation when present, else `default_cluster`.
pub fn definer_id(obj: &DynamicObject, default_cluster: &str) -> Result<DefinerId, DefinerError> {
    let kind = definer_kind(obj)?;
    let name = obj.metadata.name.clone().ok_or_else(|| DefinerError::Malformed {
        kind: kind.as_str(),
        name: String::new(),
        reason: "missing metadata.name".to_string(),
    })?;
    let cluster = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CLUSTER_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| default_cluster.to_string());
    Ok(DefinerId::new(kind, cluster, obj.metadata.namespace.clone(), name))
}

impl Definer {
    /// Decode the definer variant of a notified object.
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Self, DefinerError> {
        let kind = definer_kind(obj)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let malformed = |e: serde_json::Error| DefinerError::Malformed {
            kind: kind.as_str(),
            name: name.clone(),
            reason: e.to_string(),
        };
        match kind {
            DefinerKind::Crd => {
                let body: CrdBody = serde_json::from_value(obj.data.clone()).map_err(malformed)?;
                let plural = body
                    .status
                    .and_then(|s| s.accepted_names)
                    .map(|n| n.plural)
                    .unwrap_or_default();
                Ok(Definer::Crd(CrdDefiner {
                    group: body.spec.group,
                    versions: body.spec.versions.into_iter().map(|v| v.name).collect(),
                    plural,
                }))
            }
            DefinerKind::ApiBinding => {
                let body: ApiBindingBody = serde_json::from_value(obj.data.clone()).map_err(malformed)?;
                let bound = body
                    .status
                    .map(|s| s.bound_resources)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| BoundResource { group: b.group, resource: b.resource, storage_versions: b.storage_versions })
                    .collect();
                Ok(Definer::ApiBinding(ApiBindingDefiner { bound }))
            }
        }
    }

    pub fn kind(&self) -> DefinerKind {
        match self {
            Definer::Crd(_) => DefinerKind::Crd,
            Definer::ApiBinding(_) => DefinerKind::ApiBinding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(v: serde_json::Value) -> DynamicObject {
        serde_json::from_value(v).expect("valid DynamicObject")
    }

    fn crd(versions: &[&str], plural: Option<&str>) -> DynamicObject {
        let mut v = serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": "widgets.example.io" },
            "spec": {
                "group": "example.io",
                "names": { "plural": "widgets", "kind": "Widget" },
                "scope": "Namespaced",
                "versions": versions.iter().map(|n| serde_json::json!({ "name": n, "served": true, "storage": false })).collect::<Vec<_>>(),
            }
        });
        if let Some(p) = plural {
            v["status"] = serde_json::json!({ "acceptedNames": { "plural": p, "kind": "Widget" } });
        }
        dynamic(v)
    }

    #[test]
    fn crd_emits_one_descriptor_per_version() {
        let d = Definer::from_dynamic(&crd(&["v1", "v2"], Some("widgets"))).expect("crd");
        assert_eq!(d.kind(), DefinerKind::Crd);
        let got: Vec<_> = d.resources().collect();
        assert_eq!(got, vec![
            ResourceDescriptor::new("example.io", "v1", "widgets"),
            ResourceDescriptor::new("example.io", "v2", "widgets"),
        ]);
        // restartable
        assert_eq!(d.resources().count(), 2);
    }

    #[test]
    fn crd_without_accepted_names_defines_nothing() {
        let d = Definer::from_dynamic(&crd(&["v1"], None)).expect("crd");
        assert_eq!(d.resources().count(), 0);
    }

    #[test]
    fn apibinding_emits_group_storage_versions() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "apis.kcp.io/v1alpha1",
            "kind": "APIBinding",
            "metadata": { "name": "kube", "annotations": { "kcp.io/cluster": "abc123" } },
            "spec": { "reference": { "export": { "path": "root", "name": "kubernetes" } } },
            "status": {
                "boundResources": [
                    { "group": "apps", "resource": "deployments", "storageVersions": ["v1"] },
                    { "group": "", "resource": "services", "storageVersions": ["v1", "v2"] },
                ]
            }
        }));
        let d = Definer::from_dynamic(&obj).expect("binding");
        let got: Vec<_> = d.resources().collect();
        assert_eq!(got, vec![
            ResourceDescriptor::new("apps", "v1", "deployments"),
            ResourceDescriptor::new("", "v1", "services"),
            ResourceDescriptor::new("", "v2", "services"),
        ]);
        let id = definer_id(&obj, "fallback").expect("id");
        assert_eq!(id.cluster, "abc123");
        assert_eq!(id.kind, DefinerKind::ApiBinding);
        assert_eq!(id.name, "kube");
    }

    #[test]
    fn unexpected_kind_is_rejected() {
        let obj = dynamic(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm" },
        }));
        assert!(matches!(Definer::from_dynamic(&obj), Err(DefinerError::UnexpectedKind(_))));
        assert!(definer_id(&obj, "root").is_err());
    }

    #[test]
    fn id_defaults_to_notifier_cluster() {
        let id = definer_id(&crd(&["v1"], Some("widgets")), "root").expect("id");
        assert_eq!(id, DefinerId::new(DefinerKind::Crd, "root", None, "widgets.example.io"));
    }
}
