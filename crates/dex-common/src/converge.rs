//! Desired-state comparison for child objects
//!
//! A write is issued in two phases. First the desired canonical form is
//! reduced to the fields this controller owns. Then those fields are compared
//! against the live object, and a merge patch is produced only when at least
//! one owned field differs. Fields set by other actors (defaulted container
//! settings, an allocated `clusterIP`, foreign labels) never cause a write.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::ObjectMeta;
use serde_json::{Map, Value};

use crate::Error;

/// Kind of a child object, used where only the identity is needed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    /// core/v1 ConfigMap
    ConfigMap,
    /// core/v1 ServiceAccount
    ServiceAccount,
    /// rbac/v1 ClusterRole
    ClusterRole,
    /// rbac/v1 ClusterRoleBinding
    ClusterRoleBinding,
    /// apps/v1 Deployment
    Deployment,
    /// core/v1 Service
    Service,
    /// networking/v1 Ingress
    Ingress,
}

impl ChildKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::ServiceAccount => "ServiceAccount",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
        }
    }

    /// Paths of the fields this controller owns on an existing object
    fn owned_paths(&self) -> &'static [&'static [&'static str]] {
        const LABELS: &[&str] = &["metadata", "labels"];
        const ANNOTATIONS: &[&str] = &["metadata", "annotations"];
        const OWNERS: &[&str] = &["metadata", "ownerReferences"];

        match self {
            Self::ConfigMap => &[LABELS, ANNOTATIONS, OWNERS, &["data"]],
            Self::ServiceAccount => &[LABELS, ANNOTATIONS, OWNERS],
            Self::ClusterRole => &[LABELS, &["rules"]],
            Self::ClusterRoleBinding => &[LABELS, &["roleRef"], &["subjects"]],
            Self::Deployment => &[
                LABELS,
                ANNOTATIONS,
                OWNERS,
                &["spec", "replicas"],
                &["spec", "template"],
            ],
            Self::Service => &[LABELS, ANNOTATIONS, OWNERS, &["spec", "type"], &["spec", "ports"]],
            Self::Ingress => &[LABELS, ANNOTATIONS, OWNERS, &["spec"]],
        }
    }
}

impl std::fmt::Display for ChildKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child object in canonical form, one variant per supported kind
#[derive(Clone, Debug, PartialEq)]
pub enum ChildObject {
    /// Configuration holder
    ConfigMap(ConfigMap),
    /// Workload identity
    ServiceAccount(ServiceAccount),
    /// Cluster-wide permissions
    ClusterRole(ClusterRole),
    /// Cluster-wide permission grant
    ClusterRoleBinding(ClusterRoleBinding),
    /// Workload
    Deployment(Deployment),
    /// Network identity
    Service(Service),
    /// Public routing
    Ingress(Ingress),
}

impl ChildObject {
    /// Kind of this object
    pub fn kind(&self) -> ChildKind {
        match self {
            Self::ConfigMap(_) => ChildKind::ConfigMap,
            Self::ServiceAccount(_) => ChildKind::ServiceAccount,
            Self::ClusterRole(_) => ChildKind::ClusterRole,
            Self::ClusterRoleBinding(_) => ChildKind::ClusterRoleBinding,
            Self::Deployment(_) => ChildKind::Deployment,
            Self::Service(_) => ChildKind::Service,
            Self::Ingress(_) => ChildKind::Ingress,
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::ConfigMap(o) => &o.metadata,
            Self::ServiceAccount(o) => &o.metadata,
            Self::ClusterRole(o) => &o.metadata,
            Self::ClusterRoleBinding(o) => &o.metadata,
            Self::Deployment(o) => &o.metadata,
            Self::Service(o) => &o.metadata,
            Self::Ingress(o) => &o.metadata,
        }
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, `None` for cluster-scoped kinds
    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    /// `Kind namespace/name` for logs
    pub fn display_name(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{} {}/{}", self.kind(), ns, self.name()),
            None => format!("{} {}", self.kind(), self.name()),
        }
    }

    /// Full JSON form of the object
    pub fn to_value(&self) -> Result<Value, Error> {
        let value = match self {
            Self::ConfigMap(o) => serde_json::to_value(o),
            Self::ServiceAccount(o) => serde_json::to_value(o),
            Self::ClusterRole(o) => serde_json::to_value(o),
            Self::ClusterRoleBinding(o) => serde_json::to_value(o),
            Self::Deployment(o) => serde_json::to_value(o),
            Self::Service(o) => serde_json::to_value(o),
            Self::Ingress(o) => serde_json::to_value(o),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind().as_str(), e.to_string()))
    }

    /// The subset of the object this controller owns on an existing object
    pub fn owned_fields(&self) -> Result<Value, Error> {
        let full = self.to_value()?;
        let mut owned = Value::Object(Map::new());
        for path in self.kind().owned_paths() {
            if let Some(v) = lookup(&full, path) {
                insert(&mut owned, path, v.clone());
            }
        }
        Ok(owned)
    }
}

/// Result of converging one child object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Object did not exist and was created
    Created,
    /// Object existed and owned fields were patched
    Updated,
    /// Object already matched; nothing was written
    Unchanged,
}

impl WriteOutcome {
    /// True when something was written
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// A converged child object as returned by the store
#[derive(Clone, Debug, PartialEq)]
pub struct Applied {
    /// What the write did
    pub outcome: WriteOutcome,
    /// Live object after the write
    pub live: ChildObject,
}

/// Decide how to update an existing object.
///
/// Returns `None` when every owned field already matches, otherwise the
/// merge patch to send. The patch carries the observed `resourceVersion`
/// as an optimistic concurrency precondition.
pub fn plan_update(desired: &ChildObject, observed: &Value) -> Result<Option<Value>, Error> {
    let mut owned = desired.owned_fields()?;
    if is_subset(&owned, observed) {
        return Ok(None);
    }
    if let Some(rv) = lookup(observed, &["metadata", "resourceVersion"]) {
        insert(&mut owned, &["metadata", "resourceVersion"], rv.clone());
    }
    Ok(Some(owned))
}

/// True if every value in `desired` is present and equal in `observed`.
///
/// Objects are compared key by key, so extra keys on `observed` are
/// ignored. Arrays must have the same length and are compared element-wise
/// with the same rule, which tolerates server-defaulted fields inside list
/// items such as container ports. A `null` in `desired` matches an absent
/// or `null` value.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(d), Value::Object(o)) => d.iter().all(|(k, dv)| match o.get(k) {
            Some(ov) => is_subset(dv, ov),
            None => dv.is_null(),
        }),
        (Value::Array(d), Value::Array(o)) => {
            d.len() == o.len() && d.iter().zip(o).all(|(dv, ov)| is_subset(dv, ov))
        }
        (Value::Null, Value::Null) => true,
        (d, o) => d == o,
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn insert(target: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = target;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        cursor = match cursor {
            Value::Object(map) => map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new())),
            _ => return,
        };
    }
    if let Value::Object(map) = cursor {
        map.insert(last.to_string(), value);
    }
}
