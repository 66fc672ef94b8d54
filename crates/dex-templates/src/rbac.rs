//! Identity and permissions for Dex pods
//!
//! Dex with Kubernetes storage keeps its state in `dex.coreos.com` CRDs and
//! creates them on first start, which needs cluster-scoped permissions.

use dex_common::crd::Dex;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::{labels, owner_references};

/// Name of the ClusterRole shared by every instance
pub const INSTANCE_CLUSTER_ROLE: &str = "dex-operator-instance";

/// ServiceAccount the Dex pods run as, named after the instance
pub fn service_account(dex: &Dex) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(dex.name_any()),
            namespace: dex.namespace(),
            labels: Some(labels(dex)),
            owner_references: owner_references(dex),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Shared ClusterRole for Dex storage
pub fn cluster_role(dex: &Dex) -> ClusterRole {
    let mut labels = labels(dex);
    // Shared between instances, so it carries no per-instance identity
    labels.retain(|k, _| k == dex_common::LABEL_NAME || k == dex_common::LABEL_MANAGED_BY);

    ClusterRole {
        metadata: ObjectMeta {
            name: Some(INSTANCE_CLUSTER_ROLE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["dex.coreos.com".to_string()]),
                resources: Some(vec!["*".to_string()]),
                verbs: vec!["*".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["apiextensions.k8s.io".to_string()]),
                resources: Some(vec!["customresourcedefinitions".to_string()]),
                verbs: vec!["create".to_string()],
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Binding of the instance ServiceAccount to the shared ClusterRole.
///
/// Cluster-scoped objects cannot be owned by a namespaced one, so the
/// binding has no owner reference.
pub fn cluster_role_binding(dex: &Dex) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(dex.cluster_role_binding_name()),
            labels: Some(labels(dex)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: INSTANCE_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: dex.name_any(),
            namespace: dex.namespace(),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn binding_targets_instance_service_account() {
        let dex = testing::dex();
        let sa = service_account(&dex);
        let crb = cluster_role_binding(&dex);

        assert_eq!(crb.metadata.name.as_deref(), Some("dex-auth-idp"));
        assert!(crb.metadata.owner_references.is_none());
        assert_eq!(crb.role_ref.name, INSTANCE_CLUSTER_ROLE);
        let subject = &crb.subjects.as_ref().expect("subjects")[0];
        assert_eq!(Some(subject.name.clone()), sa.metadata.name);
        assert_eq!(subject.namespace, sa.metadata.namespace);
        assert!(sa.metadata.owner_references.is_some());
    }

    #[test]
    fn cluster_role_is_instance_independent() {
        let a = cluster_role(&testing::dex());
        let mut other = testing::dex();
        other.metadata.name = Some("second".to_string());
        other.spec.instance_labels.clear();
        assert_eq!(a, cluster_role(&other));
        assert_eq!(a.rules.as_ref().expect("rules").len(), 2);
    }
}
