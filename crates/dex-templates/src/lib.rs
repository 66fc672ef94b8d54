//! Canonical forms for the objects behind a Dex instance
//!
//! Every function here is pure: it maps a `Dex` (or `DexClient`) to the
//! desired object and performs no I/O. The reconcilers only compare the
//! fields they own, so anything else rendered here is applied on create and
//! left alone afterwards.

#![deny(missing_docs)]

mod config;
mod ingress;
mod rbac;
mod secret;
mod workload;

use std::collections::BTreeMap;

use dex_common::crd::Dex;
use dex_common::{LABEL_INSTANCE, LABEL_MANAGED_BY, LABEL_MANAGED_BY_DEX_OPERATOR, LABEL_NAME};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

pub use config::{config_checksum, config_map, CONFIG_CHECKSUM_ANNOTATION, CONFIG_KEY};
pub use ingress::ingress;
pub use rbac::{cluster_role, cluster_role_binding, service_account, INSTANCE_CLUSTER_ROLE};
pub use secret::credential_secret;
pub use workload::{api_service, deployment, metrics_service, DEFAULT_IMAGE};

/// Labels selecting the pods of one instance
pub fn selector_labels(dex: &Dex) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), "dex".to_string()),
        (LABEL_INSTANCE.to_string(), dex.name_any()),
    ])
}

/// Labels applied to every child object: `instanceLabels` plus the
/// standard app labels, which win on conflict
pub fn labels(dex: &Dex) -> BTreeMap<String, String> {
    let mut labels = dex.spec.instance_labels.clone();
    labels.extend(selector_labels(dex));
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_DEX_OPERATOR.to_string(),
    );
    labels
}

/// Controller owner reference to the instance, if it has been persisted
pub(crate) fn owner_references(dex: &Dex) -> Option<Vec<OwnerReference>> {
    dex.controller_owner_ref(&()).map(|owner| vec![owner])
}

#[cfg(test)]
pub(crate) mod testing {
    use dex_common::crd::{Dex, DexSpec};

    /// A persisted instance in namespace `auth`
    pub fn dex() -> Dex {
        let mut dex = Dex::new(
            "idp",
            DexSpec {
                public_url: "https://login.example.com/dex".to_string(),
                connectors: vec![],
                replicas: None,
                image: None,
                instance_labels: [("team".to_string(), "platform".to_string())].into(),
                resources: None,
                ingress: None,
            },
        );
        dex.metadata.namespace = Some("auth".to_string());
        dex.metadata.uid = Some("0b5f5a3e-0000-4000-8000-000000000001".to_string());
        dex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_labels_override_instance_labels() {
        let mut dex = testing::dex();
        dex.spec
            .instance_labels
            .insert(LABEL_NAME.to_string(), "not-dex".to_string());
        let labels = labels(&dex);
        assert_eq!(labels[LABEL_NAME], "dex");
        assert_eq!(labels[LABEL_INSTANCE], "idp");
        assert_eq!(labels["team"], "platform");
        assert_eq!(labels[LABEL_MANAGED_BY], "dex-operator");
    }

    #[test]
    fn owner_reference_points_at_instance() {
        let owners = owner_references(&testing::dex()).expect("owner");
        assert_eq!(owners[0].kind, "Dex");
        assert_eq!(owners[0].name, "idp");
        assert_eq!(owners[0].controller, Some(true));
    }
}
