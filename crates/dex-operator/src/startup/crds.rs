//! CRD installation utilities
//!
//! The operator installs its own CRDs on startup using server-side apply so
//! the served schema always matches the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use dex_common::crd::{Dex, DexClient};
use dex_common::FIELD_MANAGER;

/// Every CRD the operator serves
fn crds() -> Vec<CustomResourceDefinition> {
    vec![Dex::crd(), DexClient::crd()]
}

/// Install or update all CRDs using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}

/// All CRDs as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
    Ok(docs.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_names_follow_group_and_plural() {
        let names: Vec<String> = crds()
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect();
        assert_eq!(names, vec!["dexes.dex.karavel.io", "dexclients.dex.karavel.io"]);
    }

    #[test]
    fn manifests_contain_both_kinds() {
        let yaml = crd_manifests().expect("manifests");
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 2);
        assert!(yaml.contains("kind: Dex\n"));
        assert!(yaml.contains("kind: DexClient\n"));
        assert!(yaml.contains("---\n"));
    }

    #[test]
    fn status_is_a_subresource() {
        for crd in crds() {
            let version = &crd.spec.versions[0];
            assert_eq!(version.name, "v1alpha1");
            assert!(version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some());
        }
    }
}
