//! Credentials Secret of a confidential client

use std::collections::BTreeMap;

use dex_common::crd::DexClient;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

/// Secret holding the client identifier, client secret and issuer URL,
/// owned by the client
pub fn credential_secret(
    client: &DexClient,
    client_id: &str,
    issuer_url: &str,
    client_secret: &str,
) -> Secret {
    let template = client.spec.template.as_ref().map(|t| &t.metadata);
    let labels = template.map(|m| m.labels.clone()).unwrap_or_default();
    let annotations = template.map(|m| m.annotations.clone()).unwrap_or_default();

    Secret {
        metadata: ObjectMeta {
            name: Some(client.secret_name()),
            namespace: client.namespace(),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: client.controller_owner_ref(&()).map(|o| vec![o]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                client.client_id_key().to_string(),
                ByteString(client_id.as_bytes().to_vec()),
            ),
            (
                client.client_secret_key().to_string(),
                ByteString(client_secret.as_bytes().to_vec()),
            ),
            (
                client.issuer_url_key().to_string(),
                ByteString(issuer_url.as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    }
}
