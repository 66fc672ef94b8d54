//! Shared Kubernetes helpers for the Dex controllers

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};

use crate::{Error, FIELD_MANAGER, GRPC_PORT_NAME};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients. Watches time out server-side first.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {e}"),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {e}"),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {e}"))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// `namespace/name` key used in logs, errors and status
pub fn resource_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// True for an API error with HTTP status 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Address of the administrative gRPC API behind a Dex Service.
///
/// Uses the Service's in-cluster DNS name and the port named `grpc`.
pub fn registrar_address(service: &Service) -> Result<String, Error> {
    let key = resource_key(service);
    let port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(GRPC_PORT_NAME))
        })
        .map(|p| p.port)
        .ok_or_else(|| {
            Error::dependency(&key, format!("service has no port named '{GRPC_PORT_NAME}'"))
        })?;
    let namespace = service
        .namespace()
        .ok_or_else(|| Error::dependency(&key, "service has no namespace"))?;
    Ok(format!("{}.{}:{}", service.name_any(), namespace, port))
}

/// Finalizer list with `finalizer` appended, or `None` if already present
pub fn with_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if current.iter().any(|f| f == finalizer) {
        return None;
    }
    let mut finalizers = current.to_vec();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with `finalizer` removed, or `None` if it was absent
pub fn without_finalizer(current: &[String], finalizer: &str) -> Option<Vec<String>> {
    if !current.iter().any(|f| f == finalizer) {
        return None;
    }
    Some(
        current
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect(),
    )
}

/// Merge patch replacing `metadata.finalizers`.
///
/// Carries the observed `resourceVersion` so a concurrent writer makes the
/// patch fail with 409 instead of being overwritten.
pub fn finalizers_patch(
    finalizers: &[String],
    resource_version: Option<&str>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::String(rv.to_string());
    }
    serde_json::json!({ "metadata": metadata })
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Status blocks are owned by exactly one controller, so the patch is a
/// plain merge without a version precondition.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
) -> Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(status).map_err(kube::Error::SerdeError)?;
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge patch body replacing a status block.
///
/// Status fields have no `skip_serializing_if`: a `None` goes out as `null`,
/// which deletes the stored value instead of leaving it in place.
pub fn status_patch(status: &impl serde::Serialize) -> serde_json::Result<serde_json::Value> {
    Ok(serde_json::json!({ "status": serde_json::to_value(status)? }))
}

/// Truncated SHA-256 hex digest, stable across toolchains
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..16]
        .iter()
        .fold(String::with_capacity(32), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DexClientStatus, DexStatus};
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    fn service(ports: Vec<(&str, i32)>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("idp".to_string()),
                namespace: Some("auth".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .into_iter()
                        .map(|(name, port)| ServicePort {
                            name: Some(name.to_string()),
                            port,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn registrar_address_uses_grpc_port() {
        let svc = service(vec![("http", 5556), ("grpc", 5557)]);
        assert_eq!(registrar_address(&svc).expect("address"), "idp.auth:5557");
    }

    #[test]
    fn registrar_address_requires_grpc_port() {
        let svc = service(vec![("http", 5556)]);
        let err = registrar_address(&svc).unwrap_err();
        assert!(err.to_string().contains("no port named 'grpc'"));
        assert!(err.is_retryable());
    }

    #[test]
    fn resource_key_includes_namespace() {
        let svc = service(vec![]);
        assert_eq!(resource_key(&svc), "auth/idp");
    }

    #[test]
    fn finalizer_list_helpers() {
        let current = vec!["other".to_string()];
        let added = with_finalizer(&current, "mine").expect("added");
        assert_eq!(added, vec!["other".to_string(), "mine".to_string()]);
        assert!(with_finalizer(&added, "mine").is_none());

        let removed = without_finalizer(&added, "mine").expect("removed");
        assert_eq!(removed, vec!["other".to_string()]);
        assert!(without_finalizer(&removed, "mine").is_none());
    }

    #[test]
    fn finalizers_patch_carries_resource_version() {
        let patch = finalizers_patch(&["mine".to_string()], Some("42"));
        assert_eq!(patch["metadata"]["finalizers"][0], "mine");
        assert_eq!(patch["metadata"]["resourceVersion"], "42");

        let patch = finalizers_patch(&[], None);
        assert!(patch["metadata"].get("resourceVersion").is_none());
        assert_eq!(patch["metadata"]["finalizers"], serde_json::json!([]));
    }

    #[test]
    fn not_found_detection() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&err));
    }

    /// Apply a status patch to a stored object the way the API server does
    fn apply_status<S>(stored: &S, next: &S) -> S
    where
        S: serde::Serialize + serde::de::DeserializeOwned,
    {
        let mut object = serde_json::json!({
            "metadata": { "name": "web", "namespace": "apps" },
            "status": serde_json::to_value(stored).expect("stored"),
        });
        json_patch::merge(&mut object, &status_patch(next).expect("patch"));
        serde_json::from_value(object["status"].clone()).expect("re-read")
    }

    /// Story: a client that stops working loses the client id it advertised
    #[test]
    fn story_failing_client_status_clears_stored_fields() {
        let active = DexClientStatus::active(
            "apps_web".to_string(),
            false,
            "auth/idp".to_string(),
            Some(1),
        );
        let failing = DexClientStatus::failing("registrar unreachable", &active, Some(2));

        let reread = apply_status(&active, &failing);

        assert_eq!(reread.client_id, None);
        assert_eq!(reread.registered_public, Some(false));
        assert_eq!(reread.registered_instance.as_deref(), Some("auth/idp"));
        // Equal to what the controller computed, so the next pass writes nothing
        assert_eq!(reread, failing);
    }

    #[test]
    fn initialising_client_status_clears_message() {
        let failing = DexClientStatus::failing("boom", &DexClientStatus::default(), Some(1));
        let initialising = DexClientStatus::initialising(&failing, Some(2));

        let reread = apply_status(&failing, &initialising);

        assert_eq!(reread.message, None);
        assert_eq!(reread, initialising);
    }

    /// Story: a failing instance stops advertising its gRPC endpoint
    #[test]
    fn story_failing_instance_status_clears_endpoint() {
        let active = DexStatus::active("idp.auth:5557".to_string(), Some(3));
        let failing = DexStatus::failing("deployment rejected", Some(4));

        let reread = apply_status(&active, &failing);

        assert_eq!(reread.endpoint_address, None);
        assert!(!reread.ready);
        assert_eq!(reread, failing);

        let initialising = DexStatus::initialising(Some(5));
        let reread = apply_status(&failing, &initialising);
        assert_eq!(reread.message, None);
        assert_eq!(reread, initialising);
    }

    #[test]
    fn status_patch_sends_null_for_cleared_fields() {
        let patch = status_patch(&DexStatus::failing("boom", None)).expect("patch");
        assert!(patch["status"]["endpointAddress"].is_null());
        assert!(patch["status"]
            .as_object()
            .is_some_and(|s| s.contains_key("endpointAddress")));
    }

    #[test]
    fn deterministic_hash_is_stable() {
        let a = deterministic_hash("issuer: https://idp.example.com");
        assert_eq!(a.len(), 32);
        assert_eq!(a, deterministic_hash("issuer: https://idp.example.com"));
        assert_ne!(a, deterministic_hash("issuer: https://other.example.com"));
    }
}
