//! Dex CRD: one identity-provider deployment
//!
//! A Dex resource declares the public issuer URL and upstream connectors of a
//! Dex instance. The instance controller turns it into a ConfigMap,
//! Deployment, Services, RBAC and an optional Ingress, and publishes the
//! administrative gRPC address in status for the client controller.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, Phase};
use crate::kube_utils::resource_key;
use crate::Error;

/// Desired state of a Dex instance.
///
/// Example:
/// ```yaml
/// apiVersion: dex.karavel.io/v1alpha1
/// kind: Dex
/// metadata:
///   name: idp
///   namespace: auth
/// spec:
///   publicUrl: https://login.example.com/dex
///   connectors:
///     - type: github
///       id: github
///       name: GitHub
///       config:
///         clientID: abc
///         clientSecret: $GITHUB_SECRET
///   ingress:
///     enabled: true
///     tlsEnabled: true
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dex.karavel.io",
    version = "v1alpha1",
    kind = "Dex",
    plural = "dexes",
    namespaced,
    status = "DexStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".spec.publicUrl"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DexSpec {
    /// Externally reachable base URL; also the OIDC issuer
    pub public_url: String,

    /// Upstream identity connectors
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<Connector>,

    /// Number of Dex pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Container image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Labels applied to every child object and to the pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_labels: BTreeMap<String, String>,

    /// Compute resources for the Dex container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Public routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

/// One upstream connector, passed through to Dex configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    /// Connector type (github, ldap, oidc, ...)
    #[serde(rename = "type")]
    pub type_: String,

    /// Display name
    pub name: String,

    /// Identifier, unique within the instance
    pub id: String,

    /// Connector-specific configuration, stored as-is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Option<serde_json::Value>,
}

/// Ingress settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Create the Ingress. When false an existing Ingress is deleted.
    #[serde(default)]
    pub enabled: bool,

    /// Terminate TLS at the Ingress
    #[serde(default)]
    pub tls_enabled: bool,

    /// TLS secret name, defaults to `{host}-tls`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,

    /// IngressClass to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Extra labels for the Ingress
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Extra annotations for the Ingress (cert-manager, ingress controller tuning)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Observed state of a Dex instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DexStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// True once every child object has converged
    #[serde(default)]
    pub ready: bool,

    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,

    /// `host:port` of the administrative gRPC API
    #[serde(default)]
    pub endpoint_address: Option<String>,

    /// Generation the status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl DexStatus {
    /// Status for a resource whose first pass is in progress
    pub fn initialising(observed_generation: Option<i64>) -> Self {
        Self {
            phase: Phase::Initialising,
            ready: false,
            message: None,
            endpoint_address: None,
            observed_generation,
        }
    }

    /// Status after a fully successful pass
    pub fn active(endpoint_address: String, observed_generation: Option<i64>) -> Self {
        Self {
            phase: Phase::Active,
            ready: true,
            message: Some("active".to_string()),
            endpoint_address: Some(endpoint_address),
            observed_generation,
        }
    }

    /// Status after a failed pass. Never ready, never advertises an endpoint.
    pub fn failing(message: impl Into<String>, observed_generation: Option<i64>) -> Self {
        Self {
            phase: Phase::Failing,
            ready: false,
            message: Some(message.into()),
            endpoint_address: None,
            observed_generation,
        }
    }
}

impl DexSpec {
    /// Whether the Ingress child should exist
    pub fn ingress_enabled(&self) -> bool {
        self.ingress.as_ref().is_some_and(|i| i.enabled)
    }
}

impl Dex {
    /// Check `spec` for values Dex would reject at startup
    pub fn validate(&self) -> Result<(), Error> {
        let key = resource_key(self);
        let spec = &self.spec;
        let url = url::Url::parse(&spec.public_url).map_err(|e| {
            Error::validation_for_field(&key, "spec.publicUrl", format!("invalid URL: {e}"))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::validation_for_field(
                &key,
                "spec.publicUrl",
                format!("scheme must be http or https, got {}", url.scheme()),
            ));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::validation_for_field(
                &key,
                "spec.publicUrl",
                "URL must include a host",
            ));
        }

        if spec.replicas.is_some_and(|r| r < 0) {
            return Err(Error::validation_for_field(
                &key,
                "spec.replicas",
                "replicas cannot be negative",
            ));
        }

        let mut ids = BTreeSet::new();
        for connector in &spec.connectors {
            if connector.id.is_empty() {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.connectors",
                    "connector id cannot be empty",
                ));
            }
            if !ids.insert(connector.id.as_str()) {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.connectors",
                    format!("duplicate connector id {}", connector.id),
                ));
            }
        }

        Ok(())
    }

    /// Status, or the default (Uninitialized) when none was recorded yet
    pub fn status_or_default(&self) -> DexStatus {
        self.status.clone().unwrap_or_default()
    }

    /// True when the instance controller has published a usable endpoint
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.ready && s.endpoint_address.as_deref().is_some_and(|a| !a.is_empty())
        })
    }

    /// Name of the Service exposing the HTTP and gRPC ports
    pub fn api_service_name(&self) -> String {
        self.name_any()
    }

    /// Name of the Service exposing the telemetry port
    pub fn metrics_service_name(&self) -> String {
        format!("{}-metrics", self.name_any())
    }

    /// Name of the ConfigMap holding `config.yaml`
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    /// Name of the cluster-scoped binding granting this instance's
    /// ServiceAccount access to Dex's storage CRDs
    pub fn cluster_role_binding_name(&self) -> String {
        format!(
            "dex-{}-{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
