//! DexClient CRD: one OAuth2/OIDC client registered on a Dex instance
//!
//! The client controller registers the client over Dex's gRPC API and, for
//! confidential clients, stores the generated credentials in a Secret owned
//! by the DexClient.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Phase;
use crate::kube_utils::resource_key;
use crate::Error;

/// Finalizer guarding the remote registration
pub const CLIENT_FINALIZER: &str = "clients.finalizers.dex.karavel.io";

/// Secret key holding the client identifier unless overridden
pub const DEFAULT_CLIENT_ID_KEY: &str = "clientId";

/// Secret key holding the client secret unless overridden
pub const DEFAULT_CLIENT_SECRET_KEY: &str = "clientSecret";

/// Secret key holding the issuer URL unless overridden
pub const DEFAULT_ISSUER_URL_KEY: &str = "issuerUrl";

/// Desired state of a Dex client registration.
///
/// Example:
/// ```yaml
/// apiVersion: dex.karavel.io/v1alpha1
/// kind: DexClient
/// metadata:
///   name: grafana
///   namespace: monitoring
/// spec:
///   name: Grafana
///   redirectUris:
///     - https://grafana.example.com/login/generic_oauth
///   instanceRef:
///     name: idp
///     namespace: auth
///   template:
///     metadata:
///       name: grafana-oidc
///     clientSecretKey: GF_AUTH_GENERIC_OAUTH_CLIENT_SECRET
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dex.karavel.io",
    version = "v1alpha1",
    kind = "DexClient",
    namespaced,
    status = "DexClientStatus",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceRef.name"}"#,
    printcolumn = r#"{"name":"Public","type":"boolean","jsonPath":".spec.public"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Client ID","type":"string","jsonPath":".status.clientId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DexClientSpec {
    /// Display name shown on the Dex login screen
    #[serde(default)]
    pub name: String,

    /// Allowed OAuth2 callback URIs
    pub redirect_uris: Vec<String>,

    /// Public clients (SPAs, CLIs) authenticate without a secret.
    /// Cannot be changed after the client is registered.
    #[serde(default)]
    pub public: bool,

    /// Dex instance to register with. Cannot be changed after registration.
    pub instance_ref: InstanceRef,

    /// Shape of the generated credentials Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<SecretTemplate>,
}

/// Reference to a Dex instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    /// Name of the Dex resource
    pub name: String,

    /// Namespace of the Dex resource, defaults to the client's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Overrides for the credentials Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    /// Name, labels and annotations of the Secret
    #[serde(default)]
    pub metadata: SecretMeta,

    /// Key holding the client identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_key: Option<String>,

    /// Key holding the client secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_key: Option<String>,

    /// Key holding the issuer URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_url_key: Option<String>,
}

/// Metadata applied to the credentials Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    /// Secret name, defaults to `dex-{client}-credentials`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Observed state of a Dex client
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DexClientStatus {
    /// Current phase
    #[serde(default)]
    pub phase: Phase,

    /// True once the registration is asserted on the instance
    #[serde(default)]
    pub ready: bool,

    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,

    /// Identifier registered with Dex
    #[serde(default)]
    pub client_id: Option<String>,

    /// `public` flag of the last successful registration
    #[serde(default)]
    pub registered_public: Option<bool>,

    /// `namespace/name` of the instance holding the last successful registration
    #[serde(default)]
    pub registered_instance: Option<String>,

    /// Generation the status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl DexClientStatus {
    /// First pass in progress. Keeps what is known about earlier registrations.
    pub fn initialising(previous: &Self, observed_generation: Option<i64>) -> Self {
        Self {
            phase: Phase::Initialising,
            ready: false,
            message: None,
            client_id: None,
            registered_public: previous.registered_public,
            registered_instance: previous.registered_instance.clone(),
            observed_generation,
        }
    }

    /// Registration asserted
    pub fn active(
        client_id: String,
        public: bool,
        instance: String,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            phase: Phase::Active,
            ready: true,
            message: Some("active".to_string()),
            client_id: Some(client_id),
            registered_public: Some(public),
            registered_instance: Some(instance),
            observed_generation,
        }
    }

    /// Pass failed. The echoed client id is cleared; the registration record is kept.
    pub fn failing(
        message: impl Into<String>,
        previous: &Self,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            phase: Phase::Failing,
            ready: false,
            message: Some(message.into()),
            client_id: None,
            registered_public: previous.registered_public,
            registered_instance: previous.registered_instance.clone(),
            observed_generation,
        }
    }
}

impl DexClient {
    /// Identifier registered with Dex.
    ///
    /// `_` cannot occur in Kubernetes names, so distinct clients never collide.
    pub fn client_id(&self) -> String {
        format!("{}_{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Namespace of the referenced instance
    pub fn instance_namespace(&self) -> String {
        match self.spec.instance_ref.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => self.namespace().unwrap_or_default(),
        }
    }

    /// `namespace/name` of the referenced instance
    pub fn instance_key(&self) -> String {
        format!("{}/{}", self.instance_namespace(), self.spec.instance_ref.name)
    }

    /// Status, or the default (Uninitialized) when none was recorded yet
    pub fn status_or_default(&self) -> DexClientStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Name of the credentials Secret
    pub fn secret_name(&self) -> String {
        self.spec
            .template
            .as_ref()
            .and_then(|t| t.metadata.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("dex-{}-credentials", self.name_any()))
    }

    /// Secret key for the client identifier
    pub fn client_id_key(&self) -> &str {
        self.template_key(|t| t.client_id_key.as_deref(), DEFAULT_CLIENT_ID_KEY)
    }

    /// Secret key for the client secret
    pub fn client_secret_key(&self) -> &str {
        self.template_key(|t| t.client_secret_key.as_deref(), DEFAULT_CLIENT_SECRET_KEY)
    }

    /// Secret key for the issuer URL
    pub fn issuer_url_key(&self) -> &str {
        self.template_key(|t| t.issuer_url_key.as_deref(), DEFAULT_ISSUER_URL_KEY)
    }

    fn template_key<'a>(
        &'a self,
        pick: impl Fn(&'a SecretTemplate) -> Option<&'a str>,
        default: &'static str,
    ) -> &'a str {
        self.spec
            .template
            .as_ref()
            .and_then(pick)
            .filter(|k| !k.is_empty())
            .unwrap_or(default)
    }

    /// True once deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True when the registration finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLIENT_FINALIZER)
    }

    /// Check `spec` for values Dex would reject or that cannot be stored
    pub fn validate(&self) -> Result<(), Error> {
        let key = resource_key(self);

        if self.spec.instance_ref.name.is_empty() {
            return Err(Error::validation_for_field(
                &key,
                "spec.instanceRef.name",
                "instance name is required",
            ));
        }

        if self.spec.redirect_uris.is_empty() {
            return Err(Error::validation_for_field(
                &key,
                "spec.redirectUris",
                "at least one redirect URI is required",
            ));
        }
        for uri in &self.spec.redirect_uris {
            url::Url::parse(uri).map_err(|e| {
                Error::validation_for_field(
                    &key,
                    "spec.redirectUris",
                    format!("invalid redirect URI {uri}: {e}"),
                )
            })?;
        }

        let keys = [
            self.client_id_key(),
            self.client_secret_key(),
            self.issuer_url_key(),
        ];
        if keys[0] == keys[1] || keys[0] == keys[2] || keys[1] == keys[2] {
            return Err(Error::validation_for_field(
                &key,
                "spec.template",
                "secret keys for id, secret and issuer must be distinct",
            ));
        }

        Ok(())
    }

    /// Reject changes to fields that are fixed once the client is registered
    pub fn check_immutable(&self) -> Result<(), Error> {
        let Some(status) = self.status.as_ref() else {
            return Ok(());
        };
        let key = resource_key(self);

        if let Some(registered) = status.registered_public {
            if registered != self.spec.public {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.public",
                    format!(
                        "public is immutable: registered as {registered}, recreate the DexClient to change it"
                    ),
                ));
            }
        }

        if let Some(registered) = status.registered_instance.as_deref() {
            let wanted = self.instance_key();
            if registered != wanted {
                return Err(Error::validation_for_field(
                    &key,
                    "spec.instanceRef",
                    format!(
                        "instanceRef is immutable: registered on {registered}, not {wanted}"
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str, spec: DexClientSpec) -> DexClient {
        let mut c = DexClient::new(name, spec);
        c.metadata.namespace = Some("apps".to_string());
        c
    }

    fn spec() -> DexClientSpec {
        DexClientSpec {
            name: "Web".to_string(),
            redirect_uris: vec!["https://web.example.com/callback".to_string()],
            public: false,
            instance_ref: InstanceRef {
                name: "idp".to_string(),
                namespace: None,
            },
            template: None,
        }
    }

    #[test]
    fn dex_client_yaml() {
        let yaml = r#"
apiVersion: dex.karavel.io/v1alpha1
kind: DexClient
metadata:
  name: grafana
  namespace: monitoring
spec:
  name: Grafana
  redirectUris:
    - https://grafana.example.com/login/generic_oauth
  instanceRef:
    name: idp
    namespace: auth
  template:
    metadata:
      name: grafana-oidc
      labels:
        team: observability
    clientSecretKey: GF_AUTH_GENERIC_OAUTH_CLIENT_SECRET
"#;
        let c: DexClient = serde_yaml::from_str(yaml).expect("parse");
        assert!(!c.spec.public);
        assert_eq!(c.instance_key(), "auth/idp");
        assert_eq!(c.secret_name(), "grafana-oidc");
        assert_eq!(c.client_id_key(), DEFAULT_CLIENT_ID_KEY);
        assert_eq!(c.client_secret_key(), "GF_AUTH_GENERIC_OAUTH_CLIENT_SECRET");
        assert_eq!(c.issuer_url_key(), DEFAULT_ISSUER_URL_KEY);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn client_id_is_stable_and_namespaced() {
        let a = client("web", spec());
        assert_eq!(a.client_id(), "apps_web");
        assert_eq!(a.client_id(), client("web", spec()).client_id());

        let mut b = client("web", spec());
        b.metadata.namespace = Some("other".to_string());
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn instance_namespace_defaults_to_own_namespace() {
        let c = client("web", spec());
        assert_eq!(c.instance_key(), "apps/idp");

        let mut s = spec();
        s.instance_ref.namespace = Some(String::new());
        assert_eq!(client("web", s).instance_key(), "apps/idp");
    }

    #[test]
    fn secret_name_defaults() {
        assert_eq!(client("web", spec()).secret_name(), "dex-web-credentials");
    }

    #[test]
    fn redirect_uris_are_required() {
        let mut s = spec();
        s.redirect_uris.clear();
        let err = client("web", s).validate().unwrap_err();
        assert!(err.to_string().contains("at least one redirect URI"));

        let mut s = spec();
        s.redirect_uris = vec!["not a uri".to_string()];
        assert!(client("web", s).validate().is_err());
    }

    #[test]
    fn secret_keys_must_be_distinct() {
        let mut s = spec();
        s.template = Some(SecretTemplate {
            client_id_key: Some("id".to_string()),
            client_secret_key: Some("id".to_string()),
            ..Default::default()
        });
        let err = client("web", s).validate().unwrap_err();
        assert!(err.to_string().contains("must be distinct"));
    }

    #[test]
    fn public_flag_is_immutable_after_registration() {
        let mut c = client("web", spec());
        assert!(c.check_immutable().is_ok());

        c.status = Some(DexClientStatus::active(
            c.client_id(),
            true,
            c.instance_key(),
            Some(1),
        ));
        let err = c.check_immutable().unwrap_err();
        assert!(err.to_string().contains("public is immutable"));

        c.spec.public = true;
        assert!(c.check_immutable().is_ok());
    }

    #[test]
    fn instance_ref_is_immutable_after_registration() {
        let mut c = client("web", spec());
        c.status = Some(DexClientStatus::active(
            c.client_id(),
            false,
            "auth/idp".to_string(),
            Some(1),
        ));
        let err = c.check_immutable().unwrap_err();
        assert!(err.to_string().contains("instanceRef is immutable"));
    }

    #[test]
    fn failing_status_clears_client_id_but_keeps_registration_record() {
        let active = DexClientStatus::active(
            "apps_web".to_string(),
            false,
            "apps/idp".to_string(),
            Some(2),
        );
        let failing = DexClientStatus::failing("boom", &active, Some(3));
        assert_eq!(failing.phase, Phase::Failing);
        assert!(!failing.ready);
        assert!(failing.client_id.is_none());
        assert_eq!(failing.registered_public, Some(false));
        assert_eq!(failing.registered_instance.as_deref(), Some("apps/idp"));
    }

    #[test]
    fn finalizer_and_deletion_flags() {
        let mut c = client("web", spec());
        assert!(!c.has_finalizer());
        assert!(!c.is_deleting());

        c.metadata.finalizers = Some(vec![CLIENT_FINALIZER.to_string()]);
        c.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
        assert!(c.has_finalizer());
        assert!(c.is_deleting());
    }
}
