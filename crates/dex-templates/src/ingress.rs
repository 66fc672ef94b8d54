//! Public routing for a Dex instance

use dex_common::crd::Dex;
use dex_common::kube_utils::resource_key;
use dex_common::Error;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::{labels, owner_references};

/// Ingress routing the host and path of `publicUrl` to the API Service.
///
/// Uses the default ingress settings when the instance has none.
pub fn ingress(dex: &Dex) -> Result<Ingress, Error> {
    let settings = dex.spec.ingress.clone().unwrap_or_default();
    let url = url::Url::parse(&dex.spec.public_url).map_err(|e| {
        Error::validation_for_field(
            resource_key(dex),
            "spec.publicUrl",
            format!("invalid URL: {e}"),
        )
    })?;
    let host = url.host_str().unwrap_or_default().to_string();
    let path = format!("/{}", url.path().trim_start_matches('/'));

    let mut labels = labels(dex);
    labels.extend(settings.labels.clone());

    let tls = settings.tls_enabled.then(|| {
        vec![IngressTLS {
            hosts: Some(vec![host.clone()]),
            secret_name: Some(
                settings
                    .tls_secret_name
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| format!("{host}-tls")),
            ),
        }]
    });

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(dex.api_service_name()),
            namespace: dex.namespace(),
            labels: Some(labels),
            annotations: (!settings.annotations.is_empty()).then(|| settings.annotations.clone()),
            owner_references: owner_references(dex),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: settings.class_name.clone(),
            tls,
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: dex.api_service_name(),
                                port: Some(ServiceBackendPort {
                                    name: Some("http".to_string()),
                                    number: None,
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use dex_common::crd::IngressSpec as DexIngress;

    fn with_ingress(settings: DexIngress) -> Dex {
        let mut dex = testing::dex();
        dex.spec.ingress = Some(settings);
        dex
    }

    #[test]
    fn routes_public_url_host_and_path() {
        let ing = ingress(&with_ingress(DexIngress {
            enabled: true,
            ..Default::default()
        }))
        .expect("ingress");
        let spec = ing.spec.as_ref().expect("spec");
        let rule = &spec.rules.as_ref().expect("rules")[0];
        assert_eq!(rule.host.as_deref(), Some("login.example.com"));
        let path = &rule.http.as_ref().expect("http").paths[0];
        assert_eq!(path.path.as_deref(), Some("/dex"));
        let backend = path.backend.service.as_ref().expect("service backend");
        assert_eq!(backend.name, "idp");
        assert!(spec.tls.is_none());
    }

    #[test]
    fn tls_secret_defaults_to_host_name() {
        let ing = ingress(&with_ingress(DexIngress {
            enabled: true,
            tls_enabled: true,
            ..Default::default()
        }))
        .expect("ingress");
        let tls = &ing.spec.as_ref().expect("spec").tls.as_ref().expect("tls")[0];
        assert_eq!(tls.secret_name.as_deref(), Some("login.example.com-tls"));

        let ing = ingress(&with_ingress(DexIngress {
            enabled: true,
            tls_enabled: true,
            tls_secret_name: Some("custom-tls".to_string()),
            ..Default::default()
        }))
        .expect("ingress");
        let tls = &ing.spec.as_ref().expect("spec").tls.as_ref().expect("tls")[0];
        assert_eq!(tls.secret_name.as_deref(), Some("custom-tls"));
    }

    #[test]
    fn ingress_labels_and_annotations_are_added() {
        let ing = ingress(&with_ingress(DexIngress {
            enabled: true,
            class_name: Some("nginx".to_string()),
            labels: [("exposure".to_string(), "public".to_string())].into(),
            annotations: [(
                "cert-manager.io/cluster-issuer".to_string(),
                "letsencrypt".to_string(),
            )]
            .into(),
            ..Default::default()
        }))
        .expect("ingress");
        let labels = ing.metadata.labels.as_ref().expect("labels");
        assert_eq!(labels["exposure"], "public");
        assert_eq!(labels[dex_common::LABEL_INSTANCE], "idp");
        assert!(ing
            .metadata
            .annotations
            .as_ref()
            .expect("annotations")
            .contains_key("cert-manager.io/cluster-issuer"));
        assert_eq!(
            ing.spec.as_ref().expect("spec").ingress_class_name.as_deref(),
            Some("nginx")
        );
    }
}
