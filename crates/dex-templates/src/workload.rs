//! Deployment and Services of a Dex instance

use std::collections::BTreeMap;

use dex_common::crd::Dex;
use dex_common::{DEX_GRPC_PORT, DEX_HTTP_PORT, DEX_TELEMETRY_PORT, GRPC_PORT_NAME};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::{config_checksum, CONFIG_CHECKSUM_ANNOTATION, CONFIG_KEY};
use crate::{labels, owner_references, selector_labels};

/// Image used when the instance does not name one
pub const DEFAULT_IMAGE: &str = "ghcr.io/dexidp/dex:v2.41.1";

const HTTP_PORT_NAME: &str = "http";
const METRICS_PORT_NAME: &str = "metrics";
const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT_PATH: &str = "/etc/dex/cfg";

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

/// Requested resources with defaults filled in per section
fn resources(dex: &Dex) -> ResourceRequirements {
    let mut resources = dex.spec.resources.clone().unwrap_or_default();
    if resources.limits.is_none() {
        resources.limits = Some(quantities("200m", "200Mi"));
    }
    if resources.requests.is_none() {
        resources.requests = Some(quantities("100m", "100Mi"));
    }
    resources
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn service_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::String(name.to_string())),
        ..Default::default()
    }
}

/// Dex Deployment mounting `config_map`.
///
/// The pod template carries the configuration checksum so that a changed
/// configuration rolls the pods.
pub fn deployment(dex: &Dex, config_map: &ConfigMap) -> Deployment {
    let labels = labels(dex);
    let image = dex
        .spec
        .image
        .clone()
        .filter(|i| !i.is_empty())
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(dex.name_any()),
            namespace: dex.namespace(),
            labels: Some(labels.clone()),
            owner_references: owner_references(dex),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(dex.spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(dex)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_CHECKSUM_ANNOTATION.to_string(),
                        config_checksum(config_map),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(dex.name_any()),
                    containers: vec![Container {
                        name: "dex".to_string(),
                        image: Some(image),
                        command: Some(vec!["dex".to_string()]),
                        args: Some(vec![
                            "serve".to_string(),
                            format!("{CONFIG_MOUNT_PATH}/{CONFIG_KEY}"),
                        ]),
                        ports: Some(vec![
                            container_port(HTTP_PORT_NAME, DEX_HTTP_PORT),
                            container_port(GRPC_PORT_NAME, DEX_GRPC_PORT),
                            container_port(METRICS_PORT_NAME, DEX_TELEMETRY_PORT),
                        ]),
                        readiness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/healthz/ready".to_string()),
                                port: IntOrString::Int(DEX_TELEMETRY_PORT),
                                ..Default::default()
                            }),
                            initial_delay_seconds: Some(1),
                            timeout_seconds: Some(5),
                            failure_threshold: Some(3),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: CONFIG_VOLUME.to_string(),
                            mount_path: CONFIG_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        }]),
                        resources: Some(resources(dex)),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config_map.metadata.name.clone().unwrap_or_default(),
                            items: Some(vec![KeyToPath {
                                key: CONFIG_KEY.to_string(),
                                path: CONFIG_KEY.to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn service(dex: &Dex, name: String, ports: Vec<ServicePort>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: dex.namespace(),
            labels: Some(labels(dex)),
            owner_references: owner_references(dex),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(dex)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service exposing the OIDC endpoints and the administrative gRPC API
pub fn api_service(dex: &Dex) -> Service {
    service(
        dex,
        dex.api_service_name(),
        vec![
            service_port(HTTP_PORT_NAME, DEX_HTTP_PORT),
            service_port(GRPC_PORT_NAME, DEX_GRPC_PORT),
        ],
    )
}

/// Service exposing metrics and health endpoints
pub fn metrics_service(dex: &Dex) -> Service {
    service(
        dex,
        dex.metrics_service_name(),
        vec![service_port(METRICS_PORT_NAME, DEX_TELEMETRY_PORT)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config_map, testing};
    use dex_common::kube_utils::registrar_address;

    fn render(dex: &Dex) -> Deployment {
        deployment(dex, &config_map(dex).expect("config map"))
    }

    #[test]
    fn deployment_defaults() {
        let deploy = render(&testing::dex());
        let spec = deploy.spec.as_ref().expect("spec");
        assert_eq!(spec.replicas, Some(1));

        let pod = spec.template.spec.as_ref().expect("pod spec");
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_IMAGE));
        assert_eq!(
            container.args.as_deref(),
            Some(&["serve".to_string(), "/etc/dex/cfg/config.yaml".to_string()][..])
        );
        let resources = container.resources.as_ref().expect("resources");
        assert_eq!(
            resources.limits.as_ref().expect("limits")["cpu"],
            Quantity("200m".to_string())
        );
        assert_eq!(
            resources.requests.as_ref().expect("requests")["memory"],
            Quantity("100Mi".to_string())
        );
        assert_eq!(pod.service_account_name.as_deref(), Some("idp"));
        assert_eq!(
            pod.volumes.as_ref().expect("volumes")[0]
                .config_map
                .as_ref()
                .expect("config map volume")
                .name,
            "idp-config"
        );
    }

    #[test]
    fn explicit_resources_and_image_are_kept() {
        let mut dex = testing::dex();
        dex.spec.image = Some("registry.local/dex:dev".to_string());
        dex.spec.replicas = Some(3);
        dex.spec.resources = Some(ResourceRequirements {
            limits: Some(quantities("1", "1Gi")),
            ..Default::default()
        });
        let deploy = render(&dex);
        let spec = deploy.spec.as_ref().expect("spec");
        assert_eq!(spec.replicas, Some(3));
        let container = &spec.template.spec.as_ref().expect("pod").containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/dex:dev"));
        let resources = container.resources.as_ref().expect("resources");
        assert_eq!(
            resources.limits.as_ref().expect("limits")["memory"],
            Quantity("1Gi".to_string())
        );
        assert_eq!(
            resources.requests.as_ref().expect("requests")["cpu"],
            Quantity("100m".to_string())
        );
    }

    #[test]
    fn config_change_changes_pod_template() {
        let a = render(&testing::dex());
        let mut other = testing::dex();
        other.spec.public_url = "https://elsewhere.example.com".to_string();
        let b = render(&other);
        let annotation = |d: &Deployment| {
            d.spec.as_ref().expect("spec").template.metadata.as_ref().expect("meta")
                .annotations.as_ref().expect("annotations")[CONFIG_CHECKSUM_ANNOTATION]
                .clone()
        };
        assert_ne!(annotation(&a), annotation(&b));
    }

    #[test]
    fn selector_ignores_instance_labels() {
        let deploy = render(&testing::dex());
        let selector = deploy.spec.as_ref().expect("spec").selector.match_labels.clone();
        assert!(!selector.expect("labels").contains_key("team"));
    }

    #[test]
    fn api_service_publishes_grpc_port() {
        let svc = api_service(&testing::dex());
        assert_eq!(svc.metadata.name.as_deref(), Some("idp"));
        assert_eq!(registrar_address(&svc).expect("address"), "idp.auth:5557");

        let metrics = metrics_service(&testing::dex());
        assert_eq!(metrics.metadata.name.as_deref(), Some("idp-metrics"));
        assert!(registrar_address(&metrics).is_err());
    }
}
