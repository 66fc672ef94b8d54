//! Dex `config.yaml`

use std::collections::BTreeMap;

use dex_common::crd::Dex;
use dex_common::kube_utils::deterministic_hash;
use dex_common::{Error, DEX_GRPC_PORT, DEX_HTTP_PORT, DEX_TELEMETRY_PORT};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::Serialize;

use crate::{labels, owner_references};

/// ConfigMap key holding the rendered configuration
pub const CONFIG_KEY: &str = "config.yaml";

/// Pod template annotation carrying the configuration checksum
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "dex.karavel.io/config-checksum";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DexConfig<'a> {
    issuer: &'a str,
    storage: Storage,
    web: Web,
    grpc: Grpc,
    telemetry: Telemetry,
    logger: Logger,
    connectors: Vec<ConnectorConfig<'a>>,
    oauth2: OAuth2,
    #[serde(rename = "enablePasswordDB")]
    enable_password_db: bool,
}

#[derive(Serialize)]
struct Storage {
    #[serde(rename = "type")]
    type_: &'static str,
    config: StorageConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageConfig {
    in_cluster: bool,
}

#[derive(Serialize)]
struct Web {
    http: String,
}

#[derive(Serialize)]
struct Grpc {
    addr: String,
}

#[derive(Serialize)]
struct Telemetry {
    http: String,
}

#[derive(Serialize)]
struct Logger {
    level: &'static str,
    format: &'static str,
}

#[derive(Serialize)]
struct ConnectorConfig<'a> {
    #[serde(rename = "type")]
    type_: &'a str,
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OAuth2 {
    skip_approval_screen: bool,
}

fn render(dex: &Dex) -> Result<String, Error> {
    let config = DexConfig {
        issuer: &dex.spec.public_url,
        storage: Storage {
            type_: "kubernetes",
            config: StorageConfig { in_cluster: true },
        },
        web: Web {
            http: format!("0.0.0.0:{DEX_HTTP_PORT}"),
        },
        grpc: Grpc {
            addr: format!("0.0.0.0:{DEX_GRPC_PORT}"),
        },
        telemetry: Telemetry {
            http: format!("0.0.0.0:{DEX_TELEMETRY_PORT}"),
        },
        logger: Logger {
            level: "info",
            format: "json",
        },
        connectors: dex
            .spec
            .connectors
            .iter()
            .map(|c| ConnectorConfig {
                type_: &c.type_,
                id: &c.id,
                name: &c.name,
                config: c.config.as_ref(),
            })
            .collect(),
        oauth2: OAuth2 {
            skip_approval_screen: true,
        },
        enable_password_db: false,
    };
    serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", format!("dex config: {e}")))
}

/// ConfigMap `{name}-config` holding the Dex configuration
pub fn config_map(dex: &Dex) -> Result<ConfigMap, Error> {
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(dex.config_map_name()),
            namespace: dex.namespace(),
            labels: Some(labels(dex)),
            owner_references: owner_references(dex),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), render(dex)?)])),
        ..Default::default()
    })
}

/// Checksum of the rendered configuration, empty if there is none
pub fn config_checksum(config_map: &ConfigMap) -> String {
    let rendered = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    deterministic_hash(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use dex_common::crd::Connector;

    fn parsed(cm: &ConfigMap) -> serde_yaml::Value {
        let data = cm.data.as_ref().expect("data");
        serde_yaml::from_str(&data[CONFIG_KEY]).expect("yaml")
    }

    #[test]
    fn renders_issuer_storage_and_listeners() {
        let cm = config_map(&testing::dex()).expect("config map");
        assert_eq!(cm.metadata.name.as_deref(), Some("idp-config"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("auth"));

        let cfg = parsed(&cm);
        assert_eq!(cfg["issuer"], "https://login.example.com/dex");
        assert_eq!(cfg["storage"]["type"], "kubernetes");
        assert_eq!(cfg["storage"]["config"]["inCluster"], true);
        assert_eq!(cfg["web"]["http"], "0.0.0.0:5556");
        assert_eq!(cfg["grpc"]["addr"], "0.0.0.0:5557");
        assert_eq!(cfg["telemetry"]["http"], "0.0.0.0:5558");
        assert_eq!(cfg["oauth2"]["skipApprovalScreen"], true);
        assert_eq!(cfg["enablePasswordDB"], false);
    }

    #[test]
    fn connectors_keep_their_opaque_config() {
        let mut dex = testing::dex();
        dex.spec.connectors = vec![
            Connector {
                type_: "github".to_string(),
                name: "GitHub".to_string(),
                id: "github".to_string(),
                config: Some(serde_json::json!({"clientID": "abc", "orgs": [{"name": "acme"}]})),
            },
            Connector {
                type_: "mockCallback".to_string(),
                name: "Mock".to_string(),
                id: "mock".to_string(),
                config: None,
            },
        ];
        let cfg = parsed(&config_map(&dex).expect("config map"));
        assert_eq!(cfg["connectors"][0]["type"], "github");
        assert_eq!(cfg["connectors"][0]["config"]["orgs"][0]["name"], "acme");
        assert!(cfg["connectors"][1].get("config").is_none());
    }

    #[test]
    fn checksum_follows_content() {
        let dex = testing::dex();
        let a = config_checksum(&config_map(&dex).expect("config map"));
        assert_eq!(a, config_checksum(&config_map(&dex).expect("config map")));

        let mut other = testing::dex();
        other.spec.public_url = "https://other.example.com".to_string();
        assert_ne!(a, config_checksum(&config_map(&other).expect("config map")));
    }
}
