//! Common types for the Dex operator: CRDs, errors, events and utilities

#![deny(missing_docs)]

pub mod config;
pub mod converge;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use config::ReconcilerConfig;
pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Dex operator CRDs
pub const API_GROUP: &str = "dex.karavel.io";

/// Field manager used for every write issued by the operator
pub const FIELD_MANAGER: &str = "dex-operator";

/// Port Dex serves the HTTP (OIDC) endpoints on
pub const DEX_HTTP_PORT: i32 = 5556;

/// Port Dex serves the administrative gRPC API on
pub const DEX_GRPC_PORT: i32 = 5557;

/// Port Dex serves metrics and health probes on
pub const DEX_TELEMETRY_PORT: i32 = 5558;

/// Name of the Service port that carries the administrative gRPC API
pub const GRPC_PORT_NAME: &str = "grpc";

/// Label key naming the application
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Label key naming the Dex instance a child object belongs to
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Label key marking objects managed by this operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_DEX_OPERATOR: &str = "dex-operator";
