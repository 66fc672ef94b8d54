//! Dex instance controller
//!
//! Converges each `Dex` resource into its ConfigMap, RBAC, Deployment,
//! Services and optional Ingress, then publishes the administrative gRPC
//! address in status for the client controller.

pub mod controller;

pub use controller::{
    error_policy, reconcile, InstanceContext, InstanceKubeClient, InstanceKubeClientImpl,
    CONTROLLER_NAME,
};
