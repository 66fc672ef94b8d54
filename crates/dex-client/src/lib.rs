//! DexClient controller
//!
//! Registers each `DexClient` with the Dex instance it references, keeps
//! the generated credentials in a Secret, and retracts the registration
//! before the resource is allowed to disappear.

pub mod controller;
pub mod secret;

pub use controller::{
    error_policy, reconcile, ClientContext, ClientKubeClient, ClientKubeClientImpl,
    CONTROLLER_NAME,
};
