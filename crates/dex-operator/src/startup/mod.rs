//! Startup utilities for the Dex operator

mod crds;

pub use crds::{crd_manifests, ensure_crds_installed};
