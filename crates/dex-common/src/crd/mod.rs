//! Custom Resource Definitions for the Dex operator

mod dex;
mod dex_client;
mod types;

pub use dex::{Connector, Dex, DexSpec, DexStatus, IngressSpec};
pub use dex_client::{
    DexClient, DexClientSpec, DexClientStatus, InstanceRef, SecretMeta, SecretTemplate,
    CLIENT_FINALIZER, DEFAULT_CLIENT_ID_KEY, DEFAULT_CLIENT_SECRET_KEY, DEFAULT_ISSUER_URL_KEY,
};
pub use types::Phase;
