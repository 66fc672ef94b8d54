//! Protocol buffer definitions for the Dex administrative gRPC API.
//!
//! Only the client-management RPCs are compiled:
//!
//! - `CreateClient`: registers a client, answering `already_exists` when the
//!   identifier is taken
//! - `UpdateClient`: replaces name and redirect URIs, answering `not_found`
//!   when the identifier is unknown
//! - `DeleteClient`: removes a client, answering `not_found` when the
//!   identifier is unknown
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use dex_proto::{dex_client::DexClient, Client, CreateClientReq};
//!
//! let mut api = DexClient::connect("http://idp.auth:5557").await?;
//! let resp = api
//!     .create_client(CreateClientReq {
//!         client: Some(Client {
//!             id: "apps_web".to_string(),
//!             redirect_uris: vec!["https://web.example.com/callback".to_string()],
//!             ..Default::default()
//!         }),
//!     })
//!     .await?;
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated types from api.proto
pub mod api {
    tonic::include_proto!("api");
}

pub use api::*;
