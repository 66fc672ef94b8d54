//! Remote registrar: client registration on a Dex instance
//!
//! [`Registrar`] is a thin wrapper over the three client-management RPCs of
//! one Dex instance. [`RegistrarConnector`] builds a registrar for an
//! address published by the instance controller. [`assert_client`] and
//! [`retract_client`] implement the create-or-update and delete protocols
//! on top of it.

#![deny(missing_docs)]

mod client;
mod error;
mod ops;

pub use client::{
    ClientRegistration, CreateResult, GrpcConnector, GrpcRegistrar, Registrar, RegistrarConnector,
};
pub use error::RegistrarError;
pub use ops::{assert_client, retract_client, RegistrationOp};
