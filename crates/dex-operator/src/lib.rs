//! Dex operator: controllers for Dex instances and their OAuth2 clients

#![deny(missing_docs)]

/// Controller futures for each reconciled kind
pub mod controller_runner;
/// Startup utilities (CRD install and printing)
pub mod startup;
