//! Registrar error type

use std::time::Duration;

use tonic::Code;

/// Errors from talking to a Dex instance
#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    /// The published address cannot be turned into an endpoint
    #[error("invalid registrar address {address}: {message}")]
    InvalidAddress {
        /// Address as published in the instance status
        address: String,
        /// Parser message
        message: String,
    },

    /// The RPC did not finish within the call timeout
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// RPC name
        operation: &'static str,
        /// Configured call timeout
        timeout: Duration,
    },

    /// The RPC completed with a non-OK status
    #[error("{operation} failed with {code:?}: {message}")]
    Rpc {
        /// RPC name
        operation: &'static str,
        /// gRPC status code
        code: Code,
        /// Status message from the server
        message: String,
    },

    /// UpdateClient answered `not_found`
    #[error("{operation}: client {id} not found")]
    NotFound {
        /// RPC name
        operation: &'static str,
        /// Client identifier
        id: String,
    },

    /// The request was rejected before it was sent
    #[error("invalid registration for {id}: {message}")]
    InvalidRequest {
        /// Client identifier
        id: String,
        /// What is wrong with it
        message: String,
    },
}

impl RegistrarError {
    /// RPC or step the error belongs to
    pub fn operation(&self) -> &'static str {
        match self {
            Self::InvalidAddress { .. } => "connect",
            Self::Timeout { operation, .. }
            | Self::Rpc { operation, .. }
            | Self::NotFound { operation, .. } => operation,
            Self::InvalidRequest { .. } => "validate",
        }
    }

    /// Whether retrying the same request can succeed
    ///
    /// A registration that vanished between CreateClient and UpdateClient is
    /// recreated on the next pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidAddress { .. } | Self::InvalidRequest { .. } => false,
            Self::Timeout { .. } | Self::NotFound { .. } => true,
            Self::Rpc { code, .. } => !matches!(
                code,
                Code::InvalidArgument
                    | Code::PermissionDenied
                    | Code::Unauthenticated
                    | Code::Unimplemented
                    | Code::FailedPrecondition
                    | Code::OutOfRange
            ),
        }
    }
}

impl From<RegistrarError> for dex_common::Error {
    fn from(e: RegistrarError) -> Self {
        if e.is_retryable() {
            dex_common::Error::registrar(e.operation(), e.to_string())
        } else {
            dex_common::Error::registrar_permanent(e.operation(), e.to_string())
        }
    }
}
