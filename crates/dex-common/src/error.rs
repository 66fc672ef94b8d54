//! Error types for the Dex operator
//!
//! Errors carry the resource they concern and enough context to be written
//! verbatim into a status message.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Dex operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec violates a domain rule
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.redirectUris")
        field: Option<String>,
    },

    /// A referenced object is missing or not reachable yet
    #[error("dependency error for {resource}: {message}")]
    Dependency {
        /// `namespace/name` of the resource whose dependency failed
        resource: String,
        /// Description of what could not be resolved
        message: String,
    },

    /// Remote registrar call failed
    #[error("registrar error [{operation}]: {message}")]
    Registrar {
        /// RPC that failed (CreateClient, UpdateClient, DeleteClient, connect)
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether the failure is expected to clear on its own
        retryable: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "secret")
        context: String,
    },
}

impl Error {
    /// Create a validation error without resource context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a resource and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a dependency error for a resource
    pub fn dependency(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Dependency {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable registrar error
    pub fn registrar(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registrar {
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a registrar error that will not clear without intervention
    pub fn registrar_permanent(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registrar {
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Version conflicts and throttling are transient even though they are
    /// 4xx responses. Validation and serialization errors need a spec fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Dependency { .. } => true,
            Error::Registrar { retryable, .. } => *retryable,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the resource key if this error concerns a specific resource
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Dependency { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Short machine-readable category, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Validation { .. } => "validation",
            Error::Dependency { .. } => "dependency",
            Error::Registrar { .. } => "registrar",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
