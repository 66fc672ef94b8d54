//! Create-or-update and delete protocols on top of [`Registrar`]

use dex_common::metrics::record_registration;
use tracing::info;

use crate::{ClientRegistration, CreateResult, Registrar, RegistrarError};

/// Outcome of a registrar operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationOp {
    /// Nothing changed on the instance. Only retraction of an unknown
    /// identifier reports this.
    None,
    /// A new registration was stored
    Created,
    /// An existing registration was overwritten, whether or not any field
    /// actually differed
    Updated,
    /// The registration was removed
    Deleted,
}

impl RegistrationOp {
    /// Lowercase name, used in logs and as a metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for RegistrationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ensure `registration` exists on the instance with the given fields.
///
/// Tries CreateClient first; if the identifier is already taken, updates
/// name and redirect URIs in place. The `public` flag and secret of an
/// existing registration are never changed by this call.
///
/// Every steady-state pass therefore issues UpdateClient and reports
/// [`RegistrationOp::Updated`]; this never returns [`RegistrationOp::None`].
pub async fn assert_client(
    registrar: &dyn Registrar,
    registration: &ClientRegistration,
) -> Result<RegistrationOp, RegistrarError> {
    match (registration.public, registration.secret.as_deref()) {
        (true, Some(_)) => {
            return Err(RegistrarError::InvalidRequest {
                id: registration.id.clone(),
                message: "a public client cannot have a secret".to_string(),
            })
        }
        (false, None) | (false, Some("")) => {
            return Err(RegistrarError::InvalidRequest {
                id: registration.id.clone(),
                message: "a confidential client must have a secret".to_string(),
            })
        }
        _ => {}
    }

    let op = match registrar.create_client(registration).await? {
        CreateResult::Created => RegistrationOp::Created,
        CreateResult::AlreadyExists => {
            registrar.update_client(registration).await?;
            RegistrationOp::Updated
        }
    };

    info!(
        id = %registration.id,
        name = %registration.name,
        redirect_uris = ?registration.redirect_uris,
        public = registration.public,
        op = %op,
        "Asserted Dex client"
    );
    record_registration(op.as_str());
    Ok(op)
}

/// Remove the registration `id`. An unknown identifier is not an error.
pub async fn retract_client(
    registrar: &dyn Registrar,
    id: &str,
) -> Result<RegistrationOp, RegistrarError> {
    let op = if registrar.delete_client(id).await? {
        RegistrationOp::Deleted
    } else {
        RegistrationOp::None
    };
    info!(id, op = %op, "Retracted Dex client");
    record_registration(op.as_str());
    Ok(op)
}
