//! Credential material for confidential clients

use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dex_common::crd::DexClient;
use dex_common::Error;
use k8s_openapi::api::core::v1::Secret;

/// Random bytes in a generated client secret
const SECRET_BYTES: usize = 24;

/// What was found where the credentials Secret should be
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretState {
    /// No Secret with the expected name
    Absent,
    /// A Secret exists but cannot be used as-is
    Corrupt(String),
    /// A usable Secret holding this client secret
    WellFormed(String),
}

/// Generate a new client secret: 24 random bytes, base64url without padding
pub fn generate_client_secret() -> Result<String, Error> {
    let mut bytes = [0u8; SECRET_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::internal_with_context("secret", "system random source failed"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Classify the observed credentials Secret of `client`.
///
/// Well-formed means the id key holds the client's current identifier and
/// the secret key holds a non-empty value.
pub fn classify(observed: Option<&Secret>, client: &DexClient) -> SecretState {
    let Some(secret) = observed else {
        return SecretState::Absent;
    };
    let value = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
    };

    let id_key = client.client_id_key();
    match value(id_key) {
        None => return SecretState::Corrupt(format!("key {id_key} is missing")),
        Some(id) if id != client.client_id() => {
            return SecretState::Corrupt(format!("key {id_key} holds a different client id"))
        }
        Some(_) => {}
    }

    let secret_key = client.client_secret_key();
    match value(secret_key) {
        Some(s) if !s.is_empty() => SecretState::WellFormed(s),
        Some(_) => SecretState::Corrupt(format!("key {secret_key} is empty")),
        None => SecretState::Corrupt(format!("key {secret_key} is missing")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_common::crd::{DexClientSpec, InstanceRef};
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn client() -> DexClient {
        let mut c = DexClient::new(
            "web",
            DexClientSpec {
                name: "Web".to_string(),
                redirect_uris: vec!["https://web.example.com/callback".to_string()],
                public: false,
                instance_ref: InstanceRef {
                    name: "idp".to_string(),
                    namespace: None,
                },
                template: None,
            },
        );
        c.metadata.namespace = Some("apps".to_string());
        c
    }

    fn secret(entries: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn generated_secrets_are_urlsafe_and_distinct() {
        let a = generate_client_secret().expect("secret");
        let b = generate_client_secret().expect("secret");
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn absent_secret() {
        assert_eq!(classify(None, &client()), SecretState::Absent);
    }

    #[test]
    fn well_formed_secret_yields_its_value() {
        let s = secret(&[("clientId", "apps_web"), ("clientSecret", "abc")]);
        assert_eq!(
            classify(Some(&s), &client()),
            SecretState::WellFormed("abc".to_string())
        );
    }

    #[test]
    fn corrupt_secrets() {
        let c = client();
        for s in [
            secret(&[]),
            secret(&[("clientSecret", "abc")]),
            secret(&[("clientId", "other_web"), ("clientSecret", "abc")]),
            secret(&[("clientId", "apps_web")]),
            secret(&[("clientId", "apps_web"), ("clientSecret", "")]),
            Secret::default(),
        ] {
            assert!(matches!(classify(Some(&s), &c), SecretState::Corrupt(_)));
        }
    }
}
