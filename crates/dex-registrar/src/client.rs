//! gRPC registrar client with per-call timeouts

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dex_proto::dex_client::DexClient;
use dex_proto::{Client, CreateClientReq, DeleteClientReq, UpdateClientReq};
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::RegistrarError;

/// A client registration as sent to Dex
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRegistration {
    /// External client identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Allowed callback URIs
    pub redirect_uris: Vec<String>,
    /// Public clients authenticate without a secret
    pub public: bool,
    /// Client secret, present exactly for confidential clients
    pub secret: Option<String>,
}

/// Answer to CreateClient
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateResult {
    /// A new registration was stored
    Created,
    /// The identifier was already registered; nothing changed
    AlreadyExists,
}

/// Client-management RPCs of one Dex instance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register a new client
    async fn create_client(
        &self,
        registration: &ClientRegistration,
    ) -> Result<CreateResult, RegistrarError>;

    /// Replace name and redirect URIs of an existing client.
    /// A `not_found` answer is an error.
    async fn update_client(&self, registration: &ClientRegistration)
        -> Result<(), RegistrarError>;

    /// Delete a client. Returns false if it was not registered.
    async fn delete_client(&self, id: &str) -> Result<bool, RegistrarError>;
}

/// Builds a [`Registrar`] for a `host:port` address
#[cfg_attr(test, automock)]
pub trait RegistrarConnector: Send + Sync {
    /// Create a registrar for `address`. Does not contact the instance.
    fn connect(&self, address: &str) -> Result<Arc<dyn Registrar>, RegistrarError>;
}

/// Production connector over plaintext HTTP/2 inside the cluster
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl GrpcConnector {
    /// Create a connector with the given connect and per-call timeouts
    pub fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
        }
    }
}

impl RegistrarConnector for GrpcConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn Registrar>, RegistrarError> {
        Ok(Arc::new(GrpcRegistrar::connect_lazy(
            address,
            self.connect_timeout,
            self.call_timeout,
        )?))
    }
}

/// [`Registrar`] over a tonic channel
#[derive(Clone, Debug)]
pub struct GrpcRegistrar {
    client: DexClient<Channel>,
    call_timeout: Duration,
}

impl GrpcRegistrar {
    /// Build a lazily connecting registrar for `address` (`host:port`).
    ///
    /// The channel is established on the first call, so construction never
    /// blocks on the network. Must be called inside a tokio runtime.
    pub fn connect_lazy(
        address: &str,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, RegistrarError> {
        let channel = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| RegistrarError::InvalidAddress {
                address: address.to_string(),
                message: e.to_string(),
            })?
            .connect_timeout(connect_timeout)
            .timeout(call_timeout)
            .connect_lazy();
        Ok(Self {
            client: DexClient::new(channel),
            call_timeout,
        })
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    ) -> Result<T, RegistrarError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Err(_) => Err(RegistrarError::Timeout {
                operation,
                timeout: self.call_timeout,
            }),
            Ok(Err(status)) => Err(RegistrarError::Rpc {
                operation,
                code: status.code(),
                message: status.message().to_string(),
            }),
            Ok(Ok(response)) => Ok(response.into_inner()),
        }
    }
}

#[async_trait]
impl Registrar for GrpcRegistrar {
    async fn create_client(
        &self,
        registration: &ClientRegistration,
    ) -> Result<CreateResult, RegistrarError> {
        let request = CreateClientReq {
            client: Some(Client {
                id: registration.id.clone(),
                secret: registration.secret.clone().unwrap_or_default(),
                redirect_uris: registration.redirect_uris.clone(),
                trusted_peers: vec![],
                public: registration.public,
                name: registration.name.clone(),
                logo_url: String::new(),
            }),
        };
        let mut client = self.client.clone();
        let response = self
            .call("CreateClient", client.create_client(request))
            .await?;
        debug!(
            id = %registration.id,
            already_exists = response.already_exists,
            "CreateClient answered"
        );
        Ok(if response.already_exists {
            CreateResult::AlreadyExists
        } else {
            CreateResult::Created
        })
    }

    async fn update_client(
        &self,
        registration: &ClientRegistration,
    ) -> Result<(), RegistrarError> {
        let request = UpdateClientReq {
            id: registration.id.clone(),
            redirect_uris: registration.redirect_uris.clone(),
            trusted_peers: vec![],
            name: registration.name.clone(),
            logo_url: String::new(),
        };
        let mut client = self.client.clone();
        let response = self
            .call("UpdateClient", client.update_client(request))
            .await?;
        if response.not_found {
            return Err(RegistrarError::NotFound {
                operation: "UpdateClient",
                id: registration.id.clone(),
            });
        }
        Ok(())
    }

    async fn delete_client(&self, id: &str) -> Result<bool, RegistrarError> {
        let request = DeleteClientReq { id: id.to_string() };
        let mut client = self.client.clone();
        let response = self
            .call("DeleteClient", client.delete_client(request))
            .await?;
        debug!(id, not_found = response.not_found, "DeleteClient answered");
        Ok(!response.not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> ClientRegistration {
        ClientRegistration {
            id: "apps_web".to_string(),
            name: "Web".to_string(),
            redirect_uris: vec!["https://web.example.com/callback".to_string()],
            public: false,
            secret: Some("s3cr3t".to_string()),
        }
    }

    #[tokio::test]
    async fn connector_rejects_malformed_address() {
        let connector = GrpcConnector::new(Duration::from_secs(1), Duration::from_secs(1));
        let err = connector.connect("idp auth:5557").err().expect("error");
        assert!(matches!(err, RegistrarError::InvalidAddress { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn connector_builds_lazily_without_network() {
        let connector = GrpcConnector::new(Duration::from_secs(1), Duration::from_secs(1));
        assert!(connector.connect("idp.auth:5557").is_ok());
    }

    #[tokio::test]
    async fn unreachable_instance_is_a_retryable_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let registrar = GrpcRegistrar::connect_lazy(
            &address,
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
        .expect("registrar");
        let err = registrar
            .create_client(&registration())
            .await
            .err()
            .expect("call should fail");
        assert!(err.is_retryable());
        assert_eq!(err.operation(), "CreateClient");
    }

    #[tokio::test]
    async fn silent_instance_hits_the_call_timeout() {
        // Accepts TCP but never speaks HTTP/2
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let _hold = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let registrar = GrpcRegistrar::connect_lazy(
            &address,
            Duration::from_millis(500),
            Duration::from_millis(300),
        )
        .expect("registrar");
        let started = std::time::Instant::now();
        let err = registrar
            .delete_client("apps_web")
            .await
            .err()
            .expect("call should fail");
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
