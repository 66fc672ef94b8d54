//! DexClient controller implementation
//!
//! A pass walks a fixed sequence: resolve the referenced instance, wait
//! until it is ready, guard the registration with a finalizer, make sure
//! confidential clients have credentials, then assert the registration on
//! the instance. Deletion runs the same resolution and retracts the
//! registration before the finalizer is released.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use dex_common::crd::{Dex, DexClient, DexClientStatus, Phase, CLIENT_FINALIZER};
use dex_common::events::{actions, reasons, EventPublisher};
use dex_common::kube_utils::{
    finalizers_patch, is_not_found, patch_resource_status, resource_key, with_finalizer,
    without_finalizer,
};
use dex_common::metrics::ReconcileTimer;
use dex_common::{Error, KubeEventPublisher, ReconcilerConfig, FIELD_MANAGER};
#[cfg(test)]
use dex_common::NoopEventPublisher;
use dex_registrar::{
    assert_client, retract_client, ClientRegistration, GrpcConnector, RegistrarConnector,
    RegistrationOp,
};

use crate::secret::{classify, generate_client_secret, SecretState};

/// Name the controller reports events and metrics under
pub const CONTROLLER_NAME: &str = "dex-client-controller";

const METRICS_LABEL: &str = "dexclient";

// =============================================================================
// Store abstraction
// =============================================================================

/// Kubernetes operations needed by the client controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientKubeClient: Send + Sync {
    /// Get a Dex instance by name and namespace
    async fn get_dex(&self, name: &str, namespace: &str) -> Result<Option<Dex>, Error>;

    /// Get a Service by name and namespace
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Get a Secret by name and namespace
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret. Fails with a conflict if it already exists.
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a Secret. Returns false if it did not exist.
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool, Error>;

    /// Add a finalizer to a DexClient
    async fn add_finalizer(&self, name: &str, namespace: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a DexClient
    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Patch the status of a DexClient
    async fn patch_client_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DexClientStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ClientKubeClientImpl {
    client: Client,
}

impl ClientKubeClientImpl {
    /// Create a new ClientKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClientKubeClient for ClientKubeClientImpl {
    async fn get_dex(&self, name: &str, namespace: &str) -> Result<Option<Dex>, Error> {
        let api: Api<Dex> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret.namespace().ok_or_else(|| {
            Error::internal_with_context("create_secret", "secret has no namespace")
        })?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<DexClient> = Api::namespaced(self.client.clone(), namespace);

        // Read fresh so the version precondition matches what we modify
        let client = api.get(name).await?;
        let Some(finalizers) = with_finalizer(client.finalizers(), finalizer) else {
            return Ok(());
        };

        let patch = finalizers_patch(&finalizers, client.resource_version().as_deref());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api: Api<DexClient> = Api::namespaced(self.client.clone(), namespace);

        let Some(client) = api.get_opt(name).await? else {
            return Ok(());
        };
        let Some(finalizers) = without_finalizer(client.finalizers(), finalizer) else {
            return Ok(());
        };

        let patch = finalizers_patch(&finalizers, client.resource_version().as_deref());
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_client_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DexClientStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<DexClient>(&self.client, name, namespace, status).await?;
        Ok(())
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared by every reconciliation
pub struct ClientContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn ClientKubeClient>,
    /// Builds registrars for instance endpoints
    pub connector: Arc<dyn RegistrarConnector>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Requeue intervals and registrar timeouts
    pub config: ReconcilerConfig,
}

impl ClientContext {
    /// Create a new ClientContext with the given dependencies
    pub fn new(
        kube: Arc<dyn ClientKubeClient>,
        connector: Arc<dyn RegistrarConnector>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            kube,
            connector,
            events,
            config,
        }
    }

    /// Create a context backed by a real Kubernetes client and gRPC registrars
    pub fn from_client(client: Client, config: ReconcilerConfig) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        let connector = Arc::new(GrpcConnector::new(
            config.registrar_connect_timeout,
            config.registrar_timeout,
        ));
        Self {
            kube: Arc::new(ClientKubeClientImpl::new(client)),
            connector,
            events,
            config,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ClientKubeClient>,
        connector: Arc<dyn RegistrarConnector>,
    ) -> Self {
        Self {
            kube,
            connector,
            events: Arc::new(NoopEventPublisher),
            config: ReconcilerConfig::default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// How a pass ended when nothing failed
enum Pass {
    /// The instance is not ready yet
    Waiting,
    /// The finalizer was released; the resource is going away
    Released,
    /// The registration is asserted on the instance
    Registered { op: RegistrationOp, rotated: bool },
}

/// A ready instance and the registrar address it publishes
struct ReadyInstance {
    dex: Dex,
    endpoint: String,
}

/// Client secret to register and what it took to get it
struct Credentials {
    secret: Option<String>,
    recreated: bool,
    rotated: bool,
}

/// Reconcile a DexClient resource
///
/// Failures inside the pass are recorded in status and requeued after the
/// error backoff. Only a failure to write that status is returned.
#[instrument(skip(client, ctx), fields(dexclient = %resource_key(client.as_ref())))]
pub async fn reconcile(client: Arc<DexClient>, ctx: Arc<ClientContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let generation = client.meta().generation;
    let mut current = client.status_or_default();
    info!(phase = %current.phase, deleting = client.is_deleting(), "reconciling dex client");

    if client.is_deleting() && !client.has_finalizer() {
        debug!("no finalizer left, nothing to clean up");
        timer.success();
        return Ok(Action::await_change());
    }

    if !client.is_deleting() && current.phase == Phase::Uninitialized {
        let initialising = DexClientStatus::initialising(&current, generation);
        update_status(&client, &ctx, &current, &initialising).await?;
        publish(&client, &ctx, EventType::Normal, reasons::INITIALISING, actions::RECONCILE, None)
            .await;
        current = initialising;
    }

    match run(&client, &ctx).await {
        Ok(Pass::Waiting) => {
            debug!(instance = %client.instance_key(), "waiting for dex instance to become ready");
            timer.success();
            Ok(Action::requeue(ctx.config.dependency_wait))
        }
        Ok(Pass::Released) => {
            timer.success();
            Ok(Action::await_change())
        }
        Ok(Pass::Registered { op, rotated }) => {
            let next = DexClientStatus::active(
                client.client_id(),
                client.spec.public,
                client.instance_key(),
                generation,
            );
            let changed = update_status(&client, &ctx, &current, &next).await?;
            if rotated {
                publish(
                    &client,
                    &ctx,
                    EventType::Normal,
                    reasons::SECRET_ROTATED,
                    actions::REGISTER,
                    Some(format!("regenerated credentials in {}", client.secret_name())),
                )
                .await;
            }
            if current.phase != Phase::Active {
                publish(
                    &client,
                    &ctx,
                    EventType::Normal,
                    reasons::CREATED,
                    actions::REGISTER,
                    Some(format!("client {} {}", client.client_id(), op)),
                )
                .await;
            } else if changed {
                publish(&client, &ctx, EventType::Normal, reasons::UPDATED, actions::REGISTER, None)
                    .await;
            }
            timer.success();
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "dex client reconciliation failed");
            timer.error(e.kind());
            let next = DexClientStatus::failing(e.to_string(), &current, generation);
            if update_status(&client, &ctx, &current, &next).await? {
                publish(
                    &client,
                    &ctx,
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            }
            Ok(Action::requeue(ctx.config.error_backoff))
        }
    }
}

/// Error policy for the client controller
///
/// Reached only when a status write failed; the pass is retried after the
/// error backoff.
pub fn error_policy(client: Arc<DexClient>, error: &Error, ctx: Arc<ClientContext>) -> Action {
    error!(
        ?error,
        dexclient = %resource_key(client.as_ref()),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff)
}

async fn run(client: &DexClient, ctx: &ClientContext) -> Result<Pass, Error> {
    let deleting = client.is_deleting();
    if !deleting {
        client.validate()?;
        client.check_immutable()?;
    }

    let instance = match resolve_instance(client, ctx).await {
        Ok(Some(instance)) => instance,
        Ok(None) => return Ok(Pass::Waiting),
        Err(e) if deleting => {
            warn!(
                error = %e,
                instance = %client.instance_key(),
                "dex instance unavailable, releasing without remote retraction"
            );
            release(client, ctx).await?;
            return Ok(Pass::Released);
        }
        Err(e) => return Err(e),
    };

    let id = client.client_id();
    if deleting {
        let registrar = ctx.connector.connect(&instance.endpoint)?;
        let op = retract_client(registrar.as_ref(), &id).await?;
        if op == RegistrationOp::Deleted {
            publish(client, ctx, EventType::Normal, reasons::DELETED, actions::RETRACT, None).await;
        }
        release(client, ctx).await?;
        return Ok(Pass::Released);
    }

    if !client.has_finalizer() {
        ctx.kube
            .add_finalizer(&client.name_any(), &namespace(client), CLIENT_FINALIZER)
            .await?;
        debug!("added finalizer");
    }

    let credentials = ensure_credentials(client, &instance.dex, ctx).await?;
    let registrar = ctx.connector.connect(&instance.endpoint)?;
    if credentials.recreated {
        // Dex keeps the secret of an existing registration, so a stale one goes first
        match registrar.delete_client(&id).await {
            Ok(found) => debug!(found, "removed registration ahead of new credentials"),
            Err(e) => warn!(error = %e, "ignoring failure to remove stale registration"),
        }
    }

    let registration = ClientRegistration {
        id,
        name: client.spec.name.clone(),
        redirect_uris: client.spec.redirect_uris.clone(),
        public: client.spec.public,
        secret: credentials.secret,
    };
    let op = assert_client(registrar.as_ref(), &registration).await?;
    if credentials.recreated && op == RegistrationOp::Updated {
        // UpdateClient leaves the old secret in Dex. Dropping the new Secret
        // makes the next pass generate another one and retry the removal.
        ctx.kube
            .delete_secret(&client.secret_name(), &namespace(client))
            .await?;
        return Err(Error::registrar(
            "CreateClient",
            format!(
                "registration {} still holds a previous secret",
                registration.id
            ),
        ));
    }
    Ok(Pass::Registered {
        op,
        rotated: credentials.rotated,
    })
}

/// Look up the referenced instance. `None` means it exists but is not ready.
async fn resolve_instance(
    client: &DexClient,
    ctx: &ClientContext,
) -> Result<Option<ReadyInstance>, Error> {
    let key = resource_key(client);
    let instance_ns = client.instance_namespace();
    let dex = ctx
        .kube
        .get_dex(&client.spec.instance_ref.name, &instance_ns)
        .await?
        .ok_or_else(|| {
            Error::dependency(&key, format!("dex instance {} not found", client.instance_key()))
        })?;

    if !dex.is_ready() {
        return Ok(None);
    }

    let endpoint = dex
        .status
        .as_ref()
        .and_then(|s| s.endpoint_address.clone())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            Error::dependency(
                &key,
                format!("dex instance {} has no endpoint", client.instance_key()),
            )
        })?;

    let service = dex.api_service_name();
    if ctx.kube.get_service(&service, &instance_ns).await?.is_none() {
        return Err(Error::dependency(
            &key,
            format!("service {instance_ns}/{service} not found"),
        ));
    }

    Ok(Some(ReadyInstance { dex, endpoint }))
}

/// Make sure a confidential client has a usable credentials Secret
async fn ensure_credentials(
    client: &DexClient,
    dex: &Dex,
    ctx: &ClientContext,
) -> Result<Credentials, Error> {
    if client.spec.public {
        return Ok(Credentials {
            secret: None,
            recreated: false,
            rotated: false,
        });
    }

    let name = client.secret_name();
    let ns = namespace(client);
    let observed = ctx.kube.get_secret(&name, &ns).await?;
    let rotated = match classify(observed.as_ref(), client) {
        SecretState::WellFormed(value) => {
            return Ok(Credentials {
                secret: Some(value),
                recreated: false,
                rotated: false,
            })
        }
        SecretState::Absent => false,
        SecretState::Corrupt(reason) => {
            warn!(secret = %name, %reason, "credentials secret is corrupt, rotating");
            ctx.kube.delete_secret(&name, &ns).await?;
            true
        }
    };

    let value = generate_client_secret()?;
    let secret = dex_templates::credential_secret(
        client,
        &client.client_id(),
        &dex.spec.public_url,
        &value,
    );
    ctx.kube.create_secret(&secret).await?;
    info!(secret = %name, "created credentials secret");

    Ok(Credentials {
        secret: Some(value),
        recreated: true,
        rotated,
    })
}

async fn release(client: &DexClient, ctx: &ClientContext) -> Result<(), Error> {
    ctx.kube
        .remove_finalizer(&client.name_any(), &namespace(client), CLIENT_FINALIZER)
        .await?;
    info!("released finalizer");
    Ok(())
}

fn namespace(client: &DexClient) -> String {
    client.namespace().unwrap_or_default()
}

/// Write `next` unless it equals `current`. Returns whether a write happened.
async fn update_status(
    client: &DexClient,
    ctx: &ClientContext,
    current: &DexClientStatus,
    next: &DexClientStatus,
) -> Result<bool, Error> {
    if current == next {
        debug!("status unchanged, skipping update");
        return Ok(false);
    }
    ctx.kube
        .patch_client_status(&client.name_any(), &namespace(client), next)
        .await?;
    Ok(true)
}

async fn publish(
    client: &DexClient,
    ctx: &ClientContext,
    type_: EventType,
    reason: &str,
    action: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&client.object_ref(&()), type_, reason, action, note)
        .await;
}
