//! Dex controller implementation
//!
//! Each pass renders the canonical form of every child object, converges
//! them one by one through the store, and derives the registrar address
//! from the live API Service. Status is the only thing written back to the
//! `Dex` resource, and only when it changes.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use dex_common::converge::{plan_update, Applied, ChildKind, ChildObject, WriteOutcome};
use dex_common::crd::{Dex, DexStatus, Phase};
use dex_common::events::{actions, reasons, EventPublisher};
use dex_common::kube_utils::{is_not_found, patch_resource_status, registrar_address, resource_key};
use dex_common::metrics::ReconcileTimer;
use dex_common::{Error, KubeEventPublisher, ReconcilerConfig, FIELD_MANAGER};
#[cfg(test)]
use dex_common::NoopEventPublisher;

/// Name the controller reports events and metrics under
pub const CONTROLLER_NAME: &str = "dex-instance-controller";

const METRICS_LABEL: &str = "dex";

// =============================================================================
// Store abstraction
// =============================================================================

/// Kubernetes operations needed by the instance controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceKubeClient: Send + Sync {
    /// Patch the status of a Dex resource
    async fn patch_dex_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DexStatus,
    ) -> Result<(), Error>;

    /// Create the child if absent, patch its owned fields if they drifted,
    /// and return the live object
    async fn apply_child(&self, desired: &ChildObject) -> Result<Applied, Error>;

    /// Delete a child. Returns false if it did not exist.
    /// `namespace` is ignored for cluster-scoped kinds.
    async fn delete_child(
        &self,
        kind: ChildKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct InstanceKubeClientImpl {
    client: Client,
}

impl InstanceKubeClientImpl {
    /// Create a new InstanceKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: Option<&str>) -> Result<Api<K>, Error>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace.ok_or_else(|| {
            Error::internal_with_context("apply_child", "namespaced child has no namespace")
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    /// Two-phase write: read the live object, then create or patch it
    async fn converge<K>(
        &self,
        api: Api<K>,
        desired: &K,
        child: &ChildObject,
    ) -> Result<(WriteOutcome, K), Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = child.name();
        let Some(live) = api.get_opt(name).await? else {
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            let created = api.create(&params, desired).await?;
            return Ok((WriteOutcome::Created, created));
        };

        let observed = serde_json::to_value(&live)?;
        match plan_update(child, &observed)? {
            None => Ok((WriteOutcome::Unchanged, live)),
            Some(patch) => {
                let updated = api
                    .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
                    .await?;
                Ok((WriteOutcome::Updated, updated))
            }
        }
    }

    /// Read first: an absent object costs a GET, never a DELETE
    async fn delete<K>(api: Api<K>, name: &str) -> Result<bool, Error>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        if api.get_opt(name).await?.is_none() {
            return Ok(false);
        }
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InstanceKubeClient for InstanceKubeClientImpl {
    async fn patch_dex_status(
        &self,
        name: &str,
        namespace: &str,
        status: &DexStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<Dex>(&self.client, name, namespace, status).await?;
        Ok(())
    }

    async fn apply_child(&self, desired: &ChildObject) -> Result<Applied, Error> {
        let ns = desired.namespace();
        let (outcome, live) = match desired {
            ChildObject::ConfigMap(obj) => {
                let api = self.namespaced::<ConfigMap>(ns)?;
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::ConfigMap(live))
            }
            ChildObject::ServiceAccount(obj) => {
                let api = self.namespaced::<ServiceAccount>(ns)?;
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::ServiceAccount(live))
            }
            ChildObject::ClusterRole(obj) => {
                let api = Api::<ClusterRole>::all(self.client.clone());
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::ClusterRole(live))
            }
            ChildObject::ClusterRoleBinding(obj) => {
                let api = Api::<ClusterRoleBinding>::all(self.client.clone());
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::ClusterRoleBinding(live))
            }
            ChildObject::Deployment(obj) => {
                let api = self.namespaced::<Deployment>(ns)?;
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::Deployment(live))
            }
            ChildObject::Service(obj) => {
                let api = self.namespaced::<Service>(ns)?;
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::Service(live))
            }
            ChildObject::Ingress(obj) => {
                let api = self.namespaced::<Ingress>(ns)?;
                let (outcome, live) = self.converge(api, obj, desired).await?;
                (outcome, ChildObject::Ingress(live))
            }
        };
        Ok(Applied { outcome, live })
    }

    async fn delete_child(
        &self,
        kind: ChildKind,
        name: &str,
        namespace: &str,
    ) -> Result<bool, Error> {
        let namespace = Some(namespace).filter(|ns| !ns.is_empty());
        match kind {
            ChildKind::ConfigMap => {
                Self::delete(self.namespaced::<ConfigMap>(namespace)?, name).await
            }
            ChildKind::ServiceAccount => {
                Self::delete(self.namespaced::<ServiceAccount>(namespace)?, name).await
            }
            ChildKind::ClusterRole => {
                Self::delete(Api::<ClusterRole>::all(self.client.clone()), name).await
            }
            ChildKind::ClusterRoleBinding => {
                Self::delete(Api::<ClusterRoleBinding>::all(self.client.clone()), name).await
            }
            ChildKind::Deployment => {
                Self::delete(self.namespaced::<Deployment>(namespace)?, name).await
            }
            ChildKind::Service => Self::delete(self.namespaced::<Service>(namespace)?, name).await,
            ChildKind::Ingress => Self::delete(self.namespaced::<Ingress>(namespace)?, name).await,
        }
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context shared by every reconciliation
pub struct InstanceContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn InstanceKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Requeue intervals
    pub config: ReconcilerConfig,
}

impl InstanceContext {
    /// Create a new InstanceContext with the given dependencies
    pub fn new(
        kube: Arc<dyn InstanceKubeClient>,
        events: Arc<dyn EventPublisher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            kube,
            events,
            config,
        }
    }

    /// Create a context backed by a real Kubernetes client
    pub fn from_client(client: Client, config: ReconcilerConfig) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self {
            kube: Arc::new(InstanceKubeClientImpl::new(client)),
            events,
            config,
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn InstanceKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(NoopEventPublisher),
            config: ReconcilerConfig::default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Result of converging every child object
struct Converged {
    endpoint_address: String,
    mutated: bool,
}

/// Reconcile a Dex resource
///
/// Failures inside the pass are recorded in status and requeued after the
/// error backoff. Only a failure to write that status is returned.
#[instrument(skip(dex, ctx), fields(dex = %resource_key(dex.as_ref())))]
pub async fn reconcile(dex: Arc<Dex>, ctx: Arc<InstanceContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(METRICS_LABEL);
    let generation = dex.meta().generation;
    let mut current = dex.status_or_default();
    info!(phase = %current.phase, "reconciling dex instance");

    if current.phase == Phase::Uninitialized {
        let initialising = DexStatus::initialising(generation);
        update_status(&dex, &ctx, &current, &initialising).await?;
        publish(&dex, &ctx, EventType::Normal, reasons::INITIALISING, None).await;
        current = initialising;
    }

    match converge(&dex, &ctx).await {
        Ok(converged) => {
            let next = DexStatus::active(converged.endpoint_address, generation);
            let changed = update_status(&dex, &ctx, &current, &next).await?;
            if current.phase != Phase::Active {
                info!(endpoint = ?next.endpoint_address, "dex instance active");
                publish(&dex, &ctx, EventType::Normal, reasons::CREATED, None).await;
            } else if changed || converged.mutated {
                publish(&dex, &ctx, EventType::Normal, reasons::UPDATED, None).await;
            }
            timer.success();
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) => {
            warn!(error = %e, retryable = e.is_retryable(), "dex reconciliation failed");
            timer.error(e.kind());
            let next = DexStatus::failing(e.to_string(), generation);
            if update_status(&dex, &ctx, &current, &next).await? {
                publish(
                    &dex,
                    &ctx,
                    EventType::Warning,
                    reasons::RECONCILE_FAILED,
                    Some(e.to_string()),
                )
                .await;
            }
            Ok(Action::requeue(ctx.config.error_backoff))
        }
    }
}

/// Error policy for the instance controller
///
/// Reached only when a status write failed; the pass is retried after the
/// error backoff.
pub fn error_policy(dex: Arc<Dex>, error: &Error, ctx: Arc<InstanceContext>) -> Action {
    error!(
        ?error,
        dex = %resource_key(dex.as_ref()),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff)
}

/// Render and converge every child object, in dependency order
async fn converge(dex: &Dex, ctx: &InstanceContext) -> Result<Converged, Error> {
    dex.validate()?;
    let namespace = dex
        .namespace()
        .ok_or_else(|| Error::validation_for(dex.name_any(), "Dex resource has no namespace"))?;

    let config_map = dex_templates::config_map(dex)?;
    let deployment = dex_templates::deployment(dex, &config_map);
    let mut children = vec![
        ChildObject::ConfigMap(config_map),
        ChildObject::ServiceAccount(dex_templates::service_account(dex)),
        ChildObject::ClusterRole(dex_templates::cluster_role(dex)),
        ChildObject::ClusterRoleBinding(dex_templates::cluster_role_binding(dex)),
        ChildObject::Deployment(deployment),
        ChildObject::Service(dex_templates::api_service(dex)),
        ChildObject::Service(dex_templates::metrics_service(dex)),
    ];
    if dex.spec.ingress_enabled() {
        children.push(ChildObject::Ingress(dex_templates::ingress(dex)?));
    }

    let api_service_name = dex.api_service_name();
    let mut mutated = false;
    let mut endpoint_address = None;
    for desired in &children {
        let applied = ctx.kube.apply_child(desired).await?;
        if applied.outcome.is_mutation() {
            mutated = true;
            debug!(child = %desired.display_name(), outcome = ?applied.outcome, "converged child");
        }
        if let ChildObject::Service(live) = &applied.live {
            if desired.name() == api_service_name {
                endpoint_address = Some(registrar_address(live)?);
            }
        }
    }

    if !dex.spec.ingress_enabled()
        && ctx
            .kube
            .delete_child(ChildKind::Ingress, &api_service_name, &namespace)
            .await?
    {
        info!(ingress = %api_service_name, "deleted ingress");
        mutated = true;
    }

    let endpoint_address = endpoint_address.ok_or_else(|| {
        Error::internal_with_context("reconcile", "API service was not converged")
    })?;
    Ok(Converged {
        endpoint_address,
        mutated,
    })
}

/// Check if the observed status already carries every field of `next`
fn is_status_unchanged(current: &DexStatus, next: &DexStatus) -> bool {
    current == next
}

/// Write `next` unless it equals `current`. Returns whether a write happened.
async fn update_status(
    dex: &Dex,
    ctx: &InstanceContext,
    current: &DexStatus,
    next: &DexStatus,
) -> Result<bool, Error> {
    if is_status_unchanged(current, next) {
        debug!("status unchanged, skipping update");
        return Ok(false);
    }
    let namespace = dex.namespace().unwrap_or_default();
    ctx.kube
        .patch_dex_status(&dex.name_any(), &namespace, next)
        .await?;
    Ok(true)
}

async fn publish(
    dex: &Dex,
    ctx: &InstanceContext,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&dex.object_ref(&()), type_, reason, actions::RECONCILE, note)
        .await;
}
