//! Controller runner - builds controller futures for each reconciled kind
//!
//! Each `build_*` function returns boxed futures that the caller drives to
//! completion. Both controllers stop on SIGTERM/SIGINT.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};

use dex_client::{ClientContext, CONTROLLER_NAME as CLIENT_CONTROLLER};
use dex_common::crd::{Dex, DexClient};
use dex_common::ReconcilerConfig;
use dex_instance::{InstanceContext, CONTROLLER_NAME as INSTANCE_CONTROLLER};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be driven
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the Dex instance controller
///
/// Changes to any owned child (ServiceAccount, ConfigMap, Deployment, Service,
/// Ingress) requeue the owning instance so drift is repaired without waiting
/// for the resync.
pub fn build_instance_controller(client: Client, config: ReconcilerConfig) -> ControllerFuture {
    let ctx = Arc::new(InstanceContext::from_client(client.clone(), config));
    let dexes: Api<Dex> = Api::all(client.clone());

    tracing::info!("- {INSTANCE_CONTROLLER}");

    Box::pin(
        Controller::new(dexes, watcher_config())
            .owns(Api::<ServiceAccount>::all(client.clone()), watcher_config())
            .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
            .owns(Api::<Deployment>::all(client.clone()), watcher_config())
            .owns(Api::<Service>::all(client.clone()), watcher_config())
            .owns(Api::<Ingress>::all(client), watcher_config())
            .shutdown_on_signal()
            .run(dex_instance::reconcile, dex_instance::error_policy, ctx)
            .for_each(log_reconcile_result("Dex")),
    )
}

/// Build the DexClient controller
///
/// Besides its own Secrets, the controller watches Dex instances: a change
/// to an instance (typically becoming ready) requeues every client that
/// references it.
pub fn build_client_controller(client: Client, config: ReconcilerConfig) -> ControllerFuture {
    let ctx = Arc::new(ClientContext::from_client(client.clone(), config));
    let clients: Api<DexClient> = Api::all(client.clone());

    tracing::info!("- {CLIENT_CONTROLLER}");

    let controller = Controller::new(clients, watcher_config());
    let store = controller.store();

    Box::pin(
        controller
            .owns(Api::<Secret>::all(client.clone()), watcher_config())
            .watches(Api::<Dex>::all(client), watcher_config(), move |dex| {
                let affected = clients_for_instance(&store.state(), &dex);
                tracing::debug!(
                    dex = %dex.name_any(),
                    affected_count = affected.len(),
                    "Triggering re-reconciliation of referencing clients"
                );
                affected
            })
            .shutdown_on_signal()
            .run(dex_client::reconcile, dex_client::error_policy, ctx)
            .for_each(log_reconcile_result("DexClient")),
    )
}

/// Build every controller the operator runs
pub fn build_controllers(client: Client, config: ReconcilerConfig) -> Vec<ControllerFuture> {
    vec![
        build_instance_controller(client.clone(), config.clone()),
        build_client_controller(client, config),
    ]
}

/// Clients whose `instanceRef` resolves to `dex`
fn clients_for_instance(clients: &[Arc<DexClient>], dex: &Dex) -> Vec<ObjectRef<DexClient>> {
    let namespace = dex.namespace().unwrap_or_default();
    let name = dex.name_any();
    clients
        .iter()
        .filter(|c| c.spec.instance_ref.name == name && c.instance_namespace() == namespace)
        .map(|c| ObjectRef::from_obj(c.as_ref()))
        .collect()
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dex_common::crd::{DexClientSpec, DexSpec, InstanceRef};
    use http::{Request, Response};
    use kube::client::Body;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn dex(namespace: &str, name: &str) -> Dex {
        let mut dex = Dex::new(
            name,
            DexSpec {
                public_url: "https://login.example.com/dex".to_string(),
                connectors: vec![],
                replicas: None,
                image: None,
                instance_labels: Default::default(),
                resources: None,
                ingress: None,
            },
        );
        dex.metadata.namespace = Some(namespace.to_string());
        dex
    }

    fn client(
        namespace: &str,
        name: &str,
        instance: &str,
        instance_ns: Option<&str>,
    ) -> Arc<DexClient> {
        let mut client = DexClient::new(
            name,
            DexClientSpec {
                name: name.to_string(),
                redirect_uris: vec!["https://app.example.com/callback".to_string()],
                public: false,
                instance_ref: InstanceRef {
                    name: instance.to_string(),
                    namespace: instance_ns.map(str::to_string),
                },
                template: None,
            },
        );
        client.metadata.namespace = Some(namespace.to_string());
        Arc::new(client)
    }

    /// Story: an instance becoming ready wakes exactly the clients that use it
    #[test]
    fn story_instance_change_requeues_referencing_clients() {
        let clients = vec![
            client("apps", "web", "idp", Some("auth")),
            client("auth", "admin", "idp", None),
            client("apps", "other", "idp", None),
            client("apps", "elsewhere", "staging", Some("auth")),
        ];

        let affected = clients_for_instance(&clients, &dex("auth", "idp"));

        assert_eq!(
            affected,
            vec![
                ObjectRef::new("web").within("apps"),
                ObjectRef::new("admin").within("auth"),
            ]
        );
    }

    #[test]
    fn unreferenced_instance_requeues_nothing() {
        let clients = vec![client("apps", "web", "idp", Some("auth"))];
        assert!(clients_for_instance(&clients, &dex("auth", "unused")).is_empty());
    }

    /// Story: editing or deleting any child of an instance wakes the
    /// instance controller, so every kind it creates is watched
    #[tokio::test]
    async fn story_instance_controller_watches_every_child_kind() {
        let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "default");
        let controller = tokio::spawn(build_instance_controller(
            client,
            ReconcilerConfig::default(),
        ));

        let expected: BTreeSet<&str> = [
            "/apis/dex.karavel.io/v1alpha1/dexes",
            "/api/v1/serviceaccounts",
            "/api/v1/configmaps",
            "/apis/apps/v1/deployments",
            "/api/v1/services",
            "/apis/networking.k8s.io/v1/ingresses",
        ]
        .into_iter()
        .collect();
        let mut watched = BTreeSet::new();
        while !expected.iter().all(|path| watched.contains(*path)) {
            let (request, _unanswered) =
                tokio::time::timeout(Duration::from_secs(10), handle.next_request())
                    .await
                    .expect("controller stopped listing")
                    .expect("controller dropped the client");
            watched.insert(request.uri().path().to_string());
        }
        controller.abort();
    }
}
