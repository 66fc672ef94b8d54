//! Kubernetes Event recording for the Dex controllers.
//!
//! Events are an audit trail of lifecycle transitions, never an input to
//! control flow. Publishing is fire-and-forget: failures are logged and
//! swallowed so a broken event sink cannot stall reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller was doing (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event. Used in tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// First observation, status moved to Initialising
    pub const INITIALISING: &str = "Initialising";
    /// Resource converged for the first time
    pub const CREATED: &str = "Created";
    /// Converged resource changed something on a later pass
    pub const UPDATED: &str = "Updated";
    /// Remote registration retracted during deletion
    pub const DELETED: &str = "Deleted";
    /// Credential secret was corrupt and has been regenerated
    pub const SECRET_ROTATED: &str = "SecretRotated";
    /// A reconciliation pass failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Asserting a client registration on the remote registrar
    pub const REGISTER: &str = "Register";
    /// Retracting a client registration on the remote registrar
    pub const RETRACT: &str = "Retract";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        for reason in [
            reasons::INITIALISING,
            reasons::CREATED,
            reasons::UPDATED,
            reasons::DELETED,
            reasons::SECRET_ROTATED,
            reasons::RECONCILE_FAILED,
        ] {
            assert!(reason.chars().next().is_some_and(|c| c.is_ascii_uppercase()));
            assert!(!reason.contains(' '));
        }
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::RECONCILE_FAILED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
