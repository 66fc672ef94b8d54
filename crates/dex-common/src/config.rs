//! Reconciler configuration
//!
//! Backoff intervals and registrar timeouts are carried by value into each
//! controller context at construction time.

use std::time::Duration;

/// Default delay before retrying a failed reconciliation
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Default delay before re-checking an Instance that is not ready yet
pub const DEFAULT_DEPENDENCY_WAIT: Duration = Duration::from_secs(10);

/// Default periodic resync interval for converged resources
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Default upper bound for a single registrar RPC
pub const DEFAULT_REGISTRAR_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound for establishing a registrar connection
pub const DEFAULT_REGISTRAR_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing configuration shared by both reconcilers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Requeue delay after a failed pass
    pub error_backoff: Duration,
    /// Requeue delay while waiting for a dependency to become ready
    pub dependency_wait: Duration,
    /// Requeue delay after a successful pass
    pub resync_interval: Duration,
    /// Timeout applied to every registrar RPC
    pub registrar_timeout: Duration,
    /// Timeout for establishing the registrar channel
    pub registrar_connect_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            error_backoff: DEFAULT_ERROR_BACKOFF,
            dependency_wait: DEFAULT_DEPENDENCY_WAIT,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            registrar_timeout: DEFAULT_REGISTRAR_TIMEOUT,
            registrar_connect_timeout: DEFAULT_REGISTRAR_CONNECT_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.error_backoff, Duration::from_secs(30));
        assert_eq!(config.dependency_wait, Duration::from_secs(10));
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(config.registrar_connect_timeout <= config.registrar_timeout);
    }
}
