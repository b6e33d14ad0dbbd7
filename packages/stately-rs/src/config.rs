use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tracing::error;

use crate::conflict::ConflictPolicy;
use crate::error::ActionError;

/// Default time `Store::wait_idle` waits before giving up.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Receives errors of actions that do not handle their own failures.
///
/// Called for failures of async actions that are not `error_managed` and have
/// no error effect. Aborts are never reported.
pub trait ErrorNotifier: Send + Sync + 'static {
    /// Report an unhandled action error.
    fn notify(&self, store: &str, error: &ActionError);
}

impl<F> ErrorNotifier for F
where
    F: Fn(&str, &ActionError) + Send + Sync + 'static,
{
    fn notify(&self, store: &str, error: &ActionError) {
        self(store, error)
    }
}

/// Logs unhandled action errors at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, store: &str, error: &ActionError) {
        error!(store, action = error.action(), error = %error, "unhandled action error");
    }
}

/// Engine-wide settings shared by stores.
#[derive(Clone)]
pub struct EngineConfig {
    /// Conflict policy for async actions that do not set one.
    pub default_policy: ConflictPolicy,
    /// How long `Store::wait_idle` waits.
    pub idle_timeout: Duration,
    /// Where unhandled action errors go.
    pub error_notifier: Arc<dyn ErrorNotifier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_policy: ConflictPolicy::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            error_notifier: Arc::new(TracingNotifier),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Reads `STATELY_DEFAULT_POLICY` and `STATELY_IDLE_TIMEOUT_MS`; unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let default_policy = match env::var("STATELY_DEFAULT_POLICY") {
            Ok(value) => value
                .parse()
                .context("STATELY_DEFAULT_POLICY must be one of keep_all, keep_last, ignore, reject, parallel")?,
            Err(_) => ConflictPolicy::default(),
        };

        let idle_timeout = match env::var("STATELY_IDLE_TIMEOUT_MS") {
            Ok(value) => Duration::from_millis(
                value
                    .parse()
                    .context("STATELY_IDLE_TIMEOUT_MS must be a valid number")?,
            ),
            Err(_) => DEFAULT_IDLE_TIMEOUT,
        };

        Ok(Self {
            default_policy,
            idle_timeout,
            ..Self::default()
        })
    }

    /// Set the default conflict policy.
    pub fn with_default_policy(mut self, policy: ConflictPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set the idle wait timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the error notifier.
    pub fn with_error_notifier(mut self, notifier: impl ErrorNotifier) -> Self {
        self.error_notifier = Arc::new(notifier);
        self
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("default_policy", &self.default_policy)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
