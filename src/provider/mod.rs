//! Provider boundary.
//!
//! A provider performs create/update/destroy/read against real (or simulated)
//! infrastructure, one resource at a time. The executor decides what to call
//! and when; providers never see the graph.

mod http;
mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

pub use http::HttpProvider;
pub use local::{DEFAULT_PROVIDER_FILE, LocalProvider};

/// Outputs a provider reports for a resource (`id`, `arn`, ...).
pub type Outputs = BTreeMap<String, Value>;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutcome {
    /// Provider-assigned id.
    pub provider_id: String,
    /// Outputs available to dependents.
    pub outputs: Outputs,
}

/// A resource as the provider currently sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedResource {
    /// Attributes the resource currently has.
    pub attributes: Attributes,
    /// Current outputs.
    pub outputs: Outputs,
}

/// Operations a provider must support.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<CreateOutcome>;

    /// Updates a resource in place, returning its new outputs.
    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Outputs>;

    /// Destroys a resource. Returns `NotFound` if it no longer exists.
    async fn destroy(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()>;

    /// Reads a resource, or `None` if it no longer exists.
    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ObservedResource>>;
}

/// Decides whether a transient provider error is retried.
///
/// The executor never retries on its own; it asks the hook after each
/// transient failure.
pub trait RetryHook: Send + Sync + Debug {
    /// Returns how long to wait before attempt `attempt + 1`, or `None` to give up.
    fn retry_after(&self, id: &str, attempt: u32, error: &ProviderError) -> Option<Duration>;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryHook for NoRetry {
    fn retry_after(&self, _id: &str, _attempt: u32, _error: &ProviderError) -> Option<Duration> {
        None
    }
}

/// Retries up to `max_attempts` times, honouring the provider's retry-after
/// hint when it gives one.
#[derive(Debug, Clone, Copy)]
pub struct BoundedRetry {
    max_attempts: u32,
    delay: Duration,
}

impl BoundedRetry {
    /// Creates a hook allowing `max_attempts` retries spaced by `delay`.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl RetryHook for BoundedRetry {
    fn retry_after(&self, _id: &str, attempt: u32, error: &ProviderError) -> Option<Duration> {
        (attempt <= self.max_attempts).then(|| {
            error
                .retry_after_secs()
                .map_or(self.delay, Duration::from_secs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_retry() {
        let err = ProviderError::Unavailable {
            message: String::from("down"),
        };
        assert_eq!(NoRetry.retry_after("vpc", 1, &err), None);
    }

    #[test]
    fn test_bounded_retry() {
        let hook = BoundedRetry::new(2, Duration::from_millis(10));
        let unavailable = ProviderError::Unavailable {
            message: String::from("down"),
        };
        let limited = ProviderError::RateLimited { retry_after_secs: 3 };

        assert_eq!(hook.retry_after("vpc", 1, &unavailable), Some(Duration::from_millis(10)));
        assert_eq!(hook.retry_after("vpc", 2, &limited), Some(Duration::from_secs(3)));
        assert_eq!(hook.retry_after("vpc", 3, &unavailable), None);
    }
}
