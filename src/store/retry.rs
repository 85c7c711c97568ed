//! Decorator type for a [`DataStore`] implementation that retries
//! transient failures with exponential backoff.
//!
//! Only the transient failure classes ([`StoreError::is_transient`]) are
//! retried; conflicts, not-found and other 4xx-equivalents pass through
//! immediately. The decorator is transparent to the commit engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::document::ObjectDocument;
use crate::event::Event;
use crate::store::{DataStore, RecoverableDataStore, StoreError};
use crate::version::Version;

/// Exponential backoff settings for [`Resilient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on the delay between retries.
    pub max_delay: Duration,

    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay to apply after the given zero-based failed attempt.
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Decorator around a [`DataStore`] that retries transient errors
/// according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Resilient<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S> Resilient<S> {
    /// Wraps the given store with the given retry policy.
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0u32;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient storage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<S> DataStore for Resilient<S>
where
    S: DataStore,
{
    async fn append(&self, document: &ObjectDocument, events: &[Event]) -> Result<(), StoreError> {
        self.run("append", || self.store.append(document, events))
            .await
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        self.run("read", || {
            self.store.read(document, start_version, until_version, chunk)
        })
        .await
    }

    fn recovery(&self) -> Option<&dyn RecoverableDataStore> {
        // Recovery removal runs once, uncushioned: the commit engine owns
        // the failure handling on that path.
        self.store.recovery()
    }
}

/// Extension trait that decorates any [`DataStore`] with retries.
pub trait ResilientDataStoreExt: DataStore + Sized {
    /// Wraps this store in a [`Resilient`] decorator using the given policy.
    fn with_retries(self, policy: RetryPolicy) -> Resilient<Self> {
        Resilient::new(self, policy)
    }
}

impl<S> ResilientDataStoreExt for S where S: DataStore + Sized {}

/// Blanket forwarding so `Arc<dyn DataStore>` and friends can be decorated
/// and shared without extra glue.
#[async_trait]
impl DataStore for Arc<dyn DataStore> {
    async fn append(&self, document: &ObjectDocument, events: &[Event]) -> Result<(), StoreError> {
        (**self).append(document, events).await
    }

    async fn read(
        &self,
        document: &ObjectDocument,
        start_version: Version,
        until_version: Option<Version>,
        chunk: Option<u64>,
    ) -> Result<Vec<Event>, StoreError> {
        (**self).read(document, start_version, until_version, chunk).await
    }

    fn recovery(&self) -> Option<&dyn RecoverableDataStore> {
        (**self).recovery()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::document::StreamInformation;
    use crate::store::InMemoryDataStore;

    fn document() -> ObjectDocument {
        ObjectDocument::new(
            "order",
            "order-1",
            StreamInformation::new("stream-1", "memory", "data", "documents"),
        )
    }

    fn event(version: Version) -> Event {
        Event {
            event_type: "OrderWasPlaced".to_owned(),
            event_version: version,
            schema_version: 1,
            payload: serde_json::json!({}),
            external_sequencer: None,
            action_metadata: None,
            metadata: HashMap::new(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: 5,
        };

        assert_eq!(Duration::from_millis(100), policy.delay_for(0));
        assert_eq!(Duration::from_millis(200), policy.delay_for(1));
        assert_eq!(Duration::from_millis(350), policy.delay_for(2));
        assert_eq!(Duration::from_millis(350), policy.delay_for(3));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let inner = InMemoryDataStore::new();
        inner.fail_next_append(StoreError::Timeout);
        inner.fail_next_append(StoreError::TooManyRequests);

        let store = inner.clone().with_retries(fast_policy());

        store
            .append(&document(), &[event(0)])
            .await
            .expect("append should succeed after retries");
        assert_eq!(3, inner.append_calls());
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let inner = InMemoryDataStore::new();
        for _ in 0..3 {
            inner.fail_next_append(StoreError::Timeout);
        }

        let store = inner.clone().with_retries(fast_policy());

        let err = store
            .append(&document(), &[event(0)])
            .await
            .expect_err("append should exhaust its attempts");
        assert!(matches!(err, StoreError::Timeout));
        assert_eq!(3, inner.append_calls());
    }

    #[tokio::test]
    async fn non_transient_errors_pass_through() {
        let inner = InMemoryDataStore::new();
        inner.fail_next_append(StoreError::NotFound);

        let store = inner.clone().with_retries(fast_policy());

        let err = store
            .append(&document(), &[event(0)])
            .await
            .expect_err("append should fail immediately");
        assert!(matches!(err, StoreError::NotFound));
        assert_eq!(1, inner.append_calls());
    }
}
