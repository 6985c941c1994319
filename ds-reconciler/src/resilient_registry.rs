use std::{
    future::Future,
    num::{NonZeroU32, NonZeroU8},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::{
    anchor::TrustAnchor,
    registry::{AnchorId, RegistryClient, RegistryError, RemoteAnchor},
};

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Number of attempts per call before giving up. 1 disables retries.
    pub(crate) max_retries: NonZeroU8,
    /// First retry delay that is then used to calculate the exponential backoff.
    /// Example: 200ms first, then 400ms, 800ms and so on.
    pub(crate) initial_retry_delay: Duration,
    /// Cap on the retry delay so the exponential backoff doesn't get out of hand.
    pub(crate) max_retry_delay: Duration,
}

impl RetrySettings {
    pub fn new() -> Self {
        Self {
            max_retries: NonZeroU8::new(3).expect("3 is non-zero"),
            initial_retry_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_millis(5_000),
        }
    }

    /// Maximum number of attempts per registrar call.
    pub fn max_retries(&mut self, max_retries: NonZeroU8) -> &mut Self {
        self.max_retries = max_retries;
        self
    }

    /// Maximum duration to back off before trying again.
    pub fn max_retry_delay(&mut self, duration: Duration) -> &mut Self {
        self.max_retry_delay = duration;
        self
    }

    /// Delay before the first retry.
    pub fn initial_retry_delay(&mut self, duration: Duration) -> &mut Self {
        self.initial_retry_delay = duration;
        self
    }

    /// Exponential backoff delay starting with `initial_retry_delay` and maxing out at `max_retry_delay`.
    pub(crate) fn retry_delay(&self, retry_count: u8) -> Duration {
        let initial_ms = self.initial_retry_delay.as_millis() as u64;
        let multiplicator = 2u64.saturating_pow(retry_count as u32);
        let delay = Duration::from_millis(initial_ms.saturating_mul(multiplicator));
        delay.min(self.max_retry_delay)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for a [`ResilientRegistry`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub(crate) call_timeout: Duration,
    pub(crate) retry_settings: RetrySettings,
    pub(crate) requests_per_second: Option<NonZeroU32>,
}

impl RegistrySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound for a single registrar call, retries not included.
    pub fn call_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.call_timeout = timeout;
        self
    }

    /// Set settings in relation to retries.
    pub fn retry_settings(&mut self, settings: RetrySettings) -> &mut Self {
        self.retry_settings = settings;
        self
    }

    /// Request budget shared by every caller of the registry. `None` means unlimited.
    pub fn requests_per_second(&mut self, limit: Option<NonZeroU32>) -> &mut Self {
        self.requests_per_second = limit;
        self
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry_settings: RetrySettings::default(),
            requests_per_second: None,
        }
    }
}

/// Registry client wrapper that focuses on resilience.
///
/// Every call gets a timeout, transient failures are retried with an exponential
/// backoff and all calls share one request budget so concurrent workers can't
/// exceed the registrar's rate limit.
pub struct ResilientRegistry<R> {
    inner: R,
    settings: RegistrySettings,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl<R> std::fmt::Debug for ResilientRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientRegistry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: RegistryClient> ResilientRegistry<R> {
    pub fn new(inner: R) -> Self {
        Self::new_with_settings(inner, RegistrySettings::default())
    }

    pub fn new_with_settings(inner: R, settings: RegistrySettings) -> Self {
        let limiter = settings
            .requests_per_second
            .map(|limit| Arc::new(RateLimiter::direct(Quota::per_second(limit))));
        Self {
            inner,
            settings,
            limiter,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Runs `op` with a timeout and retries transient failures. `op` receives
    /// the number of the attempt, starting at 0.
    async fn call<T, F, Fut>(&self, what: &str, domain: &str, op: F) -> Result<T, RegistryError>
    where
        F: Fn(u8) -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let max_retries = self.settings.retry_settings.max_retries.get();
        let timeout = self.settings.call_timeout;
        let mut retry_count = 0;
        loop {
            self.throttle().await;
            let result = match tokio::time::timeout(timeout, op(retry_count)).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Unavailable(format!(
                    "{what} timed out after {timeout:?}"
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry_count + 1 < max_retries => {
                    let delay = self.settings.retry_settings.retry_delay(retry_count);
                    retry_count += 1;
                    tracing::debug!(
                        "{domain} {retry_count}/{max_retries} Failed to {what}: {e}. Sleep for {delay:?} before trying again."
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: RegistryClient> RegistryClient for ResilientRegistry<R> {
    async fn list_trust_anchors(&self, domain: &str) -> Result<Vec<RemoteAnchor>, RegistryError> {
        self.call("list DS records", domain, |_| {
            self.inner.list_trust_anchors(domain)
        })
        .await
    }

    async fn create_trust_anchor(
        &self,
        domain: &str,
        anchor: &TrustAnchor,
    ) -> Result<Option<AnchorId>, RegistryError> {
        // A failed attempt may still have created the record, e.g. when only the
        // answer timed out. Look before creating it a second time.
        self.call("create DS record", domain, |attempt| async move {
            if attempt > 0 {
                let existing = self.inner.list_trust_anchors(domain).await?;
                if let Some(remote) = existing.into_iter().find(|r| &r.anchor == anchor) {
                    tracing::debug!(
                        "{domain} DS {anchor} was created by an earlier attempt (id {}).",
                        remote.id
                    );
                    return Ok(Some(remote.id));
                }
                self.throttle().await;
            }
            self.inner.create_trust_anchor(domain, anchor).await
        })
        .await
    }

    async fn delete_trust_anchor(&self, domain: &str, id: &AnchorId) -> Result<(), RegistryError> {
        self.call("delete DS record", domain, |_| {
            self.inner.delete_trust_anchor(domain, id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct FlakyRegistry {
        failures: usize,
        error: RegistryError,
        attempts: AtomicUsize,
        delay: Duration,
    }

    impl FlakyRegistry {
        fn new(failures: usize, error: RegistryError) -> Self {
            Self {
                failures,
                error,
                attempts: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        async fn attempt(&self) -> Result<(), RegistryError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if attempt < self.failures {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RegistryClient for FlakyRegistry {
        async fn list_trust_anchors(&self, _: &str) -> Result<Vec<RemoteAnchor>, RegistryError> {
            self.attempt().await.map(|_| vec![])
        }

        async fn create_trust_anchor(
            &self,
            _: &str,
            _: &TrustAnchor,
        ) -> Result<Option<AnchorId>, RegistryError> {
            self.attempt().await.map(|_| Some(AnchorId::new("1")))
        }

        async fn delete_trust_anchor(&self, _: &str, _: &AnchorId) -> Result<(), RegistryError> {
            self.attempt().await
        }
    }

    fn fast_settings(max_retries: u8) -> RegistrySettings {
        let mut retry = RetrySettings::new();
        retry
            .max_retries(NonZeroU8::new(max_retries).unwrap())
            .initial_retry_delay(Duration::from_millis(10));
        let mut settings = RegistrySettings::new();
        settings
            .retry_settings(retry)
            .call_timeout(Duration::from_millis(500));
        settings
    }

    #[test]
    fn retry_delay() {
        let mut settings = RetrySettings::new();
        settings
            .max_retries(NonZeroU8::new(10).unwrap())
            .initial_retry_delay(Duration::from_millis(100))
            .max_retry_delay(Duration::from_secs(10));

        assert_eq!(settings.retry_delay(0).as_millis(), 100);
        assert_eq!(settings.retry_delay(1).as_millis(), 200);
        assert_eq!(settings.retry_delay(2).as_millis(), 400);
        assert_eq!(settings.retry_delay(9).as_millis(), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let flaky = FlakyRegistry::new(2, RegistryError::Unavailable("503".to_string()));
        let registry = ResilientRegistry::new_with_settings(flaky, fast_settings(3));

        let res = registry.list_trust_anchors("example.com").await;
        assert!(res.is_ok());
        assert_eq!(registry.inner().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let flaky = FlakyRegistry::new(10, RegistryError::Unavailable("503".to_string()));
        let registry = ResilientRegistry::new_with_settings(flaky, fast_settings(3));

        let err = registry
            .delete_trust_anchor("example.com", &AnchorId::new("5"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(registry.inner().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_not_retried() {
        let flaky = FlakyRegistry::new(10, RegistryError::Rejected("bad digest".to_string()));
        let registry = ResilientRegistry::new_with_settings(flaky, fast_settings(3));

        let anchor = TrustAnchor::new(1111, 13, 2, vec![0xab]);
        let err = registry
            .create_trust_anchor("example.com", &anchor)
            .await
            .unwrap_err();
        assert!(err.is_rejected());
        assert_eq!(registry.inner().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failures_are_not_retried() {
        let flaky = FlakyRegistry::new(10, RegistryError::AuthFailure("bad key".to_string()));
        let registry = ResilientRegistry::new_with_settings(flaky, fast_settings(5));

        let err = registry.list_trust_anchors("example.com").await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(registry.inner().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_retry() {
        let mut flaky = FlakyRegistry::new(0, RegistryError::Unavailable(String::new()));
        flaky.delay = Duration::from_secs(60);
        let registry = ResilientRegistry::new_with_settings(flaky, fast_settings(2));

        let err = registry.list_trust_anchors("example.com").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
        assert_eq!(registry.inner().attempts(), 2);
    }

    #[tokio::test]
    async fn request_budget_is_shared() {
        let flaky = FlakyRegistry::new(0, RegistryError::Unavailable(String::new()));
        let mut settings = fast_settings(1);
        settings.requests_per_second(NonZeroU32::new(2));
        let registry = ResilientRegistry::new_with_settings(flaky, settings);

        let start = std::time::Instant::now();
        for _ in 0..3 {
            registry.list_trust_anchors("example.com").await.unwrap();
        }
        // Burst of two, the third call waits for the quota to replenish.
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(registry.inner().attempts(), 3);
    }

    /// The first create stores the record but never answers.
    #[derive(Default)]
    struct InterruptedCreate {
        store_before_hanging: bool,
        creates: AtomicUsize,
        stored: Mutex<Vec<TrustAnchor>>,
    }

    #[async_trait]
    impl RegistryClient for InterruptedCreate {
        async fn list_trust_anchors(&self, _: &str) -> Result<Vec<RemoteAnchor>, RegistryError> {
            let stored = self.stored.lock().unwrap().clone();
            Ok(stored
                .into_iter()
                .enumerate()
                .map(|(i, anchor)| RemoteAnchor::new(anchor, AnchorId::new(i.to_string())))
                .collect())
        }

        async fn create_trust_anchor(
            &self,
            _: &str,
            anchor: &TrustAnchor,
        ) -> Result<Option<AnchorId>, RegistryError> {
            let attempt = self.creates.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                if self.store_before_hanging {
                    self.stored.lock().unwrap().push(anchor.clone());
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            } else {
                self.stored.lock().unwrap().push(anchor.clone());
            }
            Ok(None)
        }

        async fn delete_trust_anchor(&self, _: &str, _: &AnchorId) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_create_is_not_repeated_if_the_record_exists() {
        let inner = InterruptedCreate {
            store_before_hanging: true,
            ..Default::default()
        };
        let registry = ResilientRegistry::new_with_settings(inner, fast_settings(3));

        let anchor = TrustAnchor::new(1111, 13, 2, vec![0xab]);
        let id = registry
            .create_trust_anchor("example.com", &anchor)
            .await
            .unwrap();

        assert_eq!(id, Some(AnchorId::new("0")));
        assert_eq!(registry.inner().creates.load(Ordering::SeqCst), 1);
        assert_eq!(registry.inner().stored.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_create_is_repeated_if_nothing_was_stored() {
        let registry =
            ResilientRegistry::new_with_settings(InterruptedCreate::default(), fast_settings(3));

        let anchor = TrustAnchor::new(1111, 13, 2, vec![0xab]);
        registry
            .create_trust_anchor("example.com", &anchor)
            .await
            .unwrap();

        assert_eq!(registry.inner().creates.load(Ordering::SeqCst), 2);
        assert_eq!(*registry.inner().stored.lock().unwrap(), vec![anchor]);
    }
}
