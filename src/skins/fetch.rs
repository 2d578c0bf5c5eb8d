//! Outbound skin retrieval guarded by per-host exponential backoff
//!
//! Domain policy checks happen upstream in the orchestrator; by the time a
//! URL reaches this module it is already allowed.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

/// Retry/backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total attempts per call before giving up
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Ceiling for the doubled delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt` (1-based): doubles from
    /// `base_delay`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Fetch errors
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid skin URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upstream returned status {0}")]
    Status(u16),

    #[error("Skin payload exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("Giving up on {host} after {attempts} failed attempts")]
    RetriesExhausted { host: String, attempts: u32 },
}

/// HTTP fetcher with per-target-host backoff state
///
/// Failure streaks escalate the host's attempt count; a success resets it so
/// a future transient failure starts a fresh escalation.
pub struct SkinFetcher {
    client: Client,
    policy: BackoffPolicy,
    max_size: usize,
    attempts: DashMap<String, u32>,
}

impl SkinFetcher {
    pub fn new(policy: BackoffPolicy, max_size: usize) -> Self {
        Self {
            client: Client::new(),
            policy,
            max_size,
            attempts: DashMap::new(),
        }
    }

    /// Fetch a skin, retrying with exponential backoff until the attempt
    /// ceiling, then surfacing [`FetchError::RetriesExhausted`].
    pub async fn download(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_ascii_lowercase();

        self.run_guarded(&host, || self.fetch_once(url)).await
    }

    /// Drive `op` under the backoff policy for `host`. Generic over the
    /// attempt operation so the retry discipline is testable without a
    /// network.
    async fn run_guarded<F, Fut>(&self, host: &str, mut op: F) -> Result<Bytes, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Bytes, FetchError>>,
    {
        loop {
            match op().await {
                Ok(payload) => {
                    self.attempts.remove(host);
                    return Ok(payload);
                }
                Err(e) => {
                    let attempt = {
                        let mut entry = self.attempts.entry(host.to_string()).or_insert(0);
                        *entry += 1;
                        *entry
                    };

                    if attempt >= self.policy.max_attempts {
                        // Streak over: clear so the next call re-probes
                        // instead of failing forever
                        self.attempts.remove(host);
                        warn!(host, attempts = attempt, error = %e, "Skin fetch abandoned");
                        return Err(FetchError::RetriesExhausted {
                            host: host.to_string(),
                            attempts: attempt,
                        });
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(host, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Skin fetch failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_size as u64 {
                return Err(FetchError::TooLarge { max: self.max_size });
            }
        }

        let payload = response.bytes().await?;
        if payload.len() > self.max_size {
            return Err(FetchError::TooLarge { max: self.max_size });
        }
        Ok(payload)
    }

    /// Current failure-streak length for a host (zero if clean).
    pub fn failure_streak(&self, host: &str) -> u32 {
        self.attempts.get(host).map(|v| *v).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn success_after_failures_resets_the_streak() {
        let fetcher = SkinFetcher::new(fast_policy(5), 1024);
        let calls = AtomicU32::new(0);

        let result = fetcher
            .run_guarded("skins.example.com", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(FetchError::Status(503))
                    } else {
                        Ok(Bytes::from_static(b"skin"))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap().as_ref(), b"skin");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(fetcher.failure_streak("skins.example.com"), 0);
    }

    #[tokio::test]
    async fn exhausting_the_ceiling_surfaces_the_failure() {
        let fetcher = SkinFetcher::new(fast_policy(3), 1024);
        let calls = AtomicU32::new(0);

        let result = fetcher
            .run_guarded("down.example.com", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Bytes, _>(FetchError::Status(500)) }
            })
            .await;

        match result {
            Err(FetchError::RetriesExhausted { host, attempts }) => {
                assert_eq!(host, "down.example.com");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Streak cleared so the next call re-probes
        assert_eq!(fetcher.failure_streak("down.example.com"), 0);
    }

    #[tokio::test]
    async fn hosts_escalate_independently() {
        let fetcher = SkinFetcher::new(fast_policy(10), 1024);

        let _ = fetcher
            .run_guarded("a.example.com", || async {
                Ok(Bytes::from_static(b"ok"))
            })
            .await;

        let flaky = AtomicU32::new(0);
        let _ = fetcher
            .run_guarded("b.example.com", || {
                let n = flaky.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FetchError::Status(500))
                    } else {
                        Ok(Bytes::from_static(b"ok"))
                    }
                }
            })
            .await;

        assert_eq!(fetcher.failure_streak("a.example.com"), 0);
        assert_eq!(fetcher.failure_streak("b.example.com"), 0);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_without_network() {
        let fetcher = SkinFetcher::new(fast_policy(3), 1024);
        assert!(matches!(
            fetcher.download("not a url").await,
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(matches!(
            fetcher.download("data:text/plain,hi").await,
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
