//! Skin request orchestrator
//!
//! Composes the limiter, policy, cache, fetcher and processor. Every
//! fallible step past the protocol checks is locally contained: one failed
//! skin fetch never takes down the connection or the proxy.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::policy::DomainPolicy;
use crate::ratelimit::BucketRateLimiter;
use crate::skins::cache::{CacheError, SkinCache};
use crate::skins::fetch::{FetchError, SkinFetcher};
use crate::skins::{normalize_uuid, CachedSkin, ProcessError, SkinProcessor};
use crate::util::time::unix_millis;
use crate::ws::protocol::{ChannelFrame, ProtocolError, SkinRequest, SkinResponse, SKIN_CHANNEL};
use crate::ws::{ClientHandle, SessionClosed};

/// Failures contained inside the orchestrator (logged, never propagated)
#[derive(Debug, thiserror::Error)]
enum ServiceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Write(#[from] SessionClosed),
}

/// Orchestrates a single skin request end to end
pub struct SkinService {
    cache: Arc<SkinCache>,
    fetcher: SkinFetcher,
    user_limiter: Arc<BucketRateLimiter>,
    ip_limiter: Arc<BucketRateLimiter>,
    policy: DomainPolicy,
    processor: Box<dyn SkinProcessor>,
    lifetime_ms: u64,
}

impl SkinService {
    pub fn new(
        cache: Arc<SkinCache>,
        fetcher: SkinFetcher,
        user_limiter: Arc<BucketRateLimiter>,
        ip_limiter: Arc<BucketRateLimiter>,
        policy: DomainPolicy,
        processor: Box<dyn SkinProcessor>,
        lifetime_ms: u64,
    ) -> Self {
        Self {
            cache,
            fetcher,
            user_limiter,
            ip_limiter,
            policy,
            processor,
            lifetime_ms,
        }
    }

    /// Handle one inbound skin channel message. A [`ProtocolError`] is fatal
    /// to the request; rate-limit and policy denials drop it silently; all
    /// downstream failures are logged with context and swallowed.
    pub async fn handle_request(
        &self,
        frame: ChannelFrame,
        client: &ClientHandle,
    ) -> Result<(), ProtocolError> {
        if frame.channel != SKIN_CHANNEL {
            return Err(ProtocolError::WrongChannel(frame.channel));
        }

        let SkinRequest::FetchByUrl { uuid, url } = SkinRequest::decode(frame.data)?;

        // Per-identity and per-source-address gates; either denial drops the
        // request with no response, so probing is never rewarded
        if !self.user_limiter.consume(&client.username, 1).is_allowed()
            || !self.ip_limiter.consume(&client.addr.to_string(), 1).is_allowed()
        {
            debug!(username = %client.username, addr = %client.addr, "Rate-limited skin request dropped");
            return Ok(());
        }

        // Domain policy, before any cache or network access
        let host = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()));
        let host = match host {
            Some(host) => host,
            None => {
                info!(username = %client.username, url = %url, "Skin request with unparseable URL dropped");
                return Ok(());
            }
        };
        if !self.policy.is_allowed(&host) {
            info!(username = %client.username, host = %host, "Skin source host denied by policy");
            return Ok(());
        }

        let key = normalize_uuid(&uuid).ok_or_else(|| ProtocolError::InvalidSkinId(uuid))?;

        if let Err(e) = self.fulfill(&key, &url, client).await {
            warn!(
                url = %url,
                username = %client.username,
                error = %e,
                "Failed to serve skin"
            );
        }
        Ok(())
    }

    /// Steps 4-6: cache-or-fetch, transform, respond.
    async fn fulfill(&self, key: &str, url: &str, client: &ClientHandle) -> Result<(), ServiceError> {
        let raw = match self.cache.get(key).await {
            Ok(Some(record)) => record.data,
            Ok(None) => self.fetch_and_store(key, url).await?,
            Err(e) => {
                // Storage trouble is infrastructure-level; shout, then fall
                // back to a direct fetch rather than failing the request
                error!(uuid = key, error = %e, "Skin cache read failed");
                self.fetch_and_store(key, url).await?
            }
        };

        let wire = self.processor.to_wire_format(&raw)?;
        let response = SkinResponse::FetchResult {
            uuid: key.to_string(),
            skin: wire,
        };
        client.write(response.into_frame()).await?;
        Ok(())
    }

    async fn fetch_and_store(&self, key: &str, url: &str) -> Result<Bytes, ServiceError> {
        let fetched = self.fetcher.download(url).await?;

        let record = CachedSkin {
            uuid: key.to_string(),
            expires_at: unix_millis() + self.lifetime_ms,
            data: fetched.clone(),
        };
        if let Err(e) = self.cache.set(record).await {
            // Serve the skin anyway; only persistence failed
            error!(uuid = key, error = %e, "Skin cache write failed");
        }

        Ok(fetched)
    }
}
