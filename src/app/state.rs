//! Application state shared across routes

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::policy::DomainPolicy;
use crate::ratelimit::BucketRateLimiter;
use crate::skins::{BackoffPolicy, PassthroughProcessor, SkinCache, SkinFetcher, SkinService};

/// One limiter per rate-limited resource class. The `motd` limiter is owned
/// here so the outer proxy's ping handler can claim it.
pub struct Limiters {
    pub http: Arc<BucketRateLimiter>,
    pub ws: Arc<BucketRateLimiter>,
    pub motd: Arc<BucketRateLimiter>,
    pub skins: Arc<BucketRateLimiter>,
    pub skins_ip: Arc<BucketRateLimiter>,
    pub connect: Arc<BucketRateLimiter>,
}

impl Limiters {
    fn new(config: &Config) -> Self {
        let limits = &config.ratelimits;
        let make = |capacity| BucketRateLimiter::new(capacity, limits.refills_per_min);
        Self {
            http: make(limits.http),
            ws: make(limits.ws),
            motd: make(limits.motd),
            skins: make(limits.skins),
            skins_ip: make(limits.skins_ip),
            connect: make(limits.connect),
        }
    }

    fn dispose(&self) {
        for limiter in [
            &self.http,
            &self.ws,
            &self.motd,
            &self.skins,
            &self.skins_ip,
            &self.connect,
        ] {
            limiter.dispose();
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    pub limiters: Arc<Limiters>,
    pub cache: Arc<SkinCache>,
    pub skins: Arc<SkinService>,
}

impl ProxyState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let limiters = Arc::new(Limiters::new(&config));

        let cache = SkinCache::open(
            &config.skin_cache_dir,
            Duration::from_millis(config.skin_prune_interval_ms),
        )
        .await?;

        let fetcher = SkinFetcher::new(BackoffPolicy::default(), config.max_skin_bytes);

        let policy = DomainPolicy::new(
            config.origin_whitelist.clone(),
            config.origin_blacklist.clone(),
        );

        let skins = Arc::new(SkinService::new(
            cache.clone(),
            fetcher,
            limiters.skins.clone(),
            limiters.skins_ip.clone(),
            policy,
            Box::new(PassthroughProcessor),
            config.skin_lifetime_ms,
        ));

        Ok(Self {
            config,
            limiters,
            cache,
            skins,
        })
    }

    /// Stop all background sweep tasks.
    pub fn dispose(&self) {
        self.limiters.dispose();
        self.cache.dispose();
    }
}
