//! HTTP route definitions

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::ProxyState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    cached_skins: usize,
    tracked_skin_keys: usize,
    tracked_ip_keys: usize,
}

async fn health_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Json<HealthResponse>, StatusCode> {
    if !state
        .limiters
        .http
        .consume(&peer.ip().to_string(), 1)
        .is_allowed()
    {
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        cached_skins: state.cache.indexed_records(),
        tracked_skin_keys: state.limiters.skins.tracked_keys(),
        tracked_ip_keys: state.limiters.skins_ip.tracked_keys(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use tempfile::TempDir;

    use crate::config::{Config, RateLimits};

    async fn state_with_http_capacity(capacity: u32) -> (ProxyState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            skin_cache_dir: dir.path().to_path_buf(),
            skin_lifetime_ms: 3_600_000,
            skin_prune_interval_ms: 600_000,
            max_skin_bytes: 1024 * 1024,
            ratelimits: RateLimits {
                refills_per_min: 10,
                http: capacity,
                ws: 100,
                motd: 100,
                skins: 1000,
                skins_ip: 10_000,
                connect: 100,
            },
            origin_whitelist: None,
            origin_blacklist: Vec::new(),
        };
        (ProxyState::new(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn health_is_gated_by_the_http_limiter() {
        let (state, _dir) = state_with_http_capacity(1).await;
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4321);

        assert!(health_handler(State(state.clone()), ConnectInfo(peer))
            .await
            .is_ok());
        assert_eq!(
            health_handler(State(state), ConnectInfo(peer))
                .await
                .err(),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
    }

    #[tokio::test]
    async fn health_limits_peers_independently() {
        let (state, _dir) = state_with_http_capacity(1).await;
        let first = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1);
        let second = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 1);

        assert!(health_handler(State(state.clone()), ConnectInfo(first))
            .await
            .is_ok());
        assert!(health_handler(State(state), ConnectInfo(second))
            .await
            .is_ok());
    }
}
