pub mod error;
pub mod origin;
mod ws;

use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::admission::Admission;
use crate::session::SessionConfig;
use crate::shutdown::ShutdownCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub admission: Admission,
    pub session_config: Arc<SessionConfig>,
    pub shutdown: ShutdownCoordinator,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without rate limiting.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Per-peer-IP request rate on `/ws`, in requests per second.
    pub rate_limit: Option<u32>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn not_found() -> error::ApiError {
    error::ApiError::NotFound
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route_layer(axum::middleware::from_fn(origin::check_ws_origin))
        .with_state(state);

    // Apply rate limiting to the upgrade route if configured.
    let ws_routes = match config.rate_limit {
        Some(rps) => {
            use tower_governor::{
                governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorLayer,
            };
            let governor_conf = GovernorConfigBuilder::default()
                .per_second(u64::from(rps))
                .burst_size(rps)
                .key_extractor(PeerIpKeyExtractor)
                .finish();
            match governor_conf {
                Some(conf) => ws_routes.layer(GovernorLayer::new(Arc::new(conf))),
                None => {
                    tracing::warn!(rate_limit = rps, "invalid rate limit, not enforcing");
                    ws_routes
                }
            }
        }
        None => ws_routes,
    };

    Router::new()
        .route("/health", get(health))
        .merge(ws_routes)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
}
