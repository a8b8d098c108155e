//! HTTP surface: HLS delivery plus the administrative control routes
//!
//! Routes, per the delivery contract:
//!
//! ```text
//! GET  /health                              liveness
//! GET  /streams                             JSON index with freshness
//! GET  /streams/:key                        one record, 404 if unknown
//! POST /streams/:key/stop                   operator-forced drain
//! GET  /hls/<key>/master.m3u8               playlist, 5 s cache
//! GET  /hls/<key>/<N>/playlist.m3u8         playlist, 5 s cache
//! GET  /hls/<key>/<N>/segment_<SSS>.ts      segment, 120 s cache, ranges
//! OPTIONS /hls/*                            204 + preflight headers
//! ```
//!
//! Shared behavior (CORS, the traversal guard) is middleware chained
//! around the route handlers; cache rules are type-aware and set per
//! handler. Every handler gets an explicitly passed [`AppState`]; no
//! hidden singletons.

pub mod admin;
pub mod hls;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::controller::PublishController;
use crate::hls::{ArtifactStore, HlsHealthMonitor};
use crate::registry::StreamRegistry;

/// Per-request timeout across the whole surface
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub store: Arc<ArtifactStore>,
    pub health: Arc<HlsHealthMonitor>,
    pub controller: Arc<PublishController>,
}

/// Build the complete router
pub fn router(state: AppState) -> Router {
    let hls_routes = Router::new()
        .route("/hls/*path", get(hls::serve).options(hls::preflight))
        .layer(middleware::from_fn(cors_headers));

    Router::new()
        .route("/health", get(admin::health))
        .route("/streams", get(admin::list_streams))
        .route("/streams/:key", get(admin::get_stream))
        .route("/streams/:key/stop", post(admin::stop_stream))
        .merge(hls_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// CORS transformer applied to every HLS response, preflight or not
async fn cors_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range"),
    );
    response
}
