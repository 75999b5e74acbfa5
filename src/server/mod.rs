//! HTTP surface — Axum server for the enrichment, index, and progress
//! endpoints.
//!
//! Authenticated routes sit behind the API-key middleware with their
//! required scope; health endpoints stay open. CORS admits the
//! configured frontend origin (the progress bus consumer), everything
//! else is same-origin.

pub mod middleware;
pub mod routes;

use anyhow::Result;
use axum::http::{header, HeaderValue, Method};
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::auth::rate_limit::SlidingWindowLimiter;
use crate::auth::Authenticator;
use crate::config::AppConfig;
use crate::progress::ProgressBus;
use crate::queue::JobQueue;
use crate::store::Store;
use middleware::{auth_middleware, RouteAuth};

/// Shared state accessible by all route handlers.
pub struct ServerState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub bus: Arc<ProgressBus>,
    pub auth: Arc<Authenticator>,
    pub limiter: Arc<SlidingWindowLimiter>,
}

pub type AppState = Arc<ServerState>;

/// Start the API server as a background task — it doesn't block.
pub fn spawn_server(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        info!(port, "API server starting on http://localhost:{port}");

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("Failed to bind API port");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .expect("API server error");
    });

    Ok(())
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = match &state.config.service.frontend_url {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(
                origin.parse::<HeaderValue>().unwrap_or_else(|_| {
                    HeaderValue::from_static("http://localhost:3000")
                }),
            ))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        None => CorsLayer::new()
            .allow_origin("*".parse::<HeaderValue>().unwrap())
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
    };

    let scoped = {
        let state = state.clone();
        move |scope: Option<&'static str>| RouteAuth {
            app: state.clone(),
            required_scope: scope,
        }
    };

    let enrichment_write = Router::new()
        .route("/enrichment/start", post(routes::start_enrichment))
        .route_layer(from_fn_with_state(
            scoped(Some("enrichment:write")),
            auth_middleware,
        ));

    let enrichment_read = Router::new()
        .route("/enrichment/status/:id", get(routes::enrichment_status))
        .route_layer(from_fn_with_state(
            scoped(Some("enrichment:read")),
            auth_middleware,
        ));

    let analytics_read = Router::new()
        .route(
            "/neighborhood-index/:property_id/latest",
            get(routes::index_latest),
        )
        .route(
            "/neighborhood-index/:property_id/trend",
            get(routes::index_trend),
        )
        .route_layer(from_fn_with_state(
            scoped(Some("analytics:read")),
            auth_middleware,
        ));

    // The progress handshake needs a principal but no particular scope —
    // holding the job id is the ownership proof.
    let progress = Router::new()
        .route("/progress/:job_id", get(routes::progress_stream))
        .route_layer(from_fn_with_state(scoped(None), auth_middleware));

    Router::new()
        .merge(enrichment_write)
        .merge(enrichment_read)
        .merge(analytics_read)
        .merge(progress)
        .route("/live", get(routes::live))
        .route("/ready", get(routes::ready))
        .route("/version", get(routes::version))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
