//! Application setup and router assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::instance::Instance;
use crate::server::middleware::{auth_middleware, extract_client_ip, JwtVerifier};
use crate::server::routes::{cancel_job, get_job, health_handler, retry_job, stream_job, submit_job};

/// Shared application state reachable from every handler.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub instance: Arc<Instance>,
    pub jwt: Arc<JwtVerifier>,
}

/// Assemble the axum router: routes, auth/IP middleware, CORS, tracing.
pub fn build_app(instance: Arc<Instance>, jwt_secret: &str, allowed_origins: &[String]) -> Router {
    let state = AppState {
        db_pool: instance.db_pool.clone(),
        instance,
        jwt: Arc::new(JwtVerifier::new(jwt_secret)),
    };

    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE])
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/stream", get(stream_job))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(extract_client_ip))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(60)))
        .with_state(state)
}
