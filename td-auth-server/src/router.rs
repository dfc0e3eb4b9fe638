use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::handlers::*;
use crate::state::AppState;

/// Constructs the HTTP router (health, login, record management) with middleware.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let admin = Router::new()
        .route("/v1/:kind", get(list_domains))
        .route(
            "/v1/:kind/:name",
            post(upsert_domain).get(read_domain).delete(delete_domain),
        )
        .route("/token/lookup", post(lookup_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/:kind/:name/nonce", post(nonce))
        .route("/v1/:kind/:name/login", post(login))
        .route("/v1/:kind/:name/alias", post(alias))
        .merge(admin)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(request_timeout))
}
