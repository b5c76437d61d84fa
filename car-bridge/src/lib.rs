//! HTTP surface for serving StarGate CAR responses.
//!
//! Requests are routed by app prefix. Each response is composed in
//! full into an anonymous temp file before a single byte reaches the
//! client, so a request either yields a complete, valid CAR stream or
//! an error status, never a truncated body.

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use stargate_store::resolver::AppResolver;

mod handler;

#[derive(Clone)]
pub struct AppState {
    apps: Arc<HashMap<String, Arc<dyn AppResolver>>>,
}

/// Build the router serving every registered app under
/// `/<prefix>/<cid>[/<path…>]`. Unregistered prefixes are rejected by
/// the handler with a 400.
pub fn gen_router(apps: HashMap<String, Arc<dyn AppResolver>>) -> Router {
    Router::new()
        .route("/:app/*rest", get(handler::serve))
        .fallback(handler::fallback)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            apps: Arc::new(apps),
        })
}

#[cfg(test)]
mod tests;
