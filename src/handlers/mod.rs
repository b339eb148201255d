//! HTTP handlers module
//!
//! Contains all HTTP endpoint handling logic

pub mod credits;
pub mod gateway;
pub mod health;

use crate::config::Settings;
use crate::services::key_pool::KeyPoolRegistry;
use crate::services::ledger::{MemoryStore, QuotaLimits, UsageLedger, UsageStore};
use anyhow::Result;
use axum::{middleware, routing::get, routing::post, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Application state
pub struct AppState {
    pub settings: Settings,
    /// One key pool per credential-set id, for the process lifetime
    pub key_pools: KeyPoolRegistry,
    /// Free-tier usage accounting
    pub ledger: UsageLedger,
}

/// Create application router with an in-memory usage store
pub async fn create_router(settings: Settings) -> Result<Router> {
    create_router_with_store(settings, Arc::new(MemoryStore::new()))
}

/// Create application router over an explicit usage store.
///
/// The registry and ledger are constructed here, at startup, and owned by
/// the application state; adapters receive them by reference.
pub fn create_router_with_store(
    settings: Settings,
    store: Arc<dyn UsageStore>,
) -> Result<Router> {
    let ledger = UsageLedger::new(
        store,
        QuotaLimits {
            weekly_conversations: settings.free_tier.weekly_limit,
            weekly_images: settings.free_tier.image_limit,
        },
    );

    let app_state = Arc::new(AppState {
        settings,
        key_pools: KeyPoolRegistry::new(),
        ledger,
    });

    // Create middleware stack
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Create routes
    let router = Router::new()
        .route("/v1/chat", post(gateway::handle_chat))
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .layer(middleware::from_fn(
            crate::middleware::logging::request_logging_middleware,
        ))
        .with_state(app_state)
        .layer(middleware_stack);

    Ok(router)
}
