//! Civic ticketing server: the ticket state machine driver, its
//! authorization and assignment policies, and the live connection adapter.

pub mod api_ws;
pub mod assignment;
pub mod authz;
pub mod config;
pub mod error;
pub mod events;
pub mod service;
pub mod ws_token;

use std::sync::Arc;

use axum::{routing::get, Extension, Json, Router};
use civic_db::DbPool;
use civic_hub::PubSubHub;
use civic_identity::{IdentityStore, SqliteIdentityStore};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

pub use assignment::{AssignmentPolicy, ManualAssignment, RandomAssignment};
pub use authz::{Actor, Capability};
pub use error::{ServiceError, TransitionConflict};
pub use service::{
    BulkFailure, BulkSummary, NewTicketRequest, TicketPage, TicketService, TransitionCommand,
};
pub use ws_token::{TokenError, WsTokenSigner};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: TicketService,
    /// Checks the `token` a live connection presents.
    pub tokens: WsTokenSigner,
    /// Outbound queue size for each live connection.
    pub connection_buffer: usize,
}

impl AppState {
    /// Wires the service from configuration, reading accounts from the same
    /// database.
    pub fn from_config(config: &config::Config, pool: DbPool, hub: PubSubHub) -> Self {
        let identities: Arc<dyn IdentityStore> = Arc::new(SqliteIdentityStore::new(pool.clone()));
        let policy: Arc<dyn AssignmentPolicy> =
            Arc::new(RandomAssignment::new(config.assignment.routes.clone()));
        let tokens = if config.auth.token_secret.is_empty() {
            tracing::warn!("auth.token_secret is empty; live connection tokens use a random key");
            WsTokenSigner::ephemeral(config.auth.token_ttl_secs)
        } else {
            WsTokenSigner::new(
                config.auth.token_secret.as_bytes(),
                config.auth.token_ttl_secs,
            )
        };
        Self {
            service: TicketService::new(pool, identities, policy, hub),
            tokens,
            connection_buffer: config.hub.connection_buffer.max(1),
        }
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .layer(Extension(Arc::new(state)))
        .layer(TraceLayer::new_for_http())
}
