//! Outer surfaces: HTTP routes and the live websocket endpoint.

pub mod http;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bus::Broadcaster;
use crate::config::Config;
use crate::lifecycle::SessionManager;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub relay: Relay,
    pub registry: ConnectionRegistry,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the components together and start the fan-out task.
    pub fn new(store: Store, config: &Config, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let registry = ConnectionRegistry::new();
        let (broadcaster, fan_out) = Broadcaster::spawn(
            registry.clone(),
            config.broadcast_queue_capacity,
            shutdown.clone(),
        );

        let state = Self {
            sessions: SessionManager::new(
                store.clone(),
                broadcaster.clone(),
                config.duplicate_policy,
            ),
            relay: Relay::new(store, broadcaster, config.store_retry_attempts),
            registry,
            shutdown,
        };

        (state, fan_out)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chats", post(http::create_chat))
        .route("/api/chats/pending", get(http::list_pending))
        .route("/api/chats/mine", get(http::list_mine))
        .route("/api/chats/reply", post(http::reply))
        .route("/api/chats/:id", get(http::get_chat))
        .route("/api/chats/:id/messages", get(http::get_messages))
        .route("/api/chats/:id/claim", post(http::claim_chat))
        .route("/api/chats/:id/close", post(http::close_chat))
        .route("/api/chats/:id/seen", post(http::mark_seen))
        .route("/api/chats/:id/notification", get(http::get_notification))
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
pub(crate) async fn test_state(policy: crate::lifecycle::DuplicatePolicy) -> AppState {
    let store = Store::in_memory().await.expect("in-memory store");
    let config = Config {
        bind_address: "127.0.0.1:0".into(),
        database_path: ":memory:".into(),
        broadcast_queue_capacity: 16,
        store_retry_attempts: 1,
        duplicate_policy: policy,
    };
    let (state, _fan_out) = AppState::new(store, &config, CancellationToken::new());
    state
}
