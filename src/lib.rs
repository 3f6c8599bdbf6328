//! Messaging Core Library
//!
//! Real-time conversation and messaging engine: conversation directory,
//! append-only message log with a delivery state machine, presence and
//! typing tracking, channel fan-out with offline queues, and a
//! multi-strategy transport gateway.

pub mod config;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod messages;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod presence;
pub mod registry;
pub mod store;

use axum::{
    routing::{get, post},
    Router,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{AppState, CoreConfig};
use handlers::{
    add_participant,
    create_conversation,
    get_conversation,
    get_presence,
    health_check,
    list_conversations,
    list_messages,
    mark_conversation_read,
    mark_messages_read,
    // Connection strategies
    poll,
    remove_participant,
    send_envelope,
    // Messages
    send_message,
    send_typing,
    stream_connect,
    // Channels
    subscribe,
    unsubscribe,
    ws_connect,
};

/// Build the full router over an already-wired state. Exposed so tests
/// and embedding applications can mount the surface themselves.
pub fn app(state: AppState) -> Router {
    Router::new()
        // Connection strategies, in priority order
        .route("/ws", get(ws_connect))
        .route("/stream", get(stream_connect))
        .route("/poll", get(poll))
        .route("/send", post(send_envelope))
        // Channel subscriptions
        .route("/subscribe", post(subscribe))
        .route("/unsubscribe", post(unsubscribe))
        // Conversation directory
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/{id}", get(get_conversation))
        .route(
            "/conversations/{id}/participants",
            post(add_participant),
        )
        .route(
            "/conversations/{id}/participants/{identity}",
            axum::routing::delete(remove_participant),
        )
        .route("/conversations/{id}/read", post(mark_conversation_read))
        // Messages
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/conversations/{id}/messages/read",
            post(mark_messages_read),
        )
        .route("/conversations/{id}/typing", post(send_typing))
        .route("/conversations/{id}/presence", get(get_presence))
        // Health check
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Already set, ignore
    }

    info!("=== Messaging Core ===");

    let base_dir = std::env::var("MESSAGING_ROOT").unwrap_or_else(|_| "messaging_data".to_string());
    let config = CoreConfig::with_base_dir(&base_dir);
    info!("Storage directory: {:?}", config.storage_dir);

    let state = AppState::build(config.clone()).await?;
    info!("Directory, message store, presence, registry, orchestrator wired");

    let app = app(state);

    let addr = config.bind_addr;
    info!("Messaging core listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
