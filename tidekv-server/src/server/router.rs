use super::handlers::{self, AppState};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // REST conveniences
        .route("/info", get(handlers::info))
        .route("/oplog/{seq}", get(handlers::get_oplog))
        // StreamableHTTP command endpoint
        .route("/api/v1/command", post(handlers::command_handler))
        // Slave sessions
        .route("/replication/ws", get(handlers::replication_websocket))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
