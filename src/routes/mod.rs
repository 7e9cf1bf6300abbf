//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The chat service sits next to the main BrewBuddies application. It
//! exposes the group chat socket under the same path the browser already
//! uses (`/ws/group/{group_id}/`), plus the small HTTP surface that socket
//! needs: ticket minting, live participants, and a health probe.

pub mod auth;
pub mod groups;
pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::broker::BrokerStats;
use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/group/{group_id}/", get(ws::handle_group_ws))
        .route("/ws/group/{group_id}", get(ws::handle_group_ws))
        .route("/api/auth/ws-ticket", post(auth::ws_ticket))
        .route("/api/groups/{group_id}/chat/participants", get(groups::chat_participants))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /healthz`: liveness plus current registry size.
async fn healthz(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats().await)
}
