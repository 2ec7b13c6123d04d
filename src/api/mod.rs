pub mod health;
pub mod rooms;

use axum::Router;

use crate::state::AppState;

/// Diagnostic HTTP surface: room listing under `/api/v1` plus the health
/// probe. Signaling itself runs over the WebSocket route, not here.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/rooms", rooms::room_routes())
        .merge(health::health_routes())
        .with_state(state)
}
