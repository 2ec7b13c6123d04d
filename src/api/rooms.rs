use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

/// Room routes
pub fn room_routes() -> Router<AppState> {
    Router::new().route("/", get(list_rooms))
}

/// Rooms listing returned to clients
#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<String>,
}

/// GET /api/v1/rooms - List rooms that currently have at least one member.
/// Diagnostic only; signaling never depends on this endpoint.
async fn list_rooms(State(state): State<AppState>) -> Result<Json<RoomListResponse>> {
    let mut rooms = state.registry.public_rooms();
    rooms.sort();

    Ok(Json(RoomListResponse { rooms }))
}
