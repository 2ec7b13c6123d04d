use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("2 people max. allowed per room.")]
    RoomFull,

    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("Malformed chat payload: {0}")]
    MalformedChatPayload(String),

    #[error("Negotiation timed out")]
    NegotiationTimedOut,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::WebRtcError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::RoomFull => (StatusCode::CONFLICT, self.to_string()),
            AppError::MediaAccessDenied(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::MalformedChatPayload(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NegotiationTimedOut => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<webrtc::Error> for AppError {
    fn from(err: webrtc::Error) -> Self {
        AppError::WebRtcError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
