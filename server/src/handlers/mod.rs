pub mod home;
pub mod mq;

// Common response types
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::errors::MqError;
use serde::Serialize;

pub const MSG_SUCCESS: i32 = 200;
pub const MSG_INTERNAL_ERROR: i32 = 10001;
pub const MSG_MISSING_PARAM: i32 = 10003;

/// Envelope every control response is wrapped in
///
/// Failures are reported through `msg_code`; the HTTP status is always 200.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub msg_code: i32,
    pub message: String,
    pub attachment: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn success(attachment: T) -> Self {
        Self {
            msg_code: MSG_SUCCESS,
            message: "Success".to_string(),
            attachment,
        }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

/// Error envelope with an empty attachment
#[derive(Debug)]
pub struct ErrorResponse {
    pub msg_code: i32,
    pub message: String,
}

impl ErrorResponse {
    pub fn internal(reason: impl std::fmt::Display) -> Self {
        Self {
            msg_code: MSG_INTERNAL_ERROR,
            message: format!("Internal server error. {}", reason),
        }
    }

    pub fn missing_param(param: &str) -> Self {
        Self {
            msg_code: MSG_MISSING_PARAM,
            message: format!("Missing param: {}", param),
        }
    }
}

impl From<MqError> for ErrorResponse {
    fn from(err: MqError) -> Self {
        tracing::warn!(error = %err, "Control operation failed");
        Self::internal(err)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        Envelope {
            msg_code: self.msg_code,
            message: self.message,
            attachment: serde_json::Value::Null,
        }
        .into_response()
    }
}

/// Body returned for unknown routes
#[derive(Debug, Serialize)]
struct NotFoundBody {
    code: u16,
    msg: &'static str,
    data: serde_json::Map<String, serde_json::Value>,
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundBody {
            code: 404,
            msg: "Page not found",
            data: serde_json::Map::new(),
        }),
    )
}
