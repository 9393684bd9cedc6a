use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Errors surfaced to HTTP clients before a WebSocket upgrade.
///
/// Each variant maps to a status code, a machine-readable code string and a
/// message. Messages never echo request data back.
#[derive(Debug)]
pub enum ApiError {
    /// 403 - `Origin` header missing or outside the allowed set.
    OriginNotAllowed,
    /// 404 - No such route.
    NotFound,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::NotFound => "not_found",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ApiError::OriginNotAllowed => "Origin not allowed.",
            ApiError::NotFound => "Not found.",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
