use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use hearth_db::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    NotImplemented,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Request-scoped failure: where it happened, a stable message id for
/// clients, and a free-form detail for logs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{location}: {id} {detail}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub location: &'static str,
    pub id: &'static str,
    pub detail: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            id,
            detail: detail.into(),
        }
    }

    pub fn bad_request(location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, location, id, detail)
    }

    pub fn unauthorized(location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, location, id, detail)
    }

    pub fn forbidden(location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, location, id, detail)
    }

    pub fn not_found(location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, location, id, detail)
    }

    pub fn not_implemented(location: &'static str, id: &'static str) -> Self {
        Self::new(ErrorKind::NotImplemented, location, id, "")
    }

    pub fn internal(location: &'static str, id: &'static str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, location, id, detail)
    }

    /// Lift a store failure: not-found stays not-found, everything else is internal.
    pub fn from_store(location: &'static str, id: &'static str, err: StoreError) -> Self {
        let kind = match err {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::InvalidInput { .. } | StoreError::Other(_) => ErrorKind::Internal,
        };
        Self::new(kind, location, id, err.to_string())
    }

    /// Re-home this error under a new location and id, keeping the cause in the detail.
    pub fn wrap(self, kind: ErrorKind, location: &'static str, id: &'static str) -> Self {
        let detail = format!("{}: {}", self.id, self.detail);
        Self::new(kind, location, id, detail)
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status()
    }

    fn message(&self) -> &'static str {
        match self.kind {
            ErrorKind::BadRequest => "Invalid or missing parameters in the request.",
            ErrorKind::Unauthorized => "Invalid or expired session, please login again.",
            ErrorKind::Forbidden => "You do not have the appropriate permissions.",
            ErrorKind::NotFound => "Unable to find the requested resource.",
            ErrorKind::NotImplemented => "This feature is disabled.",
            ErrorKind::Internal => "An internal error occurred.",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "id": self.id,
            "message": self.message(),
            "detailed_error": self.detail,
            "status_code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
