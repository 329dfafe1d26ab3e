//! Error types shared by the library and the HTTP layer.
//!
//! `AlimError` is what the session store, retrieval, generation and voice
//! code return. `ApiError` is its HTTP face: a status code plus the
//! `{"detail": "..."}` body the frontend already understands.

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AlimError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("message must not be empty")]
    EmptyMessage,

    #[error("{0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("{0} is not available")]
    Unavailable(String),
}

pub type Result<T, E = AlimError> = std::result::Result<T, E>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::BadGateway(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self.detail());
        }
        let body = ErrorBody {
            detail: self.detail().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AlimError> for ApiError {
    fn from(err: AlimError) -> Self {
        match err {
            AlimError::InvalidSessionId(_)
            | AlimError::EmptyMessage
            | AlimError::InvalidInput(_) => {
                ApiError::BadRequest(err.to_string())
            }
            AlimError::Http(_) | AlimError::Upstream { .. } => ApiError::BadGateway(err.to_string()),
            AlimError::Unavailable(_) => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// Extractor failures keep the `{"detail"}` body.

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_input_maps_to_400() {
        let err: ApiError = AlimError::InvalidSessionId("../etc".to_string()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = AlimError::EmptyMessage.into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_upstream_maps_to_502() {
        let err: ApiError = AlimError::Upstream {
            status: 429,
            body: "rate limited".to_string(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(err.detail().contains("429"));
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        let err: ApiError = AlimError::Unavailable("voice".to_string()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.detail(), "voice is not available");
    }

    #[test]
    fn test_storage_failure_maps_to_500() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: ApiError = AlimError::Io(io).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
