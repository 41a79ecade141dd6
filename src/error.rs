//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::engine::UploadError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    MergeFailed,
    RangeNotSatisfiable(u64),
    Conflict(String),
    PayloadTooLarge,
    Rejected(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => error_body(StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => error_body(StatusCode::NOT_FOUND, msg),
            ApiError::Internal(detail) => {
                error!(error = detail, "request failed");
                error_body(StatusCode::INTERNAL_SERVER_ERROR, "Server error".into())
            }
            ApiError::MergeFailed => error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to merge chunks".into(),
            ),
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (StatusCode::RANGE_NOT_SATISFIABLE, headers, "range not satisfiable")
                    .into_response()
            }
            ApiError::Conflict(msg) => error_body(StatusCode::CONFLICT, msg),
            ApiError::PayloadTooLarge => {
                error_body(StatusCode::PAYLOAD_TOO_LARGE, "File too large".into())
            }
            ApiError::Rejected(msg) => error_body(StatusCode::UNPROCESSABLE_ENTITY, msg),
        }
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::NotFound => ApiError::NotFound("No file or chunks found".into()),
            UploadError::Incomplete { received, expected } => ApiError::BadRequest(format!(
                "Incomplete upload: {received}/{expected} chunks uploaded"
            )),
            UploadError::Merge(err) => {
                error!(error = %err, "failed to merge chunks");
                ApiError::MergeFailed
            }
            UploadError::ContentRejected(_) => {
                ApiError::Rejected("File rejected by content safety check".into())
            }
            UploadError::Busy => ApiError::Conflict("upload is busy, retry later".into()),
            UploadError::Body(err) => match err.downcast::<MultipartError>() {
                Ok(err) => ApiError::from(*err),
                Err(err) => ApiError::BadRequest(format!("invalid chunk body: {err}")),
            },
            UploadError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(error: MultipartError) -> Self {
        if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::PayloadTooLarge;
        }
        ApiError::BadRequest(format!("invalid form data: {}", error.body_text()))
    }
}
