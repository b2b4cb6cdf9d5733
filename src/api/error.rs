use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use super::models::ErrorResponse;
use crate::packager::PackageError;
use crate::queue::QueueError;
use crate::quota::QuotaError;
use crate::submission::SubmissionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("insufficient quota: {requested} requested, {available} available")]
    QuotaExceeded { requested: u32, available: u32 },
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("packaging failed: {0}")]
    PackagingFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PackagingFailed(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::PackagingFailed(_) => "PACKAGING_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<QuotaError> for ApiError {
    fn from(value: QuotaError) -> Self {
        ApiError::Internal(value.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(value: QueueError) -> Self {
        ApiError::Internal(value.to_string())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(value: SubmissionError) -> Self {
        match value {
            SubmissionError::TooManyEntries { .. }
            | SubmissionError::NoCandidates
            | SubmissionError::BatchBusy(_) => {
                ApiError::InvalidPayload(value.to_string())
            }
            SubmissionError::QuotaExceeded {
                requested,
                available,
            } => ApiError::QuotaExceeded {
                requested,
                available,
            },
            SubmissionError::BatchNotFound(id) => ApiError::NotFound(format!("batch {id}")),
            SubmissionError::JobNotFound(id) => ApiError::NotFound(format!("job {id}")),
            SubmissionError::ArchiveNotReady(id) => {
                ApiError::NotFound(format!("archive for batch {id}"))
            }
            SubmissionError::Package(PackageError::BatchNotFound(id)) => {
                ApiError::NotFound(format!("batch {id}"))
            }
            SubmissionError::Package(e) => ApiError::PackagingFailed(e.to_string()),
            SubmissionError::Ledger(_)
            | SubmissionError::Quota(_)
            | SubmissionError::Dispatch(_)
            | SubmissionError::Storage(_) => ApiError::Internal(value.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_errors_map_to_codes() {
        let quota: ApiError = SubmissionError::QuotaExceeded {
            requested: 5,
            available: 2,
        }
        .into();
        assert_eq!(quota.code(), "QUOTA_EXCEEDED");
        assert_eq!(quota.status_code(), StatusCode::PAYMENT_REQUIRED);

        let missing: ApiError = SubmissionError::BatchNotFound("b1".into()).into();
        assert_eq!(missing.code(), "NOT_FOUND");

        let packaging: ApiError =
            SubmissionError::Package(PackageError::NoProofs("b1".into())).into();
        assert_eq!(packaging.code(), "PACKAGING_FAILED");

        let empty: ApiError = SubmissionError::NoCandidates.into();
        assert_eq!(empty.status_code(), StatusCode::BAD_REQUEST);
    }
}
