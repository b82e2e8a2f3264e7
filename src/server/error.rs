//! HTTP error responses
//!
//! Every failure is answered with `{"detail": "<message>"}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::admission::AdmissionRejected;
use crate::error::Error;
use crate::prompt::ImageError;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: &self.detail })).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::EngineNotReady => StatusCode::SERVICE_UNAVAILABLE,
            Error::Format(_) | Error::UnknownModel { .. } => StatusCode::BAD_REQUEST,
            Error::GpuResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            Error::Load(_) | Error::LoadAttempted | Error::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!("request failed: {err}");
        }
        let detail = match err {
            Error::EngineNotReady => "Model is still loading. Please wait.".to_string(),
            other => other.to_string(),
        };
        Self::new(status, detail)
    }
}

impl From<AdmissionRejected> for ApiError {
    fn from(rejection: AdmissionRejected) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, rejection.to_string())
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        Self::bad_request(format!("Invalid image or image too large: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(Error::EngineNotReady).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(Error::GpuResourceExhausted("cuda".into())).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            ApiError::from(AdmissionRejected::RateLimited).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(ImageError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_loading_detail() {
        let err = ApiError::from(Error::EngineNotReady);
        assert_eq!(err.detail(), "Model is still loading. Please wait.");
    }
}
