//! Error envelope: `{error, message, statusCode, requestId}`.
//!
//! Handlers return [`ApiError`]; the request-id middleware fills in the
//! `requestId` field on the way out so handlers never thread it around.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use meterline_shared::error::ServiceError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    pub status_code: u16,
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<meterline_store::StoreError> for ApiError {
    fn from(err: meterline_store::StoreError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(message = %self.0.message, "request failed");
        }
        let body = ErrorBody {
            error: self.0.kind.as_str(),
            message: self.0.message,
            status_code: status.as_u16(),
            request_id: None,
        };
        (status, Json(body)).into_response()
    }
}
