//! # Error Handling
//!
//! Problem+json error responses for the status API, carrying the request trace id.

use axum::{
    extract::rejection::QueryRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Trace id of the current request, or a short generated correlation id.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_request_id()
            .map(String::into_boxed_str)
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        validation_error(&rejection.body_text(), serde_json::Value::Null)
    }
}

/// 404 for an unknown resource.
pub fn not_found(message: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

/// 400 with optional field details.
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message);
    if field_errors.is_null() {
        error
    } else {
        error.with_details(field_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_error_basic() {
        let error = not_found("Provider 'pulumi-provider:x' is not configured");

        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.code, Box::from("NOT_FOUND"));
        assert!(error.details.is_none());
        assert!(error.trace_id.is_some());
    }

    #[test]
    fn test_validation_error_with_details() {
        let error = validation_error(
            "location_key must not be empty",
            json!({ "location_key": "empty" }),
        );
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.details, Some(Box::new(json!({ "location_key": "empty" }))));

        let bare = validation_error("bad", serde_json::Value::Null);
        assert!(bare.details.is_none());
    }

    #[test]
    fn test_content_type_header() {
        let response = not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn test_trace_id_comes_from_request_context() {
        let error = telemetry::with_request_context(
            telemetry::RequestContext {
                request_id: "req-42".to_string(),
            },
            async { not_found("missing") },
        )
        .await;
        assert_eq!(error.trace_id.as_deref(), Some("req-42"));
    }
}
