//! HTTP error responses.

use crate::models::RouterError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Error returned from an HTTP handler.
#[derive(Debug)]
pub enum ApiError {
    /// 400 `{error}`
    BadRequest(String),
    /// 500 `{error, details}`
    Chat(RouterError),
    /// 500 `{status: "error", error}`
    Status(String),
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Validation(message) => Self::BadRequest(message),
            other => Self::Chat(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            Self::Chat(e) => {
                // the skip trail stays in the log; clients get a generic message
                error!(error = %e, "Chat request failed");
                let message = match &e {
                    RouterError::AllProvidersUnavailable { .. } => {
                        "All AI services are currently unavailable. Please try again later."
                    }
                    _ => "Internal server error",
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": message, "details": e.kind() })),
                )
                    .into_response()
            }
            Self::Status(message) => {
                error!(error = %message, "Status request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "status": "error", "error": message })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SkipReason, SkippedProvider};

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_maps_to_bad_request() {
        let response = ApiError::from(RouterError::Validation("too many".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "too many"}));
    }

    #[tokio::test]
    async fn test_exhaustion_hides_skip_trail() {
        let err = RouterError::AllProvidersUnavailable {
            skipped: vec![SkippedProvider::new("groq", SkipReason::RequestFailed)],
        };
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["details"], "AllProvidersUnavailable");
        assert!(!body["error"].as_str().unwrap().contains("groq"));
    }
}
