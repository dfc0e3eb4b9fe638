use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;
use td_verifier::attestation::{AttnError, MultiError};
use td_verifier::challenge::ChallengeError;
use thiserror::Error;
use tracing::error;

use crate::storage::StorageError;

/// Message every failed unauthenticated request gets.
pub const GENERIC_ERROR: &str = "invalid request";

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed or incomplete request; the message is safe to show.
    #[error("{0}")]
    InvalidRequest(String),
    #[error("domain is not configured: {0}")]
    NotFound(String),
    #[error("missing or invalid admin token")]
    Unauthorized,
    #[error("admin api is disabled")]
    AdminDisabled,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request did not finish within {0:?}")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Challenge(#[from] ChallengeError),
    #[error(transparent)]
    Attestation(#[from] AttnError),
    #[error("failed to login trusted domain: {0}")]
    Verification(MultiError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidRequest(_)
            | AuthError::Challenge(_)
            | AuthError::Attestation(_)
            | AuthError::Verification(_) => StatusCode::BAD_REQUEST,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::AdminDisabled => StatusCode::FORBIDDEN,
            AuthError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            AuthError::Storage(_) | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Detail is kept in the logs; the caller learns nothing beyond failure.
    pub fn opaque(self) -> Self {
        error!(error = %self, "request failed");
        AuthError::InvalidRequest(GENERIC_ERROR.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // storage internals are not for clients
            AuthError::Storage(_) | AuthError::Internal(_) => {
                error!(error = %self, "internal failure");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "errors": [message] }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(err: AuthError) -> (StatusCode, serde_json::Value) {
        let res = err.into_response();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn opaque_hides_detail() {
        let err = AuthError::Challenge(ChallengeError::TotpReplay).opaque();
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "errors": ["invalid request"] }));
    }

    #[tokio::test]
    async fn running_out_of_time_looks_like_any_other_failure() {
        let err = AuthError::DeadlineExceeded(Duration::from_millis(14_500));
        assert_eq!(err.to_string(), "request did not finish within 14.5s");
        let (status, body) = body_of(err.opaque()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "errors": ["invalid request"] }));
    }

    #[tokio::test]
    async fn storage_failures_are_masked() {
        let err = AuthError::Storage(StorageError::Io("disk on fire".into()));
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "errors": ["internal error"] }));
    }

    #[tokio::test]
    async fn not_found_names_the_domain() {
        let (status, body) = body_of(AuthError::NotFound("tdx/alice".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errors"][0], "domain is not configured: tdx/alice");
    }
}
