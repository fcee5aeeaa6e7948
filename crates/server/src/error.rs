//! Protocol error taxonomy.
//!
//! Every handler returns `OAuthError` and lets the `IntoResponse` impl render
//! the RFC 6749 error JSON. The variants deliberately collapse distinct
//! internal failures into one client-visible code (`invalid_grant` covers
//! expired, consumed and mismatched grants alike) so the response never works
//! as a timing or state oracle; the distinctions live in tracing events at
//! the site that detected them.

use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("client authentication failed")]
    InvalidClient,
    #[error("grant is invalid, expired or already used")]
    InvalidGrant,
    #[error("unsupported grant_type")]
    UnsupportedGrantType,
    #[error("requested scope is not allowed for this client")]
    InvalidScope,
    #[error("missing or invalid access token")]
    Unauthorized,
    #[error("token does not carry the required scope")]
    InsufficientScope,
    #[error("too many requests, try again later")]
    RateLimited,
    #[error("state store unavailable")]
    StoreUnavailable(#[source] StoreError),
    #[error("internal error")]
    Internal(String),
}

impl OAuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::Unauthorized => "invalid_token",
            Self::InsufficientScope => "insufficient_scope",
            Self::RateLimited => "rate_limited",
            Self::StoreUnavailable(_) => "temporarily_unavailable",
            Self::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant
            | Self::UnsupportedGrantType
            | Self::InvalidScope => StatusCode::BAD_REQUEST,
            Self::InvalidClient | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InsufficientScope => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// RFC 6749 error body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        // Internal details never reach the client.
        let description = match &self {
            OAuthError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error while handling request");
                None
            }
            OAuthError::StoreUnavailable(source) => {
                tracing::error!(error = %source, "state store unavailable, failing closed");
                None
            }
            other => Some(other.to_string()),
        };

        (
            self.status(),
            Json(ErrorResponse {
                error: self.error_code().to_string(),
                error_description: description,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        OAuthError::StoreUnavailable(err)
    }
}

impl From<sea_orm::DbErr> for OAuthError {
    fn from(err: sea_orm::DbErr) -> Self {
        OAuthError::Internal(err.to_string())
    }
}
