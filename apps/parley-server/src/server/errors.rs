use axum::{http::StatusCode, response::IntoResponse, Json};

use super::{
    metrics::{record_auth_failure, record_rate_limit_hit},
    types::ApiError,
};

/// Request-level failure taxonomy. `Forbidden` and `NotFound` are distinct
/// on every route; `Conflict` signals a lost optimistic-concurrency race and
/// is retryable after a re-read, `InvariantViolation` is not.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ApiFailure {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    InvariantViolation,
    RateLimited,
    PayloadTooLarge,
    Internal,
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ApiFailure {
    pub(crate) fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "invalid_credentials",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "version_conflict",
            Self::InvariantViolation => "invariant_violation",
            Self::RateLimited => "rate_limited",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::Unauthorized => record_auth_failure("unauthorized"),
            Self::Forbidden => record_auth_failure("forbidden"),
            Self::RateLimited => record_rate_limit_hit("http", "auth_failure"),
            Self::InvalidRequest
            | Self::NotFound
            | Self::Conflict
            | Self::InvariantViolation
            | Self::PayloadTooLarge
            | Self::Internal => {}
        }

        let status = match self {
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::InvariantViolation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = self.error_code();
        (status, Json(ApiError { error })).into_response()
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .with_span_list(true)
        .init();
}
