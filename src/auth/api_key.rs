//! Dashboard API key middleware
//!
//! Dashboard routes are protected by a shared secret in the `X-API-Key`
//! header, compared against DASHBOARD_API_KEY.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Middleware that validates the `X-API-Key` header.
pub async fn require_api_key(
    State(expected): State<Arc<Option<String>>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiKeyError> {
    let Some(expected) = expected.as_deref() else {
        return Err(ApiKeyError::NotConfigured);
    };

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiKeyError::Missing)?;

    if provided != expected {
        return Err(ApiKeyError::Invalid);
    }

    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum ApiKeyError {
    Missing,
    Invalid,
    NotConfigured,
}

impl IntoResponse for ApiKeyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiKeyError::Missing => (StatusCode::UNAUTHORIZED, "Missing X-API-Key header"),
            ApiKeyError::Invalid => (StatusCode::UNAUTHORIZED, "Invalid API key"),
            ApiKeyError::NotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Dashboard not configured (DASHBOARD_API_KEY not set)",
            ),
        };

        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_responses_use_expected_status_codes() {
        assert_eq!(
            ApiKeyError::Missing.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiKeyError::Invalid.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiKeyError::NotConfigured.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
