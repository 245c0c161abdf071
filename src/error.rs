//! Error taxonomy (spec §7) and the JSON response envelope (spec §6.5/§10.4).
//!
//! `thiserror` is declared by the reference proxy this crate grew out of but
//! was never actually used there; here it carries the real error surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("{0}")]
    TokenState(TokenStateReason),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Capacity(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Upstream(String),
    #[error("upstream deadline exceeded")]
    UpstreamTimeout,
    #[error("not found")]
    NotFound,
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, thiserror::Error, Clone, Copy)]
pub enum TokenStateReason {
    #[error("config not found")]
    ConfigNotFound,
    #[error("token not found")]
    TokenNotFound,
    #[error("token disabled")]
    TokenDisabled,
    #[error("token expired")]
    TokenExpired,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::TokenState(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Capacity(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Unauthenticated => "UNAUTHORIZED",
            Self::TokenState(TokenStateReason::ConfigNotFound) => "CONFIG_NOT_FOUND",
            Self::TokenState(TokenStateReason::TokenNotFound) => "TOKEN_NOT_FOUND",
            Self::TokenState(TokenStateReason::TokenDisabled) => "TOKEN_DISABLED",
            Self::TokenState(TokenStateReason::TokenExpired) => "TOKEN_EXPIRED",
            Self::Conflict(_) => "CONFLICT",
            Self::Capacity(reason) => match reason.as_str() {
                "MAX_CONFIGS_EXCEEDED" => "MAX_CONFIGS_EXCEEDED",
                "MAX_TOKENS_EXCEEDED" => "MAX_TOKENS_EXCEEDED",
                _ => "CAPACITY_EXCEEDED",
            },
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Upstream(_) => "UPSTREAM_ERROR",
            Self::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            Self::NotFound => "NOT_FOUND",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::warn!(error_code = self.error_code(), "{self}");
        }
        ApiResponse::<()>::err(self).into_response()
    }
}

/// `{success, data?, error?, error_code?, status}` envelope shared by every
/// `/config/proxy*` JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub status: u16,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T, status: StatusCode) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
                error_code: None,
                status: status.as_u16(),
            }),
        )
    }

    pub fn err(error: GatewayError) -> (StatusCode, Json<Self>) {
        let status = error.status();
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(error.to_string()),
                error_code: Some(error.error_code().to_string()),
                status: status.as_u16(),
            }),
        )
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), (StatusCode, Json<ApiResponse<()>>)>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(GatewayError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(GatewayError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::TokenState(TokenStateReason::TokenExpired).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(GatewayError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(GatewayError::Upstream("x".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::NotImplemented("x".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(GatewayError::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_codes_are_specific() {
        assert_eq!(
            GatewayError::TokenState(TokenStateReason::TokenDisabled).error_code(),
            "TOKEN_DISABLED"
        );
        assert_eq!(
            GatewayError::TokenState(TokenStateReason::TokenExpired).error_code(),
            "TOKEN_EXPIRED"
        );
        assert_eq!(
            GatewayError::Capacity("MAX_CONFIGS_EXCEEDED".to_string()).error_code(),
            "MAX_CONFIGS_EXCEEDED"
        );
        assert_eq!(
            GatewayError::Capacity("MAX_TOKENS_EXCEEDED".to_string()).error_code(),
            "MAX_TOKENS_EXCEEDED"
        );
    }
}
