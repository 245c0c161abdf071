//! Authenticator (C5): dual-mode credential validation (administrative
//! secret vs. scoped access token), constant-time admin compare, and
//! reverse-lookup of token→configuration.
//!
//! Grounded on the reference `auth_middleware_internal`'s credential
//! extraction order and outcome logging; the admin compare uses `subtle`
//! for a constant-time comparison the reference proxy never needed (it had
//! no admin-secret concept at all).

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderMap;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::error::{GatewayError, TokenStateReason};
use crate::model::AccessToken;
use crate::registry::{Registry, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Admin,
    Token,
}

pub struct AuthOutcome {
    pub method: AuthMethod,
    pub config_id: Option<String>,
    pub token: Option<AccessToken>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Constant-time string comparison that never early-exits on length, so the
/// secret's length is not observable via timing. Both inputs are padded to
/// a common fixed length before the byte-wise compare, and the length
/// equality is folded into the result with `&` rather than branched on.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let len = a.len().max(b.len()).max(1);
    let mut a_buf = vec![0u8; len];
    let mut b_buf = vec![0u8; len];
    a_buf[..a.len()].copy_from_slice(a.as_bytes());
    b_buf[..b.len()].copy_from_slice(b.as_bytes());
    let bytes_eq: bool = a_buf.ct_eq(&b_buf).into();
    bytes_eq & (a.len() == b.len())
}

fn extract_cleartext_token(headers: &HeaderMap, query: &str) -> Option<String> {
    if let Some(token) = header_str(headers, "x-proxy-token") {
        return Some(token.to_string());
    }
    if let Some(auth) = header_str(headers, "authorization") {
        if let Some(bearer) = auth.strip_prefix("Bearer ") {
            return Some(bearer.to_string());
        }
    }
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

/// Config-id extraction used by proxy endpoints: path prefix, query param,
/// header, or (left to the caller) the subdomain index.
pub fn extract_config_id_hint(request: &Request) -> Option<String> {
    let path = request.uri().path();
    if let Some(rest) = path.strip_prefix("/config/proxy/") {
        if let Some(id) = rest.split('/').next() {
            if !id.is_empty() && id != "export" && id != "import" && id != "batch" {
                return Some(id.to_string());
            }
        }
    }
    let query = request.uri().query().unwrap_or("");
    if let Some(id) = url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "config_id")
        .map(|(_, v)| v.into_owned())
    {
        return Some(id);
    }
    header_str(request.headers(), "x-config-id").map(str::to_string)
}

pub struct Authenticator {
    admin_secret: Option<String>,
}

impl Authenticator {
    pub fn new(admin_secret: Option<String>) -> Self {
        Self { admin_secret }
    }

    fn try_admin(&self, headers: &HeaderMap, query: &str) -> bool {
        let Some(secret) = &self.admin_secret else {
            return false;
        };
        if let Some(provided) = header_str(headers, "x-log-secret") {
            if constant_time_eq(provided, secret) {
                return true;
            }
        }
        if let Some(provided) = url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == "secret")
            .map(|(_, v)| v.into_owned())
        {
            if constant_time_eq(&provided, secret) {
                return true;
            }
        }
        false
    }

    /// Full dual-mode authentication used by the proxy surfaces (C6/C7).
    pub async fn authenticate_for_proxy(
        &self,
        request: &Request,
        registry: &Registry,
        hint_config_id: Option<String>,
    ) -> Result<AuthOutcome, GatewayError> {
        let start = Instant::now();
        let headers = request.headers();
        let query = request.uri().query().unwrap_or("");
        let path = request.uri().path().to_string();
        let client_ip = client_ip_from(headers);

        if self.try_admin(headers, query) {
            self.log_outcome(true, &client_ip, &path, None, start);
            return Ok(AuthOutcome {
                method: AuthMethod::Admin,
                config_id: hint_config_id,
                token: None,
            });
        }

        let Some(cleartext) = extract_cleartext_token(headers, query) else {
            self.log_outcome(false, &client_ip, &path, Some("UNAUTHORIZED"), start);
            return Err(GatewayError::Unauthenticated);
        };

        let config_id = match hint_config_id {
            Some(id) => id,
            None => registry.find_config_by_token(&cleartext).await.ok_or_else(|| {
                self.log_outcome(false, &client_ip, &path, Some("TOKEN_NOT_FOUND"), start);
                GatewayError::TokenState(TokenStateReason::TokenNotFound)
            })?,
        };

        match registry.validate_token(&config_id, &cleartext).await {
            ValidationResult::Valid(token) => {
                registry.update_token_usage(&config_id, &cleartext).await;
                self.log_outcome(true, &client_ip, &path, None, start);
                Ok(AuthOutcome {
                    method: AuthMethod::Token,
                    config_id: Some(config_id),
                    token: Some(token),
                })
            }
            ValidationResult::Invalid(reason) => {
                self.log_outcome(false, &client_ip, &path, Some(error_code_for(reason)), start);
                Err(GatewayError::TokenState(reason))
            }
        }
    }

    /// Admin-only authentication used by the management API (C11) and the
    /// WebSocket forwarding engine (C8, admin-only in this revision).
    pub fn authenticate_for_config(&self, request: &Request) -> Result<(), GatewayError> {
        self.authenticate_for_config_parts(
            request.headers(),
            request.uri().query().unwrap_or(""),
            request.uri().path(),
        )
    }

    /// Same as [`Self::authenticate_for_config`] but usable from handlers
    /// that take typed extractors (e.g. `Json<T>`) instead of the raw
    /// `Request`, which would otherwise have to be consumed twice.
    pub fn authenticate_for_config_parts(
        &self,
        headers: &HeaderMap,
        query: &str,
        path: &str,
    ) -> Result<(), GatewayError> {
        let start = Instant::now();
        let client_ip = client_ip_from(headers);

        if self.try_admin(headers, query) {
            self.log_outcome(true, &client_ip, path, None, start);
            Ok(())
        } else {
            self.log_outcome(false, &client_ip, path, Some("UNAUTHORIZED"), start);
            Err(GatewayError::Unauthenticated)
        }
    }

    fn log_outcome(
        &self,
        success: bool,
        client_ip: &str,
        path: &str,
        error_code: Option<&str>,
        start: Instant,
    ) {
        let duration_ms = start.elapsed().as_millis();
        if success {
            info!(client_ip, path, duration_ms, "authentication succeeded");
        } else {
            warn!(
                client_ip,
                path,
                duration_ms,
                error_code = error_code.unwrap_or("UNAUTHORIZED"),
                "authentication failed"
            );
        }
    }
}

fn error_code_for(reason: TokenStateReason) -> &'static str {
    match reason {
        TokenStateReason::ConfigNotFound => "CONFIG_NOT_FOUND",
        TokenStateReason::TokenNotFound => "TOKEN_NOT_FOUND",
        TokenStateReason::TokenDisabled => "TOKEN_DISABLED",
        TokenStateReason::TokenExpired => "TOKEN_EXPIRED",
    }
}

/// Client-IP resolution per spec §6.3: X-Forwarded-For, then X-Real-IP.
/// The transport remote address is layered in by the caller when neither
/// header is present (see `server.rs`'s `ConnectInfo` injection).
pub fn client_ip_from(headers: &HeaderMap) -> String {
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.trim().to_string();
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "wrong!"));
        assert!(!constant_time_eq("short", "longerstring"));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip_from(&headers), "1.2.3.4");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip_from(&headers), "9.9.9.9");
    }
}
