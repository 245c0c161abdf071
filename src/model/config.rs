use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::token::AccessToken;

/// Subdomains that may never be claimed by a configuration because they are
/// reserved for the gateway itself or for common infrastructure conventions.
pub const RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "admin", "mail", "ftp", "localhost"];

pub const MAX_TOKENS_PER_CONFIG: usize = 50;
pub const MAX_CONFIGS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
}

impl ProxyProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }
}

/// A named upstream target, optionally exposed under a subdomain, parent of
/// zero or more access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub id: String,
    pub name: String,
    pub subdomain: Option<String>,
    pub target_url: String,
    pub protocol: ProxyProtocol,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub access_tokens: Vec<AccessToken>,
}

impl ProxyConfig {
    pub fn new_validated(
        name: String,
        subdomain: Option<String>,
        target_url: String,
        protocol: ProxyProtocol,
        enabled: bool,
    ) -> Result<Self, String> {
        validate_name(&name)?;
        if let Some(sub) = &subdomain {
            validate_subdomain(sub)?;
        }
        validate_target_url(&target_url)?;
        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name,
            subdomain,
            target_url,
            protocol,
            enabled,
            created_at: now,
            updated_at: now,
            access_tokens: Vec::new(),
        })
    }

    pub fn stats(&self) -> ProxyConfigStats {
        let total_usage: u64 = self.access_tokens.iter().map(|t| t.usage_count).sum();
        let active_tokens = self.access_tokens.iter().filter(|t| t.enabled).count();
        ProxyConfigStats {
            token_count: self.access_tokens.len(),
            active_token_count: active_tokens,
            total_usage_count: total_usage,
        }
    }

    /// Returns a copy with every token's `token_hash` cleared, suitable for
    /// any response surface other than token-creation.
    pub fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        for token in &mut copy.access_tokens {
            token.token_hash.clear();
        }
        copy
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyConfigStats {
    pub token_count: usize,
    pub active_token_count: usize,
    pub total_usage_count: u64,
}

pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.chars().count() > 100 {
        return Err("name must be non-empty and at most 100 characters".to_string());
    }
    Ok(())
}

pub fn validate_subdomain(subdomain: &str) -> Result<(), String> {
    static PATTERN: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap()
    });
    if !PATTERN.is_match(subdomain) {
        return Err(format!("invalid subdomain: {subdomain}"));
    }
    if RESERVED_SUBDOMAINS.contains(&subdomain) {
        return Err(format!("subdomain {subdomain} is reserved"));
    }
    Ok(())
}

pub fn validate_target_url(target_url: &str) -> Result<(), String> {
    let parsed = url::Url::parse(target_url).map_err(|e| format!("invalid target_url: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported target_url scheme: {other}")),
    }
    if parsed.host_str().unwrap_or_default().is_empty() {
        return Err("target_url must have a non-empty host".to_string());
    }
    Ok(())
}

/// Filter applied to `List`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFilter {
    pub search: Option<String>,
    pub enabled: Option<bool>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

impl ConfigFilter {
    pub fn normalized(&self) -> (usize, usize) {
        let page = self.page.max(1);
        let limit = self.limit.clamp(1, 100);
        (page, limit)
    }

    pub fn matches(&self, config: &ProxyConfig) -> bool {
        if let Some(enabled) = self.enabled {
            if config.enabled != enabled {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if search.is_empty() {
                return true;
            }
            let needle = search.to_ascii_lowercase();
            let haystack = format!(
                "{} {} {}",
                config.name,
                config.subdomain.as_deref().unwrap_or(""),
                config.target_url
            )
            .to_ascii_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_subdomain() {
        assert!(validate_subdomain("www").is_err());
        assert!(validate_subdomain("admin").is_err());
    }

    #[test]
    fn rejects_malformed_subdomain() {
        assert!(validate_subdomain("-bad").is_err());
        assert!(validate_subdomain("Bad").is_err());
        assert!(validate_subdomain("a..b").is_err());
    }

    #[test]
    fn accepts_well_formed_subdomain() {
        assert!(validate_subdomain("api-v2").is_ok());
        assert!(validate_subdomain("a").is_ok());
    }

    #[test]
    fn rejects_non_http_target() {
        assert!(validate_target_url("ftp://example.com").is_err());
        assert!(validate_target_url("not a url").is_err());
    }

    #[test]
    fn sanitized_clears_hash() {
        let mut config =
            ProxyConfig::new_validated("t".into(), None, "https://x.test".into(), ProxyProtocol::Https, true)
                .unwrap();
        config.access_tokens.push(AccessToken::new("k".into(), "hash".into()));
        let sanitized = config.sanitized();
        assert!(sanitized.access_tokens[0].token_hash.is_empty());
    }
}
