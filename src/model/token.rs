use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Authorization scope carried on a token. Stored and serialized, but not
/// enforced by the authenticator in this revision — see DESIGN.md's Open
/// Question resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

fn default_permissions() -> HashSet<Permission> {
    let mut set = HashSet::new();
    set.insert(Permission::Read);
    set
}

/// A scoped credential within a `ProxyConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Hex-encoded SHA-256 of the cleartext token. The cleartext itself is
    /// never persisted; this field is cleared on every response surface
    /// except token-creation (see `ProxyConfig::sanitized`).
    pub token_hash: String,
    #[serde(default = "default_permissions")]
    pub permissions: HashSet<Permission>,
    pub enabled: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl AccessToken {
    pub fn new(name: String, token_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            name,
            description: None,
            token_hash,
            permissions: default_permissions(),
            enabled: true,
            expires_at: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
            usage_count: 0,
            created_by: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    pub fn sanitized(&self) -> SanitizedToken {
        SanitizedToken {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            permissions: self.permissions.clone(),
            enabled: self.enabled,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
        }
    }
}

/// The shape emitted by every response surface other than token-creation:
/// identical to `AccessToken` but with the cleartext-adjacent `token_hash`
/// field dropped entirely rather than merely blanked.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedToken {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub permissions: HashSet<Permission>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

/// Mutable fields of a token, as accepted by `UpdateToken`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
    pub permissions: Option<HashSet<Permission>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_expired() {
        let token = AccessToken::new("k".into(), "h".into());
        assert!(!token.is_expired(Utc::now()));
    }

    #[test]
    fn past_expiry_is_expired() {
        let mut token = AccessToken::new("k".into(), "h".into());
        token.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert!(token.is_expired(Utc::now()));
    }
}
