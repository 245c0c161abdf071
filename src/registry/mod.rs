//! Configuration registry (C3) and embedded token store (C4): a single
//! `tokio::sync::RwLock` guarding a keyed map of `ProxyConfig`, a secondary
//! subdomain index, and a reverse token-hash index, with debounced
//! background persistence.
//!
//! Grounded on the reference `TokenManager`'s concurrent-state shape and its
//! `start_auto_cleanup` background-task idiom, collapsed into the single
//! lock the specification requires over the whole registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, TokenStateReason};
use crate::model::{
    AccessToken, ConfigFilter, ProxyConfig, ProxyProtocol, TokenPatch, MAX_CONFIGS,
    MAX_TOKENS_PER_CONFIG,
};

pub fn hash_token(cleartext: &str) -> String {
    let digest = Sha256::digest(cleartext.as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Skip,
    Replace,
    Error,
}

pub enum ValidationResult {
    Valid(AccessToken),
    Invalid(TokenStateReason),
}

#[derive(Default)]
struct RegistryState {
    configs: HashMap<String, ProxyConfig>,
    subdomain_index: HashMap<String, String>,
    token_index: HashMap<String, (String, String)>,
}

impl RegistryState {
    fn reindex(&mut self) {
        self.subdomain_index.clear();
        self.token_index.clear();
        for config in self.configs.values() {
            if let Some(sub) = &config.subdomain {
                self.subdomain_index.insert(sub.clone(), config.id.clone());
            }
            for token in &config.access_tokens {
                self.token_index
                    .insert(token.token_hash.clone(), (config.id.clone(), token.id.clone()));
            }
        }
    }
}

pub struct Registry {
    state: RwLock<RegistryState>,
    persist_path: Option<PathBuf>,
    debounce: Duration,
    dirty: AtomicBool,
    last_change: Mutex<Instant>,
    cancel: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Registry {
    /// Loads an existing snapshot from `path` if persistence is enabled.
    /// A missing or corrupt file results in an empty registry with a
    /// warning; it does not block startup.
    pub async fn load(path: Option<PathBuf>, debounce: Duration) -> Arc<Self> {
        let mut state = RegistryState::default();
        if let Some(path) = &path {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => match serde_json::from_str::<Vec<ProxyConfig>>(&content) {
                    Ok(configs) => {
                        for config in configs {
                            state.configs.insert(config.id.clone(), config);
                        }
                        state.reindex();
                        info!("loaded {} proxy configs from {}", state.configs.len(), path.display());
                    }
                    Err(e) => {
                        warn!("failed to parse proxy config file {}: {e}, starting empty", path.display());
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("no existing proxy config file at {}, starting empty", path.display());
                }
                Err(e) => {
                    warn!("failed to read proxy config file {}: {e}, starting empty", path.display());
                }
            }
        }

        Arc::new(Self {
            state: RwLock::new(state),
            persist_path: path,
            debounce,
            dirty: AtomicBool::new(false),
            last_change: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawns the debounced auto-save background task.
    pub async fn start_persistence(self: &Arc<Self>) {
        if self.persist_path.is_none() {
            return;
        }
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.maybe_flush().await;
                    }
                    _ = registry.cancel.cancelled() => {
                        registry.flush_now().await;
                        break;
                    }
                }
            }
        });
        *self.task.lock().await = Some(handle);
    }

    async fn maybe_flush(&self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }
        let elapsed = self.last_change.lock().await.elapsed();
        if elapsed >= self.debounce {
            self.flush_now().await;
        }
    }

    async fn flush_now(&self) {
        let Some(path) = &self.persist_path else { return };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let snapshot: Vec<ProxyConfig> = {
            let state = self.state.read().await;
            state.configs.values().cloned().collect()
        };
        match serde_json::to_string_pretty(&snapshot) {
            Ok(content) => {
                let tmp = path.with_extension("tmp");
                if let Err(e) = tokio::fs::write(&tmp, &content).await {
                    error!("failed to write proxy config snapshot: {e}");
                    return;
                }
                if let Err(e) = tokio::fs::rename(&tmp, path).await {
                    error!("failed to persist proxy config snapshot: {e}");
                }
            }
            Err(e) => error!("failed to serialize proxy config snapshot: {e}"),
        }
    }

    async fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        *self.last_change.lock().await = Instant::now();
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    // ---- C3: configuration CRUD ----

    pub async fn add(&self, mut config: ProxyConfig) -> Result<ProxyConfig, GatewayError> {
        let mut state = self.state.write().await;
        if state.configs.len() >= MAX_CONFIGS {
            return Err(GatewayError::Capacity("MAX_CONFIGS_EXCEEDED".to_string()));
        }
        if let Some(sub) = &config.subdomain {
            if state.subdomain_index.contains_key(sub) {
                return Err(GatewayError::Conflict("duplicate_subdomain".to_string()));
            }
        }
        config.id = uuid::Uuid::new_v4().simple().to_string();
        let now = chrono::Utc::now();
        config.created_at = now;
        config.updated_at = now;
        if let Some(sub) = &config.subdomain {
            state.subdomain_index.insert(sub.clone(), config.id.clone());
        }
        state.configs.insert(config.id.clone(), config.clone());
        drop(state);
        self.mark_dirty().await;
        Ok(config)
    }

    pub async fn update(&self, id: &str, mut replacement: ProxyConfig) -> Result<ProxyConfig, GatewayError> {
        let mut state = self.state.write().await;
        let existing = state
            .configs
            .get(id)
            .ok_or(GatewayError::NotFound)?
            .clone();

        if replacement.subdomain != existing.subdomain {
            if let Some(sub) = &replacement.subdomain {
                if state.subdomain_index.contains_key(sub) {
                    return Err(GatewayError::Conflict("duplicate_subdomain".to_string()));
                }
            }
        }

        replacement.id = existing.id.clone();
        replacement.created_at = existing.created_at;
        replacement.updated_at = chrono::Utc::now();
        replacement.access_tokens = existing.access_tokens.clone();

        if let Some(old_sub) = &existing.subdomain {
            state.subdomain_index.remove(old_sub);
        }
        if let Some(new_sub) = &replacement.subdomain {
            state.subdomain_index.insert(new_sub.clone(), id.to_string());
        }
        state.configs.insert(id.to_string(), replacement.clone());
        drop(state);
        self.mark_dirty().await;
        Ok(replacement)
    }

    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        let config = state.configs.remove(id).ok_or(GatewayError::NotFound)?;
        if let Some(sub) = &config.subdomain {
            state.subdomain_index.remove(sub);
        }
        for token in &config.access_tokens {
            state.token_index.remove(&token.token_hash);
        }
        drop(state);
        self.mark_dirty().await;
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ProxyConfig> {
        self.state.read().await.configs.get(id).cloned()
    }

    pub async fn get_by_subdomain(&self, subdomain: &str) -> Option<ProxyConfig> {
        let state = self.state.read().await;
        let id = state.subdomain_index.get(subdomain)?;
        let config = state.configs.get(id)?;
        if config.enabled {
            Some(config.clone())
        } else {
            None
        }
    }

    pub async fn list(&self, filter: &ConfigFilter) -> (Vec<ProxyConfig>, usize) {
        let state = self.state.read().await;
        let mut matching: Vec<ProxyConfig> = state
            .configs
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len();
        let (page, limit) = filter.normalized();
        let start = (page - 1) * limit;
        let page_items = matching.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    pub async fn batch_operation(
        &self,
        op: &str,
        ids: &[String],
    ) -> Vec<(String, Result<(), String>)> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let result = match op {
                "enable" => self.set_enabled(id, true).await,
                "disable" => self.set_enabled(id, false).await,
                "delete" => self.delete(id).await,
                other => Err(GatewayError::Validation(format!("unknown batch op {other}"))),
            };
            results.push((id.clone(), result.map_err(|e| e.to_string())));
        }
        results
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        let config = state.configs.get_mut(id).ok_or(GatewayError::NotFound)?;
        config.enabled = enabled;
        config.updated_at = chrono::Utc::now();
        drop(state);
        self.mark_dirty().await;
        Ok(())
    }

    pub async fn export_all(&self) -> Vec<ProxyConfig> {
        self.state.read().await.configs.values().cloned().collect()
    }

    pub async fn import_configs(
        &self,
        items: Vec<ProxyConfig>,
        mode: ImportMode,
    ) -> Result<usize, GatewayError> {
        let mut state = self.state.write().await;

        let conflicts: Vec<&ProxyConfig> = items
            .iter()
            .filter(|item| {
                let id_conflict = state.configs.contains_key(&item.id);
                let sub_conflict = item
                    .subdomain
                    .as_ref()
                    .and_then(|sub| state.subdomain_index.get(sub))
                    .map(|owner| owner != &item.id)
                    .unwrap_or(false);
                id_conflict || sub_conflict
            })
            .collect();

        if mode == ImportMode::Error && !conflicts.is_empty() {
            return Err(GatewayError::Conflict(format!(
                "{} conflicting configuration(s) in import",
                conflicts.len()
            )));
        }

        let mut imported = 0usize;
        for item in items {
            let id_conflict = state.configs.contains_key(&item.id);
            let sub_owner = item
                .subdomain
                .as_ref()
                .and_then(|sub| state.subdomain_index.get(sub).cloned());
            let sub_conflict = sub_owner.as_ref().map(|owner| owner != &item.id).unwrap_or(false);

            if (id_conflict || sub_conflict) && mode == ImportMode::Skip {
                continue;
            }

            if sub_conflict && mode == ImportMode::Replace {
                if let Some(owner_id) = sub_owner {
                    if let Some(owner) = state.configs.remove(&owner_id) {
                        if let Some(sub) = &owner.subdomain {
                            state.subdomain_index.remove(sub);
                        }
                    }
                }
            }
            if let Some(old) = state.configs.get(&item.id) {
                if let Some(sub) = &old.subdomain {
                    state.subdomain_index.remove(sub);
                }
            }
            if let Some(sub) = &item.subdomain {
                state.subdomain_index.insert(sub.clone(), item.id.clone());
            }
            state.configs.insert(item.id.clone(), item);
            imported += 1;
        }
        state.reindex();
        drop(state);
        self.mark_dirty().await;
        Ok(imported)
    }

    // ---- C4: token store ----

    pub async fn add_token(
        &self,
        config_id: &str,
        name: String,
        cleartext: &str,
    ) -> Result<AccessToken, GatewayError> {
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get(config_id)
            .ok_or(GatewayError::TokenState(TokenStateReason::ConfigNotFound))?;
        if config.access_tokens.len() >= MAX_TOKENS_PER_CONFIG {
            return Err(GatewayError::Capacity("MAX_TOKENS_EXCEEDED".to_string()));
        }
        if config.access_tokens.iter().any(|t| t.name == name) {
            return Err(GatewayError::Conflict("duplicate_token_name".to_string()));
        }

        let token = AccessToken::new(name, hash_token(cleartext));
        let config = state.configs.get_mut(config_id).unwrap();
        config.access_tokens.push(token.clone());
        state
            .token_index
            .insert(token.token_hash.clone(), (config_id.to_string(), token.id.clone()));
        drop(state);
        self.mark_dirty().await;
        Ok(token)
    }

    pub async fn update_token(
        &self,
        config_id: &str,
        token_id: &str,
        patch: TokenPatch,
    ) -> Result<AccessToken, GatewayError> {
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get(config_id)
            .ok_or(GatewayError::TokenState(TokenStateReason::ConfigNotFound))?;

        if let Some(new_name) = &patch.name {
            if config
                .access_tokens
                .iter()
                .any(|t| t.id != token_id && &t.name == new_name)
            {
                return Err(GatewayError::Conflict("duplicate_token_name".to_string()));
            }
        }

        let config = state.configs.get_mut(config_id).unwrap();
        let token = config
            .access_tokens
            .iter_mut()
            .find(|t| t.id == token_id)
            .ok_or(GatewayError::TokenState(TokenStateReason::TokenNotFound))?;

        if let Some(name) = patch.name {
            token.name = name;
        }
        if let Some(description) = patch.description {
            token.description = Some(description);
        }
        if let Some(enabled) = patch.enabled {
            token.enabled = enabled;
        }
        if let Some(expires_at) = patch.expires_at {
            token.expires_at = Some(expires_at);
        }
        if let Some(permissions) = patch.permissions {
            token.permissions = permissions;
        }
        token.updated_at = chrono::Utc::now();
        let updated = token.clone();
        drop(state);
        self.mark_dirty().await;
        Ok(updated)
    }

    pub async fn delete_token(&self, config_id: &str, token_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        let config = state
            .configs
            .get_mut(config_id)
            .ok_or(GatewayError::TokenState(TokenStateReason::ConfigNotFound))?;
        let position = config
            .access_tokens
            .iter()
            .position(|t| t.id == token_id)
            .ok_or(GatewayError::TokenState(TokenStateReason::TokenNotFound))?;
        let removed = config.access_tokens.remove(position);
        state.token_index.remove(&removed.token_hash);
        drop(state);
        self.mark_dirty().await;
        Ok(())
    }

    pub async fn get_token_by_id(&self, config_id: &str, token_id: &str) -> Option<AccessToken> {
        let state = self.state.read().await;
        state
            .configs
            .get(config_id)?
            .access_tokens
            .iter()
            .find(|t| t.id == token_id)
            .cloned()
    }

    pub async fn get_tokens(&self, config_id: &str) -> Option<Vec<AccessToken>> {
        let state = self.state.read().await;
        state.configs.get(config_id).map(|c| c.access_tokens.clone())
    }

    pub async fn find_config_by_token(&self, cleartext: &str) -> Option<String> {
        let hash = hash_token(cleartext);
        let state = self.state.read().await;
        state.token_index.get(&hash).map(|(config_id, _)| config_id.clone())
    }

    pub async fn validate_token(&self, config_id: &str, cleartext: &str) -> ValidationResult {
        let hash = hash_token(cleartext);
        let state = self.state.read().await;
        let Some(config) = state.configs.get(config_id) else {
            return ValidationResult::Invalid(TokenStateReason::ConfigNotFound);
        };
        let Some(token) = config.access_tokens.iter().find(|t| t.token_hash == hash) else {
            return ValidationResult::Invalid(TokenStateReason::TokenNotFound);
        };
        if !token.enabled {
            return ValidationResult::Invalid(TokenStateReason::TokenDisabled);
        }
        if token.is_expired(chrono::Utc::now()) {
            return ValidationResult::Invalid(TokenStateReason::TokenExpired);
        }
        ValidationResult::Valid(token.clone())
    }

    /// Best-effort usage counter update. Failures here (e.g. the token was
    /// deleted concurrently) must never fail the caller's request.
    pub async fn update_token_usage(&self, config_id: &str, cleartext: &str) {
        let hash = hash_token(cleartext);
        let mut state = self.state.write().await;
        let Some(config) = state.configs.get_mut(config_id) else {
            warn!("update_token_usage: config {config_id} not found");
            return;
        };
        let Some(token) = config.access_tokens.iter_mut().find(|t| t.token_hash == hash) else {
            warn!("update_token_usage: token not found for config {config_id}");
            return;
        };
        token.usage_count += 1;
        token.last_used_at = Some(chrono::Utc::now());
        drop(state);
        self.mark_dirty().await;
    }
}

/// Parses a protocol string and constructs a validated `ProxyConfig` ready
/// to hand to `Registry::add`.
pub fn build_config(
    name: String,
    subdomain: Option<String>,
    target_url: String,
    protocol: &str,
    enabled: bool,
) -> Result<ProxyConfig, GatewayError> {
    let protocol = ProxyProtocol::parse(protocol)
        .ok_or_else(|| GatewayError::Validation(format!("invalid protocol: {protocol}")))?;
    ProxyConfig::new_validated(name, subdomain, target_url, protocol, enabled)
        .map_err(GatewayError::Validation)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fresh_registry() -> Arc<Registry> {
        Registry::load(None, Duration::from_secs(30)).await
    }

    fn sample_config(subdomain: &str) -> ProxyConfig {
        build_config(
            "test".to_string(),
            Some(subdomain.to_string()),
            "https://upstream.test".to_string(),
            "https",
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_then_get_by_id_roundtrips() {
        let registry = fresh_registry().await;
        let added = registry.add(sample_config("api")).await.unwrap();
        let fetched = registry.get_by_id(&added.id).await.unwrap();
        assert_eq!(fetched.id, added.id);
    }

    #[tokio::test]
    async fn duplicate_subdomain_rejected() {
        let registry = fresh_registry().await;
        registry.add(sample_config("api")).await.unwrap();
        let result = registry.add(sample_config("api")).await;
        assert!(matches!(result, Err(GatewayError::Conflict(_))));
    }

    #[tokio::test]
    async fn disabled_config_not_returned_by_subdomain() {
        let registry = fresh_registry().await;
        let mut config = sample_config("api");
        config.enabled = false;
        let added = registry.add(config).await.unwrap();
        assert!(registry.get_by_subdomain("api").await.is_none());
        registry.delete(&added.id).await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent_not_found() {
        let registry = fresh_registry().await;
        let added = registry.add(sample_config("api")).await.unwrap();
        registry.delete(&added.id).await.unwrap();
        let result = registry.delete(&added.id).await;
        assert!(matches!(result, Err(GatewayError::NotFound)));
    }

    #[tokio::test]
    async fn token_lifecycle_validates_and_counts_usage() {
        let registry = fresh_registry().await;
        let config = registry.add(sample_config("api")).await.unwrap();
        let token = registry.add_token(&config.id, "k".to_string(), "cleartext").await.unwrap();

        let found = registry.find_config_by_token("cleartext").await;
        assert_eq!(found, Some(config.id.clone()));

        match registry.validate_token(&config.id, "cleartext").await {
            ValidationResult::Valid(t) => assert_eq!(t.id, token.id),
            _ => panic!("expected valid token"),
        }

        registry.update_token_usage(&config.id, "cleartext").await;
        let refreshed = registry.get_token_by_id(&config.id, &token.id).await.unwrap();
        assert_eq!(refreshed.usage_count, 1);
        assert!(refreshed.last_used_at.is_some());
    }

    #[tokio::test]
    async fn disabled_token_fails_validation() {
        let registry = fresh_registry().await;
        let config = registry.add(sample_config("api")).await.unwrap();
        let token = registry.add_token(&config.id, "k".to_string(), "cleartext").await.unwrap();
        registry
            .update_token(&config.id, &token.id, TokenPatch { enabled: Some(false), ..Default::default() })
            .await
            .unwrap();
        match registry.validate_token(&config.id, "cleartext").await {
            ValidationResult::Invalid(TokenStateReason::TokenDisabled) => {}
            _ => panic!("expected disabled"),
        }
    }

    #[tokio::test]
    async fn export_then_import_replace_restores_list() {
        let registry = fresh_registry().await;
        registry.add(sample_config("api")).await.unwrap();
        registry.add(sample_config("www2")).await.unwrap();

        let snapshot = registry.export_all().await;
        let registry2 = fresh_registry().await;
        registry2.import_configs(snapshot.clone(), ImportMode::Replace).await.unwrap();

        let (items, total) = registry2.list(&ConfigFilter::default()).await;
        assert_eq!(total, snapshot.len());
        assert_eq!(items.len(), snapshot.len());
    }

    #[tokio::test]
    async fn close_flushes_pending_changes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-configs.json");

        let registry = Registry::load(Some(path.clone()), Duration::from_secs(3600)).await;
        registry.start_persistence().await;
        registry.add(sample_config("api")).await.unwrap();
        registry.close().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let saved: Vec<ProxyConfig> = serde_json::from_str(&content).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].subdomain.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn load_restores_snapshot_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-configs.json");

        let first = Registry::load(Some(path.clone()), Duration::from_secs(3600)).await;
        first.start_persistence().await;
        first.add(sample_config("api")).await.unwrap();
        first.close().await;

        let reloaded = Registry::load(Some(path), Duration::from_secs(3600)).await;
        assert!(reloaded.get_by_subdomain("api").await.is_some());
    }

    #[tokio::test]
    async fn batch_operation_reports_per_id_results() {
        let registry = fresh_registry().await;
        let config = registry.add(sample_config("api")).await.unwrap();
        let results = registry
            .batch_operation("disable", &[config.id.clone(), "missing".to_string()])
            .await;
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
    }
}
