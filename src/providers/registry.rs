use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use ollama_rs::Ollama;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{HealthStatus, ProviderConfig, ProviderHealth, ProviderPatch, ProviderRecord};
use crate::db::Database;
use crate::{TARGET_DB, TARGET_LLM_REQUEST};

/// Cached health entries younger than this are returned without probing.
const HEALTH_CACHE_TTL_SECS: i64 = 30;
/// Probes are lightweight; they get a short bound regardless of the
/// provider's configured generation timeout.
const PROBE_TIMEOUT_SECS: u64 = 5;
/// Error rate / probe latency above which a reachable provider is ranked
/// Degraded rather than Healthy.
const DEGRADED_ERROR_RATE: f64 = 0.2;
const DEGRADED_LATENCY_MS: u64 = 2000;

/// Health-aware ranking over the configured providers. Admin writes are
/// validated synchronously; read APIs never expose credentials.
pub struct ProviderRegistry {
    db: Database,
    http: reqwest::Client,
    health_cache: DashMap<String, ProviderHealth>,
}

impl ProviderRegistry {
    pub fn new(db: Database) -> Self {
        ProviderRegistry {
            db,
            http: reqwest::Client::new(),
            health_cache: DashMap::new(),
        }
    }

    pub async fn create_provider(
        &self,
        name: &str,
        config: ProviderConfig,
        priority: i64,
    ) -> Result<ProviderRecord> {
        if name.trim().is_empty() {
            return Err(anyhow!("provider name must not be empty"));
        }
        config
            .validate()
            .map_err(|reason| anyhow!("invalid provider config: {}", reason))?;

        let record = self
            .db
            .insert_provider(name, &config, priority)
            .await
            .context("failed to store provider")?;
        Ok(record.redacted())
    }

    pub async fn update_provider(
        &self,
        id: &str,
        patch: ProviderPatch,
    ) -> Result<Option<ProviderRecord>> {
        if let Some(config) = &patch.config {
            config
                .validate()
                .map_err(|reason| anyhow!("invalid provider config: {}", reason))?;
        }
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(anyhow!("provider name must not be empty"));
            }
        }

        let updated = self
            .db
            .update_provider(id, &patch)
            .await
            .context("failed to update provider")?;
        self.health_cache.remove(id);
        Ok(updated.map(|record| record.redacted()))
    }

    pub async fn delete_provider(&self, id: &str) -> Result<bool> {
        self.health_cache.remove(id);
        let deleted = self
            .db
            .delete_provider(id)
            .await
            .context("failed to delete provider")?;
        if deleted {
            info!(target: TARGET_DB, "Provider {} deleted", id);
        }
        Ok(deleted)
    }

    /// All providers with credentials redacted, ranked.
    pub async fn list_providers(&self) -> Result<Vec<ProviderRecord>> {
        let providers = self.db.list_providers().await?;
        Ok(providers.into_iter().map(|p| p.redacted()).collect())
    }

    pub async fn get_provider(&self, id: &str) -> Result<Option<ProviderRecord>> {
        Ok(self.db.get_provider(id).await?.map(|p| p.redacted()))
    }

    /// Enabled providers with live credentials, in rank order. Internal to
    /// the classification path; the redacting accessors are the read API.
    pub(crate) async fn usable_providers(&self) -> Result<Vec<ProviderRecord>> {
        Ok(self.db.enabled_providers().await?)
    }

    pub async fn record_usage(
        &self,
        id: &str,
        success: bool,
        latency_ms: i64,
        cost: f64,
    ) -> Result<()> {
        self.db
            .record_provider_usage(id, success, latency_ms, cost)
            .await
            .context("failed to record provider usage")
    }

    /// Live health probe, served from cache when a recent check exists.
    /// Classifies {healthy, degraded, down} from probe outcome, probe
    /// latency, and the provider's recorded error rate.
    pub async fn check_health(&self, id: &str) -> Result<ProviderHealth> {
        let now = Utc::now().timestamp();
        if let Some(cached) = self.health_cache.get(id) {
            if now - cached.checked_at < HEALTH_CACHE_TTL_SECS {
                return Ok(cached.clone());
            }
        }

        let provider = self
            .db
            .get_provider(id)
            .await?
            .ok_or_else(|| anyhow!("provider {} not found", id))?;

        let health = self.probe(&provider).await;
        debug!(
            target: TARGET_LLM_REQUEST,
            "Health probe for '{}': {} ({}ms)",
            provider.name,
            health.status.as_str(),
            health.response_time_ms
        );
        self.health_cache.insert(id.to_string(), health.clone());
        Ok(health)
    }

    async fn probe(&self, provider: &ProviderRecord) -> ProviderHealth {
        let start = Instant::now();
        let outcome = self.probe_endpoint(&provider.config).await;
        let response_time_ms = start.elapsed().as_millis() as u64;
        let error_rate = provider.error_rate();
        let checked_at = Utc::now().timestamp();

        match outcome {
            Ok(()) => {
                let status = if error_rate > DEGRADED_ERROR_RATE
                    || response_time_ms > DEGRADED_LATENCY_MS
                {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
                ProviderHealth {
                    status,
                    response_time_ms,
                    error_rate,
                    checked_at,
                    error: None,
                }
            }
            Err(e) => {
                warn!(target: TARGET_LLM_REQUEST, "Health probe failed for '{}': {:#}", provider.name, e);
                ProviderHealth {
                    status: HealthStatus::Down,
                    response_time_ms,
                    error_rate,
                    checked_at,
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn probe_endpoint(&self, config: &ProviderConfig) -> Result<()> {
        let bound = Duration::from_secs(PROBE_TIMEOUT_SECS);
        match config {
            ProviderConfig::OpenAi {
                api_key, base_url, ..
            } => {
                let base = base_url.as_deref().unwrap_or("https://api.openai.com/v1");
                let response = self
                    .http
                    .get(format!("{}/models", base.trim_end_matches('/')))
                    .bearer_auth(api_key)
                    .timeout(bound)
                    .send()
                    .await
                    .context("OpenAI probe request failed")?;
                if !response.status().is_success() {
                    return Err(anyhow!("OpenAI probe returned {}", response.status()));
                }
                Ok(())
            }
            ProviderConfig::Anthropic { api_key, model, .. } => {
                let body = serde_json::json!({
                    "model": model,
                    "max_tokens": 1,
                    "messages": [{ "role": "user", "content": "ping" }]
                });
                let response = self
                    .http
                    .post("https://api.anthropic.com/v1/messages")
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .timeout(bound)
                    .send()
                    .await
                    .context("Anthropic probe request failed")?;
                if !response.status().is_success() {
                    return Err(anyhow!("Anthropic probe returned {}", response.status()));
                }
                Ok(())
            }
            ProviderConfig::Ollama { host, port, .. } => {
                let ollama = Ollama::new(host.clone(), *port);
                timeout(bound, ollama.list_local_models())
                    .await
                    .context("Ollama probe timed out")?
                    .map_err(|e| anyhow!("Ollama probe failed: {}", e))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::REDACTED_PLACEHOLDER;

    fn anthropic_config() -> ProviderConfig {
        ProviderConfig::Anthropic {
            api_key: "sk-ant-test".to_string(),
            model: "claude-3-haiku-20240307".to_string(),
            max_tokens: 1000,
            timeout_secs: 30,
        }
    }

    async fn test_registry() -> ProviderRegistry {
        let db = Database::new_in_memory().await.unwrap();
        ProviderRegistry::new(db)
    }

    #[tokio::test]
    async fn test_create_redacts_and_list_never_leaks() {
        let registry = test_registry().await;
        let created = registry
            .create_provider("claude", anthropic_config(), 1)
            .await
            .unwrap();
        match &created.config {
            ProviderConfig::Anthropic { api_key, .. } => {
                assert_eq!(api_key, REDACTED_PLACEHOLDER)
            }
            _ => panic!("unexpected variant"),
        }

        let listed = registry.list_providers().await.unwrap();
        assert_eq!(listed.len(), 1);
        match &listed[0].config {
            ProviderConfig::Anthropic { api_key, .. } => {
                assert_eq!(api_key, REDACTED_PLACEHOLDER)
            }
            _ => panic!("unexpected variant"),
        }

        // The invocation path still sees real credentials.
        let usable = registry.usable_providers().await.unwrap();
        match &usable[0].config {
            ProviderConfig::Anthropic { api_key, .. } => assert_eq!(api_key, "sk-ant-test"),
            _ => panic!("unexpected variant"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_write() {
        let registry = test_registry().await;
        let bad = ProviderConfig::Anthropic {
            api_key: String::new(),
            model: "claude-3-haiku-20240307".to_string(),
            max_tokens: 1000,
            timeout_secs: 30,
        };
        assert!(registry.create_provider("claude", bad, 1).await.is_err());
        assert!(registry.list_providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_providers_are_not_usable() {
        let registry = test_registry().await;
        let created = registry
            .create_provider("claude", anthropic_config(), 1)
            .await
            .unwrap();
        registry
            .update_provider(
                &created.id,
                ProviderPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(registry.usable_providers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_cache_entry_short_circuits_probe() {
        let registry = test_registry().await;
        let created = registry
            .create_provider("claude", anthropic_config(), 1)
            .await
            .unwrap();

        registry.health_cache.insert(
            created.id.clone(),
            ProviderHealth {
                status: HealthStatus::Healthy,
                response_time_ms: 12,
                error_rate: 0.0,
                checked_at: Utc::now().timestamp(),
                error: None,
            },
        );

        // No network in tests: a cache hit is the only way this returns
        // Healthy for an unreachable endpoint.
        let health = registry.check_health(&created.id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.response_time_ms, 12);
    }
}
