pub mod registry;

use serde::{Deserialize, Serialize};

pub use registry::ProviderRegistry;

/// Placeholder returned in place of credentials by every read API.
pub const REDACTED_PLACEHOLDER: &str = "[redacted]";

/// Vendor-specific configuration, one variant per supported backend so
/// required fields are checked at compile time instead of living in an
/// untyped JSON blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    OpenAi {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
        model: String,
        max_tokens: u32,
        temperature: f32,
        timeout_secs: u64,
    },
    Anthropic {
        api_key: String,
        model: String,
        max_tokens: u32,
        timeout_secs: u64,
    },
    Ollama {
        host: String,
        port: u16,
        model: String,
        temperature: f32,
        timeout_secs: u64,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::OpenAi { .. } => "openai",
            ProviderConfig::Anthropic { .. } => "anthropic",
            ProviderConfig::Ollama { .. } => "ollama",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderConfig::OpenAi { model, .. } => model,
            ProviderConfig::Anthropic { model, .. } => model,
            ProviderConfig::Ollama { model, .. } => model,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        match self {
            ProviderConfig::OpenAi { timeout_secs, .. } => *timeout_secs,
            ProviderConfig::Anthropic { timeout_secs, .. } => *timeout_secs,
            ProviderConfig::Ollama { timeout_secs, .. } => *timeout_secs,
        }
    }

    /// Synchronous validation applied before any configuration write.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ProviderConfig::OpenAi {
                api_key,
                model,
                timeout_secs,
                ..
            }
            | ProviderConfig::Anthropic {
                api_key,
                model,
                timeout_secs,
                ..
            } => {
                if api_key.trim().is_empty() {
                    return Err("API key must not be empty".to_string());
                }
                if model.trim().is_empty() {
                    return Err("model must not be empty".to_string());
                }
                validate_timeout(*timeout_secs)
            }
            ProviderConfig::Ollama {
                host,
                model,
                timeout_secs,
                ..
            } => {
                if host.trim().is_empty() {
                    return Err("host must not be empty".to_string());
                }
                if model.trim().is_empty() {
                    return Err("model must not be empty".to_string());
                }
                validate_timeout(*timeout_secs)
            }
        }
    }

    /// A copy safe to echo back to callers: credentials replaced by a
    /// placeholder. Ollama carries no secret, so it passes through.
    pub fn redacted(&self) -> ProviderConfig {
        let mut config = self.clone();
        match &mut config {
            ProviderConfig::OpenAi { api_key, .. } | ProviderConfig::Anthropic { api_key, .. } => {
                *api_key = REDACTED_PLACEHOLDER.to_string();
            }
            ProviderConfig::Ollama { .. } => {}
        }
        config
    }
}

fn validate_timeout(timeout_secs: u64) -> Result<(), String> {
    if timeout_secs == 0 || timeout_secs > 300 {
        Err(format!(
            "timeout_secs must be between 1 and 300, got {}",
            timeout_secs
        ))
    } else {
        Ok(())
    }
}

/// A configured provider as stored, with rolling usage counters.
#[derive(Clone, Debug)]
pub struct ProviderRecord {
    pub id: String,
    pub name: String,
    pub config: ProviderConfig,
    pub enabled: bool,
    /// Ascending rank: lower is tried first.
    pub priority: i64,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub average_latency_ms: Option<i64>,
    pub estimated_cost: f64,
    pub last_used: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProviderRecord {
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    pub fn redacted(&self) -> ProviderRecord {
        ProviderRecord {
            config: self.config.redacted(),
            ..self.clone()
        }
    }
}

/// Partial update for a configured provider.
#[derive(Clone, Debug, Default)]
pub struct ProviderPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i64>,
    pub config: Option<ProviderConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

/// Derived health, never persisted. Cached briefly in the registry.
#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error_rate: f64,
    pub checked_at: i64,
    pub error: Option<String>,
}
