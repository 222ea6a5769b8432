pub mod fallback;
pub mod parse;
pub mod prompt;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::db::article::Article;
use crate::llm::generate_classification;
use crate::providers::{HealthStatus, ProviderRegistry};
use crate::TARGET_LLM_REQUEST;

pub use fallback::{FALLBACK_CONFIDENCE, FALLBACK_PROVIDER};

/// Discrimination category assigned to an article.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Racial,
    Religious,
    Disability,
    GeneralAi,
    Multiple,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Racial => "RACIAL",
            Category::Religious => "RELIGIOUS",
            Category::Disability => "DISABILITY",
            Category::GeneralAi => "GENERAL_AI",
            Category::Multiple => "MULTIPLE",
        }
    }

    pub fn parse(value: &str) -> Option<Category> {
        match value {
            "RACIAL" => Some(Category::Racial),
            "RELIGIOUS" => Some(Category::Religious),
            "DISABILITY" => Some(Category::Disability),
            "GENERAL_AI" => Some(Category::GeneralAi),
            "MULTIPLE" => Some(Category::Multiple),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }

    pub fn parse(value: &str) -> Option<Severity> {
        match value {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            _ => None,
        }
    }
}

/// Geographic scope, centered on the dashboard's Michigan focus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Michigan,
    National,
    International,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Michigan => "MICHIGAN",
            Location::National => "NATIONAL",
            Location::International => "INTERNATIONAL",
        }
    }

    pub fn parse(value: &str) -> Option<Location> {
        match value {
            "MICHIGAN" => Some(Location::Michigan),
            "NATIONAL" => Some(Location::National),
            "INTERNATIONAL" => Some(Location::International),
            _ => None,
        }
    }
}

/// Named entities pulled out of an article during classification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entities {
    pub locations: Vec<String>,
    pub people: Vec<String>,
    pub organizations: Vec<String>,
}

/// A finished classification, ready to be written back to the article.
/// `provider` is the provider name that produced it, or
/// [`FALLBACK_PROVIDER`] for keyword results.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationResult {
    pub category: Category,
    pub severity: Severity,
    pub location: Location,
    pub confidence: f64,
    pub entities: Entities,
    pub keywords: Vec<String>,
    pub reasoning: String,
    pub provider: String,
    pub processing_ms: u64,
}

/// Classifies articles through the provider registry, falling back to
/// keyword analysis when no provider can produce a usable answer.
/// `classify` is infallible by contract: every article gets some result.
pub struct Classifier {
    registry: Arc<ProviderRegistry>,
    http: reqwest::Client,
}

impl Classifier {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Classifier {
            registry,
            http: reqwest::Client::new(),
        }
    }

    /// Try each usable provider in rank order; the first parseable
    /// response wins. Providers whose health probe reports Down are
    /// skipped without an attempt. Every attempt, success or failure,
    /// feeds the provider's usage counters.
    pub async fn classify(&self, article: &Article) -> ClassificationResult {
        let started = Instant::now();
        let request = prompt::classification_prompt(article, prompt::MAX_CONTENT_CHARS);

        let providers = match self.registry.usable_providers().await {
            Ok(providers) => providers,
            Err(e) => {
                warn!(
                    target: TARGET_LLM_REQUEST,
                    "Failed to load providers for article {}: {:#}", article.id, e
                );
                Vec::new()
            }
        };

        for provider in &providers {
            match self.registry.check_health(&provider.id).await {
                Ok(health) if health.status == HealthStatus::Down => {
                    info!(
                        target: TARGET_LLM_REQUEST,
                        "Skipping provider '{}' for article {}: down", provider.name, article.id
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        target: TARGET_LLM_REQUEST,
                        "Health check failed for '{}', attempting anyway: {:#}", provider.name, e
                    );
                }
            }

            let attempt = Instant::now();
            let outcome = generate_classification(&self.http, &provider.config, &request).await;
            let latency_ms = attempt.elapsed().as_millis() as i64;

            match outcome.and_then(|response| parse::parse_classification_response(&response)) {
                Ok(parsed) => {
                    self.note_usage(&provider.id, true, latency_ms).await;
                    info!(
                        target: TARGET_LLM_REQUEST,
                        "Article {} classified by '{}' as {} ({}ms)",
                        article.id,
                        provider.name,
                        parsed.category.as_str(),
                        latency_ms
                    );
                    return ClassificationResult {
                        category: parsed.category,
                        severity: parsed.severity,
                        location: parsed.location,
                        confidence: parsed.confidence,
                        entities: parsed.entities,
                        keywords: parsed.keywords,
                        reasoning: parsed.reasoning,
                        provider: provider.name.clone(),
                        processing_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Err(e) => {
                    self.note_usage(&provider.id, false, latency_ms).await;
                    warn!(
                        target: TARGET_LLM_REQUEST,
                        "Provider '{}' failed for article {}: {:#}", provider.name, article.id, e
                    );
                }
            }
        }

        info!(
            target: TARGET_LLM_REQUEST,
            "All {} provider(s) exhausted for article {}, using keyword fallback",
            providers.len(),
            article.id
        );
        let mut result = fallback::fallback_classification(&article.title, &article.content);
        result.processing_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// Usage bookkeeping must never abort a classification.
    async fn note_usage(&self, provider_id: &str, success: bool, latency_ms: i64) {
        if let Err(e) = self
            .registry
            .record_usage(provider_id, success, latency_ms, 0.0)
            .await
        {
            warn!(target: TARGET_LLM_REQUEST, "Failed to record provider usage: {:#}", e);
        }
    }
}
