use anyhow::{anyhow, Context, Result};
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client as OpenAIClient;
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::generation::options::GenerationOptions;
use ollama_rs::Ollama;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::classifier::prompt::SYSTEM_PROMPT;
use crate::providers::ProviderConfig;
use crate::TARGET_LLM_REQUEST;

/// One bounded generation attempt against a single provider. Failover
/// across providers is the caller's job; this never retries.
pub async fn generate_classification(
    http: &reqwest::Client,
    config: &ProviderConfig,
    prompt: &str,
) -> Result<String> {
    let bound = Duration::from_secs(config.timeout_secs());
    debug!(
        target: TARGET_LLM_REQUEST,
        "Sending classification request to {} ({})",
        config.kind(),
        config.model()
    );

    let response = match config {
        ProviderConfig::OpenAi {
            api_key,
            base_url,
            model,
            max_tokens,
            temperature,
            ..
        } => {
            let mut openai_config = OpenAIConfig::new().with_api_key(api_key);
            if let Some(base) = base_url {
                openai_config = openai_config.with_api_base(base);
            }
            let client = OpenAIClient::with_config(openai_config);

            let messages = vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SYSTEM_PROMPT)
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()?
                    .into(),
            ];
            let request = CreateChatCompletionRequestArgs::default()
                .model(model.as_str())
                .messages(messages)
                .temperature(*temperature)
                .max_tokens(*max_tokens)
                .build()?;

            let completion = timeout(bound, client.chat().create(request))
                .await
                .map_err(|_| anyhow!("OpenAI request timed out after {:?}", bound))?
                .context("OpenAI request failed")?;

            completion
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .ok_or_else(|| anyhow!("no content in OpenAI response"))?
        }
        ProviderConfig::Anthropic {
            api_key,
            model,
            max_tokens,
            ..
        } => {
            let body = serde_json::json!({
                "model": model,
                "max_tokens": max_tokens,
                "system": SYSTEM_PROMPT,
                "messages": [{ "role": "user", "content": prompt }]
            });
            let response = http
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .timeout(bound)
                .send()
                .await
                .context("Anthropic request failed")?;

            let status = response.status();
            if !status.is_success() {
                return Err(anyhow!("Anthropic API error: {}", status));
            }

            let payload: serde_json::Value = response
                .json()
                .await
                .context("Anthropic response was not JSON")?;
            payload["content"][0]["text"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("no content in Anthropic response"))?
        }
        ProviderConfig::Ollama {
            host,
            port,
            model,
            temperature,
            ..
        } => {
            let ollama = Ollama::new(host.clone(), *port);
            let mut request = GenerationRequest::new(model.clone(), prompt.to_string());
            request.options = Some(GenerationOptions::default().temperature(*temperature));

            let generation = timeout(bound, ollama.generate(request))
                .await
                .map_err(|_| anyhow!("Ollama request timed out after {:?}", bound))?
                .map_err(|e| anyhow!("Ollama request failed: {}", e))?;
            generation.response
        }
    };

    if response.trim().is_empty() {
        warn!(target: TARGET_LLM_REQUEST, "{} returned an empty response", config.kind());
        return Err(anyhow!("empty response from {}", config.kind()));
    }
    Ok(response)
}
