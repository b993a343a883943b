//! Chat model abstraction and HTTP implementations.
//!
//! Defines the [`ChatModel`] trait consumed by the pipeline and three
//! concrete clients:
//! - **[`OpenAiChatModel`]** any OpenAI-compatible `/chat/completions`
//!   endpoint (OpenAI, Ollama, vLLM, ...).
//! - **[`AnthropicChatModel`]** the Anthropic Messages API.
//! - **[`GoogleChatModel`]** the Gemini `generateContent` API.
//!
//! # Provider Selection
//!
//! Use [`create_model`] to build the client named by `[model].protocol`.
//! `"disabled"` yields `None`; every model-mediated decision in the
//! pipeline then degrades to its fixed fallback.
//!
//! # Retry Strategy
//!
//! All clients share [`post_json`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ModelConfig;

/// Placeholder answer when no model is configured.
pub const MODEL_UNAVAILABLE: &str = "model unavailable";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    Human,
}

/// A role-tagged chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }
}

/// A chat model that turns an ordered message list into free text.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Returns the model identifier (e.g. `"qwen3:0.6b"`).
    fn model_name(&self) -> &str;

    /// Send the messages and return the reply's text content.
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String>;
}

// ============ Shared transport ============

/// POST a JSON body with retry/backoff and return the parsed JSON reply.
async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: &Value,
    max_retries: u32,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    tracing::warn!(%status, attempt, "model API error, retrying");
                    last_err = Some(anyhow!("model API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("model API error {}: {}", status, body_text);
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "model request failed, retrying");
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("model call failed after retries")))
}

fn http_client(config: &ModelConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Give a bare `host:port/path` an `http://` scheme and drop trailing slashes.
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    let with_scheme = if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    };
    with_scheme.trim_end_matches('/').to_string()
}

fn is_local_ollama(base: &str) -> bool {
    base.contains("127.0.0.1:11434") || base.contains("localhost:11434")
}

// ============ OpenAI-compatible ============

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiChatModel {
    /// Build from config. A local Ollama endpoint is always reached at
    /// `http://127.0.0.1:11434/v1` with the placeholder key `ollama`.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let base = normalize_base_url(&config.url);
        let (base_url, api_key) = if is_local_ollama(&base) {
            ("http://127.0.0.1:11434/v1".to_string(), "ollama".to_string())
        } else {
            (
                base,
                config.api_key().unwrap_or_else(|| "dummy-key".to_string()),
            )
        };
        Ok(Self {
            client: http_client(config)?,
            base_url,
            api_key,
            model: config.name.clone(),
            max_retries: config.max_retries,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages
                .iter()
                .map(|m| json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::Human => "user",
                    },
                    "content": m.content,
                }))
                .collect::<Vec<_>>(),
        });
        let url = format!("{}/chat/completions", self.base_url);
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];
        let reply = post_json(&self.client, &url, &headers, &body, self.max_retries).await?;
        parse_openai_reply(&reply)
    }
}

/// Extract `choices[0].message.content`.
fn parse_openai_reply(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid chat response: missing choices[0].message.content"))
}

// ============ Anthropic ============

/// Client for the Anthropic Messages API.
pub struct AnthropicChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl AnthropicChatModel {
    /// Requires the API key variable named by `model.api_key_env`. The
    /// default local model URL is replaced by the public endpoint.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key()
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let base = normalize_base_url(&config.url);
        let base_url = if is_local_ollama(&base) {
            "https://api.anthropic.com".to_string()
        } else {
            base
        };
        Ok(Self {
            client: http_client(config)?,
            base_url,
            api_key,
            model: config.name.clone(),
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<Value> = messages
            .iter()
            .filter(|m| m.role == Role::Human)
            .map(|m| json!({ "role": "user", "content": m.content }))
            .collect();
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system.join("\n\n"),
            "messages": turns,
        });
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches("/v1"));
        let headers = [
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
        ];
        let reply = post_json(&self.client, &url, &headers, &body, self.max_retries).await?;
        parse_anthropic_reply(&reply)
    }
}

/// Concatenate the `text` blocks of `content`.
fn parse_anthropic_reply(json: &Value) -> Result<String> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow!("Invalid messages response: missing content"))?;
    Ok(blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

// ============ Google ============

/// Client for the Gemini `generateContent` API.
pub struct GoogleChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl GoogleChatModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key()
            .ok_or_else(|| anyhow!("{} environment variable not set", config.api_key_env))?;
        let base = normalize_base_url(&config.url);
        let base_url = if is_local_ollama(&base) {
            "https://generativelanguage.googleapis.com".to_string()
        } else {
            base
        };
        Ok(Self {
            client: http_client(config)?,
            base_url,
            api_key,
            model: config.name.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for GoogleChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<Value> = messages
            .iter()
            .filter(|m| m.role == Role::Human)
            .map(|m| json!({ "role": "user", "parts": [{ "text": m.content }] }))
            .collect();
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system.join("\n\n") }] },
            "contents": contents,
        });
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let headers = [("x-goog-api-key", self.api_key.clone())];
        let reply = post_json(&self.client, &url, &headers, &body, self.max_retries).await?;
        parse_google_reply(&reply)
    }
}

/// Concatenate `candidates[0].content.parts[].text`.
fn parse_google_reply(json: &Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Invalid generateContent response: missing parts"))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

// ============ Factory ============

/// Create the [`ChatModel`] named by `config.protocol`.
///
/// | Config Value | Model |
/// |-------------|-------|
/// | `"openai"` | [`OpenAiChatModel`] |
/// | `"anthropic"` | [`AnthropicChatModel`] |
/// | `"google"` | [`GoogleChatModel`] |
/// | `"disabled"` | `None` |
///
/// # Errors
///
/// Unknown protocols, a missing API key for hosted providers, or an HTTP
/// client that cannot be built.
pub fn create_model(config: &ModelConfig) -> Result<Option<Arc<dyn ChatModel>>> {
    let model: Arc<dyn ChatModel> = match config.protocol.as_str() {
        "openai" => Arc::new(OpenAiChatModel::new(config)?),
        "anthropic" => Arc::new(AnthropicChatModel::new(config)?),
        "google" => Arc::new(GoogleChatModel::new(config)?),
        "disabled" => return Ok(None),
        other => bail!("Unknown model protocol: {}", other),
    };
    Ok(Some(model))
}

/// Result of a model health check.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCheck {
    pub model: String,
    pub protocol: String,
    pub base_url: String,
    pub status: String,
    pub latency_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the configured model and ask it to reply with `OK`.
pub async fn check_model(config: &ModelConfig) -> ModelCheck {
    let start = Instant::now();
    let mut check = ModelCheck {
        model: config.name.clone(),
        protocol: config.protocol.clone(),
        base_url: config.url.clone(),
        status: "error".to_string(),
        latency_sec: 0.0,
        reply: None,
        ok: None,
        error: None,
    };

    let outcome = match create_model(config) {
        Ok(Some(model)) => {
            model
                .invoke(&[
                    ChatMessage::system("health check"),
                    ChatMessage::human("reply with OK only"),
                ])
                .await
        }
        Ok(None) => Err(anyhow!("model protocol is disabled")),
        Err(e) => Err(e),
    };

    check.latency_sec = (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
    match outcome {
        Ok(content) => {
            check.status = "success".to_string();
            check.ok = Some(content.to_uppercase().contains("OK"));
            check.reply = Some(crate::models::truncate_chars(&content, 200).to_string());
        }
        Err(e) => check.error = Some(e.to_string()),
    }
    check
}
