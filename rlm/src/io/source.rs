//! Upstream response sources.
//!
//! The loop only assumes "prompt in, arbitrary text out"; the codec validates
//! whatever comes back. [`StubSource`] returns a fixed body for deterministic
//! runs, [`CompletionSource`] calls an OpenAI-compatible chat endpoint.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

use crate::io::config::CompletionConfig;

/// A rendered prompt: system instruction plus the serialized query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Anything that can answer a prompt with raw text.
pub trait ResponseSource: Send + Sync {
    fn respond(&self, prompt: &Prompt) -> Result<String>;
}

/// Fixed response body, independent of the prompt.
#[derive(Debug, Clone)]
pub struct StubSource {
    body: String,
}

impl StubSource {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

impl ResponseSource for StubSource {
    fn respond(&self, _prompt: &Prompt) -> Result<String> {
        Ok(self.body.clone())
    }
}

/// Live chat completion over HTTP.
pub struct CompletionSource {
    url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionSource {
    /// Build from config; the API key is read once from the configured variable.
    pub fn from_config(cfg: &CompletionConfig) -> Result<Self> {
        let url = cfg
            .url
            .clone()
            .ok_or_else(|| anyhow!("completion.url is not configured"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build completion http client")?;
        Ok(Self {
            url,
            model: cfg.model.clone(),
            api_key: std::env::var(&cfg.api_key_env).ok().filter(|k| !k.is_empty()),
            client,
        })
    }
}

impl ResponseSource for CompletionSource {
    #[instrument(skip_all, fields(model = %self.model))]
    fn respond(&self, prompt: &Prompt) -> Result<String> {
        let mut messages = Vec::new();
        if !prompt.system.is_empty() {
            messages.push(json!({"role": "system", "content": prompt.system}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));

        let mut request = self
            .client
            .post(&self.url)
            .json(&json!({"model": self.model, "messages": messages}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().context("completion transport")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(anyhow!("completion failed with {status}: {}", text.trim()));
        }
        let body: ChatCompletion = response.json().context("completion response body")?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_else(|| "{}".to_string());
        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}
