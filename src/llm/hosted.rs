// src/llm/hosted.rs
//! Hosted backend (§6.4): OpenAI-compatible `POST /v1/chat/completions`
//! with bearer auth, chat-formatted messages and an optional system
//! message; streaming is SSE terminated by `data: [DONE]`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use std::time::Duration;

use super::{CompletionOptions, LlmClient, StreamChunk, with_retries};
use crate::config::LlmConfig;

pub struct HostedLlmClient {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
    max_retries_completion: u32,
    max_retries_embedding: u32,
}

impl HostedLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        let api_key = config.openai_api_key.clone().unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.completion_timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            default_model: config.ollama_llm_model.clone(),
            max_retries_completion: config.completion_max_retries,
            max_retries_embedding: config.embedding_max_retries,
        }
    }

    fn messages(prompt: &str, system: Option<&str>) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        messages
    }
}

#[async_trait]
impl LlmClient for HostedLlmClient {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String> {
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());

        with_retries(self.max_retries_completion, || {
            let body = json!({
                "model": model,
                "messages": Self::messages(prompt, opts.system.as_deref()),
                "temperature": opts.temperature.unwrap_or(0.7),
                "max_tokens": opts.max_tokens,
                "stream": false,
            });
            async move {
                let resp = self
                    .client
                    .post("https://api.openai.com/v1/chat/completions")
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(anyhow!(
                        "hosted completion failed: {} {}",
                        resp.status(),
                        resp.text().await.unwrap_or_default()
                    ));
                }
                let raw: Value = resp.json().await.context("decode hosted completion")?;
                raw["choices"][0]["message"]["content"]
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| anyhow!("no content in hosted completion response"))
            }
        })
        .await
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<String> {
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = json!({
            "model": model,
            "messages": Self::messages(prompt, opts.system.as_deref()),
            "temperature": opts.temperature.unwrap_or(0.7),
            "max_tokens": opts.max_tokens,
            "stream": true,
        });

        let request = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body);

        let mut source = EventSource::new(request).context("failed to open SSE stream")?;
        let mut full = String::new();

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Message(message)) => {
                    if message.data == "[DONE]" {
                        break;
                    }
                    if let Ok(chunk) = serde_json::from_str::<Value>(&message.data) {
                        if let Some(piece) = chunk["choices"][0]["delta"]["content"].as_str() {
                            full.push_str(piece);
                            on_chunk(piece.to_string());
                        }
                    }
                }
                Ok(Event::Open) => {}
                Err(e) => {
                    source.close();
                    return Err(anyhow!("SSE stream error: {e}"));
                }
            }
        }

        Ok(full)
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let model = model.unwrap_or("text-embedding-3-small").to_string();

        with_retries(self.max_retries_embedding, || {
            let body = json!({ "model": model, "input": text });
            async move {
                let resp = self
                    .client
                    .post("https://api.openai.com/v1/embeddings")
                    .bearer_auth(&self.api_key)
                    .json(&body)
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("hosted embeddings failed: {}", resp.status()));
                }
                let raw: Value = resp.json().await.context("decode hosted embedding")?;
                raw["data"][0]["embedding"]
                    .as_array()
                    .ok_or_else(|| anyhow!("no embedding in hosted response"))?
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| anyhow!("non-numeric embedding value")))
                    .collect()
            }
        })
        .await
    }
}
