// src/llm/local.rs
//! Local backend (§6.4): Ollama-style `POST /api/embeddings` and
//! `POST /api/generate`, the latter streamable as NDJSON `{response, done}`.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

use super::{CompletionOptions, LlmClient, StreamChunk, with_retries};
use crate::config::LlmConfig;

pub struct LocalLlmClient {
    client: reqwest::Client,
    base_url: String,
    default_model: String,
    fast_model: String,
    max_retries_completion: u32,
    max_retries_embedding: u32,
}

impl LocalLlmClient {
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.completion_timeout_secs))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: config.ollama_api_url.clone(),
            default_model: config.ollama_llm_model.clone(),
            fast_model: config.ollama_fast_llm_model.clone(),
            max_retries_completion: config.completion_max_retries,
            max_retries_embedding: config.embedding_max_retries,
        }
    }

    pub fn fast_model(&self) -> &str {
        &self.fast_model
    }
}

#[async_trait]
impl LlmClient for LocalLlmClient {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String> {
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        let url = format!("{}/api/generate", self.base_url);

        with_retries(self.max_retries_completion, || {
            let body = json!({
                "model": model,
                "prompt": prompt,
                "stream": false,
                "system": opts.system,
                "options": {
                    "temperature": opts.temperature.unwrap_or(0.7),
                    "num_predict": opts.max_tokens,
                }
            });
            let client = &self.client;
            let url = &url;
            async move {
                let resp = client.post(url).json(&body).send().await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("ollama generate failed: {} {}", resp.status(), resp.text().await.unwrap_or_default()));
                }
                let raw: Value = resp.json().await.context("decode ollama response")?;
                raw["response"]
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| anyhow!("no response field in ollama output"))
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
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": model,
            "prompt": prompt,
            "stream": true,
            "system": opts.system,
            "options": { "temperature": opts.temperature.unwrap_or(0.7), "num_predict": opts.max_tokens }
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("ollama stream failed: {}", resp.status()));
        }

        let mut full = String::new();
        let bytes = resp.bytes().await.context("read ollama stream body")?;
        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            if let Ok(chunk) = serde_json::from_slice::<Value>(line) {
                if let Some(piece) = chunk["response"].as_str() {
                    full.push_str(piece);
                    on_chunk(piece.to_string());
                }
                if chunk["done"].as_bool().unwrap_or(false) {
                    break;
                }
            }
        }
        Ok(full)
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        let model = model.unwrap_or(&self.default_model).to_string();
        let url = format!("{}/api/embeddings", self.base_url);

        with_retries(self.max_retries_embedding, || {
            let body = json!({ "model": model, "prompt": text });
            let client = &self.client;
            let url = &url;
            async move {
                let resp = client.post(url).json(&body).send().await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("ollama embeddings failed: {}", resp.status()));
                }
                let raw: Value = resp.json().await.context("decode ollama embedding")?;
                raw["embedding"]
                    .as_array()
                    .ok_or_else(|| anyhow!("no embedding field"))?
                    .iter()
                    .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| anyhow!("non-numeric embedding value")))
                    .collect()
            }
        })
        .await
    }
}
