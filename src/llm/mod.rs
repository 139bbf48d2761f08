// src/llm/mod.rs
//! LLM Client (C3, §4.3): prompt -> text, with streaming, retry/timeout
//! policy, and a caching wrapper. Grounded on the teacher's
//! `llm::provider::{openai, deepseek}` request/error shape, generalised to
//! the local/hosted backend split §4.3 requires.

pub mod cached;
pub mod hosted;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// §4.3 `Complete(prompt, opts)` options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system: Option<String>,
}

impl CompletionOptions {
    pub fn is_cacheable(&self) -> bool {
        // Streaming calls are never routed through the caching wrapper (§4.3).
        true
    }
}

/// A single streamed chunk of generated text.
pub type StreamChunk = String;

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String>;

    /// Streams chunks via `on_chunk`, returning the final concatenated text.
    async fn complete_stream(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<String>;

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>>;
}

/// §4.3 retry policy: exponential backoff, bounded attempts, non-retryable
/// on 404 (model absent) / 400 (bad request).
pub async fn with_retries<F, Fut, T>(max_retries: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_retries || is_non_retryable(&e) => return Err(e),
            Err(e) => {
                attempt += 1;
                let backoff = std::time::Duration::from_millis(200 * 2u64.pow(attempt));
                tracing::warn!("llm call failed (attempt {attempt}), retrying in {backoff:?}: {e}");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn is_non_retryable(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("400") || msg.contains("404")
}
