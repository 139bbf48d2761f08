// src/llm/cached.rs
//! §4.3 caching wrapper: calls whose opts exclude streaming are cached by
//! digest of `(prompt, model, opts)` with TTL 10 min. §9 open question:
//! when `llm_cache_key_includes_context` is set, the `system` field (the
//! closest analogue to "context" at this layer) is folded into the key.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::{CompletionOptions, LlmClient, StreamChunk};
use crate::cache::{TtlCache, digest};
use crate::config::CacheConfig;

pub struct CachedLlmClient {
    inner: Arc<dyn LlmClient>,
    cache: TtlCache<String>,
    include_context_in_key: bool,
}

impl CachedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: &CacheConfig) -> Self {
        Self {
            inner,
            cache: TtlCache::new(Duration::from_secs(config.llm_cache_ttl_secs)),
            include_context_in_key: config.llm_cache_key_includes_context,
        }
    }

    fn key(&self, prompt: &str, opts: &CompletionOptions) -> String {
        let opts_json = serde_json::to_string(opts).unwrap_or_default();
        let model = opts.model.as_deref().unwrap_or("default");
        if self.include_context_in_key {
            let context = opts.system.as_deref().unwrap_or("");
            digest(&[prompt, model, &opts_json, context])
        } else {
            digest(&[prompt, model, &opts_json])
        }
    }
}

#[async_trait]
impl LlmClient for CachedLlmClient {
    async fn complete(&self, prompt: &str, opts: &CompletionOptions) -> Result<String> {
        let key = self.key(prompt, opts);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }
        let result = self.inner.complete(prompt, opts).await?;
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    /// Streaming calls bypass the cache entirely (§4.3).
    async fn complete_stream(
        &self,
        prompt: &str,
        opts: &CompletionOptions,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<String> {
        self.inner.complete_stream(prompt, opts, on_chunk).await
    }

    async fn embed(&self, text: &str, model: Option<&str>) -> Result<Vec<f32>> {
        self.inner.embed(text, model).await
    }
}
