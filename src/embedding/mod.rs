// src/embedding/mod.rs
//! Embedding Client (C1, §4.1): text -> fixed-dimension vector, with
//! preprocessing, validation and a TTL embedding cache. The network call
//! itself is delegated to an `EmbeddingBackend`, mirroring the split the
//! teacher draws between `llm::provider::GeminiEmbeddings` (the backend)
//! and the higher-level caching/validation wrapper.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::cache::{TtlCache, digest};
use crate::config::EmbeddingConfig;
use crate::error::PipelineError;

/// The network-facing half of C1: a model that turns preprocessed text into
/// a raw vector. Real implementations call Ollama/OpenAI-style embedding
/// endpoints; tests substitute a deterministic fake.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

pub struct EmbeddingClient {
    backend: Arc<dyn EmbeddingBackend>,
    cache: TtlCache<Vec<f32>>,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, config: EmbeddingConfig) -> Self {
        let cache = TtlCache::new(Duration::from_secs(config.cache_ttl_secs));
        Self {
            backend,
            cache,
            config,
        }
    }

    /// §4.1 preprocessing: trim, collapse whitespace, NFC-normalise, strip
    /// control characters except newline/tab, truncate to MAX_CHARS. Empty
    /// input yields the empty string.
    pub fn preprocess(&self, text: &str) -> String {
        let collapsed: String = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string();

        let normalized: String = collapsed.nfc().collect();

        let stripped: String = normalized
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();

        stripped.chars().take(self.config.max_chars).collect()
    }

    /// §4.1 `Embed(text) -> vector[D]`. Fails with `EmbeddingInvalid` on a
    /// malformed backend response; the single-item path never falls back to
    /// a zero vector (that is reserved for the batch path).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let preprocessed = self.preprocess(text);

        if preprocessed.is_empty() {
            bail!(PipelineError::EmbeddingInvalid(
                "cannot embed empty text".into()
            ));
        }

        let key = digest(&[&preprocessed]);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached);
        }

        let vector = self.backend.embed_raw(&preprocessed).await?;
        self.validate(&vector)?;

        self.cache.insert(key, vector.clone());
        Ok(vector)
    }

    /// §4.1 `EmbedBatch`: bounded batches with per-item cache consultation;
    /// an individual item's validation failure falls back to a zero vector
    /// and is logged, rather than failing the whole batch.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.config.batch_size) {
            for text in chunk {
                match self.embed(text).await {
                    Ok(vector) => out.push(vector),
                    Err(e) => {
                        warn!("embedding failed for batch item, using zero vector: {e}");
                        out.push(vec![0.0; self.backend.dimension()]);
                    }
                }
            }
        }

        Ok(out)
    }

    /// §I3/P2: exactly D finite elements, not all zero.
    fn validate(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.backend.dimension() {
            bail!(PipelineError::EmbeddingInvalid(format!(
                "expected dimension {}, got {}",
                self.backend.dimension(),
                vector.len()
            )));
        }
        if !vector.iter().all(|v| v.is_finite()) {
            bail!(PipelineError::EmbeddingInvalid(
                "vector contains non-finite values".into()
            ));
        }
        if vector.iter().all(|v| *v == 0.0) {
            bail!(PipelineError::EmbeddingInvalid("vector is all-zero".into()));
        }
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBackend {
        dim: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for FakeBackend {
        async fn embed_raw(&self, text: &str) -> Result<Vec<f32>> {
            let seed = text.len() as f32 + 1.0;
            Ok((0..self.dim).map(|i| seed + i as f32).collect())
        }
        fn dimension(&self) -> usize {
            self.dim
        }
    }

    fn client() -> EmbeddingClient {
        EmbeddingClient::new(
            Arc::new(FakeBackend { dim: 8 }),
            EmbeddingConfig {
                max_chars: 32_000,
                cache_ttl_secs: 3600,
                batch_size: 2,
            },
        )
    }

    #[test]
    fn preprocess_collapses_whitespace_and_trims() {
        let c = client();
        assert_eq!(c.preprocess("  hello   world  \n"), "hello world");
    }

    #[test]
    fn preprocess_strips_control_chars_but_keeps_tab_and_newline() {
        let c = client();
        let input = "a\u{0007}b\tc\nd";
        assert!(!c.preprocess(input).contains('\u{0007}'));
    }

    #[tokio::test]
    async fn empty_input_fails() {
        let c = client();
        let err = c.embed("   ").await.unwrap_err();
        assert!(format!("{err}").contains("invalid") || format!("{err:?}").contains("EmbeddingInvalid"));
    }

    #[tokio::test]
    async fn embed_is_cached_by_digest() {
        let c = client();
        let v1 = c.embed("hello world").await.unwrap();
        let v2 = c.embed("hello   world").await.unwrap(); // normalises to same key
        assert_eq!(v1, v2);
        assert_eq!(c.cache.len(), 1);
    }

    #[tokio::test]
    async fn batch_falls_back_to_zero_vector_on_individual_failure() {
        struct FlakyBackend;
        #[async_trait]
        impl EmbeddingBackend for FlakyBackend {
            async fn embed_raw(&self, text: &str) -> Result<Vec<f32>> {
                if text == "bad" {
                    Ok(vec![0.0; 4]) // triggers all-zero validation failure
                } else {
                    Ok(vec![1.0; 4])
                }
            }
            fn dimension(&self) -> usize {
                4
            }
        }
        let c = EmbeddingClient::new(
            Arc::new(FlakyBackend),
            EmbeddingConfig {
                max_chars: 32_000,
                cache_ttl_secs: 3600,
                batch_size: 10,
            },
        );
        let out = c
            .embed_batch(&["good".to_string(), "bad".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0; 4]);
        assert_eq!(out[1], vec![0.0; 4]);
    }
}
