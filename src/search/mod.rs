// src/search/mod.rs
//! Searcher (C8, §4.8): dense vector search, sparse BM25-style search over
//! scrolled candidates, and Reciprocal Rank Fusion. Grounded on the
//! teacher's `memory::features::recall_engine::search::hybrid_search`
//! parallel-fan-out-then-fuse shape.

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::embedding::EmbeddingClient;
use crate::vectorstore::{Filter, VectorStore};

#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub id: u64,
    pub score: f32,
    pub text: String,
    pub entity_type: String,
    pub entity_id: String,
    pub metadata: HashMap<String, Value>,
}

pub struct Searcher {
    embeddings: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    config: SearchConfig,
}

impl Searcher {
    pub fn new(embeddings: Arc<EmbeddingClient>, store: Arc<dyn VectorStore>, config: SearchConfig) -> Self {
        Self { embeddings, store, config }
    }

    /// §4.8 `VectorSearch`.
    pub async fn vector_search(&self, query: &str, filter: &Filter) -> Result<Vec<RetrievedDoc>> {
        let vector = self.embeddings.embed(query).await?;
        let filter_arg = if filter.is_empty() { None } else { Some(filter) };
        let hits = self.store.search(&vector, self.config.per_query_limit, filter_arg).await?;
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedDoc {
                id: hit.id,
                score: hit.score,
                text: payload_string(&hit.payload, "text"),
                entity_type: payload_string(&hit.payload, "entity_type"),
                entity_id: payload_string(&hit.payload, "entity_id"),
                metadata: flatten_metadata(&hit.payload),
            })
            .collect())
    }

    /// §4.8 `BM25Search`: simplified TF normaliser without IDF, over up to
    /// `bm25_scroll_limit` scrolled candidates.
    pub async fn bm25_search(&self, query: &str, filter: &Filter) -> Result<Vec<RetrievedDoc>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let filter_arg = if filter.is_empty() { None } else { Some(filter) };
        let candidates = self.store.scroll(filter_arg, self.config.bm25_scroll_limit).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = candidates.iter().map(|c| payload_string(&c.payload, "text")).collect();
        let avgdl = texts.iter().map(|t| t.len() as f64).sum::<f64>() / texts.len() as f64;
        let k1 = self.config.bm25_k1;
        let b = self.config.bm25_b;

        let mut scored: Vec<RetrievedDoc> = candidates
            .into_iter()
            .zip(texts)
            .filter_map(|(hit, text)| {
                let dl = text.len() as f64;
                let lower = text.to_lowercase();
                let mut score = 0.0f64;
                for token in &tokens {
                    let tf = count_occurrences(&lower, token) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    score += (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * dl / avgdl));
                }
                score /= tokens.len() as f64;
                if score <= 0.0 {
                    return None;
                }
                Some(RetrievedDoc {
                    id: hit.id,
                    score: score as f32,
                    text: text.clone(),
                    entity_type: payload_string(&hit.payload, "entity_type"),
                    entity_id: payload_string(&hit.payload, "entity_id"),
                    metadata: flatten_metadata(&hit.payload),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(10);
        Ok(scored)
    }

    /// §4.8 `RRF`: `1/(k + r + 1)` per 0-based rank, summed per id.
    pub fn rrf(&self, lists: &[Vec<RetrievedDoc>]) -> Vec<RetrievedDoc> {
        rrf_with_k(lists, self.config.rrf_k)
    }

    /// §4.8 `HybridSearch`: per-query vector+BM25 in parallel, fused via
    /// RRF; per-query fused lists concatenated and fused again globally.
    pub async fn hybrid_search(&self, queries: &[String], filter: &Filter) -> Result<Vec<RetrievedDoc>> {
        let mut per_query_fused = Vec::with_capacity(queries.len());

        for query in queries {
            let (dense, sparse) = tokio::try_join!(
                self.vector_search(query, filter),
                self.bm25_search(query, filter)
            )?;
            per_query_fused.push(self.rrf(&[dense, sparse]));
        }

        Ok(rrf_with_k(&per_query_fused, self.config.rrf_k))
    }
}

/// Shared by `Searcher::rrf` and hybrid search's global fuse step.
fn rrf_with_k(lists: &[Vec<RetrievedDoc>], k: f64) -> Vec<RetrievedDoc> {
    let mut fused: HashMap<u64, (f64, RetrievedDoc)> = HashMap::new();

    for list in lists {
        for (rank, doc) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f64 + 1.0);
            fused
                .entry(doc.id)
                .and_modify(|(score, _)| *score += contribution)
                .or_insert_with(|| (contribution, doc.clone()));
        }
    }

    let mut out: Vec<(f64, RetrievedDoc)> = fused.into_values().collect();
    out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    out.into_iter()
        .map(|(score, mut doc)| {
            doc.score = score as f32;
            doc
        })
        .collect()
}

fn payload_string(payload: &crate::vectorstore::Payload, key: &str) -> String {
    payload.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn flatten_metadata(payload: &crate::vectorstore::Payload) -> HashMap<String, Value> {
    match payload.get("metadata") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => HashMap::new(),
    }
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let pattern = Regex::new(&regex::escape(needle)).expect("escaped literal is always valid");
    pattern.find_iter(haystack).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: u64, score: f32) -> RetrievedDoc {
        RetrievedDoc {
            id,
            score,
            text: String::new(),
            entity_type: "task".into(),
            entity_id: id.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn rrf_ranks_doc_in_both_lists_above_single_list_only() {
        // d appears at rank 1 (0-based) in L1 and rank 0 in L2; e appears
        // only at rank 2 in L1. d must outrank e (P5).
        let l1 = vec![doc(1, 0.9), doc(42, 0.8), doc(99, 0.1)];
        let l2 = vec![doc(42, 0.95)];
        let fused = rrf_with_k(&[l1, l2], 60.0);
        let rank_of = |id: u64| fused.iter().position(|d| d.id == id).unwrap();
        assert!(rank_of(42) < rank_of(99));
    }

    #[test]
    fn bm25_skips_short_tokens_entirely() {
        let tokens: Vec<&str> = "to be or".split_whitespace().filter(|t| t.len() > 2).collect();
        assert!(tokens.is_empty());
    }

    #[test]
    fn count_occurrences_counts_whole_and_partial() {
        assert_eq!(count_occurrences("the overdue overdue task", "overdue"), 2);
    }
}
