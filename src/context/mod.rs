// src/context/mod.rs
//! Context Processor (C9, §4.9): rerank, MMR diversity selection, token
//! budget compression, citation formatting. Grounded on the teacher's
//! `memory::features::recall_engine::multihead_search` composite-scoring
//! and dedup pass, generalised to a pure post-processing stage.

use serde::Serialize;
use std::collections::HashSet;

use crate::config::ContextConfig;
use crate::search::RetrievedDoc;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub entity_type: String,
    pub entity_id: String,
    pub text: String,
    pub score: f32,
    pub citation: String,
}

#[derive(Debug, Clone)]
pub struct ProcessedContext {
    pub reranked: Vec<RetrievedDoc>,
    pub diverse: Vec<RetrievedDoc>,
    pub compressed: Vec<RetrievedDoc>,
    pub sources: Vec<Citation>,
    pub context: String,
}

pub struct ContextProcessor {
    config: ContextConfig,
}

impl ContextProcessor {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// §4.9 `Process`.
    pub fn process(&self, mut docs: Vec<RetrievedDoc>, _query: &str) -> ProcessedContext {
        docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let reranked: Vec<RetrievedDoc> = docs.into_iter().take(self.config.rerank_size).collect();

        let diverse = if reranked.len() >= 5 {
            mmr(&reranked, self.config.mmr_lambda, self.config.mmr_selection_size)
        } else {
            reranked.clone()
        };

        let compressed = compress(&diverse, self.config.max_tokens);
        let sources = compressed.iter().enumerate().map(|(i, d)| citation(d, i)).collect();
        let context = render_context(&compressed);

        ProcessedContext { reranked, diverse, compressed, sources, context }
    }
}

/// §4.9.2 MMR with λ (P6: `diverse[0] == reranked[0]`, `|diverse| = min(n, |reranked|)`).
pub fn mmr(reranked: &[RetrievedDoc], lambda: f64, n: usize) -> Vec<RetrievedDoc> {
    if reranked.is_empty() {
        return Vec::new();
    }

    let token_sets: Vec<HashSet<String>> = reranked.iter().map(|d| tokenize(&d.text)).collect();
    let mut selected = vec![0usize];
    let target = n.min(reranked.len());

    while selected.len() < target {
        let mut best_idx = None;
        let mut best_value = f64::MIN;

        for (idx, doc) in reranked.iter().enumerate() {
            if selected.contains(&idx) {
                continue;
            }
            let max_sim = selected
                .iter()
                .map(|&s| jaccard(&token_sets[idx], &token_sets[s]))
                .fold(0.0_f64, f64::max);
            let value = lambda * doc.score as f64 - (1.0 - lambda) * max_sim;
            if value > best_value {
                best_value = value;
                best_idx = Some(idx);
            }
        }

        match best_idx {
            Some(idx) => selected.push(idx),
            None => break,
        }
    }

    selected.into_iter().map(|idx| reranked[idx].clone()).collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(|s| s.to_string()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// §4.9.3: include docs in order while cumulative `len(text) <= 4*maxTokens`.
pub fn compress(docs: &[RetrievedDoc], max_tokens: usize) -> Vec<RetrievedDoc> {
    let budget = 4 * max_tokens;
    let mut out = Vec::new();
    let mut cumulative = 0usize;

    for doc in docs {
        let next = cumulative + doc.text.len();
        if next > budget {
            break;
        }
        cumulative = next;
        out.push(doc.clone());
    }
    out
}

fn citation(doc: &RetrievedDoc, index: usize) -> Citation {
    let truncated: String = doc.text.chars().take(200).collect();
    let snippet = if doc.text.chars().count() > 200 {
        format!("{truncated}...")
    } else {
        truncated
    };
    Citation {
        entity_type: doc.entity_type.clone(),
        entity_id: doc.entity_id.clone(),
        text: snippet,
        score: doc.score,
        citation: format!("[{}]", index + 1),
    }
}

/// §4.9.5: `"[i] ENTITYTYPE: text\n\n"` concatenated.
fn render_context(docs: &[RetrievedDoc]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, d)| format!("[{}] {}: {}\n\n", i + 1, d.entity_type.to_uppercase(), d.text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc(id: u64, score: f32, text: &str) -> RetrievedDoc {
        RetrievedDoc {
            id,
            score,
            text: text.to_string(),
            entity_type: "task".into(),
            entity_id: id.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn mmr_keeps_top_doc_first_and_caps_at_five() {
        let docs: Vec<RetrievedDoc> = (0..8)
            .map(|i| doc(i, 1.0 - i as f32 * 0.05, &format!("task number {i} unique words here")))
            .collect();
        let diverse = mmr(&docs, 0.85, 5);
        assert_eq!(diverse[0].id, docs[0].id);
        assert_eq!(diverse.len(), 5);
    }

    #[test]
    fn mmr_passthrough_when_fewer_than_five() {
        let config = ContextConfig {
            mmr_lambda: 0.85,
            mmr_selection_size: 5,
            rerank_size: 10,
            max_tokens: 3000,
            grounding_threshold: 0.30,
        };
        let processor = ContextProcessor::new(config);
        let docs = vec![doc(1, 0.9, "a"), doc(2, 0.8, "b"), doc(3, 0.7, "c")];
        let processed = processor.process(docs.clone(), "query");
        assert_eq!(processed.diverse.len(), 3);
        assert_eq!(processed.diverse[0].id, docs[0].id);
    }

    #[test]
    fn compression_respects_zero_budget() {
        let docs = vec![doc(1, 0.9, "some text")];
        assert!(compress(&docs, 0).is_empty());
    }

    #[test]
    fn citation_truncates_at_200_chars() {
        let long_text = "x".repeat(250);
        let c = citation(&doc(1, 0.5, &long_text), 0);
        assert!(c.text.ends_with("..."));
        assert_eq!(c.citation, "[1]");
    }
}
