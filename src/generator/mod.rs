// src/generator/mod.rs
//! Generator (C12, §4.12): intent-aware answer prompt, grounding check,
//! confidence scoring. Grounded on the teacher's `llm::provider` prompt
//! assembly style (role + rules + context block + history) generalised to
//! the intent-keyed directive table §4.12 requires.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::conversation::Turn;
use crate::intent::ClassificationType;
use crate::llm::{CompletionOptions, LlmClient, StreamChunk};
use crate::search::RetrievedDoc;

pub struct Generator {
    llm: Arc<dyn LlmClient>,
}

impl Generator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// §4.12 `Generate`.
    pub async fn generate(
        &self,
        query: &str,
        context: &str,
        history: &[Turn],
        intent_type: ClassificationType,
    ) -> Result<String> {
        let prompt = build_prompt(query, context, history, intent_type);
        let opts = CompletionOptions {
            model: None,
            temperature: Some(temperature_for(intent_type)),
            max_tokens: None,
            system: Some(directive_for(intent_type).to_string()),
        };
        let text = self.llm.complete(&prompt, &opts).await?;
        Ok(text.trim().to_string())
    }

    /// §4.12 `GenerateStream`: same construction, fixed `max_tokens = 500`.
    pub async fn generate_stream(
        &self,
        query: &str,
        context: &str,
        history: &[Turn],
        intent_type: ClassificationType,
        on_chunk: &mut (dyn FnMut(StreamChunk) + Send),
    ) -> Result<String> {
        let prompt = build_prompt(query, context, history, intent_type);
        let opts = CompletionOptions {
            model: None,
            temperature: Some(temperature_for(intent_type)),
            max_tokens: Some(500),
            system: Some(directive_for(intent_type).to_string()),
        };
        let text = self.llm.complete_stream(&prompt, &opts, on_chunk).await?;
        Ok(text.trim().to_string())
    }

    /// §4.12 `CheckGrounding`: Jaccard-style token overlap strictly > 0.30.
    pub fn check_grounding(&self, answer: &str, docs: &[RetrievedDoc]) -> bool {
        check_grounding(answer, docs)
    }

    /// §4.12 `Confidence`.
    pub fn confidence(&self, docs: &[RetrievedDoc], grounded: bool) -> f64 {
        confidence(docs, grounded)
    }
}

fn temperature_for(intent_type: ClassificationType) -> f32 {
    if intent_type == ClassificationType::Statistics { 0.3 } else { 0.7 }
}

/// §4.12: fixed directive table keyed on `type`.
fn directive_for(intent_type: ClassificationType) -> &'static str {
    match intent_type {
        ClassificationType::Requirements => {
            "List the required and optional fields for the relevant entity, grounded in context."
        }
        ClassificationType::Statistics => "Report the requested counts precisely, citing context.",
        ClassificationType::List => "Enumerate the matching entities from context, one per line.",
        ClassificationType::Search | ClassificationType::Question => {
            "Answer based on context. Be concise."
        }
        ClassificationType::Help => "Explain what the assistant can do, grounded in context.",
        _ => "Answer based on context. Be concise.",
    }
}

fn build_prompt(query: &str, context: &str, history: &[Turn], intent_type: ClassificationType) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are a task-management assistant. Use only the provided context.\n\n");
    prompt.push_str("Context:\n");
    prompt.push_str(context);
    prompt.push('\n');

    if !history.is_empty() {
        prompt.push_str("Recent conversation:\n");
        for turn in history.iter().rev().take(2).collect::<Vec<_>>().into_iter().rev() {
            prompt.push_str(&format!("{:?}: {}\n", turn.role, turn.content));
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!("Intent: {}\n", intent_type.as_str()));
    prompt.push_str(&format!("Query: {query}\n"));
    prompt
}

fn check_grounding(answer: &str, docs: &[RetrievedDoc]) -> bool {
    let answer_tokens = tokenize(answer);
    if answer_tokens.is_empty() {
        return false;
    }
    let doc_tokens: HashSet<String> = docs.iter().flat_map(|d| tokenize(&d.text)).collect();
    let overlap = answer_tokens.intersection(&doc_tokens).count();
    (overlap as f64 / answer_tokens.len() as f64) > 0.30
}

fn confidence(docs: &[RetrievedDoc], grounded: bool) -> f64 {
    if docs.is_empty() {
        return 0.0;
    }
    let mean_score: f64 = docs.iter().map(|d| d.score as f64).sum::<f64>() / docs.len() as f64;
    (mean_score + if grounded { 0.2 } else { 0.0 }).min(1.0)
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn doc(text: &str, score: f32) -> RetrievedDoc {
        RetrievedDoc {
            id: 1,
            score,
            text: text.to_string(),
            entity_type: "task".into(),
            entity_id: "1".into(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn grounding_threshold_is_strict() {
        let docs = vec![doc("database optimization task is overdue", 0.8)];
        assert!(check_grounding("the database optimization task is overdue", &docs));
        assert!(!check_grounding("completely unrelated text about weather", &docs));
    }

    #[test]
    fn confidence_caps_at_one_and_zero_with_no_docs() {
        assert_eq!(confidence(&[], true), 0.0);
        let docs = vec![doc("x", 0.95), doc("y", 0.95)];
        assert_eq!(confidence(&docs, true), 1.0);
    }

    #[test]
    fn confidence_adds_bonus_only_when_grounded() {
        let docs = vec![doc("x", 0.5)];
        assert!((confidence(&docs, true) - 0.7).abs() < 1e-9);
        assert!((confidence(&docs, false) - 0.5).abs() < 1e-9);
    }
}
