// src/orchestrator/mod.rs
//! Pipeline Orchestrator (C13, §4.13): request-scoped orchestration of
//! C6-C12, response caching, streaming adaptation. Grounded on the
//! teacher's top-level `memory::service::core_service` request handler,
//! which wires the same leaf components into one per-request flow.

use anyhow::Result;
use once_cell::sync::Lazy;
use rand::seq::IndexedRandom;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::actions::ActionExecutor;
use crate::cache::{TtlCache, digest};
use crate::config::CacheConfig;
use crate::context::ContextProcessor;
use crate::conversation::{ConversationStore, TurnRole};
use crate::generator::Generator;
use crate::intent::{self, ClassificationType, FilterSpec, IntentClassifier, QuickIntent};
use crate::search::{RetrievedDoc, Searcher};
use crate::vectorstore::Filter;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub query: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub processing_ms: u64,
    pub steps_executed: Vec<String>,
    pub retrieved_documents: usize,
    pub query_classification: String,
    pub from_cache: bool,
    pub function_calls: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub answer: String,
    pub sources: Vec<crate::context::Citation>,
    pub confidence: f64,
    pub session_id: String,
    pub metadata: ResponseMetadata,
}

/// What gets cached: everything except `sessionId`/`processingMs`/`fromCache`,
/// which are refreshed on every hit (§4.13.2).
#[derive(Clone)]
struct CachedPayload {
    answer: String,
    sources: Vec<crate::context::Citation>,
    confidence: f64,
    steps_executed: Vec<String>,
    retrieved_documents: usize,
    query_classification: String,
    function_calls: Option<Vec<String>>,
}

static SHORTCUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(get|show|find|list)\s+(all\s+)?(overdue|urgent|done|to\s?do|in\s?progress|task|tasks)\b").unwrap()
});

static GREETING_TEMPLATES: &[&str] = &["Hi there! How can I help?", "Hello! What would you like to do?"];
static GOODBYE_TEMPLATES: &[&str] = &["Goodbye!", "See you next time!"];
static THANK_TEMPLATES: &[&str] = &["You're welcome!", "Happy to help!"];

pub struct Orchestrator {
    conversation: Arc<ConversationStore>,
    classifier: Arc<IntentClassifier>,
    searcher: Arc<Searcher>,
    context: Arc<ContextProcessor>,
    generator: Arc<Generator>,
    actions: Arc<ActionExecutor>,
    response_cache: TtlCache<CachedPayload>,
    cache_key_includes_session: bool,
}

impl Orchestrator {
    pub fn new(
        conversation: Arc<ConversationStore>,
        classifier: Arc<IntentClassifier>,
        searcher: Arc<Searcher>,
        context: Arc<ContextProcessor>,
        generator: Arc<Generator>,
        actions: Arc<ActionExecutor>,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            conversation,
            classifier,
            searcher,
            context,
            generator,
            actions,
            response_cache: TtlCache::new(Duration::from_secs(cache_config.response_cache_ttl_secs)),
            cache_key_includes_session: cache_config.cache_key_includes_session,
        }
    }

    /// §4.13 `Process`.
    pub async fn process(&self, req: ChatRequest) -> Result<ChatResponse> {
        let started = Instant::now();
        let session_id = req.session_id.clone().unwrap_or_else(|| self.conversation.new_session_id());
        let normalized_query = normalize(&req.query);

        let cache_key = self.cache_key(&normalized_query, &session_id);
        if let Some(cached) = self.response_cache.get(&cache_key) {
            return Ok(ChatResponse {
                answer: cached.answer,
                sources: cached.sources,
                confidence: cached.confidence,
                session_id,
                metadata: ResponseMetadata {
                    processing_ms: started.elapsed().as_millis() as u64,
                    steps_executed: cached.steps_executed,
                    retrieved_documents: cached.retrieved_documents,
                    query_classification: cached.query_classification,
                    from_cache: true,
                    function_calls: cached.function_calls,
                },
            });
        }

        let history = self.conversation.get(&session_id).await;
        self.conversation.append(&session_id, TurnRole::User, req.query.clone()).await?;

        let quick = self.classifier.quick_intent(&req.query).await;
        if quick != QuickIntent::None {
            let answer = template_for(quick);
            self.conversation.append(&session_id, TurnRole::Assistant, answer.clone()).await?;
            return Ok(self.finish(
                &session_id,
                answer,
                Vec::new(),
                1.0,
                vec!["quick_intent".into()],
                0,
                quick_label(quick),
                None,
                &cache_key,
                started,
            ));
        }

        let classification = self.classifier.classify(&req.query, &history).await;
        let filters = intent::extract_filters(classification.kind, &classification.entities, &req.query);
        let filter = to_store_filter(&filters);

        match classification.kind {
            ClassificationType::Create | ClassificationType::Update | ClassificationType::Delete => {
                let queries = vec![req.query.clone()];
                let docs = self.searcher.hybrid_search(&queries, &filter).await.unwrap_or_default();
                let result = self.actions.execute(&req.query, &classification, &history, Some(docs.clone())).await?;

                self.conversation.append(&session_id, TurnRole::Assistant, result.answer.clone()).await?;
                let sources: Vec<crate::context::Citation> = Vec::new();
                let function_calls = result.function_call.map(|fc| vec![fc.name]);
                return Ok(self.finish(
                    &session_id,
                    result.answer,
                    sources,
                    1.0,
                    vec!["action_execution".into()],
                    docs.len(),
                    classification.kind.as_str().to_string(),
                    function_calls,
                    &cache_key,
                    started,
                ));
            }
            _ => {}
        }

        // Special branch (§4.13.5): falls through to retrieval with the
        // special filter spec, which already targets synthetic documents.
        let needs_reformulation = matches!(classification.kind, ClassificationType::Question | ClassificationType::Search)
            || req.query.len() > 50
            || !history.is_empty();

        let queries = if needs_reformulation {
            self.classifier.reformulate(&req.query, &history).await
        } else {
            vec![req.query.clone()]
        };

        // Shortcut path (§4.13.5, Glossary).
        if let Some(entity_type) = filters.entity_type.as_ref().and_then(|v| v.as_str()) {
            if SHORTCUT_RE.is_match(&req.query) {
                if let Ok(hits) = self.searcher.vector_search(&req.query, &filter).await {
                    if let Some(top) = hits.first() {
                        if top.score > 0.80 {
                            let top5: Vec<RetrievedDoc> = hits.into_iter().take(5).collect();
                            let context = render_shortcut_context(&top5);
                            let answer = self
                                .generator
                                .generate(&req.query, &context, &[], classification.kind)
                                .await
                                .unwrap_or_else(|_| format!("Here is what matches \"{entity_type}\"."));
                            let processed = self.context.process(top5, &req.query);

                            self.conversation.append(&session_id, TurnRole::Assistant, answer.clone()).await?;
                            return Ok(self.finish(
                                &session_id,
                                answer,
                                processed.sources,
                                self.generator.confidence(&processed.compressed, true),
                                vec!["shortcut_exact_match".into()],
                                processed.compressed.len(),
                                classification.kind.as_str().to_string(),
                                None,
                                &cache_key,
                                started,
                            ));
                        }
                    }
                }
            }
        }

        let docs = self.searcher.hybrid_search(&queries, &filter).await?;
        let processed = self.context.process(docs, &req.query);
        let answer = self
            .generator
            .generate(&req.query, &processed.context, &history, classification.kind)
            .await?;
        let grounded = self.generator.check_grounding(&answer, &processed.compressed);
        let confidence = self.generator.confidence(&processed.compressed, grounded);

        self.conversation.append(&session_id, TurnRole::Assistant, answer.clone()).await?;

        Ok(self.finish(
            &session_id,
            answer,
            processed.sources,
            confidence,
            vec!["hybrid_search".into(), "context_compression".into(), "answer_generation".into()],
            processed.compressed.len(),
            classification.kind.as_str().to_string(),
            None,
            &cache_key,
            started,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        session_id: &str,
        answer: String,
        sources: Vec<crate::context::Citation>,
        confidence: f64,
        steps_executed: Vec<String>,
        retrieved_documents: usize,
        query_classification: String,
        function_calls: Option<Vec<String>>,
        cache_key: &str,
        started: Instant,
    ) -> ChatResponse {
        self.response_cache.insert(
            cache_key.to_string(),
            CachedPayload {
                answer: answer.clone(),
                sources: sources.clone(),
                confidence,
                steps_executed: steps_executed.clone(),
                retrieved_documents,
                query_classification: query_classification.clone(),
                function_calls: function_calls.clone(),
            },
        );

        info!(
            "processed request for session {session_id} in {}ms: {}",
            started.elapsed().as_millis(),
            query_classification
        );

        ChatResponse {
            answer,
            sources,
            confidence,
            session_id: session_id.to_string(),
            metadata: ResponseMetadata {
                processing_ms: started.elapsed().as_millis() as u64,
                steps_executed,
                retrieved_documents,
                query_classification,
                from_cache: false,
                function_calls,
            },
        }
    }

    fn cache_key(&self, normalized_query: &str, session_id: &str) -> String {
        if self.cache_key_includes_session {
            digest(&[normalized_query, session_id])
        } else {
            digest(&[normalized_query])
        }
    }
}

fn quick_label(q: QuickIntent) -> String {
    match q {
        QuickIntent::Greeting => "greeting",
        QuickIntent::Goodbye => "goodbye",
        QuickIntent::Thank => "thank",
        QuickIntent::None => "none",
    }
    .to_string()
}

fn template_for(q: QuickIntent) -> String {
    let mut rng = rand::rng();
    let templates = match q {
        QuickIntent::Greeting => GREETING_TEMPLATES,
        QuickIntent::Goodbye => GOODBYE_TEMPLATES,
        QuickIntent::Thank => THANK_TEMPLATES,
        QuickIntent::None => &["Okay."],
    };
    templates.choose(&mut rng).copied().unwrap_or("Okay.").to_string()
}

fn normalize(query: &str) -> String {
    query.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn to_store_filter(spec: &FilterSpec) -> Filter {
    let mut filter = Filter::new();
    if let Some(value) = &spec.entity_type {
        match value {
            serde_json::Value::String(s) => filter = filter.must_eq("entity_type", s.clone()),
            serde_json::Value::Array(values) => {
                for v in values {
                    if let Some(s) = v.as_str() {
                        filter = filter.should_eq("entity_type", s.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    for (field, value) in &spec.metadata {
        filter = filter.must_eq(format!("metadata.{field}"), value.clone());
    }
    filter
}

fn render_shortcut_context(docs: &[RetrievedDoc]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, d)| format!("[{}] {}: {}\n\n", i + 1, d.entity_type.to_uppercase(), d.text))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    Start,
    Status { message: String },
    Sources { sources: Vec<crate::context::Citation> },
    Chunk { text: String },
    Complete {
        answer: String,
        sources: Vec<crate::context::Citation>,
        confidence: f64,
        metadata: ResponseMetadata,
    },
    Error { message: String },
}

impl Orchestrator {
    /// §4.13 streaming variant: same pipeline through context processing,
    /// emits `start, status, sources, chunk*, complete|error`.
    pub async fn process_stream(&self, req: ChatRequest, mut emit: impl FnMut(StreamEvent)) {
        emit(StreamEvent::Start);
        let started = Instant::now();
        let session_id = req.session_id.clone().unwrap_or_else(|| self.conversation.new_session_id());

        let history = self.conversation.get(&session_id).await;
        if let Err(e) = self.conversation.append(&session_id, TurnRole::User, req.query.clone()).await {
            emit(StreamEvent::Error { message: e.to_string() });
            return;
        }

        emit(StreamEvent::Status { message: "classifying".into() });
        let classification = self.classifier.classify(&req.query, &history).await;
        let filters = intent::extract_filters(classification.kind, &classification.entities, &req.query);
        let filter = to_store_filter(&filters);

        emit(StreamEvent::Status { message: "retrieving".into() });
        let queries = self.classifier.reformulate(&req.query, &history).await;
        let docs = match self.searcher.hybrid_search(&queries, &filter).await {
            Ok(docs) => docs,
            Err(e) => {
                emit(StreamEvent::Error { message: e.to_string() });
                return;
            }
        };
        let processed = self.context.process(docs, &req.query);
        emit(StreamEvent::Sources { sources: processed.sources.clone() });

        let mut streamed = String::new();
        let result = self
            .generator
            .generate_stream(&req.query, &processed.context, &history, classification.kind, &mut |chunk: String| {
                streamed.push_str(&chunk);
                emit(StreamEvent::Chunk { text: chunk });
            })
            .await;

        let answer = match result {
            Ok(text) => text,
            Err(e) => {
                emit(StreamEvent::Error { message: e.to_string() });
                return;
            }
        };

        let grounded = self.generator.check_grounding(&answer, &processed.compressed);
        let confidence = self.generator.confidence(&processed.compressed, grounded);

        if let Err(e) = self.conversation.append(&session_id, TurnRole::Assistant, answer.clone()).await {
            emit(StreamEvent::Error { message: e.to_string() });
            return;
        }

        emit(StreamEvent::Complete {
            answer,
            sources: processed.sources,
            confidence,
            metadata: ResponseMetadata {
                processing_ms: started.elapsed().as_millis() as u64,
                steps_executed: vec!["hybrid_search".into(), "context_compression".into(), "answer_generation".into()],
                retrieved_documents: processed.compressed.len(),
                query_classification: classification.kind.as_str().to_string(),
                from_cache: false,
                function_calls: None,
            },
        });
    }
}
