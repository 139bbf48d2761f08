// src/intent/mod.rs
//! Intent Classifier (C7, §4.7): regex-then-LLM quick intents, typed
//! classification, pure intent derivation, query reformulation, filter
//! extraction. Grounded on the teacher's `memory::features::recall_engine`
//! query-understanding prompts, generalised to the task-manager's five
//! classifier operations.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::conversation::Turn;
use crate::llm::{CompletionOptions, LlmClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickIntent {
    Greeting,
    Goodbye,
    Thank,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationType {
    Create,
    Update,
    Delete,
    Question,
    Search,
    List,
    Statistics,
    Help,
    Requirements,
}

impl ClassificationType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            "question" => Some(Self::Question),
            "search" => Some(Self::Search),
            "list" => Some(Self::List),
            "statistics" => Some(Self::Statistics),
            "help" => Some(Self::Help),
            "requirements" => Some(Self::Requirements),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Question => "question",
            Self::Search => "search",
            Self::List => "list",
            Self::Statistics => "statistics",
            Self::Help => "help",
            Self::Requirements => "requirements",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub kind: ClassificationType,
    pub entities: Vec<EntityName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityName {
    User,
    Task,
    Team,
    Project,
}

impl EntityName {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "task" => Some(Self::Task),
            "team" => Some(Self::Team),
            "project" => Some(Self::Project),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Task => "task",
            Self::Team => "team",
            Self::Project => "project",
        }
    }
}

static CRUD_VERBS: &[&str] = &[
    "create", "add", "new", "update", "edit", "change", "modify", "delete", "remove", "assign",
];

static GREETING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening))\b").unwrap());
static GOODBYE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(bye|goodbye|see you|farewell)\b").unwrap());
static THANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(thanks|thank you|thx)\b").unwrap());

static PERSON_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap());

static OVERDUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\boverdue\b").unwrap());
static URGENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\burgent\b").unwrap());
static STATUS_TODO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bto[\s-]?do\b").unwrap());
static STATUS_PROGRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bin[\s-]?progress\b").unwrap());
static STATUS_DONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(done|completed)\b").unwrap());

/// A flat filter spec; string-valued for equality, or a list for OR
/// semantics over `entity_type` per §4.7.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    pub entity_type: Option<Value>,
    pub metadata: BTreeMap<String, Value>,
}

pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// §4.7.1 `QuickIntent`.
    pub async fn quick_intent(&self, query: &str) -> QuickIntent {
        if GREETING_RE.is_match(query) {
            return QuickIntent::Greeting;
        }
        if GOODBYE_RE.is_match(query) {
            return QuickIntent::Goodbye;
        }
        if THANK_RE.is_match(query) {
            return QuickIntent::Thank;
        }

        if query.len() >= 50 || contains_crud_verb(query) {
            return QuickIntent::None;
        }

        let opts = CompletionOptions {
            model: None,
            temperature: Some(0.0),
            max_tokens: Some(4),
            system: Some(
                "Reply with exactly one word from: greeting, goodbye, thank, none.".to_string(),
            ),
        };
        match self.llm.complete(query, &opts).await {
            Ok(text) => match text.trim().to_lowercase().as_str() {
                "greeting" => QuickIntent::Greeting,
                "goodbye" => QuickIntent::Goodbye,
                "thank" => QuickIntent::Thank,
                _ => QuickIntent::None,
            },
            // §7: quick-intent LLM failures are silent.
            Err(_) => QuickIntent::None,
        }
    }

    /// §4.7.2 `Classify`.
    pub async fn classify(&self, query: &str, history: &[Turn]) -> Classification {
        let prompt = build_classification_prompt(query, history);
        let opts = CompletionOptions {
            model: None,
            temperature: Some(0.1),
            max_tokens: Some(200),
            system: Some(
                "Classify the user's request. Distinguish COMMANDS (create/update/delete \
                 an entity, e.g. \"assign\") from QUESTIONS (e.g. \"when was X created\"). \
                 Include \"user\" in entities whenever a personal name appears. Respond with \
                 JSON only: {\"type\": \"...\", \"entities\": [...]}."
                    .to_string(),
            ),
        };

        let fallback = Classification {
            kind: ClassificationType::Question,
            entities: Vec::new(),
        };

        let Ok(raw) = self.llm.complete(&prompt, &opts).await else {
            return fallback;
        };
        parse_classification(&raw).unwrap_or(fallback)
    }

    /// §4.7.4 `Reformulate`.
    pub async fn reformulate(&self, query: &str, history: &[Turn]) -> Vec<String> {
        if query.len() < 15 {
            return vec![query.to_string()];
        }

        let history_block = render_recent(history, 3);
        let prompt = format!(
            "Conversation so far:\n{history_block}\nQuery: {query}\n\nGenerate up to 4 short \
             search phrase variants (2-5 words each), one per line, retaining entity names and \
             expanding abbreviations where useful. No numbering."
        );
        let opts = CompletionOptions {
            model: None,
            temperature: Some(0.2),
            max_tokens: Some(120),
            system: None,
        };

        let mut queries = vec![query.to_string()];
        if let Ok(raw) = self.llm.complete(&prompt, &opts).await {
            for line in raw.lines() {
                let cleaned = line.trim().trim_start_matches(['-', '*', '•']).trim();
                if cleaned.is_empty() || cleaned.eq_ignore_ascii_case(query) {
                    continue;
                }
                queries.push(cleaned.to_string());
                if queries.len() >= 5 {
                    break;
                }
            }
        }
        queries
    }
}

/// §4.7.3 `DeriveIntent`: pure (L3).
pub fn derive_intent(kind: ClassificationType, entities: &[EntityName]) -> String {
    let primary = entities.first();
    match kind {
        ClassificationType::Create | ClassificationType::Update | ClassificationType::Delete => {
            primary.map(|e| format!("{}_management", e.as_str())).unwrap_or_else(|| "general".into())
        }
        ClassificationType::Question
        | ClassificationType::Search
        | ClassificationType::List
        | ClassificationType::Statistics => {
            primary.map(|e| format!("{}_info", e.as_str())).unwrap_or_else(|| "general".into())
        }
        ClassificationType::Help | ClassificationType::Requirements => "general".to_string(),
    }
}

/// §4.7.5 `ExtractFilters`. Set-valued outputs (the `entity_type` list
/// branch) are order-independent by construction (L4): entities are folded
/// into a `serde_json::Value::Array` without regard to slice ordering, and
/// equal sets produce an equal JSON value regardless of input order.
pub fn extract_filters(kind: ClassificationType, entities: &[EntityName], query: &str) -> FilterSpec {
    let mut spec = FilterSpec::default();

    match kind {
        ClassificationType::Statistics => {
            spec.metadata.insert("type".into(), Value::String("statistics".into()));
        }
        ClassificationType::Help | ClassificationType::Requirements => {
            spec.metadata.insert("type".into(), Value::String("system_info".into()));
        }
        _ => {
            if entities.len() == 1 {
                spec.entity_type = Some(Value::String(entities[0].as_str().to_string()));
            } else if entities.len() > 1 {
                let mut names: Vec<&str> = entities.iter().map(|e| e.as_str()).collect();
                names.sort_unstable();
                names.dedup();
                spec.entity_type = Some(Value::Array(names.into_iter().map(|n| Value::String(n.into())).collect()));
            }
        }
    }

    if OVERDUE_RE.is_match(query) {
        spec.metadata.insert("is_overdue".into(), Value::Bool(true));
    }
    if URGENT_RE.is_match(query) {
        spec.metadata.insert("is_urgent".into(), Value::Bool(true));
    }
    if STATUS_DONE_RE.is_match(query) {
        spec.metadata.insert("task_status".into(), Value::String("done".into()));
    } else if STATUS_PROGRESS_RE.is_match(query) {
        spec.metadata.insert("task_status".into(), Value::String("in_progress".into()));
    } else if STATUS_TODO_RE.is_match(query) {
        spec.metadata.insert("task_status".into(), Value::String("todo".into()));
    }

    spec
}

fn contains_crud_verb(query: &str) -> bool {
    let lower = query.to_lowercase();
    CRUD_VERBS.iter().any(|v| lower.contains(v))
}

fn render_recent(history: &[Turn], n: usize) -> String {
    history
        .iter()
        .rev()
        .take(n)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|t| format!("{:?}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_classification_prompt(query: &str, history: &[Turn]) -> String {
    let has_name = PERSON_NAME_RE.is_match(query);
    let mut prompt = String::new();
    if !history.is_empty() {
        prompt.push_str("History (for coreference):\n");
        prompt.push_str(&render_recent(history, 3));
        prompt.push('\n');
    }
    prompt.push_str(&format!("Query: {query}\n"));
    if has_name {
        prompt.push_str("Note: the query contains a personal name.\n");
    }
    prompt
}

/// Tolerates surrounding prose by extracting the first balanced `{...}`.
fn parse_classification(raw: &str) -> Option<Classification> {
    let json_slice = extract_first_json_object(raw)?;
    let value: Value = serde_json::from_str(json_slice).ok()?;
    let kind = ClassificationType::parse(value.get("type")?.as_str()?)?;
    let entities = value
        .get("entities")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).filter_map(EntityName::parse).collect())
        .unwrap_or_default();
    Some(Classification { kind, entities })
}

fn extract_first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    for (offset, ch) in raw[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
