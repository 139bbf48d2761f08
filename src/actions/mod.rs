// src/actions/mod.rs
//! Action Executor (C11, §4.11): function-call parameter extraction, id
//! resolution, CRUD dispatch, post-write reindex. Grounded on the teacher's
//! `llm::tool_calling` parameter-extraction prompt shape and
//! `memory::service::core_service` dispatch-then-reindex sequencing.

use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::conversation::Turn;
use crate::entities::{EntityKind, EntityService, TaskStatus};
use crate::indexer::Indexer;
use crate::intent::{Classification, ClassificationType, EntityName};
use crate::llm::{CompletionOptions, LlmClient};
use crate::resolver::EntityResolver;
use crate::search::{RetrievedDoc, Searcher};
use crate::vectorstore::Filter;

#[derive(Debug, Clone)]
pub struct ActionResult {
    pub answer: String,
    pub sources: Vec<RetrievedDoc>,
    pub function_call: Option<FunctionCall>,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// §4.11.4: parameters that name an ID-bearing entity and the kind to
/// resolve them against.
const ID_PARAMS: &[(&str, EntityKind)] = &[
    ("taskId", EntityKind::Task),
    ("userId", EntityKind::User),
    ("assignedTo", EntityKind::User),
    ("teamId", EntityKind::Team),
    ("ownerId", EntityKind::Team),
    ("projectId", EntityKind::Project),
];

pub struct ActionExecutor {
    llm: Arc<dyn LlmClient>,
    searcher: Arc<Searcher>,
    resolver: Arc<EntityResolver>,
    entities: Arc<dyn EntityService>,
    indexer: Arc<Indexer>,
}

impl ActionExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        searcher: Arc<Searcher>,
        resolver: Arc<EntityResolver>,
        entities: Arc<dyn EntityService>,
        indexer: Arc<Indexer>,
    ) -> Self {
        Self { llm, searcher, resolver, entities, indexer }
    }

    /// §4.11 `Execute`.
    pub async fn execute(
        &self,
        query: &str,
        classification: &Classification,
        history: &[Turn],
        retrieved_docs: Option<Vec<RetrievedDoc>>,
    ) -> Result<ActionResult> {
        let base_entity = base_entity_for(classification.kind, &classification.entities);

        let docs = match retrieved_docs {
            Some(docs) if !docs.is_empty() => docs,
            _ => self.retrieve_context(query, classification.kind, base_entity).await,
        };

        let function_name = function_name_for(classification.kind, base_entity);

        let prompt = build_extraction_prompt(&function_name, query, history, &docs);
        let opts = CompletionOptions {
            model: None,
            temperature: Some(0.1),
            max_tokens: Some(250),
            system: Some(
                "Extract a single function call as JSON: {\"name\": \"...\", \"arguments\": {...}}. \
                 Use only the fields named in the signature."
                    .to_string(),
            ),
        };

        let raw = self.llm.complete(&prompt, &opts).await?;
        let Some(mut arguments) = parse_function_call(&raw, &function_name) else {
            return Ok(ActionResult {
                answer: "I couldn't determine the details of that request. Could you rephrase it?".into(),
                sources: docs,
                function_call: None,
            });
        };

        // §8.3: a missing required argument (the non-`?` params in the
        // signature) short-circuits before any resolution or dispatch.
        if let Some(missing) = first_missing_required_field(&function_name, &arguments) {
            return Ok(ActionResult {
                answer: format!("Missing required field: {missing}"),
                sources: docs,
                function_call: None,
            });
        }

        // §4.11.4: resolve every ID-bearing argument.
        let mut resolved_ids: BTreeMap<String, Uuid> = BTreeMap::new();
        for (param, kind) in ID_PARAMS {
            let Some(raw_value) = arguments.get(*param).and_then(|v| v.as_str()).map(str::to_string) else {
                continue;
            };
            match self.resolver.resolve(*kind, &raw_value).await {
                Some(id) => {
                    arguments.insert((*param).to_string(), Value::String(id.to_string()));
                    resolved_ids.insert((*param).to_string(), id);
                }
                None => {
                    return Ok(ActionResult {
                        answer: format!(
                            "I couldn't find a {} matching \"{raw_value}\". {}",
                            kind.as_str(),
                            echo_extracted(&arguments)
                        ),
                        sources: docs,
                        function_call: None,
                    });
                }
            }
        }

        if let Some(status_raw) = arguments.get("status").and_then(|v| v.as_str()).map(str::to_string) {
            if let Some(normalized) = TaskStatus::parse_loose(&status_raw) {
                arguments.insert("status".into(), Value::String(normalized.as_str().to_string()));
            }
        }

        match self.dispatch(classification.kind, base_entity, &arguments, &resolved_ids).await {
            Ok(answer) => Ok(ActionResult {
                answer,
                sources: docs,
                function_call: Some(FunctionCall { name: function_name, arguments }),
            }),
            Err(e) => Ok(ActionResult {
                answer: format!("Sorry, that didn't go through: {e}. {}", echo_extracted(&arguments)),
                sources: docs,
                function_call: Some(FunctionCall { name: function_name, arguments }),
            }),
        }
    }

    /// §4.11.1 context retrieval: force base entity, plus `user` for
    /// create/update (assignment resolution); one parallel task per kind.
    async fn retrieve_context(
        &self,
        query: &str,
        kind: ClassificationType,
        base_entity: EntityName,
    ) -> Vec<RetrievedDoc> {
        let mut kinds = vec![base_entity];
        if matches!(kind, ClassificationType::Create | ClassificationType::Update) && base_entity != EntityName::User {
            kinds.push(EntityName::User);
        }
        kinds.dedup();

        let searches = kinds.into_iter().map(|k| {
            let filter = Filter::new().must_eq("entity_type", k.as_str());
            async move { self.searcher.vector_search(query, &filter).await.unwrap_or_default() }
        });

        let mut results = futures::future::join_all(searches).await;
        let mut combined = Vec::new();
        for docs in results.drain(..) {
            combined.extend(docs.into_iter().take(5));
        }
        combined
    }

    async fn dispatch(
        &self,
        kind: ClassificationType,
        base_entity: EntityName,
        arguments: &Map<String, Value>,
        resolved_ids: &BTreeMap<String, Uuid>,
    ) -> Result<String> {
        let entity_kind = entity_kind_for(base_entity);

        match kind {
            ClassificationType::Create => {
                let created = self.entities.create(entity_kind, Value::Object(arguments.clone())).await?;
                let id = created.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse::<Uuid>().ok());
                if let Some(id) = id {
                    if let Err(e) = self.indexer.index(entity_kind, id).await {
                        warn!("post-create reindex failed for {}/{id}: {e}", entity_kind.as_str());
                    }
                }
                Ok(success_message("create", entity_kind, arguments))
            }
            ClassificationType::Update => {
                let id_param = id_param_for(entity_kind);
                let id = *resolved_ids.get(id_param).ok_or_else(|| anyhow::anyhow!("missing {id_param}"))?;
                let mut patch = arguments.clone();
                patch.remove(id_param);
                self.entities.update(entity_kind, id, Value::Object(patch)).await?;
                if let Err(e) = self.indexer.reindex(entity_kind, id).await {
                    warn!("post-update reindex failed for {}/{id}: {e}", entity_kind.as_str());
                }
                Ok(success_message("update", entity_kind, arguments))
            }
            ClassificationType::Delete => {
                let id_param = id_param_for(entity_kind);
                let id = *resolved_ids.get(id_param).ok_or_else(|| anyhow::anyhow!("missing {id_param}"))?;
                self.entities.remove(entity_kind, id).await?;
                if let Err(e) = self.indexer.delete(entity_kind, id).await {
                    warn!("post-delete cleanup failed for {}/{id}: {e}", entity_kind.as_str());
                }
                Ok(success_message("delete", entity_kind, arguments))
            }
            _ => anyhow::bail!("action executor invoked for non-write intent"),
        }
    }
}

fn base_entity_for(kind: ClassificationType, entities: &[EntityName]) -> EntityName {
    entities.first().copied().unwrap_or(match kind {
        ClassificationType::Create | ClassificationType::Update | ClassificationType::Delete => EntityName::Task,
        _ => EntityName::Task,
    })
}

fn entity_kind_for(name: EntityName) -> EntityKind {
    match name {
        EntityName::User => EntityKind::User,
        EntityName::Task => EntityKind::Task,
        EntityName::Team => EntityKind::Team,
        EntityName::Project => EntityKind::Project,
    }
}

fn id_param_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "taskId",
        EntityKind::User => "userId",
        EntityKind::Team => "teamId",
        EntityKind::Project => "projectId",
    }
}

/// §4.11.2 recognised functions (fixed table).
fn function_name_for(kind: ClassificationType, entity: EntityName) -> String {
    let verb = match kind {
        ClassificationType::Create => "create",
        ClassificationType::Update => "update",
        ClassificationType::Delete => "delete",
        _ => "create",
    };
    format!("{verb}_{}", entity.as_str())
}

fn function_signature(name: &str) -> &'static str {
    match name {
        "create_task" => "create_task(title, description?, assignedTo?, status?, deadline?)",
        "update_task" => "update_task(taskId, title?, description?, status?, assignedTo?, deadline?)",
        "delete_task" => "delete_task(taskId)",
        "create_user" => "create_user(name, email, password, role?, teamId?)",
        "update_user" => "update_user(userId, name?, email?, password?, role?, teamId?)",
        "delete_user" => "delete_user(userId)",
        "create_team" => "create_team(name, projectId, ownerId)",
        "update_team" => "update_team(teamId, name?, projectId?, ownerId?)",
        "delete_team" => "delete_team(teamId)",
        "create_project" => "create_project(name, description?)",
        "update_project" => "update_project(projectId, name?, description?)",
        "delete_project" => "delete_project(projectId)",
        _ => "",
    }
}

/// §4.11.2: the non-`?` params in a function's signature are required.
fn required_params(function_name: &str) -> Vec<&'static str> {
    function_signature(function_name)
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .map(|params| {
            params
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty() && !p.ends_with('?'))
                .collect()
        })
        .unwrap_or_default()
}

/// §8.3: the first required param absent from, or null in, `arguments`.
fn first_missing_required_field(function_name: &str, arguments: &Map<String, Value>) -> Option<&'static str> {
    required_params(function_name)
        .into_iter()
        .find(|param| !arguments.get(*param).is_some_and(|v| !v.is_null()))
}

fn build_extraction_prompt(function_name: &str, query: &str, history: &[Turn], docs: &[RetrievedDoc]) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Function: {}\n", function_signature(function_name)));

    prompt.push_str("Retrieved entities:\n");
    for doc in docs {
        prompt.push_str(&format!(
            "- {}: id={}, name={}\n",
            doc.entity_type,
            doc.entity_id,
            doc.metadata.get("user_name").or(doc.metadata.get("task_status")).map(|v| v.to_string()).unwrap_or_default()
        ));
    }

    if !history.is_empty() {
        prompt.push_str("Recent turns:\n");
        for turn in history.iter().rev().take(4).collect::<Vec<_>>().into_iter().rev() {
            prompt.push_str(&format!("{:?}: {}\n", turn.role, turn.content));
        }
    }

    prompt.push_str(&format!("Query: {query}\n"));
    prompt
}

/// §4.11.3: parse the first balanced JSON object, tolerating trailing braces.
fn parse_function_call(raw: &str, expected_name: &str) -> Option<Map<String, Value>> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut end = None;
    for (offset, ch) in raw[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end = end?;
    let value: Value = serde_json::from_str(&raw[start..end]).ok()?;
    let obj = value.as_object()?;
    let _ = obj.get("name").and_then(|v| v.as_str()).unwrap_or(expected_name);
    obj.get("arguments")?.as_object().cloned()
}

/// §7: echo all parameters extracted so far, verbatim, bracketed.
fn echo_extracted(arguments: &Map<String, Value>) -> String {
    if arguments.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = arguments.iter().map(|(k, v)| format!("{k}=\"{}\"", value_display(v))).collect();
    format!("[Extracted so far: {}]", pairs.join(", "))
}

fn value_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// §4.11.7: canonical success message per (action, entityKind).
fn success_message(action: &str, kind: EntityKind, arguments: &Map<String, Value>) -> String {
    let label = match kind {
        EntityKind::Task => arguments.get("title").and_then(|v| v.as_str()).unwrap_or("task"),
        EntityKind::User => arguments.get("name").and_then(|v| v.as_str()).unwrap_or("user"),
        EntityKind::Team => arguments.get("name").and_then(|v| v.as_str()).unwrap_or("team"),
        EntityKind::Project => arguments.get("name").and_then(|v| v.as_str()).unwrap_or("project"),
    };
    match action {
        "create" => format!("Created {} \"{label}\".", kind.as_str()),
        "update" => format!("Updated {} \"{label}\".", kind.as_str()),
        "delete" => format!("Deleted {} \"{label}\".", kind.as_str()),
        _ => format!("Done: {} {}.", action, kind.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_name_follows_fixed_table() {
        assert_eq!(function_name_for(ClassificationType::Create, EntityName::Task), "create_task");
        assert_eq!(function_name_for(ClassificationType::Update, EntityName::User), "update_user");
    }

    #[test]
    fn parse_function_call_tolerates_trailing_brace() {
        let raw = r#"{"name": "create_task", "arguments": {"title": "Fix Login"}}}"#;
        let args = parse_function_call(raw, "create_task").unwrap();
        assert_eq!(args.get("title").unwrap(), "Fix Login");
    }

    #[test]
    fn echo_extracted_formats_bracketed_pairs() {
        let mut args = Map::new();
        args.insert("title".into(), Value::String("Fix Login".into()));
        let echoed = echo_extracted(&args);
        assert!(echoed.contains("title=\"Fix Login\""));
        assert!(echoed.starts_with("[Extracted so far:"));
    }

    #[test]
    fn status_normalisation_is_case_and_space_tolerant() {
        assert_eq!(TaskStatus::parse_loose("In Progress"), Some(TaskStatus::InProgress));
        assert_eq!(TaskStatus::parse_loose("completed"), Some(TaskStatus::Done));
    }

    #[test]
    fn required_params_excludes_optional_fields() {
        assert_eq!(required_params("create_task"), vec!["title"]);
        assert_eq!(required_params("create_team"), vec!["name", "projectId", "ownerId"]);
        assert_eq!(required_params("delete_task"), vec!["taskId"]);
    }

    #[test]
    fn missing_required_field_is_detected_even_when_present_but_null() {
        let empty = Map::new();
        assert_eq!(first_missing_required_field("create_task", &empty), Some("title"));

        let mut with_null = Map::new();
        with_null.insert("title".into(), Value::Null);
        assert_eq!(first_missing_required_field("create_task", &with_null), Some("title"));

        let mut complete = Map::new();
        complete.insert("title".into(), Value::String("Fix Login".into()));
        assert_eq!(first_missing_required_field("create_task", &complete), None);
    }
}
