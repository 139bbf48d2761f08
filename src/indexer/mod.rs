// src/indexer/mod.rs
//! Indexer (C5, §4.5): keeps the vector store in sync with relational
//! entities. Grounded on the teacher's `memory::service::core_service`
//! per-entity index path and `tasks::embedding_cleanup` repair-on-failure
//! idea (folded in as the `IndexStale` ledger per SPEC_FULL §B).

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingClient;
use crate::entities::{EntityKind, EntityService};
use crate::transformer::{self, entity_type_str};
use crate::vectorstore::{Document, Filter, Payload, VectorStore, point_id, point_key};

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub users_indexed: usize,
    pub teams_indexed: usize,
    pub projects_indexed: usize,
    pub tasks_indexed: usize,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// §B: a record of reindex failures, enough to support manual repair.
#[derive(Debug, Clone)]
pub struct StaleEntry {
    pub kind: EntityKind,
    pub id: Uuid,
    pub reason: String,
    pub at: chrono::DateTime<Utc>,
}

pub struct Indexer {
    entities: Arc<dyn EntityService>,
    embeddings: Arc<EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    stale_log: Mutex<Vec<StaleEntry>>,
}

impl Indexer {
    pub fn new(
        entities: Arc<dyn EntityService>,
        embeddings: Arc<EmbeddingClient>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            entities,
            embeddings,
            store,
            stale_log: Mutex::new(Vec::new()),
        }
    }

    /// §4.5 per-entity path: fetch with relations, transform, embed, upsert.
    /// Absence of the root entity is logged and returns `Ok(())`, not an error.
    pub async fn index(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let Some(snapshot) = self.entities.load_snapshot(kind, id).await? else {
            debug!("skip indexing {}/{id}: entity absent", kind.as_str());
            return Ok(());
        };

        let doc = transformer::transform(&snapshot, Utc::now());
        let vector = self.embeddings.embed(&doc.text).await?;

        let mut payload: Payload = Payload::new();
        payload.insert("entity_type".into(), doc.entity_type.into());
        payload.insert("entity_id".into(), doc.entity_id.clone().into());
        payload.insert("text".into(), doc.text.clone().into());
        payload.insert("indexed_at".into(), Utc::now().to_rfc3339().into());
        payload.insert("point_id".into(), point_key(kind.as_str(), &doc.entity_id).into());
        payload.insert("metadata".into(), serde_json::Value::Object(doc.metadata));
        payload.insert(
            "relationships".into(),
            serde_json::Value::Object(
                doc.relationships.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        );

        let point = Document {
            id: point_id(kind.as_str(), &doc.entity_id),
            vector,
            payload,
        };

        self.store.upsert(point).await
    }

    pub async fn index_user(&self, id: Uuid) -> Result<()> {
        self.index(EntityKind::User, id).await
    }
    pub async fn index_team(&self, id: Uuid) -> Result<()> {
        self.index(EntityKind::Team, id).await
    }
    pub async fn index_project(&self, id: Uuid) -> Result<()> {
        self.index(EntityKind::Project, id).await
    }
    pub async fn index_task(&self, id: Uuid) -> Result<()> {
        self.index(EntityKind::Task, id).await
    }

    pub async fn delete(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        let pid = point_id(kind.as_str(), &id.to_string());
        self.store.delete(pid).await
    }

    /// §4.5/L1/L2: delete-then-index, tolerant of a missing prior document.
    pub async fn reindex(&self, kind: EntityKind, id: Uuid) -> Result<()> {
        if let Err(e) = self.delete(kind, id).await {
            debug!("reindex: delete step failed (tolerated): {e}");
        }

        match self.index(kind, id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("reindex failed for {}/{id}: {e}", kind.as_str());
                self.stale_log.lock().push(StaleEntry {
                    kind,
                    id,
                    reason: e.to_string(),
                    at: Utc::now(),
                });
                Err(e)
            }
        }
    }

    pub fn stale_entries(&self) -> Vec<StaleEntry> {
        self.stale_log.lock().clone()
    }

    /// §4.5 `IndexAll`: per-entity failures are collected and counted, not
    /// propagated.
    pub async fn index_all(&self) -> Result<IndexStats> {
        let started = std::time::Instant::now();
        let mut stats = IndexStats::default();

        for kind in [
            EntityKind::User,
            EntityKind::Team,
            EntityKind::Project,
            EntityKind::Task,
        ] {
            let entries = self.entities.list_all(kind).await.unwrap_or_default();
            for entry in entries {
                let Some(id) = entry.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse::<Uuid>().ok())
                else {
                    stats.errors.push(format!("{}: missing/invalid id field", kind.as_str()));
                    continue;
                };
                match self.index(kind, id).await {
                    Ok(()) => match kind {
                        EntityKind::User => stats.users_indexed += 1,
                        EntityKind::Team => stats.teams_indexed += 1,
                        EntityKind::Project => stats.projects_indexed += 1,
                        EntityKind::Task => stats.tasks_indexed += 1,
                    },
                    Err(e) => stats.errors.push(format!("{}/{id}: {e}", kind.as_str())),
                }
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "index_all complete: {} users, {} teams, {} projects, {} tasks, {} errors in {}ms",
            stats.users_indexed,
            stats.teams_indexed,
            stats.projects_indexed,
            stats.tasks_indexed,
            stats.errors.len(),
            stats.duration_ms
        );
        Ok(stats)
    }

    /// §4.5 synthetic `system_info` document describing required/optional
    /// fields per entity kind, used by the `help`/`requirements` intents.
    pub async fn index_system_info(&self) -> Result<()> {
        let text = "System info: User requires name, email, password; optional role, teamId. \
            Team requires name, projectId, ownerId. Project requires name; optional description. \
            Task requires title; optional description, assignedTo, status, deadline."
            .to_string();
        self.upsert_synthetic("system_info", "system_info", &text).await
    }

    /// §4.5 synthetic `statistics` document with aggregate counts.
    pub async fn index_statistics(&self) -> Result<()> {
        let mut counts = Vec::new();
        for kind in [
            EntityKind::User,
            EntityKind::Team,
            EntityKind::Project,
            EntityKind::Task,
        ] {
            let count = self.entities.list_all(kind).await.map(|v| v.len()).unwrap_or(0);
            counts.push(format!("{} {}(s)", count, kind.as_str()));
        }
        let text = format!("Statistics: {}.", counts.join(", "));
        self.upsert_synthetic("statistics", "statistics", &text).await
    }

    /// §4.13.5/§4.7.5: the special filter the Orchestrator/Intent Classifier
    /// build for `statistics`/`help`/`requirements` queries targets
    /// `metadata.type`, so these synthetic documents must carry that field
    /// to be reachable by it.
    async fn upsert_synthetic(&self, entity_type: &str, entity_id: &str, text: &str) -> Result<()> {
        let vector = self.embeddings.embed(text).await?;
        let mut payload: Payload = Payload::new();
        payload.insert("entity_type".into(), entity_type.into());
        payload.insert("entity_id".into(), entity_id.into());
        payload.insert("text".into(), text.into());
        payload.insert("indexed_at".into(), Utc::now().to_rfc3339().into());
        payload.insert("point_id".into(), point_key(entity_type, entity_id).into());
        payload.insert("metadata".into(), serde_json::json!({ "type": entity_type }));

        let point = Document {
            id: point_id(entity_type, entity_id),
            vector,
            payload,
        };
        self.store.upsert(point).await
    }
}

/// §4.2/§4.5 convenience: a filter matching one entity kind, used by
/// callers that only need `entity_type = kind`.
pub fn entity_type_filter(kind: EntityKind) -> Filter {
    Filter::new().must_eq("entity_type", entity_type_str(kind))
}
