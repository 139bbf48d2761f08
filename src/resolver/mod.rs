// src/resolver/mod.rs
//! Entity Resolver (C10, §4.10): natural-language name or UUID to canonical
//! entity id. Grounded on the teacher's entity lookup helpers in
//! `memory::features::recall_engine` that try exact-then-fuzzy matches
//! before giving up, generalised across the four entity kinds.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::service::find_one_or_none;
use crate::entities::{EntityKind, EntityService};

pub struct EntityResolver {
    entities: Arc<dyn EntityService>,
}

impl EntityResolver {
    pub fn new(entities: Arc<dyn EntityService>) -> Self {
        Self { entities }
    }

    /// §4.10.1-3 `Resolve`: UUID-shaped input is verified by existence read;
    /// otherwise falls back to exact name match (strict path) except for
    /// users, whose fuzzy variant additionally tries prefix/substring/email.
    pub async fn resolve(&self, kind: EntityKind, name_or_id: &str) -> Option<Uuid> {
        if let Ok(id) = name_or_id.trim().parse::<Uuid>() {
            return find_one_or_none(self.entities.as_ref(), kind, id).await.map(|_| id);
        }

        let entities = self.entities.list_all(kind).await.ok()?;
        let name_field = name_field_for(kind);
        let needle = name_or_id.trim().to_lowercase();

        if kind == EntityKind::User {
            return resolve_user_fuzzy(&entities, &needle);
        }

        entities
            .iter()
            .find(|v| field_eq_lower(v, name_field, &needle))
            .and_then(extract_id)
    }

    /// §4.10 `ResolveByType`: dispatches by the caller-declared kind.
    pub async fn resolve_by_type(&self, kind: EntityKind, name_or_id: &str) -> Option<Uuid> {
        self.resolve(kind, name_or_id).await
    }

    /// §4.10 `ResolveMultiple`: independent entities resolved in parallel
    /// (§5), returned as a map keyed by the caller-supplied `(kind, input)`.
    pub async fn resolve_multiple(
        &self,
        queries: Vec<(EntityKind, String)>,
    ) -> HashMap<(EntityKind, String), Option<Uuid>> {
        let futures = queries.iter().map(|(kind, text)| self.resolve(*kind, text));
        let results = join_all(futures).await;
        queries.into_iter().zip(results).collect()
    }
}

fn name_field_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::User => "name",
        EntityKind::Team => "name",
        EntityKind::Project => "name",
        EntityKind::Task => "title",
    }
}

fn field_eq_lower(value: &Value, field: &str, needle: &str) -> bool {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_lowercase() == needle)
        .unwrap_or(false)
}

fn extract_id(value: &Value) -> Option<Uuid> {
    value.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

/// §4.10.3 fuzzy variant (users only): exact, then prefix, then substring,
/// then `email.split('@')[0]` substring.
fn resolve_user_fuzzy(entities: &[Value], needle: &str) -> Option<Uuid> {
    if let Some(hit) = entities.iter().find(|v| field_eq_lower(v, "name", needle)) {
        return extract_id(hit);
    }
    if let Some(hit) = entities.iter().find(|v| {
        v.get("name")
            .and_then(|n| n.as_str())
            .map(|n| n.to_lowercase().starts_with(needle))
            .unwrap_or(false)
    }) {
        return extract_id(hit);
    }
    if let Some(hit) = entities.iter().find(|v| {
        v.get("name")
            .and_then(|n| n.as_str())
            .map(|n| n.to_lowercase().contains(needle))
            .unwrap_or(false)
    }) {
        return extract_id(hit);
    }
    entities
        .iter()
        .find(|v| {
            v.get("email")
                .and_then(|e| e.as_str())
                .and_then(|e| e.split('@').next())
                .map(|local| local.to_lowercase().contains(needle))
                .unwrap_or(false)
        })
        .and_then(extract_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::service::PagedResult;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeEntityService {
        users: Vec<Value>,
    }

    #[async_trait]
    impl EntityService for FakeEntityService {
        async fn find_one(&self, kind: EntityKind, id: Uuid) -> anyhow::Result<Option<Value>> {
            if kind != EntityKind::User {
                return Ok(None);
            }
            Ok(self.users.iter().find(|u| extract_id(u) == Some(id)).cloned())
        }
        async fn find_all(
            &self,
            kind: EntityKind,
            _page: u32,
            _page_size: u32,
            _search: Option<&str>,
        ) -> anyhow::Result<PagedResult> {
            let data = if kind == EntityKind::User { self.users.clone() } else { Vec::new() };
            let len = data.len() as u64;
            Ok(PagedResult { data, total: len, page: 1, limit: 1000, total_pages: 1 })
        }
        async fn create(&self, _kind: EntityKind, _dto: Value) -> anyhow::Result<Value> {
            unreachable!()
        }
        async fn update(&self, _kind: EntityKind, _id: Uuid, _patch: Value) -> anyhow::Result<Value> {
            unreachable!()
        }
        async fn remove(&self, _kind: EntityKind, _id: Uuid) -> anyhow::Result<()> {
            unreachable!()
        }
        async fn load_snapshot(
            &self,
            _kind: EntityKind,
            _id: Uuid,
        ) -> anyhow::Result<Option<crate::entities::EntitySnapshot>> {
            unreachable!()
        }
    }

    fn service() -> FakeEntityService {
        FakeEntityService {
            users: vec![json!({
                "id": Uuid::new_v4().to_string(),
                "name": "Youssef Mohamed",
                "email": "youssef.mohamed@example.com",
            })],
        }
    }

    #[tokio::test]
    async fn resolves_exact_name_case_insensitively() {
        let svc = service();
        let expected = extract_id(&svc.users[0]).unwrap();
        let resolver = EntityResolver::new(Arc::new(svc));
        let resolved = resolver.resolve(EntityKind::User, "youssef mohamed").await;
        assert_eq!(resolved, Some(expected));
    }

    #[tokio::test]
    async fn resolves_by_email_prefix_substring_fallback() {
        let svc = service();
        let expected = extract_id(&svc.users[0]).unwrap();
        let resolver = EntityResolver::new(Arc::new(svc));
        let resolved = resolver.resolve(EntityKind::User, "youssef.moham").await;
        assert_eq!(resolved, Some(expected));
    }

    #[tokio::test]
    async fn unresolvable_name_returns_none() {
        let resolver = EntityResolver::new(Arc::new(service()));
        assert_eq!(resolver.resolve(EntityKind::User, "nobody here").await, None);
    }
}
