// src/vectorstore/mod.rs
//! Vector Store Client (C2, §4.2): upsert/search/scroll/delete of
//! `(id, vector, payload)` with a small filter language. The production
//! backend is Qdrant (`qdrant.rs`), grounded on the teacher's
//! `memory::storage::qdrant::multi_store::QdrantMultiStore`.

pub mod qdrant;

use serde_json::Value;
use std::collections::BTreeMap;

pub type Payload = BTreeMap<String, Value>;

/// §4.2 filter language: `must` (AND) and `should` (OR) lists of
/// `(field, equals value)` predicates.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub must: Vec<(String, Value)>,
    pub should: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push((field.into(), value.into()));
        self
    }

    pub fn should_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.should.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.should.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: u64,
    pub score: f32,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct ScrollHit {
    pub id: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionInfo {
    pub points_count: u64,
    pub vector_size: u64,
}

/// §6.3: the original entity key a point id was hashed from, preserved
/// alongside it (`payload.point_id`) so a collision or a re-hash under a
/// different algorithm can still be traced back to its source entity.
pub fn point_key(kind: &str, id: &str) -> String {
    format!("{kind}-{id}")
}

/// §4.5/§6.3 `pointId(kind, id) = hash32(kind + "-" + id)`. Uses a fixed
/// algorithm (FNV-1a, 64-bit) rather than `std`'s `DefaultHasher`, whose
/// output is explicitly unstable across compiler versions — P1 (point
/// identity) requires a hash that is deterministic across process restarts.
pub fn point_id(kind: &str, id: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let key = point_key(kind, id);
    let mut hash = FNV_OFFSET;
    for byte in key.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    // §6.3: point ids are 32-bit non-negative integers.
    hash & 0xffff_ffff
}

#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self) -> anyhow::Result<()>;
    async fn ensure_payload_indices(&self) -> anyhow::Result<()>;
    async fn upsert(&self, doc: Document) -> anyhow::Result<()>;
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> anyhow::Result<Vec<SearchHit>>;
    async fn scroll(&self, filter: Option<&Filter>, k: usize) -> anyhow::Result<Vec<ScrollHit>>;
    async fn delete(&self, id: u64) -> anyhow::Result<()>;
    async fn delete_collection(&self) -> anyhow::Result<()>;
    async fn get_collection_info(&self) -> anyhow::Result<CollectionInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_deterministic() {
        assert_eq!(point_id("task", "abc-123"), point_id("task", "abc-123"));
        assert_ne!(point_id("task", "abc-123"), point_id("user", "abc-123"));
    }
}
