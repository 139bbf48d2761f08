// src/vectorstore/qdrant.rs
//! Qdrant-backed `VectorStore` (§4.2/§6.3). Grounded directly on the
//! teacher's `memory::storage::qdrant::multi_store::QdrantMultiStore`:
//! same builder style, same "already exists" race tolerance, same
//! `PointStruct::new`/`UpsertPointsBuilder`/`ScrollPointsBuilder` usage,
//! generalised from Mira's 3 fixed collections to one configurable
//! `task_manager` collection (§6.3) with typed payload indices (§4.2).

use anyhow::{Context, Result};
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, Filter as QdrantFilter, FieldType, HnswConfigDiffBuilder, ListValue,
    OptimizersConfigDiffBuilder, PointId, PointStruct, ScrollPointsBuilder, SearchPointsBuilder,
    Struct as QdrantStruct, UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CollectionInfo, Document, Filter, ScrollHit, SearchHit, VectorStore};
use crate::config::VectorStoreConfig;
use crate::llm::with_retries;

/// Fields requiring an index at collection creation (§4.2).
const KEYWORD_INDEX_FIELDS: &[&str] = &[
    "entity_type",
    "relationships.team_id",
    "relationships.project_id",
    "relationships.assigned_to",
];
const DATETIME_INDEX_FIELDS: &[&str] = &["created_at", "updated_at"];

pub struct QdrantVectorStore {
    client: Qdrant,
    collection: String,
    config: VectorStoreConfig,
}

impl QdrantVectorStore {
    pub async fn connect(config: VectorStoreConfig) -> Result<Self> {
        let mut builder = Qdrant::from_url(&config.url())
            .timeout(Duration::from_secs(config.timeout_secs))
            .skip_compatibility_check();
        if let Some(ref key) = config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder.build().context("failed to connect to Qdrant")?;

        let store = Self {
            client,
            collection: config.collection_name.clone(),
            config,
        };
        store.create_collection().await?;
        store.ensure_payload_indices().await?;
        Ok(store)
    }

    fn translate(filter: &Filter) -> QdrantFilter {
        let must: Vec<Condition> = filter
            .must
            .iter()
            .map(|(field, value)| Self::condition(field, value))
            .collect();
        let should: Vec<Condition> = filter
            .should
            .iter()
            .map(|(field, value)| Self::condition(field, value))
            .collect();
        QdrantFilter {
            must,
            should,
            ..Default::default()
        }
    }

    fn condition(field: &str, value: &Value) -> Condition {
        match value {
            Value::Bool(b) => Condition::matches(field, *b),
            Value::Number(n) if n.is_i64() => Condition::matches(field, n.as_i64().unwrap()),
            other => Condition::matches(field, other.as_str().unwrap_or_default().to_string()),
        }
    }

    fn payload_to_qdrant(payload: &super::Payload) -> HashMap<String, QdrantValue> {
        payload
            .iter()
            .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
            .collect()
    }

    fn qdrant_to_payload(payload: HashMap<String, QdrantValue>) -> super::Payload {
        payload
            .into_iter()
            .filter_map(|(k, v)| qdrant_to_json(v).map(|jv| (k, jv)))
            .collect()
    }
}

/// Nested `metadata`/`relationships` payload fields round-trip through
/// Qdrant's protobuf `Struct`/`ListValue`, not a stringified blob, so that
/// dotted field-path filters (e.g. `metadata.is_overdue`) resolve against
/// real nested JSON rather than an opaque string.
fn json_to_qdrant(value: &Value) -> QdrantValue {
    use qdrant_client::qdrant::value::Kind;
    match value {
        Value::Null => QdrantValue::from(false),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else {
                n.as_f64().unwrap_or_default().into()
            }
        }
        Value::String(s) => s.clone().into(),
        Value::Array(items) => QdrantValue {
            kind: Some(Kind::ListValue(ListValue {
                values: items.iter().map(json_to_qdrant).collect(),
            })),
        },
        Value::Object(map) => QdrantValue {
            kind: Some(Kind::StructValue(QdrantStruct {
                fields: map.iter().map(|(k, v)| (k.clone(), json_to_qdrant(v))).collect(),
            })),
        },
    }
}

fn qdrant_to_json(value: QdrantValue) -> Option<Value> {
    use qdrant_client::qdrant::value::Kind;
    match value.kind {
        Some(Kind::NullValue(_)) => Some(Value::Null),
        Some(Kind::BoolValue(b)) => Some(Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(Value::from(i)),
        Some(Kind::DoubleValue(d)) => Some(Value::from(d)),
        Some(Kind::StringValue(s)) => Some(Value::String(s)),
        Some(Kind::ListValue(list)) => {
            Some(Value::Array(list.values.into_iter().filter_map(qdrant_to_json).collect()))
        }
        Some(Kind::StructValue(s)) => Some(Value::Object(
            s.fields
                .into_iter()
                .filter_map(|(k, v)| qdrant_to_json(v).map(|jv| (k, jv)))
                .collect(),
        )),
        None => None,
    }
}

#[async_trait::async_trait]
impl VectorStore for QdrantVectorStore {
    /// §4.2 collection params: dim D, cosine distance, HNSW (m=16,
    /// ef_construct=100), indexing threshold 10 000.
    async fn create_collection(&self) -> Result<()> {
        let exists = self.client.collection_exists(&self.collection).await?;
        if exists {
            return Ok(());
        }

        info!("Creating Qdrant collection: {}", self.collection);
        let hnsw = HnswConfigDiffBuilder::default()
            .m(self.config.hnsw_m)
            .ef_construct(self.config.hnsw_ef_construct);

        let optimizers =
            OptimizersConfigDiffBuilder::default().indexing_threshold(self.config.indexing_threshold);

        let result = self
            .client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        self.config.vector_size,
                        Distance::Cosine,
                    ))
                    .hnsw_config(hnsw)
                    .optimizers_config(optimizers),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => {
                debug!("collection {} created concurrently", self.collection);
                Ok(())
            }
            Err(e) => Err(e).context("failed to create collection"),
        }
    }

    /// §4.2 required payload indices.
    async fn ensure_payload_indices(&self) -> Result<()> {
        for field in KEYWORD_INDEX_FIELDS {
            self.create_index(field, FieldType::Keyword).await?;
        }
        for field in DATETIME_INDEX_FIELDS {
            self.create_index(field, FieldType::Datetime).await?;
        }
        Ok(())
    }

    async fn upsert(&self, doc: Document) -> Result<()> {
        let payload = Self::payload_to_qdrant(&doc.payload);
        let point = PointStruct::new(doc.id, doc.vector, payload);
        with_retries(self.config.max_retries, || {
            let point = point.clone();
            async move {
                self.client
                    .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
                    .await
                    .context("failed to upsert point")
            }
        })
        .await?;
        Ok(())
    }

    /// §4.2: when both `must` and `should` are supplied, synthesise OR
    /// semantics by running one search per `should` value AND-ed with
    /// `must`, then merging by id (§9 open question decision).
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<SearchHit>> {
        let Some(filter) = filter else {
            return self.search_one(vector, k, &QdrantFilter::default()).await;
        };

        if filter.must.is_empty() || filter.should.is_empty() {
            return self.search_one(vector, k, &Self::translate(filter)).await;
        }

        let mut merged: Vec<SearchHit> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (field, value) in &filter.should {
            let mut sub = Filter {
                must: filter.must.clone(),
                should: vec![],
            };
            sub.must.push((field.clone(), value.clone()));
            let hits = self.search_one(vector, k, &Self::translate(&sub)).await?;
            for hit in hits {
                if seen.insert(hit.id) {
                    merged.push(hit);
                }
            }
        }
        merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(k);
        Ok(merged)
    }

    async fn scroll(&self, filter: Option<&Filter>, k: usize) -> Result<Vec<ScrollHit>> {
        let qfilter = filter.map(Self::translate).unwrap_or_default();

        with_retries(self.config.max_retries, || {
            let qfilter = qfilter.clone();
            async move {
                let mut builder = ScrollPointsBuilder::new(&self.collection)
                    .limit(k as u32)
                    .with_payload(true)
                    .with_vectors(false);
                if !qfilter.must.is_empty() || !qfilter.should.is_empty() {
                    builder = builder.filter(qfilter);
                }

                let response = self.client.scroll(builder).await.context("scroll failed")?;
                Ok(response
                    .result
                    .into_iter()
                    .filter_map(|point| {
                        let id = point_id_to_u64(point.id?)?;
                        Some(ScrollHit {
                            id,
                            payload: Self::qdrant_to_payload(point.payload),
                        })
                    })
                    .collect())
            }
        })
        .await
    }

    async fn delete(&self, id: u64) -> Result<()> {
        with_retries(self.config.max_retries, || async move {
            self.client
                .delete_points(
                    DeletePointsBuilder::new(&self.collection).points(vec![PointId::from(id)]),
                )
                .await
                .context("failed to delete point")
        })
        .await?;
        Ok(())
    }

    async fn delete_collection(&self) -> Result<()> {
        self.client
            .delete_collection(self.collection.clone())
            .await
            .context("failed to delete collection")?;
        Ok(())
    }

    async fn get_collection_info(&self) -> Result<CollectionInfo> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .context("failed to get collection info")?;
        let result = info.result.unwrap_or_default();
        Ok(CollectionInfo {
            points_count: result.points_count.unwrap_or(0),
            vector_size: self.config.vector_size,
        })
    }
}

impl QdrantVectorStore {
    async fn search_one(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QdrantFilter,
    ) -> Result<Vec<SearchHit>> {
        with_retries(self.config.max_retries, || async move {
            let mut builder =
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), k as u64).with_payload(true);
            if !filter.must.is_empty() || !filter.should.is_empty() {
                builder = builder.filter(filter.clone());
            }

            let response = self
                .client
                .search_points(builder)
                .await
                .context("search failed")?;

            Ok(response
                .result
                .into_iter()
                .filter_map(|point| {
                    let id = point_id_to_u64(point.id?)?;
                    Some(SearchHit {
                        id,
                        score: point.score,
                        payload: Self::qdrant_to_payload(point.payload),
                    })
                })
                .collect())
        })
        .await
    }

    async fn create_index(&self, field: &str, field_type: FieldType) -> Result<()> {
        let result = self
            .client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(&self.collection, field, field_type)
                    .wait(true),
            )
            .await;
        if let Err(e) = result {
            if !e.to_string().contains("already exists") {
                warn!("failed to create payload index on {field}: {e}");
            }
        }
        Ok(())
    }
}

fn point_id_to_u64(id: PointId) -> Option<u64> {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.point_id_options? {
        PointIdOptions::Num(n) => Some(n),
        PointIdOptions::Uuid(_) => None,
    }
}
