//! ============================================================================
//! Qdrant Index - Production vector backend
//! ============================================================================
//! One collection holds every namespace. Point ids are UUIDv5 over
//! `owner/type/key`, so overwrite-by-key is a plain upsert.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use qdrant_client::qdrant::{
    point_id::PointIdOptions, Condition, CountPointsBuilder, CreateCollectionBuilder,
    CreateFieldIndexCollectionBuilder, DeletePointsBuilder, Distance, FieldType, Filter,
    GetPointsBuilder, PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::index::{
    encode_filter, FilterEncoding, IndexDocument, IndexPage, IndexQuery, ScoredDocument,
    VectorIndex,
};
use super::types::{FilterValue, MemoryRecord, MetadataFilter, Namespace, NamespacePattern};
use crate::config::{DistanceMetric, StoreConfig};
use crate::error::MemoryError;

const FIELD_OWNER: &str = "ns_owner";
const FIELD_TYPE: &str = "ns_type";
const FIELD_KEY: &str = "key";
const FIELD_RECORD: &str = "record";
const FIELD_CREATED: &str = "created_at_ms";
const FIELD_UPDATED: &str = "updated_at_ms";

/// Fields stored at the top level of the record payload
const RECORD_FIELDS: &[&str] = &[
    "category",
    "importance",
    "pinned",
    "source",
    "memory_type",
];

/// Vector index backed by a Qdrant collection
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    dimension: usize,
    metric: DistanceMetric,
}

impl QdrantIndex {
    /// Connect and make sure the collection exists
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", config.qdrant_url);

        let client = Qdrant::from_url(&config.qdrant_url)
            .build()
            .map_err(|e| anyhow!("Failed to create Qdrant client: {}", e))?;

        let index = Self {
            client,
            collection: config.collection.clone(),
            dimension: config.embedding_dim,
            metric: config.distance,
        };
        if !index.health_check().await? {
            return Err(anyhow!("Qdrant at {} is not reachable", config.qdrant_url));
        }
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| anyhow!("Failed to check collection existence: {}", e))?;

        if exists {
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!("Creating collection: {}", self.collection);
        let distance = match self.metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::Euclidean => Distance::Euclid,
            DistanceMetric::Dot => Distance::Dot,
        };

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(self.dimension as u64, distance)),
            )
            .await
            .map_err(|e| anyhow!("Failed to create collection: {}", e))?;

        for field in [FIELD_OWNER, FIELD_TYPE] {
            if let Err(e) = self
                .client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    FieldType::Keyword,
                ))
                .await
            {
                warn!("Failed to index payload field {}: {}", field, e);
            }
        }

        info!("Collection {} created successfully", self.collection);
        Ok(())
    }

    pub async fn health_check(&self) -> Result<bool> {
        match self.client.health_check().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Qdrant health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Deterministic point id for `(namespace, key)`
pub fn point_id(namespace: &Namespace, key: &str) -> String {
    let name = format!("{}/{}", namespace.path(), key);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

fn to_point_id(raw: String) -> PointId {
    PointId {
        point_id_options: Some(PointIdOptions::Uuid(raw)),
    }
}

fn point_id_string(id: &PointId) -> Option<String> {
    match id.point_id_options.as_ref()? {
        PointIdOptions::Uuid(uuid) => Some(uuid.clone()),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

fn namespace_conditions(namespace: &Namespace) -> Vec<Condition> {
    vec![
        Condition::matches(FIELD_OWNER, namespace.owner_id.clone()),
        Condition::matches(FIELD_TYPE, namespace.memory_type.to_string()),
    ]
}

/// Scroll conditions; wildcard components add none
fn pattern_conditions(pattern: &NamespacePattern) -> Vec<Condition> {
    if let Some(namespace) = pattern.exact() {
        return namespace_conditions(&namespace);
    }
    let mut conditions = Vec::new();
    if let Some(owner) = &pattern.owner_id {
        conditions.push(Condition::matches(FIELD_OWNER, owner.clone()));
    }
    if let Some(memory_type) = pattern.memory_type {
        conditions.push(Condition::matches(FIELD_TYPE, memory_type.to_string()));
    }
    conditions
}

/// Payload path of a filterable record field
fn field_path(field: &str) -> String {
    if RECORD_FIELDS.contains(&field) {
        format!("{}.{}", FIELD_RECORD, field)
    } else {
        format!("{}.extra.{}", FIELD_RECORD, field)
    }
}

fn metadata_conditions(filter: &MetadataFilter) -> Vec<Condition> {
    filter
        .conditions
        .iter()
        .map(|(field, value)| {
            let path = field_path(field);
            match value {
                FilterValue::Text(s) => Condition::matches(path, s.clone()),
                FilterValue::Integer(i) => Condition::matches(path, *i),
                FilterValue::Bool(b) => Condition::matches(path, *b),
            }
        })
        .collect()
}

fn build_payload(document: &IndexDocument) -> Result<HashMap<String, Value>> {
    let record = serde_json::to_value(&document.record)?;
    let mut payload: HashMap<String, Value> = HashMap::new();
    payload.insert(FIELD_OWNER.to_string(), document.namespace.owner_id.clone().into());
    payload.insert(
        FIELD_TYPE.to_string(),
        document.namespace.memory_type.to_string().into(),
    );
    payload.insert(FIELD_KEY.to_string(), document.key.clone().into());
    payload.insert(FIELD_RECORD.to_string(), record.into());
    payload.insert(
        FIELD_CREATED.to_string(),
        document.created_at.timestamp_millis().into(),
    );
    payload.insert(
        FIELD_UPDATED.to_string(),
        document.updated_at.timestamp_millis().into(),
    );
    Ok(payload)
}

fn millis(payload: &HashMap<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let ms = payload.get(key).and_then(|v| v.as_integer())?;
    Utc.timestamp_millis_opt(ms).single()
}

fn parse_document(payload: &HashMap<String, Value>) -> Option<IndexDocument> {
    let owner = payload.get(FIELD_OWNER)?.as_str()?.to_string();
    let memory_type = payload.get(FIELD_TYPE)?.as_str()?.parse().ok()?;
    let key = payload.get(FIELD_KEY)?.as_str()?.to_string();
    let record_json: serde_json::Value = payload.get(FIELD_RECORD)?.clone().into();

    let record: MemoryRecord = match serde_json::from_value(record_json) {
        Ok(record) => record,
        Err(e) => {
            warn!("Skipping point {} with unreadable record: {}", key, e);
            return None;
        }
    };

    Some(IndexDocument {
        namespace: Namespace {
            owner_id: owner,
            memory_type,
        },
        key,
        created_at: millis(payload, FIELD_CREATED).unwrap_or(record.created_at),
        updated_at: millis(payload, FIELD_UPDATED).unwrap_or(record.last_accessed),
        record,
    })
}

/// Map a backend error, surfacing filter rejections as typed errors
fn map_query_error(e: impl std::fmt::Display) -> anyhow::Error {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("index required") || lower.contains("filter") || lower.contains("payload index")
    {
        MemoryError::FilterRejected(message).into()
    } else {
        anyhow!("Failed to search points: {}", message)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn upsert(&self, document: IndexDocument, vector: Vec<f32>) -> Result<()> {
        let id = point_id(&document.namespace, &document.key);
        let payload = build_payload(&document)?;

        self.client
            .upsert_points(
                UpsertPointsBuilder::new(&self.collection, vec![PointStruct::new(id, vector, payload)])
                    .wait(true),
            )
            .await
            .map_err(|e| anyhow!("Failed to upsert point: {}", e))?;

        debug!("Upserted {}/{}", document.namespace, document.key);
        Ok(())
    }

    async fn get(&self, namespace: &Namespace, key: &str) -> Result<Option<IndexDocument>> {
        let id = to_point_id(point_id(namespace, key));

        let response = self
            .client
            .get_points(GetPointsBuilder::new(&self.collection, vec![id]).with_payload(true))
            .await
            .map_err(|e| anyhow!("Failed to get point: {}", e))?;

        Ok(response
            .result
            .into_iter()
            .find_map(|point| parse_document(&point.payload)))
    }

    async fn query(&self, query: IndexQuery) -> Result<Vec<ScoredDocument>> {
        let mut conditions = namespace_conditions(&query.namespace);
        if let Some((filter, encoding)) = &query.filter {
            let server = encode_filter(filter, *encoding);
            conditions.extend(metadata_conditions(&server));
            debug!("Query with {:?} filter ({} conditions)", encoding, server.conditions.len());
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, query.vector, query.limit as u64)
                    .filter(Filter::must(conditions))
                    .offset(query.offset as u64)
                    .with_payload(true),
            )
            .await
            .map_err(map_query_error)?;

        let metric = self.metric;
        Ok(response
            .result
            .into_iter()
            .filter_map(|point| {
                let document = parse_document(&point.payload)?;
                // Qdrant reports similarity for cosine/dot and raw distance for euclid
                let distance = match metric {
                    DistanceMetric::Cosine => 1.0 - point.score,
                    DistanceMetric::Euclidean => point.score,
                    DistanceMetric::Dot => (1.0 - point.score).max(0.0),
                };
                Some(ScoredDocument { document, distance })
            })
            .collect())
    }

    async fn scroll(
        &self,
        pattern: &NamespacePattern,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<IndexPage> {
        let conditions = pattern_conditions(pattern);
        let mut builder = ScrollPointsBuilder::new(&self.collection)
            .limit(limit as u32)
            .with_payload(true);
        if !conditions.is_empty() {
            builder = builder.filter(Filter::must(conditions));
        }
        if let Some(offset) = cursor {
            builder = builder.offset(to_point_id(offset));
        }

        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|e| anyhow!("Failed to scroll points: {}", e))?;

        let documents = response
            .result
            .iter()
            .filter_map(|point| parse_document(&point.payload))
            .collect();

        Ok(IndexPage {
            documents,
            next_cursor: response.next_page_offset.as_ref().and_then(point_id_string),
        })
    }

    async fn delete(&self, namespace: &Namespace, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let ids: Vec<PointId> = keys
            .iter()
            .map(|key| to_point_id(point_id(namespace, key)))
            .collect();
        let count = ids.len();

        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(PointsIdsList { ids }).wait(true))
            .await
            .map_err(|e| anyhow!("Failed to delete points: {}", e))?;

        debug!("Deleted {} points from {}", count, namespace);
        Ok(count)
    }

    async fn count(&self, namespace: &Namespace) -> Result<usize> {
        let response = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection)
                    .filter(Filter::must(namespace_conditions(namespace)))
                    .exact(true),
            )
            .await
            .map_err(|e| anyhow!("Failed to count points: {}", e))?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }
}
