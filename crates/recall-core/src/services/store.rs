//! Memory store seam and its Qdrant adapter.
//!
//! Records live in one collection per agent profile. Every read and delete
//! is scoped to an owner; there is no cross-user query.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use recall_models::{MemoryRecord, MemorySource};
use recall_qdrant::{
    Point, QdrantService, SearchFilter, VectorSearchResult, KEY_CREATED_AT_TS, KEY_IMPORTANCE,
    KEY_OWNER_ID, KEY_SOURCE,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::Result;

const KEY_CONTENT: &str = "content";
const KEY_TITLE: &str = "title";
const KEY_CREATED_AT: &str = "created_at";
const KEY_TAGS: &str = "tags";

/// A stored memory as read back from the store.
///
/// `created_at` is `None` when the stored timestamp is missing or
/// unparseable; `score` is the cosine similarity for searches and zero for
/// plain fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    pub id: String,
    pub owner_id: String,
    pub content: String,
    pub title: Option<String>,
    pub source: MemorySource,
    pub importance: f64,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub score: f32,
}

/// Owner-scoped filter over stored memories.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreFilter {
    pub owner_id: String,
    pub ids: Vec<String>,
    pub source: Option<MemorySource>,
    /// Strictly older than this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Strictly less important than this.
    pub importance_below: Option<f64>,
}

impl StoreFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ids: Vec::new(),
            source: None,
            created_before: None,
            importance_below: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.ids.push(id.into());
        self
    }

    pub fn with_source(mut self, source: MemorySource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn importance_below(mut self, importance: f64) -> Self {
        self.importance_below = Some(importance);
        self
    }

    /// Whether a record satisfies every set condition.
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        record.owner_id == self.owner_id
            && (self.ids.is_empty() || self.ids.contains(&record.id))
            && self.source.as_ref().map_or(true, |s| *s == record.source)
            && self.created_before.map_or(true, |t| record.created_at < t)
            && self.importance_below.map_or(true, |i| record.importance < i)
    }

    fn to_search_filter(&self) -> SearchFilter {
        let mut filter = SearchFilter::new().with_owner(&self.owner_id);
        for id in &self.ids {
            filter = filter.with_id(id);
        }
        if let Some(ref source) = self.source {
            filter = filter.with_source(source.as_str());
        }
        if let Some(at) = self.created_before {
            filter = filter.created_before(at.timestamp());
        }
        if let Some(importance) = self.importance_below {
            filter = filter.importance_below(importance);
        }
        filter
    }
}

/// Vector-indexed persistence for memory records.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Create the collection if missing. A no-op for stores without setup.
    async fn ensure_collection(&self, _collection: &str, _dimension: usize) -> Result<()> {
        Ok(())
    }

    /// Insert or overwrite records in one request.
    async fn upsert(&self, collection: &str, records: &[MemoryRecord]) -> Result<()>;

    /// Nearest records to `vector` matching the filter, best first.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>>;

    /// Records matching the filter, without ranking.
    async fn fetch(
        &self,
        collection: &str,
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>>;

    /// Delete records matching the filter; returns how many were removed.
    async fn delete(&self, collection: &str, filter: &StoreFilter) -> Result<usize>;
}

/// [`MemoryStore`] over Qdrant. Collections are agent profiles.
#[derive(Clone)]
pub struct QdrantMemoryStore {
    qdrant: QdrantService,
}

impl QdrantMemoryStore {
    pub fn new(qdrant: QdrantService) -> Self {
        Self { qdrant }
    }
}

#[async_trait]
impl MemoryStore for QdrantMemoryStore {
    async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
        Ok(self.qdrant.ensure_collection(collection, dimension).await?)
    }

    async fn upsert(&self, collection: &str, records: &[MemoryRecord]) -> Result<()> {
        let points = records.iter().map(record_to_point).collect();
        Ok(self.qdrant.upsert_batch(collection, points).await?)
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let results = self
            .qdrant
            .search(collection, vector.to_vec(), limit, &filter.to_search_filter())
            .await?;

        Ok(results.into_iter().map(result_to_hit).collect())
    }

    async fn fetch(
        &self,
        collection: &str,
        filter: &StoreFilter,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let results = self
            .qdrant
            .fetch(collection, &filter.to_search_filter(), limit)
            .await?;

        Ok(results.into_iter().map(result_to_hit).collect())
    }

    async fn delete(&self, collection: &str, filter: &StoreFilter) -> Result<usize> {
        Ok(self
            .qdrant
            .delete_by_filter(collection, &filter.to_search_filter())
            .await?)
    }
}

/// Qdrant only accepts UUID or integer point ids.
fn point_id(id: &str) -> String {
    match uuid::Uuid::parse_str(id) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => {
            warn!(id, "Record id is not a UUID, storing under a fresh id");
            recall_models::new_id()
        }
    }
}

fn record_to_point(record: &MemoryRecord) -> Point {
    let mut payload = HashMap::new();
    payload.insert(KEY_OWNER_ID.to_string(), json!(record.owner_id));
    payload.insert(KEY_CONTENT.to_string(), json!(record.content));
    if let Some(ref title) = record.title {
        payload.insert(KEY_TITLE.to_string(), json!(title));
    }
    payload.insert(KEY_SOURCE.to_string(), json!(record.source.as_str()));
    payload.insert(KEY_CREATED_AT.to_string(), json!(record.created_at.to_rfc3339()));
    payload.insert(KEY_CREATED_AT_TS.to_string(), json!(record.created_at.timestamp()));
    payload.insert(KEY_IMPORTANCE.to_string(), json!(record.importance));
    payload.insert(KEY_TAGS.to_string(), json!(record.tags));

    Point {
        id: point_id(&record.id),
        vector: record.embedding.clone(),
        payload,
    }
}

fn payload_str(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Prefer the RFC 3339 text, fall back to the unix seconds field.
fn payload_timestamp(payload: &HashMap<String, Value>) -> Option<DateTime<Utc>> {
    payload
        .get(KEY_CREATED_AT)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            payload
                .get(KEY_CREATED_AT_TS)
                .and_then(|v| v.as_i64())
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        })
}

fn result_to_hit(result: VectorSearchResult) -> MemoryHit {
    let payload = &result.payload;

    MemoryHit {
        id: result.id.clone(),
        owner_id: payload_str(payload, KEY_OWNER_ID).unwrap_or_default(),
        content: payload_str(payload, KEY_CONTENT).unwrap_or_default(),
        title: payload_str(payload, KEY_TITLE),
        source: payload_str(payload, KEY_SOURCE)
            .map(|s| MemorySource::parse(&s))
            .unwrap_or_default(),
        importance: payload
            .get(KEY_IMPORTANCE)
            .and_then(|v| v.as_f64())
            .unwrap_or(recall_models::DEFAULT_IMPORTANCE),
        tags: payload
            .get(KEY_TAGS)
            .and_then(|v| v.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
        created_at: payload_timestamp(payload),
        score: result.score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_models::NewMemory;

    fn record(id: &str) -> MemoryRecord {
        MemoryRecord::new(
            NewMemory::new("user-1", "Prefers Go")
                .with_id(id)
                .with_title("Language")
                .with_importance(0.7)
                .with_tags(vec!["go".into()]),
            vec![0.1, 0.2],
            2,
        )
        .unwrap()
    }

    #[test]
    fn test_point_payload_round_trips_to_hit() {
        let record = record("6f1c2a9e-3b1d-4b7a-9a8e-2d4f5c6b7a80");
        let point = record_to_point(&record);

        assert_eq!(point.id, record.id);
        assert_eq!(point.payload[KEY_CREATED_AT_TS], json!(record.created_at.timestamp()));

        let hit = result_to_hit(VectorSearchResult {
            id: point.id,
            score: 0.9,
            payload: point.payload,
        });

        assert_eq!(hit.owner_id, "user-1");
        assert_eq!(hit.content, "Prefers Go");
        assert_eq!(hit.title.as_deref(), Some("Language"));
        assert_eq!(hit.importance, 0.7);
        assert_eq!(hit.tags, vec!["go".to_string()]);
        assert_eq!(hit.source, MemorySource::System);
        assert_eq!(
            hit.created_at.map(|t| t.timestamp()),
            Some(record.created_at.timestamp())
        );
    }

    #[test]
    fn test_non_uuid_ids_are_replaced() {
        let point = record_to_point(&record("chunk-1"));
        assert_ne!(point.id, "chunk-1");
        assert!(uuid::Uuid::parse_str(&point.id).is_ok());
    }

    #[test]
    fn test_missing_timestamp_is_none() {
        let mut payload = HashMap::new();
        payload.insert(KEY_CONTENT.to_string(), json!("x"));
        payload.insert(KEY_CREATED_AT.to_string(), json!("yesterday-ish"));

        let hit = result_to_hit(VectorSearchResult {
            id: "a".into(),
            score: 0.1,
            payload,
        });
        assert_eq!(hit.created_at, None);
    }

    #[test]
    fn test_filter_matches_retention_bounds() {
        let record = record("6f1c2a9e-3b1d-4b7a-9a8e-2d4f5c6b7a80");
        let later = record.created_at + chrono::Duration::seconds(1);

        assert!(StoreFilter::owner("user-1").matches(&record));
        assert!(!StoreFilter::owner("user-2").matches(&record));
        assert!(StoreFilter::owner("user-1")
            .created_before(later)
            .importance_below(0.8)
            .matches(&record));
        assert!(!StoreFilter::owner("user-1")
            .importance_below(0.7)
            .matches(&record));
        assert!(!StoreFilter::owner("user-1")
            .created_before(record.created_at)
            .matches(&record));
    }
}
