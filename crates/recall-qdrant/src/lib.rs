//! Qdrant client for the memory store.
//!
//! One collection per agent profile, named `{prefix}{profile}`. Every point
//! carries an `owner_id` payload field and reads are always filtered on it.

use std::collections::HashMap;
use std::sync::Arc;

use qdrant_client::qdrant::{
    condition::ConditionOneOf, point_id::PointIdOptions, r#match::MatchValue, Condition,
    CreateCollectionBuilder, DeletePointsBuilder, Distance, FieldCondition, Filter,
    HasIdCondition, Match, PointId, PointStruct, Range, RetrievedPoint, ScoredPoint,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value;
use tracing::{debug, info};

/// Error types for the Qdrant client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Vector store error: {0}")]
    VectorStore(String),
}

/// Result type for the Qdrant client.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for the Qdrant client.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection_prefix: String,
}

impl QdrantConfig {
    pub fn new(url: impl Into<String>, collection_prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection_prefix: collection_prefix.into(),
        }
    }
}

/// Point payload key names
pub const KEY_OWNER_ID: &str = "owner_id";
pub const KEY_SOURCE: &str = "source";
pub const KEY_CREATED_AT_TS: &str = "created_at_ts";
pub const KEY_IMPORTANCE: &str = "importance";

/// Page size used when scrolling for delete-by-filter.
const SCROLL_PAGE: u32 = 512;

/// Vector storage backed by Qdrant.
#[derive(Clone)]
pub struct QdrantService {
    inner: Arc<QdrantServiceInner>,
}

struct QdrantServiceInner {
    client: Qdrant,
    prefix: String,
}

/// A point to upsert.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

/// Search result from Qdrant
#[derive(Debug, Clone)]
pub struct VectorSearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

impl QdrantService {
    /// Connect and verify the server answers.
    pub async fn new(config: &QdrantConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .build()
            .map_err(|e| Error::VectorStore(format!("Failed to connect to Qdrant: {}", e)))?;

        client
            .list_collections()
            .await
            .map_err(|e| Error::VectorStore(format!("Qdrant connection test failed: {}", e)))?;

        info!(url = %config.url, prefix = %config.collection_prefix, "Qdrant service connected");

        Ok(Self {
            inner: Arc::new(QdrantServiceInner {
                client,
                prefix: config.collection_prefix.clone(),
            }),
        })
    }

    /// Get the collection name for an agent profile
    pub fn collection_name(&self, profile: &str) -> String {
        format!("{}{}", self.inner.prefix, profile)
    }

    /// Create the profile's collection if missing.
    ///
    /// An existing collection with another vector size is an error: the
    /// stored memories would be unreadable with the configured embedder.
    pub async fn ensure_collection(&self, profile: &str, dimension: usize) -> Result<()> {
        let collection_name = self.collection_name(profile);

        let exists = self
            .inner
            .client
            .collection_exists(&collection_name)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to check collection: {}", e)))?;

        if exists {
            let existing_dim = self.collection_dimension(&collection_name).await?;
            if existing_dim == dimension {
                debug!(collection = %collection_name, dimension, "Collection already exists");
                return Ok(());
            }
            return Err(Error::VectorStore(format!(
                "Collection {} has dimension {}, expected {}",
                collection_name, existing_dim, dimension
            )));
        }

        self.inner
            .client
            .create_collection(
                CreateCollectionBuilder::new(&collection_name)
                    .vectors_config(VectorParamsBuilder::new(dimension as u64, Distance::Cosine)),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to create collection: {}", e)))?;

        info!(collection = %collection_name, dimension, "Created Qdrant collection");

        Ok(())
    }

    async fn collection_dimension(&self, collection_name: &str) -> Result<usize> {
        let info = self
            .inner
            .client
            .collection_info(collection_name)
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to get collection info: {}", e)))?;

        Ok(info
            .result
            .as_ref()
            .and_then(|r| r.config.as_ref())
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|vc| match vc.config.as_ref() {
                Some(qdrant_client::qdrant::vectors_config::Config::Params(params)) => {
                    Some(params.size as usize)
                }
                _ => None,
            })
            .unwrap_or(0))
    }

    /// Upsert points in one request.
    pub async fn upsert_batch(&self, profile: &str, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let collection_name = self.collection_name(profile);

        let qdrant_points: Vec<PointStruct> = points
            .into_iter()
            .map(|point| {
                let payload: HashMap<String, QdrantValue> = point
                    .payload
                    .into_iter()
                    .filter_map(|(k, v)| json_to_qdrant_value(v).map(|qv| (k, qv)))
                    .collect();

                PointStruct::new(point.id, point.vector, payload)
            })
            .collect();

        let count = qdrant_points.len();

        self.inner
            .client
            .upsert_points(UpsertPointsBuilder::new(&collection_name, qdrant_points).wait(true))
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to upsert points: {}", e)))?;

        debug!(collection = %collection_name, count, "Upserted points");

        Ok(())
    }

    /// Search for similar vectors, best match first.
    pub async fn search(
        &self,
        profile: &str,
        vector: Vec<f32>,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<VectorSearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let collection_name = self.collection_name(profile);

        let builder = SearchPointsBuilder::new(&collection_name, vector, limit as u64)
            .with_payload(true)
            .filter(filter.to_qdrant_filter());

        let response = self
            .inner
            .client
            .search_points(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Search failed: {}", e)))?;

        Ok(response
            .result
            .into_iter()
            .map(scored_point_to_result)
            .collect())
    }

    /// Delete points by ID.
    pub async fn delete_batch(&self, profile: &str, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let collection_name = self.collection_name(profile);
        let point_ids: Vec<PointId> = ids.into_iter().map(PointId::from).collect();

        self.inner
            .client
            .delete_points(
                DeletePointsBuilder::new(&collection_name)
                    .points(point_ids)
                    .wait(true),
            )
            .await
            .map_err(|e| Error::VectorStore(format!("Failed to delete points: {}", e)))?;

        Ok(())
    }

    /// Delete every point matching a filter; returns how many were removed.
    ///
    /// Scrolls the matching ids page by page, then deletes them by id.
    pub async fn delete_by_filter(&self, profile: &str, filter: &SearchFilter) -> Result<usize> {
        let mut ids = Vec::new();
        let mut offset = None;

        loop {
            let (page, next) = self.scroll_ids(profile, offset, filter).await?;
            ids.extend(page);
            match next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        let count = ids.len();
        self.delete_batch(profile, ids).await?;

        debug!(collection = %self.collection_name(profile), count, "Deleted points by filter");

        Ok(count)
    }

    /// Read up to `limit` points matching a filter, payload included.
    ///
    /// Results carry a score of zero; order is the store's id order.
    pub async fn fetch(
        &self,
        profile: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorSearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let collection_name = self.collection_name(profile);

        let builder = ScrollPointsBuilder::new(&collection_name)
            .limit(limit.min(SCROLL_PAGE as usize) as u32)
            .with_payload(true)
            .filter(filter.to_qdrant_filter());

        let response = self
            .inner
            .client
            .scroll(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Scroll failed: {}", e)))?;

        Ok(response
            .result
            .into_iter()
            .map(retrieved_point_to_result)
            .collect())
    }

    async fn scroll_ids(
        &self,
        profile: &str,
        offset: Option<PointId>,
        filter: &SearchFilter,
    ) -> Result<(Vec<String>, Option<PointId>)> {
        let collection_name = self.collection_name(profile);

        let mut builder = ScrollPointsBuilder::new(&collection_name)
            .limit(SCROLL_PAGE)
            .with_payload(false)
            .filter(filter.to_qdrant_filter());

        if let Some(off) = offset {
            builder = builder.offset(off);
        }

        let response = self
            .inner
            .client
            .scroll(builder)
            .await
            .map_err(|e| Error::VectorStore(format!("Scroll failed: {}", e)))?;

        let ids = response
            .result
            .into_iter()
            .filter_map(|point: RetrievedPoint| point_id_to_string(point.id))
            .collect();

        Ok((ids, response.next_page_offset))
    }
}

/// Filter on memory payload fields. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub owner_id: Option<String>,
    pub source: Option<String>,
    pub ids: Vec<String>,
    /// Only points with `created_at_ts` strictly below this unix time.
    pub created_before_ts: Option<i64>,
    /// Only points with `importance` strictly below this value.
    pub importance_below: Option<f64>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.ids.push(id.to_string());
        self
    }

    pub fn created_before(mut self, ts: i64) -> Self {
        self.created_before_ts = Some(ts);
        self
    }

    pub fn importance_below(mut self, importance: f64) -> Self {
        self.importance_below = Some(importance);
        self
    }

    fn to_qdrant_filter(&self) -> Filter {
        let mut conditions = Vec::new();

        if let Some(ref owner) = self.owner_id {
            conditions.push(make_match_condition(KEY_OWNER_ID, owner));
        }

        if let Some(ref source) = self.source {
            conditions.push(make_match_condition(KEY_SOURCE, source));
        }

        if !self.ids.is_empty() {
            conditions.push(Condition {
                condition_one_of: Some(ConditionOneOf::HasId(HasIdCondition {
                    has_id: self.ids.iter().cloned().map(PointId::from).collect(),
                })),
            });
        }

        if let Some(ts) = self.created_before_ts {
            conditions.push(make_below_condition(KEY_CREATED_AT_TS, ts as f64));
        }

        if let Some(importance) = self.importance_below {
            conditions.push(make_below_condition(KEY_IMPORTANCE, importance));
        }

        Filter {
            must: conditions,
            ..Default::default()
        }
    }
}

/// Create a match condition for a field
fn make_match_condition(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            ..Default::default()
        })),
    }
}

/// Create a `key < value` range condition
fn make_below_condition(key: &str, value: f64) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            range: Some(Range {
                lt: Some(value),
                ..Default::default()
            }),
            ..Default::default()
        })),
    }
}

fn point_id_to_string(id: Option<PointId>) -> Option<String> {
    match id?.point_id_options? {
        PointIdOptions::Uuid(uuid) => Some(uuid),
        PointIdOptions::Num(num) => Some(num.to_string()),
    }
}

/// Convert JSON value to Qdrant value
fn json_to_qdrant_value(value: Value) -> Option<QdrantValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(QdrantValue::from(b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(QdrantValue::from(i))
            } else {
                n.as_f64().map(QdrantValue::from)
            }
        }
        Value::String(s) => Some(QdrantValue::from(s)),
        Value::Array(arr) => {
            let values: Vec<QdrantValue> =
                arr.into_iter().filter_map(json_to_qdrant_value).collect();
            Some(QdrantValue::from(values))
        }
        // Nested objects are stored as their JSON text
        Value::Object(_) => Some(QdrantValue::from(value.to_string())),
    }
}

/// Convert Qdrant value to JSON value
fn qdrant_value_to_json(value: QdrantValue) -> Option<Value> {
    use qdrant_client::qdrant::value::Kind;

    match value.kind {
        Some(Kind::NullValue(_)) => Some(Value::Null),
        Some(Kind::BoolValue(b)) => Some(Value::Bool(b)),
        Some(Kind::IntegerValue(i)) => Some(Value::Number(i.into())),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(d).map(Value::Number),
        Some(Kind::StringValue(s)) => Some(Value::String(s)),
        Some(Kind::ListValue(list)) => Some(Value::Array(
            list.values
                .into_iter()
                .filter_map(qdrant_value_to_json)
                .collect(),
        )),
        Some(Kind::StructValue(obj)) => Some(Value::Object(
            obj.fields
                .into_iter()
                .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
                .collect(),
        )),
        None => None,
    }
}

/// Convert scored point to search result
fn scored_point_to_result(point: ScoredPoint) -> VectorSearchResult {
    let payload = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
        .collect();

    VectorSearchResult {
        id: point_id_to_string(point.id).unwrap_or_default(),
        score: point.score,
        payload,
    }
}

fn retrieved_point_to_result(point: RetrievedPoint) -> VectorSearchResult {
    let payload = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| qdrant_value_to_json(v).map(|jv| (k, jv)))
        .collect();

    VectorSearchResult {
        id: point_id_to_string(point.id).unwrap_or_default(),
        score: 0.0,
        payload,
    }
}
