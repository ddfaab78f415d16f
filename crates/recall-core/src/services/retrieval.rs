//! Weighted memory retrieval.
//!
//! Fuses vector similarity with an exponential recency decay and the
//! stored importance of each memory:
//!
//! ```text
//! recency = exp(-ln 2 / half_life * age_days)
//! final   = w_sim * similarity + w_rec * recency + w_imp * importance
//! ```
//!
//! Candidates are over-fetched by similarity, re-ranked by `final` with a
//! stable sort (ties keep similarity order) and truncated to the limit.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recall_models::WeightedMemory;
use tracing::debug;

use super::clients::EmbeddingClient;
use super::store::{MemoryHit, MemoryStore, StoreFilter};
use crate::error::Result;

/// Default recency half-life in days.
pub const DEFAULT_HALF_LIFE_DAYS: f64 = 14.0;

/// Default number of memories handed to the planner.
pub const DEFAULT_LIMIT: usize = 10;

/// Default over-fetch factor for candidates.
pub const DEFAULT_CANDIDATE_MULTIPLIER: usize = 3;

/// Which ranking the MEMORY stage uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalMode {
    #[default]
    Weighted,
    Similarity,
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weighted" => Ok(Self::Weighted),
            "similarity" => Ok(Self::Similarity),
            other => Err(format!("unknown retrieval mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeightsError {
    #[error("retrieval weights must be finite and non-negative")]
    Negative,
    #[error("retrieval weights must not all be zero")]
    Zero,
}

/// Score fusion weights, normalized to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub similarity: f64,
    pub recency: f64,
    pub importance: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            similarity: 0.6,
            recency: 0.2,
            importance: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn new(
        similarity: f64,
        recency: f64,
        importance: f64,
    ) -> std::result::Result<Self, WeightsError> {
        let weights = [similarity, recency, importance];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(WeightsError::Negative);
        }

        let sum: f64 = weights.iter().sum();
        if sum <= 0.0 {
            return Err(WeightsError::Zero);
        }

        Ok(Self {
            similarity: similarity / sum,
            recency: recency / sum,
            importance: importance / sum,
        })
    }

    pub fn combine(&self, similarity: f64, recency: f64, importance: f64) -> f64 {
        self.similarity * similarity + self.recency * recency + self.importance * importance
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub limit: usize,
    /// Candidates fetched per returned memory; at least 1.
    pub candidate_multiplier: usize,
    pub half_life_days: f64,
    pub weights: ScoreWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::default(),
            limit: DEFAULT_LIMIT,
            candidate_multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
            half_life_days: DEFAULT_HALF_LIFE_DAYS,
            weights: ScoreWeights::default(),
        }
    }
}

/// Recency in `(0, 1]` for a memory created at `created_at`.
///
/// Future timestamps count as age zero. A missing timestamp scores 0.
pub fn recency_score(
    created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    half_life_days: f64,
) -> f64 {
    let Some(created_at) = created_at else {
        return 0.0;
    };

    let age_days = now.signed_duration_since(created_at).num_seconds() as f64 / 86_400.0;
    let age_days = age_days.max(0.0);
    let lambda = std::f64::consts::LN_2 / half_life_days.max(f64::MIN_POSITIVE);

    (-lambda * age_days).exp()
}

/// Rank similarity-ordered candidates by fused score and keep `limit`.
pub fn rank_candidates(
    candidates: Vec<MemoryHit>,
    now: DateTime<Utc>,
    half_life_days: f64,
    weights: &ScoreWeights,
    limit: usize,
) -> Vec<WeightedMemory> {
    let mut ranked: Vec<WeightedMemory> = candidates
        .into_iter()
        .map(|hit| {
            let similarity = hit.score as f64;
            let recency = recency_score(hit.created_at, now, half_life_days);
            WeightedMemory {
                final_weighted_score: weights.combine(similarity, recency, hit.importance),
                id: hit.id,
                text: hit.content,
                timestamp: hit.created_at,
                similarity_score: similarity,
                recency_score: recency,
                importance: hit.importance,
            }
        })
        .collect();

    // sort_by is stable
    ranked.sort_by(|a, b| b.final_weighted_score.total_cmp(&a.final_weighted_score));
    ranked.truncate(limit);
    ranked
}

/// Similarity-only ranking: `final_weighted_score` is the similarity.
pub fn similarity_only(
    candidates: Vec<MemoryHit>,
    now: DateTime<Utc>,
    half_life_days: f64,
    limit: usize,
) -> Vec<WeightedMemory> {
    candidates
        .into_iter()
        .take(limit)
        .map(|hit| {
            let similarity = hit.score as f64;
            WeightedMemory {
                recency_score: recency_score(hit.created_at, now, half_life_days),
                id: hit.id,
                text: hit.content,
                timestamp: hit.created_at,
                similarity_score: similarity,
                importance: hit.importance,
                final_weighted_score: similarity,
            }
        })
        .collect()
}

/// Query-time retrieval over one profile's collection.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn MemoryStore>,
    collection: String,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn MemoryStore>,
        collection: impl Into<String>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve with the configured mode and limit.
    pub async fn retrieve(&self, user_id: &str, query: &str) -> Result<Vec<WeightedMemory>> {
        match self.config.mode {
            RetrievalMode::Weighted => {
                self.retrieve_weighted(user_id, query, self.config.limit)
                    .await
            }
            RetrievalMode::Similarity => {
                self.retrieve_similar(user_id, query, self.config.limit)
                    .await
            }
        }
    }

    /// Top `limit` memories of `user_id` by fused score.
    pub async fn retrieve_weighted(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<WeightedMemory>> {
        self.retrieve_weighted_at(user_id, query, limit, Utc::now())
            .await
    }

    /// [`Self::retrieve_weighted`] against a fixed clock.
    pub async fn retrieve_weighted_at(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<WeightedMemory>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let k = limit.saturating_mul(self.config.candidate_multiplier.max(1));
        let candidates = self.candidates(user_id, query, k).await?;
        let fetched = candidates.len();

        let ranked = rank_candidates(
            candidates,
            now,
            self.config.half_life_days,
            &self.config.weights,
            limit,
        );

        debug!(user_id, candidates = fetched, returned = ranked.len(), "Weighted retrieval");

        Ok(ranked)
    }

    /// Top `limit` memories of `user_id` by similarity alone.
    pub async fn retrieve_similar(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<WeightedMemory>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.candidates(user_id, query, limit).await?;
        Ok(similarity_only(
            candidates,
            Utc::now(),
            self.config.half_life_days,
            limit,
        ))
    }

    async fn candidates(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<MemoryHit>> {
        let vector = self.embedder.embed(query).await?;
        self.store
            .search(&self.collection, &vector, &StoreFilter::owner(user_id), k)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use recall_models::MemorySource;
    use rstest::rstest;

    fn hit(id: &str, score: f32, age_days: i64, importance: f64, now: DateTime<Utc>) -> MemoryHit {
        MemoryHit {
            id: id.to_string(),
            owner_id: "u".to_string(),
            content: format!("memory {}", id),
            title: None,
            source: MemorySource::Conversation,
            importance,
            tags: Vec::new(),
            created_at: Some(now - Duration::days(age_days)),
            score,
        }
    }

    #[rstest]
    #[case(0, 1.0)]
    #[case(14, 0.5)]
    #[case(28, 0.25)]
    fn test_recency_halves_every_half_life(#[case] age_days: i64, #[case] expected: f64) {
        let now = Utc::now();
        let score = recency_score(Some(now - Duration::days(age_days)), now, 14.0);
        assert!((score - expected).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_recency_edge_cases() {
        let now = Utc::now();
        assert_eq!(recency_score(None, now, 14.0), 0.0);
        assert_eq!(recency_score(Some(now + Duration::days(3)), now, 14.0), 1.0);
    }

    #[test]
    fn test_weights_normalize() {
        let w = ScoreWeights::new(3.0, 1.0, 1.0).unwrap();
        assert!((w.similarity - 0.6).abs() < 1e-12);
        assert!((w.similarity + w.recency + w.importance - 1.0).abs() < 1e-12);

        assert_eq!(ScoreWeights::new(-0.1, 1.0, 1.0), Err(WeightsError::Negative));
        assert_eq!(ScoreWeights::new(0.0, 0.0, 0.0), Err(WeightsError::Zero));
    }

    #[test]
    fn test_rank_reorders_by_fused_score() {
        let now = Utc::now();
        let w = ScoreWeights::default();
        // b is slightly less similar but much fresher and more important.
        let ranked = rank_candidates(
            vec![hit("a", 0.80, 60, 0.1, now), hit("b", 0.78, 0, 0.9, now)],
            now,
            14.0,
            &w,
            10,
        );
        let ids: Vec<&str> = ranked.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(ranked[0].final_weighted_score >= ranked[1].final_weighted_score);
    }

    #[test]
    fn test_rank_ties_keep_similarity_order() {
        let now = Utc::now();
        let ranked = rank_candidates(
            vec![hit("first", 0.5, 1, 0.5, now), hit("second", 0.5, 1, 0.5, now)],
            now,
            14.0,
            &ScoreWeights::default(),
            2,
        );
        assert_eq!(ranked[0].id, "first");
        assert_eq!(ranked[1].id, "second");
    }

    #[test]
    fn test_rank_truncates_and_handles_empty() {
        let now = Utc::now();
        let hits = (0..5)
            .map(|i| hit(&i.to_string(), 0.9 - i as f32 * 0.1, 0, 0.5, now))
            .collect();
        assert_eq!(
            rank_candidates(hits, now, 14.0, &ScoreWeights::default(), 3).len(),
            3
        );
        assert!(rank_candidates(Vec::new(), now, 14.0, &ScoreWeights::default(), 3).is_empty());
    }

    #[test]
    fn test_similarity_only_uses_raw_similarity() {
        let now = Utc::now();
        let out = similarity_only(vec![hit("a", 0.7, 30, 1.0, now)], now, 14.0, 5);
        assert_eq!(out[0].final_weighted_score, out[0].similarity_score);
    }

    #[test]
    fn test_mode_parses() {
        assert_eq!("Similarity".parse(), Ok(RetrievalMode::Similarity));
        assert_eq!("weighted".parse(), Ok(RetrievalMode::Weighted));
        assert!("fuzzy".parse::<RetrievalMode>().is_err());
    }
}
