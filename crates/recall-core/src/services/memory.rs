//! Direct memory management: save, forget, replace and retention sweeps.
//!
//! Content is never edited in place. A replacement stores a new record
//! under a fresh id and removes the old one, so every embedding always
//! matches its content.

use chrono::{Duration, Utc};
use recall_models::{MemoryRecord, NewMemory};
use tracing::{debug, info};

use super::extraction::RecordWriter;
use super::store::StoreFilter;
use crate::error::{Error, Result};

/// Which of a user's memories a sweep may delete.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    /// Memories older than this many days are eligible.
    pub max_age_days: u32,
    /// Memories at or above this importance are never swept.
    pub protect_importance_at: f64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            protect_importance_at: 0.8,
        }
    }
}

#[derive(Clone)]
pub struct MemoryService {
    writer: RecordWriter,
}

impl MemoryService {
    pub fn new(writer: RecordWriter) -> Self {
        Self { writer }
    }

    /// Embed and store one memory.
    pub async fn save(&self, input: NewMemory) -> Result<MemoryRecord> {
        let mut input = input;
        input.content = input.content.trim().to_string();
        if input.content.is_empty() {
            return Err(Error::InvalidInput("Memory content is empty".into()));
        }
        if input.owner_id.trim().is_empty() {
            return Err(Error::InvalidInput("Memory owner is empty".into()));
        }
        if let Some(ref id) = input.id {
            if uuid::Uuid::parse_str(id).is_err() {
                return Err(Error::InvalidInput(format!("Memory id is not a UUID: {}", id)));
            }
        }

        let embedder = self.writer.embedder();
        let vector = embedder.embed(&input.content).await?;
        let record = MemoryRecord::new(input, vector, embedder.dimension())?;

        self.writer
            .store()
            .upsert(self.writer.collection(), std::slice::from_ref(&record))
            .await?;

        metrics::counter!(
            "recall_memories_stored_total",
            "source" => record.source.as_str().to_string()
        )
        .increment(1);
        debug!(memory_id = %record.id, owner_id = %record.owner_id, "Saved memory");

        Ok(record)
    }

    /// Delete a memory if `user_id` owns it. Returns whether one was removed.
    pub async fn forget(&self, user_id: &str, memory_id: &str) -> Result<bool> {
        let removed = self
            .writer
            .store()
            .delete(
                self.writer.collection(),
                &StoreFilter::owner(user_id).with_id(memory_id),
            )
            .await?;

        debug!(user_id, memory_id, removed, "Forget memory");

        Ok(removed > 0)
    }

    /// Swap a memory's content, keeping its source, importance, title and
    /// tags. The new record gets a fresh id.
    pub async fn replace(
        &self,
        user_id: &str,
        memory_id: &str,
        new_content: &str,
    ) -> Result<MemoryRecord> {
        let filter = StoreFilter::owner(user_id).with_id(memory_id);
        let existing = self
            .writer
            .store()
            .fetch(self.writer.collection(), &filter, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("Memory not found: {}", memory_id)))?;

        let mut input = NewMemory::new(user_id, new_content)
            .with_source(existing.source)
            .with_importance(existing.importance)
            .with_tags(existing.tags);
        input.title = existing.title;

        // New record lands before the old one is removed
        let record = self.save(input).await?;
        self.writer
            .store()
            .delete(self.writer.collection(), &filter)
            .await?;

        info!(user_id, old_id = memory_id, new_id = %record.id, "Replaced memory");

        Ok(record)
    }

    /// Delete the user's unprotected memories older than the policy allows.
    pub async fn sweep(&self, user_id: &str, policy: RetentionPolicy) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(policy.max_age_days));
        let filter = StoreFilter::owner(user_id)
            .created_before(cutoff)
            .importance_below(policy.protect_importance_at);

        let removed = self
            .writer
            .store()
            .delete(self.writer.collection(), &filter)
            .await?;

        info!(user_id, removed, max_age_days = policy.max_age_days, "Retention sweep");

        Ok(removed)
    }
}
