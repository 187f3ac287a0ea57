//! Persisted question/SQL/result records and their feedback.

mod memory;
mod model;
mod postgres;

pub use memory::MemoryHistoryStore;
pub use model::*;
pub use postgres::PgHistoryStore;

use async_trait::async_trait;

use crate::db::ExecutionResult;
use crate::error::StoreError;

/// Storage for query records. Ownership checks are the caller's job; the
/// store only looks records up by id or owner.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_query(&self, new: NewQuery) -> Result<QueryRecord, StoreError>;

    async fn get_query(&self, id: i64) -> Result<Option<QueryRecord>, StoreError>;

    /// Overwrite the stored result. `None` if the record does not exist.
    async fn update_result(
        &self,
        id: i64,
        result: &ExecutionResult,
    ) -> Result<Option<QueryRecord>, StoreError>;

    /// Create or replace the single feedback row for `query_id`. The
    /// original creation time survives a replacement.
    async fn upsert_feedback(
        &self,
        query_id: i64,
        feedback: FeedbackInput,
    ) -> Result<FeedbackRecord, StoreError>;

    async fn get_feedback(&self, query_id: i64) -> Result<Option<FeedbackRecord>, StoreError>;

    /// Newest first.
    async fn list_queries(&self, owner: &UserId) -> Result<Vec<HistoryEntry>, StoreError>;
}
