use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{
    FeedbackInput, FeedbackRecord, HistoryEntry, HistoryStore, NewQuery, QueryRecord, UserId,
};
use crate::db::ExecutionResult;
use crate::error::StoreError;

#[derive(Default)]
struct State {
    next_id: i64,
    queries: BTreeMap<i64, QueryRecord>,
    feedback: HashMap<i64, FeedbackRecord>,
}

/// Process-local store for tests and `--memory` runs.
#[derive(Default)]
pub struct MemoryHistoryStore {
    state: RwLock<State>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert_query(&self, new: NewQuery) -> Result<QueryRecord, StoreError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let record = QueryRecord {
            id: state.next_id,
            owner: new.owner,
            natural_language: new.natural_language,
            sql_query: new.sql_query,
            result: new.result,
            created_at: Utc::now(),
        };
        state.queries.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_query(&self, id: i64) -> Result<Option<QueryRecord>, StoreError> {
        Ok(self.state.read().await.queries.get(&id).cloned())
    }

    async fn update_result(
        &self,
        id: i64,
        result: &ExecutionResult,
    ) -> Result<Option<QueryRecord>, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.queries.get_mut(&id).map(|record| {
            record.result = Some(result.clone());
            record.clone()
        }))
    }

    async fn upsert_feedback(
        &self,
        query_id: i64,
        feedback: FeedbackInput,
    ) -> Result<FeedbackRecord, StoreError> {
        let mut state = self.state.write().await;
        if !state.queries.contains_key(&query_id) {
            return Err(StoreError::MissingQuery(query_id));
        }

        let created_at = state
            .feedback
            .get(&query_id)
            .map(|existing| existing.created_at)
            .unwrap_or_else(Utc::now);
        let record = FeedbackRecord {
            query_id,
            rating: feedback.rating,
            is_helpful: feedback.is_helpful,
            comments: feedback.comments,
            created_at,
        };
        state.feedback.insert(query_id, record.clone());
        Ok(record)
    }

    async fn get_feedback(&self, query_id: i64) -> Result<Option<FeedbackRecord>, StoreError> {
        Ok(self.state.read().await.feedback.get(&query_id).cloned())
    }

    async fn list_queries(&self, owner: &UserId) -> Result<Vec<HistoryEntry>, StoreError> {
        let state = self.state.read().await;
        // ids grow with insertion time, so reverse id order is newest first
        Ok(state
            .queries
            .values()
            .rev()
            .filter(|q| &q.owner == owner)
            .map(|q| HistoryEntry {
                query: q.clone(),
                feedback: state.feedback.get(&q.id).cloned(),
            })
            .collect())
    }
}
