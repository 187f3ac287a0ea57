use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde_json::Value;
use tokio_postgres::Row;

use super::{
    FeedbackInput, FeedbackRecord, HistoryEntry, HistoryStore, NewQuery, QueryRecord, Rating,
    UserId,
};
use crate::db::ExecutionResult;
use crate::error::StoreError;

/// Records kept in `<schema>.queries` and `<schema>.query_feedback`.
pub struct PgHistoryStore {
    pool: Pool,
    schema: String,
    queries: String,
    feedback: String,
}

impl PgHistoryStore {
    pub fn new(pool: Pool, schema: &str) -> Self {
        let quoted = quote_ident(schema);
        Self {
            pool,
            queries: format!("{}.queries", quoted),
            feedback: format!("{}.query_feedback", quoted),
            schema: quoted,
        }
    }

    /// Create the record tables if they are missing.
    pub async fn bootstrap(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        // JSON rather than JSONB: row objects keep their column order.
        client
            .batch_execute(&format!(
                r#"
                CREATE SCHEMA IF NOT EXISTS {schema};
                CREATE TABLE IF NOT EXISTS {queries} (
                    id BIGSERIAL PRIMARY KEY,
                    owner TEXT NOT NULL,
                    natural_language TEXT NOT NULL,
                    sql_query TEXT NOT NULL,
                    result JSON,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                CREATE INDEX IF NOT EXISTS queries_owner_created_idx
                    ON {queries} (owner, created_at DESC);
                CREATE TABLE IF NOT EXISTS {feedback} (
                    query_id BIGINT PRIMARY KEY REFERENCES {queries}(id) ON DELETE CASCADE,
                    rating SMALLINT NOT NULL CHECK (rating BETWEEN 1 AND 5),
                    is_helpful BOOLEAN NOT NULL DEFAULT false,
                    comments TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                );
                "#,
                schema = self.schema,
                queries = self.queries,
                feedback = self.feedback,
            ))
            .await?;
        tracing::debug!(schema = %self.schema, "history tables ready");
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn insert_query(&self, new: NewQuery) -> Result<QueryRecord, StoreError> {
        let client = self.pool.get().await?;
        let result = new.result.as_ref().map(serde_json::to_value).transpose()?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO {} (owner, natural_language, sql_query, result)
                     VALUES ($1, $2, $3, $4)
                     RETURNING id, owner, natural_language, sql_query, result, created_at",
                    self.queries
                ),
                &[
                    &new.owner.as_str(),
                    &new.natural_language,
                    &new.sql_query,
                    &result,
                ],
            )
            .await?;
        query_from_row(&row)
    }

    async fn get_query(&self, id: i64) -> Result<Option<QueryRecord>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT id, owner, natural_language, sql_query, result, created_at
                     FROM {} WHERE id = $1",
                    self.queries
                ),
                &[&id],
            )
            .await?;
        row.map(|r| query_from_row(&r)).transpose()
    }

    async fn update_result(
        &self,
        id: i64,
        result: &ExecutionResult,
    ) -> Result<Option<QueryRecord>, StoreError> {
        let client = self.pool.get().await?;
        let value = serde_json::to_value(result)?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE {} SET result = $2 WHERE id = $1
                     RETURNING id, owner, natural_language, sql_query, result, created_at",
                    self.queries
                ),
                &[&id, &value],
            )
            .await?;
        row.map(|r| query_from_row(&r)).transpose()
    }

    async fn upsert_feedback(
        &self,
        query_id: i64,
        feedback: FeedbackInput,
    ) -> Result<FeedbackRecord, StoreError> {
        let client = self.pool.get().await?;
        let rating = i16::from(feedback.rating.value());
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO {} (query_id, rating, is_helpful, comments)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT (query_id) DO UPDATE SET
                         rating = EXCLUDED.rating,
                         is_helpful = EXCLUDED.is_helpful,
                         comments = EXCLUDED.comments
                     RETURNING query_id, rating, is_helpful, comments, created_at",
                    self.feedback
                ),
                &[&query_id, &rating, &feedback.is_helpful, &feedback.comments],
            )
            .await?;
        feedback_from_row(&row, "")
    }

    async fn get_feedback(&self, query_id: i64) -> Result<Option<FeedbackRecord>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT query_id, rating, is_helpful, comments, created_at
                     FROM {} WHERE query_id = $1",
                    self.feedback
                ),
                &[&query_id],
            )
            .await?;
        row.map(|r| feedback_from_row(&r, "")).transpose()
    }

    async fn list_queries(&self, owner: &UserId) -> Result<Vec<HistoryEntry>, StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT q.id, q.owner, q.natural_language, q.sql_query, q.result, q.created_at,
                            f.query_id AS f_query_id, f.rating AS f_rating,
                            f.is_helpful AS f_is_helpful, f.comments AS f_comments,
                            f.created_at AS f_created_at
                     FROM {} q
                     LEFT JOIN {} f ON f.query_id = q.id
                     WHERE q.owner = $1
                     ORDER BY q.created_at DESC, q.id DESC",
                    self.queries, self.feedback
                ),
                &[&owner.as_str()],
            )
            .await?;

        rows.iter()
            .map(|row| -> Result<HistoryEntry, StoreError> {
                let has_feedback = row.try_get::<_, Option<i64>>("f_query_id")?.is_some();
                Ok(HistoryEntry {
                    query: query_from_row(row)?,
                    feedback: if has_feedback {
                        Some(feedback_from_row(row, "f_")?)
                    } else {
                        None
                    },
                })
            })
            .collect()
    }
}

fn query_from_row(row: &Row) -> Result<QueryRecord, StoreError> {
    let result: Option<Value> = row.try_get("result")?;
    let owner: String = row.try_get("owner")?;
    Ok(QueryRecord {
        id: row.try_get("id")?,
        owner: UserId::new(owner),
        natural_language: row.try_get("natural_language")?,
        sql_query: row.try_get("sql_query")?,
        result: result.map(serde_json::from_value).transpose()?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
    })
}

fn feedback_from_row(row: &Row, prefix: &str) -> Result<FeedbackRecord, StoreError> {
    let col = |name: &str| format!("{}{}", prefix, name);
    let rating: i16 = row.try_get(col("rating").as_str())?;
    Ok(FeedbackRecord {
        query_id: row.try_get(col("query_id").as_str())?,
        // the table's CHECK constraint keeps this in range
        rating: Rating::try_from(i64::from(rating)).map_err(|e| {
            StoreError::Corrupt(serde::de::Error::custom(e.to_string()))
        })?,
        is_helpful: row.try_get(col("is_helpful").as_str())?,
        comments: row.try_get(col("comments").as_str())?,
        created_at: row.try_get::<_, DateTime<Utc>>(col("created_at").as_str())?,
    })
}

/// Quote an identifier from configuration for use in DDL/DML text.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
