use async_trait::async_trait;
use deadpool_postgres::Pool;

use super::{describe_schema, ExecutionResult, QueryExecutor, SchemaDescription};
use crate::error::IntrospectionError;

/// The relational store as the request pipeline sees it.
#[async_trait]
pub trait SqlStore: Send + Sync {
    async fn describe_schema(&self) -> Result<SchemaDescription, IntrospectionError>;

    async fn execute(&self, sql: &str) -> ExecutionResult;

    async fn to_delimited_text(&self, sql: &str) -> String {
        crate::export::to_delimited_text(&self.execute(sql).await)
    }
}

/// PostgreSQL-backed store: introspects one namespace and runs SQL
/// through the shared pool.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
    namespace: String,
    executor: QueryExecutor,
}

impl PgStore {
    pub fn new(pool: Pool, namespace: impl Into<String>, read_only: bool) -> Self {
        Self {
            executor: QueryExecutor::new(pool.clone(), read_only),
            pool,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SqlStore for PgStore {
    async fn describe_schema(&self) -> Result<SchemaDescription, IntrospectionError> {
        describe_schema(&self.pool, &self.namespace).await
    }

    async fn execute(&self, sql: &str) -> ExecutionResult {
        self.executor.execute(sql).await
    }

    async fn to_delimited_text(&self, sql: &str) -> String {
        self.executor.to_delimited_text(sql).await
    }
}
