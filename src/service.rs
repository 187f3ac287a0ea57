//! Operations the surrounding application calls: ask a question, re-run
//! or export a stored query, leave feedback, browse history.

use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{ExecutionResult, SchemaDescription, SqlStore, SCHEMA_UNAVAILABLE};
use crate::error::{AuthorizationError, IntrospectionError, Result, ServiceError, ValidationError};
use crate::export::export_filename;
use crate::history::{
    FeedbackInput, FeedbackRecord, HistoryEntry, HistoryStore, NewQuery, QueryRecord, UserId,
};
use crate::llm::{is_not_relevant, PromptStrategy, Synthesizer};

/// Result message stored when the model says the question does not fit
/// the dataset. The sentinel itself is never sent to the store.
pub const NOT_RELEVANT_MESSAGE: &str = "The question cannot be answered from this dataset";

/// Delimited text ready for download.
#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub filename: String,
    pub content: String,
}

pub struct QueryService {
    store: Arc<dyn SqlStore>,
    synthesizer: Synthesizer,
    history: Arc<dyn HistoryStore>,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn SqlStore>,
        synthesizer: Synthesizer,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            store,
            synthesizer,
            history,
        }
    }

    /// Structured schema plus its prompt rendering. Failure is reported,
    /// not hidden behind an empty schema.
    pub async fn describe_schema(
        &self,
    ) -> std::result::Result<(SchemaDescription, String), IntrospectionError> {
        let schema = self.store.describe_schema().await?;
        let text = schema.render();
        Ok((schema, text))
    }

    /// Schema text for the prompt. A failed introspection degrades to a
    /// placeholder so the question can still be attempted.
    async fn prompt_schema_text(&self) -> String {
        match self.describe_schema().await {
            Ok((_, text)) => text,
            Err(e) => {
                warn!(error = %e, "schema introspection failed, continuing without schema");
                SCHEMA_UNAVAILABLE.to_string()
            }
        }
    }

    async fn run(&self, sql: &str) -> ExecutionResult {
        if is_not_relevant(sql) {
            return ExecutionResult::failure(NOT_RELEVANT_MESSAGE);
        }
        self.store.execute(sql).await
    }

    pub async fn submit_query(&self, user: &UserId, question: &str) -> Result<QueryRecord> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ValidationError::EmptyQuestion.into());
        }

        let schema_text = match self.synthesizer.strategy() {
            PromptStrategy::SchemaDriven => self.prompt_schema_text().await,
            // the fixed prompt carries its own schema
            PromptStrategy::FixedSchema => String::new(),
        };

        let sql = self
            .synthesizer
            .synthesize_sql(question, &schema_text)
            .await
            .inspect_err(|e| warn!(%user, error = %e, "SQL generation failed"))?;

        let result = self.run(&sql).await;

        let record = self
            .history
            .insert_query(NewQuery {
                owner: user.clone(),
                natural_language: question.to_string(),
                sql_query: sql,
                result: Some(result),
            })
            .await?;

        info!(
            %user,
            query_id = record.id,
            success = record.result.as_ref().is_some_and(ExecutionResult::is_success),
            "query recorded"
        );

        Ok(record)
    }

    pub async fn rerun(&self, user: &UserId, query_id: i64) -> Result<QueryRecord> {
        let record = self.owned_query(user, query_id).await?;
        let result = self.run(&record.sql_query).await;

        self.history
            .update_result(query_id, &result)
            .await?
            .ok_or(ServiceError::NotFound(query_id))
    }

    /// Re-execute and render for download. The stored record is untouched.
    pub async fn export(&self, user: &UserId, query_id: i64) -> Result<Export> {
        let record = self.owned_query(user, query_id).await?;
        let content = if is_not_relevant(&record.sql_query) {
            crate::export::to_delimited_text(&ExecutionResult::failure(NOT_RELEVANT_MESSAGE))
        } else {
            self.store.to_delimited_text(&record.sql_query).await
        };

        Ok(Export {
            filename: export_filename(query_id),
            content,
        })
    }

    pub async fn submit_feedback(
        &self,
        user: &UserId,
        query_id: i64,
        rating: i64,
        is_helpful: bool,
        comments: Option<String>,
    ) -> Result<FeedbackRecord> {
        self.owned_query(user, query_id).await?;
        let input = FeedbackInput::new(rating, is_helpful, comments)?;
        Ok(self.history.upsert_feedback(query_id, input).await?)
    }

    pub async fn get_query(&self, user: &UserId, query_id: i64) -> Result<QueryRecord> {
        self.owned_query(user, query_id).await
    }

    pub async fn history(&self, user: &UserId) -> Result<Vec<HistoryEntry>> {
        Ok(self.history.list_queries(user).await?)
    }

    async fn owned_query(&self, user: &UserId, query_id: i64) -> Result<QueryRecord> {
        let record = self
            .history
            .get_query(query_id)
            .await?
            .ok_or(ServiceError::NotFound(query_id))?;

        if &record.owner != user {
            warn!(%user, query_id, "rejected access to another user's query");
            return Err(AuthorizationError {
                user: user.to_string(),
                query_id,
            }
            .into());
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ColumnDescriptor, TableDescriptor};
    use crate::error::GenerationError;
    use crate::history::MemoryHistoryStore;
    use crate::llm::{GenerationParameters, TextGenerationBackend, NOT_RELEVANT};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const ML_MARCH_SQL: &str =
        "SELECT COUNT(*) FROM companies WHERE industry = 'ML' AND visit_month = 3;";

    struct ScriptedBackend {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TextGenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            prompt: &str,
            _parameters: &GenerationParameters,
        ) -> std::result::Result<String, GenerationError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().ok_or(GenerationError::Status {
                status: 500,
                body: "internal error".to_string(),
            })
        }
    }

    struct FakeStore {
        schema_fails: bool,
        executed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SqlStore for FakeStore {
        async fn describe_schema(
            &self,
        ) -> std::result::Result<SchemaDescription, IntrospectionError> {
            if self.schema_fails {
                // a closed pool stands in for any catalog failure
                return Err(IntrospectionError::Pool(
                    deadpool_postgres::PoolError::Closed,
                ));
            }
            Ok(SchemaDescription {
                tables: vec![TableDescriptor {
                    name: "companies".to_string(),
                    columns: vec![
                        ColumnDescriptor {
                            name: "industry".to_string(),
                            data_type: "text".to_string(),
                        },
                        ColumnDescriptor {
                            name: "visit_month".to_string(),
                            data_type: "integer".to_string(),
                        },
                    ],
                    foreign_keys: vec![],
                }],
            })
        }

        async fn execute(&self, sql: &str) -> ExecutionResult {
            self.executed.lock().unwrap().push(sql.to_string());
            if sql.contains("companies") {
                let row = serde_json::json!({"count": 2});
                ExecutionResult::Success {
                    columns: vec!["count".to_string()],
                    rows: vec![row.as_object().cloned().unwrap()],
                }
            } else {
                ExecutionResult::failure(format!("relation in \"{}\" does not exist", sql))
            }
        }
    }

    struct Harness {
        service: QueryService,
        backend: Arc<ScriptedBackend>,
        store: Arc<FakeStore>,
        history: Arc<MemoryHistoryStore>,
    }

    fn harness(reply: Option<&str>, strategy: PromptStrategy, schema_fails: bool) -> Harness {
        let backend = Arc::new(ScriptedBackend {
            reply: reply.map(str::to_string),
            prompts: Mutex::new(Vec::new()),
        });
        let store = Arc::new(FakeStore {
            schema_fails,
            executed: Mutex::new(Vec::new()),
        });
        let history = Arc::new(MemoryHistoryStore::new());
        let synthesizer =
            Synthesizer::new(backend.clone(), strategy, GenerationParameters::default());
        Harness {
            service: QueryService::new(store.clone(), synthesizer, history.clone()),
            backend,
            store,
            history,
        }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn mallory() -> UserId {
        UserId::new("mallory")
    }

    #[tokio::test]
    async fn test_submit_query_ml_companies_in_march() {
        let h = harness(
            Some(&format!("Answer: {} -- counts companies", ML_MARCH_SQL)),
            PromptStrategy::FixedSchema,
            false,
        );
        let record = h
            .service
            .submit_query(&alice(), "How many ML companies visit in March?")
            .await
            .unwrap();

        assert!(record.sql_query.contains("companies"));
        assert!(record.sql_query.contains("industry = 'ML'"));
        assert!(record.sql_query.contains("visit_month = 3"));
        assert!(record.result.as_ref().unwrap().is_success());
        assert_eq!(record.owner, alice());
        assert_eq!(h.history.get_query(record.id).await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_schema_driven_prompt_contains_live_schema() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::SchemaDriven, false);
        h.service.submit_query(&alice(), "How many ML companies?").await.unwrap();
        let prompts = h.backend.prompts.lock().unwrap();
        assert!(prompts[0].contains("Table: companies"));
        assert!(prompts[0].contains("  - visit_month (integer)"));
    }

    #[tokio::test]
    async fn test_introspection_failure_degrades() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::SchemaDriven, true);
        let record = h.service.submit_query(&alice(), "How many?").await.unwrap();
        assert!(h.backend.prompts.lock().unwrap()[0].contains(SCHEMA_UNAVAILABLE));
        assert!(record.result.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_describe_schema_reports_failure() {
        let h = harness(None, PromptStrategy::SchemaDriven, true);
        assert!(h.service.describe_schema().await.is_err());

        let h = harness(None, PromptStrategy::SchemaDriven, false);
        let (schema, text) = h.service.describe_schema().await.unwrap();
        assert_eq!(schema.tables.len(), 1);
        assert_eq!(text, schema.render());
    }

    #[tokio::test]
    async fn test_generation_failure_propagates_without_record() {
        let h = harness(None, PromptStrategy::SchemaDriven, false);
        let err = h.service.submit_query(&alice(), "How many?").await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Generation(GenerationError::Status { status: 500, .. })
        ));
        assert!(h.history.list_queries(&alice()).await.unwrap().is_empty());
        assert!(h.store.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execution_failure_is_persisted() {
        let h = harness(Some("SELECT * FROM nowhere;"), PromptStrategy::SchemaDriven, false);
        let record = h.service.submit_query(&alice(), "Show nowhere").await.unwrap();
        match record.result {
            Some(ExecutionResult::Failure { message }) => assert!(!message.is_empty()),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_relevant_is_not_executed() {
        let h = harness(Some(NOT_RELEVANT), PromptStrategy::FixedSchema, false);
        let record = h
            .service
            .submit_query(&alice(), "What is the capital of France?")
            .await
            .unwrap();
        assert_eq!(record.sql_query, NOT_RELEVANT);
        assert_eq!(
            record.result,
            Some(ExecutionResult::failure(NOT_RELEVANT_MESSAGE))
        );
        assert!(h.store.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fixed_schema_skips_introspection_failure() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, true);
        h.service.submit_query(&alice(), "How many?").await.unwrap();
        assert!(!h.backend.prompts.lock().unwrap()[0].contains(SCHEMA_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_empty_question_rejected_before_backend() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::SchemaDriven, false);
        let err = h.service.submit_query(&alice(), "   ").await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::EmptyQuestion)));
        assert!(h.backend.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_overwrites_in_place_and_is_repeatable() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let record = h.service.submit_query(&alice(), "How many?").await.unwrap();
        h.history
            .update_result(record.id, &ExecutionResult::failure("stale"))
            .await
            .unwrap();

        let first = h.service.rerun(&alice(), record.id).await.unwrap();
        let second = h.service.rerun(&alice(), record.id).await.unwrap();

        assert_eq!(first.id, record.id);
        assert_eq!(first.result, second.result);
        assert!(first.result.unwrap().is_success());
        assert_eq!(h.history.list_queries(&alice()).await.unwrap().len(), 1);
        assert_eq!(h.store.executed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rerun_missing_query() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let err = h.service.rerun(&alice(), 404).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(404)));
    }

    #[tokio::test]
    async fn test_export_renders_without_mutating() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let record = h.service.submit_query(&alice(), "How many?").await.unwrap();
        h.history
            .update_result(record.id, &ExecutionResult::failure("stale"))
            .await
            .unwrap();

        let export = h.service.export(&alice(), record.id).await.unwrap();
        assert_eq!(export.content, "count\n2\n");
        assert_eq!(export.filename, format!("query_result_{}.csv", record.id));

        let stored = h.history.get_query(record.id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(ExecutionResult::failure("stale")));
    }

    #[tokio::test]
    async fn test_non_owner_is_rejected_everywhere() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let record = h.service.submit_query(&alice(), "How many?").await.unwrap();
        let executed_before = h.store.executed.lock().unwrap().len();

        assert!(matches!(
            h.service.rerun(&mallory(), record.id).await,
            Err(ServiceError::Authorization(_))
        ));
        assert!(matches!(
            h.service.export(&mallory(), record.id).await,
            Err(ServiceError::Authorization(_))
        ));
        assert!(matches!(
            h.service
                .submit_feedback(&mallory(), record.id, 1, false, None)
                .await,
            Err(ServiceError::Authorization(_))
        ));
        // an out-of-range rating still reports ownership first
        assert!(matches!(
            h.service
                .submit_feedback(&mallory(), record.id, 9, false, None)
                .await,
            Err(ServiceError::Authorization(_))
        ));
        assert!(matches!(
            h.service.get_query(&mallory(), record.id).await,
            Err(ServiceError::Authorization(_))
        ));

        assert_eq!(h.store.executed.lock().unwrap().len(), executed_before);
        assert_eq!(
            h.history.get_query(record.id).await.unwrap().unwrap(),
            record
        );
        assert!(h.history.get_feedback(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feedback_validation_and_upsert() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let record = h.service.submit_query(&alice(), "How many?").await.unwrap();

        let err = h
            .service
            .submit_feedback(&alice(), record.id, 0, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(ValidationError::Rating(0))));

        h.service
            .submit_feedback(&alice(), record.id, 2, false, Some("wrong month".into()))
            .await
            .unwrap();
        let updated = h
            .service
            .submit_feedback(&alice(), record.id, 5, true, Some(String::new()))
            .await
            .unwrap();

        assert_eq!(updated.rating.value(), 5);
        assert!(updated.is_helpful);
        assert!(updated.comments.is_none());
        assert_eq!(h.history.get_feedback(record.id).await.unwrap(), Some(updated));
    }

    #[tokio::test]
    async fn test_history_is_per_user_with_feedback() {
        let h = harness(Some(ML_MARCH_SQL), PromptStrategy::FixedSchema, false);
        let mine = h.service.submit_query(&alice(), "first").await.unwrap();
        h.service.submit_query(&mallory(), "theirs").await.unwrap();
        h.service
            .submit_feedback(&alice(), mine.id, 4, true, None)
            .await
            .unwrap();

        let entries = h.service.history(&alice()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query.id, mine.id);
        assert_eq!(entries[0].feedback.as_ref().map(|f| f.rating.value()), Some(4));
    }
}
