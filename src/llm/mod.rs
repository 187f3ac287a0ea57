//! Natural-language question to SQL text.

mod backend;
mod extract;
mod prompt;

pub use backend::{
    parse_generation_response, GenerationParameters, HuggingFaceBackend, TextGenerationBackend,
};
pub use extract::{extract_sql, is_not_relevant, NOT_RELEVANT};
pub use prompt::{build_prompt, PromptStrategy, PLACEMENT_SCHEMA};

use std::sync::Arc;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{ConfigurationError, GenerationError};

/// Construct the backend named by `config.service`. Unknown services are
/// rejected here rather than on first use.
pub fn build_backend(
    config: &GenerationConfig,
) -> Result<Arc<dyn TextGenerationBackend>, ConfigurationError> {
    match config.service.trim().to_ascii_lowercase().as_str() {
        "huggingface" => {
            let endpoint = config
                .endpoint
                .clone()
                .unwrap_or_else(|| HuggingFaceBackend::model_endpoint(&config.model));
            let backend = HuggingFaceBackend::new(
                &endpoint,
                &config.api_key,
                Duration::from_secs(config.timeout_secs),
                config.max_retries,
            )?;
            Ok(Arc::new(backend))
        }
        _ => Err(ConfigurationError::UnsupportedService(config.service.clone())),
    }
}

pub struct Synthesizer {
    backend: Arc<dyn TextGenerationBackend>,
    strategy: PromptStrategy,
    parameters: GenerationParameters,
}

impl Synthesizer {
    pub fn new(
        backend: Arc<dyn TextGenerationBackend>,
        strategy: PromptStrategy,
        parameters: GenerationParameters,
    ) -> Self {
        Self {
            backend,
            strategy,
            parameters,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, ConfigurationError> {
        Ok(Self::new(
            build_backend(config)?,
            config.strategy,
            config.parameters(),
        ))
    }

    pub fn strategy(&self) -> PromptStrategy {
        self.strategy
    }

    /// Returns either one SQL statement or the not-relevant sentinel.
    pub async fn synthesize_sql(
        &self,
        question: &str,
        schema_text: &str,
    ) -> Result<String, GenerationError> {
        let prompt = build_prompt(self.strategy, question, schema_text);
        let raw = self.backend.generate(&prompt, &self.parameters).await?;
        let sql = extract_sql(&raw);

        tracing::info!(strategy = ?self.strategy, sql = %sql, "generated SQL");

        Ok(sql)
    }
}
