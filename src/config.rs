use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::ConnectionConfig;
use crate::llm::{GenerationParameters, PromptStrategy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: ConnectionConfig,
    pub generation: GenerationConfig,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Backend kind. Only `huggingface` is implemented.
    pub service: String,
    pub model: String,
    /// Overrides the endpoint derived from `model`.
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub strategy: PromptStrategy,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationConfig {
    pub fn parameters(&self) -> GenerationParameters {
        GenerationParameters {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            return_full_text: false,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let params = GenerationParameters::default();
        Self {
            service: String::from("huggingface"),
            model: String::from("defog/sqlcoder-7b-2"),
            endpoint: None,
            api_key: String::new(),
            strategy: PromptStrategy::default(),
            timeout_secs: 60,
            max_retries: 2,
            max_new_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Only run single SELECT-style statements, inside a read-only transaction.
    pub read_only: bool,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nlsql")
            .join("config.toml")
    }

    /// Load from `path`, or from the default location. A missing file
    /// yields defaults. Secrets in the environment win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(password) = var("PGPASSWORD") {
            self.database.password = password;
        }
        if let Some(key) = var("HUGGINGFACE_API_KEY") {
            self.generation.api_key = key;
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.generation.service, "huggingface");
        assert_eq!(config.generation.strategy, PromptStrategy::SchemaDriven);
        assert!(!config.executor.read_only);
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            host = "db.campus.internal"
            database = "placements"
            ssl_mode = "Require"

            [generation]
            strategy = "fixed_schema"
            max_retries = 0

            [executor]
            read_only = true
            "#,
        )
        .unwrap();
        assert_eq!(config.database.host, "db.campus.internal");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.ssl_mode, crate::db::SslMode::Require);
        assert_eq!(config.generation.strategy, PromptStrategy::FixedSchema);
        assert_eq!(config.generation.max_retries, 0);
        assert_eq!(config.generation.max_new_tokens, 512);
        assert!(config.executor.read_only);
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "PGPASSWORD" => Some("pg-secret".to_string()),
            "HUGGINGFACE_API_KEY" => Some("hf_secret".to_string()),
            _ => None,
        });
        assert_eq!(config.database.password, "pg-secret");
        assert_eq!(config.generation.api_key, "hf_secret");
    }

    #[test]
    fn test_secrets_never_written() {
        let mut config = AppConfig::default();
        config.database.password = "pg-secret".to_string();
        config.generation.api_key = "hf_secret".to_string();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("pg-secret"));
        assert!(!text.contains("hf_secret"));
    }

    #[test]
    fn test_parameters_from_config() {
        let config = GenerationConfig {
            temperature: 0.3,
            ..GenerationConfig::default()
        };
        let params = config.parameters();
        assert!((params.temperature - 0.3).abs() < f32::EPSILON);
        assert!(!params.return_full_text);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("nlsql-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = AppConfig::default();
        config.database.database = "placements".to_string();
        config.save(&path).unwrap();

        let loaded = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.database.database, "placements");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
