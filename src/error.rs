use thiserror::Error;

/// Reading the store catalog failed. The schema is unknown, which is not
/// the same thing as an empty schema.
#[derive(Debug, Error)]
pub enum IntrospectionError {
    #[error("could not get a store connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("catalog query failed: {0}")]
    Catalog(#[from] tokio_postgres::Error),
}

/// The text-generation backend could not produce usable output.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation backend unreachable: {0}")]
    Transport(String),

    #[error("generation backend timed out")]
    Timeout,

    #[error("generation backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response from generation backend: {0}")]
    UnexpectedResponse(String),
}

impl GenerationError {
    /// Failures worth another attempt: network trouble, rate limiting and
    /// a model that is still loading (503).
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Transport(_) | GenerationError::Timeout => true,
            GenerationError::Status { status, .. } => *status == 429 || *status >= 500,
            GenerationError::UnexpectedResponse(_) => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("user {user} does not own query {query_id}")]
pub struct AuthorizationError {
    pub user: String,
    pub query_id: i64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("rating must be between 1 and 5, got {0}")]
    Rating(i64),

    #[error("question must not be empty")]
    EmptyQuestion,
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("unsupported generation service type: {0}")]
    UnsupportedService(String),

    #[error("missing API key for generation service {0}")]
    MissingApiKey(String),

    #[error("invalid generation endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("could not build HTTP client: {0}")]
    HttpClient(String),
}

/// Persisting or loading a query record failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not get a store connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("history query failed: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("stored result is malformed: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("no query record with id {0}")]
    MissingQuery(i64),
}

/// Outcome of a collaborator-facing operation that did not succeed.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query {0} not found")]
    NotFound(i64),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
