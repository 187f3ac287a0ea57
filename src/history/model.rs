use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::ExecutionResult;
use crate::error::ValidationError;

/// Identity of the requesting user, as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: i64,
    pub owner: UserId,
    pub natural_language: String,
    pub sql_query: String,
    /// `None` until the SQL has been executed.
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
}

/// Fields of a record before the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub owner: UserId,
    pub natural_language: String,
    pub sql_query: String,
    pub result: Option<ExecutionResult>,
}

/// A 1-5 star rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u8::try_from(value) {
            Ok(v @ 1..=5) => Ok(Rating(v)),
            _ => Err(ValidationError::Rating(value)),
        }
    }
}

impl From<Rating> for i64 {
    fn from(rating: Rating) -> Self {
        i64::from(rating.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackInput {
    pub rating: Rating,
    pub is_helpful: bool,
    pub comments: Option<String>,
}

impl FeedbackInput {
    /// Validate raw form values. Blank comments count as none.
    pub fn new(
        rating: i64,
        is_helpful: bool,
        comments: Option<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            rating: Rating::try_from(rating)?,
            is_helpful,
            comments: comments
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub query_id: i64,
    pub rating: Rating,
    pub is_helpful: bool,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A record as shown in a user's history, with its feedback if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query: QueryRecord,
    pub feedback: Option<FeedbackRecord>,
}
