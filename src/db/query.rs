use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::Pool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::error::Error as StdError;
use std::fmt;
use std::fmt::Write;
use std::time::Instant;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, Row};

/// One result row: column name to scalar, in column order.
pub type ResultRow = serde_json::Map<String, Value>;

/// Outcome of running one statement. Always fully formed: either every
/// row has exactly the listed columns, or there is an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredResult", into = "StoredResult")]
pub enum ExecutionResult {
    Success {
        columns: Vec<String>,
        rows: Vec<ResultRow>,
    },
    Failure {
        message: String,
    },
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn row_count(&self) -> usize {
        match self {
            ExecutionResult::Success { rows, .. } => rows.len(),
            ExecutionResult::Failure { .. } => 0,
        }
    }
}

/// Persisted JSON shape: `{"success": true, "data": [...], "columns": [...]}`
/// or `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Vec<ResultRow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<ExecutionResult> for StoredResult {
    fn from(result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success { columns, rows } => StoredResult {
                success: true,
                data: Some(rows),
                columns: Some(columns),
                error: None,
            },
            ExecutionResult::Failure { message } => StoredResult {
                success: false,
                data: None,
                columns: None,
                error: Some(message),
            },
        }
    }
}

impl TryFrom<StoredResult> for ExecutionResult {
    type Error = String;

    fn try_from(stored: StoredResult) -> Result<Self, Self::Error> {
        match stored {
            StoredResult {
                success: true,
                data: Some(rows),
                columns: Some(columns),
                error: None,
            } => {
                let well_formed = rows
                    .iter()
                    .all(|row| row.len() == columns.len() && columns.iter().all(|c| row.contains_key(c)));
                if !well_formed {
                    return Err("row keys do not match column list".to_string());
                }
                Ok(ExecutionResult::Success { columns, rows })
            }
            StoredResult {
                success: false,
                data: None,
                columns: None,
                error: Some(message),
            } => Ok(ExecutionResult::Failure { message }),
            _ => Err("result must be either success with data and columns, or failure with error".to_string()),
        }
    }
}

/// Categorized error types for SQL query failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., read-only transaction)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Statement cancelled (statement_timeout)
    Cancelled,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    let Some(class) = code.get(..2) else {
        return ErrorCategory::Unknown;
    };
    match class {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                // 42P01 = undefined_table, 42703 = undefined_column, etc.
                ErrorCategory::Semantic
            }
        }
        "22" | "23" | "53" | "54" | "55" => ErrorCategory::Execution,
        // 57014 = query_canceled
        "57" if code == "57014" => ErrorCategory::Cancelled,
        "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// Turn a driver error into a category and a human-readable message that
/// carries the server's detail and hint when present.
fn describe_pg_error(err: &tokio_postgres::Error) -> (ErrorCategory, String) {
    if let Some(db_err) = err.as_db_error() {
        let category = categorize_sqlstate(db_err.code().code());
        let mut message = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            let _ = write!(message, "\nDetail: {}", detail);
        }
        if let Some(hint) = db_err.hint() {
            let _ = write!(message, "\nHint: {}", hint);
        }
        (category, message)
    } else {
        let category = if err.source().is_some() || err.is_closed() {
            ErrorCategory::Connection
        } else {
            ErrorCategory::Unknown
        };
        (category, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Numeric(n) => n.clone(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
        }
    }

    /// Scalar JSON form stored in a result row.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int16(i) => serde_json::json!(*i),
            CellValue::Int32(i) => serde_json::json!(*i),
            CellValue::Int64(i) => serde_json::json!(*i),
            CellValue::Float32(f) => serde_json::Number::from_f64(f64::from(*f))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Numeric(n) => exact_f64(n)
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.clone())),
            CellValue::Json(j) => j.clone(),
            other => Value::String(other.display()),
        }
    }
}

/// The decimal as an f64, only when the f64 prints back to the same value.
/// Wider decimals stay text so nothing is rounded away.
fn exact_f64(decimal: &str) -> Option<f64> {
    let value = decimal.parse::<f64>().ok().filter(|v| v.is_finite())?;
    let canonical = if decimal.contains('.') {
        decimal.trim_end_matches('0').trim_end_matches('.')
    } else {
        decimal
    };
    (value.to_string() == canonical).then_some(value)
}

/// Runs generated SQL against the store.
#[derive(Clone)]
pub struct QueryExecutor {
    pool: Pool,
    read_only: bool,
}

impl QueryExecutor {
    pub fn new(pool: Pool, read_only: bool) -> Self {
        Self { pool, read_only }
    }

    /// Run one statement. Every failure, including not getting a
    /// connection, comes back as `ExecutionResult::Failure`.
    pub async fn execute(&self, sql: &str) -> ExecutionResult {
        if self.read_only {
            if let Err(message) = ensure_read_only(sql) {
                tracing::warn!(%message, "statement rejected by read-only guard");
                return ExecutionResult::failure(message);
            }
        }

        let client = match self.pool.get().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "no store connection for execution");
                return ExecutionResult::failure(e.to_string());
            }
        };

        if self.read_only {
            execute_read_only(&client, sql).await
        } else {
            execute_query(&client, sql).await
        }
    }

    /// Same execution, rendered as delimited text. Failures render as
    /// `Error: <message>`.
    pub async fn to_delimited_text(&self, sql: &str) -> String {
        crate::export::to_delimited_text(&self.execute(sql).await)
    }
}

/// Reject anything that is not exactly one query statement.
pub fn ensure_read_only(sql: &str) -> Result<(), String> {
    let dialect = PostgreSqlDialect {};
    let statements = SqlParser::parse_sql(&dialect, sql)
        .map_err(|e| format!("could not verify statement is read-only: {}", e))?;

    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [] => Err("no statement to execute".to_string()),
        [_] => Err("only queries are allowed in read-only mode".to_string()),
        _ => Err(format!("expected 1 statement, found {}", statements.len())),
    }
}

/// Run inside a READ ONLY transaction that is always rolled back.
async fn execute_read_only(client: &Client, sql: &str) -> ExecutionResult {
    if let Err(e) = client.batch_execute("BEGIN TRANSACTION READ ONLY").await {
        let (_, message) = describe_pg_error(&e);
        return ExecutionResult::failure(message);
    }

    let result = execute_query(client, sql).await;

    if let Err(e) = client.batch_execute("ROLLBACK").await {
        tracing::warn!(error = %e, "rollback after read-only execution failed");
    }

    result
}

pub async fn execute_query(client: &Client, sql: &str) -> ExecutionResult {
    let start = Instant::now();
    let sql_trimmed = sql.trim();

    // Columns come from the prepared statement so empty results keep them.
    let statement = match client.prepare(sql_trimmed).await {
        Ok(statement) => statement,
        Err(e) => return failure_from(&e, start),
    };

    let rows = match client.query(&statement, &[]).await {
        Ok(rows) => rows,
        Err(e) => return failure_from(&e, start),
    };

    let columns = unique_column_names(statement.columns().iter().map(|c| c.name()));
    let types: Vec<Type> = statement
        .columns()
        .iter()
        .map(|c| c.type_().clone())
        .collect();

    let result_rows = rows
        .iter()
        .map(|row| shape_row(row, &columns, &types))
        .collect::<Vec<_>>();

    tracing::info!(
        rows = result_rows.len(),
        columns = columns.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "statement executed"
    );

    ExecutionResult::Success {
        columns,
        rows: result_rows,
    }
}

fn failure_from(err: &tokio_postgres::Error, start: Instant) -> ExecutionResult {
    let (category, message) = describe_pg_error(err);
    tracing::warn!(
        %category,
        elapsed_ms = start.elapsed().as_millis() as u64,
        %message,
        "statement failed"
    );
    ExecutionResult::failure(message)
}

fn shape_row(row: &Row, columns: &[String], types: &[Type]) -> ResultRow {
    columns
        .iter()
        .zip(types)
        .enumerate()
        .map(|(idx, (name, pg_type))| (name.clone(), extract_value(row, idx, pg_type).to_json()))
        .collect()
}

/// Repeated names get a numeric suffix (`id`, `id_2`, ...) so each row map
/// keeps one key per column.
fn unique_column_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let mut candidate = name.to_string();
        let mut n = 2;
        while out.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

/// NUMERIC in its exact decimal text form.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn StdError + Sync + Send>> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn read_u16(raw: &[u8], idx: usize) -> Result<u16, Box<dyn StdError + Sync + Send>> {
    let start = idx * 2;
    let bytes: [u8; 2] = raw
        .get(start..start + 2)
        .and_then(|b| b.try_into().ok())
        .ok_or("numeric value truncated")?;
    Ok(u16::from_be_bytes(bytes))
}

/// Decode the binary NUMERIC wire format: ndigits, weight, sign, dscale,
/// then base-10000 digits.
fn decode_numeric(raw: &[u8]) -> Result<String, Box<dyn StdError + Sync + Send>> {
    let ndigits = read_u16(raw, 0)? as usize;
    let weight = i32::from(read_u16(raw, 1)? as i16);
    let sign = read_u16(raw, 2)?;
    let dscale = read_u16(raw, 3)? as usize;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| read_u16(raw, 4 + i))
        .collect::<Result<Vec<_>, _>>()?;
    let digit_at = |i: i32| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                let _ = write!(out, "{}", digit_at(i));
            } else {
                let _ = write!(out, "{:04}", digit_at(i));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", digit_at(i));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }

    Ok(out)
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> CellValue {
    match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bool)
            .unwrap_or(CellValue::Null),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int16)
            .unwrap_or(CellValue::Null),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int32)
            .unwrap_or(CellValue::Null),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Int64)
            .unwrap_or(CellValue::Null),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float32)
            .unwrap_or(CellValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Float64)
            .unwrap_or(CellValue::Null),
        Type::NUMERIC => row
            .try_get::<_, Option<PgNumeric>>(idx)
            .ok()
            .flatten()
            .map(|n| CellValue::Numeric(n.0))
            .unwrap_or(CellValue::Null),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Text)
            .unwrap_or(CellValue::Null),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Bytes)
            .unwrap_or(CellValue::Null),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Date)
            .unwrap_or(CellValue::Null),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Time)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(CellValue::DateTime)
            .unwrap_or(CellValue::Null),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map(CellValue::TimestampTz)
            .unwrap_or(CellValue::Null),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)
            .ok()
            .flatten()
            .map(CellValue::Json)
            .unwrap_or(CellValue::Null),
        _ => {
            // Fallback: try to get as string
            row.try_get::<_, Option<String>>(idx)
                .ok()
                .flatten()
                .map(CellValue::Text)
                .unwrap_or(CellValue::Null)
        }
    }
}
