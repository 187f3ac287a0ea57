use serde_json::Value;

use crate::db::ExecutionResult;

/// Header line of column names, then one line per row. A failed execution
/// renders as `Error: <message>` instead.
pub fn to_delimited_text(result: &ExecutionResult) -> String {
    match result {
        ExecutionResult::Success { columns, rows } => {
            let mut output = String::new();

            let headers: Vec<String> = columns.iter().map(|c| csv_escape(c)).collect();
            output.push_str(&headers.join(","));
            output.push('\n');

            for row in rows {
                let cells: Vec<String> = columns
                    .iter()
                    .map(|c| csv_escape(&cell_text(row.get(c).unwrap_or(&Value::Null))))
                    .collect();
                output.push_str(&cells.join(","));
                output.push('\n');
            }

            output
        }
        ExecutionResult::Failure { message } => format!("Error: {}", message),
    }
}

/// Suggested download name for an exported record.
pub fn export_filename(query_id: i64) -> String {
    format!("query_result_{}.csv", query_id)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
