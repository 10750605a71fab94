use crate::errors::{AppError, AppResult};
use crate::models::{QueryConsoleResponse, Record};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::{Map, Number, Value};

static FORBIDDEN_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(drop|delete|update|insert|alter|create|grant|revoke|truncate|attach|detach|pragma|vacuum|replace)\b",
    )
    .expect("valid keyword regex")
});

static LEADING_SELECT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^select\b").expect("valid select regex"));

const FORBIDDEN_TOKENS: &[&str] = &[";", "--", "/*"];

/// Rejects anything but a single plain `SELECT`.
pub fn check_query(sql: &str) -> AppResult<&str> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Query is required".to_string()));
    }
    if !LEADING_SELECT_RE.is_match(trimmed) {
        return Err(AppError::Query("Only SELECT queries are allowed".to_string()));
    }
    if let Some(token) = FORBIDDEN_TOKENS.iter().find(|token| trimmed.contains(*token)) {
        return Err(AppError::Query(format!("Query contains forbidden token '{}'", token)));
    }
    if let Some(found) = FORBIDDEN_KEYWORD_RE.find(trimmed) {
        return Err(AppError::Query(format!(
            "Query contains forbidden keyword '{}'",
            found.as_str().to_ascii_uppercase()
        )));
    }
    Ok(trimmed)
}

fn cell_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64_STANDARD.encode(bytes)),
    }
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> rusqlite::Result<QueryConsoleResponse> {
    let mut statement = conn.prepare(sql)?;
    if !statement.readonly() {
        return Err(rusqlite::Error::InvalidQuery);
    }
    let columns: Vec<String> = statement.column_names().iter().map(ToString::to_string).collect();

    let mut rows = statement.query([])?;
    let mut records = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if records.len() == max_rows {
            truncated = true;
            break;
        }
        let mut record = Map::new();
        for (index, column) in columns.iter().enumerate() {
            record.insert(column.clone(), cell_to_json(row.get_ref(index)?));
        }
        records.push(record);
    }

    Ok(QueryConsoleResponse {
        success: true,
        columns,
        rows: records,
        truncated,
        error: None,
    })
}

/// Executes a guarded query on `conn`, which should be a read-only handle.
/// Guard violations are errors; database failures come back as an
/// unsuccessful response carrying the SQLite message.
pub fn execute_query(conn: &Connection, sql: &str, max_rows: u32) -> AppResult<QueryConsoleResponse> {
    let checked = check_query(sql)?;
    match run_query(conn, checked, max_rows as usize) {
        Ok(response) => {
            tracing::info!(rows = response.rows.len(), truncated = response.truncated, "console query executed");
            Ok(response)
        }
        Err(rusqlite::Error::InvalidQuery) => Err(AppError::Query("Only read-only statements are allowed".to_string())),
        Err(error) => {
            tracing::warn!(error = %error, "console query failed");
            Ok(QueryConsoleResponse {
                success: false,
                columns: Vec::new(),
                rows: Vec::<Record>::new(),
                truncated: false,
                error: Some(error.to_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{check_query, execute_query};
    use rusqlite::Connection;
    use serde_json::json;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE Item (id INTEGER PRIMARY KEY, name TEXT, updated_by TEXT);
             INSERT INTO Item (name) VALUES ('a'), ('b'), ('c');",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn guard_rejects_non_select_and_injection_shapes() {
        assert!(check_query("   ").expect_err("empty").to_string().starts_with("VALIDATION_FAILED"));
        for sql in [
            "DELETE FROM Item",
            "select * from Item; drop table Item",
            "select * from Item -- comment",
            "select /* x */ 1",
            "select * from Item where name = 'x' union select sql from sqlite_master where 1 or drop",
            "WITH t AS (SELECT 1) SELECT * FROM t",
            "select replace(name, 'a', 'b') from Item",
        ] {
            let error = check_query(sql).expect_err(sql);
            assert!(error.to_string().starts_with("QUERY_REJECTED"), "{}: {}", sql, error);
        }
    }

    #[test]
    fn guard_matches_whole_words_only() {
        assert!(check_query("select updated_by, created from Item").is_ok());
        assert!(check_query("  SELECT 1").is_ok());
    }

    #[test]
    fn returns_columns_and_rows() {
        let conn = fixture();
        let response = execute_query(&conn, "select id, name from Item order by id", 500).expect("query");
        assert!(response.success);
        assert_eq!(response.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(response.rows.len(), 3);
        assert_eq!(response.rows[0]["name"], json!("a"));
        assert!(!response.truncated);
    }

    #[test]
    fn truncates_at_row_limit() {
        let conn = fixture();
        let response = execute_query(&conn, "select * from Item", 2).expect("query");
        assert_eq!(response.rows.len(), 2);
        assert!(response.truncated);
    }

    #[test]
    fn database_errors_become_unsuccessful_responses() {
        let conn = fixture();
        let response = execute_query(&conn, "select * from Missing", 10).expect("response");
        assert!(!response.success);
        assert!(response.error.expect("message").contains("no such table"));
    }
}
