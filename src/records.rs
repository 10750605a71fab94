use crate::catalog::introspect::quote_ident;
use crate::catalog::{FieldMetadata, FieldType, ModelCatalog, ModelMetadata};
use crate::config::ListConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{ExportResponse, ListRecordsRequest, Pagination, Record, RecordPage};
use crate::schema_gen::{self, SchemaMode};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, Row};
use serde_json::{Map, Number, Value};
use std::path::Path;

/// Resolves page/take from a request; `default_take` comes from app settings
/// when the user changed it, otherwise from config.
pub fn resolve_paging(request: &ListRecordsRequest, list: &ListConfig, default_take: Option<u32>) -> (i64, i64) {
    let page = request.page.filter(|page| *page >= 1).unwrap_or(1);
    let max_take = i64::from(list.max_take.max(1));
    let fallback = i64::from(default_take.unwrap_or(list.default_take)).clamp(1, max_take);
    let take = request
        .take
        .map(|take| take.clamp(1, max_take))
        .unwrap_or(fallback);
    (page, take)
}

// ─── SQL fragments ──────────────────────────────────────────────────────────

fn select_list(model: &ModelMetadata) -> String {
    model
        .scalar_fields()
        .map(|field| quote_ident(&field.name))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// `WHERE` clause for a free-text search. A model without searchable text
/// columns matches nothing once a search term is given.
fn search_clause(model: &ModelMetadata, search: Option<&str>) -> (String, Vec<SqlValue>) {
    let Some(term) = search.map(str::trim).filter(|term| !term.is_empty()) else {
        return (String::new(), Vec::new());
    };
    let columns: Vec<&FieldMetadata> = model.scalar_fields().filter(|field| field.is_searchable()).collect();
    if columns.is_empty() {
        return (" WHERE 0".to_string(), Vec::new());
    }

    let pattern = format!("%{}%", escape_like(&term.to_lowercase()));
    let conditions = columns
        .iter()
        .map(|field| format!("lower({}) LIKE ? ESCAPE '\\'", quote_ident(&field.name)))
        .collect::<Vec<_>>()
        .join(" OR ");
    let params = columns.iter().map(|_| SqlValue::Text(pattern.clone())).collect();
    (format!(" WHERE ({})", conditions), params)
}

fn order_clause(model: &ModelMetadata) -> String {
    let mut keys = Vec::new();
    if let Some(created) = model.created_at_field() {
        keys.push(format!("{} DESC", quote_ident(&created.name)));
    }
    if let Some(pk) = model.primary_key_field() {
        keys.push(format!("{} DESC", quote_ident(&pk.name)));
    }
    if keys.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", keys.join(", "))
    }
}

// ─── Value conversion ───────────────────────────────────────────────────────

pub(crate) fn sql_to_json(field: &FieldMetadata, value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => match field.field_type {
            FieldType::Boolean => Value::Bool(number != 0),
            FieldType::BigInt => Value::String(number.to_string()),
            _ => Value::Number(number.into()),
        },
        ValueRef::Real(number) => match field.field_type {
            FieldType::Decimal | FieldType::BigInt => Value::String(number.to_string()),
            _ => Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null),
        },
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            if field.is_list || field.field_type == FieldType::Json {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        ValueRef::Blob(bytes) => Value::String(BASE64_STANDARD.encode(bytes)),
    }
}

fn json_to_sql(field: &FieldMetadata, value: &Value) -> AppResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if field.is_list || field.field_type == FieldType::Json {
        return Ok(SqlValue::Text(serde_json::to_string(value)?));
    }
    let converted = match value {
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => match field.field_type {
            FieldType::Bytes => SqlValue::Blob(BASE64_STANDARD.decode(text).map_err(|_| {
                AppError::Validation(format!("{}: expected base64 encoded bytes", field.name))
            })?),
            FieldType::BigInt => SqlValue::Integer(text.trim().parse::<i64>().map_err(|_| {
                AppError::Validation(format!("{}: expected an integer", field.name))
            })?),
            _ => SqlValue::Text(text.clone()),
        },
        other => SqlValue::Text(other.to_string()),
    };
    Ok(converted)
}

/// Converts a record id received from a client into a bindable key.
pub fn key_to_sql(field: &FieldMetadata, id: &Value) -> AppResult<SqlValue> {
    let invalid = || AppError::Validation(format!("Invalid record id for {}", field.name));
    match (&field.field_type, id) {
        (_, Value::Null) => Err(invalid()),
        (FieldType::Int | FieldType::BigInt, Value::String(raw)) => {
            raw.trim().parse::<i64>().map(SqlValue::Integer).map_err(|_| invalid())
        }
        (FieldType::Int | FieldType::BigInt, Value::Number(number)) => {
            number.as_i64().map(SqlValue::Integer).ok_or_else(invalid)
        }
        (_, Value::Array(_) | Value::Object(_)) => Err(invalid()),
        _ => json_to_sql(field, id),
    }
}

fn read_record(model: &ModelMetadata, row: &Row<'_>) -> rusqlite::Result<Record> {
    let mut record = Map::new();
    for (index, field) in model.scalar_fields().enumerate() {
        record.insert(field.name.clone(), sql_to_json(field, row.get_ref(index)?));
    }
    Ok(record)
}

fn map_write_error(model: &str, error: rusqlite::Error) -> AppError {
    match &error {
        rusqlite::Error::SqliteFailure(failure, message) if failure.code == ErrorCode::ConstraintViolation => {
            AppError::Conflict(format!(
                "{} constraint violated: {}",
                model,
                message.clone().unwrap_or_else(|| failure.to_string())
            ))
        }
        _ => AppError::from(error),
    }
}

// ─── Reads ──────────────────────────────────────────────────────────────────

pub fn count_records(conn: &Connection, model: &ModelMetadata, search: Option<&str>) -> AppResult<i64> {
    let (where_sql, params) = search_clause(model, search);
    let sql = format!("SELECT COUNT(*) FROM {}{}", quote_ident(model.table_name()), where_sql);
    let total = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
    Ok(total)
}

pub fn list_records(
    conn: &Connection,
    model: &ModelMetadata,
    request: &ListRecordsRequest,
    list: &ListConfig,
    default_take: Option<u32>,
) -> AppResult<RecordPage> {
    let (page, take) = resolve_paging(request, list, default_take);
    let search = request.search.as_deref();
    let total_count = count_records(conn, model, search)?;

    // A page past the addressable range is simply empty.
    let Some(offset) = (page - 1).checked_mul(take) else {
        return Ok(RecordPage {
            records: Vec::new(),
            pagination: Pagination::new(total_count, page, take),
        });
    };

    let (where_sql, mut params) = search_clause(model, search);
    params.push(SqlValue::Integer(take));
    params.push(SqlValue::Integer(offset));
    let sql = format!(
        "SELECT {} FROM {}{}{} LIMIT ? OFFSET ?",
        select_list(model),
        quote_ident(model.table_name()),
        where_sql,
        order_clause(model)
    );

    let mut statement = conn.prepare(&sql)?;
    let records = statement
        .query_map(params_from_iter(params.iter()), |row| read_record(model, row))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RecordPage {
        records,
        pagination: Pagination::new(total_count, page, take),
    })
}

fn fetch_by_key(conn: &Connection, model: &ModelMetadata, pk: &FieldMetadata, key: &SqlValue) -> AppResult<Option<Record>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        select_list(model),
        quote_ident(model.table_name()),
        quote_ident(&pk.name)
    );
    let mut statement = conn.prepare(&sql)?;
    let mut rows = statement.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_record(model, row)?)),
        None => Ok(None),
    }
}

pub fn find_record(conn: &Connection, model: &ModelMetadata, id: &Value) -> AppResult<Record> {
    let pk = model.require_primary_key()?;
    let key = key_to_sql(pk, id)?;
    fetch_by_key(conn, model, pk, &key)?
        .ok_or_else(|| AppError::NotFound(format!("{} record {} not found", model.name, id)))
}

// ─── Writes ─────────────────────────────────────────────────────────────────

fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn fill_timestamps(model: &ModelMetadata, payload: &mut Map<String, Value>, mode: SchemaMode) {
    let now = now_text();
    if mode == SchemaMode::Create {
        if let Some(created) = model
            .created_at_field()
            .filter(|field| field.field_type == FieldType::DateTime && !field.has_default_value)
        {
            if payload.get(&created.name).map_or(true, Value::is_null) {
                payload.insert(created.name.clone(), Value::String(now.clone()));
            }
        }
    }
    for field in model.scalar_fields().filter(|field| field.is_updated_at && field.is_writable()) {
        payload.insert(field.name.clone(), Value::String(now.clone()));
    }
}

pub fn create_record(conn: &Connection, catalog: &ModelCatalog, model_name: &str, data: &Value) -> AppResult<Record> {
    let model = catalog.model(model_name)?;
    let fields = catalog.editable_fields(model_name)?;
    let mut payload = schema_gen::normalize_input(&fields, data)?;

    if let Some(pk) = model.primary_key_field() {
        if pk.field_type == FieldType::String && payload.get(&pk.name).map_or(true, Value::is_null) {
            payload.insert(pk.name.clone(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
    }
    fill_timestamps(model, &mut payload, SchemaMode::Create);
    schema_gen::validate_payload(&fields, &payload, SchemaMode::Create)?.into_result()?;

    let mut columns = Vec::with_capacity(payload.len());
    let mut values = Vec::with_capacity(payload.len());
    for (name, value) in &payload {
        let Some(field) = model.field(name) else { continue };
        columns.push(quote_ident(name));
        values.push(json_to_sql(field, value)?);
    }

    let table = quote_ident(model.table_name());
    let sql = if columns.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        )
    };
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(|error| map_write_error(&model.name, error))?;

    let Some(pk) = model.primary_key_field() else {
        tracing::info!(model = %model.name, "record created");
        return Ok(payload);
    };
    let key = match payload.get(&pk.name).filter(|value| !value.is_null()) {
        Some(value) => json_to_sql(pk, value)?,
        None => SqlValue::Integer(conn.last_insert_rowid()),
    };
    let record = fetch_by_key(conn, model, pk, &key)?
        .ok_or_else(|| AppError::Internal(format!("created {} record could not be read back", model.name)))?;
    tracing::info!(model = %model.name, id = %record.get(&pk.name).cloned().unwrap_or_default(), "record created");
    Ok(record)
}

pub fn update_record(
    conn: &Connection,
    catalog: &ModelCatalog,
    model_name: &str,
    id: &Value,
    data: &Value,
) -> AppResult<Record> {
    let model = catalog.model(model_name)?;
    let pk = model.require_primary_key()?;
    let key = key_to_sql(pk, id)?;
    let fields = catalog.editable_fields(model_name)?;

    let mut payload = schema_gen::normalize_input(&fields, data)?;
    payload.remove(&pk.name);
    if let Some(created) = model.created_at_field() {
        payload.remove(&created.name);
    }
    fill_timestamps(model, &mut payload, SchemaMode::Update);
    schema_gen::validate_payload(&fields, &payload, SchemaMode::Update)?.into_result()?;

    if payload.is_empty() {
        return find_record(conn, model, id);
    }

    let mut assignments = Vec::with_capacity(payload.len());
    let mut values = Vec::with_capacity(payload.len() + 1);
    for (name, value) in &payload {
        let Some(field) = model.field(name) else { continue };
        assignments.push(format!("{} = ?", quote_ident(name)));
        values.push(json_to_sql(field, value)?);
    }
    values.push(key.clone());

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote_ident(model.table_name()),
        assignments.join(", "),
        quote_ident(&pk.name)
    );
    let changed = conn
        .execute(&sql, params_from_iter(values.iter()))
        .map_err(|error| map_write_error(&model.name, error))?;
    if changed == 0 {
        return Err(AppError::NotFound(format!("{} record {} not found", model.name, id)));
    }

    tracing::info!(model = %model.name, id = %id, fields = payload.len(), "record updated");
    fetch_by_key(conn, model, pk, &key)?
        .ok_or_else(|| AppError::NotFound(format!("{} record {} not found", model.name, id)))
}

pub fn delete_record(conn: &Connection, model: &ModelMetadata, id: &Value) -> AppResult<()> {
    let pk = model.require_primary_key()?;
    let key = key_to_sql(pk, id)?;
    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(model.table_name()),
        quote_ident(&pk.name)
    );
    let deleted = conn
        .execute(&sql, [key])
        .map_err(|error| map_write_error(&model.name, error))?;
    if deleted == 0 {
        return Err(AppError::NotFound(format!("{} record {} not found", model.name, id)));
    }
    tracing::info!(model = %model.name, id = %id, "record deleted");
    Ok(())
}

/// Deletes every listed record in one transaction and returns how many rows went away.
pub fn delete_records(conn: &Connection, model: &ModelMetadata, ids: &[Value]) -> AppResult<usize> {
    if ids.is_empty() {
        return Err(AppError::Validation("No records selected".to_string()));
    }
    let pk = model.require_primary_key()?;
    let keys = ids
        .iter()
        .map(|id| key_to_sql(pk, id))
        .collect::<AppResult<Vec<_>>>()?;

    let sql = format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_ident(model.table_name()),
        quote_ident(&pk.name)
    );
    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0;
    {
        let mut statement = tx.prepare(&sql)?;
        for key in &keys {
            deleted += statement
                .execute([key])
                .map_err(|error| map_write_error(&model.name, error))?;
        }
    }
    tx.commit()?;
    tracing::info!(model = %model.name, requested = ids.len(), deleted, "records deleted");
    Ok(deleted)
}

// ─── Export ─────────────────────────────────────────────────────────────────

fn csv_cell(value: &Value) -> String {
    let raw = match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw
    }
}

fn export_file_stem(model: &str) -> String {
    model
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

/// Writes every record matching `search` to `<exports_dir>/<model>-<timestamp>.csv`.
pub fn export_records(
    conn: &Connection,
    model: &ModelMetadata,
    search: Option<&str>,
    exports_dir: &Path,
) -> AppResult<ExportResponse> {
    let (where_sql, params) = search_clause(model, search);
    let sql = format!(
        "SELECT {} FROM {}{}{}",
        select_list(model),
        quote_ident(model.table_name()),
        where_sql,
        order_clause(model)
    );
    let mut statement = conn.prepare(&sql)?;
    let records = statement
        .query_map(params_from_iter(params.iter()), |row| read_record(model, row))?
        .collect::<Result<Vec<_>, _>>()?;

    let headers: Vec<&str> = model.scalar_fields().map(|field| field.name.as_str()).collect();
    let mut output = headers
        .iter()
        .map(|header| csv_cell(&Value::String((*header).to_string())))
        .collect::<Vec<_>>()
        .join(",");
    output.push('\n');
    for record in &records {
        let line = headers
            .iter()
            .map(|header| csv_cell(record.get(*header).unwrap_or(&Value::Null)))
            .collect::<Vec<_>>()
            .join(",");
        output.push_str(&line);
        output.push('\n');
    }

    std::fs::create_dir_all(exports_dir)?;
    let path = exports_dir.join(format!(
        "{}-{}.csv",
        export_file_stem(&model.name),
        Utc::now().format("%Y%m%dT%H%M%S%3f")
    ));
    std::fs::write(&path, output)?;
    tracing::info!(model = %model.name, rows = records.len(), path = %path.display(), "records exported");

    Ok(ExportResponse {
        path: path.to_string_lossy().to_string(),
        row_count: records.len(),
    })
}
