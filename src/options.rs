use crate::catalog::introspect::quote_ident;
use crate::catalog::{FieldMetadata, ModelCatalog};
use crate::config::OptionsConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{OptionsRequest, OptionsResponse};
use crate::records::{escape_like, sql_to_json};
use rusqlite::Connection;
use serde_json::Value;

fn distinct_values(
    conn: &Connection,
    table: &str,
    field: &FieldMetadata,
    search: Option<&str>,
    limit: u32,
) -> AppResult<Vec<Value>> {
    let column = quote_ident(&field.name);
    let mut sql = format!(
        "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL",
        quote_ident(table)
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(term) = search.map(str::trim).filter(|term| !term.is_empty()) {
        sql.push_str(&format!(" AND lower(CAST({column} AS TEXT)) LIKE ? ESCAPE '\\'"));
        params.push(format!("%{}%", escape_like(&term.to_lowercase())));
    }
    sql.push_str(&format!(" ORDER BY {column} LIMIT {}", limit));

    let mut statement = conn.prepare(&sql)?;
    let values = statement
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(sql_to_json(field, row.get_ref(0)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

/// Fills `options` on every foreign key column of `fields` with up to
/// `preload_limit` values of the referenced column. A relation that cannot be
/// resolved is logged and left without options.
pub fn preload_relation_options(
    conn: &Connection,
    catalog: &ModelCatalog,
    model_name: &str,
    fields: &mut [FieldMetadata],
    config: &OptionsConfig,
) -> AppResult<()> {
    let model = catalog.model(model_name)?;

    for relation in model.object_fields().filter(|field| !field.is_list) {
        let ([from], [to]) = (relation.relation_from_fields.as_slice(), relation.relation_to_fields.as_slice()) else {
            continue;
        };
        let Some(target_name) = relation.target_model() else { continue };

        let loaded = catalog.model(target_name).and_then(|target| {
            let target_field = target
                .field(to)
                .ok_or_else(|| AppError::NotFound(format!("{}.{} not found", target_name, to)))?;
            distinct_values(conn, target.table_name(), target_field, None, config.preload_limit + 1)
        });

        match loaded {
            Ok(mut values) => {
                let truncated = values.len() > config.preload_limit as usize;
                values.truncate(config.preload_limit as usize);
                if let Some(field) = fields.iter_mut().find(|field| &field.name == from) {
                    field.options = Some(values);
                    field.options_truncated = truncated;
                }
            }
            Err(error) => {
                tracing::warn!(
                    model = %model_name,
                    relation = %relation.name,
                    target = %target_name,
                    error = %error,
                    "failed to preload relation options"
                );
            }
        }
    }
    Ok(())
}

/// Type-ahead lookup behind relation pickers whose preloaded list was truncated.
pub fn search_options(
    conn: &Connection,
    catalog: &ModelCatalog,
    request: &OptionsRequest,
    config: &OptionsConfig,
) -> AppResult<OptionsResponse> {
    let model = catalog.model(&request.model_name)?;
    let field = model.field(&request.model_field).ok_or_else(|| {
        AppError::NotFound(format!("Invalid field: {}.{}", request.model_name, request.model_field))
    })?;
    if field.is_object() || field.is_list {
        return Err(AppError::Validation(format!(
            "{} cannot be used as an option source",
            request.model_field
        )));
    }

    let options = distinct_values(
        conn,
        model.table_name(),
        field,
        Some(request.search.as_str()),
        config.search_limit,
    )?;
    Ok(OptionsResponse {
        options,
        model_field: request.model_field.clone(),
        model_name: request.model_name.clone(),
    })
}
