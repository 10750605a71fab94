use super::{EnumMetadata, EnumValue, FieldKind, FieldMetadata, FieldType, ModelCatalog, ModelMetadata};
use crate::errors::AppResult;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};

static CHECK_IN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)CHECK\s*\(\s*["`\[]?(\w+)["`\]]?\s+IN\s*\(([^)]*)\)\s*\)"#).expect("valid check regex")
});

static QUOTED_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'((?:[^']|'')*)'").expect("valid literal regex"));

const LIST_SUFFIXES: &[&str] = &["[]", " LIST", " ARRAY"];

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    declared_type: String,
    not_null: bool,
    default_value: Option<String>,
    pk_position: i64,
    hidden: i64,
}

#[derive(Debug, Clone)]
struct ForeignKeyInfo {
    id: i64,
    target_table: String,
    from: String,
    to: Option<String>,
}

struct TableInfo {
    name: String,
    columns: Vec<ColumnInfo>,
    unique_columns: BTreeSet<String>,
    foreign_keys: Vec<ForeignKeyInfo>,
    check_enums: BTreeMap<String, Vec<String>>,
}

/// Reads the runtime metadata of every user table in `conn`.
///
/// `enum_overrides` maps `model -> field -> values` and wins over domains
/// discovered from `CHECK (col IN (...))` constraints.
pub fn introspect(
    conn: &Connection,
    enum_overrides: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
) -> AppResult<ModelCatalog> {
    let tables = read_tables(conn)?;
    let mut catalog = ModelCatalog::default();

    for table in &tables {
        let pk_columns: Vec<&ColumnInfo> = table
            .columns
            .iter()
            .filter(|column| column.pk_position > 0)
            .collect();
        let single_pk = if pk_columns.len() == 1 {
            Some(pk_columns[0].name.clone())
        } else {
            None
        };

        let mut fields = Vec::with_capacity(table.columns.len());
        for column in table.columns.iter().filter(|column| column.hidden != 1) {
            let (mapped_type, is_list) = map_declared_type(&column.declared_type);
            let is_id = single_pk.as_deref() == Some(column.name.as_str());
            let is_rowid_alias = is_id && column.declared_type.trim().eq_ignore_ascii_case("INTEGER");
            let is_generated_column = column.hidden == 2 || column.hidden == 3;

            let enum_domain = enum_overrides
                .get(&table.name)
                .and_then(|fields| fields.get(&column.name))
                .or_else(|| table.check_enums.get(&column.name));

            let (kind, field_type, enum_name) = match enum_domain {
                Some(values) if !values.is_empty() => {
                    let enum_name = enum_type_name(&table.name, &column.name);
                    catalog.enums.insert(
                        enum_name.clone(),
                        EnumMetadata {
                            values: values
                                .iter()
                                .map(|value| EnumValue {
                                    name: value.clone(),
                                    db_name: None,
                                })
                                .collect(),
                            db_name: None,
                        },
                    );
                    (FieldKind::Enum, FieldType::Enum, Some(enum_name))
                }
                _ if mapped_type == FieldType::Unsupported => (FieldKind::Unsupported, mapped_type, None),
                _ => (FieldKind::Scalar, mapped_type, None),
            };

            fields.push(FieldMetadata {
                name: column.name.clone(),
                kind,
                field_type,
                options: None,
                options_truncated: false,
                is_list,
                is_required: column.not_null || is_id,
                is_unique: is_id || table.unique_columns.contains(&column.name),
                is_id,
                is_read_only: is_generated_column,
                has_default_value: column.default_value.is_some() || is_rowid_alias,
                native_type: if column.declared_type.is_empty() {
                    None
                } else {
                    Some(column.declared_type.clone())
                },
                enum_name,
                relation_name: None,
                relation_from_fields: Vec::new(),
                relation_to_fields: Vec::new(),
                is_generated: is_generated_column || is_rowid_alias,
                is_updated_at: column.name == "updatedAt" || column.name == "updated_at",
            });
        }

        let unique_fields = fields
            .iter()
            .filter(|field| field.is_unique && !field.is_id)
            .map(|field| field.name.clone())
            .collect();

        catalog.models.insert(
            table.name.clone(),
            ModelMetadata {
                name: table.name.clone(),
                db_name: None,
                primary_key: single_pk,
                unique_fields,
                fields,
            },
        );
    }

    attach_relations(&mut catalog, &tables);
    Ok(catalog)
}

fn read_tables(conn: &Connection) -> AppResult<Vec<TableInfo>> {
    let mut statement = conn.prepare(
        "SELECT name, COALESCE(sql, '') FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let raw_tables = statement
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut tables = Vec::with_capacity(raw_tables.len());
    for (name, create_sql) in raw_tables {
        if create_sql.trim_start().to_ascii_uppercase().starts_with("CREATE VIRTUAL") {
            continue;
        }
        tables.push(TableInfo {
            columns: read_columns(conn, &name)?,
            unique_columns: read_unique_columns(conn, &name)?,
            foreign_keys: read_foreign_keys(conn, &name)?,
            check_enums: parse_check_enums(&create_sql),
            name,
        });
    }
    Ok(tables)
}

fn read_columns(conn: &Connection, table: &str) -> AppResult<Vec<ColumnInfo>> {
    let mut statement = conn.prepare(&format!("PRAGMA table_xinfo({})", quote_ident(table)))?;
    let columns = statement
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
                pk_position: row.get(5)?,
                hidden: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn read_unique_columns(conn: &Connection, table: &str) -> AppResult<BTreeSet<String>> {
    let mut statement = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
    let unique_indexes = statement
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)? != 0)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut columns = BTreeSet::new();
    for (index_name, unique) in unique_indexes {
        if !unique {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index_name)))?;
        let indexed = info
            .query_map([], |row| row.get::<_, Option<String>>(2))?
            .collect::<Result<Vec<_>, _>>()?;
        if let [Some(column)] = indexed.as_slice() {
            columns.insert(column.clone());
        }
    }
    Ok(columns)
}

fn read_foreign_keys(conn: &Connection, table: &str) -> AppResult<Vec<ForeignKeyInfo>> {
    let mut statement = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    let keys = statement
        .query_map([], |row| {
            Ok(ForeignKeyInfo {
                id: row.get(0)?,
                target_table: row.get(2)?,
                from: row.get(3)?,
                to: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(keys)
}

fn attach_relations(catalog: &mut ModelCatalog, tables: &[TableInfo]) {
    for table in tables {
        // Composite keys share an id; only single-column references become pickers.
        let mut by_id: BTreeMap<i64, Vec<&ForeignKeyInfo>> = BTreeMap::new();
        for key in &table.foreign_keys {
            by_id.entry(key.id).or_default().push(key);
        }

        for parts in by_id.values() {
            let [key] = parts.as_slice() else {
                tracing::debug!(model = %table.name, "skipping composite foreign key");
                continue;
            };
            let Some(target) = catalog.models.get(&key.target_table) else {
                tracing::warn!(model = %table.name, target = %key.target_table, "foreign key targets unknown table");
                continue;
            };
            let Some(to_column) = key.to.clone().or_else(|| target.primary_key.clone()) else {
                continue;
            };

            let owner_name = table.name.clone();
            let target_name = target.name.clone();
            let mut relation_name = format!("{}To{}", owner_name, target_name);
            let parallel = catalog
                .models
                .values()
                .flat_map(|model| model.fields.iter())
                .any(|field| field.relation_name.as_deref() == Some(relation_name.as_str()));
            if parallel {
                relation_name = format!("{}_{}", relation_name, key.from);
            }

            if let Some(owner) = catalog.models.get_mut(&owner_name) {
                let field_name = pick_field_name(
                    owner,
                    &[
                        strip_key_suffix(&key.from),
                        target_name.clone(),
                        format!("{}_{}", target_name, key.from),
                    ],
                );
                let fk_required = owner.field(&key.from).map(|fk| fk.is_required).unwrap_or(false);
                owner.fields.push(relation_field(
                    field_name,
                    &target_name,
                    Some(&relation_name),
                    vec![key.from.clone()],
                    vec![to_column],
                    false,
                    fk_required,
                ));
            }

            if let Some(target) = catalog.models.get_mut(&target_name) {
                let field_name = pick_field_name(
                    target,
                    &[owner_name.clone(), format!("{}_{}", owner_name, key.from)],
                );
                target.fields.push(relation_field(
                    field_name,
                    &owner_name,
                    Some(&relation_name),
                    Vec::new(),
                    Vec::new(),
                    true,
                    true,
                ));
            }
        }
    }
}

fn relation_field(
    name: String,
    target: &str,
    relation_name: Option<&str>,
    from: Vec<String>,
    to: Vec<String>,
    is_list: bool,
    is_required: bool,
) -> FieldMetadata {
    FieldMetadata {
        name,
        kind: FieldKind::Object,
        field_type: FieldType::Model(target.to_string()),
        options: None,
        options_truncated: false,
        is_list,
        is_required,
        is_unique: false,
        is_id: false,
        is_read_only: false,
        has_default_value: false,
        native_type: None,
        enum_name: None,
        relation_name: relation_name.map(ToString::to_string),
        relation_from_fields: from,
        relation_to_fields: to,
        is_generated: false,
        is_updated_at: false,
    }
}

fn pick_field_name(model: &ModelMetadata, candidates: &[String]) -> String {
    candidates
        .iter()
        .find(|candidate| !candidate.is_empty() && model.field(candidate).is_none())
        .cloned()
        .unwrap_or_else(|| format!("{}_rel{}", candidates[0], model.fields.len()))
}

fn strip_key_suffix(column: &str) -> String {
    column
        .strip_suffix("_id")
        .or_else(|| column.strip_suffix("Id"))
        .unwrap_or("")
        .to_string()
}

/// Maps a declared SQLite column type onto a field type. A trailing `LIST`,
/// `ARRAY` or `[]` marks a list stored as JSON array text.
pub fn map_declared_type(declared: &str) -> (FieldType, bool) {
    let upper_full = declared.trim().to_ascii_uppercase();
    let (upper, is_list) = match LIST_SUFFIXES
        .iter()
        .find_map(|suffix| upper_full.strip_suffix(suffix))
    {
        Some(base) => (base.trim().to_string(), true),
        None => (upper_full.clone(), false),
    };

    let field_type = if upper.is_empty() {
        FieldType::Unsupported
    } else if upper.contains("BOOL") {
        FieldType::Boolean
    } else if upper.contains("BIGINT") {
        FieldType::BigInt
    } else if upper.contains("INT") {
        FieldType::Int
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        FieldType::Float
    } else if upper.contains("DEC") || upper.contains("NUMERIC") {
        FieldType::Decimal
    } else if upper.contains("DATE") || upper.contains("TIME") {
        FieldType::DateTime
    } else if upper.contains("JSON") {
        FieldType::Json
    } else if upper.contains("BLOB") || upper.contains("BYTE") {
        FieldType::Bytes
    } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") || upper.contains("UUID") {
        FieldType::String
    } else {
        FieldType::Unsupported
    };
    (field_type, is_list)
}

fn parse_check_enums(create_sql: &str) -> BTreeMap<String, Vec<String>> {
    let mut enums = BTreeMap::new();
    for captures in CHECK_IN_RE.captures_iter(create_sql) {
        let column = captures[1].to_string();
        let values: Vec<String> = QUOTED_LITERAL_RE
            .captures_iter(&captures[2])
            .map(|literal| literal[1].replace("''", "'"))
            .collect();
        if !values.is_empty() {
            enums.insert(column, values);
        }
    }
    enums
}

fn enum_type_name(model: &str, field: &str) -> String {
    let mut name = String::with_capacity(model.len() + field.len());
    for part in [model, field] {
        for segment in part.split('_').filter(|segment| !segment.is_empty()) {
            let mut chars = segment.chars();
            if let Some(first) = chars.next() {
                name.extend(first.to_uppercase());
                name.push_str(chars.as_str());
            }
        }
    }
    name
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
