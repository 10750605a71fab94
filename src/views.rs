use crate::catalog::{FieldMetadata, ModelCatalog, ModelMetadata};
use crate::config::AdminConfig;
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{
    ListRecordsRequest, ModelView, Overview, Record, RecordDetail, RelatedModelLink, RelationDirection,
};
use crate::{options, records};
use rusqlite::Connection;
use serde_json::Value;

fn form_fields(conn: &Connection, catalog: &ModelCatalog, model_name: &str, config: &AdminConfig) -> AppResult<Vec<FieldMetadata>> {
    let mut fields = catalog.editable_fields(model_name)?;
    options::preload_relation_options(conn, catalog, model_name, &mut fields, &config.options)?;
    Ok(fields)
}

/// Everything the model list screen renders: one page of rows plus the
/// field metadata the create/edit forms are generated from.
pub fn model_view(
    conn: &Connection,
    catalog: &ModelCatalog,
    model_name: &str,
    request: &ListRecordsRequest,
    config: &AdminConfig,
    default_take: Option<u32>,
) -> AppResult<ModelView> {
    let model = catalog.model(model_name)?;
    let page = records::list_records(conn, model, request, &config.list, default_take)?;
    Ok(ModelView {
        model_name: model.name.clone(),
        primary_key: model.primary_key.clone(),
        records: page.records,
        model_fields: form_fields(conn, catalog, model_name, config)?,
        pagination: page.pagination,
    })
}

pub fn record_detail(
    conn: &Connection,
    catalog: &ModelCatalog,
    model_name: &str,
    id: &Value,
    config: &AdminConfig,
) -> AppResult<RecordDetail> {
    let model = catalog.model(model_name)?;
    let item = records::find_record(conn, model, id)?;
    Ok(RecordDetail {
        related_models: related_links(catalog, model, &item),
        model_name: model.name.clone(),
        model_fields: form_fields(conn, catalog, model_name, config)?,
        item,
    })
}

/// Navigation links from a record: the parent rows its foreign keys point at,
/// and the child collections that point back at it.
pub fn related_links(catalog: &ModelCatalog, model: &ModelMetadata, item: &Record) -> Vec<RelatedModelLink> {
    let mut links = Vec::new();
    for relation in model.object_fields() {
        let Some(target) = relation.target_model() else { continue };

        if let Some(from) = relation.relation_from_fields.first() {
            let id = item.get(from).cloned().unwrap_or(Value::Null);
            if id.is_null() {
                continue;
            }
            links.push(RelatedModelLink {
                name: target.to_string(),
                fields: relation.relation_to_fields.clone(),
                id,
                direction: RelationDirection::Parent,
            });
            continue;
        }

        let owning_side = catalog.models.get(target).and_then(|owner| {
            owner.object_fields().find(|field| {
                field.relation_name == relation.relation_name && !field.relation_from_fields.is_empty()
            })
        });
        let Some(owning_side) = owning_side else { continue };
        let Some(referenced) = owning_side.relation_to_fields.first() else { continue };
        let id = item.get(referenced).cloned().unwrap_or(Value::Null);
        if id.is_null() {
            continue;
        }
        links.push(RelatedModelLink {
            name: target.to_string(),
            fields: owning_side.relation_from_fields.clone(),
            id,
            direction: RelationDirection::Children,
        });
    }
    links
}

/// Landing page counters.
pub fn overview(db: &Database, visible_models: usize) -> AppResult<Overview> {
    Ok(Overview {
        models_count: visible_models,
        allowed_users_count: db.count_allowed_users()?,
        dashboards_count: db.count_dashboards()?,
    })
}

#[cfg(test)]
mod tests {
    use super::{model_view, record_detail};
    use crate::catalog::introspect;
    use crate::config::AdminConfig;
    use crate::models::{ListRecordsRequest, RelationDirection};
    use rusqlite::Connection;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE Author (id TEXT PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE Post (id INTEGER PRIMARY KEY, title TEXT NOT NULL, author_id TEXT REFERENCES Author(id));
             INSERT INTO Author (id, name) VALUES ('a1', 'Ann');
             INSERT INTO Post (title, author_id) VALUES ('First', 'a1'), ('Orphan', NULL);",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn model_view_bundles_rows_fields_and_options() {
        let conn = fixture();
        let catalog = introspect(&conn, &BTreeMap::new()).expect("catalog");
        let view = model_view(&conn, &catalog, "Post", &ListRecordsRequest::default(), &AdminConfig::default(), None)
            .expect("view");
        assert_eq!(view.model_name, "Post");
        assert_eq!(view.primary_key.as_deref(), Some("id"));
        assert_eq!(view.records.len(), 2);
        assert_eq!(view.pagination.total_count, 2);
        let author_id = view.model_fields.iter().find(|field| field.name == "author_id").expect("fk");
        assert_eq!(author_id.options, Some(vec![json!("a1")]));
    }

    #[test]
    fn detail_links_parents_and_children() {
        let conn = fixture();
        let catalog = introspect(&conn, &BTreeMap::new()).expect("catalog");
        let config = AdminConfig::default();

        let post = record_detail(&conn, &catalog, "Post", &json!(1), &config).expect("post");
        assert_eq!(post.item["title"], json!("First"));
        assert_eq!(post.related_models.len(), 1);
        let parent = &post.related_models[0];
        assert_eq!(parent.name, "Author");
        assert_eq!(parent.fields, vec!["id".to_string()]);
        assert_eq!(parent.id, json!("a1"));
        assert_eq!(parent.direction, RelationDirection::Parent);

        let orphan = record_detail(&conn, &catalog, "Post", &json!(2), &config).expect("orphan");
        assert!(orphan.related_models.is_empty());

        let author = record_detail(&conn, &catalog, "Author", &json!("a1"), &config).expect("author");
        let children = &author.related_models[0];
        assert_eq!(children.name, "Post");
        assert_eq!(children.fields, vec!["author_id".to_string()]);
        assert_eq!(children.id, json!("a1"));
        assert_eq!(children.direction, RelationDirection::Children);
    }
}
