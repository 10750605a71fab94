use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AddWidgetPayload, DashboardDetail, DashboardRecord, DashboardWidget, UpdateDashboardLayoutPayload,
    WidgetLayoutItem,
};
use serde_json::json;
use uuid::Uuid;

pub const GRID_COLUMNS: i32 = 12;
const DEFAULT_WIDGET_SIZE: i32 = 4;

/// Placement for the `n`-th widget when the client did not pick one.
pub fn default_placement(existing: usize) -> (i32, i32, i32, i32) {
    let n = existing as i32;
    ((n * 3) % GRID_COLUMNS, (n / 4) * 3, DEFAULT_WIDGET_SIZE, DEFAULT_WIDGET_SIZE)
}

pub fn check_layout(item: &WidgetLayoutItem) -> AppResult<()> {
    let WidgetLayoutItem {
        widget_id,
        grid_x,
        grid_y,
        grid_w,
        grid_h,
    } = item;
    if *grid_x < 0 || *grid_y < 0 {
        return Err(AppError::Validation(format!("Widget {} has a negative position", widget_id)));
    }
    if *grid_w < 1 || *grid_h < 1 {
        return Err(AppError::Validation(format!("Widget {} must be at least 1x1", widget_id)));
    }
    if *grid_w > GRID_COLUMNS - *grid_x {
        return Err(AppError::Validation(format!(
            "Widget {} overflows the {}-column grid",
            widget_id, GRID_COLUMNS
        )));
    }
    Ok(())
}

fn clean_name(raw: &str, what: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::Validation(format!("{} is required", what)));
    }
    Ok(name.to_string())
}

fn require_dashboard(db: &Database, id: &str) -> AppResult<DashboardRecord> {
    db.get_dashboard(id)?
        .ok_or_else(|| AppError::NotFound(format!("Dashboard {} not found", id)))
}

pub fn create_dashboard(db: &Database, name: &str) -> AppResult<DashboardRecord> {
    let dashboard = db.insert_dashboard(&clean_name(name, "Dashboard name")?)?;
    tracing::info!(dashboard_id = %dashboard.id, "dashboard created");
    Ok(dashboard)
}

pub fn get_dashboard(db: &Database, id: &str) -> AppResult<DashboardDetail> {
    let dashboard = require_dashboard(db, id)?;
    let widgets = db.list_widgets(id)?;
    Ok(DashboardDetail { dashboard, widgets })
}

pub fn rename_dashboard(db: &Database, id: &str, name: &str) -> AppResult<DashboardRecord> {
    db.rename_dashboard(id, &clean_name(name, "Dashboard name")?)?
        .ok_or_else(|| AppError::NotFound(format!("Dashboard {} not found", id)))
}

pub fn delete_dashboard(db: &Database, id: &str) -> AppResult<()> {
    if !db.delete_dashboard(id)? {
        return Err(AppError::NotFound(format!("Dashboard {} not found", id)));
    }
    tracing::info!(dashboard_id = %id, "dashboard deleted");
    Ok(())
}

pub fn add_widget(db: &Database, payload: &AddWidgetPayload) -> AppResult<DashboardWidget> {
    require_dashboard(db, &payload.dashboard_id)?;
    let existing = db.list_widgets(&payload.dashboard_id)?;
    let (x, y, w, h) = default_placement(existing.len());

    let widget = DashboardWidget {
        id: Uuid::new_v4().to_string(),
        dashboard_id: payload.dashboard_id.clone(),
        title: clean_name(&payload.title, "Widget title")?,
        kind: payload.kind,
        position: existing.iter().map(|widget| widget.position + 1).max().unwrap_or(0),
        grid_x: payload.grid_x.unwrap_or(x),
        grid_y: payload.grid_y.unwrap_or(y),
        grid_w: payload.grid_w.unwrap_or(w),
        grid_h: payload.grid_h.unwrap_or(h),
        config: payload.config.clone().unwrap_or_else(|| json!({})),
    };
    check_layout(&WidgetLayoutItem {
        widget_id: widget.id.clone(),
        grid_x: widget.grid_x,
        grid_y: widget.grid_y,
        grid_w: widget.grid_w,
        grid_h: widget.grid_h,
    })?;

    db.insert_widget(&widget)?;
    tracing::info!(dashboard_id = %widget.dashboard_id, widget_id = %widget.id, kind = widget.kind.as_str(), "widget added");
    Ok(widget)
}

pub fn remove_widget(db: &Database, widget_id: &str) -> AppResult<String> {
    db.delete_widget(widget_id)?
        .ok_or_else(|| AppError::NotFound(format!("Widget {} not found", widget_id)))
}

pub fn update_layout(db: &Database, payload: &UpdateDashboardLayoutPayload) -> AppResult<DashboardDetail> {
    require_dashboard(db, &payload.dashboard_id)?;
    for item in &payload.layouts {
        check_layout(item)?;
    }
    db.update_widget_layouts(&payload.dashboard_id, &payload.layouts)?;
    get_dashboard(db, &payload.dashboard_id)
}

pub fn reorder_widgets(db: &Database, dashboard_id: &str, widget_ids: &[String]) -> AppResult<DashboardDetail> {
    let current = get_dashboard(db, dashboard_id)?;
    let mut expected: Vec<&str> = current.widgets.iter().map(|widget| widget.id.as_str()).collect();
    let mut given: Vec<&str> = widget_ids.iter().map(String::as_str).collect();
    expected.sort_unstable();
    given.sort_unstable();
    if expected != given {
        return Err(AppError::Validation(
            "Widget order must list every widget of the dashboard exactly once".to_string(),
        ));
    }
    db.reorder_widgets(dashboard_id, widget_ids)?;
    get_dashboard(db, dashboard_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WidgetKind;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("admin.db")).expect("db");
        (dir, db)
    }

    fn widget(dashboard_id: &str, title: &str) -> AddWidgetPayload {
        AddWidgetPayload {
            dashboard_id: dashboard_id.to_string(),
            title: title.to_string(),
            kind: WidgetKind::Stats,
            config: None,
            grid_x: None,
            grid_y: None,
            grid_w: None,
            grid_h: None,
        }
    }

    #[test]
    fn default_placement_walks_the_grid() {
        assert_eq!(default_placement(0), (0, 0, 4, 4));
        assert_eq!(default_placement(1), (3, 0, 4, 4));
        assert_eq!(default_placement(4), (0, 3, 4, 4));
        assert_eq!(default_placement(5), (3, 3, 4, 4));
    }

    #[test]
    fn layout_bounds_are_enforced() {
        let item = |x, y, w, h| WidgetLayoutItem {
            widget_id: "w".to_string(),
            grid_x: x,
            grid_y: y,
            grid_w: w,
            grid_h: h,
        };
        assert!(check_layout(&item(8, 0, 4, 2)).is_ok());
        assert!(check_layout(&item(9, 0, 4, 2)).is_err());
        assert!(check_layout(&item(-1, 0, 4, 2)).is_err());
        assert!(check_layout(&item(0, 0, 0, 2)).is_err());
        assert!(check_layout(&item(GRID_COLUMNS, 0, 1, 1)).is_err());
        assert!(check_layout(&item(i32::MAX, 0, 1, 1)).is_err());
        assert!(check_layout(&item(0, 0, i32::MAX, 1)).is_err());
    }

    #[test]
    fn widgets_are_placed_positioned_and_reordered() {
        let (_dir, db) = open();
        let dashboard = create_dashboard(&db, " Sales ").expect("dashboard");
        assert_eq!(dashboard.name, "Sales");

        let first = add_widget(&db, &widget(&dashboard.id, "Orders")).expect("first");
        let second = add_widget(&db, &widget(&dashboard.id, "Revenue")).expect("second");
        assert_eq!((second.grid_x, second.grid_y, second.position), (3, 0, 1));

        let reordered = reorder_widgets(&db, &dashboard.id, &[second.id.clone(), first.id.clone()]).expect("reorder");
        assert_eq!(reordered.widgets[0].id, second.id);
        assert!(reorder_widgets(&db, &dashboard.id, &[second.id.clone()]).is_err());

        let updated = update_layout(
            &db,
            &UpdateDashboardLayoutPayload {
                dashboard_id: dashboard.id.clone(),
                layouts: vec![WidgetLayoutItem {
                    widget_id: first.id.clone(),
                    grid_x: 0,
                    grid_y: 6,
                    grid_w: 12,
                    grid_h: 2,
                }],
            },
        )
        .expect("layout");
        let moved = updated.widgets.iter().find(|widget| widget.id == first.id).expect("moved");
        assert_eq!((moved.grid_y, moved.grid_w), (6, 12));

        assert_eq!(remove_widget(&db, &first.id).expect("remove"), dashboard.id);
        assert!(remove_widget(&db, &first.id).is_err());
    }

    #[test]
    fn deleting_dashboard_cascades_to_widgets() {
        let (_dir, db) = open();
        let dashboard = create_dashboard(&db, "Ops").expect("dashboard");
        add_widget(&db, &widget(&dashboard.id, "Queue")).expect("widget");
        delete_dashboard(&db, &dashboard.id).expect("delete");
        assert!(get_dashboard(&db, &dashboard.id).is_err());
        assert!(db.list_widgets(&dashboard.id).expect("widgets").is_empty());
        assert!(add_widget(&db, &widget(&dashboard.id, "Orphan")).is_err());
    }
}
