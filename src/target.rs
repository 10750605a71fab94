use crate::catalog::{self, ModelCatalog};
use crate::errors::{AppError, AppResult};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

type EnumOverrides = BTreeMap<String, BTreeMap<String, Vec<String>>>;

struct CachedCatalog {
    schema_version: i64,
    catalog: Arc<ModelCatalog>,
}

/// The administered database. Metadata is re-read whenever SQLite reports a
/// new `schema_version`, so migrations applied behind our back show up on the
/// next request.
pub struct TargetDatabase {
    conn: Mutex<Connection>,
    path: PathBuf,
    enum_overrides: EnumOverrides,
    cached: RwLock<Option<CachedCatalog>>,
}

impl TargetDatabase {
    pub fn open(path: &Path, enum_overrides: EnumOverrides) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            enum_overrides,
            cached: RwLock::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::Internal("target database mutex poisoned".to_string()))?;
        f(&conn)
    }

    /// Separate read-only handle for the query console.
    pub fn open_read_only(&self) -> AppResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    pub fn catalog(&self) -> AppResult<Arc<ModelCatalog>> {
        let version = self.with_conn(|conn| {
            conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
                .map_err(AppError::from)
        })?;

        {
            let cached = self
                .cached
                .read()
                .map_err(|_| AppError::Internal("catalog cache lock poisoned".to_string()))?;
            if let Some(entry) = cached.as_ref() {
                if entry.schema_version == version {
                    return Ok(entry.catalog.clone());
                }
            }
        }

        self.reload_catalog()
    }

    pub fn reload_catalog(&self) -> AppResult<Arc<ModelCatalog>> {
        let (version, catalog) = self.with_conn(|conn| {
            let version = conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))?;
            let catalog = catalog::introspect(conn, &self.enum_overrides)?;
            Ok((version, catalog))
        })?;
        let catalog = Arc::new(catalog);
        tracing::info!(schema_version = version, models = catalog.models.len(), "model catalog loaded");

        let mut cached = self
            .cached
            .write()
            .map_err(|_| AppError::Internal("catalog cache lock poisoned".to_string()))?;
        *cached = Some(CachedCatalog {
            schema_version: version,
            catalog: catalog.clone(),
        });
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::TargetDatabase;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn catalog_is_cached_until_schema_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = TargetDatabase::open(&dir.path().join("target.db"), BTreeMap::new()).expect("open");
        target
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE Item (id TEXT PRIMARY KEY, name TEXT NOT NULL);")?;
                Ok(())
            })
            .expect("schema");

        let first = target.catalog().expect("catalog");
        let second = target.catalog().expect("catalog again");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.models.len(), 1);

        target
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE Tag (id TEXT PRIMARY KEY);")?;
                Ok(())
            })
            .expect("migrate");
        let third = target.catalog().expect("catalog after migration");
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.models.len(), 2);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = TargetDatabase::open(&dir.path().join("target.db"), BTreeMap::new()).expect("open");
        target
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE Item (id TEXT PRIMARY KEY);")?;
                Ok(())
            })
            .expect("schema");
        let read_only = target.open_read_only().expect("read only");
        assert!(read_only.execute("INSERT INTO Item (id) VALUES ('x')", []).is_err());
    }
}
