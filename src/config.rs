use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "dbadmin.yaml";

const ENV_TARGET_DATABASE: &str = "DBADMIN_TARGET_DATABASE";
const ENV_ADMIN_DATABASE: &str = "DBADMIN_ADMIN_DATABASE";
const ENV_LOG_LEVEL: &str = "DBADMIN_LOG_LEVEL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ListConfig {
    pub default_take: u32,
    pub max_take: u32,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            default_take: 10,
            max_take: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct OptionsConfig {
    pub preload_limit: u32,
    pub search_limit: u32,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            preload_limit: 20,
            search_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ConsoleConfig {
    pub max_rows: u32,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self { max_rows: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    pub ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_hours: 168 }
    }
}

/// Startup configuration. Values come from `dbadmin.yaml` (when present) and
/// are then overridden by `DBADMIN_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AdminConfig {
    pub target_database: Option<PathBuf>,
    pub admin_database: Option<PathBuf>,
    pub log_level: String,
    pub list: ListConfig,
    pub options: OptionsConfig,
    pub console: ConsoleConfig,
    pub session: SessionConfig,
    /// Extra enum domains keyed by `model.field`.
    pub enums: BTreeMap<String, Vec<String>>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            target_database: None,
            admin_database: None,
            log_level: "info".to_string(),
            list: ListConfig::default(),
            options: OptionsConfig::default(),
            console: ConsoleConfig::default(),
            session: SessionConfig::default(),
            enums: BTreeMap::new(),
        }
    }
}

impl AdminConfig {
    /// Loads `<data_dir>/dbadmin.yaml` if it exists and applies environment overrides.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.is_file() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw).context("failed to parse yaml config")?;
        config.check()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_TARGET_DATABASE).filter(|value| !value.trim().is_empty()) {
            self.target_database = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_ADMIN_DATABASE).filter(|value| !value.trim().is_empty()) {
            self.admin_database = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL).filter(|value| !value.trim().is_empty()) {
            self.log_level = value;
        }
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.list.default_take == 0 || self.list.max_take == 0 {
            anyhow::bail!("list.default_take and list.max_take must be positive");
        }
        if self.list.default_take > self.list.max_take {
            anyhow::bail!(
                "list.default_take ({}) exceeds list.max_take ({})",
                self.list.default_take,
                self.list.max_take
            );
        }
        if self.session.ttl_hours <= 0 {
            anyhow::bail!("session.ttl_hours must be positive");
        }
        for key in self.enums.keys() {
            if key.split_once('.').is_none() {
                anyhow::bail!("enum override key '{}' must look like model.field", key);
            }
        }
        Ok(())
    }

    pub fn target_database_path(&self, data_dir: &Path) -> PathBuf {
        self.target_database
            .clone()
            .unwrap_or_else(|| data_dir.join("target.db"))
    }

    pub fn admin_database_path(&self, data_dir: &Path) -> PathBuf {
        self.admin_database
            .clone()
            .unwrap_or_else(|| data_dir.join("admin.db"))
    }

    /// Enum overrides regrouped per model: `model -> field -> values`.
    pub fn enum_overrides(&self) -> BTreeMap<String, BTreeMap<String, Vec<String>>> {
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for (key, values) in &self.enums {
            if let Some((model, field)) = key.split_once('.') {
                grouped
                    .entry(model.to_string())
                    .or_default()
                    .insert(field.to_string(), values.clone());
            }
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::AdminConfig;
    use std::path::{Path, PathBuf};

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = AdminConfig::from_yaml("").expect("config");
        assert_eq!(config.list.default_take, 10);
        assert_eq!(config.options.preload_limit, 20);
        assert_eq!(config.console.max_rows, 500);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = AdminConfig::from_yaml(
            "target_database: /srv/shop.db\nlist:\n  max_take: 50\nenums:\n  Order.status: [open, shipped]\n",
        )
        .expect("config");
        assert_eq!(config.target_database, Some(PathBuf::from("/srv/shop.db")));
        assert_eq!(config.list.max_take, 50);
        assert_eq!(config.list.default_take, 10);
        let grouped = config.enum_overrides();
        assert_eq!(grouped["Order"]["status"], vec!["open".to_string(), "shipped".to_string()]);
    }

    #[test]
    fn rejects_inconsistent_list_bounds() {
        let error = AdminConfig::from_yaml("list:\n  default_take: 80\n  max_take: 20\n")
            .expect_err("must fail");
        assert!(format!("{:#}", error).contains("exceeds"));
    }

    #[test]
    fn rejects_malformed_enum_keys() {
        assert!(AdminConfig::from_yaml("enums:\n  status: [a]\n").is_err());
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AdminConfig::from_yaml("target_database: a.db\nlog_level: warn\n").expect("config");
        config.apply_env_overrides(|key| match key {
            "DBADMIN_TARGET_DATABASE" => Some("b.db".to_string()),
            "DBADMIN_LOG_LEVEL" => Some(" ".to_string()),
            _ => None,
        });
        assert_eq!(config.target_database, Some(PathBuf::from("b.db")));
        assert_eq!(config.log_level, "warn");
        assert_eq!(
            config.admin_database_path(Path::new("/data")),
            PathBuf::from("/data/admin.db")
        );
    }
}
