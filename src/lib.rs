pub mod admin;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod console;
pub mod dashboards;
pub mod db;
pub mod errors;
pub mod logging;
pub mod models;
pub mod options;
pub mod records;
pub mod schema_gen;
pub mod target;
pub mod users;
pub mod views;

#[cfg(feature = "desktop")]
mod desktop;

pub use admin::AdminCore;
pub use config::AdminConfig;
pub use errors::{AppError, AppResult};

#[cfg(feature = "desktop")]
pub use desktop::run;
