//! Configuration.

mod app;

pub use app::{AppConfig, DEFAULT_DATABASE_URL, DEFAULT_LOG_DIR};
