//! Engine configuration.

use std::path::PathBuf;

/// Default prefix of dispatched job titles.
pub const DEFAULT_JOB_TITLE_PREFIX: &str = "[video]";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database backing the catalog; in-memory only when unset
    pub catalog_path: Option<PathBuf>,
    /// Prefix of dispatched job titles
    pub job_title_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            job_title_prefix: DEFAULT_JOB_TITLE_PREFIX.to_string(),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            catalog_path: std::env::var("ENGINE_CATALOG_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            job_title_prefix: std::env::var("ENGINE_JOB_TITLE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_JOB_TITLE_PREFIX.to_string()),
        }
    }
}
