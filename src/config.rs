use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Name of the one table this service maintains in the vector store.
pub const TABLE_NAME: &str = "software_project_index";

/// Ignore patterns applied when `IGNORE_PATTERNS` is not set.
pub const DEFAULT_IGNORE_PATTERNS: &str =
    ".*,*.db,*.sqlite,*.log,node_modules/*,venv/*,.git/*";

/// Model used when `EMBEDDING_MODEL_NAME` is not set.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Canonicalized project root, the single directory this instance indexes.
    pub project_root: PathBuf,
    pub lancedb_uri: String,
    pub embedding_model_name: String,
    pub ignore_patterns: Vec<String>,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

impl Settings {
    /// Build settings from the CLI project root plus environment overrides.
    /// The root must exist and be a directory; everything else has a default.
    pub fn from_env(project_root: &Path) -> IndexResult<Self> {
        if !project_root.is_dir() {
            return Err(IndexError::Config(format!(
                "project root is not a directory: {}",
                project_root.display()
            )));
        }
        let project_root = dunce::canonicalize(project_root).map_err(|e| {
            IndexError::Config(format!(
                "cannot canonicalize project root {}: {}",
                project_root.display(),
                e
            ))
        })?;

        let lancedb_uri = std::env::var("LANCEDB_URI").unwrap_or_else(|_| {
            project_root.join(".lancedb").to_string_lossy().to_string()
        });

        let embedding_model_name = std::env::var("EMBEDDING_MODEL_NAME")
            .unwrap_or_else(|_| DEFAULT_EMBEDDING_MODEL.to_string());

        let raw_patterns = std::env::var("IGNORE_PATTERNS")
            .unwrap_or_else(|_| DEFAULT_IGNORE_PATTERNS.to_string());
        let ignore_patterns = parse_ignore_patterns(&raw_patterns);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());
        match log_level.to_ascii_uppercase().as_str() {
            "DEBUG" | "INFO" | "WARN" | "ERROR" => {}
            other => {
                return Err(IndexError::Config(format!("invalid LOG_LEVEL: {other}")));
            }
        }

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| IndexError::Config(format!("invalid PORT: {v}")))?,
            Err(_) => 8000,
        };

        Ok(Self {
            project_root,
            lancedb_uri,
            embedding_model_name,
            ignore_patterns,
            log_level,
            host,
            port,
        })
    }
}

/// Split a comma-separated pattern list, dropping empty entries.
pub fn parse_ignore_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ignore_patterns() {
        let patterns = parse_ignore_patterns(".*, *.log ,,node_modules/*");
        assert_eq!(patterns, vec![".*", "*.log", "node_modules/*"]);
    }

    #[test]
    fn test_parse_ignore_patterns_empty() {
        assert!(parse_ignore_patterns("").is_empty());
        assert!(parse_ignore_patterns(" , ,").is_empty());
    }
}
