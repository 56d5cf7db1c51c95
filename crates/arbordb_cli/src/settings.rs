//! Configuration loading.

use arbordb_core::{CoreError, EngineConfig};
use arbordb_storage::BackendConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors reported by the CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// The configuration file could not be read.
    #[error("cannot read config {path:?}: {source}")]
    ReadConfig {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`Settings`].
    #[error("invalid config {path:?}: {source}")]
    ParseConfig {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Engine or backend failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Output could not be rendered.
    #[error("cannot render output: {0}")]
    Render(#[from] serde_json::Error),
}

/// Settings read from a JSON file.
///
/// ```json
/// {
///   "backend": { "backend": "file", "path": "site.cbor", "pool_size": 8 },
///   "engine": { "vacuum": { "page_size": 5000 } }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Storage backend.
    pub backend: BackendConfig,
    /// Engine options.
    pub engine: EngineConfig,
}

impl Settings {
    /// Loads settings from `file`, or defaults when no file is given.
    pub fn load(file: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = file else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| CliError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses settings from JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Applies command-line overrides.
    ///
    /// A `path` without an explicit backend selects the `file` backend.
    #[must_use]
    pub fn with_overrides(mut self, backend: Option<String>, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.backend.path = Some(path);
            if backend.is_none() {
                self.backend.backend = "file".to_string();
            }
        }
        if let Some(backend) = backend {
            self.backend.backend = backend;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_to_memory() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.backend.backend, "memory");
        assert_eq!(settings.engine, EngineConfig::default());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings = Settings::parse(
            r#"{"backend": {"backend": "file", "path": "site.cbor"}, "engine": {"vacuum": {"page_size": 10}}}"#,
        )
        .unwrap();
        assert_eq!(settings.backend.backend, "file");
        assert_eq!(settings.backend.path, Some(PathBuf::from("site.cbor")));
        assert_eq!(settings.backend.pool_size, BackendConfig::default().pool_size);
        assert_eq!(settings.engine.vacuum.page_size, 10);
        assert_eq!(settings.engine.vacuum.batch_size, 100);
    }

    #[test]
    fn path_override_selects_file_backend() {
        let settings = Settings::default().with_overrides(None, Some(PathBuf::from("x.cbor")));
        assert_eq!(settings.backend.backend, "file");

        let settings = Settings::default()
            .with_overrides(Some("memory".to_string()), Some(PathBuf::from("x.cbor")));
        assert_eq!(settings.backend.backend, "memory");
    }

    #[test]
    fn load_reports_bad_files() {
        let missing = Settings::load(Some(Path::new("/nonexistent/arbordb.json")));
        assert!(matches!(missing, Err(CliError::ReadConfig { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let invalid = Settings::load(Some(file.path()));
        assert!(matches!(invalid, Err(CliError::ParseConfig { .. })));
    }
}
