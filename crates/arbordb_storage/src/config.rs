//! Backend selection and connection descriptor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which backend to use and how to reach it.
///
/// The engine treats everything but `backend`, `pool_size`,
/// `acquire_timeout` and `read_only` as opaque; each backend reads the
/// fields it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Registered backend name (`memory`, `file`).
    pub backend: String,

    /// Snapshot file for file-backed stores.
    pub path: Option<PathBuf>,

    /// Host for networked backends.
    pub host: Option<String>,

    /// Port for networked backends.
    pub port: Option<u16>,

    /// User name.
    pub user: Option<String>,

    /// Password.
    pub password: Option<String>,

    /// Maximum number of simultaneously open connections.
    pub pool_size: usize,

    /// How long to wait for a free connection (`None` waits forever).
    #[serde(with = "optional_millis")]
    pub acquire_timeout: Option<Duration>,

    /// Reject every mutating call.
    pub read_only: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
            host: None,
            port: None,
            user: None,
            password: None,
            pool_size: 16,
            acquire_timeout: Some(Duration::from_secs(30)),
            read_only: false,
        }
    }
}

impl BackendConfig {
    /// Creates a configuration for the named backend with default settings.
    #[must_use]
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    /// Configuration for the in-memory backend.
    #[must_use]
    pub fn memory() -> Self {
        Self::new("memory")
    }

    /// Configuration for the snapshot-file backend at `path`.
    #[must_use]
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new("file").path(path)
    }

    /// Sets the snapshot path.
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets the host and port.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BackendConfig::default();
        assert_eq!(config.backend, "memory");
        assert_eq!(config.pool_size, 16);
        assert!(!config.read_only);
    }

    #[test]
    fn builder_pattern() {
        let config = BackendConfig::file("/tmp/store.cbor")
            .pool_size(4)
            .acquire_timeout(None)
            .read_only(true);

        assert_eq!(config.backend, "file");
        assert_eq!(config.path, Some(PathBuf::from("/tmp/store.cbor")));
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.acquire_timeout, None);
        assert!(config.read_only);
    }

    #[test]
    fn deserializes_partial_json() {
        let config: BackendConfig =
            serde_json::from_str(r#"{"backend": "file", "path": "a.cbor", "acquire_timeout": 250}"#)
                .unwrap();
        assert_eq!(config.backend, "file");
        assert_eq!(config.acquire_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.pool_size, 16);
    }
}
