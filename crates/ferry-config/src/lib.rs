//! Configuration for ferry.
//!
//! Configuration is read from a `ferry.toml` file (or `.ferry.toml`) and may be partially
//! overridden through environment variables. Every field has a default so a missing file is
//! equivalent to an empty one.
//!
//! ```toml
//! [classpath]
//! chunk_size = 65536
//! timestamp_round_up_ms = 1999
//! max_export_depth = 2
//! archive_extensions = ["jar", "zip"]
//! cache_dir = "/var/cache/ferry"
//! http_timeout_ms = 30000
//!
//! [registry]
//! wait_timeout_ms = 30000
//!
//! [remote]
//! connect_timeout_ms = 10000
//! max_frame_bytes = 67108864
//! max_idle_connections = 4
//!
//! [bus]
//! worker_threads = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File names probed by [`discover_config_path`], in order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["ferry.toml", ".ferry.toml"];

/// Overrides [`ClasspathConfig::cache_dir`].
pub const ENV_CACHE_DIR: &str = "FERRY_CACHE_DIR";
/// Overrides [`ClasspathConfig::chunk_size`].
pub const ENV_CHUNK_SIZE: &str = "FERRY_CHUNK_SIZE";

pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
pub const DEFAULT_TIMESTAMP_ROUND_UP_MS: u64 = 1999;
pub const DEFAULT_MAX_EXPORT_DEPTH: usize = 2;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_SEQUENCE_WIDTH: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 4;
/// Bytes of each frame reserved for the message envelope around a download chunk.
pub const FRAME_OVERHEAD_BYTES: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a snippet of the input; keep only the message.
        ConfigError::Toml(redact_quoted(err.message()))
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];
        match rest.find('"') {
            Some(end) => {
                out.push_str("<redacted>\"");
                rest = &rest[end + 1..];
            }
            None => {
                out.push_str("<redacted>");
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub classpath: ClasspathConfig,
    pub registry: RegistryConfig,
    pub remote: RemoteConfig,
    pub bus: BusConfig,
}

/// Classpath export/import settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClasspathConfig {
    /// Bytes requested per `download` call.
    pub chunk_size: u32,
    /// Added to a file's modification time before it is truncated to the two-second
    /// resolution of zip timestamps.
    pub timestamp_round_up_ms: u64,
    /// How many ancestor scopes are flattened ahead of the exported scope.
    pub max_export_depth: usize,
    /// File extensions (without the dot) accepted as classpath archives.
    pub archive_extensions: Vec<String>,
    /// Local cache directory for imported archives.
    pub cache_dir: Option<PathBuf>,
    /// Download distinct archives concurrently during import.
    pub parallel_downloads: bool,
    /// Connect and read timeout for passthrough `http(s)` lookups.
    pub http_timeout_ms: u64,
}

impl Default for ClasspathConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timestamp_round_up_ms: DEFAULT_TIMESTAMP_ROUND_UP_MS,
            max_export_depth: DEFAULT_MAX_EXPORT_DEPTH,
            archive_extensions: vec!["jar".to_string(), "zip".to_string()],
            cache_dir: None,
            parallel_downloads: true,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

impl ClasspathConfig {
    pub fn timestamp_round_up(&self) -> Duration {
        Duration::from_millis(self.timestamp_round_up_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Returns `true` if `path` carries one of the configured archive extensions.
    pub fn is_archive(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        self.archive_extensions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(ext))
    }

    /// The cache directory to use, falling back to `~/.ferry/cache/classpath`.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Some(dir.clone());
        }
        let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
        Some(
            PathBuf::from(home)
                .join(".ferry")
                .join("cache")
                .join("classpath"),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Default deadline for registry waits.
    pub wait_timeout_ms: u64,
    /// Zero-padded width of sequential node suffixes.
    pub sequence_width: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            sequence_width: DEFAULT_SEQUENCE_WIDTH,
        }
    }
}

impl RegistryConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// TCP transport settings for serving and fetching classpaths.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub connect_timeout_ms: u64,
    /// Read/write timeout on client sockets. `None` blocks indefinitely.
    pub io_timeout_ms: Option<u64>,
    /// Largest frame either side accepts. Checked before the payload is allocated.
    pub max_frame_bytes: u32,
    /// Connections a client keeps open per server between calls. Concurrent calls beyond
    /// this open extra connections that are closed afterwards.
    pub max_idle_connections: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            io_timeout_ms: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub worker_threads: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_threads: available.clamp(1, 4),
        }
    }
}

impl FerryConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let config: FerryConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.classpath.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                key: "classpath.chunk_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.classpath.http_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "classpath.http_timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.classpath.archive_extensions.is_empty() {
            return Err(ConfigError::Invalid {
                key: "classpath.archive_extensions",
                message: "must list at least one extension".to_string(),
            });
        }
        if self.remote.max_frame_bytes < 2 * FRAME_OVERHEAD_BYTES {
            return Err(ConfigError::Invalid {
                key: "remote.max_frame_bytes",
                message: format!("must be at least {}", 2 * FRAME_OVERHEAD_BYTES),
            });
        }
        if self.classpath.chunk_size > self.remote.max_frame_bytes - FRAME_OVERHEAD_BYTES {
            return Err(ConfigError::Invalid {
                key: "classpath.chunk_size",
                message: format!(
                    "must leave {FRAME_OVERHEAD_BYTES} bytes of remote.max_frame_bytes free"
                ),
            });
        }
        if self.bus.worker_threads == 0 {
            return Err(ConfigError::Invalid {
                key: "bus.worker_threads",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Apply `FERRY_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            if !dir.trim().is_empty() {
                self.classpath.cache_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            let raw = raw.trim();
            if !raw.is_empty() {
                let chunk_size = raw.parse::<u32>().map_err(|err| ConfigError::Invalid {
                    key: ENV_CHUNK_SIZE,
                    message: err.to_string(),
                })?;
                self.classpath.chunk_size = chunk_size;
            }
        }
        self.validate()
    }
}

/// Find the config file for `dir`, if any.
pub fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Load configuration for `dir`, applying environment overrides.
///
/// If no config file is present, returns the defaults and `None`.
pub fn load_for_dir(dir: &Path) -> Result<(FerryConfig, Option<PathBuf>), ConfigError> {
    let (mut config, path) = match discover_config_path(dir) {
        Some(path) => (FerryConfig::load_from_path(&path)?, Some(path)),
        None => (FerryConfig::default(), None),
    };
    config.apply_env()?;
    tracing::debug!(
        target: "ferry.config",
        path = ?path,
        chunk_size = config.classpath.chunk_size,
        "loaded configuration"
    );
    Ok((config, path))
}
