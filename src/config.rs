use clap::Parser;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use thiserror::Error;

/// Reference read size used when draining a stored file.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const MAX_STORE_NAME_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no store endpoints configured, please adjust your config file")]
    NoEndpoints,
    #[error("`{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How an incoming lookup key is matched against stored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    ById,
    ByFilename,
}

impl ResolutionMode {
    /// `"_id"` selects identifier lookup; every other field name means filename.
    pub fn from_field(field: &str) -> Self {
        if field == "_id" {
            Self::ById
        } else {
            if field != "filename" {
                tracing::warn!(field, "unrecognised resolution field, resolving by filename");
            }
            Self::ByFilename
        }
    }

    pub fn field_name(self) -> &'static str {
        match self {
            Self::ById => "_id",
            Self::ByFilename => "filename",
        }
    }
}

/// Read consistency requested from the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsistencyMode {
    #[default]
    Strong,
    Monotonic,
    Eventual,
}

impl ConsistencyMode {
    pub fn parse(mode: &str) -> Self {
        match mode.to_ascii_lowercase().as_str() {
            "monotonic" => Self::Monotonic,
            "eventual" => Self::Eventual,
            "" | "strong" => Self::Strong,
            other => {
                tracing::warn!(mode = other, "unknown consistency mode, using strong");
                Self::Strong
            }
        }
    }
}

/// Response status behaviour for failed retrievals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Always 200, empty body and empty attachment filename.
    Permissive,
    /// NotFound maps to 404, store failures to 502.
    Strict,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Serve GridFS-style stored files over HTTP")]
pub struct Args {
    /// Config file in JSON format
    #[arg(long, env = "GRIDSERVE_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Listen address (overrides `listen` from the config file)
    #[arg(long)]
    pub listen: Option<String>,

    /// Install the files/chunks schema on the primary endpoint and exit
    #[arg(long)]
    pub migrate: bool,
}

/// On-disk layout of the JSON config file.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    #[serde(alias = "Servers")]
    servers: Vec<String>,
    #[serde(alias = "Logfile")]
    logfile: String,
    #[serde(alias = "Database")]
    database: String,
    #[serde(alias = "GridFSCollection")]
    gridfs_collection: String,
    #[serde(alias = "Field")]
    field: String,
    #[serde(alias = "Listen")]
    listen: String,
    #[serde(alias = "HandlePath")]
    handle_path: String,
    #[serde(alias = "Debug")]
    debug: bool,
    #[serde(alias = "Mode")]
    mode: String,
    #[serde(alias = "StrictStatus")]
    strict_status: bool,
    #[serde(alias = "ReadChunkSize")]
    read_chunk_size: usize,
    #[serde(alias = "MaxConnections")]
    max_connections: u32,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            logfile: String::new(),
            database: "gridfs".into(),
            gridfs_collection: "fs".into(),
            field: "_id".into(),
            listen: "127.0.0.1:8080".into(),
            handle_path: "/".into(),
            debug: false,
            mode: String::new(),
            strict_status: false,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Validated service configuration. Loaded once and never mutated.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub servers: Vec<String>,
    /// Empty means standard output.
    pub logfile: String,
    pub database: String,
    pub collection: String,
    pub resolution: ResolutionMode,
    pub listen: String,
    pub handle_path: String,
    pub debug: bool,
    pub consistency: ConsistencyMode,
    pub status_policy: StatusPolicy,
    pub read_chunk_size: usize,
    pub max_connections: u32,
}

impl ServiceConfig {
    /// Read and validate the JSON config file at `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_json(&raw).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path, source },
            other => other,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        Self::try_from(raw)
    }

    /// Address to bind. A bare `:port` means all interfaces.
    pub fn addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

impl TryFrom<RawConfig> for ServiceConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        let servers: Vec<String> = raw
            .servers
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }

        ensure_store_name("database", &raw.database)?;
        ensure_store_name("gridfs_collection", &raw.gridfs_collection)?;

        if !raw.handle_path.starts_with('/') || !raw.handle_path.ends_with('/') {
            return Err(ConfigError::Invalid {
                field: "handle_path",
                reason: format!("`{}` must start and end with `/`", raw.handle_path),
            });
        }
        if raw.read_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "read_chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        if raw.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            servers,
            logfile: raw.logfile,
            database: raw.database,
            collection: raw.gridfs_collection,
            resolution: ResolutionMode::from_field(&raw.field),
            listen: raw.listen,
            handle_path: raw.handle_path,
            debug: raw.debug,
            consistency: ConsistencyMode::parse(&raw.mode),
            status_policy: if raw.strict_status {
                StatusPolicy::Strict
            } else {
                StatusPolicy::Permissive
            },
            read_chunk_size: raw.read_chunk_size,
            max_connections: raw.max_connections,
        })
    }
}

/// Database and collection names end up in file and table names.
fn ensure_store_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_STORE_NAME_LEN {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be between 1 and {MAX_STORE_NAME_LEN} characters"),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("`{name}` may only contain letters, digits, `_` and `-`"),
        });
    }
    Ok(())
}
