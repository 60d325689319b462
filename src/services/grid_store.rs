//! src/services/grid_store.rs
//!
//! Read-only client for a GridFS-style chunked store kept in SQLite.
//!
//! Each store endpoint is a data directory holding `<database>.db`. Inside,
//! `"<collection>.files"` carries one metadata row per stored file and
//! `"<collection>.chunks"` carries the payload split into numbered chunks.
//! Files are opened either by identifier or by filename and then read
//! sequentially through a [`GridReader`].

use crate::{
    config::{ConsistencyMode, ServiceConfig},
    models::stored_file::StoredFile,
};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no file with {field} `{key}`")]
    NotFound { field: &'static str, key: String },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("store unreachable: {0}")]
    Connectivity(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Connectivity(err.to_string()),
            _ => StoreError::Io(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a single [`GridReader::read`] call.
///
/// `n` bytes were written to the caller's buffer. `eof` is set on the call
/// that delivers the final bytes, so a caller must consume `n` before acting
/// on `eof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub n: usize,
    pub eof: bool,
}

/// Resolves lookup keys to open files.
#[async_trait]
pub trait GridStore: Send + Sync {
    /// Open the file whose unique identifier equals `id`.
    async fn open_id(&self, id: &str) -> StoreResult<Box<dyn GridReader>>;

    /// Open the newest file whose filename equals `filename`.
    async fn open_name(&self, filename: &str) -> StoreResult<Box<dyn GridReader>>;
}

/// Sequential cursor over one open file.
#[async_trait]
pub trait GridReader: Send {
    /// Logical name of the open file.
    fn name(&self) -> &str;

    async fn read(&mut self, buf: &mut [u8]) -> StoreResult<ReadOutcome>;

    /// Release the file. Reports integrity failures detected after a full read.
    async fn close(&mut self) -> StoreResult<()>;
}

/// GridFS-layout store on a shared SQLite pool.
///
/// Cloning is cheap; all clones share the pool.
#[derive(Clone)]
pub struct SqliteGridStore {
    pool: SqlitePool,
    collection: String,
    select_by_id: Arc<str>,
    select_by_name: Arc<str>,
    select_chunk: Arc<str>,
}

const FILE_COLUMNS: &str = "id, filename, length, chunk_size, upload_date, md5";

impl SqliteGridStore {
    /// Wrap an existing pool. `collection` must already be validated.
    pub fn new(pool: SqlitePool, collection: &str) -> Self {
        let files = files_table(collection);
        let chunks = chunks_table(collection);
        Self {
            pool,
            collection: collection.to_string(),
            select_by_id: format!("SELECT {FILE_COLUMNS} FROM {files} WHERE id = ?").into(),
            select_by_name: format!(
                "SELECT {FILE_COLUMNS} FROM {files} WHERE filename = ? \
                 ORDER BY upload_date DESC, rowid DESC LIMIT 1"
            )
            .into(),
            select_chunk: format!("SELECT data FROM {chunks} WHERE files_id = ? AND n = ?").into(),
        }
    }

    /// Create the files/chunks tables if they do not exist yet.
    pub async fn install_schema(&self) -> StoreResult<()> {
        let statements = schema_statements(&self.collection);
        info!("Installing {} schema statements...", statements.len());
        for stmt in statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(&stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn open_file(&self, file: StoredFile) -> StoreResult<Box<dyn GridReader>> {
        ensure_file_consistent(&file)?;
        debug!(
            id = %file.id,
            filename = %file.filename,
            length = file.length,
            uploaded = %file.upload_date,
            "opened stored file"
        );
        Ok(Box::new(GridFile::new(
            self.pool.clone(),
            self.select_chunk.clone(),
            file,
        )))
    }
}

#[async_trait]
impl GridStore for SqliteGridStore {
    async fn open_id(&self, id: &str) -> StoreResult<Box<dyn GridReader>> {
        let file = sqlx::query_as::<_, StoredFile>(&self.select_by_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                field: "_id",
                key: id.to_string(),
            })?;
        self.open_file(file)
    }

    async fn open_name(&self, filename: &str) -> StoreResult<Box<dyn GridReader>> {
        let file = sqlx::query_as::<_, StoredFile>(&self.select_by_name)
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                field: "filename",
                key: filename.to_string(),
            })?;
        self.open_file(file)
    }
}

/// Reader over one stored file. Chunks are fetched one at a time as the
/// caller drains the previous one.
pub struct GridFile {
    pool: SqlitePool,
    select_chunk: Arc<str>,
    file: StoredFile,
    next_chunk: i64,
    pending: Bytes,
    delivered: u64,
    digest: md5::Context,
    closed: bool,
}

impl GridFile {
    fn new(pool: SqlitePool, select_chunk: Arc<str>, file: StoredFile) -> Self {
        Self {
            pool,
            select_chunk,
            file,
            next_chunk: 0,
            pending: Bytes::new(),
            delivered: 0,
            digest: md5::Context::new(),
            closed: false,
        }
    }

    fn length(&self) -> u64 {
        self.file.length.max(0) as u64
    }

    async fn fetch_chunk(&mut self) -> StoreResult<()> {
        let n = self.next_chunk;
        let expected = self.file.chunk_len(n).ok_or_else(|| {
            StoreError::Io(format!("file `{}` has no chunk {}", self.file.id, n))
        })?;

        let data = sqlx::query_scalar::<_, Vec<u8>>(&self.select_chunk)
            .bind(self.file.id.as_str())
            .bind(n)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                StoreError::Io(format!("chunk {} of file `{}` is missing", n, self.file.id))
            })?;

        if data.len() != expected {
            return Err(StoreError::Io(format!(
                "chunk {} of file `{}` holds {} bytes, expected {}",
                n,
                self.file.id,
                data.len(),
                expected
            )));
        }

        self.pending = Bytes::from(data);
        self.next_chunk += 1;
        Ok(())
    }
}

#[async_trait]
impl GridReader for GridFile {
    fn name(&self) -> &str {
        &self.file.filename
    }

    async fn read(&mut self, buf: &mut [u8]) -> StoreResult<ReadOutcome> {
        if self.closed {
            return Err(StoreError::Io(format!(
                "read on closed file `{}`",
                self.file.id
            )));
        }

        if self.pending.is_empty() && self.delivered < self.length() && !buf.is_empty() {
            self.fetch_chunk().await?;
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.digest.consume(&buf[..n]);
        self.pending.advance(n);
        self.delivered += n as u64;

        Ok(ReadOutcome {
            n,
            eof: self.pending.is_empty() && self.delivered >= self.length(),
        })
    }

    async fn close(&mut self) -> StoreResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.delivered < self.length() {
            debug!(
                id = %self.file.id,
                delivered = self.delivered,
                length = self.length(),
                "closed before end of file"
            );
            return Ok(());
        }

        if let Some(expected) = self.file.md5.as_deref() {
            let digest = std::mem::replace(&mut self.digest, md5::Context::new()).compute();
            let actual = format!("{:x}", digest);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(StoreError::Io(format!(
                    "checksum mismatch for file `{}`: stored {}, read {}",
                    self.file.id, expected, actual
                )));
            }
        }
        Ok(())
    }
}

/// Connect to the store according to the configured consistency mode.
///
/// - `Strong` reads from the primary (first endpoint) only.
/// - `Monotonic` takes the first reachable endpoint through a single pinned
///   connection.
/// - `Eventual` takes the first reachable endpoint with a full pool.
pub async fn connect(cfg: &ServiceConfig) -> StoreResult<SqliteGridStore> {
    let candidates: &[String] = match cfg.consistency {
        ConsistencyMode::Strong => cfg.servers.get(..1).unwrap_or_default(),
        ConsistencyMode::Monotonic | ConsistencyMode::Eventual => &cfg.servers,
    };
    let max_connections = match cfg.consistency {
        ConsistencyMode::Monotonic => 1,
        ConsistencyMode::Strong | ConsistencyMode::Eventual => cfg.max_connections,
    };

    let mut last_err = None;
    for endpoint in candidates {
        let path = database_path(endpoint, &cfg.database);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true)
            .create_if_missing(false);

        match SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
        {
            Ok(pool) => {
                info!(
                    endpoint = %endpoint,
                    mode = ?cfg.consistency,
                    max_connections,
                    "connected to store"
                );
                return Ok(SqliteGridStore::new(pool, &cfg.collection));
            }
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "store endpoint unreachable");
                last_err = Some(format!("{}: {}", path.display(), err));
            }
        }
    }

    Err(StoreError::Connectivity(
        last_err.unwrap_or_else(|| "no store endpoints configured".into()),
    ))
}

/// Open the primary endpoint read-write and install the schema.
pub async fn migrate(cfg: &ServiceConfig) -> anyhow::Result<()> {
    let endpoint = cfg
        .servers
        .first()
        .ok_or_else(|| anyhow::anyhow!("no store endpoints configured"))?;
    let path = database_path(endpoint, &cfg.database);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tokio::fs::create_dir_all(parent).await?;
            info!("Created store directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .journal_mode(SqliteJournalMode::Delete)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    SqliteGridStore::new(pool, &cfg.collection)
        .install_schema()
        .await?;
    Ok(())
}

/// `<endpoint>/<database>.db`; a `sqlite://` scheme on the endpoint is ignored.
pub fn database_path(endpoint: &str, database: &str) -> PathBuf {
    Path::new(endpoint.trim_start_matches("sqlite://")).join(format!("{database}.db"))
}

fn files_table(collection: &str) -> String {
    format!("\"{collection}.files\"")
}

fn chunks_table(collection: &str) -> String {
    format!("\"{collection}.chunks\"")
}

fn schema_statements(collection: &str) -> Vec<String> {
    let files = files_table(collection);
    let chunks = chunks_table(collection);
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {files} (
                id TEXT PRIMARY KEY NOT NULL,
                filename TEXT NOT NULL,
                length INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                upload_date TEXT NOT NULL,
                md5 TEXT
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS \"{collection}.files_filename\" \
             ON {files} (filename, upload_date)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {chunks} (
                files_id TEXT NOT NULL,
                n INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (files_id, n)
            )"
        ),
    ]
}

/// Reject metadata rows that cannot describe a readable payload.
fn ensure_file_consistent(file: &StoredFile) -> StoreResult<()> {
    if file.length < 0 {
        return Err(StoreError::Io(format!(
            "file `{}` has negative length {}",
            file.id, file.length
        )));
    }
    if file.length > 0 && file.chunk_size <= 0 {
        return Err(StoreError::Io(format!(
            "file `{}` has invalid chunk size {}",
            file.id, file.chunk_size
        )));
    }
    Ok(())
}
