//! Resolves a lookup key to a stored file and drains it into memory.

use crate::{
    config::ResolutionMode,
    models::retrieved_file::RetrievedFile,
    services::grid_store::{GridReader, GridStore, ReadOutcome, StoreError, StoreResult},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// A failed retrieval. `name` holds the resolved filename when the store
/// error happened after the file was opened, and is `None` otherwise.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct RetrievalError {
    pub name: Option<String>,
    #[source]
    pub source: StoreError,
}

impl From<StoreError> for RetrievalError {
    fn from(source: StoreError) -> Self {
        Self { name: None, source }
    }
}

/// Retrieval engine shared by all requests.
///
/// The resolution mode is fixed at construction; every key handed to
/// [`RetrievalService::retrieve`] is interpreted the same way.
#[derive(Clone)]
pub struct RetrievalService {
    store: Arc<dyn GridStore>,
    mode: ResolutionMode,
    read_chunk_size: usize,
}

impl RetrievalService {
    pub fn new(store: Arc<dyn GridStore>, mode: ResolutionMode, read_chunk_size: usize) -> Self {
        Self {
            store,
            mode,
            read_chunk_size: read_chunk_size.max(1),
        }
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    /// Open `key` under the configured mode and read it to the end.
    ///
    /// The reader is closed exactly once after a successful open, whatever
    /// the outcome of the drain. On any error no content is returned, even
    /// if part of the file was already read; the error carries the resolved
    /// name instead.
    pub async fn retrieve(&self, key: &str) -> Result<RetrievedFile, RetrievalError> {
        let mut reader = match self.mode {
            ResolutionMode::ById => self.store.open_id(key).await?,
            ResolutionMode::ByFilename => self.store.open_name(key).await?,
        };
        let name = reader.name().to_string();

        let drained = drain(reader.as_mut(), self.read_chunk_size).await;
        let closed = reader.close().await;

        let content = match (drained, closed) {
            (Ok(content), Ok(())) => content,
            (Err(read_err), Err(close_err)) => {
                debug!(key, error = %close_err, "close failed after read error");
                return Err(RetrievalError {
                    name: Some(name),
                    source: read_err,
                });
            }
            (Err(source), Ok(())) | (Ok(_), Err(source)) => {
                return Err(RetrievalError {
                    name: Some(name),
                    source,
                });
            }
        };

        debug!(key, name = %name, bytes = content.len(), "retrieved file");
        Ok(RetrievedFile {
            key: key.to_string(),
            content,
            name,
        })
    }
}

/// Read until the reader reports end of stream. Bytes delivered together
/// with the end-of-stream flag are kept.
async fn drain(reader: &mut dyn GridReader, chunk_size: usize) -> StoreResult<Vec<u8>> {
    let mut content = Vec::new();
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let ReadOutcome { n, eof } = reader.read(&mut chunk).await?;
        content.extend_from_slice(&chunk[..n]);
        if eof {
            return Ok(content);
        }
        if n == 0 {
            return Err(StoreError::Io(format!(
                "stalled read on `{}`: no data and no end of stream",
                reader.name()
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        grid_store::{SqliteGridStore, test_support::*},
        memory_store::{MemoryStore, ScriptedFile},
    };
    use chrono::Utc;

    fn service(store: &MemoryStore, mode: ResolutionMode) -> RetrievalService {
        RetrievalService::new(Arc::new(store.clone()), mode, 4096)
    }

    #[tokio::test]
    async fn retrieves_every_size_exactly() {
        for len in [0usize, 1, 4095, 4096, 4097, 8192, 10_000] {
            let content = patterned(len);
            let store = MemoryStore::default();
            store.insert(ScriptedFile::new("id", "blob.bin", content.clone()));

            let file = service(&store, ResolutionMode::ById)
                .retrieve("id")
                .await
                .unwrap();
            assert_eq!(file.content.len(), len);
            assert_eq!(file.content, content);
            assert_eq!(file.name, "blob.bin");
            assert_eq!(file.key, "id");
        }
    }

    #[tokio::test]
    async fn keeps_final_chunk_delivered_with_eof() {
        let store = MemoryStore::default();
        store.insert(ScriptedFile::new("id", "tail.bin", patterned(5000)).eof_with_data(true));

        let file = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap();
        assert_eq!(file.content, patterned(5000));
    }

    #[tokio::test]
    async fn keeps_trailing_empty_eof_read() {
        let store = MemoryStore::default();
        store.insert(ScriptedFile::new("id", "tail.bin", patterned(5000)).eof_with_data(false));

        let file = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap();
        assert_eq!(file.content, patterned(5000));
    }

    #[tokio::test]
    async fn read_failure_discards_partial_content() {
        let store = MemoryStore::default();
        let file = ScriptedFile::new("id", "broken.bin", patterned(10_000)).fail_after(4096);
        let closes = file.close_counter();
        store.insert(file);

        let err = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap_err();
        assert!(matches!(err.source, StoreError::Io(_)));
        assert_eq!(err.name.as_deref(), Some("broken.bin"));
        assert_eq!(closes.get(), 1);
    }

    #[tokio::test]
    async fn close_failure_after_full_read_fails_retrieval() {
        let store = MemoryStore::default();
        let file = ScriptedFile::new("id", "bad-close.bin", patterned(100)).fail_close();
        let closes = file.close_counter();
        store.insert(file);

        let err = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap_err();
        assert!(matches!(err.source, StoreError::Io(_)));
        assert_eq!(err.name.as_deref(), Some("bad-close.bin"));
        assert_eq!(closes.get(), 1);
    }

    #[tokio::test]
    async fn read_error_wins_over_close_error() {
        let store = MemoryStore::default();
        store.insert(
            ScriptedFile::new("id", "both.bin", patterned(100))
                .fail_after(0)
                .fail_close(),
        );

        let err = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected read failure"), "{err}");
    }

    #[tokio::test]
    async fn closes_exactly_once_on_success() {
        let store = MemoryStore::default();
        let file = ScriptedFile::new("id", "ok.bin", patterned(9000));
        let closes = file.close_counter();
        store.insert(file);

        service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap();
        assert_eq!(closes.get(), 1);
    }

    #[tokio::test]
    async fn stalled_reader_is_reported() {
        let store = MemoryStore::default();
        let file = ScriptedFile::new("id", "stall.bin", patterned(10)).stall();
        let closes = file.close_counter();
        store.insert(file);

        let err = service(&store, ResolutionMode::ById)
            .retrieve("id")
            .await
            .unwrap_err();
        assert!(matches!(err.source, StoreError::Io(_)));
        assert_eq!(closes.get(), 1);
    }

    #[tokio::test]
    async fn resolution_mode_never_falls_back() {
        let store = MemoryStore::default();
        store.insert(ScriptedFile::new("a1", "64b2f1c0ffee", b"x".to_vec()));

        let by_id = service(&store, ResolutionMode::ById);
        assert!(matches!(
            by_id.retrieve("64b2f1c0ffee").await,
            Err(RetrievalError {
                name: None,
                source: StoreError::NotFound { field: "_id", .. },
            })
        ));
        assert_eq!(store.opens(), vec![("_id", "64b2f1c0ffee".to_string())]);

        let by_name = service(&store, ResolutionMode::ByFilename);
        assert!(matches!(
            by_name.retrieve("a1").await,
            Err(RetrievalError {
                name: None,
                source: StoreError::NotFound { field: "filename", .. },
            })
        ));
        assert_eq!(by_name.retrieve("64b2f1c0ffee").await.unwrap().content, b"x");
    }

    #[tokio::test]
    async fn empty_key_is_passed_to_the_store() {
        let store = MemoryStore::default();
        let err = service(&store, ResolutionMode::ByFilename)
            .retrieve("")
            .await
            .unwrap_err();
        assert!(matches!(err.source, StoreError::NotFound { .. }));
        assert!(err.name.is_none());
        assert_eq!(store.opens(), vec![("filename", String::new())]);
    }

    #[tokio::test]
    async fn retrieval_is_idempotent() {
        let (_dir, pool) = store_dir().await;
        put_file(&pool, "64b2f1", "report.pdf", &patterned(10_000), 255, Utc::now()).await;
        let retrieval = RetrievalService::new(
            Arc::new(SqliteGridStore::new(pool, COLLECTION)),
            ResolutionMode::ById,
            4096,
        );

        let first = retrieval.retrieve("64b2f1").await.unwrap();
        let second = retrieval.retrieve("64b2f1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "report.pdf");
        assert_eq!(first.content.len(), 10_000);
    }

    #[tokio::test]
    async fn checksum_mismatch_surfaces_as_io_error() {
        let (_dir, pool) = store_dir().await;
        put_file_raw(&pool, "bad", "bad.bin", b"payload", 4, Utc::now(), Some("deadbeef")).await;
        let retrieval = RetrievalService::new(
            Arc::new(SqliteGridStore::new(pool, COLLECTION)),
            ResolutionMode::ById,
            3,
        );

        assert!(matches!(
            retrieval.retrieve("bad").await,
            Err(RetrievalError {
                name: Some(name),
                source: StoreError::Io(_),
            }) if name == "bad.bin"
        ));
    }
}
