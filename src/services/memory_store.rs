//! Scripted in-memory [`GridStore`] for exercising read and close failures.

use crate::services::grid_store::{GridReader, GridStore, ReadOutcome, StoreError, StoreResult};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A stored file plus the misbehaviour its readers should show.
#[derive(Clone)]
pub struct ScriptedFile {
    id: String,
    filename: String,
    content: Vec<u8>,
    eof_with_data: bool,
    fail_after: Option<usize>,
    fail_close: bool,
    stall: bool,
    delay: Option<Duration>,
    closes: CloseCounter,
}

impl ScriptedFile {
    pub fn new(id: &str, filename: &str, content: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            content,
            eof_with_data: true,
            fail_after: None,
            fail_close: false,
            stall: false,
            delay: None,
            closes: CloseCounter::default(),
        }
    }

    /// Deliver the last bytes together with end of stream (default), or
    /// follow them with a separate empty end-of-stream read.
    pub fn eof_with_data(mut self, yes: bool) -> Self {
        self.eof_with_data = yes;
        self
    }

    /// Fail the first read that starts at or after `offset`.
    pub fn fail_after(mut self, offset: usize) -> Self {
        self.fail_after = Some(offset);
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Every read returns no data and no end of stream.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Sleep before each read so concurrent readers interleave.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn close_counter(&self) -> CloseCounter {
        self.closes.clone()
    }
}

struct ScriptedReader {
    file: ScriptedFile,
    pos: usize,
}

#[async_trait]
impl GridReader for ScriptedReader {
    fn name(&self) -> &str {
        &self.file.filename
    }

    async fn read(&mut self, buf: &mut [u8]) -> StoreResult<ReadOutcome> {
        if let Some(delay) = self.file.delay {
            tokio::time::sleep(delay).await;
        }
        if self.file.stall {
            return Ok(ReadOutcome { n: 0, eof: false });
        }
        if self.file.fail_after.is_some_and(|limit| self.pos >= limit) {
            return Err(StoreError::Io("injected read failure".into()));
        }

        let remaining = &self.file.content[self.pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;

        let at_end = self.pos == self.file.content.len();
        let eof = if self.file.eof_with_data {
            at_end
        } else {
            at_end && n == 0
        };
        Ok(ReadOutcome { n, eof })
    }

    async fn close(&mut self) -> StoreResult<()> {
        self.file.closes.0.fetch_add(1, Ordering::SeqCst);
        if self.file.fail_close {
            return Err(StoreError::Io("injected close failure".into()));
        }
        Ok(())
    }
}

/// Files keyed by identifier; every open attempt is recorded.
#[derive(Clone, Default)]
pub struct MemoryStore {
    files: Arc<Mutex<HashMap<String, ScriptedFile>>>,
    opens: Arc<Mutex<Vec<(&'static str, String)>>>,
}

impl MemoryStore {
    pub fn insert(&self, file: ScriptedFile) {
        self.files.lock().unwrap().insert(file.id.clone(), file);
    }

    /// `(field, key)` for every open attempt, in order.
    pub fn opens(&self) -> Vec<(&'static str, String)> {
        self.opens.lock().unwrap().clone()
    }

    fn open_where(
        &self,
        field: &'static str,
        key: &str,
        matches: impl Fn(&ScriptedFile) -> bool,
    ) -> StoreResult<Box<dyn GridReader>> {
        self.opens.lock().unwrap().push((field, key.to_string()));
        let file = self
            .files
            .lock()
            .unwrap()
            .values()
            .find(|f| matches(f))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                field,
                key: key.to_string(),
            })?;
        Ok(Box::new(ScriptedReader { file, pos: 0 }))
    }
}

#[async_trait]
impl GridStore for MemoryStore {
    async fn open_id(&self, id: &str) -> StoreResult<Box<dyn GridReader>> {
        self.open_where("_id", id, |f| f.id == id)
    }

    async fn open_name(&self, filename: &str) -> StoreResult<Box<dyn GridReader>> {
        self.open_where("filename", filename, |f| f.filename == filename)
    }
}
