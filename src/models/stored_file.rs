//! Metadata of a file held in the chunked store.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// One row of the `<collection>.files` table.
///
/// The payload itself lives in `<collection>.chunks`, split into
/// `chunk_size`-byte pieces numbered from zero. Only the last chunk may be
/// shorter.
#[derive(Clone, FromRow, Debug)]
pub struct StoredFile {
    /// Unique identifier of the file.
    pub id: String,

    /// Logical name. Several revisions may share it.
    pub filename: String,

    /// Total size in bytes.
    pub length: i64,

    /// Size of every chunk but the last.
    pub chunk_size: i64,

    /// When the file was stored; newest wins for duplicate filenames.
    pub upload_date: DateTime<Utc>,

    /// Lowercase hex MD5 of the whole payload, if recorded.
    pub md5: Option<String>,
}

impl StoredFile {
    /// Expected length of chunk `n`, or `None` past the end of the file.
    pub fn chunk_len(&self, n: i64) -> Option<usize> {
        if self.chunk_size <= 0 || n < 0 {
            return None;
        }
        let start = n.checked_mul(self.chunk_size)?;
        if start >= self.length {
            return None;
        }
        Some((self.length - start).min(self.chunk_size) as usize)
    }
}
