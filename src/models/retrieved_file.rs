//! Result of draining one stored file for a single request.

/// Lives for one request and is dropped once the response is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedFile {
    /// Lookup key as it arrived in the request path.
    pub key: String,

    /// Full payload.
    pub content: Vec<u8>,

    /// Logical name reported by the store; may differ from `key`.
    pub name: String,
}
