//! Transport seam to the underlying XRootD protocol client.
//!
//! This crate does not speak the XRootD wire protocol itself. The
//! embedding application supplies a [`Transport`] implementation wrapping
//! its protocol client; the manager only relies on the narrow contract
//! defined here: open a URL, read from an open file, query connection
//! properties, and send a one-shot informational message.
//!
//! The traits are object-safe so the manager can hold `Arc<dyn Transport>`
//! and move `Arc<dyn ReplicaFile>` handles between its source tables.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::chunk::IoChunk;

/// Property key for the data-server identity (`host:port`) of a connection.
pub const PROP_DATA_SERVER: &str = "DataServer";

/// Property key for the last URL the client was redirected to.
pub const PROP_LAST_URL: &str = "LastURL";

/// Open mode flags, passed through to the transport untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading.
    pub const READ: Self = Self(0x0010);
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Access permissions, passed through to the transport untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(pub u32);

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0{:o}", self.0)
    }
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The server's response could not be interpreted. Never retried.
    InvalidResponse,
    /// The connection to the server broke.
    SocketError,
    /// The operation did not complete within the stream timeout.
    OperationExpired,
    /// The server answered with an error.
    ServerError,
    /// Anything the transport could not classify further.
    Unknown,
}

/// A failure reported by the transport for a single operation.
#[derive(Debug, Clone, Error)]
#[error("{message} (code={code:?})")]
pub struct TransportError {
    pub code: ErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A failed open attempt, together with whatever identity the transport
/// learned before failing. The manager uses the data server to extend its
/// exclusion list and the last URL to detect a redirector that never
/// redirected.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct OpenFailure {
    pub error: TransportError,
    /// `host:port` of the data server that refused us, when known.
    pub data_server: Option<String>,
    /// Last URL the client ended up at, when known.
    pub last_url: Option<String>,
}

/// One open replica connection.
#[async_trait]
pub trait ReplicaFile: Send + Sync {
    /// Reads `len` bytes starting at `offset`. A short buffer means the
    /// read crossed the end of the file.
    async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, TransportError>;

    /// Reads every fragment of `chunks`, returning one buffer per fragment
    /// in the same order.
    async fn vector_read(&self, chunks: &[IoChunk]) -> Result<Vec<Bytes>, TransportError>;

    /// Queries a connection property such as [`PROP_DATA_SERVER`] or
    /// [`PROP_LAST_URL`].
    fn property(&self, name: &str) -> Option<String>;
}

/// Entry point into the XRootD protocol client library.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens `url` and returns a handle to the resulting connection.
    async fn open(
        &self,
        url: &str,
        flags: OpenFlags,
        perms: Permissions,
    ) -> Result<Box<dyn ReplicaFile>, OpenFailure>;

    /// Sends a one-shot informational message (job identity) to the server
    /// behind `url`. The response is not interesting; `timeout` bounds the
    /// attempt.
    async fn send_info(&self, url: &str, info: &str, timeout: Duration) -> Result<(), TransportError>;

    /// The `StreamErrorWindow` setting of the transport environment, in
    /// seconds, when the environment defines one.
    fn stream_error_window(&self) -> Option<u64> {
        None
    }
}
