//! Errors surfaced to callers of the request manager.

use std::fmt;

use thiserror::Error;

use crate::transport::{OpenFlags, Permissions};

/// Breadcrumbs attached to surfaced errors: which sources were serving
/// reads and which had been excluded when the failure happened, plus any
/// failure-specific notes (problematic data server, last URL tried).
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Ids of the sources that were active.
    pub active: Vec<String>,
    /// Ids of the sources that had been permanently excluded.
    pub disabled: Vec<String>,
    /// Free-form additional information.
    pub notes: Vec<String>,
}

impl ErrorContext {
    /// Appends a free-form note to the context.
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in &self.active {
            write!(f, "; active source: {id}")?;
        }
        for id in &self.disabled {
            write!(f, "; disabled source: {id}")?;
        }
        for note in &self.notes {
            write!(f, "; {note}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by [`RequestManager`](crate::manager::RequestManager).
///
/// Transient per-source read failures never appear here: those disable the
/// failing source and re-dispatch the request internally. A surfaced error
/// means the request cannot be satisfied by any replica.
#[derive(Debug, Error)]
pub enum XrdError {
    /// Opening the file failed, either during construction or while
    /// recovering from a source failure. This also covers a redirector
    /// handing back a server that was explicitly excluded, and a recovery
    /// open that did not finish within the stream timeout.
    #[error("open of '{path}' failed (flags={flags}, permissions={perms}): {reason}{context}")]
    FileOpen {
        path: String,
        flags: OpenFlags,
        perms: Permissions,
        reason: String,
        context: ErrorContext,
    },

    /// A data server returned a response the transport could not interpret.
    /// Not retried; the caller has its own handling for this case.
    #[error("read of '{path}' from {source_id} failed: {reason}{context}")]
    FileRead {
        path: String,
        source_id: String,
        reason: String,
        context: ErrorContext,
    },
}
