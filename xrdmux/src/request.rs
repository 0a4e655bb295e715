//! One logical client read and its completion promise.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::chunk::{total_size, FilledChunk, IoChunk};
use crate::error::XrdError;
use crate::manager::RequestManager;
use crate::source::Source;

/// Payload of a [`ClientRequest`]: one contiguous range or a scatter list.
#[derive(Debug, Clone)]
pub(crate) enum ReadPayload {
    Single { offset: u64, len: u64 },
    Vectored(Vec<IoChunk>),
}

pub(crate) type ReadReply = Result<Vec<FilledChunk>, XrdError>;

/// A read in flight. The request outlives any single dispatch attempt: on
/// a transient source failure the manager re-dispatches the same request
/// to another replica, and the promise resolves exactly once.
pub(crate) struct ClientRequest {
    payload: ReadPayload,
    manager: Weak<RequestManager>,
    current_source: Mutex<Option<Arc<Source>>>,
    reply: Mutex<Option<oneshot::Sender<ReadReply>>>,
}

impl ClientRequest {
    pub(crate) fn single(
        manager: Weak<RequestManager>,
        offset: u64,
        len: u64,
    ) -> (Arc<Self>, oneshot::Receiver<ReadReply>) {
        Self::new(manager, ReadPayload::Single { offset, len })
    }

    pub(crate) fn vectored(
        manager: Weak<RequestManager>,
        chunks: Vec<IoChunk>,
    ) -> (Arc<Self>, oneshot::Receiver<ReadReply>) {
        Self::new(manager, ReadPayload::Vectored(chunks))
    }

    fn new(manager: Weak<RequestManager>, payload: ReadPayload) -> (Arc<Self>, oneshot::Receiver<ReadReply>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            payload,
            manager,
            current_source: Mutex::new(None),
            reply: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub(crate) fn payload(&self) -> &ReadPayload {
        &self.payload
    }

    /// Total bytes requested.
    pub(crate) fn size(&self) -> u64 {
        match &self.payload {
            ReadPayload::Single { len, .. } => *len,
            ReadPayload::Vectored(chunks) => total_size(chunks),
        }
    }

    pub(crate) fn manager(&self) -> Option<Arc<RequestManager>> {
        self.manager.upgrade()
    }

    pub(crate) fn assign_source(&self, source: &Arc<Source>) {
        *self.current_source.lock() = Some(Arc::clone(source));
    }

    /// The source currently servicing this request, if any dispatch
    /// happened yet.
    pub(crate) fn current_source(&self) -> Option<Arc<Source>> {
        self.current_source.lock().clone()
    }

    pub(crate) fn fulfill(&self, filled: Vec<FilledChunk>) {
        self.resolve(Ok(filled));
    }

    pub(crate) fn fail(&self, error: XrdError) {
        self.resolve(Err(error));
    }

    fn resolve(&self, reply: ReadReply) {
        // First resolution wins; a dropped receiver is not an error.
        if let Some(tx) = self.reply.lock().take() {
            let _ = tx.send(reply);
        }
    }
}

impl std::fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRequest")
            .field("payload", &self.payload)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
