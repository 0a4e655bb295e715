//! A single open replica connection and its observed quality.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{trace, warn};

use crate::chunk::FilledChunk;
use crate::config::INITIAL_QUALITY;
use crate::request::{ClientRequest, ReadPayload};
use crate::transport::ReplicaFile;

/// Upper clamp on a single latency sample fed into the quality average.
const MAX_QUALITY_SAMPLE: u64 = 60_000;

/// Added to a source's quality when an operation fails, on top of doubling
/// it; one failure is enough to make the source demotion-eligible.
const ERROR_QUALITY_PENALTY: u32 = 1024;

/// One open replica connection.
///
/// The quality score is a smoothed per-operation latency in milliseconds,
/// so lower is better. It is maintained here on every completed dispatch
/// and read by the manager's health check through the atomic.
pub(crate) struct Source {
    id: String,
    file: Arc<dyn ReplicaFile>,
    quality: AtomicU32,
    /// Milliseconds since the manager epoch of the last demotion, offset
    /// by one so zero can mean "never demoted".
    last_downgrade_ms: AtomicU64,
    epoch: Instant,
}

impl Source {
    pub(crate) fn new(id: String, file: Arc<dyn ReplicaFile>, epoch: Instant) -> Self {
        Self {
            id,
            file,
            quality: AtomicU32::new(INITIAL_QUALITY),
            last_downgrade_ms: AtomicU64::new(0),
            epoch,
        }
    }

    /// Server identity, typically `host:port`.
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Handle to the underlying open file.
    pub(crate) fn file(&self) -> Arc<dyn ReplicaFile> {
        Arc::clone(&self.file)
    }

    pub(crate) fn quality(&self) -> u32 {
        self.quality.load(Ordering::Relaxed)
    }

    /// When this source was last demoted, or `None` if it never was.
    pub(crate) fn last_downgrade(&self) -> Option<Instant> {
        match self.last_downgrade_ms.load(Ordering::Relaxed) {
            0 => None,
            stamp => Some(self.epoch + Duration::from_millis(stamp - 1)),
        }
    }

    pub(crate) fn downgraded_before(&self) -> bool {
        self.last_downgrade_ms.load(Ordering::Relaxed) != 0
    }

    pub(crate) fn mark_downgraded(&self, now: Instant) {
        let stamp = now.duration_since(self.epoch).as_millis() as u64 + 1;
        self.last_downgrade_ms.store(stamp, Ordering::Relaxed);
    }

    fn record_success(&self, elapsed: Duration) {
        let sample = (elapsed.as_millis() as u64).clamp(1, MAX_QUALITY_SAMPLE) as u32;
        let old = self.quality.load(Ordering::Relaxed);
        let updated = old.saturating_mul(3).saturating_add(sample) / 4;
        self.quality.store(updated, Ordering::Relaxed);
        trace!(source = %self.id, quality = updated, sample, "Updated source quality");
    }

    fn record_failure(&self) {
        let old = self.quality.load(Ordering::Relaxed);
        let updated = old.saturating_mul(2).saturating_add(ERROR_QUALITY_PENALTY);
        self.quality.store(updated, Ordering::Relaxed);
        trace!(source = %self.id, quality = updated, "Penalized source quality after failure");
    }

    #[cfg(test)]
    pub(crate) fn force_quality(&self, quality: u32) {
        self.quality.store(quality, Ordering::Relaxed);
    }

    /// Dispatches one request against this replica.
    ///
    /// The read runs on its own task; the request's promise is resolved on
    /// success, while failures are routed through the manager's recovery so
    /// the request can be re-dispatched to another replica.
    pub(crate) fn dispatch(self: Arc<Self>, request: Arc<ClientRequest>) {
        request.assign_source(&self);
        let source = self;
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match request.payload() {
                ReadPayload::Single { offset, len } => {
                    source.file.read_at(*offset, *len).await.map(|data| {
                        vec![FilledChunk {
                            offset: *offset,
                            data,
                        }]
                    })
                }
                ReadPayload::Vectored(chunks) => {
                    source.file.vector_read(chunks).await.map(|buffers| {
                        chunks
                            .iter()
                            .zip(buffers)
                            .map(|(chunk, data)| FilledChunk {
                                offset: chunk.offset,
                                data,
                            })
                            .collect()
                    })
                }
            };
            match outcome {
                Ok(filled) => {
                    source.record_success(started.elapsed());
                    request.fulfill(filled);
                }
                Err(status) => {
                    source.record_failure();
                    warn!(source = %source.id, error = %status, "Read dispatch failed");
                    // No manager means no caller is waiting on this request
                    // anymore; dropping the promise is the only option left.
                    let Some(manager) = request.manager() else { return };
                    if let Err(fatal) = manager.request_failure(&request, status).await {
                        request.fail(fatal);
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id)
            .field("quality", &self.quality())
            .finish_non_exhaustive()
    }
}
