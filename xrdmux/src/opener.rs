//! Single-flight asynchronous replica opener.
//!
//! At most one open attempt is in flight at a time. Every caller asking
//! for a new replica while an attempt is running subscribes to the same
//! outcome instead of triggering a second connection:
//!
//! ```text
//! health check ──┐
//!                ├──► OpenHandler ────► Transport::open ──► Source
//! recovery    ──┘         │                                   │
//!                         ▼                                   │
//!                  [both receive the ◄────────────────────────┘
//!                   same outcome]
//! ```
//!
//! The attempt itself runs on its own task. It holds a strong reference to
//! the manager for its duration, merges its result into the manager's
//! source tables, and only then broadcasts the outcome, so a woken waiter
//! always observes the installed source.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::XrdError;
use crate::manager::RequestManager;
use crate::source::Source;

/// Outcome of one open attempt, shared by every caller awaiting it.
pub(crate) type OpenOutcome = Result<Arc<Source>, Arc<XrdError>>;

pub(crate) struct OpenHandler {
    manager: Weak<RequestManager>,
    state: Mutex<OpenState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct OpenState {
    in_flight: Option<broadcast::Sender<OpenOutcome>>,
    current_url: Option<String>,
}

impl OpenHandler {
    pub(crate) fn new(manager: Weak<RequestManager>) -> Self {
        Self {
            manager,
            state: Mutex::new(OpenState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Requests a new replica, returning a receiver for the outcome of the
    /// current attempt. Joins the in-flight attempt when one exists.
    pub(crate) fn open(&self) -> broadcast::Receiver<OpenOutcome> {
        let mut state = self.state.lock();
        if let Some(tx) = &state.in_flight {
            debug!("Open already in flight; subscribing to its outcome");
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(4);
        state.in_flight = Some(tx.clone());
        drop(state);

        tokio::spawn(run_open(self.manager.clone(), self.cancel.clone(), tx));
        rx
    }

    /// The URL of the in-flight attempt, for diagnostics.
    pub(crate) fn current_source_label(&self) -> String {
        match &self.state.lock().current_url {
            Some(url) => url.clone(),
            None => "(no open in progress)".to_string(),
        }
    }

    /// Makes any late transport callback a no-op. Called on teardown.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn set_current_url(&self, url: String) {
        self.state.lock().current_url = Some(url);
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        state.in_flight = None;
        state.current_url = None;
    }
}

impl Drop for OpenHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_open(
    manager: Weak<RequestManager>,
    cancel: CancellationToken,
    tx: broadcast::Sender<OpenOutcome>,
) {
    // A manager that is already gone has no tables to merge into and no
    // waiters that could still hold a receiver.
    let Some(manager) = manager.upgrade() else { return };

    let url = manager.open_url();
    manager.opener().set_current_url(url.clone());
    info!(url = %url, "Trying to open a new source");

    let bound = manager.open_wait_bound();
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(url = %url, "Open attempt abandoned during teardown");
            manager.opener().finish();
            return;
        }
        result = timeout(bound, manager.open_once(&url)) => result,
    };

    let outcome: OpenOutcome = match result {
        Ok(Ok(source)) => Ok(source),
        Ok(Err(error)) => Err(Arc::new(error)),
        Err(_elapsed) => Err(Arc::new(manager.open_timeout_error(&url, bound))),
    };

    // Install before broadcasting so waiters observe the new source.
    manager.handle_open(&outcome);
    manager.opener().finish();
    let _ = tx.send(outcome);
}
