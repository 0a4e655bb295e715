//! Orchestration of redundant reads across replica sources.
//!
//! [`RequestManager`] fronts one logical remote file with up to two open
//! replica connections. Reads are split across the two replicas in
//! proportion to their observed quality, a periodic health check demotes
//! replicas that fall behind and promotes rested ones back, and a failed
//! replica is excluded for the lifetime of the manager while its requests
//! are re-dispatched elsewhere.
//!
//! ```text
//! read ──► health check ──► pick/split ──► Source A ──► transport
//!              │                      └──► Source B ──► transport
//!              ▼
//!         OpenHandler ──► new Source (installed under the table lock)
//! ```
//!
//! Every mutation of the source tables happens under one lock, which is
//! never held across an await point. The only place the caller's thread
//! waits on the transport is failure recovery, and that wait is bounded.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::chunk::{reassemble, FilledChunk, IoChunk};
use crate::config::{
    ManagerConfig, LONG_OPEN_DELAY, MONITORING_TIMEOUT, OPEN_GRACE, OPEN_PROBE_PERCENT,
    OPEN_RETRIES, QUALITY_FUDGE, QUALITY_HARD_LIMIT, QUALITY_SOFT_LIMIT, SHORT_OPEN_DELAY,
};
use crate::error::{ErrorContext, XrdError};
use crate::opener::{OpenHandler, OpenOutcome};
use crate::request::{ClientRequest, ReadReply};
use crate::source::Source;
use crate::split::split_request;
use crate::transport::{
    ErrorCode, OpenFlags, Permissions, ReplicaFile, Transport, TransportError, PROP_DATA_SERVER,
    PROP_LAST_URL,
};

/// Client-side coordinator for redundant reads against one remote file.
///
/// Construction opens the file through the redirector; afterwards the
/// manager keeps up to two replica connections serving reads and handles
/// source failures transparently. All methods are safe to call from
/// multiple tasks concurrently.
pub struct RequestManager {
    transport: Arc<dyn Transport>,
    name: String,
    flags: OpenFlags,
    perms: Permissions,
    timeout: Duration,
    job_id: Option<String>,
    epoch: Instant,
    /// Handed to requests so in-flight dispatches can route failures back
    /// here without keeping the manager alive.
    weak_self: Weak<RequestManager>,
    tables: Mutex<SourceTables>,
    opener: OpenHandler,
}

/// The three source collections and the health-check pacing state. Every
/// source lives in exactly one of the collections at a time.
struct SourceTables {
    /// Sources serving reads; never more than two.
    active: Vec<Arc<Source>>,
    /// Open but demoted sources, re-promotable after a cool-down.
    inactive: Vec<Arc<Source>>,
    /// Hard-failed sources, parked so their files are not closed from
    /// within a transport callback.
    disabled: Vec<Arc<Source>>,
    /// Ids of every server excluded for the lifetime of this manager;
    /// survives the source objects themselves.
    disabled_ids: BTreeSet<String>,
    last_check: Instant,
    next_check: Instant,
    /// Which active source receives the next single-buffer read.
    toggle_next: bool,
}

impl SourceTables {
    fn defer_next_check(&mut self) {
        self.next_check += LONG_OPEN_DELAY - SHORT_OPEN_DELAY;
    }
}

impl RequestManager {
    /// Opens `name` for reading, retrying across the data servers the
    /// redirector offers.
    ///
    /// Every failed attempt excludes the failing data server from the next
    /// one via the `tried=` URL parameter. The open fails permanently when
    /// the redirector repeats an excluded server, when it answers with the
    /// URL it was asked (no actual redirection happened), or after
    /// exhausting the retry budget.
    pub async fn open(
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
        flags: OpenFlags,
        perms: Permissions,
        config: ManagerConfig,
    ) -> Result<Arc<Self>, XrdError> {
        let name = name.into();
        let stream_timeout = config.resolve_timeout(transport.stream_error_window());

        let mut disabled_ids: BTreeSet<String> = BTreeSet::new();
        let mut opened = None;
        let mut last_reason = String::from("no data server could be contacted");
        let mut notes: Vec<String> = Vec::new();

        for attempt in 1..=OPEN_RETRIES {
            let opaque = tried_exclusions(disabled_ids.iter().map(String::as_str));
            let url = compose_url(&name, &opaque);
            match transport.open(&url, flags, perms).await {
                Ok(file) => {
                    opened = Some(file);
                    break;
                }
                Err(failure) => {
                    warn!(attempt, url = %url, error = %failure.error, "Failed to open file");
                    last_reason = failure.error.to_string();
                    notes.clear();
                    if let Some(server) = &failure.data_server {
                        notes.push(format!("problematic data server: {server}"));
                    }
                    if let Some(last_url) = &failure.last_url {
                        notes.push(format!("last URL tried: {last_url}"));
                        warn!(url = %last_url, "Failed to open file at URL");
                    }
                    if failure
                        .data_server
                        .as_ref()
                        .is_some_and(|server| disabled_ids.contains(server))
                    {
                        return Err(XrdError::FileOpen {
                            path: name,
                            flags,
                            perms,
                            reason: format!("{last_reason}; no additional data servers were found"),
                            context: ErrorContext {
                                active: Vec::new(),
                                disabled: disabled_ids.into_iter().collect(),
                                notes,
                            },
                        });
                    }
                    if let Some(server) = failure.data_server {
                        disabled_ids.insert(server);
                    }
                    // The redirector answered with the URL it was asked:
                    // we never left it, so retrying cannot reach a new
                    // server.
                    if failure.last_url.as_deref() == Some(url.as_str()) {
                        warn!(url = %url, "Redirector did not redirect");
                        return Err(XrdError::FileOpen {
                            path: name,
                            flags,
                            perms,
                            reason: format!("{last_reason}; the redirector did not redirect"),
                            context: ErrorContext {
                                active: Vec::new(),
                                disabled: disabled_ids.into_iter().collect(),
                                notes,
                            },
                        });
                    }
                }
            }
        }
        let Some(file) = opened else {
            return Err(XrdError::FileOpen {
                path: name,
                flags,
                perms,
                reason: last_reason,
                context: ErrorContext {
                    active: Vec::new(),
                    disabled: disabled_ids.into_iter().collect(),
                    notes,
                },
            });
        };

        let file: Arc<dyn ReplicaFile> = Arc::from(file);
        send_monitoring_info(transport.as_ref(), config.job_id.as_deref(), file.as_ref()).await;

        let epoch = Instant::now();
        let id = file
            .property(PROP_DATA_SERVER)
            .unwrap_or_else(|| String::from("unknown"));
        let source = Arc::new(Source::new(id, file, epoch));
        info!(source = source.id(), path = %name, "Opened initial source");

        Ok(Arc::new_cyclic(|weak| Self {
            transport,
            name,
            flags,
            perms,
            timeout: stream_timeout,
            job_id: config.job_id,
            epoch,
            weak_self: weak.clone(),
            tables: Mutex::new(SourceTables {
                active: vec![source],
                inactive: Vec::new(),
                disabled: Vec::new(),
                disabled_ids,
                last_check: epoch,
                next_check: epoch + SHORT_OPEN_DELAY,
                toggle_next: false,
            }),
            opener: OpenHandler::new(weak.clone()),
        }))
    }

    /// Reads `len` bytes at `offset`. The returned buffer's length is the
    /// number of bytes transferred.
    ///
    /// With two active sources, consecutive single reads alternate between
    /// them.
    pub async fn read_at(&self, offset: u64, len: u64) -> Result<Bytes, XrdError> {
        let (request, reply) = ClientRequest::single(self.weak_self.clone(), offset, len);
        let picked = {
            let mut t = self.tables.lock();
            self.check_sources(&mut t, Instant::now());
            Self::pick_single(&mut t)
        };
        match picked {
            Some(source) => source.dispatch(request),
            None => self.dispatch_after_recovery(request).await?,
        }
        let filled = self.await_reply(reply).await?;
        Ok(filled
            .into_iter()
            .next()
            .map(|chunk| chunk.data)
            .unwrap_or_default())
    }

    /// Reads a scatter list, returning one buffer per input fragment.
    ///
    /// With two active sources the list is split between them in
    /// proportion to their quality; the results are stitched back into the
    /// caller's fragment layout. Fragments must be offset-sorted.
    pub async fn vector_read(&self, iolist: Vec<IoChunk>) -> Result<Vec<Bytes>, XrdError> {
        if iolist.is_empty() {
            return Ok(Vec::new());
        }

        enum Plan {
            Whole(Arc<Source>),
            Split(Arc<Source>, Vec<IoChunk>, Arc<Source>, Vec<IoChunk>),
            Recover,
        }

        let plan = {
            let mut t = self.tables.lock();
            let now = Instant::now();
            if t.active.len() >= 2 {
                let (req1, req2) =
                    split_request(&iolist, t.active[0].quality(), t.active[1].quality());
                self.check_sources(&mut t, now);
                // The check may have demoted one of the two sources; fall
                // back to an unsplit dispatch in that case.
                if t.active.len() >= 2 {
                    Plan::Split(Arc::clone(&t.active[0]), req1, Arc::clone(&t.active[1]), req2)
                } else {
                    match t.active.first() {
                        Some(source) => Plan::Whole(Arc::clone(source)),
                        None => Plan::Recover,
                    }
                }
            } else {
                self.check_sources(&mut t, now);
                match t.active.first() {
                    Some(source) => Plan::Whole(Arc::clone(source)),
                    None => Plan::Recover,
                }
            }
        };

        match plan {
            Plan::Recover => {
                let (request, reply) = ClientRequest::vectored(self.weak_self.clone(), iolist.clone());
                self.dispatch_after_recovery(request).await?;
                let filled = self.await_reply(reply).await?;
                Ok(filled.into_iter().map(|chunk| chunk.data).collect())
            }
            Plan::Whole(source) => {
                let (request, reply) = ClientRequest::vectored(self.weak_self.clone(), iolist);
                source.dispatch(request);
                let filled = self.await_reply(reply).await?;
                Ok(filled.into_iter().map(|chunk| chunk.data).collect())
            }
            Plan::Split(source1, req1, source2, req2) => {
                let pending1 = (!req1.is_empty()).then(|| {
                    let (request, reply) = ClientRequest::vectored(self.weak_self.clone(), req1);
                    source1.dispatch(request);
                    reply
                });
                let pending2 = (!req2.is_empty()).then(|| {
                    let (request, reply) = ClientRequest::vectored(self.weak_self.clone(), req2);
                    source2.dispatch(request);
                    reply
                });
                let mut parts: Vec<FilledChunk> = Vec::new();
                if let Some(reply) = pending1 {
                    parts.extend(self.await_reply(reply).await?);
                }
                if let Some(reply) = pending2 {
                    parts.extend(self.await_reply(reply).await?);
                }
                Ok(reassemble(&iolist, parts))
            }
        }
    }

    /// Underlying file of the first active source, when one exists.
    pub fn active_file(&self) -> Option<Arc<dyn ReplicaFile>> {
        self.tables.lock().active.first().map(|s| s.file())
    }

    /// Snapshot of the active source ids, for diagnostics.
    pub fn active_source_names(&self) -> Vec<String> {
        self.tables
            .lock()
            .active
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    /// Snapshot of the permanently excluded server ids, for diagnostics.
    pub fn disabled_source_names(&self) -> Vec<String> {
        self.tables.lock().disabled_ids.iter().cloned().collect()
    }

    /// Makes any in-flight open attempt a no-op. Called by the owner on
    /// teardown; reads already dispatched still resolve.
    pub fn shutdown(&self) {
        self.opener.shutdown();
    }

    // ---------------------------------------------------------------------
    // Health check
    // ---------------------------------------------------------------------

    fn check_sources(&self, t: &mut SourceTables, now: Instant) {
        trace!(
            since_last_check_ms = now.duration_since(t.last_check).as_millis() as u64,
            "Considering source health check"
        );
        if now.duration_since(t.last_check) > Duration::from_millis(1000) && now >= t.next_check {
            self.check_sources_impl(t, now);
        }
    }

    fn check_sources_impl(&self, t: &mut SourceTables, now: Instant) {
        let mut find_new_source = t.active.len() <= 1;
        if t.active.len() == 2 {
            debug!(
                quality0 = t.active[0].quality(),
                quality1 = t.active[1].quality(),
                "Checking active source quality"
            );
            find_new_source |= Self::compare_sources(t, now, 0, 1);
            find_new_source |= Self::compare_sources(t, now, 1, 0);
        }

        let mut cooldown = SHORT_OPEN_DELAY - Duration::from_secs(1);
        if t.active.len() == 1 {
            // A lone active source: restore duplex from the inactive pool.
            if let Some(best) = Self::best_eligible_inactive(t, now, cooldown) {
                let promoted = t.inactive.remove(best);
                info!(
                    source = promoted.id(),
                    quality = promoted.quality(),
                    "Promoting inactive source"
                );
                t.active.push(promoted);
            }
        } else if t.active.len() == 2 {
            while let Some(best) = Self::best_eligible_inactive(t, now, cooldown) {
                let worst = Self::worst_active_index(t);
                let worst_quality = t.active[worst].quality();
                let best_quality = t.inactive[best].quality();
                if worst_quality <= best_quality.saturating_add(QUALITY_FUDGE) {
                    break;
                }
                info!(
                    demoted = t.active[worst].id(),
                    demoted_quality = worst_quality,
                    promoted = t.inactive[best].id(),
                    promoted_quality = best_quality,
                    "Swapping sources on quality"
                );
                t.active[worst].mark_downgraded(now);
                let promoted = t.inactive.remove(best);
                let demoted = t.active.remove(worst);
                t.inactive.push(demoted);
                t.active.push(promoted);
                // After one swap only well-rested sources may displace an
                // active one.
                cooldown = LONG_OPEN_DELAY - Duration::from_secs(1);
            }
        }

        if !find_new_source && now.duration_since(t.last_check) > LONG_OPEN_DELAY {
            let roll: f64 = rand::rng().random_range(0.0..100.0);
            if roll < OPEN_PROBE_PERCENT {
                debug!(roll, "Probing for a better source");
                find_new_source = true;
            }
        }

        if find_new_source {
            // The outcome is merged into the tables by the opener task;
            // nobody waits on it here.
            let _ = self.opener.open();
            t.last_check = now;
        }

        // Look for a second source aggressively until duplex is restored.
        t.next_check = now
            + if t.active.len() == 2 {
                LONG_OPEN_DELAY
            } else {
                SHORT_OPEN_DELAY
            };
    }

    /// Demotes active source `a` when its quality is past the hard limit,
    /// or past the soft limit while being four times worse than `b`.
    /// Returns whether a genuinely new replica should be sought.
    fn compare_sources(t: &mut SourceTables, now: Instant, a: usize, b: usize) -> bool {
        if t.active.len() < a.max(b) + 1 {
            return false;
        }
        let quality_a = t.active[a].quality();
        let quality_b = t.active[b].quality();
        let poor = quality_a > QUALITY_HARD_LIMIT
            || (quality_a > QUALITY_SOFT_LIMIT && quality_b.saturating_mul(4) < quality_a);
        if !poor {
            return false;
        }
        info!(
            source = t.active[a].id(),
            quality = quality_a,
            peer_quality = quality_b,
            "Demoting active source due to poor quality"
        );
        // A repeat offender means the current pool is not good enough;
        // look for a genuinely new replica.
        let find_new_source = t.active[a].downgraded_before();
        t.active[a].mark_downgraded(now);
        let demoted = t.active.remove(a);
        t.inactive.push(demoted);
        find_new_source
    }

    fn best_eligible_inactive(t: &SourceTables, now: Instant, cooldown: Duration) -> Option<usize> {
        t.inactive
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.last_downgrade()
                    .is_none_or(|at| now.duration_since(at) > cooldown)
            })
            .min_by_key(|(_, s)| s.quality())
            .map(|(index, _)| index)
    }

    fn worst_active_index(t: &SourceTables) -> usize {
        t.active
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.quality())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn pick_single(t: &mut SourceTables) -> Option<Arc<Source>> {
        if t.active.len() == 2 {
            let source = if t.toggle_next {
                t.toggle_next = false;
                Arc::clone(&t.active[0])
            } else {
                t.toggle_next = true;
                Arc::clone(&t.active[1])
            };
            Some(source)
        } else {
            t.active.first().cloned()
        }
    }

    // ---------------------------------------------------------------------
    // Failure recovery
    // ---------------------------------------------------------------------

    /// Handles a failed read dispatch: excludes the failing source and
    /// re-dispatches the request to another replica, waiting for a
    /// recovery open when none is left. A returned error is fatal for the
    /// request.
    pub(crate) async fn request_failure(
        &self,
        request: &Arc<ClientRequest>,
        status: TransportError,
    ) -> Result<(), XrdError> {
        let Some(source) = request.current_source() else {
            return Err(self.open_error("request failed before any source was assigned", Vec::new()));
        };

        {
            let mut t = self.tables.lock();
            // The failing source is excluded before any re-dispatch, but
            // its handle is parked rather than closed: this code may run
            // inside the transport's own response callback, and closing
            // the file from within one deadlocks. The handle stays in
            // `disabled` until the manager is torn down.
            t.disabled_ids.insert(source.id().to_string());
            if !t.disabled.iter().any(|s| Arc::ptr_eq(s, &source)) {
                t.disabled.push(Arc::clone(&source));
            }
            t.active.retain(|s| !Arc::ptr_eq(s, &source));
            // The source may have been demoted while this read was in
            // flight; it must not linger in the inactive pool either.
            t.inactive.retain(|s| !Arc::ptr_eq(s, &source));
        }

        // Callers have a dedicated path for invalid responses; surface
        // those immediately instead of retrying.
        if status.code == ErrorCode::InvalidResponse {
            warn!(source = source.id(), "Invalid response when reading");
            return Err(XrdError::FileRead {
                path: self.name.clone(),
                source_id: source.id().to_string(),
                reason: format!("invalid response from server: {status}"),
                context: self.error_context(),
            });
        }
        warn!(
            source = source.id(),
            error = %status,
            "Request failure when reading; re-dispatching"
        );

        let next = { self.tables.lock().active.first().cloned() };
        let new_source = match next {
            Some(active) => active,
            None => self.wait_for_replacement(Some(source.id())).await?,
        };
        new_source.dispatch(Arc::clone(request));
        Ok(())
    }

    /// Waits for the in-flight (or a fresh) open attempt and returns the
    /// source that should service the next dispatch. The wait is bounded;
    /// past the bound failing hard beats deadlocking.
    async fn wait_for_replacement(&self, old_source: Option<&str>) -> Result<Arc<Source>, XrdError> {
        let mut outcome_rx = self.opener.open();
        {
            self.tables.lock().last_check = Instant::now();
        }
        let bound = self.open_wait_bound();
        let received = match timeout(bound, outcome_rx.recv()).await {
            Err(_) => {
                return Err(self.open_error(
                    format!("timeout after {}s waiting for a file open", bound.as_secs()),
                    vec![
                        format!("old source: {}", old_source.unwrap_or("(none)")),
                        format!("current server: {}", self.opener.current_source_label()),
                    ],
                ))
            }
            Ok(Err(_closed)) => {
                return Err(self.open_error(
                    "open attempt was abandoned before completing",
                    vec![format!("old source: {}", old_source.unwrap_or("(none)"))],
                ))
            }
            Ok(Ok(outcome)) => outcome,
        };
        let source = match received {
            Ok(source) => source,
            Err(error) => {
                return Err(self.open_error(
                    format!("re-open failed: {error}"),
                    vec![format!(
                        "original failed source: {}",
                        old_source.unwrap_or("(none)")
                    )],
                ))
            }
        };
        {
            let t = self.tables.lock();
            if !t.disabled_ids.contains(source.id()) {
                return Ok(t.active.first().cloned().unwrap_or(source));
            }
        }
        // The redirector handed back a data server we asked it to exclude.
        // Nothing better can come from retrying.
        Err(self.open_error(
            "server returned an excluded source",
            vec![
                format!("old source: {}", old_source.unwrap_or("(none)")),
                format!("new source: {}", source.id()),
            ],
        ))
    }

    async fn dispatch_after_recovery(&self, request: Arc<ClientRequest>) -> Result<(), XrdError> {
        // Every source is gone; wait for the recovery open instead of
        // failing the read outright.
        let source = self.wait_for_replacement(None).await?;
        source.dispatch(request);
        Ok(())
    }

    async fn await_reply(&self, reply: oneshot::Receiver<ReadReply>) -> Result<Vec<FilledChunk>, XrdError> {
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(XrdError::FileRead {
                path: self.name.clone(),
                source_id: "(unknown)".to_string(),
                reason: "request was dropped before completing".to_string(),
                context: self.error_context(),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Open plumbing (shared with the opener task)
    // ---------------------------------------------------------------------

    pub(crate) fn opener(&self) -> &OpenHandler {
        &self.opener
    }

    pub(crate) fn open_wait_bound(&self) -> Duration {
        self.timeout + OPEN_GRACE
    }

    /// URL for the next open attempt, carrying the exclusion hint built
    /// from every server this manager has already seen.
    pub(crate) fn open_url(&self) -> String {
        compose_url(&self.name, &self.prepare_opaque_string())
    }

    /// One open attempt against the redirector, wrapping the resulting
    /// connection into a [`Source`].
    pub(crate) async fn open_once(&self, url: &str) -> Result<Arc<Source>, XrdError> {
        match self.transport.open(url, self.flags, self.perms).await {
            Ok(file) => {
                let file: Arc<dyn ReplicaFile> = Arc::from(file);
                send_monitoring_info(self.transport.as_ref(), self.job_id.as_deref(), file.as_ref())
                    .await;
                let id = file
                    .property(PROP_DATA_SERVER)
                    .unwrap_or_else(|| String::from("unknown"));
                Ok(Arc::new(Source::new(id, file, self.epoch)))
            }
            Err(failure) => {
                warn!(error = %failure.error, "Failed to open a new source");
                let mut notes = Vec::new();
                if let Some(server) = &failure.data_server {
                    notes.push(format!("problematic data server: {server}"));
                }
                if let Some(last_url) = &failure.last_url {
                    notes.push(format!("last URL tried: {last_url}"));
                }
                Err(self.open_error(failure.error.to_string(), notes))
            }
        }
    }

    pub(crate) fn open_timeout_error(&self, url: &str, bound: Duration) -> XrdError {
        self.open_error(
            format!(
                "open of a new source did not finish within {}s",
                bound.as_secs()
            ),
            vec![format!("URL tried: {url}")],
        )
    }

    /// Merges the outcome of an open attempt into the source tables.
    ///
    /// The redirector is free to hand back a server this manager already
    /// knows; duplicates and excluded servers are dropped, and any
    /// non-installing outcome pushes the next health check out by the long
    /// delay.
    pub(crate) fn handle_open(&self, outcome: &OpenOutcome) {
        let mut t = self.tables.lock();
        match outcome {
            Ok(source) => {
                if t.disabled_ids.contains(source.id()) {
                    warn!(
                        source = source.id(),
                        "Redirector returned an excluded source; ignoring"
                    );
                    t.defer_next_check();
                    return;
                }
                if t.active
                    .iter()
                    .chain(t.inactive.iter())
                    .any(|s| s.id() == source.id())
                {
                    info!(
                        source = source.id(),
                        "Redirector returned an already-connected source; ignoring"
                    );
                    t.defer_next_check();
                    return;
                }
                info!(source = source.id(), "Successfully opened new source");
                if t.active.len() < 2 {
                    t.active.push(Arc::clone(source));
                } else {
                    t.inactive.push(Arc::clone(source));
                }
            }
            Err(error) => {
                debug!(error = %error, "Open attempt for a new source failed");
                t.defer_next_check();
            }
        }
    }

    fn prepare_opaque_string(&self) -> String {
        let t = self.tables.lock();
        tried_exclusions(
            t.active
                .iter()
                .map(|s| s.id())
                .chain(t.inactive.iter().map(|s| s.id()))
                .chain(t.disabled_ids.iter().map(String::as_str)),
        )
    }

    fn error_context(&self) -> ErrorContext {
        let t = self.tables.lock();
        ErrorContext {
            active: t.active.iter().map(|s| s.id().to_string()).collect(),
            disabled: t.disabled_ids.iter().cloned().collect(),
            notes: Vec::new(),
        }
    }

    fn open_error(&self, reason: impl Into<String>, notes: Vec<String>) -> XrdError {
        let mut context = self.error_context();
        context.notes = notes;
        XrdError::FileOpen {
            path: self.name.clone(),
            flags: self.flags,
            perms: self.perms,
            reason: reason.into(),
            context,
        }
    }
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.tables.lock();
        f.debug_struct("RequestManager")
            .field("name", &self.name)
            .field("active", &t.active.len())
            .field("inactive", &t.inactive.len())
            .field("disabled", &t.disabled_ids.len())
            .finish_non_exhaustive()
    }
}

/// Builds the `tried=h1,h2,…` exclusion hint from source ids, keeping only
/// the host portion of each `host:port` id. Empty when there is no history.
fn tried_exclusions<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    let hosts: Vec<&str> = ids.map(host_of).collect();
    if hosts.is_empty() {
        String::new()
    } else {
        format!("tried={}", hosts.join(","))
    }
}

fn host_of(id: &str) -> &str {
    id.split_once(':').map_or(id, |(host, _)| host)
}

/// Appends an opaque query fragment to a URL, respecting any query it
/// already carries.
fn compose_url(name: &str, opaque: &str) -> String {
    if opaque.is_empty() {
        name.to_string()
    } else if name.contains('?') {
        format!("{name}&{opaque}")
    } else {
        format!("{name}?{opaque}")
    }
}

/// Reports the job identity to the data server behind a fresh connection.
///
/// Skipped for dCache data servers: some versions close the connection
/// when they receive the monitoring message.
async fn send_monitoring_info(transport: &dyn Transport, job_id: Option<&str>, file: &dyn ReplicaFile) {
    let Some(job_id) = job_id else { return };
    let Some(last_url) = file.property(PROP_LAST_URL) else {
        return;
    };
    if is_dcache_url(&last_url) {
        return;
    }
    match transport.send_info(&last_url, job_id, MONITORING_TIMEOUT).await {
        Ok(()) => info!(job_id, "Set monitoring ID"),
        Err(error) => debug!(error = %error, "Monitoring message was not delivered"),
    }
}

fn is_dcache_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => parsed.query_pairs().any(|(key, _)| key == "org.dcache.uuid"),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{MockFile, MockTransport, ScriptedOpen, SharedFile};

    const NAME: &str = "root://redirector.example//store/data/file.root";

    fn success(server: &str) -> ScriptedOpen {
        ScriptedOpen::Success(MockFile::new(server, &format!("root://{server}//store/data/file.root")))
    }

    async fn manager_with(transport: Arc<MockTransport>) -> Arc<RequestManager> {
        RequestManager::open(
            transport,
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig::default(),
        )
        .await
        .expect("initial open succeeds")
    }

    fn extra_source(manager: &RequestManager, id: &str) -> Arc<Source> {
        let file = MockFile::new(id, &format!("root://{id}//store/data/file.root"));
        Arc::new(Source::new(
            id.to_string(),
            Arc::new(SharedFile(file)),
            manager.epoch,
        ))
    }

    /// Lets spawned opener tasks run to completion on the current-thread
    /// test runtime.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn url_composition_appends_with_the_right_separator() {
        assert_eq!(compose_url("root://h//f", ""), "root://h//f");
        assert_eq!(compose_url("root://h//f", "tried=a"), "root://h//f?tried=a");
        assert_eq!(
            compose_url("root://h//f?svcClass=t0", "tried=a"),
            "root://h//f?svcClass=t0&tried=a"
        );
    }

    #[test]
    fn exclusion_hint_keeps_the_host_portion() {
        let ids = ["a.example:1094", "b.example:1095", "plainhost"];
        assert_eq!(
            tried_exclusions(ids.iter().copied()),
            "tried=a.example,b.example,plainhost"
        );
        assert_eq!(tried_exclusions(std::iter::empty()), "");
    }

    #[test]
    fn dcache_urls_are_detected_by_query_parameter() {
        assert!(is_dcache_url(
            "root://d.example:1094//store/f?org.dcache.uuid=5e0a-77&other=1"
        ));
        assert!(!is_dcache_url("root://d.example:1094//store/f?tried=a"));
        assert!(!is_dcache_url("not a url"));
    }

    #[tokio::test]
    async fn opaque_string_covers_all_three_collections() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;

        let beta = extra_source(&manager, "beta.example:1094");
        {
            let mut t = manager.tables.lock();
            t.inactive.push(beta);
            t.disabled_ids.insert("gamma.example:1094".to_string());
        }
        assert_eq!(
            manager.prepare_opaque_string(),
            "tried=alpha.example,beta.example,gamma.example"
        );
    }

    #[tokio::test]
    async fn monitoring_message_carries_the_job_id() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let _manager = RequestManager::open(
            transport.clone(),
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig {
                job_id: Some("crab-job-1234".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("open succeeds");

        let infos = transport.infos.lock().clone();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].1, "crab-job-1234");
    }

    #[tokio::test]
    async fn monitoring_is_suppressed_for_dcache_servers() {
        let file = MockFile::new(
            "dcache.example:1094",
            "root://dcache.example:1094//store/data/file.root?org.dcache.uuid=5e0a",
        );
        let transport = MockTransport::new(vec![ScriptedOpen::Success(file)]);
        let _manager = RequestManager::open(
            transport.clone(),
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig {
                job_id: Some("crab-job-1234".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("open succeeds");

        assert!(transport.infos.lock().is_empty());
    }

    #[tokio::test]
    async fn monitoring_is_skipped_without_a_job_id() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let _manager = manager_with(transport.clone()).await;
        assert!(transport.infos.lock().is_empty());
    }

    #[tokio::test]
    async fn constructor_excludes_failed_servers_on_retry() {
        let transport = MockTransport::new(vec![
            ScriptedOpen::Failure {
                code: ErrorCode::ServerError,
                data_server: Some("alpha.example:1094".to_string()),
                last_url: Some("root://alpha.example:1094//store/data/file.root".to_string()),
            },
            success("beta.example:1094"),
        ]);
        let manager = manager_with(transport.clone()).await;

        let urls = transport.open_urls.lock().clone();
        assert_eq!(urls.len(), 2);
        assert!(!urls[0].contains("tried="));
        assert!(urls[1].contains("tried=alpha.example"));
        assert_eq!(manager.active_source_names(), vec!["beta.example:1094"]);
        assert_eq!(manager.disabled_source_names(), vec!["alpha.example:1094"]);
    }

    #[tokio::test]
    async fn constructor_fails_when_redirector_does_not_redirect() {
        let transport = MockTransport::new(vec![ScriptedOpen::Failure {
            code: ErrorCode::ServerError,
            data_server: Some("redirector.example:1094".to_string()),
            // Same URL the client asked for: no redirection happened.
            last_url: Some(NAME.to_string()),
        }]);
        let result = RequestManager::open(
            transport.clone(),
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(XrdError::FileOpen { .. })));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn constructor_fails_when_an_excluded_server_repeats() {
        let failure = |last: &str| ScriptedOpen::Failure {
            code: ErrorCode::ServerError,
            data_server: Some("alpha.example:1094".to_string()),
            last_url: Some(last.to_string()),
        };
        let transport = MockTransport::new(vec![
            failure("root://alpha.example:1094//store/data/file.root"),
            failure("root://alpha.example:1094//store/data/file.root?x=1"),
        ]);
        let result = RequestManager::open(
            transport.clone(),
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig::default(),
        )
        .await;

        let err = result.expect_err("no additional server available");
        assert!(err.to_string().contains("no additional data servers"));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn constructor_gives_up_after_the_retry_budget() {
        let failures: Vec<ScriptedOpen> = (0..OPEN_RETRIES)
            .map(|i| ScriptedOpen::Failure {
                code: ErrorCode::ServerError,
                data_server: Some(format!("server{i}.example:1094")),
                last_url: Some(format!("root://server{i}.example:1094//store/data/file.root")),
            })
            .collect();
        let transport = MockTransport::new(failures);
        let result = RequestManager::open(
            transport.clone(),
            NAME,
            OpenFlags::READ,
            Permissions::default(),
            ManagerConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(XrdError::FileOpen { .. })));
        assert_eq!(transport.open_count(), OPEN_RETRIES);
    }

    #[tokio::test]
    async fn single_reads_alternate_between_two_active_sources() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let beta = extra_source(&manager, "beta.example:1094");
        manager.tables.lock().active.push(beta);

        let mut picked = Vec::new();
        {
            let mut t = manager.tables.lock();
            for _ in 0..4 {
                let source = RequestManager::pick_single(&mut t).expect("two active sources");
                picked.push(source.id().to_string());
            }
        }
        assert_eq!(
            picked,
            vec![
                "beta.example:1094",
                "alpha.example:1094",
                "beta.example:1094",
                "alpha.example:1094"
            ]
        );
    }

    #[tokio::test]
    async fn rested_inactive_source_is_promoted_to_restore_duplex() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(100);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(10);
        beta.mark_downgraded(now - Duration::from_secs(10));
        {
            let mut t = manager.tables.lock();
            t.active[0].force_quality(50);
            t.inactive.push(beta);
            manager.check_sources_impl(&mut t, now);
            assert_eq!(
                t.active.iter().map(|s| s.id().to_string()).collect::<Vec<_>>(),
                vec!["alpha.example:1094", "beta.example:1094"]
            );
            assert!(t.inactive.is_empty());
        }
        settle().await;
    }

    #[tokio::test]
    async fn cooling_down_source_is_not_promoted() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(100);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.mark_downgraded(now - Duration::from_secs(2));
        {
            let mut t = manager.tables.lock();
            t.inactive.push(beta);
            manager.check_sources_impl(&mut t, now);
            assert_eq!(t.active.len(), 1);
            assert_eq!(t.inactive.len(), 1);
        }
        settle().await;
    }

    #[tokio::test]
    async fn relatively_poor_source_is_demoted() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(100);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(60);
        {
            let mut t = manager.tables.lock();
            t.active[0].force_quality(300);
            t.active.push(beta);
            manager.check_sources_impl(&mut t, now);

            assert_eq!(t.active.len(), 1);
            assert_eq!(t.active[0].id(), "beta.example:1094");
            assert_eq!(t.inactive.len(), 1);
            assert_eq!(t.inactive[0].id(), "alpha.example:1094");
            assert!(t.inactive[0].downgraded_before());
            // One active source left: the next check comes quickly.
            assert_eq!(t.next_check, now + SHORT_OPEN_DELAY);
        }
        settle().await;
    }

    #[tokio::test]
    async fn absolutely_poor_source_is_demoted_even_against_a_bad_peer() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(100);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(4000);
        {
            let mut t = manager.tables.lock();
            t.active[0].force_quality(6000);
            t.active.push(beta);
            manager.check_sources_impl(&mut t, now);

            assert_eq!(t.active.len(), 1);
            assert_eq!(t.active[0].id(), "beta.example:1094");
        }
        settle().await;
    }

    #[tokio::test]
    async fn quality_swap_respects_the_fudge_margin() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(1000);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(100);
        let gamma = extra_source(&manager, "gamma.example:1094");
        gamma.force_quality(100);
        gamma.mark_downgraded(now - Duration::from_secs(10));
        {
            let mut t = manager.tables.lock();
            // 250 is above gamma's 100 by more than the fudge of 100, but
            // not bad enough for a pairwise demotion.
            t.active[0].force_quality(250);
            t.active.push(beta);
            t.inactive.push(gamma);
            manager.check_sources_impl(&mut t, now);

            let active: Vec<_> = t.active.iter().map(|s| s.id().to_string()).collect();
            assert!(active.contains(&"beta.example:1094".to_string()));
            assert!(active.contains(&"gamma.example:1094".to_string()));
            assert_eq!(t.inactive.len(), 1);
            assert_eq!(t.inactive[0].id(), "alpha.example:1094");
            assert!(t.inactive[0].downgraded_before());
        }
        settle().await;
    }

    #[tokio::test]
    async fn quality_swap_within_the_fudge_margin_does_nothing() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let now = Instant::now() + Duration::from_secs(1000);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(100);
        let gamma = extra_source(&manager, "gamma.example:1094");
        gamma.force_quality(160);
        {
            let mut t = manager.tables.lock();
            t.active[0].force_quality(250);
            t.active.push(beta);
            t.inactive.push(gamma);
            manager.check_sources_impl(&mut t, now);

            assert_eq!(t.active[0].id(), "alpha.example:1094");
            assert_eq!(t.inactive[0].id(), "gamma.example:1094");
        }
        settle().await;
    }

    #[tokio::test]
    async fn repeat_offender_demotion_requests_a_new_source() {
        let transport = MockTransport::new(vec![
            success("alpha.example:1094"),
            success("gamma.example:1094"),
        ]);
        let manager = manager_with(transport.clone()).await;
        let now = Instant::now() + Duration::from_secs(100);

        let beta = extra_source(&manager, "beta.example:1094");
        beta.force_quality(60);
        {
            let mut t = manager.tables.lock();
            t.active[0].force_quality(300);
            // A source that was downgraded once already.
            t.active[0].mark_downgraded(now - Duration::from_secs(500));
            t.active.push(beta);
            manager.check_sources_impl(&mut t, now);
            assert_eq!(t.last_check, now);
        }
        settle().await;
        // Constructor open plus the requested replacement.
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.active_source_names().len(), 2);
    }

    #[tokio::test]
    async fn health_check_runs_once_per_instant() {
        let transport = MockTransport::new(vec![
            success("alpha.example:1094"),
            success("beta.example:1094"),
        ]);
        let manager = manager_with(transport.clone()).await;
        let now = Instant::now() + Duration::from_secs(100);

        {
            let mut t = manager.tables.lock();
            t.last_check = now - Duration::from_secs(10);
            t.next_check = now - Duration::from_secs(1);
            manager.check_sources(&mut t, now);
            let next_after_first = t.next_check;
            assert!(next_after_first > now);

            // Same instant again: gated out, no state transition.
            manager.check_sources(&mut t, now);
            assert_eq!(t.next_check, next_after_first);
            assert_eq!(t.last_check, now);
        }
        settle().await;
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_open_requests_share_one_attempt() {
        let transport = MockTransport::new(vec![
            success("alpha.example:1094"),
            success("beta.example:1094"),
        ]);
        let manager = manager_with(transport.clone()).await;

        let mut rx1 = manager.opener().open();
        let mut rx2 = manager.opener().open();
        let first = rx1.recv().await.expect("outcome broadcast");
        let second = rx2.recv().await.expect("outcome broadcast");

        assert_eq!(first.expect("open ok").id(), "beta.example:1094");
        assert_eq!(second.expect("open ok").id(), "beta.example:1094");
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn handle_open_rejects_duplicate_sources() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        let duplicate = extra_source(&manager, "alpha.example:1094");

        let before = manager.tables.lock().next_check;
        manager.handle_open(&Ok(duplicate));
        let t = manager.tables.lock();
        assert_eq!(t.active.len(), 1);
        assert!(t.inactive.is_empty());
        assert_eq!(t.next_check, before + (LONG_OPEN_DELAY - SHORT_OPEN_DELAY));
    }

    #[tokio::test]
    async fn handle_open_rejects_excluded_sources() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;
        manager
            .tables
            .lock()
            .disabled_ids
            .insert("evil.example:1094".to_string());

        let excluded = extra_source(&manager, "evil.example:1094");
        manager.handle_open(&Ok(excluded));
        let t = manager.tables.lock();
        assert_eq!(t.active.len(), 1);
        assert!(t.inactive.is_empty());
    }

    #[tokio::test]
    async fn handle_open_fills_active_then_inactive() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;

        manager.handle_open(&Ok(extra_source(&manager, "beta.example:1094")));
        manager.handle_open(&Ok(extra_source(&manager, "gamma.example:1094")));

        let t = manager.tables.lock();
        assert_eq!(t.active.len(), 2);
        assert_eq!(t.inactive.len(), 1);
        assert_eq!(t.inactive[0].id(), "gamma.example:1094");
    }

    #[tokio::test]
    async fn failed_open_defers_the_next_check() {
        let transport = MockTransport::new(vec![success("alpha.example:1094")]);
        let manager = manager_with(transport).await;

        let before = manager.tables.lock().next_check;
        let error = Arc::new(XrdError::FileOpen {
            path: NAME.to_string(),
            flags: OpenFlags::READ,
            perms: Permissions::default(),
            reason: "scripted".to_string(),
            context: Default::default(),
        });
        manager.handle_open(&Err(error));
        assert_eq!(
            manager.tables.lock().next_check,
            before + (LONG_OPEN_DELAY - SHORT_OPEN_DELAY)
        );
    }
}

