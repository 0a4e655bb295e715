//! Manager configuration and tuning constants.
//!
//! The health-check timers and quality thresholds mirror the values the
//! manager was tuned with in production. The `aggressive-open-probe`
//! feature swaps in timers short enough to exercise source churn in
//! seconds rather than minutes.

use std::time::Duration;

/// Maximum size of any single fragment handed to the transport, in bytes.
pub const MAX_CHUNK: u64 = 512 * 1024;

/// Fragments beyond this offset are rejected by request validation.
pub(crate) const MAX_OFFSET: u64 = 1 << 41;

/// Delay before the next health check while fewer than two sources are
/// active. The manager looks for a second replica aggressively until
/// duplex reads are restored.
pub(crate) const SHORT_OPEN_DELAY: Duration = Duration::from_secs(5);

/// Delay between health checks once two sources are active.
#[cfg(not(feature = "aggressive-open-probe"))]
pub(crate) const LONG_OPEN_DELAY: Duration = Duration::from_secs(2 * 60);
#[cfg(feature = "aggressive-open-probe")]
pub(crate) const LONG_OPEN_DELAY: Duration = Duration::from_secs(20);

/// Chance, in percent, that a quiet health check speculatively opens a new
/// replica anyway.
#[cfg(not(feature = "aggressive-open-probe"))]
pub(crate) const OPEN_PROBE_PERCENT: f64 = 10.0;
#[cfg(feature = "aggressive-open-probe")]
pub(crate) const OPEN_PROBE_PERCENT: f64 = 100.0;

/// Minimal quality difference required to swap an active source for an
/// inactive one.
#[cfg(not(feature = "aggressive-open-probe"))]
pub(crate) const QUALITY_FUDGE: u32 = 100;
#[cfg(feature = "aggressive-open-probe")]
pub(crate) const QUALITY_FUDGE: u32 = 0;

/// Quality above which an active source is demoted no matter how its peer
/// is doing.
pub(crate) const QUALITY_HARD_LIMIT: u32 = 5130;

/// Quality above which an active source is demoted when its peer is more
/// than four times better.
pub(crate) const QUALITY_SOFT_LIMIT: u32 = 260;

/// How many data servers the initial open will try before giving up.
pub(crate) const OPEN_RETRIES: usize = 5;

/// Extra slack on top of the stream timeout when waiting for an open to
/// finish. Past that point failing hard beats deadlocking.
pub(crate) const OPEN_GRACE: Duration = Duration::from_secs(10);

/// Stream timeout applied when neither the configuration nor the transport
/// environment provides one.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Bound on the one-shot monitoring message sent after a successful open.
pub(crate) const MONITORING_TIMEOUT: Duration = Duration::from_secs(30);

/// Quality assigned to a source that has not completed any operation yet.
pub(crate) const INITIAL_QUALITY: u32 = 100;

/// Construction-time options for [`RequestManager`](crate::manager::RequestManager).
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Job identifier reported to data servers after a successful open.
    /// Monitoring is skipped entirely when unset.
    pub job_id: Option<String>,
    /// Stream timeout override. When unset the transport's
    /// `StreamErrorWindow` applies, falling back to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

impl ManagerConfig {
    /// Resolves the effective stream timeout: explicit configuration wins,
    /// then the transport environment, then the built-in default.
    pub(crate) fn resolve_timeout(&self, transport_window: Option<u64>) -> Duration {
        self.timeout
            .or(transport_window.map(Duration::from_secs))
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}
