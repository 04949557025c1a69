//! Storage-fault recovery.
//!
//! The logger never stops accepting input. When a mount, open, write or sync
//! fails, the [`RecoveryMachine`] takes over the volume and the log file and
//! drives the remount sequence:
//!
//! ```text
//! Healthy --error--> Fault --attempt--> Recovering --reopened--> Healthy
//!                      ^                     |
//!                      +------failed---------+
//! ```
//!
//! An attempt closes the file (result ignored), waits the settle delay,
//! force-unmounts, waits again, then mounts and reopens the log at
//! end-of-file. There is no terminal state.
//!
//! Attempts are driven by arriving chunks, one per chunk at most, so the byte
//! source keeps being drained while storage is down. After a failed attempt
//! the next one is held off by an exponential backoff; chunks that arrive in
//! the meantime are discarded without touching storage.

use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::error::StorageError;
use crate::storage::{AppendFile, StorageDriver, Volume};

/// Health of the storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Volume mounted and log file open.
    Healthy,
    /// A storage operation failed; chunks are discarded until recovery.
    Fault,
    /// A remount sequence is in progress.
    Recovering,
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryState::Healthy => write!(f, "HEALTHY"),
            RecoveryState::Fault => write!(f, "FAULT"),
            RecoveryState::Recovering => write!(f, "RECOVERING"),
        }
    }
}

/// Defines how recovery attempts are paced.
///
/// # Example
///
/// ```rust
/// use flight_logger::recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: Some(5),
///     cooldown: Duration::from_secs(30),
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.backoff(1), policy.initial_backoff);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after closing the file and again after unmounting, giving the
    /// device time to settle.
    pub settle_delay: Duration,

    /// Consecutive failed attempts before pausing for `cooldown`.
    ///
    /// `None` retries on the backoff schedule forever. Either way the machine
    /// never gives up.
    pub max_attempts: Option<u32>,

    /// Hold-off after the first failed attempt.
    pub initial_backoff: Duration,

    /// Upper bound on the hold-off between attempts.
    pub max_backoff: Duration,

    /// Growth factor applied per consecutive failure.
    pub multiplier: u32,

    /// Hold-off after `max_attempts` consecutive failures. The backoff
    /// schedule restarts afterwards.
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            max_attempts: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Hold-off after the `failures`-th consecutive failed attempt.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Counters surfaced for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Transitions into `Fault` from `Healthy`.
    pub faults: u64,
    /// Remount sequences started.
    pub attempts: u64,
    /// Remount sequences that left the machine in `Fault`.
    pub failed_attempts: u64,
    /// Remount sequences that restored `Healthy`.
    pub recoveries: u64,
    /// Failed attempts since the last recovery.
    pub consecutive_failures: u32,
    /// Times the attempt budget ran out and the cooldown applied.
    pub cooldowns: u64,
    /// Most recent storage error, fault or failed attempt.
    pub last_error: Option<StorageError>,
}

/// Supervises storage health and drives remount sequences.
#[derive(Debug)]
pub struct RecoveryMachine {
    policy: RetryPolicy,
    state: RecoveryState,
    stats: RecoveryStats,
    burst_failures: u32,
    hold_until: Option<Instant>,
}

impl RecoveryMachine {
    /// A healthy machine pacing attempts with `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RecoveryState::Healthy,
            stats: RecoveryStats::default(),
            burst_failures: 0,
            hold_until: None,
        }
    }

    /// Current health.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// `true` only in `Healthy`.
    pub fn is_healthy(&self) -> bool {
        self.state == RecoveryState::Healthy
    }

    /// Counters and last error.
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// Pacing parameters in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Instant before which no attempt will be made, if held off.
    pub fn hold_until(&self) -> Option<Instant> {
        self.hold_until
    }

    /// Record a storage failure.
    ///
    /// Moves `Healthy` to `Fault`; in any other state only the last error is
    /// updated.
    pub fn fault(&mut self, error: StorageError) {
        if self.state == RecoveryState::Healthy {
            self.stats.faults += 1;
            tracing::warn!(
                op = %error.op,
                kind = %error.kind,
                %error,
                "Storage fault, discarding input until recovered"
            );
        }
        self.state = RecoveryState::Fault;
        self.stats.last_error = Some(error);
    }

    /// Whether an attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.hold_until.map_or(true, |until| now >= until)
    }

    /// Make one recovery attempt if the machine is faulted and not held off.
    ///
    /// `file` is closed (if still open) and replaced with a freshly opened
    /// handle on success. Returns the resulting state.
    pub async fn recover<D: StorageDriver>(
        &mut self,
        volume: &mut Volume<D>,
        file: &mut Option<AppendFile<D::Handle>>,
        path: &str,
    ) -> RecoveryState {
        if self.state == RecoveryState::Healthy {
            return self.state;
        }
        if !self.ready(Instant::now()) {
            return self.state;
        }

        self.state = RecoveryState::Recovering;
        self.stats.attempts += 1;
        tracing::info!(
            state = %self.state,
            attempt = self.stats.attempts,
            consecutive_failures = self.stats.consecutive_failures,
            "Attempting storage recovery"
        );

        if let Some(open) = file.take() {
            if let Err(err) = open.close(volume) {
                tracing::debug!(%err, "Close before remount failed, ignoring");
            }
        }
        sleep(self.policy.settle_delay).await;
        volume.unmount();
        sleep(self.policy.settle_delay).await;

        let reopened = volume
            .mount()
            .map_err(|e| e.0)
            .and_then(|()| AppendFile::open_append(volume, path).map_err(|e| e.0));

        match reopened {
            Ok(reopened) => {
                tracing::info!(
                    offset = reopened.offset(),
                    after_failures = self.stats.consecutive_failures,
                    "Storage recovered"
                );
                *file = Some(reopened);
                self.state = RecoveryState::Healthy;
                self.stats.recoveries += 1;
                self.stats.consecutive_failures = 0;
                self.burst_failures = 0;
                self.hold_until = None;
            }
            Err(err) => {
                self.state = RecoveryState::Fault;
                self.stats.failed_attempts += 1;
                self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
                self.burst_failures += 1;

                let exhausted = self
                    .policy
                    .max_attempts
                    .is_some_and(|max| self.burst_failures >= max);
                let hold = if exhausted {
                    self.stats.cooldowns += 1;
                    self.burst_failures = 0;
                    self.policy.cooldown
                } else {
                    self.policy.backoff(self.burst_failures)
                };
                self.hold_until = Some(Instant::now() + hold);

                tracing::warn!(
                    op = %err.op,
                    kind = %err.kind,
                    %err,
                    consecutive_failures = self.stats.consecutive_failures,
                    retry_in_ms = hold.as_millis() as u64,
                    exhausted,
                    "Storage recovery failed"
                );
                self.stats.last_error = Some(err);
            }
        }

        self.state
    }
}
