use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Floor for both timeouts once a test tolerates a crashing remote, long
/// enough for a crash dump to be written.
pub const CRASH_TOLERANT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Reported once when the deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutExpiry {
    /// Reason given by the last reset before expiry
    pub last_reason: String,
    /// Whether the connection deadline (rather than the main one) expired
    pub connection: bool,
}

/// Tracks the last sign of life and converts prolonged silence into expiry.
///
/// Deadlines only move forward: a reset never shortens a deadline.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    default_timeout: Duration,
    connection_timeout: Duration,
    deadline: Instant,
    connection_deadline: Option<Instant>,
    /// Resets that extend the connection wait at least the crash-dump floor
    crash_tolerant: bool,
    last_reason: String,
    expired: bool,
}

impl TimeoutSupervisor {
    pub fn new(now: Instant, default_timeout: Duration, connection_timeout: Duration) -> Self {
        Self {
            default_timeout,
            connection_timeout,
            deadline: now + default_timeout,
            connection_deadline: None,
            crash_tolerant: false,
            last_reason: "created".to_string(),
            expired: false,
        }
    }

    /// Pushes the deadline to at least `now + max(default, min_duration)`.
    ///
    /// With `extend_connection`, the connection deadline is pushed as well,
    /// by the connection timeout. For crash-tolerant tests such a reset
    /// holds both deadlines open for at least
    /// [`CRASH_TOLERANT_CONNECTION_TIMEOUT`].
    pub fn reset_timeout(
        &mut self,
        now: Instant,
        reason: &str,
        extend_connection: bool,
        min_duration: Duration,
    ) {
        let min_duration = if extend_connection && self.crash_tolerant {
            min_duration.max(CRASH_TOLERANT_CONNECTION_TIMEOUT)
        } else {
            min_duration
        };

        let requested = now + self.default_timeout.max(min_duration);
        if requested > self.deadline {
            self.deadline = requested;
        }

        if extend_connection {
            let requested = now + self.connection_timeout.max(min_duration);
            self.connection_deadline = Some(match self.connection_deadline {
                Some(current) if current > requested => current,
                _ => requested,
            });
        }

        debug!(reason, extend_connection, "timeout reset");
        self.last_reason = reason.to_string();
    }

    /// Opens the crash-tolerant window: the connection timeout and every
    /// connection-extending reset get the crash-dump floor.
    pub fn tolerate_remote_crash(&mut self) {
        self.crash_tolerant = true;
        if self.connection_timeout < CRASH_TOLERANT_CONNECTION_TIMEOUT {
            self.connection_timeout = CRASH_TOLERANT_CONNECTION_TIMEOUT;
        }
    }

    /// Drops the connection deadline once the connection is established.
    pub fn clear_connection_deadline(&mut self) {
        self.connection_deadline = None;
    }

    /// Returns the expiry exactly once, the first time a deadline has passed.
    pub fn check(&mut self, now: Instant) -> Option<TimeoutExpiry> {
        if self.expired {
            return None;
        }

        let connection = matches!(self.connection_deadline, Some(deadline) if now >= deadline);
        if now >= self.deadline || connection {
            self.expired = true;
            warn!(reason = %self.last_reason, connection, "timeout expired");
            return Some(TimeoutExpiry { last_reason: self.last_reason.clone(), connection });
        }

        None
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn connection_deadline(&self) -> Option<Instant> {
        self.connection_deadline
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn has_expired(&self) -> bool {
        self.expired
    }

    pub fn last_reason(&self) -> &str {
        &self.last_reason
    }
}
