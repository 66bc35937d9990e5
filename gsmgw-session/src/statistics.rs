//! AT session statistics collection

use std::sync::atomic::{AtomicU64, Ordering};

/// AT session statistics
///
/// Updated by the framer and the correlator while the session runs;
/// [`SessionStatistics::snapshot`] returns a consistent-enough copy for
/// logging.
#[derive(Debug, Default)]
pub struct SessionStatistics {
    commands_issued: AtomicU64,
    command_timeouts: AtomicU64,
    responses_framed: AtomicU64,
    probes_sent: AtomicU64,
    notifications: AtomicU64,
}

/// Plain copy of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub commands_issued: u64,
    pub command_timeouts: u64,
    pub responses_framed: u64,
    pub probes_sent: u64,
    pub notifications: u64,
}

impl SessionStatistics {
    /// Create new statistics with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command written by the correlator
    pub fn increment_commands_issued(&self) {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a command that got no framed response in time
    pub fn increment_command_timeouts(&self) {
        self.command_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response handed to the correlator
    pub fn increment_responses_framed(&self) {
        self.responses_framed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a liveness probe written by the framer
    pub fn increment_probes_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a line routed to the notification queue
    pub fn increment_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            commands_issued: self.commands_issued.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            responses_framed: self.responses_framed.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsSnapshot {
    /// Average number of liveness probes per framed response
    ///
    /// Returns 0.0 if no response has been framed yet.
    pub fn probes_per_response(&self) -> f64 {
        if self.responses_framed == 0 {
            0.0
        } else {
            self.probes_sent as f64 / self.responses_framed as f64
        }
    }
}
