use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{BACKOFF_CAP_SECS, HIBERNATION_INTERVAL_SECS};

/// Substrings marking a failure as network-related, matched
/// case-insensitively against the error message. Kept deliberately narrow:
/// anything not matching gets exponential backoff instead of hibernation.
pub const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "handshake",
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "reset by peer",
    "unreachable",
    "dns",
    "could not resolve",
    "name resolution",
    "socket",
    "broken pipe",
    "certificate verify",
];

pub fn is_network_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    NETWORK_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Other,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureClass::Network => write!(f, "network"),
            FailureClass::Other => write!(f, "non-network"),
        }
    }
}

/// What the scheduler should do after a failed tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailurePlan {
    pub class: FailureClass,
    pub interval: Duration,
    /// True exactly on the network failure that first entered hibernation;
    /// the caller fires its (deduplicated) alert then and never again until
    /// hibernation is exited.
    pub entered_hibernation: bool,
}

/// Tracks consecutive failures and hibernation across ticks.
///
/// Network failures put the daemon into hibernation with a fixed retry
/// interval: the outage will not clear faster because we poll harder, so
/// there is no exponential growth. Non-network failures back off
/// exponentially up to the same cap. Only a successful tick exits
/// hibernation and resets the counter.
#[derive(Debug, Default)]
pub struct HibernationController {
    hibernating: bool,
    hibernation_start: Option<DateTime<Utc>>,
    consecutive_failures: u32,
}

impl HibernationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_hibernating(&self) -> bool {
        self.hibernating
    }

    pub fn hibernation_start(&self) -> Option<DateTime<Utc>> {
        self.hibernation_start
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Classify a tick failure and choose the retry interval.
    /// Re-entering hibernation while already hibernating is a no-op apart
    /// from the interval, so alerts cannot re-fire.
    pub fn record_failure(&mut self, message: &str) -> FailurePlan {
        if is_network_error(message) {
            let entered = !self.hibernating;
            if entered {
                self.hibernating = true;
                self.hibernation_start = Some(Utc::now());
            }
            FailurePlan {
                class: FailureClass::Network,
                interval: Duration::from_secs(HIBERNATION_INTERVAL_SECS),
                entered_hibernation: entered,
            }
        } else {
            self.consecutive_failures += 1;
            FailurePlan {
                class: FailureClass::Other,
                interval: Duration::from_secs(backoff_secs(self.consecutive_failures)),
                entered_hibernation: false,
            }
        }
    }

    /// Reset the failure counter; if hibernating, exit and return how long
    /// the hibernation lasted (the caller logs it and resolves the alert).
    pub fn record_success(&mut self) -> Option<chrono::Duration> {
        self.consecutive_failures = 0;
        if !self.hibernating {
            return None;
        }
        self.hibernating = false;
        self.hibernation_start
            .take()
            .map(|start| Utc::now() - start)
    }
}

/// `min(2^n, cap)` seconds for the nth consecutive failure.
fn backoff_secs(consecutive_failures: u32) -> u64 {
    // 2^9 already exceeds the cap; short-circuit before the shift can
    // overflow for large counters.
    if consecutive_failures >= 9 {
        return BACKOFF_CAP_SECS;
    }
    (1u64 << consecutive_failures).min(BACKOFF_CAP_SECS)
}
