//! Completion-notification policy for one ring.
//!
//! Two triggers feed a single "arm notification" event: every
//! `request_threshold` submissions arm immediately; otherwise the first
//! unannounced submission starts a timer and its expiry arms.

use std::time::{Duration, Instant};

use crate::config::NotifyConfig;

#[derive(Debug)]
pub(crate) struct NotifyPolicy {
    threshold: u64,
    delay: Duration,
    deadline: Option<Instant>,
}

impl NotifyPolicy {
    pub(crate) fn new(config: &NotifyConfig) -> Self {
        Self {
            threshold: config.request_threshold.max(1),
            delay: config.delay,
            deadline: None,
        }
    }

    /// Record a submission; `submitted` is the ring's count including it.
    /// Returns true when notification must be armed now.
    pub(crate) fn on_submit(&mut self, submitted: u64, now: Instant) -> bool {
        if submitted % self.threshold == 0 {
            self.deadline = None;
            return true;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.delay);
        }
        false
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true, clearing the timer, once the deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
