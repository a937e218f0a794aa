//! Continuous-presence measurement and the debounced triggers built on it.

use std::time::{Duration, Instant};

/// Presence needed before a live-preview pipeline notifies.
pub const PREVIEW_NOTIFY_AFTER: Duration = Duration::from_secs(5);
/// Presence needed before a scheduled pipeline notifies.
pub const SCHEDULED_NOTIFY_AFTER: Duration = Duration::from_secs(7);
/// Presence needed before a recording starts.
pub const RECORD_AFTER: Duration = Duration::from_secs(7);
/// Absence needed before a live recording stops.
pub const STOP_RECORDING_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct PresencePolicy {
    pub notify_after: Duration,
    /// `None` disables the recording trigger entirely.
    pub record_after: Option<Duration>,
    pub stop_recording_after: Duration,
    pub notify: bool,
}

impl PresencePolicy {
    pub fn preview() -> Self {
        Self {
            notify_after: PREVIEW_NOTIFY_AFTER,
            record_after: None,
            stop_recording_after: STOP_RECORDING_AFTER,
            notify: true,
        }
    }

    pub fn scheduled(notify: bool, save_recordings: bool) -> Self {
        Self {
            notify_after: SCHEDULED_NOTIFY_AFTER,
            record_after: save_recordings.then_some(RECORD_AFTER),
            stop_recording_after: STOP_RECORDING_AFTER,
            notify,
        }
    }
}

/// What one processed frame asks the pipeline to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceDecision {
    pub people_count: usize,
    pub notify: bool,
    pub start_recording: bool,
    pub stop_recording: bool,
}

/// Per-feed presence state.
#[derive(Debug)]
pub struct PresenceTracker {
    policy: PresencePolicy,
    continuous_presence_started_at: Option<Instant>,
    absent_since: Option<Instant>,
    last_people_count: usize,
}

impl PresenceTracker {
    pub fn new(policy: PresencePolicy) -> Self {
        Self {
            policy,
            continuous_presence_started_at: None,
            absent_since: None,
            last_people_count: 0,
        }
    }

    pub fn presence_started_at(&self) -> Option<Instant> {
        self.continuous_presence_started_at
    }

    pub fn last_people_count(&self) -> usize {
        self.last_people_count
    }

    /// Fold one processed frame into the state.
    pub fn update(&mut self, people_count: usize, now: Instant) -> PresenceDecision {
        self.last_people_count = people_count;
        let mut decision = PresenceDecision {
            people_count,
            ..Default::default()
        };

        if people_count == 0 {
            self.continuous_presence_started_at = None;
            let since = *self.absent_since.get_or_insert(now);
            decision.stop_recording = now.duration_since(since) >= self.policy.stop_recording_after;
            return decision;
        }

        self.absent_since = None;
        let started = *self.continuous_presence_started_at.get_or_insert(now);
        let present_for = now.duration_since(started);

        if let Some(record_after) = self.policy.record_after {
            decision.start_recording = present_for >= record_after;
        }

        if self.policy.notify && present_for >= self.policy.notify_after {
            decision.notify = true;
            // A fresh debounce period must elapse before the next notification.
            self.continuous_presence_started_at = None;
        }

        decision
    }
}
