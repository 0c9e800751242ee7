//! Timing-pattern bot detection.
//!
//! Two bounded accumulators: the most recent message timestamps per sender,
//! and the edit timestamps per message id. Edit trails that go quiet for
//! longer than the idle window are swept on the next edit.

use super::config::ModerationConfig;
use crate::identity::SenderId;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

/// Thresholds used by [`TimingDetector`]
#[derive(Debug, Clone, Copy)]
pub struct TimingThresholds {
    /// Timestamps kept per sender
    pub message_window: usize,
    /// Messages inspected by the rapid-message rule
    pub rapid_message_count: usize,
    /// Span (ms) below which the inspected messages flag a bot
    pub rapid_message_span_ms: i64,
    /// Edits of one message that flag a bot
    pub rapid_edit_count: usize,
    /// Span (ms) below which the edits flag a bot
    pub rapid_edit_span_ms: i64,
    /// Edit trails idle for longer than this are dropped
    pub edit_idle: Duration,
}

impl From<&ModerationConfig> for TimingThresholds {
    fn from(config: &ModerationConfig) -> Self {
        Self {
            message_window: config.message_window.max(config.rapid_message_count).max(1),
            rapid_message_count: config.rapid_message_count.max(2),
            rapid_message_span_ms: config.rapid_message_span_ms,
            rapid_edit_count: config.rapid_edit_count.max(2),
            rapid_edit_span_ms: config.rapid_edit_span_ms,
            edit_idle: Duration::seconds(i64::try_from(config.edit_idle_secs).unwrap_or(i64::MAX / 1000)),
        }
    }
}

impl Default for TimingThresholds {
    fn default() -> Self {
        Self::from(&ModerationConfig::default())
    }
}

/// Per-sender message windows and per-message edit trails
#[derive(Debug, Default)]
pub struct TimingDetector {
    thresholds: TimingThresholds,
    messages: HashMap<SenderId, VecDeque<DateTime<Utc>>>,
    edits: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl TimingDetector {
    /// Create a detector with the given thresholds
    #[must_use]
    pub fn new(thresholds: TimingThresholds) -> Self {
        Self {
            thresholds,
            messages: HashMap::new(),
            edits: HashMap::new(),
        }
    }

    /// Record a message from `sender` and report whether the recent rate looks automated.
    pub fn record_and_check_rapid_messages(&mut self, sender: &SenderId, now: DateTime<Utc>) -> bool {
        let t = self.thresholds;
        let window = self.messages.entry(sender.clone()).or_default();
        window.push_back(now);
        while window.len() > t.message_window {
            window.pop_front();
        }

        if window.len() < t.rapid_message_count {
            return false;
        }

        let oldest = window[window.len() - t.rapid_message_count];
        let newest = window[window.len() - 1];
        let span = (newest - oldest).num_milliseconds();
        let is_bot = span < t.rapid_message_span_ms;
        if is_bot {
            info!(
                sender = %sender,
                span_ms = span,
                count = t.rapid_message_count,
                "🤖 Rapid messages detected"
            );
        }
        is_bot
    }

    /// Record an edit of `message_id` and report whether the edit rate looks automated.
    pub fn record_and_check_rapid_edits(&mut self, message_id: &str, now: DateTime<Utc>) -> bool {
        self.sweep_idle_edits(now);

        let t = self.thresholds;
        let trail = self.edits.entry(message_id.to_string()).or_default();
        trail.push_back(now);
        // The rule only ever looks at the latest `rapid_edit_count` edits
        while trail.len() > t.rapid_edit_count {
            trail.pop_front();
        }

        if trail.len() < t.rapid_edit_count {
            return false;
        }

        let span = match (trail.front(), trail.back()) {
            (Some(first), Some(last)) => (*last - *first).num_milliseconds(),
            _ => return false,
        };
        let is_bot = span < t.rapid_edit_span_ms;
        if is_bot {
            info!(message_id, edits = trail.len(), span_ms = span, "🤖 Rapid edits detected");
        }
        is_bot
    }

    fn sweep_idle_edits(&mut self, now: DateTime<Utc>) {
        let idle = self.thresholds.edit_idle;
        let before = self.edits.len();
        self.edits
            .retain(|_, trail| trail.back().is_some_and(|last| now - *last <= idle));
        let swept = before - self.edits.len();
        if swept > 0 {
            debug!(swept, remaining = self.edits.len(), "Evicted idle edit trails");
        }
    }

    /// Drop the message window of a sender
    pub fn forget_sender(&mut self, sender: &SenderId) {
        self.messages.remove(sender);
    }

    /// Senders with a recorded window
    #[must_use]
    pub fn tracked_senders(&self) -> usize {
        self.messages.len()
    }

    /// Messages with a recorded edit trail
    #[must_use]
    pub fn tracked_edits(&self) -> usize {
        self.edits.len()
    }

    /// Timestamps currently held for `sender`
    #[must_use]
    pub fn window_len(&self, sender: &SenderId) -> usize {
        self.messages.get(sender).map_or(0, VecDeque::len)
    }
}
