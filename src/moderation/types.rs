//! Moderation data model: verdicts, state records and reports.

use crate::identity::{IdentityError, SenderId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Why a message was exempt from moderation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Sent by the connected account or its owner
    Owner,
    /// Sender administers the group
    Admin,
}

/// Why a message from a restricted sender was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    /// Sender is permanently banned
    PermanentlyMuted,
    /// Sender is inside an active temporary mute
    UserMuted {
        /// Whole minutes left on the mute, rounded up
        remaining_minutes: i64,
    },
}

/// Outcome of running one message through the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Verdict {
    /// Exempt sender
    Ignored {
        /// Exemption
        reason: IgnoreReason,
    },
    /// Message from a banned or muted sender
    Deleted {
        /// Restriction in force
        reason: DeleteReason,
    },
    /// Timing pattern matched; sender is now banned
    BotDetected,
    /// Message contained a link
    LinkDeleted {
        /// Link warnings accumulated by the sender
        warnings: u32,
        /// This violation promoted the sender to a ban
        banned: bool,
    },
    /// Message exceeded the length threshold; sender is now muted
    SpamDetected {
        /// Characters in the offending text
        char_count: usize,
    },
    /// Nothing matched
    Allowed {
        /// Characters in the moderated text
        char_count: usize,
    },
    /// Evaluation failed for this message
    Error {
        /// Failure description
        message: String,
    },
}

impl Verdict {
    /// Stable action name used in logs and reports
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ignored { .. } => "ignored",
            Self::Deleted { .. } => "deleted",
            Self::BotDetected => "bot_detected",
            Self::LinkDeleted { .. } => "link_deleted",
            Self::SpamDetected { .. } => "spam_detected",
            Self::Allowed { .. } => "allowed",
            Self::Error { .. } => "error",
        }
    }

    /// Whether downstream handling (commands, chat replies) must be skipped
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::Ignored { .. } | Self::Allowed { .. } | Self::Error { .. })
    }
}

/// Temporary mute of one sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuteRecord {
    /// Muted sender
    pub sender: SenderId,
    /// Mute expiry
    pub muted_until: DateTime<Utc>,
    /// Messages counted against this mute, including the triggering one
    pub message_count: u32,
    /// When the mute started
    pub muted_at: DateTime<Utc>,
    /// Length of the message that triggered the mute
    pub spam_char_count: usize,
}

impl MuteRecord {
    /// Whole minutes left, rounded up; zero once expired
    #[must_use]
    pub fn remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        let millis = (self.muted_until - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis + 59_999) / 60_000
        }
    }
}

/// Link violations accumulated by one sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkViolation {
    /// Link messages seen
    pub count: u32,
    /// Warnings issued; promotes to a ban at the threshold
    pub warnings: u32,
}

/// Read-only view of a muted sender for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutedUserSummary {
    /// Muted sender
    pub user_id: SenderId,
    /// Whole minutes left, rounded up
    pub remaining_minutes: i64,
    /// Messages counted against the mute
    pub deleted_messages: u32,
}

/// Counters describing detector state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    /// Senders in the ban set
    pub permanently_muted: usize,
    /// Senders banned by the timing detector
    pub bot_suspects: usize,
    /// Senders with at least one link violation
    pub link_violators: usize,
    /// Senders with an unexpired mute
    pub temporarily_muted: usize,
    /// Senders with a recorded message window
    pub tracked_senders: usize,
    /// Messages with a recorded edit trail
    pub tracked_edits: usize,
    /// Delete calls that failed since startup
    pub failed_deletes: u64,
}

/// Errors raised inside the moderation pipeline
#[derive(Debug, Error)]
pub enum ModerationError {
    /// Sender address could not be normalized
    #[error("Invalid sender: {0}")]
    Identity(#[from] IdentityError),
    /// Group history could not be fetched
    #[error("History fetch failed: {0}")]
    History(#[from] crate::transport::TransportError),
}

/// Result of deleting a message for everyone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Removed by this call
    Deleted,
    /// Already gone before this call
    AlreadyGone,
    /// The transport refused or failed
    Failed,
}

impl DeleteOutcome {
    /// Whether the message no longer exists
    #[must_use]
    pub fn is_gone(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Summary of a retroactive history scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Messages inspected
    pub scanned: usize,
    /// Messages over the length threshold
    pub spam_found: usize,
    /// Spam messages successfully deleted
    pub deleted: usize,
    /// Spam messages someone else had already removed
    pub already_deleted: usize,
    /// Distinct senders newly muted
    pub users_muted: usize,
    /// Failed deletes
    pub errors: usize,
    /// Pages fetched
    pub pages: usize,
    /// Stopped early because the page cap was reached
    pub truncated: bool,
    /// Senders caught, in discovery order
    pub spammers: Vec<SenderId>,
}

impl ScanReport {
    /// Owner-facing summary text
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = format!(
            "🧹 *Spam scan complete*\n\n\
             📨 Scanned: {}\n\
             🚫 Spam found: {}\n\
             🗑️ Deleted: {}\n\
             🔇 Users muted: {}\n\
             ⚠️ Errors: {}",
            self.scanned, self.spam_found, self.deleted, self.users_muted, self.errors
        );
        if self.already_deleted > 0 {
            text.push_str(&format!("\n♻️ Already gone: {}", self.already_deleted));
        }
        if self.truncated {
            text.push_str(&format!("\n\n_Stopped after {} pages_", self.pages));
        }
        if !self.spammers.is_empty() {
            text.push_str("\n\n*Spammers:*");
            for sender in &self.spammers {
                text.push_str(&format!("\n• @{sender}"));
            }
        }
        text
    }
}
