//! Real-time moderation engine.
//!
//! The [`ModerationDispatcher`] runs each inbound message through the
//! classifier, the timing detector and the [`ModerationStore`], deleting
//! offending messages through the transport.

/// Stateless link and length rules
pub mod classifier;
/// Moderation configuration
pub mod config;
/// Per-message moderation pipeline
pub mod dispatcher;
/// Cached group admin lookup
pub mod roster;
/// Retroactive history scan
pub mod scan;
/// Process-local moderation state
pub mod store;
/// Timing-pattern bot detection
pub mod timing;
/// Verdicts, records and reports
pub mod types;

pub use config::ModerationConfig;
pub use dispatcher::ModerationDispatcher;
pub use roster::AdminRoster;
pub use store::ModerationStore;
pub use types::{
    DeleteOutcome, DeleteReason, DetectionStats, IgnoreReason, LinkViolation, ModerationError, MuteRecord,
    MutedUserSummary, ScanReport, Verdict,
};
