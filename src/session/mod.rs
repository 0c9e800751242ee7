//! Session continuity and the session registry.
//!
//! A session owns one local credential directory and one document
//! collection mirroring it. The [`SessionContinuityManager`] keeps the two in
//! step; the [`SessionRegistry`] tracks metadata for recovery and cleanup.

/// Session configuration
pub mod config;
/// Credential directory mirroring
pub mod continuity;
/// Trailing-edge debounce
pub mod debounce;
/// Session metadata catalog
pub mod registry;
/// Session ids, records and errors
pub mod types;
/// Stall watchdog
pub mod watchdog;

pub use config::SessionConfig;
pub use continuity::{SessionContinuityManager, SyncClock};
pub use debounce::Debouncer;
pub use registry::SessionRegistry;
pub use types::{SessionError, SessionId, SessionRecord, SessionStatus, SyncSummary};
pub use watchdog::StallWatchdog;
