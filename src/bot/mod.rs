/// Owner command parsing and execution
pub mod commands;
/// Inbound message routing
pub mod handlers;
/// Retrying outbound sends
pub mod resilient;
/// Sent-message tracking for reply detection
pub mod tracker;

pub use handlers::{MessageRouter, RouterOptions};
pub use tracker::BotMessageTracker;
