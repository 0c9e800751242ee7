#![deny(missing_docs)]
//! Chatguard
//!
//! Moderation and session-continuity layer for a long-lived messaging
//! connection: classifies inbound group traffic, keeps per-sender mute and
//! ban state, and mirrors the connection credentials to durable storage so a
//! crashed or redeployed process can resume without re-authenticating.

/// AI chat endpoint client with stock-phrase fallback
pub mod ai;
/// Inbound routing, owner commands and outbound helpers
pub mod bot;
/// Subprocess bridge implementing the transport
pub mod bridge;
/// Configuration management
pub mod config;
/// Health probe report
pub mod health;
/// Sender identity and chat addressing
pub mod identity;
/// Real-time moderation engine
pub mod moderation;
/// Session continuity manager and session registry
pub mod session;
/// Document storage layer (R2/S3 or in-memory)
pub mod storage;
/// Connection supervisor
pub mod supervisor;
/// Transport collaborator interface
pub mod transport;
/// Utility functions
pub mod utils;
