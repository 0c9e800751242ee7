//! Short-lived memory of messages the bot itself sent
//!
//! Group replies are only answered when they quote one of these, so the
//! entries only need to live as long as a reply is plausible.

use crate::config::{BOT_MESSAGE_TRACKER_MAX, BOT_MESSAGE_TTL_SECS};
use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// TTL cache of sent message ids
#[derive(Clone)]
pub struct BotMessageTracker {
    /// message id -> () with automatic expiry
    cache: Cache<String, ()>,
    /// Quote lookups that hit a tracked id
    reply_hits: Arc<AtomicU64>,
}

impl BotMessageTracker {
    /// Tracker with explicit TTL and capacity
    #[must_use]
    pub fn new(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            cache,
            reply_hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Remember a message the bot sent
    pub async fn track(&self, message_id: &str) {
        self.cache.insert(message_id.to_string(), ()).await;
    }

    /// Whether `quoted_id` refers to a recent bot message
    pub async fn is_bot_message(&self, quoted_id: &str) -> bool {
        if self.cache.get(quoted_id).await.is_none() {
            return false;
        }

        let hits = self.reply_hits.fetch_add(1, Ordering::Relaxed) + 1;
        if hits % 100 == 0 {
            debug!("💬 {hits} replies to bot messages so far");
        }
        true
    }

    /// Number of tracked ids (approximate until pending tasks run)
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Total quote lookups that matched a bot message
    #[must_use]
    pub fn reply_hits(&self) -> u64 {
        self.reply_hits.load(Ordering::Relaxed)
    }
}

impl Default for BotMessageTracker {
    fn default() -> Self {
        Self::new(BOT_MESSAGE_TTL_SECS, BOT_MESSAGE_TRACKER_MAX)
    }
}
