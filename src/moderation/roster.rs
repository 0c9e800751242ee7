//! Cached group admin lookup.

use crate::identity::{ChatId, SenderId};
use crate::transport::{Transport, TransportError};
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ROSTER_MAX_GROUPS: u64 = 1_000;

type AdminSet = Arc<HashSet<SenderId>>;

/// Per-group admin sets, cached for a short TTL.
///
/// A TTL of zero disables caching so every lookup hits the transport.
#[derive(Clone)]
pub struct AdminRoster {
    cache: Option<Cache<ChatId, AdminSet>>,
}

impl AdminRoster {
    /// Create a roster caching each group's admins for `ttl_secs`
    #[must_use]
    pub fn new(ttl_secs: u64) -> Self {
        let cache = (ttl_secs > 0).then(|| {
            Cache::builder()
                .max_capacity(ROSTER_MAX_GROUPS)
                .time_to_live(Duration::from_secs(ttl_secs))
                .build()
        });
        Self { cache }
    }

    /// Whether `sender` administers `chat`.
    ///
    /// Lookup failures count as "not admin".
    pub async fn is_admin(&self, transport: &dyn Transport, chat: &ChatId, sender: &SenderId) -> bool {
        let admins = match &self.cache {
            Some(cache) => cache
                .try_get_with(chat.clone(), fetch_admins(transport, chat))
                .await
                .map_err(|e| (*e).clone()),
            None => fetch_admins(transport, chat).await,
        };

        match admins {
            Ok(admins) => admins.contains(sender),
            Err(e) => {
                warn!(chat = %chat, error = %e, "Admin lookup failed, treating sender as member");
                false
            }
        }
    }

    /// Drop the cached admins of `chat`, e.g. after a membership change
    pub async fn invalidate(&self, chat: &ChatId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(chat).await;
            debug!(chat = %chat, "Admin roster invalidated");
        }
    }
}

async fn fetch_admins(transport: &dyn Transport, chat: &ChatId) -> Result<AdminSet, TransportError> {
    let metadata = transport.group_metadata(chat).await?;
    let admins = metadata
        .participants
        .iter()
        .filter(|p| p.role.is_admin())
        .filter_map(|p| SenderId::from_address(&p.id).ok())
        .collect::<HashSet<_>>();
    debug!(chat = %chat, admins = admins.len(), "Fetched admin roster");
    Ok(Arc::new(admins))
}
