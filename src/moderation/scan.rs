//! Retroactive spam sweep over a chat's history.

use super::classifier::exceeds_length;
use super::dispatcher::ModerationDispatcher;
use super::types::{DeleteOutcome, ModerationError, ScanReport};
use crate::identity::{ChatId, SenderId};
use crate::transport::{InboundMessage, Transport};
use crate::utils::char_len;
use chrono::Utc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct History {
    messages: Vec<InboundMessage>,
    pages: usize,
    truncated: bool,
}

impl ModerationDispatcher {
    /// Page through `chat` history and apply the length rule retroactively.
    ///
    /// Only the exemption and length checks run. Pagination stops at an
    /// empty or short page, or after the configured page cap. Deletes are
    /// spaced by the configured pause.
    ///
    /// # Errors
    ///
    /// Returns `ModerationError::History` when the first page cannot be fetched.
    pub async fn scan_and_delete_spam(
        &self,
        transport: &dyn Transport,
        chat: &ChatId,
        owner: Option<&SenderId>,
    ) -> Result<ScanReport, ModerationError> {
        info!(chat = %chat, "🔍 Starting spam scan");
        let history = self.fetch_history_pages(transport, chat).await?;
        let mut report = ScanReport {
            scanned: history.messages.len(),
            pages: history.pages,
            truncated: history.truncated,
            ..ScanReport::default()
        };

        for msg in &history.messages {
            let Ok(sender) = msg.sender_id() else {
                report.errors += 1;
                continue;
            };
            if msg.key.from_me || owner == Some(&sender) {
                continue;
            }
            if chat.is_group() && self.roster().is_admin(transport, chat, &sender).await {
                debug!(sender = %sender, "👑 Skipping admin");
                continue;
            }

            let text = msg.content.moderation_text();
            if !exceeds_length(text, self.config().max_chars) {
                continue;
            }
            let char_count = char_len(text);
            report.spam_found += 1;
            info!(sender = %sender, char_count, message_id = %msg.key.id, "🚨 Spam found");

            match self.silent_delete(transport, msg).await {
                DeleteOutcome::Deleted => {
                    report.deleted += 1;
                    tokio::time::sleep(self.config().scan_delete_pause()).await;
                }
                DeleteOutcome::AlreadyGone => report.already_deleted += 1,
                DeleteOutcome::Failed => report.errors += 1,
            }

            if self
                .store()
                .mute_if_unmuted(&sender, Utc::now(), self.config().mute_duration(), char_count)
            {
                report.users_muted += 1;
                report.spammers.push(sender);
            }
        }

        info!(
            chat = %chat,
            scanned = report.scanned,
            spam = report.spam_found,
            deleted = report.deleted,
            already_deleted = report.already_deleted,
            muted = report.users_muted,
            errors = report.errors,
            "✅ Spam scan complete"
        );
        Ok(report)
    }

    async fn fetch_history_pages(
        &self,
        transport: &dyn Transport,
        chat: &ChatId,
    ) -> Result<History, ModerationError> {
        let page_size = self.config().scan_page_size.max(1);
        let max_pages = self.config().scan_max_pages.max(1);
        let mut history = History::default();
        let mut before: Option<String> = None;

        loop {
            if history.pages == max_pages {
                history.truncated = true;
                warn!(chat = %chat, max_pages, "Scan page cap reached");
                break;
            }

            let page = match transport.fetch_history(chat, page_size, before.clone()).await {
                Ok(page) => page,
                Err(e) if history.pages == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(chat = %chat, error = %e, "⚠️ Could not fetch more messages");
                    break;
                }
            };

            history.pages += 1;
            let fetched = page.len();
            before = page.last().map(|m| m.key.id.clone());
            history.messages.extend(page);
            debug!(fetched, total = history.messages.len(), "📥 Fetched history page");

            if fetched < page_size {
                break;
            }
        }
        Ok(history)
    }
}
