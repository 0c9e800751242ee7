//! Per-message moderation pipeline.

use super::classifier::{contains_link, exceeds_length};
use super::config::ModerationConfig;
use super::roster::AdminRoster;
use super::store::ModerationStore;
use super::types::{DeleteOutcome, DeleteReason, IgnoreReason, ModerationError, Verdict};
use crate::identity::SenderId;
use crate::transport::{InboundMessage, MessageKey, OutgoingMessage, Transport, TransportError};
use crate::utils::{char_len, preview};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs inbound messages through the moderation rules, first match wins:
/// exemption, ban, bot timing, mute, link, length.
pub struct ModerationDispatcher {
    config: ModerationConfig,
    store: Arc<ModerationStore>,
    roster: AdminRoster,
}

impl ModerationDispatcher {
    /// Create a dispatcher over a shared store
    #[must_use]
    pub fn new(config: ModerationConfig, store: Arc<ModerationStore>) -> Self {
        let roster = AdminRoster::new(config.admin_roster_ttl_secs);
        Self {
            config,
            store,
            roster,
        }
    }

    /// Shared moderation state
    #[must_use]
    pub fn store(&self) -> &Arc<ModerationStore> {
        &self.store
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &ModerationConfig {
        &self.config
    }

    /// Group admin cache
    #[must_use]
    pub fn roster(&self) -> &AdminRoster {
        &self.roster
    }

    /// Classify one message and act on it.
    ///
    /// Never fails: evaluation errors become [`Verdict::Error`] so the caller
    /// can move on to the next message.
    pub async fn moderate(
        &self,
        transport: &dyn Transport,
        msg: &InboundMessage,
        owner: Option<&SenderId>,
        now: DateTime<Utc>,
    ) -> Verdict {
        match self.evaluate(transport, msg, owner, now).await {
            Ok(verdict) => {
                debug!(
                    chat = %msg.chat_id(),
                    message_id = %msg.key.id,
                    action = verdict.action(),
                    "Moderation verdict"
                );
                verdict
            }
            Err(e) => {
                warn!(chat = %msg.chat_id(), message_id = %msg.key.id, error = %e, "❌ Moderation failed");
                Verdict::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn evaluate(
        &self,
        transport: &dyn Transport,
        msg: &InboundMessage,
        owner: Option<&SenderId>,
        now: DateTime<Utc>,
    ) -> Result<Verdict, ModerationError> {
        let sender = msg.sender_id()?;
        let chat = msg.chat_id();
        let is_group = chat.is_group();

        if msg.key.from_me || owner == Some(&sender) {
            return Ok(Verdict::Ignored {
                reason: IgnoreReason::Owner,
            });
        }

        if is_group && self.roster.is_admin(transport, chat, &sender).await {
            debug!(sender = %sender, "👑 Admin exempt from rules");
            return Ok(Verdict::Ignored {
                reason: IgnoreReason::Admin,
            });
        }

        if self.store.is_banned(&sender) {
            self.silent_delete(transport, msg).await;
            info!(sender = %sender, "🔇 Deleted message from banned sender");
            return Ok(Verdict::Deleted {
                reason: DeleteReason::PermanentlyMuted,
            });
        }

        if self.config.bot_detection_enabled
            && self
                .store
                .check_timing(&sender, msg.edit_of.as_deref(), now)
        {
            self.store.ban(&sender, true);
            self.silent_delete(transport, msg).await;
            info!(sender = %sender, "🤖 Bot permanently muted");
            return Ok(Verdict::BotDetected);
        }

        if let Some(mute) = self.store.record_muted_message(&sender, now) {
            self.silent_delete(transport, msg).await;
            let remaining_minutes = mute.remaining_minutes(now);
            info!(
                sender = %sender,
                remaining_minutes,
                count = mute.message_count,
                "🔇 Deleted message from muted sender"
            );
            return Ok(Verdict::Deleted {
                reason: DeleteReason::UserMuted { remaining_minutes },
            });
        }

        let text = msg.content.moderation_text();

        if is_group && contains_link(text) {
            let violation = self.store.record_link_violation(&sender);
            self.silent_delete(transport, msg).await;
            info!(sender = %sender, warnings = violation.warnings, "🔗 Link deleted");

            let banned = violation.warnings >= self.config.link_ban_threshold
                && self.store.ban(&sender, false);
            if banned {
                self.announce_link_ban(transport, msg, &sender).await;
            }
            return Ok(Verdict::LinkDeleted {
                warnings: violation.warnings,
                banned,
            });
        }

        let char_count = char_len(text);
        if exceeds_length(text, self.config.max_chars) {
            self.silent_delete(transport, msg).await;
            let mute = self
                .store
                .mute(&sender, now, self.config.mute_duration(), char_count);
            info!(
                sender = %sender,
                char_count,
                until = %mute.muted_until,
                preview = %preview(text, 40),
                "🚨 Spam detected"
            );
            return Ok(Verdict::SpamDetected { char_count });
        }

        Ok(Verdict::Allowed { char_count })
    }

    async fn announce_link_ban(&self, transport: &dyn Transport, msg: &InboundMessage, sender: &SenderId) {
        let notice = OutgoingMessage::text(format!(
            "🔇 @{sender} permanently muted for repeated link violations."
        ))
        .mentioning(sender.to_user_address());
        if let Err(e) = transport.send(msg.chat_id(), notice).await {
            warn!(sender = %sender, error = %e, "Failed to post ban notice");
        }
    }

    /// Delete `msg` for everyone. Failures are counted and logged, never raised.
    ///
    /// A message that no longer exists is not a failure.
    pub async fn silent_delete(&self, transport: &dyn Transport, msg: &InboundMessage) -> DeleteOutcome {
        let key = delete_key(msg);
        match transport.delete(&key).await {
            Ok(()) => DeleteOutcome::Deleted,
            Err(TransportError::NotFound) => {
                debug!(message_id = %key.id, "Message already deleted");
                DeleteOutcome::AlreadyGone
            }
            Err(e) => {
                let total = self.store.record_delete_failure();
                warn!(chat = %key.chat_id, message_id = %key.id, error = %e, "Delete failed");
                if total % 100 == 0 {
                    warn!(total, "⚠️ {total} deletes have failed; check admin rights");
                }
                DeleteOutcome::Failed
            }
        }
    }
}

/// Key used to delete someone else's message
fn delete_key(msg: &InboundMessage) -> MessageKey {
    MessageKey {
        from_me: false,
        participant: Some(msg.sender.clone()),
        ..msg.key.clone()
    }
}
