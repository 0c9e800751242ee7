//! Owner command surface.
//!
//! Plain lowercase text sent from the connected account. Each command is a
//! thin read or write against the moderation store.

use crate::ai::ConversationHistory;
use crate::identity::{ChatId, SenderId};
use crate::moderation::ModerationDispatcher;
use crate::transport::{OutgoingMessage, Transport};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Parsed owner command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerCommand {
    /// Status and command list
    Menu,
    /// Turn group moderation on or off
    GroupControl(bool),
    /// Moderation status and counters
    GroupStatus,
    /// List banned senders
    Banned,
    /// Lift a ban; `None` when no target was given
    Unban(Option<SenderId>),
    /// Report ban state of a sender
    CheckBan(Option<SenderId>),
    /// List muted senders
    Muted,
    /// Scan the current chat's history for spam
    Blacklist,
    /// Enable or disable AI replies
    Chat(bool),
    /// Forget the AI conversation held for this chat
    ResetChat,
}

impl OwnerCommand {
    /// Parse message text; `mentions` are addresses tagged in the message.
    ///
    /// Returns `None` when the text is not a command.
    #[must_use]
    pub fn parse(text: &str, mentions: &[String]) -> Option<Self> {
        let normalized = text.trim().to_lowercase();
        let mut words = normalized.split_whitespace();
        let head = words.next()?;
        let arg = words.next();

        let command = match (head, arg) {
            ("menu", None) => Self::Menu,
            ("groupcontrol", Some("on")) => Self::GroupControl(true),
            ("groupcontrol", Some("off")) => Self::GroupControl(false),
            ("groupstatus", None) => Self::GroupStatus,
            ("banned", None) => Self::Banned,
            ("muted", None) => Self::Muted,
            ("blacklist", None) => Self::Blacklist,
            ("chat" | "type", None) => Self::Chat(true),
            ("sleep" | "zip", None) => Self::Chat(false),
            ("shut", Some("up")) => Self::Chat(false),
            ("reset", None) => Self::ResetChat,
            ("unban", _) => Self::Unban(target(arg, mentions)),
            ("checkban", _) => Self::CheckBan(target(arg, mentions)),
            _ => return None,
        };
        Some(command)
    }
}

/// Mentioned address first, else digits typed after the command.
fn target(arg: Option<&str>, mentions: &[String]) -> Option<SenderId> {
    if let Some(sender) = mentions
        .iter()
        .find_map(|m| SenderId::from_address(m).ok())
    {
        return Some(sender);
    }
    let digits: String = arg?.chars().filter(char::is_ascii_digit).collect();
    SenderId::from_address(&digits).ok()
}

/// What a command needs to run
pub struct CommandContext<'a> {
    /// Live connection
    pub transport: &'a dyn Transport,
    /// Chat the command was typed in
    pub chat: &'a ChatId,
    /// Moderation engine
    pub dispatcher: &'a ModerationDispatcher,
    /// AI reply switch
    pub ai_enabled: &'a AtomicBool,
    /// Stored AI conversations
    pub history: &'a ConversationHistory,
    /// Connected account, exempt from scans
    pub owner: Option<&'a SenderId>,
    /// Current time
    pub now: DateTime<Utc>,
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "✅ ON"
    } else {
        "❌ OFF"
    }
}

fn mention_all(mut message: OutgoingMessage, senders: &[SenderId]) -> OutgoingMessage {
    for sender in senders {
        message = message.mentioning(sender.to_user_address());
    }
    message
}

impl OwnerCommand {
    /// Run the command and build the reply.
    pub async fn execute(&self, ctx: &CommandContext<'_>) -> OutgoingMessage {
        let store = ctx.dispatcher.store();
        match self {
            Self::Menu => OutgoingMessage::text(menu_text(ctx)),
            Self::GroupControl(enabled) => {
                store.set_group_control(*enabled);
                info!(enabled, "🛡️ Group control toggled");
                OutgoingMessage::text(format!("🛡️ Group control: {}", on_off(*enabled)))
            }
            Self::GroupStatus => OutgoingMessage::text(status_text(ctx)),
            Self::Banned => {
                let banned = store.banned_users();
                if banned.is_empty() {
                    return OutgoingMessage::text("✅ No banned users");
                }
                let bots = store.bot_suspects();
                let mut text = format!("🚫 *Banned users ({})*\n", banned.len());
                for sender in &banned {
                    let tag = if bots.contains(sender) { " 🤖" } else { "" };
                    text.push_str(&format!("\n• @{sender}{tag}"));
                }
                mention_all(OutgoingMessage::text(text), &banned)
            }
            Self::Unban(None) => OutgoingMessage::text("⚠️ Usage: unban @user"),
            Self::Unban(Some(sender)) => {
                let text = if store.unban_user(sender) {
                    info!(sender = %sender, "✅ Sender unbanned by owner");
                    format!("✅ @{sender} unbanned")
                } else {
                    format!("ℹ️ @{sender} was not banned")
                };
                OutgoingMessage::text(text).mentioning(sender.to_user_address())
            }
            Self::CheckBan(None) => OutgoingMessage::text("⚠️ Usage: checkban @user"),
            Self::CheckBan(Some(sender)) => {
                OutgoingMessage::text(check_ban_text(ctx, sender))
                    .mentioning(sender.to_user_address())
            }
            Self::Muted => {
                let muted = store.muted_users(ctx.now);
                if muted.is_empty() {
                    return OutgoingMessage::text("✅ No muted users");
                }
                let mut text = format!("🔇 *Muted users ({})*\n", muted.len());
                for entry in &muted {
                    text.push_str(&format!(
                        "\n• @{} - {} min left, {} deleted",
                        entry.user_id, entry.remaining_minutes, entry.deleted_messages
                    ));
                }
                let senders: Vec<SenderId> = muted.into_iter().map(|m| m.user_id).collect();
                mention_all(OutgoingMessage::text(text), &senders)
            }
            Self::Blacklist => scan_refusal(ctx)
                .unwrap_or_else(|| OutgoingMessage::text("🔍 Starting spam scan...")),
            Self::Chat(enabled) => {
                ctx.ai_enabled.store(*enabled, Ordering::Relaxed);
                info!(enabled, "🤖 AI replies toggled");
                let text = if *enabled {
                    "🤖 AI replies activated"
                } else {
                    "😴 AI replies deactivated"
                };
                OutgoingMessage::text(text)
            }
            Self::ResetChat => match ctx.history.clear(&ctx.chat.reply_target()).await {
                Ok(()) => OutgoingMessage::text("🧹 Chat history cleared"),
                Err(e) => {
                    warn!(chat = %ctx.chat, error = %e, "Failed to clear chat history");
                    OutgoingMessage::text("❌ Could not clear chat history")
                }
            },
        }
    }
}

/// Why a spam scan cannot run here, `None` when it can.
#[must_use]
pub fn scan_refusal(ctx: &CommandContext<'_>) -> Option<OutgoingMessage> {
    if !ctx.chat.is_group() {
        return Some(OutgoingMessage::text("⚠️ blacklist only works in groups"));
    }
    if !ctx.dispatcher.store().group_control_enabled() {
        return Some(OutgoingMessage::text(
            "⚠️ Group control is off. Turn it on with: groupcontrol on",
        ));
    }
    None
}

/// Scan `chat` for spam and render the report as a reply.
pub async fn run_spam_scan(
    dispatcher: &ModerationDispatcher,
    transport: &dyn Transport,
    chat: &ChatId,
    owner: Option<&SenderId>,
) -> OutgoingMessage {
    match dispatcher.scan_and_delete_spam(transport, chat, owner).await {
        Ok(report) => mention_all(OutgoingMessage::text(report.render()), &report.spammers),
        Err(e) => {
            warn!(chat = %chat, error = %e, "Spam scan failed");
            OutgoingMessage::text(format!("❌ Scan failed: {e}"))
        }
    }
}

fn menu_text(ctx: &CommandContext<'_>) -> String {
    let store = ctx.dispatcher.store();
    let stats = store.detection_stats(ctx.now);
    format!(
        "⚡ *CHATGUARD MENU* ⚡\n\n\
         📊 *STATUS*\n\
         🤖 AI: {}\n\
         🛡️ Protection: {}\n\
         🚫 Banned: {}\n\
         🤖 Bots: {}\n\n\
         🎮 *COMMANDS*\n\
         - chat/type - Activate AI\n\
         - sleep/zip - Deactivate AI\n\
         - reset - Forget this chat's AI history\n\
         - groupcontrol on/off\n\
         - groupstatus - Protection status\n\
         - blacklist - Scan spam\n\
         - banned - Show banned\n\
         - unban @user\n\
         - checkban @user\n\
         - muted - Show muted\n\
         - menu - This menu\n\
         - ping - Test bot",
        on_off(ctx.ai_enabled.load(Ordering::Relaxed)),
        on_off(store.group_control_enabled()),
        stats.permanently_muted,
        stats.bot_suspects,
    )
}

fn status_text(ctx: &CommandContext<'_>) -> String {
    let store = ctx.dispatcher.store();
    let stats = store.detection_stats(ctx.now);
    let config = ctx.dispatcher.config();
    format!(
        "🛡️ *Group control:* {}\n\n\
         📏 Max length: {} chars\n\
         ⏱️ Mute: {} min\n\
         🔗 Link ban after: {} warnings\n\n\
         🚫 Banned: {}\n\
         🤖 Bot suspects: {}\n\
         🔗 Link violators: {}\n\
         🔇 Muted now: {}\n\
         ⚠️ Failed deletes: {}",
        on_off(store.group_control_enabled()),
        config.max_chars,
        config.mute_duration_secs / 60,
        config.link_ban_threshold,
        stats.permanently_muted,
        stats.bot_suspects,
        stats.link_violators,
        stats.temporarily_muted,
        stats.failed_deletes,
    )
}

fn check_ban_text(ctx: &CommandContext<'_>, sender: &SenderId) -> String {
    let store = ctx.dispatcher.store();
    let mut text = if store.is_banned(sender) {
        let how = if store.bot_suspects().contains(sender) {
            " (bot behaviour)"
        } else {
            ""
        };
        format!("🚫 @{sender} is banned{how}")
    } else {
        format!("✅ @{sender} is not banned")
    };
    if let Some(violation) = store.link_violation(sender) {
        text.push_str(&format!("\n🔗 Link warnings: {}", violation.warnings));
    }
    if let Some(mute) = store.mute_record(sender) {
        let remaining = mute.remaining_minutes(ctx.now);
        if remaining > 0 {
            text.push_str(&format!("\n🔇 Muted: {remaining} min left"));
        }
    }
    text
}
