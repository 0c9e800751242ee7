//! Inbound message routing.
//!
//! Per message, in delivery order: remember our own messages, run owner
//! commands, moderate group traffic, then answer `ping` and AI chat.
//! AI replies and history scans run as background tasks so a slow
//! responder never holds up moderation of the messages behind it.

use crate::ai::{build_prompt, complete_or_fallback, ChatResponder, ChatTurn, ConversationHistory};
use crate::bot::commands::{run_spam_scan, scan_refusal, CommandContext, OwnerCommand};
use crate::bot::resilient::send_safe;
use crate::bot::tracker::BotMessageTracker;
use crate::identity::{ChatId, ChatKind, SenderId};
use crate::moderation::ModerationDispatcher;
use crate::session::SessionId;
use crate::supervisor::EventHandler;
use crate::transport::{InboundMessage, OutgoingMessage, Transport};
use crate::utils::preview;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const PONG: &str = "pong 🏓";

/// Router options
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    /// Configured owner, in addition to the connected account
    pub owner: Option<SenderId>,
    /// Answer every group message, not only replies to the bot
    pub reply_all_groups: bool,
    /// AI replies enabled at startup
    pub ai_enabled: bool,
}

/// Outbound side shared with background tasks
#[derive(Clone)]
struct Replies {
    responder: Arc<dyn ChatResponder>,
    history: ConversationHistory,
    tracker: BotMessageTracker,
}

impl Replies {
    async fn chat(&self, transport: &dyn Transport, msg: &InboundMessage, name: &str, text: &str) {
        let chat = msg.chat_id().reply_target();
        let prompt = build_prompt(msg.chat_id().is_group(), name, text);
        debug!(chat = %chat, prompt = %preview(&prompt, 60), "💬 AI prompt");

        let past = self.history.load(&chat).await;
        let answer = complete_or_fallback(self.responder.as_ref(), &prompt, &past).await;

        if let Err(e) = self
            .history
            .append(&chat, &[ChatTurn::user(prompt), ChatTurn::assistant(answer.clone())])
            .await
        {
            warn!(chat = %chat, error = %e, "Failed to store chat history");
        }
        self.reply(transport, msg, answer).await;
    }

    async fn reply(&self, transport: &dyn Transport, msg: &InboundMessage, text: String) {
        let message = OutgoingMessage::text(text).quoting(msg.key.clone());
        self.send(transport, msg, message).await;
    }

    async fn send(&self, transport: &dyn Transport, msg: &InboundMessage, message: OutgoingMessage) {
        let target = msg.chat_id().reply_target();
        if let Some(key) = send_safe(transport, &target, message).await {
            self.tracker.track(&key.id).await;
        }
    }
}

/// Dispatches transport traffic to moderation, commands and chat.
pub struct MessageRouter {
    dispatcher: Arc<ModerationDispatcher>,
    replies: Replies,
    tasks: TaskTracker,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    self_id: RwLock<Option<SenderId>>,
    configured_owner: Option<SenderId>,
    reply_all_groups: bool,
    ai_enabled: AtomicBool,
}

impl MessageRouter {
    /// Create a router
    #[must_use]
    pub fn new(
        dispatcher: Arc<ModerationDispatcher>,
        responder: Arc<dyn ChatResponder>,
        history: ConversationHistory,
        options: RouterOptions,
    ) -> Self {
        Self {
            dispatcher,
            replies: Replies {
                responder,
                history,
                tracker: BotMessageTracker::default(),
            },
            tasks: TaskTracker::new(),
            transport: RwLock::new(None),
            self_id: RwLock::new(None),
            configured_owner: options.owner,
            reply_all_groups: options.reply_all_groups,
            ai_enabled: AtomicBool::new(options.ai_enabled),
        }
    }

    /// Moderation engine
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<ModerationDispatcher> {
        &self.dispatcher
    }

    /// Sent-message tracker
    #[must_use]
    pub fn tracker(&self) -> &BotMessageTracker {
        &self.replies.tracker
    }

    /// Whether AI replies are on
    #[must_use]
    pub fn ai_enabled(&self) -> bool {
        self.ai_enabled.load(Ordering::Relaxed)
    }

    /// Connected account, falling back to the configured owner
    #[must_use]
    pub fn owner(&self) -> Option<SenderId> {
        self.self_id
            .read()
            .clone()
            .or_else(|| self.configured_owner.clone())
    }

    /// Wait until every background reply and scan has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn is_owner(&self, msg: &InboundMessage, sender: &SenderId) -> bool {
        msg.key.from_me
            || self.self_id.read().as_ref() == Some(sender)
            || self.configured_owner.as_ref() == Some(sender)
    }

    /// Handle one message against `transport`.
    pub async fn handle_message(&self, transport: &Arc<dyn Transport>, msg: &InboundMessage) {
        if msg.key.from_me {
            self.replies.tracker.track(&msg.key.id).await;
        }

        let Ok(sender) = msg.sender_id() else {
            debug!(message_id = %msg.key.id, sender = %msg.sender, "Skipping message without sender");
            return;
        };
        let text = msg.content.display_text();

        if self.is_owner(msg, &sender) {
            if let Some(command) = OwnerCommand::parse(&text, &msg.mentions) {
                self.run_command(transport, msg, &command).await;
                return;
            }
        }
        if msg.key.from_me {
            return;
        }

        let chat = msg.chat_id();
        match chat.kind() {
            ChatKind::Status | ChatKind::Channel => return,
            ChatKind::Group if self.dispatcher.store().group_control_enabled() => {
                let owner = self.owner();
                let verdict = self
                    .dispatcher
                    .moderate(transport.as_ref(), msg, owner.as_ref(), Utc::now())
                    .await;
                if verdict.is_blocking() {
                    return;
                }
            }
            ChatKind::Group | ChatKind::Private => {}
        }

        if text.trim().eq_ignore_ascii_case("ping") {
            self.replies
                .reply(transport.as_ref(), msg, PONG.to_string())
                .await;
            return;
        }

        if self.should_chat(msg).await {
            let name = msg
                .push_name
                .clone()
                .unwrap_or_else(|| sender.to_string());
            let replies = self.replies.clone();
            let transport = Arc::clone(transport);
            let msg = msg.clone();
            self.tasks.spawn(async move {
                replies.chat(transport.as_ref(), &msg, &name, &text).await;
            });
        }
    }

    async fn should_chat(&self, msg: &InboundMessage) -> bool {
        if !self.ai_enabled() || msg.content.moderation_text().trim().is_empty() {
            return false;
        }
        if !msg.chat_id().is_group() || self.reply_all_groups {
            return true;
        }
        match &msg.quoted_id {
            Some(quoted) => self.replies.tracker.is_bot_message(quoted).await,
            None => false,
        }
    }

    async fn run_command(&self, transport: &Arc<dyn Transport>, msg: &InboundMessage, command: &OwnerCommand) {
        info!(command = ?command, chat = %msg.chat_id(), "⚙️ Owner command");
        let owner = self.owner();
        let ctx = CommandContext {
            transport: transport.as_ref(),
            chat: msg.chat_id(),
            dispatcher: &self.dispatcher,
            ai_enabled: &self.ai_enabled,
            history: &self.replies.history,
            owner: owner.as_ref(),
            now: Utc::now(),
        };
        let scan = *command == OwnerCommand::Blacklist && scan_refusal(&ctx).is_none();
        let reply = command.execute(&ctx).await;
        self.replies.send(transport.as_ref(), msg, reply).await;

        if scan {
            self.spawn_scan(transport, msg, owner);
        }
    }

    fn spawn_scan(&self, transport: &Arc<dyn Transport>, msg: &InboundMessage, owner: Option<SenderId>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let replies = self.replies.clone();
        let transport = Arc::clone(transport);
        let msg = msg.clone();
        self.tasks.spawn(async move {
            let report = run_spam_scan(&dispatcher, transport.as_ref(), msg.chat_id(), owner.as_ref()).await;
            replies.send(transport.as_ref(), &msg, report).await;
        });
    }
}

#[async_trait]
impl EventHandler for MessageRouter {
    async fn on_open(
        &self,
        transport: Arc<dyn Transport>,
        self_id: Option<SenderId>,
        session_id: SessionId,
    ) {
        info!(self_id = ?self_id, session_id = %session_id, "✅ Router attached to connection");
        *self.transport.write() = Some(transport);
        *self.self_id.write() = self_id;
    }

    async fn on_messages(&self, messages: Vec<InboundMessage>) {
        let Some(transport) = self.transport.read().clone() else {
            warn!(count = messages.len(), "Messages arrived with no open connection");
            return;
        };
        for msg in &messages {
            self.handle_message(&transport, msg).await;
        }
    }

    async fn on_participants_changed(&self, chat: ChatId) {
        self.dispatcher.roster().invalidate(&chat).await;
    }

    async fn on_close(&self) {
        *self.transport.write() = None;
    }
}
