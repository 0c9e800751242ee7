//! Transport collaborator interface.
//!
//! The connection library itself lives outside this crate. It delivers
//! decoded messages and lifecycle events over a channel and accepts
//! send/delete/history/metadata requests through [`Transport`].

use crate::identity::{ChatId, IdentityError, SenderId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors returned by the transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Target message or chat no longer exists (e.g. already deleted)
    #[error("Not found")]
    NotFound,
    /// Operation rejected, typically missing admin rights
    #[error("Forbidden: {0}")]
    Forbidden(String),
    /// Connection is not open
    #[error("Connection closed")]
    Closed,
    /// Any other request failure
    #[error("Transport request failed: {0}")]
    Request(String),
}

/// Identifies a single message on the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    /// Chat the message lives in
    pub chat_id: ChatId,
    /// Network message id
    pub id: String,
    /// Sent by the connected account
    pub from_me: bool,
    /// Author address inside groups
    pub participant: Option<String>,
}

/// Decoded message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain or extended text
    Text {
        /// Message body
        text: String,
    },
    /// Image with optional caption
    Image {
        /// Caption text
        caption: Option<String>,
    },
    /// Video with optional caption
    Video {
        /// Caption text
        caption: Option<String>,
    },
    /// Audio clip or voice note
    Audio {
        /// Recorded as push-to-talk voice note
        is_voice: bool,
    },
    /// File attachment
    Document {
        /// Original file name
        file_name: Option<String>,
    },
    /// Sticker
    Sticker,
    /// Shared contact card
    Contact {
        /// Display name on the card
        name: Option<String>,
    },
    /// Shared location
    Location,
    /// Reaction to another message
    Reaction {
        /// Reaction emoji
        emoji: Option<String>,
    },
    /// Poll creation
    Poll,
    /// Anything the transport could not decode
    Unknown,
}

impl MessageContent {
    /// Build a text payload
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Human readable rendering used for logs, commands and the AI prompt.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Image { caption } => with_caption("[Image]", caption.as_deref()),
            Self::Video { caption } => with_caption("[Video]", caption.as_deref()),
            Self::Audio { is_voice: true } => "[Voice Note]".to_string(),
            Self::Audio { is_voice: false } => "[Audio]".to_string(),
            Self::Document { file_name } => {
                format!("[Document: {}]", file_name.as_deref().unwrap_or("file"))
            }
            Self::Sticker => "[Sticker]".to_string(),
            Self::Contact { name } => {
                format!("[Contact: {}]", name.as_deref().unwrap_or("Unknown"))
            }
            Self::Location => "[Location]".to_string(),
            Self::Reaction { emoji } => {
                format!("[Reaction: {}]", emoji.as_deref().unwrap_or("👍"))
            }
            Self::Poll => "[Poll]".to_string(),
            Self::Unknown => "[Unknown message type]".to_string(),
        }
    }

    /// Text subject to link and length rules: body or media caption.
    #[must_use]
    pub fn moderation_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Image { caption } | Self::Video { caption } => caption.as_deref().unwrap_or(""),
            _ => "",
        }
    }
}

fn with_caption(tag: &str, caption: Option<&str>) -> String {
    match caption {
        Some(caption) if !caption.is_empty() => format!("{tag} - {caption}"),
        _ => tag.to_string(),
    }
}

/// Message delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message key
    pub key: MessageKey,
    /// Raw author address (participant in groups, chat address otherwise)
    pub sender: String,
    /// Display name announced by the sender
    pub push_name: Option<String>,
    /// Decoded payload
    pub content: MessageContent,
    /// Network timestamp
    pub timestamp: DateTime<Utc>,
    /// Set when this event is an edit of an earlier message
    pub edit_of: Option<String>,
    /// Id of the message this one quotes
    pub quoted_id: Option<String>,
    /// Addresses mentioned in the message
    pub mentions: Vec<String>,
}

impl InboundMessage {
    /// Create a message with no quote, edit or mention metadata
    #[must_use]
    pub fn new(
        key: MessageKey,
        sender: impl Into<String>,
        content: MessageContent,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            sender: sender.into(),
            push_name: None,
            content,
            timestamp,
            edit_of: None,
            quoted_id: None,
            mentions: Vec::new(),
        }
    }

    /// Mark this event as an edit of `message_id`
    #[must_use]
    pub fn with_edit_of(mut self, message_id: impl Into<String>) -> Self {
        self.edit_of = Some(message_id.into());
        self
    }

    /// Attach the id of a quoted message
    #[must_use]
    pub fn with_quote(mut self, message_id: impl Into<String>) -> Self {
        self.quoted_id = Some(message_id.into());
        self
    }

    /// Attach mentioned addresses
    #[must_use]
    pub fn with_mentions(mut self, mentions: Vec<String>) -> Self {
        self.mentions = mentions;
        self
    }

    /// Normalized sender identity
    ///
    /// # Errors
    ///
    /// Returns an error if the sender address is empty.
    pub fn sender_id(&self) -> Result<SenderId, IdentityError> {
        SenderId::from_address(&self.sender)
    }

    /// Chat the message arrived in
    #[must_use]
    pub fn chat_id(&self) -> &ChatId {
        &self.key.chat_id
    }
}

/// Outgoing text message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Body
    pub text: String,
    /// Message to quote
    pub quoted: Option<MessageKey>,
    /// Addresses to mention
    pub mentions: Vec<String>,
}

impl OutgoingMessage {
    /// Plain text message
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Quote another message
    #[must_use]
    pub fn quoting(mut self, key: MessageKey) -> Self {
        self.quoted = Some(key);
        self
    }

    /// Mention an address
    #[must_use]
    pub fn mentioning(mut self, address: impl Into<String>) -> Self {
        self.mentions.push(address.into());
        self
    }
}

/// Role of a group participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Regular member
    Member,
    /// Group admin
    Admin,
    /// Group creator / super admin
    SuperAdmin,
}

impl ParticipantRole {
    /// Whether the role carries admin rights
    #[must_use]
    pub fn is_admin(self) -> bool {
        matches!(self, Self::Admin | Self::SuperAdmin)
    }
}

/// Group participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant address
    pub id: String,
    /// Role within the group
    pub role: ParticipantRole,
}

/// Group metadata snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupMetadata {
    /// Group subject line
    pub subject: Option<String>,
    /// Current participants
    pub participants: Vec<Participant>,
}

/// Operations the connection library accepts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message; returns the key of the sent message
    async fn send(
        &self,
        chat_id: &ChatId,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError>;
    /// Delete a message for everyone
    async fn delete(&self, key: &MessageKey) -> Result<(), TransportError>;
    /// Fetch a page of history, newest first, older than `before` if given
    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page_size: usize,
        before: Option<String>,
    ) -> Result<Vec<InboundMessage>, TransportError>;
    /// Fetch group metadata
    async fn group_metadata(&self, chat_id: &ChatId) -> Result<GroupMetadata, TransportError>;
}

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// Account logged out; credentials are void
    LoggedOut,
    /// Network drop or server-side close
    ConnectionLost,
    /// Server requested a restart
    RestartRequired,
    /// Anything else reported by the library
    Other(String),
}

impl DisconnectCause {
    /// Every cause other than an explicit logout can be retried
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::LoggedOut)
    }
}

/// Connection lifecycle update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// Handshake in progress
    Connecting,
    /// Handshake complete
    Open {
        /// Address of the connected account
        self_address: String,
    },
    /// Connection closed
    Close(DisconnectCause),
}

/// Event emitted by a live connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lifecycle change
    Connection(ConnectionUpdate),
    /// Credential files in the credential directory changed
    CredentialsUpdated,
    /// New inbound messages
    Messages(Vec<InboundMessage>),
    /// Membership or roles changed in a group
    ParticipantsChanged(ChatId),
}

/// A live connection handle plus its event stream
pub struct Connection {
    /// Command side of the connection
    pub transport: Arc<dyn Transport>,
    /// Event side of the connection
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections backed by a credential directory
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect using (and writing to) `credential_dir`
    async fn connect(&self, credential_dir: &Path) -> Result<Connection, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_covers_every_variant() {
        let cases = [
            (MessageContent::text("hi"), "hi"),
            (
                MessageContent::Image {
                    caption: Some("look".into()),
                },
                "[Image] - look",
            ),
            (MessageContent::Video { caption: None }, "[Video]"),
            (MessageContent::Audio { is_voice: true }, "[Voice Note]"),
            (MessageContent::Audio { is_voice: false }, "[Audio]"),
            (MessageContent::Document { file_name: None }, "[Document: file]"),
            (MessageContent::Sticker, "[Sticker]"),
            (
                MessageContent::Contact {
                    name: Some("Ada".into()),
                },
                "[Contact: Ada]",
            ),
            (MessageContent::Location, "[Location]"),
            (MessageContent::Reaction { emoji: None }, "[Reaction: 👍]"),
            (MessageContent::Poll, "[Poll]"),
            (MessageContent::Unknown, "[Unknown message type]"),
        ];
        for (content, expected) in cases {
            assert_eq!(content.display_text(), expected);
        }
    }

    #[test]
    fn moderation_text_uses_captions_only_for_media() {
        let image = MessageContent::Image {
            caption: Some("caption".into()),
        };
        assert_eq!(image.moderation_text(), "caption");
        assert_eq!(MessageContent::Sticker.moderation_text(), "");
        assert_eq!(
            MessageContent::Document {
                file_name: Some("a.pdf".into())
            }
            .moderation_text(),
            ""
        );
    }

    #[test]
    fn only_logout_is_terminal() {
        assert!(!DisconnectCause::LoggedOut.is_recoverable());
        assert!(DisconnectCause::ConnectionLost.is_recoverable());
        assert!(DisconnectCause::Other("boom".into()).is_recoverable());
    }
}
