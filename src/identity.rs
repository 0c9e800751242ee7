//! Sender identity normalization and chat addressing.
//!
//! Network addresses look like `2348012345678:12@s.whatsapp.net` (device
//! suffix), `2348012345678@s.whatsapp.net` or `98765@lid` (alias domain).
//! All moderation state is keyed by the normalized number, never the raw
//! address.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Domain used for individual user addresses
pub const USER_DOMAIN: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";
const CHANNEL_SUFFIX: &str = "@newsletter";
const ALIAS_SUFFIX: &str = "@lid";
const STATUS_BROADCAST: &str = "status@broadcast";

/// Errors produced while parsing addresses
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Address had no usable identifier part
    #[error("Address has no identifier: {0:?}")]
    EmptyAddress(String),
}

/// Normalized sender identifier (digits / alias id without domain or device)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenderId(String);

impl SenderId {
    /// Normalize a raw network address into a sender id.
    ///
    /// # Errors
    ///
    /// Returns `IdentityError::EmptyAddress` when nothing precedes the
    /// domain/device separators.
    pub fn from_address(address: &str) -> Result<Self, IdentityError> {
        let number = extract_number(address);
        if number.is_empty() {
            return Err(IdentityError::EmptyAddress(address.to_string()));
        }
        Ok(Self(number.to_string()))
    }

    /// Borrow the normalized identifier
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full user address for mentions (`<id>@s.whatsapp.net`)
    #[must_use]
    pub fn to_user_address(&self) -> String {
        format!("{}{USER_DOMAIN}", self.0)
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip the domain and device suffix from an address.
#[must_use]
pub fn extract_number(address: &str) -> &str {
    let local = address.split('@').next().unwrap_or_default();
    local.split(':').next().unwrap_or_default().trim()
}

/// Whether two addresses belong to the same user
#[must_use]
pub fn is_same_user(a: &str, b: &str) -> bool {
    let left = extract_number(a);
    !left.is_empty() && left == extract_number(b)
}

/// Kind of conversation a chat address refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    /// Multi-user group
    Group,
    /// One-to-one conversation
    Private,
    /// Broadcast channel
    Channel,
    /// Status broadcast feed
    Status,
}

/// Chat address as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Wrap a raw chat address
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the raw address
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Classify the chat
    #[must_use]
    pub fn kind(&self) -> ChatKind {
        if self.0 == STATUS_BROADCAST {
            ChatKind::Status
        } else if self.0.ends_with(GROUP_SUFFIX) {
            ChatKind::Group
        } else if self.0.ends_with(CHANNEL_SUFFIX) {
            ChatKind::Channel
        } else {
            ChatKind::Private
        }
    }

    /// Whether this is a group chat
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.kind() == ChatKind::Group
    }

    /// Address replies should be sent to.
    ///
    /// Groups reply in place; private chats reply to the normalized user
    /// address, except alias addresses which must be kept verbatim.
    #[must_use]
    pub fn reply_target(&self) -> Self {
        if self.kind() != ChatKind::Private || self.0.ends_with(ALIAS_SUFFIX) {
            return self.clone();
        }
        Self(format!("{}{USER_DOMAIN}", extract_number(&self.0)))
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_device_and_domain() {
        let a = SenderId::from_address("2348012345678:12@s.whatsapp.net");
        let b = SenderId::from_address("2348012345678@s.whatsapp.net");
        assert_eq!(a, b);
        assert_eq!(
            SenderId::from_address("2348012345678").map(|s| s.to_string()),
            Ok("2348012345678".to_string())
        );
    }

    #[test]
    fn rejects_empty_address() {
        assert!(SenderId::from_address("@s.whatsapp.net").is_err());
        assert!(SenderId::from_address("").is_err());
    }

    #[test]
    fn same_user_ignores_suffixes() {
        assert!(is_same_user("111:3@s.whatsapp.net", "111@lid"));
        assert!(!is_same_user("111@s.whatsapp.net", "112@s.whatsapp.net"));
        assert!(!is_same_user("", ""));
    }

    #[test]
    fn classifies_chats() {
        assert_eq!(ChatId::new("123-456@g.us").kind(), ChatKind::Group);
        assert_eq!(ChatId::new("1203@newsletter").kind(), ChatKind::Channel);
        assert_eq!(ChatId::new("status@broadcast").kind(), ChatKind::Status);
        assert_eq!(ChatId::new("111@s.whatsapp.net").kind(), ChatKind::Private);
    }

    #[test]
    fn reply_target_keeps_alias_addresses() {
        assert_eq!(
            ChatId::new("111:4@s.whatsapp.net").reply_target(),
            ChatId::new("111@s.whatsapp.net")
        );
        assert_eq!(ChatId::new("987@lid").reply_target(), ChatId::new("987@lid"));
        assert_eq!(ChatId::new("1-2@g.us").reply_target(), ChatId::new("1-2@g.us"));
    }
}
