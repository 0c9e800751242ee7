//! Shared fixtures: an in-process transport that records what it was asked
//! to do, and a connector that replays scripted connection events.

#![allow(dead_code)]

use async_trait::async_trait;
use chatguard::identity::ChatId;
use chatguard::transport::{
    Connection, Connector, GroupMetadata, InboundMessage, MessageContent, MessageKey,
    OutgoingMessage, Participant, ParticipantRole, Transport, TransportError, TransportEvent,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const GROUP: &str = "120363000000000001@g.us";
pub const SPAMMER: &str = "2348012345678";
pub const ADMIN: &str = "2348000000001";

/// Transport double recording sends and deletes
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<(ChatId, OutgoingMessage)>>,
    pub deleted: Mutex<Vec<MessageKey>>,
    pub admins: Mutex<Vec<String>>,
    /// Full history, newest first
    pub history: Mutex<Vec<InboundMessage>>,
    pub history_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeTransport {
    pub fn with_admins(admins: &[&str]) -> Self {
        let transport = Self::default();
        *transport.admins.lock() = admins
            .iter()
            .map(|a| format!("{a}@s.whatsapp.net"))
            .collect();
        transport
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, m)| m.text.clone()).collect()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().iter().map(|k| k.id.clone()).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(
        &self,
        chat_id: &ChatId,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((chat_id.clone(), message));
        Ok(MessageKey {
            chat_id: chat_id.clone(),
            id: format!("BOT{n}"),
            from_me: true,
            participant: None,
        })
    }

    async fn delete(&self, key: &MessageKey) -> Result<(), TransportError> {
        self.deleted.lock().push(key.clone());
        Ok(())
    }

    async fn fetch_history(
        &self,
        _chat_id: &ChatId,
        page_size: usize,
        before: Option<String>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let history = self.history.lock();
        let start = match before {
            Some(id) => history
                .iter()
                .position(|m| m.key.id == id)
                .map_or(history.len(), |i| i + 1),
            None => 0,
        };
        Ok(history.iter().skip(start).take(page_size).cloned().collect())
    }

    async fn group_metadata(&self, _chat_id: &ChatId) -> Result<GroupMetadata, TransportError> {
        let participants = self
            .admins
            .lock()
            .iter()
            .map(|id| Participant {
                id: id.clone(),
                role: ParticipantRole::Admin,
            })
            .collect();
        Ok(GroupMetadata {
            subject: Some("Test group".into()),
            participants,
        })
    }
}

/// Text message from `sender` (digits) in `chat`
pub fn text_message(
    chat: &str,
    sender: &str,
    id: &str,
    text: &str,
    at: DateTime<Utc>,
) -> InboundMessage {
    let address = format!("{sender}@s.whatsapp.net");
    InboundMessage::new(
        MessageKey {
            chat_id: ChatId::new(chat),
            id: id.to_string(),
            from_me: false,
            participant: Some(address.clone()),
        },
        address,
        MessageContent::text(text),
        at,
    )
}

/// One step of a scripted connection
#[derive(Debug, Clone)]
pub enum Step {
    /// Write a file into the credential directory, as the library would
    WriteFile(&'static str, &'static str),
    /// Emit an event
    Emit(TransportEvent),
    /// Real-time pause
    Sleep(Duration),
    /// Keep the connection open until the receiver goes away
    Hold,
}

/// Connector replaying one script per connection attempt
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    pub transport: Arc<FakeTransport>,
    pub connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            transport: Arc::new(FakeTransport::default()),
            connects: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, credential_dir: &Path) -> Result<Connection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let Some(script) = self.scripts.lock().pop_front() else {
            return Err(TransportError::Request("no more scripted connections".into()));
        };
        let (tx, rx) = mpsc::channel(32);
        let dir = credential_dir.to_path_buf();
        tokio::spawn(async move {
            for step in script {
                match step {
                    Step::WriteFile(name, contents) => {
                        if tokio::fs::write(dir.join(name), contents).await.is_err() {
                            return;
                        }
                    }
                    Step::Emit(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Step::Sleep(delay) => tokio::time::sleep(delay).await,
                    Step::Hold => {
                        tx.closed().await;
                        return;
                    }
                }
            }
        });
        let transport: Arc<dyn Transport> = self.transport.clone();
        Ok(Connection {
            transport,
            events: rx,
        })
    }
}
