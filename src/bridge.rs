//! Subprocess bridge to the network connection library.
//!
//! The bridge is launched as `<command> --auth-dir <dir>` and speaks one JSON
//! object per line. It writes events to stdout:
//!
//! ```text
//! {"event":"connecting"}
//! {"event":"open","self_address":"2348012345678:4@s.whatsapp.net"}
//! {"event":"close","cause":"connection_lost"}
//! {"event":"credentials_updated"}
//! {"event":"messages","messages":[...]}
//! {"event":"group_participants","chat_id":"1203630@g.us"}
//! {"event":"response","id":7,"result":{...}}
//! {"event":"response","id":8,"error":{"kind":"not_found","message":""}}
//! ```
//!
//! and reads requests from stdin (`{"id":7,"op":"send",...}`). It is expected
//! to exit once its stdin closes.

use crate::config::{BRIDGE_EVENT_BUFFER, BRIDGE_REQUEST_TIMEOUT_SECS};
use crate::identity::ChatId;
use crate::transport::{
    Connection, ConnectionUpdate, Connector, DisconnectCause, GroupMetadata, InboundMessage,
    MessageKey, OutgoingMessage, Transport, TransportError, TransportEvent,
};
use crate::utils::preview;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Connecting,
    Open {
        self_address: String,
    },
    Close {
        cause: String,
        #[serde(default)]
        detail: Option<String>,
    },
    CredentialsUpdated,
    Messages {
        messages: Vec<InboundMessage>,
    },
    GroupParticipants {
        chat_id: ChatId,
    },
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<BridgeFault>,
    },
}

#[derive(Debug, Deserialize)]
struct BridgeFault {
    kind: String,
    #[serde(default)]
    message: String,
}

impl From<BridgeFault> for TransportError {
    fn from(fault: BridgeFault) -> Self {
        match fault.kind.as_str() {
            "not_found" => Self::NotFound,
            "forbidden" => Self::Forbidden(fault.message),
            "closed" => Self::Closed,
            _ => Self::Request(fault.message),
        }
    }
}

fn disconnect_cause(cause: &str, detail: Option<String>) -> DisconnectCause {
    match cause {
        "logged_out" => DisconnectCause::LoggedOut,
        "connection_lost" => DisconnectCause::ConnectionLost,
        "restart_required" => DisconnectCause::RestartRequired,
        other => DisconnectCause::Other(detail.unwrap_or_else(|| other.to_string())),
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum BridgeOp<'a> {
    Send {
        chat_id: &'a ChatId,
        message: &'a OutgoingMessage,
    },
    Delete {
        key: &'a MessageKey,
    },
    FetchHistory {
        chat_id: &'a ChatId,
        page_size: usize,
        before: Option<&'a str>,
    },
    GroupMetadata {
        chat_id: &'a ChatId,
    },
}

#[derive(Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    #[serde(flatten)]
    op: BridgeOp<'a>,
}

/// Command side of a running bridge
struct BridgeTransport {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Pending,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl BridgeTransport {
    async fn call<T: DeserializeOwned>(&self, op: BridgeOp<'_>) -> Result<T, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&BridgeRequest { id, op })
            .map_err(|e| TransportError::Request(e.to_string()))?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            let written = match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                self.pending.lock().remove(&id);
                debug!(error = %e, "Bridge stdin closed");
                return Err(TransportError::Closed);
            }
        }

        let result = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Request(format!("request {id} timed out")));
            }
        };
        serde_json::from_value(result).map_err(|e| TransportError::Request(e.to_string()))
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn send(
        &self,
        chat_id: &ChatId,
        message: OutgoingMessage,
    ) -> Result<MessageKey, TransportError> {
        self.call(BridgeOp::Send {
            chat_id,
            message: &message,
        })
        .await
    }

    async fn delete(&self, key: &MessageKey) -> Result<(), TransportError> {
        self.call(BridgeOp::Delete { key }).await
    }

    async fn fetch_history(
        &self,
        chat_id: &ChatId,
        page_size: usize,
        before: Option<String>,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.call(BridgeOp::FetchHistory {
            chat_id,
            page_size,
            before: before.as_deref(),
        })
        .await
    }

    async fn group_metadata(&self, chat_id: &ChatId) -> Result<GroupMetadata, TransportError> {
        self.call(BridgeOp::GroupMetadata { chat_id }).await
    }
}

/// Launches the bridge process for each connection attempt
#[derive(Debug, Clone)]
pub struct BridgeConnector {
    program: String,
    args: Vec<String>,
    request_timeout: Duration,
}

impl BridgeConnector {
    /// Parse a whitespace separated command line. Returns `None` when empty.
    #[must_use]
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            request_timeout: Duration::from_secs(BRIDGE_REQUEST_TIMEOUT_SECS),
        })
    }

    /// Explicit program and arguments
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            request_timeout: Duration::from_secs(BRIDGE_REQUEST_TIMEOUT_SECS),
        }
    }

    /// Override the per-request timeout
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, credential_dir: &Path) -> Result<Connection, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--auth-dir")
            .arg(credential_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Request(format!("spawn {}: {e}", self.program)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Request("bridge stdio unavailable".into()));
        };
        info!(program = %self.program, pid = ?child.id(), "🔌 Bridge started");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (backlog_tx, backlog_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(BRIDGE_EVENT_BUFFER);
        tokio::spawn(forward(backlog_rx, events_tx));
        tokio::spawn(pump(child, stdout, backlog_tx, Arc::clone(&pending)));

        let transport = BridgeTransport {
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: self.request_timeout,
        };
        Ok(Connection {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

/// Move events from the reader's backlog to the consumer at its own pace.
///
/// The reader never waits on the consumer, so responses keep flowing to
/// pending requests while the consumer is busy.
async fn forward(
    mut backlog: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(event) = backlog.recv().await {
        if events.send(event).await.is_err() {
            debug!("Event receiver dropped");
            break;
        }
    }
}

/// Route bridge output until it closes, then fail whatever is still pending.
async fn pump(
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<TransportEvent>,
    pending: Pending,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Bridge stdout read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<BridgeEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, line = %preview(&line, 80), "Unreadable bridge line");
                continue;
            }
        };
        let forwarded = match event {
            BridgeEvent::Response { id, result, error } => {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(error.map_or(Ok(result), |fault| Err(fault.into())));
                }
                continue;
            }
            BridgeEvent::Connecting => TransportEvent::Connection(ConnectionUpdate::Connecting),
            BridgeEvent::Open { self_address } => {
                TransportEvent::Connection(ConnectionUpdate::Open { self_address })
            }
            BridgeEvent::Close { cause, detail } => {
                TransportEvent::Connection(ConnectionUpdate::Close(disconnect_cause(&cause, detail)))
            }
            BridgeEvent::CredentialsUpdated => TransportEvent::CredentialsUpdated,
            BridgeEvent::Messages { messages } => TransportEvent::Messages(messages),
            BridgeEvent::GroupParticipants { chat_id } => {
                TransportEvent::ParticipantsChanged(chat_id)
            }
        };
        if events.send(forwarded).is_err() {
            debug!("Event receiver dropped, stopping bridge");
            break;
        }
    }

    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err(TransportError::Closed));
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Bridge already exited");
    }
    match child.wait().await {
        Ok(status) => info!(%status, "🔌 Bridge exited"),
        Err(e) => warn!(error = %e, "Failed to reap bridge process"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_parses_event_lines() -> Result<(), serde_json::Error> {
        let open: BridgeEvent =
            serde_json::from_str(r#"{"event":"open","self_address":"999:2@s.whatsapp.net"}"#)?;
        assert!(matches!(open, BridgeEvent::Open { self_address } if self_address == "999:2@s.whatsapp.net"));

        let response: BridgeEvent = serde_json::from_str(
            r#"{"event":"response","id":3,"error":{"kind":"not_found"}}"#,
        )?;
        let BridgeEvent::Response { id, error: Some(fault), .. } = response else {
            panic!("expected an error response");
        };
        assert_eq!(id, 3);
        assert_eq!(TransportError::from(fault), TransportError::NotFound);

        let changed: BridgeEvent =
            serde_json::from_str(r#"{"event":"group_participants","chat_id":"1-2@g.us"}"#)?;
        assert!(matches!(changed, BridgeEvent::GroupParticipants { chat_id } if chat_id.as_str() == "1-2@g.us"));
        Ok(())
    }

    #[test]
    fn test_close_causes() {
        assert_eq!(disconnect_cause("logged_out", None), DisconnectCause::LoggedOut);
        assert_eq!(
            disconnect_cause("stream_error", Some("boom".into())),
            DisconnectCause::Other("boom".into())
        );
    }

    #[test]
    fn test_request_shape() -> Result<(), serde_json::Error> {
        let chat = ChatId::new("1-2@g.us");
        let json = serde_json::to_value(BridgeRequest {
            id: 9,
            op: BridgeOp::GroupMetadata { chat_id: &chat },
        })?;
        assert_eq!(
            json,
            serde_json::json!({"id": 9, "op": "group_metadata", "chat_id": "1-2@g.us"})
        );
        Ok(())
    }

    #[test]
    fn test_empty_command_line() {
        assert!(BridgeConnector::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_round_trip_through_shell_bridge() -> Result<(), Box<dyn Error>> {
        let script = r#"
echo '{"event":"open","self_address":"999@s.whatsapp.net"}'
read request
echo '{"event":"response","id":1,"result":{"chat_id":"1-2@g.us","id":"S1","from_me":true,"participant":null}}'
read request
"#;
        let dir = tempfile::tempdir()?;
        let connector = BridgeConnector::new("sh", vec!["-c".into(), script.into()]);
        let mut connection = connector.connect(dir.path()).await?;

        let Some(TransportEvent::Connection(ConnectionUpdate::Open { self_address })) =
            connection.events.recv().await
        else {
            panic!("expected open event");
        };
        assert_eq!(self_address, "999@s.whatsapp.net");

        let key = connection
            .transport
            .send(&ChatId::new("1-2@g.us"), OutgoingMessage::text("hi"))
            .await?;
        assert_eq!(key.id, "S1");

        // Second request gets no answer; the script exits and the call fails closed
        let result = connection.transport.delete(&key).await;
        assert_eq!(result, Err(TransportError::Closed));
        Ok(())
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let connector = BridgeConnector::new("sh", vec!["-c".into(), "read request; sleep 5".into()])
            .with_request_timeout(Duration::from_millis(100));
        let connection = connector.connect(dir.path()).await?;

        let result = connection
            .transport
            .group_metadata(&ChatId::new("1-2@g.us"))
            .await;
        assert!(matches!(result, Err(TransportError::Request(msg)) if msg.contains("timed out")));
        Ok(())
    }

    #[tokio::test]
    async fn test_responses_flow_while_events_back_up() -> Result<(), Box<dyn Error>> {
        // More events than the consumer buffer holds, none of them read yet
        let script = r#"
i=0
while [ $i -lt 300 ]; do
  echo '{"event":"credentials_updated"}'
  i=$((i+1))
done
read request
echo '{"event":"response","id":1,"result":{"subject":"team","participants":[]}}'
read request
"#;
        let dir = tempfile::tempdir()?;
        let connector = BridgeConnector::new("sh", vec!["-c".into(), script.into()])
            .with_request_timeout(Duration::from_secs(5));
        let mut connection = connector.connect(dir.path()).await?;

        assert!(matches!(
            connection.events.recv().await,
            Some(TransportEvent::CredentialsUpdated)
        ));
        let metadata = connection
            .transport
            .group_metadata(&ChatId::new("1-2@g.us"))
            .await?;
        assert_eq!(metadata.subject.as_deref(), Some("team"));

        // Nothing was dropped on the way
        let mut remaining = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), connection.events.recv()).await
        {
            assert!(matches!(event, TransportEvent::CredentialsUpdated));
            remaining += 1;
            if remaining == 299 {
                break;
            }
        }
        assert_eq!(remaining, 299);
        Ok(())
    }
}
