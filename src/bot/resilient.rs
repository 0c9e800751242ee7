//! Outgoing messages with automatic retry on transient transport failures.

use crate::identity::ChatId;
use crate::transport::{MessageKey, OutgoingMessage, Transport, TransportError};
use tracing::{debug, warn};

/// Send a message, retrying with exponential backoff.
///
/// Uses [`crate::utils::retry_transport_operation`]. `NotFound` and
/// `Forbidden` are not retried: the chat is gone or we lack rights.
///
/// # Errors
///
/// Returns the last transport error once retries are exhausted.
pub async fn send_message_resilient(
    transport: &dyn Transport,
    chat_id: &ChatId,
    message: OutgoingMessage,
) -> Result<MessageKey, TransportError> {
    crate::utils::retry_transport_operation(|| {
        let message = message.clone();
        async move {
            match transport.send(chat_id, message).await {
                Ok(key) => Ok(Ok(key)),
                Err(e @ (TransportError::NotFound | TransportError::Forbidden(_))) => Ok(Err(e)),
                Err(e) => Err(e),
            }
        }
    })
    .await?
}

/// Send a message, logging instead of failing.
///
/// Returns the key of the sent message when it went out.
pub async fn send_safe(
    transport: &dyn Transport,
    chat_id: &ChatId,
    message: OutgoingMessage,
) -> Option<MessageKey> {
    match send_message_resilient(transport, chat_id, message).await {
        Ok(key) => Some(key),
        Err(TransportError::NotFound) => {
            debug!(chat = %chat_id, "Chat vanished before reply");
            None
        }
        Err(e) => {
            warn!(chat = %chat_id, error = %e, "Failed to send message after retries");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use mockall::Sequence;

    fn sent_key(chat: &ChatId) -> MessageKey {
        MessageKey {
            chat_id: chat.clone(),
            id: "SENT1".into(),
            from_me: true,
            participant: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failure() -> Result<(), TransportError> {
        let chat = ChatId::new("1-2@g.us");
        let expected = sent_key(&chat);
        let returned = expected.clone();

        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(TransportError::Closed));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(returned.clone()));

        let key = send_message_resilient(&transport, &chat, OutgoingMessage::text("hi")).await?;
        assert_eq!(key, expected);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_is_not_retried() {
        let chat = ChatId::new("1-2@g.us");
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| Err(TransportError::Forbidden("not admin".into())));

        assert!(send_safe(&transport, &chat, OutgoingMessage::text("hi")).await.is_none());
    }
}
