//! Retry helpers and small string utilities.

use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Truncate a string to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Short single-line preview of message text for logs.
#[must_use]
pub fn preview(s: &str, max_chars: usize) -> String {
    let flat = s.replace(['\n', '\r'], " ");
    let truncated = truncate_str(&flat, max_chars);
    if truncated.len() < flat.len() {
        format!("{truncated}…")
    } else {
        truncated.to_string()
    }
}

/// Character count as seen by users (Unicode scalar values).
#[must_use]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

async fn retry_with_backoff<F, Fut, T, E>(
    label: &str,
    initial_ms: u64,
    max_ms: u64,
    retries: usize,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let retry_strategy = ExponentialBackoff::from_millis(initial_ms)
        .max_delay(Duration::from_millis(max_ms))
        .map(jitter) // Add jitter to prevent thundering herd
        .take(retries);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!("{label} failed after {retries} retries: {e}");
        e
    })
}

/// Retry a durable store operation with exponential backoff.
///
/// Only use for idempotent operations (upserts, reads, deletes by key).
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn retry_store_operation<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    use crate::config::{
        STORE_API_INITIAL_BACKOFF_MS, STORE_API_MAX_BACKOFF_MS, STORE_API_MAX_RETRIES,
    };

    retry_with_backoff(
        "Store operation",
        STORE_API_INITIAL_BACKOFF_MS,
        STORE_API_MAX_BACKOFF_MS,
        STORE_API_MAX_RETRIES,
        operation,
    )
    .await
}

/// Retry an outgoing transport send with exponential backoff.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn retry_transport_operation<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    use crate::config::{
        TRANSPORT_SEND_INITIAL_BACKOFF_MS, TRANSPORT_SEND_MAX_BACKOFF_MS,
        TRANSPORT_SEND_MAX_RETRIES,
    };

    retry_with_backoff(
        "Transport send",
        TRANSPORT_SEND_INITIAL_BACKOFF_MS,
        TRANSPORT_SEND_MAX_BACKOFF_MS,
        TRANSPORT_SEND_MAX_RETRIES,
        operation,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_truncate_str_unicode() {
        let s = "Привет, мир!";
        assert_eq!(truncate_str(s, 6), "Привет");
        assert_eq!(truncate_str(s, 50), "Привет, мир!");
    }

    #[test]
    fn test_preview_flattens_and_marks_truncation() {
        assert_eq!(preview("a\nb", 10), "a b");
        assert_eq!(preview("abcdef", 3), "abc…");
    }

    #[test]
    fn test_char_len_counts_scalars() {
        assert_eq!(char_len("héllo"), 5);
        assert_eq!(char_len(""), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failure() {
        let attempts = AtomicUsize::new(0);
        let result: Result<&str, String> = retry_store_operation(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("transient".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), String> = retry_transport_operation(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            crate::config::TRANSPORT_SEND_MAX_RETRIES + 1
        );
    }
}
