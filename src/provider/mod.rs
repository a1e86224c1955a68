//! Boundary to the remote chat service.
//!
//! The crawl only needs four read calls. Every call may block for a long time
//! and may fail; implementations bound each call with [`with_timeout`].

pub mod http;

use crate::models::{ChatMeta, Message, UserMeta};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub use http::HttpProvider;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("provider HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider error: {0}")]
    Backend(String),
}

pub trait ChatProvider: Send + Sync + 'static {
    /// Remote ids of the chats in the main chat list, most recent first.
    fn list_chats(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<i64>, ProviderError>> + Send;

    fn get_chat(&self, chat_id: i64)
    -> impl Future<Output = Result<ChatMeta, ProviderError>> + Send;

    /// Up to `limit` messages, newest first, starting at `from_message_id`
    /// (`0` = latest). A negative `offset` also returns up to `-offset`
    /// messages newer than `from_message_id`.
    fn get_chat_history(
        &self,
        chat_id: i64,
        from_message_id: i64,
        offset: i32,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Message>, ProviderError>> + Send;

    fn get_user(&self, user_id: i64)
    -> impl Future<Output = Result<UserMeta, ProviderError>> + Send;
}

/// Run a provider call, failing with `Timeout` once `timeout` elapses.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(result.expect("value"), 7);
    }

    #[tokio::test]
    async fn test_with_timeout_reports_elapsed_call() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProviderError>(())
        };

        let result = with_timeout(Duration::from_millis(10), slow).await;
        assert!(matches!(result, Err(ProviderError::Timeout(d)) if d == Duration::from_millis(10)));
    }
}
