use super::{ChatProvider, ProviderError, with_timeout};
use crate::config::ProviderConfig;
use crate::models::{ChatMeta, Message, UserMeta};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// JSON client for a chat provider gateway.
#[derive(Clone)]
pub struct HttpProvider {
    http: reqwest::Client,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct ChatList {
    chat_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct History {
    messages: Vec<Message>,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent("chat-archiver/0.1")
            .build()?;

        Ok(Self {
            http: client,
            config,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: String,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let mut request = self.http.get(self.endpoint(&path)).query(query);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let call = async {
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                return Err(ProviderError::NotFound(path.clone()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Status { status, body });
            }

            let body = response.bytes().await?;
            Ok(serde_json::from_slice(&body)?)
        };

        with_timeout(self.config.request_timeout, call).await
    }
}

impl ChatProvider for HttpProvider {
    async fn list_chats(&self, limit: usize) -> Result<Vec<i64>, ProviderError> {
        let list: ChatList = self
            .get_json("/chats".to_string(), &[("limit", limit.to_string())])
            .await?;
        Ok(list.chat_ids)
    }

    async fn get_chat(&self, chat_id: i64) -> Result<ChatMeta, ProviderError> {
        self.get_json(format!("/chats/{chat_id}"), &[]).await
    }

    async fn get_chat_history(
        &self,
        chat_id: i64,
        from_message_id: i64,
        offset: i32,
        limit: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        let history: History = self
            .get_json(
                format!("/chats/{chat_id}/history"),
                &[
                    ("from_message_id", from_message_id.to_string()),
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        Ok(history.messages)
    }

    async fn get_user(&self, user_id: i64) -> Result<UserMeta, ProviderError> {
        self.get_json(format!("/users/{user_id}"), &[]).await
    }
}
