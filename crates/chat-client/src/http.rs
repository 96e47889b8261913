use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chat_core::{
    ChatApi, ChatError, ChatErrorCategory, Conversation, HistoryOrder, HistoryPage, PeerProfile,
    classify_http_status,
};
use chat_platform::AuthTokenProvider;
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::wire::{decode_conversations, decode_history, decode_user, decode_users};

/// REST collaborator backed by `reqwest`.
#[derive(Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn AuthTokenProvider>,
    history_order: HistoryOrder,
}

impl HttpChatApi {
    pub fn new(base_url: &str, tokens: Arc<dyn AuthTokenProvider>) -> Result<Self, ChatError> {
        let base_url = Url::parse(base_url.trim()).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_api_url",
                format!("invalid API base URL '{base_url}': {err}"),
            )
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_api_url",
                format!("API base URL '{base_url}' must be an http(s) URL"),
            ));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            tokens,
            history_order: HistoryOrder::Unspecified,
        })
    }

    /// Declare the order the history endpoint returns records in.
    pub fn with_history_order(mut self, order: HistoryOrder) -> Self {
        self.history_order = order;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                ChatError::new(
                    ChatErrorCategory::Config,
                    "invalid_api_url",
                    "API base URL cannot carry a path",
                )
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, url: Url, query: &[(&str, String)]) -> Result<Value, ChatError> {
        let mut request = self.client.get(url.clone()).query(query);
        if let Some(token) = self.tokens.bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            ChatError::network("request_failed", format!("GET {} failed: {err}", url.path()))
        })?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            warn!(path = url.path(), status = status.as_u16(), "REST request rejected");
            return Err(error_for_status(status, retry_after));
        }

        let body = response.bytes().await.map_err(|err| {
            ChatError::network("request_failed", format!("reading {} failed: {err}", url.path()))
        })?;
        match serde_json::from_slice::<Value>(&body) {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(
                    path = url.path(),
                    error = %err,
                    "malformed response body; treating as empty"
                );
                Ok(Value::Null)
            }
        }
    }
}

fn error_for_status(status: StatusCode, retry_after: Option<Duration>) -> ChatError {
    let error = ChatError::new(
        classify_http_status(status.as_u16()),
        format!("http_{}", status.as_u16()),
        format!(
            "server responded {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .trim_end()
        .to_owned(),
    );
    match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(
        &self,
        peer_id: &str,
        limit: u16,
        skip: u32,
    ) -> Result<HistoryPage, ChatError> {
        let url = self.endpoint(&["chat", "history", peer_id])?;
        let body = self
            .get_json(
                url,
                &[("limit", limit.to_string()), ("skip", skip.to_string())],
            )
            .await?;
        Ok(decode_history(body, self.history_order))
    }

    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let url = self.endpoint(&["chat", "conversations"])?;
        Ok(decode_conversations(self.get_json(url, &[]).await?))
    }

    async fn search_users(&self, query: &str) -> Result<Vec<PeerProfile>, ChatError> {
        let query = query.trim();
        let body = if query.is_empty() {
            self.get_json(self.endpoint(&["users", "verified"])?, &[])
                .await?
        } else {
            self.get_json(self.endpoint(&["users", "search"])?, &[("q", query.to_owned())])
                .await?
        };
        Ok(decode_users(body))
    }

    async fn fetch_user(&self, user_id: &str) -> Result<PeerProfile, ChatError> {
        let body = self.get_json(self.endpoint(&["users", user_id])?, &[]).await?;
        decode_user(body).ok_or_else(|| {
            ChatError::new(
                ChatErrorCategory::Serialization,
                "malformed_user",
                format!("directory record for '{user_id}' could not be decoded"),
            )
        })
    }
}
