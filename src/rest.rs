// REST collaborator
// Create-message is the delivery fallback; the fetches feed conversation
// history and the conversation list. Every call carries the bearer token; a
// 401/403 triggers one token refresh and one retry before giving up.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::error::{SyncError, SyncResult};
use crate::models::{ConversationSummary, Message, NewMessage, PageRequest};
use crate::wire;

pub const MESSAGES_PATH: &str = "api/messages";
pub const CONVERSATION_PATH: &str = "api/messages/conversation";
pub const CONVERSATIONS_PATH: &str = "api/messages/conversations";
pub const USER_MESSAGES_PATH: &str = "api/messages/user";

#[async_trait]
pub trait MessageApi: Send + Sync {
    async fn create_message(&self, draft: &NewMessage) -> SyncResult<Message>;

    async fn fetch_conversation(&self, peer_id: &str, page: PageRequest) -> SyncResult<Vec<Message>>;

    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationSummary>>;

    async fn fetch_user_messages(&self) -> SyncResult<Vec<Message>>;
}

/// Where the bearer token comes from. Refreshing is the host application's job.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn current(&self) -> String;

    async fn refresh(&self) -> SyncResult<String>;
}

/// A token that cannot be refreshed; a rejected token means logging out.
pub struct StaticToken {
    token: Mutex<String>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken {
            token: Mutex::new(token.into()),
        }
    }

    pub fn replace(&self, token: impl Into<String>) {
        if let Ok(mut current) = self.token.lock() {
            *current = token.into();
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    fn current(&self) -> String {
        self.token.lock().map(|t| t.clone()).unwrap_or_default()
    }

    async fn refresh(&self) -> SyncResult<String> {
        Err(SyncError::Unauthorized)
    }
}

pub struct RestClient {
    http: Client,
    base: Url,
    tokens: Arc<dyn TokenSource>,
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

impl RestClient {
    pub fn new(api_url: &str, tokens: Arc<dyn TokenSource>) -> SyncResult<Self> {
        let mut base = Url::parse(api_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(RestClient {
            http: Client::new(),
            base,
            tokens,
        })
    }

    pub fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path)?)
    }

    /// Send with the current token; on 401/403 refresh once and retry once.
    async fn send_authorized<F>(&self, build: F) -> SyncResult<Value>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let token = self.tokens.current();
        let response = build(&token).send().await?;
        if !is_auth_failure(response.status()) {
            return Self::read_json(response).await;
        }

        warn!("Request rejected with {}, refreshing token", response.status());
        let token = match self.tokens.refresh().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return Err(SyncError::Unauthorized);
            }
        };
        let retry = build(&token).send().await?;
        if is_auth_failure(retry.status()) {
            warn!("Request still rejected after token refresh");
            return Err(SyncError::Unauthorized);
        }
        Self::read_json(retry).await
    }

    async fn read_json(response: Response) -> SyncResult<Value> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!("HTTP {} with {} bytes", status, body.len());
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Unwrap `{message: {...}}` / `{data: {...}}` around a single object.
fn single_object(value: &Value) -> &Value {
    ["message", "data"]
        .iter()
        .find_map(|key| value.get(*key).filter(|inner| inner.is_object()))
        .unwrap_or(value)
}

#[async_trait]
impl MessageApi for RestClient {
    async fn create_message(&self, draft: &NewMessage) -> SyncResult<Message> {
        let url = self.endpoint(MESSAGES_PATH)?;
        let value = self
            .send_authorized(|token| self.http.post(url.clone()).bearer_auth(token).json(draft))
            .await?;
        wire::message_from_value(single_object(&value))
    }

    async fn fetch_conversation(&self, peer_id: &str, page: PageRequest) -> SyncResult<Vec<Message>> {
        let mut url = self.endpoint(&format!("{}/{}", CONVERSATION_PATH, peer_id))?;
        url.query_pairs_mut()
            .append_pair("limit", &page.limit.to_string())
            .append_pair("page", &page.page.to_string());
        let value = self
            .send_authorized(|token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        wire::messages_from_list(&value)
    }

    async fn fetch_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        let url = self.endpoint(CONVERSATIONS_PATH)?;
        let value = self
            .send_authorized(|token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        wire::conversations_from_list(&value)
    }

    async fn fetch_user_messages(&self) -> SyncResult<Vec<Message>> {
        let url = self.endpoint(USER_MESSAGES_PATH)?;
        let value = self
            .send_authorized(|token| self.http.get(url.clone()).bearer_auth(token))
            .await?;
        wire::messages_from_list(&value)
    }
}
