use std::future::Future;
use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use tracing::{debug, warn};

use pawlink_types::api::{ChatSummary, HistoryResponse, InitiateChatRequest, InitiateChatResponse};
use pawlink_types::{ChatMessage, RoomId};

use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::token::TokenStore;

/// Anything that can produce the persisted history of a room.
pub trait HistorySource: Clone + Send + Sync + 'static {
    fn fetch_history(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<Vec<ChatMessage>>> + Send;
}

/// REST client for the chat endpoints of the marketplace API.
#[derive(Clone)]
pub struct ChatApi {
    client: Client,
    base: Url,
    tokens: Arc<dyn TokenStore>,
}

impl ChatApi {
    pub fn new(config: &ChatConfig, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let base = Url::parse(&config.api_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ChatError::Config {
                key: "PAWLINK_API_URL",
                value: config.api_url.clone(),
            })?;

        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            client,
            base,
            tokens,
        })
    }

    /// GET /chat/{roomId}
    pub async fn history(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        let resp = self
            .request(Method::GET, &["chat", room_id.as_str()])
            .send()
            .await?;
        let body: HistoryResponse = self.check(resp, "history")?.json().await?;

        debug!("Fetched {} history messages for room {}", body.messages.len(), room_id);

        Ok(body
            .messages
            .into_iter()
            .map(|entry| entry.into_message(room_id))
            .collect())
    }

    /// POST /chat/initiate. Returns the room to join for this pet.
    pub async fn initiate(&self, pet_id: &str) -> Result<RoomId> {
        let resp = self
            .request(Method::POST, &["chat", "initiate"])
            .json(&InitiateChatRequest {
                pet_id: pet_id.to_string(),
            })
            .send()
            .await?;
        let body: InitiateChatResponse = self.check(resp, "initiate")?.json().await?;
        Ok(body.chat_id)
    }

    /// GET /chat
    pub async fn list(&self) -> Result<Vec<ChatSummary>> {
        let resp = self.request(Method::GET, &["chat"]).send().await?;
        Ok(self.check(resp, "chat list")?.json().await?)
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }

        let req = self.client.request(method, url);
        match self.tokens.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Maps non-success statuses to errors. A 401 drops the stored token,
    /// whatever endpoint it came from.
    fn check(&self, resp: Response, context: &'static str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!("{} rejected our token, clearing stored credentials", context);
            if let Err(e) = self.tokens.clear() {
                warn!("Failed to clear token: {}", e);
            }
            return Err(ChatError::Unauthorized);
        }

        Err(ChatError::Status { context, status })
    }
}

impl HistorySource for ChatApi {
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>> {
        self.history(room_id).await
    }
}
