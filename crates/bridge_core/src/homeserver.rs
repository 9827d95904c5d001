use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::domain::{ContentUri, EventId, PresenceState, RoomId, UserId};
use url::Url;
use uuid::Uuid;

use crate::{Intent, IntentProvider};

#[derive(Debug, Deserialize)]
struct SendEventResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

#[derive(Debug, Serialize)]
struct TypingRequest {
    typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

/// Client-server API access as one appservice-managed user.
#[derive(Clone)]
pub struct HomeserverIntent {
    http: Client,
    base_url: Url,
    as_token: String,
    user_id: UserId,
}

impl HomeserverIntent {
    pub fn new(http: Client, base_url: Url, as_token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http,
            base_url,
            as_token: as_token.into(),
            user_id,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("homeserver url {} cannot be a base", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", self.user_id.as_str())])
    }

    async fn send_message(&self, room: &RoomId, content: serde_json::Value) -> Result<EventId> {
        let txn_id = Uuid::new_v4().to_string();
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room.as_str(),
            "send",
            "m.room.message",
            &txn_id,
        ])?;
        let response: SendEventResponse = self
            .request(Method::PUT, url)
            .json(&content)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to send message to {room}"))?
            .json()
            .await?;
        Ok(EventId(response.event_id))
    }
}

#[async_trait]
impl Intent for HomeserverIntent {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send_notice(&self, room: &RoomId, text: &str) -> Result<EventId> {
        self.send_message(room, json!({ "msgtype": "m.notice", "body": text }))
            .await
    }

    async fn send_image(
        &self,
        room: &RoomId,
        alt_text: &str,
        media: &ContentUri,
    ) -> Result<EventId> {
        self.send_message(
            room,
            json!({ "msgtype": "m.image", "body": alt_text, "url": media.as_str() }),
        )
        .await
    }

    async fn upload_bytes(&self, bytes: Vec<u8>, mime_type: &str) -> Result<ContentUri> {
        let url = self.endpoint(&["_matrix", "media", "v3", "upload"])?;
        let response: UploadResponse = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()
            .context("failed to upload media")?
            .json()
            .await?;
        Ok(ContentUri(response.content_uri))
    }

    async fn set_presence(&self, state: PresenceState) -> Result<()> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "presence",
            self.user_id.as_str(),
            "status",
        ])?;
        self.request(Method::PUT, url)
            .json(&json!({ "presence": state.as_str() }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to set presence of {}", self.user_id))?;
        Ok(())
    }

    async fn user_typing(&self, room: &RoomId, typing: bool, timeout: Duration) -> Result<()> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room.as_str(),
            "typing",
            self.user_id.as_str(),
        ])?;
        let body = TypingRequest {
            typing,
            timeout: typing.then(|| timeout.as_millis() as u64),
        };
        self.request(Method::PUT, url)
            .json(&body)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to update typing in {room}"))?;
        Ok(())
    }

    async fn mark_read(&self, room: &RoomId, event: &EventId) -> Result<()> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room.as_str(),
            "receipt",
            "m.read",
            event.as_str(),
        ])?;
        self.request(Method::POST, url)
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to mark {event} as read"))?;
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "profile",
            self.user_id.as_str(),
            "displayname",
        ])?;
        self.request(Method::PUT, url)
            .json(&json!({ "displayname": name }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to set display name of {}", self.user_id))?;
        Ok(())
    }
}

/// Hands out intents for the bridge bot and for ghosts, all sharing one HTTP
/// client and appservice token.
pub struct HomeserverIntentProvider {
    http: Client,
    base_url: Url,
    as_token: String,
    bot: Arc<HomeserverIntent>,
}

impl HomeserverIntentProvider {
    pub fn new(homeserver_url: &str, as_token: impl Into<String>, bot_user_id: UserId) -> Result<Self> {
        let base_url = Url::parse(homeserver_url)
            .with_context(|| format!("invalid homeserver url {homeserver_url}"))?;
        let http = Client::new();
        let as_token = as_token.into();
        let bot = Arc::new(HomeserverIntent::new(
            http.clone(),
            base_url.clone(),
            as_token.clone(),
            bot_user_id,
        ));
        Ok(Self {
            http,
            base_url,
            as_token,
            bot,
        })
    }
}

impl IntentProvider for HomeserverIntentProvider {
    fn bot(&self) -> Arc<dyn Intent> {
        self.bot.clone()
    }

    fn ghost(&self, user_id: &UserId) -> Arc<dyn Intent> {
        Arc::new(HomeserverIntent::new(
            self.http.clone(),
            self.base_url.clone(),
            self.as_token.clone(),
            user_id.clone(),
        ))
    }
}

#[cfg(test)]
#[path = "tests/homeserver_tests.rs"]
mod tests;
