use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{RoomId, UserId, UserRole, UserSummary},
    error::{ApiError, ApiException},
    protocol::{
        CreatePrivateRoomRequest, MessagePayload, RegisterUserRequest, RoomSummary,
        SendMessageRequest,
    },
};

/// Server surface the client depends on. Tests swap in a scripted
/// implementation; production uses [`HttpRoomApi`].
#[async_trait]
pub trait RoomApi: Send + Sync {
    async fn register_user(
        &self,
        display_name: &str,
        avatar_ref: Option<&str>,
        role: UserRole,
    ) -> Result<UserSummary>;
    async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomSummary>>;
    async fn create_private_room(&self, request: &CreatePrivateRoomRequest) -> Result<RoomSummary>;
    async fn private_room_with(
        &self,
        user_id: UserId,
        other_id: UserId,
        context_ref: Option<&str>,
    ) -> Result<Option<RoomSummary>>;
    async fn list_messages(
        &self,
        user_id: UserId,
        room_id: RoomId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;
    async fn mark_room_read(&self, user_id: UserId, room_id: RoomId) -> Result<()>;
    async fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<()>;
}

pub struct HttpRoomApi {
    http: Client,
    server_url: String,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

impl HttpRoomApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }

    /// Rewrites the HTTP base into the matching websocket endpoint for a
    /// user's event stream.
    pub fn ws_url(server_url: &str, user_id: UserId) -> Result<String> {
        let base = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(format!("{base}/ws?user_id={}", user_id.0))
    }

    /// Lifts a non-success response into a typed [`ApiException`] so callers
    /// can branch on the server's error code instead of status text.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(err) => Err(ApiException::new(err.code, err.message).into()),
            Err(_) => Err(anyhow!("request failed with status {status}")),
        }
    }
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    async fn register_user(
        &self,
        display_name: &str,
        avatar_ref: Option<&str>,
        role: UserRole,
    ) -> Result<UserSummary> {
        let response = self
            .http
            .post(format!("{}/users", self.server_url))
            .json(&RegisterUserRequest {
                display_name: display_name.to_string(),
                avatar_ref: avatar_ref.map(str::to_string),
                role,
            })
            .send()
            .await
            .context("register request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomSummary>> {
        let response = self
            .http
            .get(format!("{}/rooms", self.server_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .context("room list request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn create_private_room(&self, request: &CreatePrivateRoomRequest) -> Result<RoomSummary> {
        let response = self
            .http
            .post(format!("{}/rooms/private", self.server_url))
            .json(request)
            .send()
            .await
            .context("room create request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn private_room_with(
        &self,
        user_id: UserId,
        other_id: UserId,
        context_ref: Option<&str>,
    ) -> Result<Option<RoomSummary>> {
        let mut request = self
            .http
            .get(format!(
                "{}/rooms/private/with/{}",
                self.server_url, other_id.0
            ))
            .query(&[("user_id", user_id.0)]);
        if let Some(context_ref) = context_ref {
            request = request.query(&[("context_ref", context_ref)]);
        }
        let response = request.send().await.context("room lookup request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_messages(
        &self,
        user_id: UserId,
        room_id: RoomId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<MessagePayload>> {
        let response = self
            .http
            .get(format!("{}/rooms/{}/messages", self.server_url, room_id.0))
            .query(&ListMessagesQuery {
                user_id: user_id.0,
                limit,
                before,
            })
            .send()
            .await
            .context("message list request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let response = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(request)
            .send()
            .await
            .context("send request failed")?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn mark_room_read(&self, user_id: UserId, room_id: RoomId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/rooms/{}/read", self.server_url, room_id.0))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .context("mark read request failed")?;
        Self::check(response).await?;
        Ok(())
    }

    async fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/rooms/{}/leave", self.server_url, room_id.0))
            .query(&[("user_id", user_id.0)])
            .send()
            .await
            .context("leave request failed")?;
        Self::check(response).await?;
        Ok(())
    }
}
