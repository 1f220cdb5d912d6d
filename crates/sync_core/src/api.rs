use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ClientMessageId, MessageId, SessionId, UserId},
    error::SyncError,
    protocol::{HistoryPage, MessageContent, MessagePayload, SessionSummary},
};

/// Stateless request/response client for the operations that also exist
/// outside the live channel: conversation list, history pages, the send
/// fallback, and read-receipt acknowledgements.
pub struct ApiClient {
    http: Client,
    base_url: String,
    user_id: UserId,
}

#[derive(Serialize)]
struct HistoryQuery<'a> {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageHttpRequest {
    pub user_id: i64,
    pub session_id: i64,
    pub client_id: ClientMessageId,
    pub content: MessageContent,
}

#[derive(Serialize)]
struct MarkReadRequest<'a> {
    user_id: i64,
    session_id: i64,
    message_ids: &'a [MessageId],
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            user_id,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SyncError> {
        let response = self
            .http
            .get(format!("{}/sessions", self.base_url))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_json(check_status(response)?).await
    }

    pub async fn fetch_history(
        &self,
        session_id: SessionId,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage, SyncError> {
        let response = self
            .http
            .get(format!(
                "{}/sessions/{}/messages",
                self.base_url, session_id.0
            ))
            .query(&HistoryQuery {
                user_id: self.user_id.0,
                limit: limit.clamp(1, 100),
                cursor,
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        decode_json(check_status(response)?).await
    }

    /// HTTP fallback for a send. The response echoes `client_id`, which is
    /// what lets the caller reconcile the optimistic entry exactly.
    pub async fn send_message(
        &self,
        session_id: SessionId,
        client_id: ClientMessageId,
        content: MessageContent,
    ) -> Result<MessagePayload, SyncError> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&SendMessageHttpRequest {
                user_id: self.user_id.0,
                session_id: session_id.0,
                client_id,
                content,
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        let payload: MessagePayload = decode_json(check_status(response)?).await?;
        if payload.client_id != client_id {
            return Err(SyncError::Protocol(
                "send response did not echo client_id".to_string(),
            ));
        }
        Ok(payload)
    }

    pub async fn mark_read(
        &self,
        session_id: SessionId,
        message_ids: &[MessageId],
    ) -> Result<(), SyncError> {
        let response = self
            .http
            .post(format!("{}/read_receipts", self.base_url))
            .json(&MarkReadRequest {
                user_id: self.user_id.0,
                session_id: session_id.0,
                message_ids,
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response)?;
        Ok(())
    }
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    SyncError::TransientNetwork(err.to_string())
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(SyncError::NotFound(response.url().path().to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(SyncError::RateLimited("server throttled request")),
        status if status.is_server_error() => {
            Err(SyncError::TransientNetwork(format!("server error {status}")))
        }
        status => Err(SyncError::Protocol(format!("unexpected status {status}"))),
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncError> {
    response
        .json()
        .await
        .map_err(|err| SyncError::Protocol(format!("invalid response body: {err}")))
}
