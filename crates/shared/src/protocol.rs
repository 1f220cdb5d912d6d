use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientMessageId, FileId, MessageId, SessionId, SessionKind, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageContent {
    Text { body: String },
    File { attachment: FileAttachment },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// Short preview line for the chat list.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body } => body.clone(),
            MessageContent::File { attachment } => attachment.filename.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub file_id: FileId,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A server-confirmed message. `client_id` is always present and always
/// echoed, on the live channel and the HTTP fallback alike; it is the sole
/// key used to reconcile optimistic local entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub client_id: ClientMessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub name: String,
    pub kind: SessionKind,
    pub audio_capable: bool,
    pub members: Vec<MemberSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioParticipantInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    SendMessage {
        client_id: ClientMessageId,
        session_id: SessionId,
        content: MessageContent,
    },
    TypingStart {
        session_id: SessionId,
    },
    TypingStop {
        session_id: SessionId,
    },
    JoinRoom {
        session_id: SessionId,
    },
    LeaveRoom {
        session_id: SessionId,
    },
    JoinAudioRoom {
        session_id: SessionId,
    },
    LeaveAudioRoom {
        session_id: SessionId,
    },
    Signal {
        session_id: SessionId,
        to_user_id: UserId,
        payload: SignalPayload,
    },
    MarkMessagesRead {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    /// Acknowledgement of the local client's own live-channel send.
    SendAcknowledged {
        message: MessagePayload,
    },
    TypingStarted {
        session_id: SessionId,
        user_id: UserId,
    },
    TypingStopped {
        session_id: SessionId,
        user_id: UserId,
    },
    MessagesDelivered {
        session_id: SessionId,
        message_ids: Vec<MessageId>,
    },
    MessagesRead {
        session_id: SessionId,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        read_at: DateTime<Utc>,
    },
    AudioRoomStarted {
        session_id: SessionId,
        started_by: UserId,
        started_at: DateTime<Utc>,
    },
    AudioRoomEnded {
        session_id: SessionId,
    },
    AudioRoomJoined {
        session_id: SessionId,
        user_id: UserId,
        display_name: String,
    },
    AudioRoomLeft {
        session_id: SessionId,
        user_id: UserId,
    },
    /// Existing participants, delivered to a freshly joined member. These are
    /// added passively; each of them initiates an offer toward the joiner.
    AudioRoomRoster {
        session_id: SessionId,
        participants: Vec<AudioParticipantInfo>,
    },
    Signal {
        session_id: SessionId,
        from_user_id: UserId,
        payload: SignalPayload,
    },
    SessionRemoved {
        session_id: SessionId,
    },
    Error(ApiError),
}
