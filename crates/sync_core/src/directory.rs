use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{SessionId, SessionKind},
    protocol::{MemberSummary, SessionSummary},
};

/// Chat-list entry for one conversation.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub session_id: SessionId,
    pub name: String,
    pub kind: SessionKind,
    pub audio_capable: bool,
    pub members: Vec<MemberSummary>,
    pub last_preview: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: u32,
}

impl From<SessionSummary> for ChatSession {
    fn from(summary: SessionSummary) -> Self {
        let (last_preview, last_activity) = summary
            .last_message
            .map(|m| (m.content.preview(), m.sent_at))
            .map(|(p, t)| (Some(p), Some(t)))
            .unwrap_or((None, None));
        Self {
            session_id: summary.session_id,
            name: summary.name,
            kind: summary.kind,
            audio_capable: summary.audio_capable,
            members: summary.members,
            last_preview,
            last_activity,
            unread: summary.unread_count,
        }
    }
}

/// The ordered conversation list with its unread accounting. Sessions with
/// unread messages sort before read ones; most recent activity first within
/// each group.
#[derive(Default)]
pub struct SessionDirectory {
    entries: HashMap<SessionId, ChatSession>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, summaries: Vec<SessionSummary>) {
        self.entries = summaries
            .into_iter()
            .map(|s| (s.session_id, ChatSession::from(s)))
            .collect();
    }

    pub fn get(&self, session_id: SessionId) -> Option<&ChatSession> {
        self.entries.get(&session_id)
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.entries.contains_key(&session_id)
    }

    pub fn touch(
        &mut self,
        session_id: SessionId,
        preview: String,
        at: DateTime<Utc>,
    ) {
        if let Some(entry) = self.entries.get_mut(&session_id) {
            entry.last_preview = Some(preview);
            entry.last_activity = Some(at);
        }
    }

    pub fn increment_unread(&mut self, session_id: SessionId) -> u32 {
        match self.entries.get_mut(&session_id) {
            Some(entry) => {
                entry.unread += 1;
                entry.unread
            }
            None => 0,
        }
    }

    /// Decrements by exactly `k`, never below zero.
    pub fn decrement_unread(&mut self, session_id: SessionId, k: u32) -> u32 {
        match self.entries.get_mut(&session_id) {
            Some(entry) => {
                entry.unread = entry.unread.saturating_sub(k);
                entry.unread
            }
            None => 0,
        }
    }

    pub fn remove(&mut self, session_id: SessionId) {
        self.entries.remove(&session_id);
    }

    pub fn ordered(&self) -> Vec<ChatSession> {
        let mut sessions: Vec<ChatSession> = self.entries.values().cloned().collect();
        sessions.sort_by(|a, b| {
            let unread_rank = |s: &ChatSession| u8::from(s.unread == 0);
            unread_rank(a)
                .cmp(&unread_rank(b))
                .then_with(|| b.last_activity.cmp(&a.last_activity))
                .then_with(|| a.session_id.0.cmp(&b.session_id.0))
        });
        sessions
    }
}
