use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, DeliveryStatus, MessageId, SessionId, UserId},
    protocol::{MessageContent, MessagePayload},
};

/// One entry in a session's ordered message list. `message_id` is absent
/// until a delivery path confirms the send.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: Option<MessageId>,
    pub client_id: ClientMessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub read_by: HashMap<UserId, DateTime<Utc>>,
}

impl StoredMessage {
    pub fn pending(
        client_id: ClientMessageId,
        session_id: SessionId,
        sender_id: UserId,
        content: MessageContent,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: None,
            client_id,
            session_id,
            sender_id,
            sender_name: None,
            content,
            sent_at,
            status: DeliveryStatus::Pending,
            read_by: HashMap::new(),
        }
    }

    pub fn confirmed(payload: MessagePayload) -> Self {
        Self {
            message_id: Some(payload.message_id),
            client_id: payload.client_id,
            session_id: payload.session_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            content: payload.content,
            sent_at: payload.sent_at,
            status: DeliveryStatus::Sent,
            read_by: HashMap::new(),
        }
    }

    fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// A local optimistic entry was rewritten in place.
    Reconciled,
    /// A new confirmed entry was inserted in timestamp order.
    Inserted,
    /// The message was already present; nothing changed.
    Duplicate,
}

#[derive(Default)]
struct SessionSlot {
    /// Invariant: confirmed prefix sorted by (sent_at, message_id), then
    /// locally-pending entries in send order.
    entries: Vec<StoredMessage>,
}

impl SessionSlot {
    fn confirmed_len(&self) -> usize {
        self.entries.partition_point(|m| !m.is_pending())
    }

    fn contains(&self, client_id: ClientMessageId, message_id: Option<MessageId>) -> bool {
        self.entries.iter().any(|m| {
            m.client_id == client_id
                || (message_id.is_some() && m.message_id == message_id)
        })
    }

    fn insert_confirmed(&mut self, message: StoredMessage) {
        let confirmed = self.confirmed_len();
        let key = (message.sent_at, message.message_id);
        let at = self.entries[..confirmed]
            .partition_point(|m| (m.sent_at, m.message_id) <= key);
        self.entries.insert(at, message);
    }
}

/// The single owned store for every session's ordered message list. All
/// mutation goes through this API; callers never splice lists directly.
#[derive(Default)]
pub struct MessageStore {
    slots: HashMap<SessionId, SessionSlot>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a locally-created optimistic entry at the tail. Returns false
    /// if the client id is already present.
    pub fn append_pending(&mut self, message: StoredMessage) -> bool {
        let slot = self.slots.entry(message.session_id).or_default();
        if slot.contains(message.client_id, None) {
            return false;
        }
        slot.entries.push(message);
        true
    }

    /// Applies a server-confirmed message: reconciles the matching pending
    /// entry in place if one exists, inserts in timestamp order otherwise,
    /// and drops exact duplicates. This is the rule that keeps the list at
    /// one entry per logical send no matter which delivery path (or both)
    /// reports success.
    pub fn confirm(&mut self, payload: MessagePayload) -> ConfirmOutcome {
        let slot = self.slots.entry(payload.session_id).or_default();

        if let Some(pos) = slot
            .entries
            .iter()
            .position(|m| m.is_pending() && m.client_id == payload.client_id)
        {
            let read_by = std::mem::take(&mut slot.entries[pos].read_by);
            slot.entries.remove(pos);
            let mut confirmed = StoredMessage::confirmed(payload);
            confirmed.read_by = read_by;
            slot.insert_confirmed(confirmed);
            return ConfirmOutcome::Reconciled;
        }

        if slot.contains(payload.client_id, Some(payload.message_id)) {
            return ConfirmOutcome::Duplicate;
        }

        slot.insert_confirmed(StoredMessage::confirmed(payload));
        ConfirmOutcome::Inserted
    }

    /// Prepends an older history page. Entries already present are skipped;
    /// returns how many were inserted.
    pub fn prepend_page(&mut self, session_id: SessionId, page: Vec<MessagePayload>) -> usize {
        let slot = self.slots.entry(session_id).or_default();
        let mut inserted = 0;
        for payload in page {
            if slot.contains(payload.client_id, Some(payload.message_id)) {
                continue;
            }
            slot.insert_confirmed(StoredMessage::confirmed(payload));
            inserted += 1;
        }
        inserted
    }

    pub fn mark_delivered(&mut self, session_id: SessionId, message_ids: &[MessageId]) -> usize {
        let Some(slot) = self.slots.get_mut(&session_id) else {
            return 0;
        };
        let mut advanced = 0;
        for entry in &mut slot.entries {
            let Some(id) = entry.message_id else { continue };
            if message_ids.contains(&id) && entry.status == DeliveryStatus::Sent {
                entry.status = DeliveryStatus::Delivered;
                advanced += 1;
            }
        }
        advanced
    }

    /// Records a reader for the given messages. Returns how many entries
    /// gained this reader for the first time.
    pub fn mark_read_by(
        &mut self,
        session_id: SessionId,
        reader_id: UserId,
        message_ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) -> usize {
        let Some(slot) = self.slots.get_mut(&session_id) else {
            return 0;
        };
        let mut newly_read = 0;
        for entry in &mut slot.entries {
            let Some(id) = entry.message_id else { continue };
            if !message_ids.contains(&id) {
                continue;
            }
            if entry.read_by.insert(reader_id, read_at).is_none() {
                newly_read += 1;
            }
            if entry.status != DeliveryStatus::Pending {
                entry.status = DeliveryStatus::Read;
            }
        }
        newly_read
    }

    /// Removes a failed optimistic entry. Confirmed messages are never
    /// removed individually.
    pub fn remove_pending(&mut self, session_id: SessionId, client_id: ClientMessageId) -> bool {
        let Some(slot) = self.slots.get_mut(&session_id) else {
            return false;
        };
        let before = slot.entries.len();
        slot.entries
            .retain(|m| !(m.is_pending() && m.client_id == client_id));
        slot.entries.len() != before
    }

    pub fn remove_session(&mut self, session_id: SessionId) {
        self.slots.remove(&session_id);
    }

    pub fn messages(&self, session_id: SessionId) -> Vec<StoredMessage> {
        self.slots
            .get(&session_id)
            .map(|slot| slot.entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self, session_id: SessionId) -> usize {
        self.slots.get(&session_id).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, session_id: SessionId) -> bool {
        self.len(session_id) == 0
    }
}
