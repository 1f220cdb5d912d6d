use std::{collections::HashMap, sync::Arc};

use shared::{domain::SessionId, error::SyncError};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::{
    api::ApiClient,
    store::{MessageStore, StoredMessage},
};

/// Scroll-anchor capability implemented by the embedding view: measure the
/// rendered content extent and shift the viewport so a prepend does not move
/// what the user is looking at.
pub trait ViewportAnchor: Send + Sync {
    fn content_extent(&self) -> f64;
    fn shift_by(&self, delta: f64);
}

/// Anchor for headless use; measures nothing and shifts nothing.
pub struct NullAnchor;

impl ViewportAnchor for NullAnchor {
    fn content_extent(&self) -> f64 {
        0.0
    }

    fn shift_by(&self, _delta: f64) {}
}

#[derive(Debug)]
pub struct InitialPage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Older messages were prepended.
    Loaded(usize),
    /// A load for this session was already in flight; this call did nothing.
    Coalesced,
    /// Backward history is exhausted; no network call was issued.
    Exhausted,
    /// The result arrived after the session stopped being active or was
    /// reloaded, and was discarded.
    Stale,
}

#[derive(Debug, Default)]
struct PageState {
    cursor: Option<String>,
    has_more: bool,
    in_flight: bool,
    epoch: u64,
}

/// Cursor-based backward paging with per-session coalescing and
/// stale-result discard.
pub struct PaginationController {
    api: Arc<ApiClient>,
    store: Arc<Mutex<MessageStore>>,
    active_session: Arc<RwLock<Option<SessionId>>>,
    page_size: u32,
    state: Mutex<HashMap<SessionId, PageState>>,
}

impl PaginationController {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<Mutex<MessageStore>>,
        active_session: Arc<RwLock<Option<SessionId>>>,
        page_size: u32,
    ) -> Self {
        Self {
            api,
            store,
            active_session,
            page_size,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches the most recent window and resets any previous paging state
    /// for the session, including the terminal `has_more = false` mark.
    pub async fn load_initial(&self, session_id: SessionId) -> Result<InitialPage, SyncError> {
        let epoch = {
            let mut state = self.state.lock().await;
            let entry = state.entry(session_id).or_default();
            entry.epoch += 1;
            entry.cursor = None;
            entry.has_more = true;
            entry.in_flight = false;
            entry.epoch
        };

        let page = self
            .api
            .fetch_history(session_id, None, self.page_size)
            .await?;

        let messages = {
            let mut store = self.store.lock().await;
            store.remove_session(session_id);
            store.prepend_page(session_id, page.messages);
            store.messages(session_id)
        };

        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&session_id) {
            if entry.epoch == epoch {
                entry.cursor = page.next_cursor;
                entry.has_more = page.has_more;
            }
        }

        Ok(InitialPage {
            messages,
            has_more: page.has_more,
        })
    }

    /// Loads the next older page. A call in flight suppresses a second one,
    /// and exhausted history issues no network call at all.
    pub async fn load_more(
        &self,
        session_id: SessionId,
        anchor: &dyn ViewportAnchor,
    ) -> Result<LoadOutcome, SyncError> {
        let (cursor, epoch) = {
            let mut state = self.state.lock().await;
            let entry = state.entry(session_id).or_default();
            if !entry.has_more {
                return Ok(LoadOutcome::Exhausted);
            }
            if entry.in_flight {
                return Ok(LoadOutcome::Coalesced);
            }
            entry.in_flight = true;
            (entry.cursor.clone(), entry.epoch)
        };

        let fetched = self
            .api
            .fetch_history(session_id, cursor.as_deref(), self.page_size)
            .await;

        let mut state = self.state.lock().await;
        let entry = state.entry(session_id).or_default();
        entry.in_flight = false;

        let page = fetched?;

        let still_active = *self.active_session.read().await == Some(session_id);
        if entry.epoch != epoch || !still_active {
            debug!(session_id = session_id.0, "discarding stale history page");
            return Ok(LoadOutcome::Stale);
        }

        entry.cursor = page.next_cursor;
        entry.has_more = page.has_more;
        drop(state);

        let before = anchor.content_extent();
        let inserted = self
            .store
            .lock()
            .await
            .prepend_page(session_id, page.messages);
        let after = anchor.content_extent();
        anchor.shift_by(after - before);

        Ok(LoadOutcome::Loaded(inserted))
    }

    /// Invalidates paging interest for a session; an in-flight result will
    /// be discarded as stale when it lands.
    pub async fn reset(&self, session_id: SessionId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(&session_id) {
            entry.epoch += 1;
            entry.cursor = None;
            entry.has_more = true;
        }
    }

    pub async fn has_more(&self, session_id: SessionId) -> bool {
        self.state
            .lock()
            .await
            .get(&session_id)
            .map_or(true, |entry| entry.has_more)
    }

    pub async fn is_loading(&self, session_id: SessionId) -> bool {
        self.state
            .lock()
            .await
            .get(&session_id)
            .is_some_and(|entry| entry.in_flight)
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
