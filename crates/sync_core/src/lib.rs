use std::{collections::HashMap, sync::Arc};

use media_transport::{MediaDevices, PeerConnector};
use shared::{
    domain::{MessageId, SessionId, UserId},
    error::SyncError,
    protocol::{ClientRequest, MessageContent, ServerEvent, SignalPayload},
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod directory;
pub mod event_bus;
pub mod message_sync;
pub mod pagination;
pub mod rate_limit;
pub mod read_receipts;
pub mod room_state;
pub mod signaling;
pub mod store;
pub mod transport;

use api::ApiClient;
use config::Settings;
use directory::{ChatSession, SessionDirectory};
use event_bus::{BusEvent, EventBus};
use message_sync::{MessageSyncEngine, PendingMessage};
use pagination::{LoadOutcome, PaginationController, ViewportAnchor};
use rate_limit::{ActionKind, RateLimiter};
use read_receipts::ReadReceiptTracker;
use room_state::{AudioRoomStateMachine, RoomEvent, RoomState, Transition};
use signaling::{AudioRoomState, AudioSignalingEngine};
use store::{MessageStore, StoredMessage};
use transport::{ChannelEvent, LiveChannel};

/// Snapshot of everything the UI renders for one session.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session: ChatSession,
    pub messages: Vec<StoredMessage>,
    pub audio: AudioRoomState,
    pub room_state: RoomState,
    pub typing_users: Vec<UserId>,
    pub has_more: bool,
    pub loading: bool,
}

struct AudioContext {
    machine: AudioRoomStateMachine,
    session_id: Option<SessionId>,
    engine: Option<Arc<AudioSignalingEngine>>,
}

/// Top-level orchestrator. Owns the chat list, the single active-session
/// slot, and the wiring between the engines; every component is
/// constructor-injected and nothing lives in ambient global state.
pub struct ChatSessionController {
    user_id: UserId,
    display_name: String,
    settings: Settings,
    live: Arc<dyn LiveChannel>,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaDevices>,
    api: Arc<ApiClient>,
    limiter: Arc<RateLimiter>,
    bus: EventBus,
    store: Arc<Mutex<MessageStore>>,
    directory: Arc<Mutex<SessionDirectory>>,
    sync: Arc<MessageSyncEngine>,
    pagination: PaginationController,
    receipts: ReadReceiptTracker,
    active_session: Arc<RwLock<Option<SessionId>>>,
    audio: Mutex<AudioContext>,
    typing: Arc<Mutex<HashMap<SessionId, HashMap<UserId, Instant>>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSessionController {
    pub fn new_with_dependencies(
        user_id: UserId,
        display_name: impl Into<String>,
        settings: Settings,
        live: Arc<dyn LiveChannel>,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaDevices>,
    ) -> Arc<Self> {
        let api = Arc::new(ApiClient::new(settings.server_url.clone(), user_id));
        let limiter = Arc::new(RateLimiter::with_default_limits());
        let bus = EventBus::default();
        let store = Arc::new(Mutex::new(MessageStore::new()));
        let directory = Arc::new(Mutex::new(SessionDirectory::new()));
        let active_session = Arc::new(RwLock::new(None));

        let sync = MessageSyncEngine::new(
            user_id,
            Arc::clone(&store),
            Arc::clone(&live),
            Arc::clone(&api),
            Arc::clone(&limiter),
            bus.clone(),
            Arc::clone(&active_session),
            settings.fallback_timeout(),
        );
        let pagination = PaginationController::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&active_session),
            settings.page_size,
        );
        let receipts = ReadReceiptTracker::new(
            user_id,
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&directory),
            bus.clone(),
            settings.read_debounce(),
        );
        let machine = AudioRoomStateMachine::new(user_id, Arc::clone(&limiter), bus.clone());

        Arc::new(Self {
            user_id,
            display_name: display_name.into(),
            settings,
            live,
            connector,
            media,
            api,
            limiter,
            bus,
            store,
            directory,
            sync,
            pagination,
            receipts,
            active_session,
            audio: Mutex::new(AudioContext {
                machine,
                session_id: None,
                engine: None,
            }),
            typing: Arc::new(Mutex::new(HashMap::new())),
            event_task: Mutex::new(None),
        })
    }

    /// Starts the live-channel event pump. Idempotent; a previous pump is
    /// replaced.
    pub async fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut events = self.live.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Server(event)) => {
                        controller.handle_server_event(event).await;
                    }
                    Ok(ChannelEvent::ConnectionLost) => {
                        // Sends escalate straight to the HTTP fallback while
                        // the channel is down.
                        warn!("live channel lost; operating over http fallback");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event pump lagged behind live channel");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.event_task.lock().await.replace(task) {
            previous.abort();
        }
    }

    /// Fetches the conversation list and resets the chat-list view.
    pub async fn bootstrap(&self) -> Result<(), SyncError> {
        let sessions = self.api.list_sessions().await?;
        self.directory.lock().await.replace_all(sessions);
        self.bus.publish(BusEvent::ChatListReordered);
        Ok(())
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    pub async fn active_session(&self) -> Option<SessionId> {
        *self.active_session.read().await
    }

    pub async fn chat_list(&self) -> Vec<ChatSession> {
        self.directory.lock().await.ordered()
    }

    /// Switches the active conversation: flush read receipts for the old
    /// session, drop its room subscription and stale pagination interest,
    /// tear down audio only if we are actually in that session's room, then
    /// join and load the new one.
    pub async fn select_session(&self, session_id: SessionId) -> Result<(), SyncError> {
        let previous = *self.active_session.read().await;
        if previous == Some(session_id) {
            return Ok(());
        }

        self.receipts.activate_session(Some(session_id)).await;

        if let Some(previous) = previous {
            if let Err(err) = self
                .live
                .submit(ClientRequest::LeaveRoom {
                    session_id: previous,
                })
                .await
            {
                warn!(session_id = previous.0, error = %err, "leave-room submit failed");
            }
            self.pagination.reset(previous).await;
            self.teardown_audio_if_joined(previous).await;
        }

        *self.active_session.write().await = Some(session_id);

        if let Err(err) = self
            .live
            .submit(ClientRequest::JoinRoom { session_id })
            .await
        {
            warn!(session_id = session_id.0, error = %err, "join-room submit failed");
        }

        self.pagination.load_initial(session_id).await?;
        info!(session_id = session_id.0, "session selected");
        Ok(())
    }

    pub async fn send_message(&self, content: MessageContent) -> Result<PendingMessage, SyncError> {
        let session_id = self
            .active_session()
            .await
            .ok_or_else(|| SyncError::NotFound("no active session".to_string()))?;

        let pending = self.sync.send(session_id, content.clone()).await?;

        let mut directory = self.directory.lock().await;
        directory.touch(session_id, content.preview(), chrono::Utc::now());
        drop(directory);
        self.bus.publish(BusEvent::ChatListReordered);
        Ok(pending)
    }

    pub async fn load_more_history(
        &self,
        anchor: &dyn ViewportAnchor,
    ) -> Result<LoadOutcome, SyncError> {
        let session_id = self
            .active_session()
            .await
            .ok_or_else(|| SyncError::NotFound("no active session".to_string()))?;
        self.pagination.load_more(session_id, anchor).await
    }

    pub async fn observe_message(&self, message_id: MessageId) {
        self.receipts.observe(message_id).await;
    }

    pub async fn unobserve_message(&self, message_id: MessageId) {
        self.receipts.unobserve(message_id).await;
    }

    pub async fn flush_read_receipts(&self) -> Result<usize, SyncError> {
        self.receipts.flush().await
    }

    /// Rate-limited typing signal with auto-clear after the configured idle
    /// interval. Denied signals are dropped silently.
    pub async fn signal_typing(&self) -> Result<(), SyncError> {
        let session_id = self
            .active_session()
            .await
            .ok_or_else(|| SyncError::NotFound("no active session".to_string()))?;

        if !self
            .limiter
            .allow(self.user_id, ActionKind::TypingSignal)
            .await
        {
            return Ok(());
        }

        if let Err(err) = self
            .live
            .submit(ClientRequest::TypingStart { session_id })
            .await
        {
            warn!(session_id = session_id.0, error = %err, "typing signal failed");
            return Ok(());
        }

        let stamp = Instant::now();
        {
            let mut typing = self.typing.lock().await;
            typing
                .entry(session_id)
                .or_default()
                .insert(self.user_id, stamp);
        }

        let live = Arc::clone(&self.live);
        let typing = self.typing_handle();
        let clear_after = self.settings.typing_clear();
        let user_id = self.user_id;
        tokio::spawn(async move {
            tokio::time::sleep(clear_after).await;
            let still_current = {
                let typing = typing.lock().await;
                typing
                    .get(&session_id)
                    .and_then(|users| users.get(&user_id))
                    .is_some_and(|seen| *seen == stamp)
            };
            if still_current {
                if let Some(users) = typing.lock().await.get_mut(&session_id) {
                    users.remove(&user_id);
                }
                let _ = live.submit(ClientRequest::TypingStop { session_id }).await;
            }
        });

        Ok(())
    }

    pub async fn join_audio_room(&self) -> Result<(), SyncError> {
        let session_id = self
            .active_session()
            .await
            .ok_or_else(|| SyncError::NotFound("no active session".to_string()))?;

        let mut audio = self.audio.lock().await;
        if !audio.machine.can_transition(RoomEvent::JoinRoom) {
            return Ok(());
        }
        match audio.machine.apply(RoomEvent::JoinRoom).await {
            Transition::Rejected => return Ok(()),
            Transition::Throttled => {
                return Err(SyncError::RateLimited("audio room join throttled"))
            }
            Transition::Applied { .. } => {}
        }

        let engine = AudioSignalingEngine::new(
            session_id,
            self.user_id,
            Arc::clone(&self.connector),
            Arc::clone(&self.media),
            Arc::clone(&self.live),
            self.bus.clone(),
            self.settings.ice_servers(),
        );

        if let Err(err) = engine.acquire_microphone().await {
            // Terminal for this attempt; back to idle so the user can retry.
            audio.machine.reset();
            return Err(err);
        }

        engine
            .add_participant(self.user_id, self.display_name.clone(), false)
            .await;
        audio.engine = Some(Arc::clone(&engine));
        audio.session_id = Some(session_id);
        drop(audio);

        if let Err(err) = self
            .live
            .submit(ClientRequest::JoinAudioRoom { session_id })
            .await
        {
            engine.teardown().await;
            let mut audio = self.audio.lock().await;
            audio.machine.reset();
            audio.engine = None;
            audio.session_id = None;
            return Err(SyncError::TransientNetwork(err.to_string()));
        }

        Ok(())
    }

    pub async fn leave_audio_room(&self) -> Result<(), SyncError> {
        let mut audio = self.audio.lock().await;
        match audio.machine.apply(RoomEvent::LeaveRoom).await {
            Transition::Applied { .. } => {}
            _ => return Ok(()),
        }

        let session_id = audio.session_id.take();
        let engine = audio.engine.take();
        if let Some(engine) = engine {
            engine.teardown().await;
        }
        audio.machine.apply(RoomEvent::Left).await;
        drop(audio);

        if let Some(session_id) = session_id {
            if let Err(err) = self
                .live
                .submit(ClientRequest::LeaveAudioRoom { session_id })
                .await
            {
                warn!(session_id = session_id.0, error = %err, "leave-audio submit failed");
            }
        }
        Ok(())
    }

    /// Mute/unmute gated by the state machine and its rate window. Returns
    /// the muted flag after the call.
    pub async fn toggle_mute(&self) -> Result<bool, SyncError> {
        let mut audio = self.audio.lock().await;
        let event = match audio.machine.state() {
            RoomState::Live => RoomEvent::MuteMic,
            RoomState::Muted => RoomEvent::UnmuteMic,
            _ => return Ok(false),
        };

        match audio.machine.apply(event).await {
            Transition::Throttled => Err(SyncError::RateLimited("mic toggle throttled")),
            Transition::Rejected => Ok(audio.machine.state() == RoomState::Muted),
            Transition::Applied { to, .. } => {
                let muted = to == RoomState::Muted;
                let engine = audio.engine.clone();
                drop(audio);
                if let Some(engine) = engine {
                    engine.set_local_muted(muted).await;
                }
                Ok(muted)
            }
        }
    }

    pub async fn room_state(&self) -> RoomState {
        self.audio.lock().await.machine.state()
    }

    pub async fn session_view(&self, session_id: SessionId) -> Option<SessionView> {
        let session = self.directory.lock().await.get(session_id).cloned()?;
        let messages = self.store.lock().await.messages(session_id);

        let audio_ctx = self.audio.lock().await;
        let room_state = if audio_ctx.session_id == Some(session_id) {
            audio_ctx.machine.state()
        } else {
            RoomState::Idle
        };
        let engine = if audio_ctx.session_id == Some(session_id) {
            audio_ctx.engine.clone()
        } else {
            None
        };
        drop(audio_ctx);

        let audio = match engine {
            Some(engine) => engine.room_snapshot().await,
            None => AudioRoomState::default(),
        };

        let typing_users = self.typing_users(session_id).await;
        Some(SessionView {
            session,
            messages,
            audio,
            room_state,
            typing_users,
            has_more: self.pagination.has_more(session_id).await,
            loading: self.pagination.is_loading(session_id).await,
        })
    }

    pub async fn typing_users(&self, session_id: SessionId) -> Vec<UserId> {
        let clear_after = self.settings.typing_clear();
        let now = Instant::now();
        self.typing
            .lock()
            .await
            .get(&session_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(user, seen)| {
                        **user != self.user_id && now.duration_since(**seen) < clear_after
                    })
                    .map(|(user, _)| *user)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn teardown_audio_if_joined(&self, session_id: SessionId) {
        let mut audio = self.audio.lock().await;
        if audio.session_id != Some(session_id)
            || !audio.machine.state().holds_audio_resources()
        {
            return;
        }
        if let Some(engine) = audio.engine.take() {
            engine.teardown().await;
        }
        audio.machine.reset();
        audio.session_id = None;
        drop(audio);

        if let Err(err) = self
            .live
            .submit(ClientRequest::LeaveAudioRoom { session_id })
            .await
        {
            warn!(session_id = session_id.0, error = %err, "leave-audio submit failed");
        }
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message }
            | ServerEvent::SendAcknowledged { message } => {
                let session_id = message.session_id;
                let own = message.sender_id == self.user_id;
                let preview = message.content.preview();
                let sent_at = message.sent_at;

                self.sync.on_incoming(message).await;

                let active = self.active_session().await;
                {
                    let mut directory = self.directory.lock().await;
                    directory.touch(session_id, preview, sent_at);
                    if !own && active != Some(session_id) {
                        let unread = directory.increment_unread(session_id);
                        self.bus.publish(BusEvent::UnreadChanged {
                            session_id,
                            unread,
                        });
                    }
                }
                self.bus.publish(BusEvent::ChatListReordered);
            }
            ServerEvent::TypingStarted {
                session_id,
                user_id,
            } => {
                if user_id == self.user_id {
                    return;
                }
                let stamp = Instant::now();
                self.typing
                    .lock()
                    .await
                    .entry(session_id)
                    .or_default()
                    .insert(user_id, stamp);
                self.bus.publish(BusEvent::TypingObserved {
                    session_id,
                    user_id,
                });

                let typing = self.typing_handle();
                let bus = self.bus.clone();
                let clear_after = self.settings.typing_clear();
                tokio::spawn(async move {
                    tokio::time::sleep(clear_after).await;
                    let mut typing = typing.lock().await;
                    let stale = typing
                        .get(&session_id)
                        .and_then(|users| users.get(&user_id))
                        .is_some_and(|seen| *seen == stamp);
                    if stale {
                        if let Some(users) = typing.get_mut(&session_id) {
                            users.remove(&user_id);
                        }
                        bus.publish(BusEvent::TypingCleared {
                            session_id,
                            user_id,
                        });
                    }
                });
            }
            ServerEvent::TypingStopped {
                session_id,
                user_id,
            } => {
                let mut typing = self.typing.lock().await;
                if let Some(users) = typing.get_mut(&session_id) {
                    users.remove(&user_id);
                }
                drop(typing);
                self.bus.publish(BusEvent::TypingCleared {
                    session_id,
                    user_id,
                });
            }
            ServerEvent::MessagesDelivered {
                session_id,
                message_ids,
            } => {
                self.sync.on_delivered(session_id, &message_ids).await;
            }
            ServerEvent::MessagesRead {
                session_id,
                reader_id,
                message_ids,
                read_at,
            } => {
                self.sync
                    .on_read(session_id, reader_id, &message_ids, read_at)
                    .await;
            }
            ServerEvent::AudioRoomStarted {
                session_id,
                started_by,
                started_at,
            } => {
                let audio = self.audio.lock().await;
                if audio.session_id == Some(session_id) {
                    if let Some(engine) = audio.engine.clone() {
                        drop(audio);
                        engine.mark_started(started_by, started_at).await;
                    }
                }
            }
            ServerEvent::AudioRoomEnded { session_id } => {
                self.teardown_audio_if_joined(session_id).await;
            }
            ServerEvent::AudioRoomJoined {
                session_id,
                user_id,
                display_name,
            } => {
                let mut audio = self.audio.lock().await;
                if audio.session_id != Some(session_id) {
                    return;
                }
                if user_id == self.user_id {
                    audio.machine.apply(RoomEvent::Joined).await;
                }
                let already_joined = audio.machine.state().is_joined();
                let engine = audio.engine.clone();
                drop(audio);

                let Some(engine) = engine else { return };
                engine
                    .add_participant(user_id, display_name, false)
                    .await;
                // Offers go out only toward participants who join while we
                // are already in the room; existing members initiate toward
                // us via the roster path.
                if user_id != self.user_id && already_joined {
                    if let Err(err) = engine.connect_to(user_id).await {
                        warn!(peer = user_id.0, error = %err, "peer connect failed");
                    }
                }
            }
            ServerEvent::AudioRoomRoster {
                session_id,
                participants,
            } => {
                let audio = self.audio.lock().await;
                if audio.session_id != Some(session_id) {
                    return;
                }
                let engine = audio.engine.clone();
                drop(audio);
                let Some(engine) = engine else { return };
                for participant in participants {
                    engine
                        .add_participant(
                            participant.user_id,
                            participant.display_name,
                            participant.muted,
                        )
                        .await;
                }
            }
            ServerEvent::AudioRoomLeft {
                session_id,
                user_id,
            } => {
                if user_id == self.user_id {
                    self.teardown_audio_if_joined(session_id).await;
                    return;
                }
                let audio = self.audio.lock().await;
                if audio.session_id != Some(session_id) {
                    return;
                }
                let engine = audio.engine.clone();
                drop(audio);
                if let Some(engine) = engine {
                    engine.handle_peer_left(user_id).await;
                }
            }
            ServerEvent::Signal {
                session_id,
                from_user_id,
                payload,
            } => {
                let audio = self.audio.lock().await;
                if audio.session_id != Some(session_id) {
                    return;
                }
                let engine = audio.engine.clone();
                drop(audio);
                let Some(engine) = engine else { return };

                let outcome = match payload {
                    SignalPayload::Offer { sdp } => engine.handle_offer(from_user_id, sdp).await,
                    SignalPayload::Answer { sdp } => engine.handle_answer(from_user_id, sdp).await,
                    SignalPayload::Candidate {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    } => {
                        engine
                            .handle_candidate(
                                from_user_id,
                                media_transport::IceCandidate {
                                    candidate,
                                    sdp_mid,
                                    sdp_mline_index,
                                },
                            )
                            .await
                    }
                };
                if let Err(err) = outcome {
                    // Malformed or unexpected signaling never crashes the
                    // session view.
                    warn!(peer = from_user_id.0, error = %err, "signal handling failed");
                }
            }
            ServerEvent::SessionRemoved { session_id } => {
                self.directory.lock().await.remove(session_id);
                self.store.lock().await.remove_session(session_id);
                self.teardown_audio_if_joined(session_id).await;
                if self.active_session().await == Some(session_id) {
                    *self.active_session.write().await = None;
                    self.receipts.activate_session(None).await;
                }
                self.bus.publish(BusEvent::ChatListReordered);
            }
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "server reported error");
            }
        }
    }

    fn typing_handle(&self) -> Arc<Mutex<HashMap<SessionId, HashMap<UserId, Instant>>>> {
        Arc::clone(&self.typing)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
