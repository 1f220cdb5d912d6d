use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use media_transport::{
    IceCandidate, IceServer, LocalAudioTrack, MediaDevices, MediaError, PeerConnection,
    PeerConnectionState, PeerConnector, PeerEvent, SessionDescription,
};
use shared::{
    domain::{SessionId, UserId},
    error::SyncError,
    protocol::{ClientRequest, SignalPayload},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    event_bus::{BusEvent, EventBus},
    transport::LiveChannel,
};

#[derive(Debug, Clone)]
pub struct AudioParticipant {
    pub user_id: UserId,
    pub display_name: String,
    pub muted: bool,
    pub speaking: bool,
    pub connection_state: PeerConnectionState,
}

/// Per-session audio room view. Invariant: `active` is true iff at least
/// one participant is present.
#[derive(Debug, Clone, Default)]
pub struct AudioRoomState {
    pub active: bool,
    pub started_by: Option<UserId>,
    pub started_at: Option<DateTime<Utc>>,
    pub participants: Vec<AudioParticipant>,
}

impl AudioRoomState {
    fn upsert(&mut self, participant: AudioParticipant) {
        match self
            .participants
            .iter_mut()
            .find(|p| p.user_id == participant.user_id)
        {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
        self.active = true;
    }

    fn set_connection_state(&mut self, user_id: UserId, state: PeerConnectionState) {
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.connection_state = state;
        }
    }

    fn set_speaking(&mut self, user_id: UserId, speaking: bool) {
        if let Some(p) = self.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.speaking = speaking;
        }
    }

    fn remove(&mut self, user_id: UserId) {
        self.participants.retain(|p| p.user_id != user_id);
        if self.participants.is_empty() {
            self.active = false;
            self.started_by = None;
            self.started_at = None;
        }
    }

    fn clear(&mut self) {
        self.participants.clear();
        self.active = false;
        self.started_by = None;
        self.started_at = None;
    }
}

struct PeerLink {
    conn: Arc<dyn PeerConnection>,
    caller: bool,
    remote_description_set: bool,
    /// Candidates that arrived before the remote description; flushed in
    /// arrival order once it is set, never dropped.
    queued_candidates: Vec<IceCandidate>,
    event_task: JoinHandle<()>,
}

struct EngineState {
    mic: Option<Arc<dyn LocalAudioTrack>>,
    peers: HashMap<UserId, PeerLink>,
    torn_down: bool,
}

/// Mesh negotiation for one audio room: a connection per remote peer, offers
/// initiated toward participants observed joining while we are already in
/// the room, answers for offers received, candidate relay both ways.
pub struct AudioSignalingEngine {
    session_id: SessionId,
    local_user: UserId,
    connector: Arc<dyn PeerConnector>,
    media: Arc<dyn MediaDevices>,
    live: Arc<dyn LiveChannel>,
    bus: EventBus,
    ice_servers: Vec<IceServer>,
    room: Mutex<AudioRoomState>,
    inner: Mutex<EngineState>,
}

impl AudioSignalingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: SessionId,
        local_user: UserId,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaDevices>,
        live: Arc<dyn LiveChannel>,
        bus: EventBus,
        ice_servers: Vec<IceServer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            local_user,
            connector,
            media,
            live,
            bus,
            ice_servers,
            room: Mutex::new(AudioRoomState::default()),
            inner: Mutex::new(EngineState {
                mic: None,
                peers: HashMap::new(),
                torn_down: false,
            }),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn room_snapshot(&self) -> AudioRoomState {
        self.room.lock().await.clone()
    }

    /// Acquires the exclusively-owned microphone once. Callers check the
    /// room state machine before invoking this to avoid redundant hardware
    /// permission prompts.
    pub async fn acquire_microphone(&self) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        if inner.mic.is_some() {
            return Ok(());
        }
        let track = self.media.acquire_microphone().await.map_err(|err| match err {
            MediaError::PermissionDenied => SyncError::PermissionDenied,
            other => SyncError::TransientNetwork(other.to_string()),
        })?;
        inner.mic = Some(track);
        Ok(())
    }

    pub async fn mark_started(&self, started_by: UserId, started_at: DateTime<Utc>) {
        let mut room = self.room.lock().await;
        room.started_by = Some(started_by);
        room.started_at = Some(started_at);
    }

    pub async fn add_participant(&self, user_id: UserId, display_name: String, muted: bool) {
        let connection_state = if user_id == self.local_user {
            PeerConnectionState::Connected
        } else {
            PeerConnectionState::New
        };
        self.room.lock().await.upsert(AudioParticipant {
            user_id,
            display_name,
            muted,
            speaking: false,
            connection_state,
        });
        self.bus.publish(BusEvent::AudioRoomChanged {
            session_id: self.session_id,
        });
    }

    /// Caller role: create the connection toward a newly observed remote
    /// participant and emit the offer. Idempotent per peer; whoever created
    /// the connection object first stays caller.
    pub async fn connect_to(self: &Arc<Self>, peer: UserId) -> Result<()> {
        if peer == self.local_user {
            return Ok(());
        }
        let conn = {
            let mut inner = self.inner.lock().await;
            if inner.torn_down {
                return Err(anyhow!("signaling engine is torn down"));
            }
            if inner.peers.contains_key(&peer) {
                return Ok(());
            }
            let conn = self.connector.create_connection(&self.ice_servers).await?;
            if let Some(mic) = inner.mic.clone() {
                conn.attach_local_audio(mic).await?;
            }
            let event_task = self.spawn_peer_event_task(peer, Arc::clone(&conn));
            inner.peers.insert(
                peer,
                PeerLink {
                    conn: Arc::clone(&conn),
                    caller: true,
                    remote_description_set: false,
                    queued_candidates: Vec::new(),
                    event_task,
                },
            );
            conn
        };

        self.room
            .lock()
            .await
            .set_connection_state(peer, PeerConnectionState::Connecting);

        let offer = conn.create_offer().await?;
        self.submit_signal(peer, SignalPayload::Offer { sdp: offer.sdp })
            .await?;
        info!(
            session_id = self.session_id.0,
            peer = peer.0,
            "offer sent as caller"
        );
        Ok(())
    }

    /// Callee role: answer an offer from a peer we have no connection for.
    /// A duplicate offer for an existing connection is dropped.
    pub async fn handle_offer(self: &Arc<Self>, from: UserId, sdp: String) -> Result<()> {
        let conn = {
            let mut inner = self.inner.lock().await;
            if inner.torn_down {
                return Ok(());
            }
            if inner.peers.contains_key(&from) {
                warn!(
                    session_id = self.session_id.0,
                    peer = from.0,
                    "dropping duplicate offer for existing connection"
                );
                return Ok(());
            }
            let conn = self.connector.create_connection(&self.ice_servers).await?;
            if let Some(mic) = inner.mic.clone() {
                conn.attach_local_audio(mic).await?;
            }
            let event_task = self.spawn_peer_event_task(from, Arc::clone(&conn));
            inner.peers.insert(
                from,
                PeerLink {
                    conn: Arc::clone(&conn),
                    caller: false,
                    remote_description_set: false,
                    queued_candidates: Vec::new(),
                    event_task,
                },
            );
            conn
        };

        self.room
            .lock()
            .await
            .set_connection_state(from, PeerConnectionState::Connecting);

        conn.set_remote_description(SessionDescription { sdp }).await?;
        self.mark_remote_description_set(from).await?;

        let answer = conn.create_answer().await?;
        self.submit_signal(from, SignalPayload::Answer { sdp: answer.sdp })
            .await?;
        info!(
            session_id = self.session_id.0,
            peer = from.0,
            "answer sent as callee"
        );
        Ok(())
    }

    pub async fn handle_answer(&self, from: UserId, sdp: String) -> Result<()> {
        let conn = {
            let inner = self.inner.lock().await;
            let Some(link) = inner.peers.get(&from) else {
                warn!(peer = from.0, "answer for unknown peer dropped");
                return Ok(());
            };
            if !link.caller {
                warn!(peer = from.0, "answer received on callee-side connection, dropped");
                return Ok(());
            }
            Arc::clone(&link.conn)
        };
        conn.set_remote_description(SessionDescription { sdp }).await?;
        self.mark_remote_description_set(from).await?;
        Ok(())
    }

    pub async fn handle_candidate(&self, from: UserId, candidate: IceCandidate) -> Result<()> {
        let conn = {
            let mut inner = self.inner.lock().await;
            let Some(link) = inner.peers.get_mut(&from) else {
                warn!(peer = from.0, "candidate for unknown peer dropped");
                return Ok(());
            };
            if !link.remote_description_set {
                link.queued_candidates.push(candidate);
                return Ok(());
            }
            Arc::clone(&link.conn)
        };
        conn.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn handle_peer_left(&self, peer: UserId) {
        let link = self.inner.lock().await.peers.remove(&peer);
        if let Some(link) = link {
            link.event_task.abort();
            link.conn.close().await;
        }
        self.room.lock().await.remove(peer);
        self.bus.publish(BusEvent::AudioRoomChanged {
            session_id: self.session_id,
        });
    }

    pub async fn set_local_muted(&self, muted: bool) {
        if let Some(mic) = self.inner.lock().await.mic.clone() {
            mic.set_enabled(!muted);
        }
        let mut room = self.room.lock().await;
        if let Some(p) = room
            .participants
            .iter_mut()
            .find(|p| p.user_id == self.local_user)
        {
            p.muted = muted;
        }
        drop(room);
        self.bus.publish(BusEvent::AudioRoomChanged {
            session_id: self.session_id,
        });
    }

    /// Releases the microphone, closes every peer connection, and clears the
    /// participant view. Safe to call when already torn down, and always run
    /// on error paths.
    pub async fn teardown(&self) {
        let (mic, links) = {
            let mut inner = self.inner.lock().await;
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            (
                inner.mic.take(),
                inner.peers.drain().collect::<Vec<(UserId, PeerLink)>>(),
            )
        };

        if let Some(mic) = mic {
            mic.set_enabled(false);
            mic.stop();
        }
        for (_, link) in links {
            link.event_task.abort();
            link.conn.close().await;
        }

        self.room.lock().await.clear();
        self.bus.publish(BusEvent::AudioRoomChanged {
            session_id: self.session_id,
        });
        info!(session_id = self.session_id.0, "audio signaling torn down");
    }

    async fn mark_remote_description_set(&self, peer: UserId) -> Result<()> {
        let (conn, queued) = {
            let mut inner = self.inner.lock().await;
            let Some(link) = inner.peers.get_mut(&peer) else {
                return Ok(());
            };
            link.remote_description_set = true;
            (Arc::clone(&link.conn), std::mem::take(&mut link.queued_candidates))
        };
        for candidate in queued {
            conn.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn submit_signal(&self, to: UserId, payload: SignalPayload) -> Result<()> {
        self.live
            .submit(ClientRequest::Signal {
                session_id: self.session_id,
                to_user_id: to,
                payload,
            })
            .await
    }

    fn spawn_peer_event_task(
        self: &Arc<Self>,
        peer: UserId,
        conn: Arc<dyn PeerConnection>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut events = conn.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    PeerEvent::ConnectionStateChanged(state) => {
                        debug!(peer = peer.0, ?state, "peer connection state changed");
                        if state.is_terminal() {
                            // Reported upward; retry is a user-initiated
                            // rejoin, never automatic.
                            warn!(peer = peer.0, ?state, "peer connection ended");
                            engine.handle_peer_left(peer).await;
                            break;
                        }
                        engine.room.lock().await.set_connection_state(peer, state);
                        engine.bus.publish(BusEvent::AudioRoomChanged {
                            session_id: engine.session_id,
                        });
                    }
                    PeerEvent::IceCandidate(candidate) => {
                        let payload = SignalPayload::Candidate {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                        };
                        if let Err(err) = engine.submit_signal(peer, payload).await {
                            warn!(peer = peer.0, error = %err, "failed to relay local candidate");
                        }
                    }
                    PeerEvent::RemoteAudioActivity { speaking } => {
                        engine.room.lock().await.set_speaking(peer, speaking);
                        engine.bus.publish(BusEvent::AudioRoomChanged {
                            session_id: engine.session_id,
                        });
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
