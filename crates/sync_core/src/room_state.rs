use std::sync::Arc;

use shared::domain::UserId;

use crate::{
    event_bus::{BusEvent, EventBus},
    rate_limit::{ActionKind, RateLimiter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Idle,
    Joining,
    Live,
    Muted,
    Leaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    JoinRoom,
    Joined,
    MuteMic,
    UnmuteMic,
    LeaveRoom,
    Left,
}

impl RoomState {
    /// The complete transition table. Anything not listed is undefined and
    /// rejected by `apply` as a no-op.
    pub fn next(self, event: RoomEvent) -> Option<RoomState> {
        use RoomEvent::*;
        use RoomState::*;
        match (self, event) {
            (Idle, JoinRoom) => Some(Joining),
            (Joining, Joined) => Some(Live),
            (Live, MuteMic) => Some(Muted),
            (Muted, UnmuteMic) => Some(Live),
            (Live, LeaveRoom) | (Muted, LeaveRoom) => Some(Leaving),
            (Leaving, Left) => Some(Idle),
            _ => None,
        }
    }

    pub fn is_joined(self) -> bool {
        matches!(self, RoomState::Live | RoomState::Muted)
    }

    /// States holding signaling resources that must be torn down when the
    /// participant abandons the room.
    pub fn holds_audio_resources(self) -> bool {
        matches!(self, RoomState::Joining | RoomState::Live | RoomState::Muted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied { from: RoomState, to: RoomState },
    /// The transition is undefined from the current state.
    Rejected,
    /// The rate limiter denied the action; state is unchanged.
    Throttled,
}

/// A participant's relationship to one audio room. Join and mic-toggle
/// transitions are rate-gated; callers check `can_transition` before
/// side-effecting work such as requesting microphone access.
pub struct AudioRoomStateMachine {
    user_id: UserId,
    limiter: Arc<RateLimiter>,
    bus: EventBus,
    state: RoomState,
}

impl AudioRoomStateMachine {
    pub fn new(user_id: UserId, limiter: Arc<RateLimiter>, bus: EventBus) -> Self {
        Self {
            user_id,
            limiter,
            bus,
            state: RoomState::Idle,
        }
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn can_transition(&self, event: RoomEvent) -> bool {
        self.state.next(event).is_some()
    }

    pub async fn apply(&mut self, event: RoomEvent) -> Transition {
        let Some(to) = self.state.next(event) else {
            return Transition::Rejected;
        };

        let gate = match event {
            RoomEvent::JoinRoom => Some(ActionKind::AudioRoomJoin),
            RoomEvent::MuteMic | RoomEvent::UnmuteMic => Some(ActionKind::MicToggle),
            _ => None,
        };
        if let Some(kind) = gate {
            if !self.limiter.allow(self.user_id, kind).await {
                self.bus.publish(BusEvent::SlowDown { kind });
                return Transition::Throttled;
            }
        }

        let from = self.state;
        self.state = to;
        Transition::Applied { from, to }
    }

    /// Forces the machine back to `Idle` after a failed join or a room that
    /// ended remotely, so the user can retry without a reload.
    pub fn reset(&mut self) {
        self.state = RoomState::Idle;
    }
}
