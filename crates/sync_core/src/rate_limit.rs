use std::{collections::HashMap, time::Duration};

use shared::domain::UserId;
use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    MessageSend,
    TypingSignal,
    MicToggle,
    AudioRoomJoin,
}

impl ActionKind {
    pub fn label(self) -> &'static str {
        match self {
            ActionKind::MessageSend => "message send",
            ActionKind::TypingSignal => "typing signal",
            ActionKind::MicToggle => "mic toggle",
            ActionKind::AudioRoomJoin => "audio room join",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub max: u32,
    pub window: Duration,
}

#[derive(Debug)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Fixed-window throttle per (user, action kind). Denial has no side effect
/// beyond bucket bookkeeping; surfacing feedback is the caller's job.
pub struct RateLimiter {
    limits: HashMap<ActionKind, WindowLimit>,
    buckets: Mutex<HashMap<(UserId, ActionKind), Bucket>>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<ActionKind, WindowLimit>) -> Self {
        Self {
            limits,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_limits() -> Self {
        let mut limits = HashMap::new();
        limits.insert(
            ActionKind::MessageSend,
            WindowLimit {
                max: 5,
                window: Duration::from_secs(1),
            },
        );
        limits.insert(
            ActionKind::TypingSignal,
            WindowLimit {
                max: 1,
                window: Duration::from_secs(1),
            },
        );
        limits.insert(
            ActionKind::MicToggle,
            WindowLimit {
                max: 1,
                window: Duration::from_millis(500),
            },
        );
        limits.insert(
            ActionKind::AudioRoomJoin,
            WindowLimit {
                max: 1,
                window: Duration::from_secs(3),
            },
        );
        Self::new(limits)
    }

    pub async fn allow(&self, user_id: UserId, kind: ActionKind) -> bool {
        let Some(limit) = self.limits.get(&kind).copied() else {
            return true;
        };

        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry((user_id, kind)).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now.duration_since(bucket.window_start) >= limit.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        if bucket.count >= limit.max {
            return false;
        }

        bucket.count += 1;
        true
    }
}
