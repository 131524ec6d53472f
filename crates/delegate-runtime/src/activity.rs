//! Activity hub — pub/sub fan-out of tool and turn events to SSE
//! subscribers. Subscribers get an unbounded channel each, optionally
//! filtered by team, and must unsubscribe when their connection drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// One event on the activity stream (§6.5 payloads).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    Connected,
    Tool {
        agent: String,
        team: String,
        tool: String,
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
    },
    TurnStarted {
        agent: String,
        team: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    TurnEnded {
        agent: String,
        team: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },
    TeamsRefresh,
}

impl ActivityEvent {
    /// Team this event belongs to; `None` for global events.
    fn team(&self) -> Option<&str> {
        match self {
            Self::Tool { team, .. }
            | Self::TurnStarted { team, .. }
            | Self::TurnEnded { team, .. } => Some(team),
            Self::Connected | Self::TeamsRefresh => None,
        }
    }
}

struct Subscriber {
    team_filter: Option<String>,
    tx: mpsc::UnboundedSender<ActivityEvent>,
}

/// Process-scoped registry of activity subscribers.
#[derive(Default)]
pub struct ActivityHub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl ActivityHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; `team_filter` limits delivery to one
    /// team's events (global events always pass). Returns the id for
    /// `unsubscribe` and the receiving end of the channel.
    pub fn subscribe(
        &self,
        team_filter: Option<String>,
    ) -> (u64, mpsc::UnboundedReceiver<ActivityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { team_filter, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Fan an event out to every matching subscriber. Dead channels
    /// (dropped receivers) are pruned as they are found.
    pub fn broadcast(&self, event: ActivityEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        let mut dead = Vec::new();
        for (id, sub) in subscribers.iter() {
            let matches = match (&sub.team_filter, event.team()) {
                (Some(filter), Some(team)) => filter == team,
                _ => true,
            };
            if matches && sub.tx.send(event.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }
}
