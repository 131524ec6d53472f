//! SSE endpoints over the activity hub.
//!
//! Each connection registers one subscriber; the stream opens with a
//! `{type:"connected"}` hello and emits `data:` events for every tool
//! invocation and turn boundary. Keepalive comments every 30 seconds
//! prevent idle proxies from dropping the connection. The subscriber
//! is removed when the connection's stream is dropped.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use delegate_runtime::{ActivityEvent, ActivityHub};

use crate::server::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unsubscribes when the connection's stream is dropped.
struct SubscriberGuard {
    hub: Arc<ActivityHub>,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

fn data_event(event: &ActivityEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

fn event_stream(
    hub: Arc<ActivityHub>,
    team_filter: Option<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (subscriber_id, rx) = hub.subscribe(team_filter);
    let guard = SubscriberGuard {
        hub,
        id: subscriber_id,
    };

    let hello = futures::stream::once(async { Ok(data_event(&ActivityEvent::Connected)) });
    // The guard lives inside the closure: dropping the stream (client
    // disconnect) drops the closure and unsubscribes.
    let events = UnboundedReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok(data_event(&event))
    });

    Sse::new(hello.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    )
}

/// `GET /stream` — every team's activity.
pub async fn global_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_stream(state.hub.clone(), None)
}

/// `GET /teams/{team}/activity/stream` — one team's activity.
pub async fn team_stream(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_stream(state.hub.clone(), Some(team))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_guard_unsubscribes_on_drop() {
        let hub = Arc::new(ActivityHub::new());
        let (id, rx) = hub.subscribe(None);
        assert_eq!(hub.subscriber_count(), 1);
        let guard = SubscriberGuard {
            hub: hub.clone(),
            id,
        };
        drop(guard);
        assert_eq!(hub.subscriber_count(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn test_stream_emits_hello_then_events() {
        let hub = Arc::new(ActivityHub::new());
        let (id, rx) = hub.subscribe(None);
        let guard = SubscriberGuard {
            hub: hub.clone(),
            id,
        };

        let hello =
            futures::stream::once(async { Ok::<_, Infallible>(data_event(&ActivityEvent::Connected)) });
        let mut stream = Box::pin(hello.chain(UnboundedReceiverStream::new(rx).map(
            move |event| {
                let _ = &guard;
                Ok::<_, Infallible>(data_event(&event))
            },
        )));

        assert!(stream.next().await.unwrap().is_ok());
        hub.broadcast(ActivityEvent::TeamsRefresh);
        assert!(stream.next().await.unwrap().is_ok());

        // Dropping the connection's stream removes the subscriber.
        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
