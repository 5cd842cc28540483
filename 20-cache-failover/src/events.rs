//! Health notifications for observers.
//!
//! Events are fanned out over a Tokio `broadcast` channel. Publishing never
//! blocks and never fails the publisher: with no subscribers the event is
//! simply dropped, and a subscriber that falls too far behind sees
//! `RecvError::Lagged`. Routing never depends on who is listening.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ServerId;
use crate::error::CacheError;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Issue,
    Remove,
    Reconnecting,
    Reconnected,
    Failure,
}

/// Snapshot attached to an `Issue` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueDetails {
    pub failures: u32,
    pub consecutive_failures: u32,
    pub locked_for: Duration,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A node failed and was locked.
    Issue {
        server: ServerId,
        details: IssueDetails,
    },
    /// A node was permanently taken out of the ring.
    Remove { server: ServerId },
    /// A reconnect cooldown started for a node.
    Reconnecting { server: ServerId, delay: Duration },
    /// A node served a request again after its cooldown.
    Reconnected { server: ServerId },
    /// A removed node left a request with nowhere to go.
    Failure { server: ServerId, error: CacheError },
}

impl HealthEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HealthEvent::Issue { .. } => EventKind::Issue,
            HealthEvent::Remove { .. } => EventKind::Remove,
            HealthEvent::Reconnecting { .. } => EventKind::Reconnecting,
            HealthEvent::Reconnected { .. } => EventKind::Reconnected,
            HealthEvent::Failure { .. } => EventKind::Failure,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            HealthEvent::Issue { server, .. }
            | HealthEvent::Remove { server }
            | HealthEvent::Reconnecting { server, .. }
            | HealthEvent::Reconnected { server }
            | HealthEvent::Failure { server, .. } => server,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HealthEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HealthEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            debug!(?kind, "no health subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(HealthEvent::Remove {
            server: "a:1".into(),
        });

        let seen = first.recv().await.expect("first subscriber");
        assert_eq!(seen.kind(), EventKind::Remove);
        assert_eq!(seen.server(), "a:1");
        assert_eq!(second.recv().await.expect("second subscriber"), seen);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(HealthEvent::Reconnected {
            server: "a:1".into(),
        });
    }
}
