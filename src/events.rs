//! Controller event log.
//!
//! Keeps a bounded history of what the controller observed and decided:
//! master election edges, published cluster states, and per-node reported,
//! wanted and current state changes. Every event is mirrored to `tracing`
//! and fanned out to broadcast subscribers; nothing in the control loop
//! waits on either.

use crate::state::Node;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default number of events retained.
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Event type categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Master election outcome changed.
    MasterElection,
    /// A new cluster state version was published.
    SystemState,
    /// A node reported a new state, or the controller inferred one.
    NodeReported,
    /// A node's wanted state changed.
    NodeWanted,
    /// A node's state in the published cluster state changed.
    NodeCurrent,
    /// Liveness registry changes.
    NodeLiveness,
    /// Coordination store and configuration events.
    Cluster,
}

/// One entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// Node the event is about; `None` for cluster-wide events.
    pub node: Option<Node>,
    pub description: String,
    /// Controller time in milliseconds.
    pub time_ms: u64,
}

impl Event {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.time_ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}

/// Bounded event log owned by the control loop.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<Event>,
    max_events: usize,
    sender: broadcast::Sender<Event>,
    is_master: bool,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            events: VecDeque::new(),
            max_events,
            sender,
            is_master: false,
        }
    }

    /// Node events are logged at info level on the master only.
    pub fn set_master(&mut self, is_master: bool) {
        self.is_master = is_master;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn add_cluster_event(&mut self, event_type: EventType, description: impl Into<String>, now: u64) {
        let description = description.into();
        info!(event = ?event_type, "{}", description);
        self.push(Event {
            event_type,
            node: None,
            description,
            time_ms: now,
        });
    }

    pub fn add_node_event(
        &mut self,
        node: Node,
        event_type: EventType,
        description: impl Into<String>,
        now: u64,
    ) {
        let description = description.into();
        if self.is_master {
            info!(node = %node, event = ?event_type, "{}", description);
        } else {
            debug!(node = %node, event = ?event_type, "{}", description);
        }
        self.push(Event {
            event_type,
            node: Some(node),
            description,
            time_ms: now,
        });
    }

    fn push(&mut self, event: Event) {
        let _ = self.sender.send(event.clone());
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    /// Events oldest first.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn node_events(&self, node: Node) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(move |e| e.node == Some(node))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_is_bounded() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.add_cluster_event(EventType::SystemState, format!("state {}", i), i);
        }
        assert_eq!(log.len(), 3);
        let first = log.events().next().unwrap();
        assert_eq!(first.description, "state 2");
    }

    #[test]
    fn test_node_events_filter() {
        let mut log = EventLog::default();
        log.add_node_event(Node::storage(1), EventType::NodeReported, "down", 1);
        log.add_node_event(Node::storage(2), EventType::NodeReported, "up", 2);
        log.add_cluster_event(EventType::MasterElection, "master", 3);
        assert_eq!(log.node_events(Node::storage(1)).count(), 1);
    }

    #[test]
    fn test_timestamp_conversion() {
        let event = Event {
            event_type: EventType::Cluster,
            node: None,
            description: String::new(),
            time_ms: 1_700_000_000_000,
        };
        assert_eq!(event.timestamp().unwrap().timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let mut log = EventLog::default();
        let mut rx = log.subscribe();
        log.add_cluster_event(EventType::Cluster, "store connected", 5);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.description, "store connected");
    }
}
