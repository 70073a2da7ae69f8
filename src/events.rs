//! Typed, per-topic publish/subscribe event bus for internal state
//! transitions.
//!
//! Generalizes the teacher's `broadcast::Sender<P2pEvent>` /
//! `broadcast::Sender<LogEntry>` pair into N independent topics so a slow
//! subscriber on one topic can never back up another. Each topic is a
//! bounded `tokio::sync::broadcast` channel (multi-producer/multi-consumer);
//! on overflow the oldest buffered event is dropped and the lagging
//! subscriber's next `recv()` returns `Lagged`, exactly as the channel
//! already guarantees — there is no additional queue to manage.
//!
//! "Stateful-emitter" topics (connectivity, realm membership) additionally
//! cache their latest value and replay it to a freshly-subscribed receiver,
//! so a late subscriber doesn't have to wait for the next transition to
//! learn the current state — this replaces the "listener callback that
//! fires immediately with current state" pattern from the source.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use libp2p::{Multiaddr, PeerId};
use tokio::sync::broadcast;

use crate::{disconnect::PeerConnectionState, error::P2pError};

pub const DEFAULT_TOPIC_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connectivity,
    Relay,
    HolePunch,
    Realm,
    Disconnect,
}

/// Events published onto the bus. Variants are deliberately flat (no nested
/// enums per subsystem) so a subscriber can match on one type regardless of
/// topic.
#[derive(Debug, Clone)]
pub enum Event {
    /// The set of addresses this node believes are externally reachable
    /// changed (reachability engine, §4.1).
    AddressSetChanged { publishable: Vec<Multiaddr> },
    /// A dial attempt to `peer_id` completed.
    DialSucceeded { peer_id: PeerId, via_relay: bool },
    DialFailed { peer_id: PeerId, error: String },
    /// A relay reservation was confirmed; this node is reachable through
    /// `relay_peer_id` via a circuit.
    RelayReservationConfirmed { relay_peer_id: PeerId },
    RelayReservationLost { relay_peer_id: PeerId },
    /// A hole-punch attempt against `peer_id` completed.
    HolePunchSucceeded { peer_id: PeerId },
    HolePunchFailed { peer_id: PeerId, attempts: u32 },
    /// This node joined or left a realm.
    RealmJoined { realm_id: [u8; 32] },
    RealmLeft { realm_id: [u8; 32] },
    MemberAdded { peer_id: PeerId },
    MemberRemoved { peer_id: PeerId, graceful: bool },
    /// A peer's connection-state machine transitioned.
    PeerStateChanged {
        peer_id: PeerId,
        state: PeerConnectionState,
    },
}

struct TopicChannel {
    tx: broadcast::Sender<Event>,
    last: Mutex<Option<Event>>,
}

/// A typed, multi-topic, multi-producer/multi-consumer event bus.
#[derive(Clone)]
pub struct EventBus {
    buffer: usize,
    topics: Arc<Mutex<HashMap<Topic, Arc<TopicChannel>>>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn channel(&self, topic: Topic) -> Arc<TopicChannel> {
        let mut topics = self.topics.lock().unwrap();
        Arc::clone(topics.entry(topic).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(self.buffer);
            Arc::new(TopicChannel {
                tx,
                last: Mutex::new(None),
            })
        }))
    }

    /// Publish `event` on `topic`. Never blocks; if there are no
    /// subscribers the event is simply dropped.
    pub fn publish(&self, topic: Topic, event: Event) {
        let ch = self.channel(topic);
        *ch.last.lock().unwrap() = Some(event.clone());
        let _ = ch.tx.send(event);
    }

    /// Subscribe to `topic`. Does not replay past events.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Event> {
        self.channel(topic).tx.subscribe()
    }

    /// Subscribe to `topic` and, if a value has already been published,
    /// return it immediately alongside the live receiver — the
    /// "stateful-emitter" behavior for state-shaped topics.
    pub fn subscribe_with_replay(&self, topic: Topic) -> (Option<Event>, broadcast::Receiver<Event>) {
        let ch = self.channel(topic);
        let last = ch.last.lock().unwrap().clone();
        (last, ch.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_BUFFER)
    }
}

/// Helper used by subscribers that want a plain `Result`-shaped recv,
/// collapsing `Lagged` into a retry rather than an error — the bus makes no
/// ordering guarantee across a lag, so callers that need strict ordering
/// must use `subscribe_with_replay` and treat a lag as "state may have
/// skipped".
pub async fn recv_skipping_lag(rx: &mut broadcast::Receiver<Event>) -> Result<Event, P2pError> {
    loop {
        match rx.recv().await {
            Ok(event) => return Ok(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(P2pError::shutdown()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_returns_latest_value_to_new_subscriber() {
        let bus = EventBus::new(4);
        bus.publish(
            Topic::Realm,
            Event::RealmJoined {
                realm_id: [1u8; 32],
            },
        );
        let (replayed, _rx) = bus.subscribe_with_replay(Topic::Realm);
        assert!(matches!(replayed, Some(Event::RealmJoined { .. })));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new(4);
        let mut relay_rx = bus.subscribe(Topic::Relay);
        bus.publish(
            Topic::Realm,
            Event::RealmJoined {
                realm_id: [0u8; 32],
            },
        );
        assert!(relay_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_not_newest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(Topic::Disconnect);
        for i in 0..5u8 {
            bus.publish(
                Topic::Disconnect,
                Event::MemberRemoved {
                    peer_id: PeerId::random(),
                    graceful: i % 2 == 0,
                },
            );
        }
        // The receiver lagged; skipping past it should land on the latest event.
        let event = recv_skipping_lag(&mut rx).await.unwrap();
        assert!(matches!(event, Event::MemberRemoved { .. }));
    }
}
