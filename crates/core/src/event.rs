//! Typed service-event bus.
//!
//! Subscriptions carry an event kind, an optional service-name prefix
//! filter and a flume sender; dispatch happens synchronously on the
//! reactor thread and never blocks (the channels are unbounded).

use std::collections::HashMap;

use nan_wire::EtherAddr;

/// Why a publish or subscribe instance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Timeout,
    UserRequest,
    Failure,
}

/// Events produced by the service engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A subscribed service was discovered on a peer.
    DiscoveryResult {
        subscribe_id: u8,
        publish_id: u8,
        address: EtherAddr,
        service_update_indicator: u8,
        service_info: Vec<u8>,
    },
    /// A solicited publish was answered.
    Replied {
        publish_id: u8,
        subscribe_id: u8,
        address: EtherAddr,
        service_info: Vec<u8>,
    },
    /// A follow-up addressed to this device arrived.
    Receive {
        instance_id: u8,
        peer_instance_id: u8,
        address: EtherAddr,
        service_info: Vec<u8>,
    },
    PublishTerminated {
        publish_id: u8,
        reason: TerminationReason,
    },
    SubscribeTerminated {
        subscribe_id: u8,
        reason: TerminationReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DiscoveryResult,
    Replied,
    Receive,
    PublishTerminated,
    SubscribeTerminated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DiscoveryResult => "DISCOVERY RESULT",
            EventKind::Replied => "REPLIED",
            EventKind::Receive => "RECEIVE",
            EventKind::PublishTerminated => "PUBLISH TERMINATED",
            EventKind::SubscribeTerminated => "SUBSCRIBE TERMINATED",
        }
    }
}

impl ServiceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServiceEvent::DiscoveryResult { .. } => EventKind::DiscoveryResult,
            ServiceEvent::Replied { .. } => EventKind::Replied,
            ServiceEvent::Receive { .. } => EventKind::Receive,
            ServiceEvent::PublishTerminated { .. } => EventKind::PublishTerminated,
            ServiceEvent::SubscribeTerminated { .. } => EventKind::SubscribeTerminated,
        }
    }
}

/// Opaque handle to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    kind: EventKind,
    name_prefix: Option<String>,
    sender: flume::Sender<ServiceEvent>,
}

/// Registry of event subscriptions.
#[derive(Default)]
pub struct EventBus {
    subscriptions: HashMap<u64, Subscription>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for events of `kind`; with a prefix, only events whose
    /// service name starts with it are delivered.
    pub fn subscribe(
        &mut self,
        kind: EventKind,
        name_prefix: Option<String>,
    ) -> (SubscriptionId, flume::Receiver<ServiceEvent>) {
        let (sender, receiver) = flume::unbounded();
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                kind,
                name_prefix,
                sender,
            },
        );
        (SubscriptionId(id), receiver)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.remove(&id.0);
    }

    /// Deliver an event to every matching subscription.
    pub fn dispatch(&mut self, service_name: &str, event: &ServiceEvent) {
        let kind = event.kind();
        // Disconnected receivers are dropped on the way through.
        let dead: Vec<u64> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| {
                sub.kind == kind
                    && sub
                        .name_prefix
                        .as_deref()
                        .map_or(true, |prefix| service_name.starts_with(prefix))
            })
            .filter(|(_, sub)| sub.sender.send(event.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();

        for id in dead {
            self.subscriptions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive_event() -> ServiceEvent {
        ServiceEvent::Receive {
            instance_id: 1,
            peer_instance_id: 2,
            address: EtherAddr([2, 0, 0, 0, 0, 9]),
            service_info: b"hi".to_vec(),
        }
    }

    #[test]
    fn dispatch_reaches_matching_subscription() {
        let mut bus = EventBus::new();
        let (_id, rx) = bus.subscribe(EventKind::Receive, None);

        bus.dispatch("chat", &receive_event());

        assert_eq!(rx.try_recv().unwrap(), receive_event());
    }

    #[test]
    fn prefix_filter_applies() {
        let mut bus = EventBus::new();
        let (_a, chat) = bus.subscribe(EventKind::Receive, Some("chat".into()));
        let (_b, game) = bus.subscribe(EventKind::Receive, Some("game".into()));

        bus.dispatch("chat.room1", &receive_event());

        assert!(chat.try_recv().is_ok());
        assert!(game.try_recv().is_err());
    }

    #[test]
    fn kind_filter_applies() {
        let mut bus = EventBus::new();
        let (_id, rx) = bus.subscribe(EventKind::DiscoveryResult, None);

        bus.dispatch("chat", &receive_event());

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let (id, rx) = bus.subscribe(EventKind::Receive, None);
        bus.unsubscribe(id);

        bus.dispatch("chat", &receive_event());

        assert!(rx.try_recv().is_err());
    }
}
