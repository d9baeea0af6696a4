//! Publish/Subscribe registry and service-discovery handling.

use std::collections::HashMap;

use bitcoin_hashes::{sha256, Hash};
use tracing::{debug, trace, warn};

use nan_wire::attrs::{ServiceControlType, ServiceDescriptor, ServiceId};
use nan_wire::EtherAddr;

use crate::event::{ServiceEvent, TerminationReason};

/// Derive the service id: first six bytes of SHA-256 over the lowercased
/// name.
pub fn service_id_for(service_name: &str) -> ServiceId {
    let lowered = service_name.to_lowercase();
    let hash = sha256::Hash::hash(lowered.as_bytes());
    let digest = hash.into_inner();
    let mut id = [0u8; 6];
    id.copy_from_slice(&digest[..6]);
    ServiceId(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishType {
    Unsolicited,
    Solicited,
    Both,
}

impl PublishType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishType::Unsolicited => "UNSOLICITED",
            PublishType::Solicited => "SOLICITED",
            PublishType::Both => "BOTH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeType {
    Passive,
    Active,
}

impl SubscribeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscribeType::Passive => "PASSIVE",
            SubscribeType::Active => "ACTIVE",
        }
    }
}

/// Role-specific part of a service registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKind {
    Published {
        publish_type: PublishType,
        /// Solicited publish matched by a subscribe; announce once and
        /// clear.
        do_publish: bool,
    },
    Subscribed {
        subscribe_type: SubscribeType,
        /// A matching publish was observed; active announcing stops.
        is_subscribed: bool,
    },
}

#[derive(Debug, Clone)]
pub struct Service {
    pub service_name: String,
    pub service_id: ServiceId,
    pub instance_id: u8,
    pub kind: ServiceKind,
    pub service_specific_info: Vec<u8>,
    /// Remaining announcements; negative means unbounded.
    pub time_to_live: i32,
    pub service_update_indicator: u8,
}

impl Service {
    pub fn is_published(&self) -> bool {
        matches!(self.kind, ServiceKind::Published { .. })
    }

    pub fn is_subscribed_kind(&self) -> bool {
        matches!(self.kind, ServiceKind::Subscribed { .. })
    }

    /// Whether this service belongs in the next service-discovery frame.
    pub fn should_announce(&self) -> bool {
        match &self.kind {
            ServiceKind::Published {
                publish_type,
                do_publish,
            } => {
                if self.time_to_live == 0 {
                    return false;
                }
                !(*publish_type == PublishType::Solicited && !do_publish)
            }
            ServiceKind::Subscribed {
                subscribe_type,
                is_subscribed,
            } => {
                *subscribe_type == SubscribeType::Active
                    && !is_subscribed
                    && self.time_to_live != 0
            }
        }
    }
}

/// Filter for registry lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFilter {
    Published,
    Subscribed,
    Any,
}

impl ServiceFilter {
    fn matches(&self, service: &Service) -> bool {
        match self {
            ServiceFilter::Published => service.is_published(),
            ServiceFilter::Subscribed => service.is_subscribed_kind(),
            ServiceFilter::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("service name already registered")]
    AlreadyRegistered,
    #[error("unknown service instance")]
    UnknownInstance,
}

/// The service registry: primary map keyed by instance id, secondary
/// index by service id.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<u8, Service>,
    by_service_id: HashMap<ServiceId, Vec<u8>>,
    last_instance_id: u8,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next non-zero instance id; zero is reserved for "unassigned".
    fn next_instance_id(&mut self) -> u8 {
        loop {
            self.last_instance_id = self.last_instance_id.wrapping_add(1);
            if self.last_instance_id == 0 {
                continue;
            }
            if !self.services.contains_key(&self.last_instance_id) {
                return self.last_instance_id;
            }
        }
    }

    fn insert(&mut self, service: Service) -> u8 {
        let instance_id = service.instance_id;
        self.by_service_id
            .entry(service.service_id)
            .or_default()
            .push(instance_id);
        self.services.insert(instance_id, service);
        instance_id
    }

    pub fn publish(
        &mut self,
        service_name: &str,
        publish_type: PublishType,
        time_to_live: i32,
        service_specific_info: &[u8],
    ) -> Result<u8, ServiceError> {
        if self.get_by_name(service_name, ServiceFilter::Any).is_some() {
            return Err(ServiceError::AlreadyRegistered);
        }
        let instance_id = self.next_instance_id();
        Ok(self.insert(Service {
            service_name: service_name.to_owned(),
            service_id: service_id_for(service_name),
            instance_id,
            kind: ServiceKind::Published {
                publish_type,
                do_publish: false,
            },
            service_specific_info: service_specific_info.to_vec(),
            time_to_live,
            service_update_indicator: 0,
        }))
    }

    pub fn subscribe(
        &mut self,
        service_name: &str,
        subscribe_type: SubscribeType,
        time_to_live: i32,
        service_specific_info: &[u8],
    ) -> Result<u8, ServiceError> {
        if self.get_by_name(service_name, ServiceFilter::Any).is_some() {
            return Err(ServiceError::AlreadyRegistered);
        }
        let instance_id = self.next_instance_id();
        Ok(self.insert(Service {
            service_name: service_name.to_owned(),
            service_id: service_id_for(service_name),
            instance_id,
            kind: ServiceKind::Subscribed {
                subscribe_type,
                is_subscribed: false,
            },
            service_specific_info: service_specific_info.to_vec(),
            time_to_live,
            service_update_indicator: 0,
        }))
    }

    /// Replace the service-specific info of a publish instance.
    pub fn update_publish(
        &mut self,
        publish_id: u8,
        service_specific_info: &[u8],
    ) -> Result<(), ServiceError> {
        match self.services.get_mut(&publish_id) {
            Some(service) if service.is_published() => {
                service.service_specific_info = service_specific_info.to_vec();
                service.service_update_indicator = service.service_update_indicator.wrapping_add(1);
                Ok(())
            }
            _ => Err(ServiceError::UnknownInstance),
        }
    }

    pub fn cancel_publish(&mut self, publish_id: u8) -> Result<Service, ServiceError> {
        self.remove(publish_id, ServiceFilter::Published)
    }

    pub fn cancel_subscribe(&mut self, subscribe_id: u8) -> Result<Service, ServiceError> {
        self.remove(subscribe_id, ServiceFilter::Subscribed)
    }

    fn remove(&mut self, instance_id: u8, filter: ServiceFilter) -> Result<Service, ServiceError> {
        match self.services.get(&instance_id) {
            Some(service) if filter.matches(service) => {}
            _ => return Err(ServiceError::UnknownInstance),
        }
        let service = self.services.remove(&instance_id).expect("checked above");
        if let Some(ids) = self.by_service_id.get_mut(&service.service_id) {
            ids.retain(|id| *id != instance_id);
            if ids.is_empty() {
                self.by_service_id.remove(&service.service_id);
            }
        }
        Ok(service)
    }

    pub fn get(&self, instance_id: u8) -> Option<&Service> {
        self.services.get(&instance_id)
    }

    pub fn get_filtered(&self, instance_id: u8, filter: ServiceFilter) -> Option<&Service> {
        self.services
            .get(&instance_id)
            .filter(|service| filter.matches(service))
    }

    pub fn get_by_service_id(&self, id: &ServiceId, filter: ServiceFilter) -> Option<&Service> {
        self.by_service_id
            .get(id)?
            .iter()
            .filter_map(|instance| self.services.get(instance))
            .find(|service| filter.matches(service))
    }

    pub fn get_by_name(&self, service_name: &str, filter: ServiceFilter) -> Option<&Service> {
        self.services
            .values()
            .find(|service| service.service_name == service_name && filter.matches(service))
    }

    pub fn published(&self) -> impl Iterator<Item = &Service> {
        self.services.values().filter(|s| s.is_published())
    }

    pub fn subscribed(&self) -> impl Iterator<Item = &Service> {
        self.services.values().filter(|s| s.is_subscribed_kind())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Instance ids to include in the next service-discovery frame.
    pub fn announce_candidates(&self) -> Vec<u8> {
        self.services
            .values()
            .filter(|service| service.should_announce())
            .map(|service| service.instance_id)
            .collect()
    }

    /// Post-announcement bookkeeping: burn TTL, clear solicited latches,
    /// and terminate services whose announcement budget ran out.
    pub fn update_after_announce(&mut self, announced: &[u8]) -> Vec<(String, ServiceEvent)> {
        let mut events = Vec::new();

        for &instance_id in announced {
            let expired = {
                let Some(service) = self.services.get_mut(&instance_id) else {
                    continue;
                };
                if service.time_to_live > 0 {
                    service.time_to_live -= 1;
                }
                if let ServiceKind::Published { do_publish, .. } = &mut service.kind {
                    *do_publish = false;
                }
                if service.time_to_live == 0 {
                    Some((service.service_name.clone(), service.is_published()))
                } else {
                    None
                }
            };

            if let Some((name, is_published)) = expired {
                let (event, filter) = if is_published {
                    (
                        ServiceEvent::PublishTerminated {
                            publish_id: instance_id,
                            reason: TerminationReason::Timeout,
                        },
                        ServiceFilter::Published,
                    )
                } else {
                    (
                        ServiceEvent::SubscribeTerminated {
                            subscribe_id: instance_id,
                            reason: TerminationReason::Timeout,
                        },
                        ServiceFilter::Subscribed,
                    )
                };
                let _ = self.remove(instance_id, filter);
                events.push((name, event));
            }
        }
        events
    }

    /// React to a received service descriptor. Returns the event to
    /// dispatch, if any, paired with the local service name.
    pub fn on_received_descriptor(
        &mut self,
        self_address: &EtherAddr,
        source: &EtherAddr,
        destination: &EtherAddr,
        descriptor: &ServiceDescriptor,
    ) -> Option<(String, ServiceEvent)> {
        match descriptor.control.control_type {
            ServiceControlType::Publish => {
                let Some(service) = self
                    .get_by_service_id(&descriptor.service_id, ServiceFilter::Subscribed)
                else {
                    trace!(
                        target: "nan::service",
                        "publish for unknown service: {}", descriptor.service_id
                    );
                    return None;
                };
                let name = service.service_name.clone();
                let event = ServiceEvent::DiscoveryResult {
                    subscribe_id: service.instance_id,
                    publish_id: descriptor.instance_id,
                    address: *source,
                    service_update_indicator: service.service_update_indicator,
                    service_info: descriptor.service_info.clone(),
                };
                let instance_id = service.instance_id;
                if let Some(service) = self.services.get_mut(&instance_id) {
                    if let ServiceKind::Subscribed { is_subscribed, .. } = &mut service.kind {
                        *is_subscribed = true;
                    }
                }
                Some((name, event))
            }
            ServiceControlType::Subscribe => {
                let Some(service) = self
                    .get_by_service_id(&descriptor.service_id, ServiceFilter::Published)
                else {
                    trace!(
                        target: "nan::service",
                        "subscribe for unknown service: {}", descriptor.service_id
                    );
                    return None;
                };
                let instance_id = service.instance_id;
                if let Some(service) = self.services.get_mut(&instance_id) {
                    if let ServiceKind::Published { do_publish, .. } = &mut service.kind {
                        debug!(
                            target: "nan::service",
                            "solicited publish latched for {}", service.service_name
                        );
                        *do_publish = true;
                    }
                }
                None
            }
            ServiceControlType::FollowUp => {
                // Follow-ups are unicast; only ours matter.
                if destination != self_address {
                    return None;
                }
                let Some(service) =
                    self.get_by_service_id(&descriptor.service_id, ServiceFilter::Any)
                else {
                    warn!(
                        target: "nan::service",
                        "follow-up for unknown service: {}", descriptor.service_id
                    );
                    return None;
                };
                let event = ServiceEvent::Receive {
                    instance_id: service.instance_id,
                    peer_instance_id: descriptor.instance_id,
                    address: *source,
                    service_info: descriptor.service_info.clone(),
                };
                Some((service.service_name.clone(), event))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nan_wire::attrs::SdControl;

    fn descriptor(control_type: ServiceControlType, name: &str, info: &[u8]) -> ServiceDescriptor {
        ServiceDescriptor {
            service_id: service_id_for(name),
            instance_id: 42,
            requestor_instance_id: 0,
            control: SdControl::new(control_type),
            service_info: info.to_vec(),
        }
    }

    fn self_addr() -> EtherAddr {
        EtherAddr([2, 0, 0, 0, 0, 1])
    }

    fn peer_addr() -> EtherAddr {
        EtherAddr([2, 0, 0, 0, 0, 2])
    }

    #[test]
    fn service_id_is_sha256_of_lowercased_name() {
        // Deterministic and case-insensitive.
        assert_eq!(service_id_for("Chat"), service_id_for("chat"));
        assert_ne!(service_id_for("chat"), service_id_for("chat2"));

        let digest = sha256::Hash::hash(b"chat").into_inner();
        assert_eq!(service_id_for("CHAT").0, digest[..6]);
    }

    #[test]
    fn instance_ids_are_non_zero_and_unique() {
        let mut registry = ServiceRegistry::new();
        let mut seen = std::collections::HashSet::new();

        for i in 0..20 {
            let id = registry
                .publish(&format!("svc{i}"), PublishType::Unsolicited, -1, b"")
                .unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn instance_id_wrap_skips_zero_and_live_ids() {
        let mut registry = ServiceRegistry::new();
        registry.last_instance_id = 254;
        let a = registry.publish("a", PublishType::Unsolicited, -1, b"").unwrap();
        let b = registry.publish("b", PublishType::Unsolicited, -1, b"").unwrap();

        assert_eq!(a, 255);
        assert_ne!(b, 0);
        assert_ne!(b, 255);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let mut registry = ServiceRegistry::new();
        registry.publish("chat", PublishType::Both, -1, b"").unwrap();

        assert_eq!(
            registry.subscribe("chat", SubscribeType::Passive, -1, b""),
            Err(ServiceError::AlreadyRegistered)
        );
    }

    #[test]
    fn announce_candidates_follow_the_rules() {
        let mut registry = ServiceRegistry::new();
        let unsolicited = registry
            .publish("pub-unsolicited", PublishType::Unsolicited, -1, b"")
            .unwrap();
        let solicited = registry
            .publish("pub-solicited", PublishType::Solicited, -1, b"")
            .unwrap();
        let active = registry
            .subscribe("sub-active", SubscribeType::Active, -1, b"")
            .unwrap();
        let _passive = registry
            .subscribe("sub-passive", SubscribeType::Passive, -1, b"")
            .unwrap();

        let mut candidates = registry.announce_candidates();
        candidates.sort_unstable();
        let mut expected = vec![unsolicited, active];
        expected.sort_unstable();
        assert_eq!(candidates, expected);

        // A matching subscribe latches the solicited publish in.
        let descriptor = descriptor(ServiceControlType::Subscribe, "pub-solicited", b"");
        registry.on_received_descriptor(&self_addr(), &peer_addr(), &self_addr(), &descriptor);
        assert!(registry.announce_candidates().contains(&solicited));
    }

    #[test]
    fn announce_burns_ttl_and_terminates_at_zero() {
        let mut registry = ServiceRegistry::new();
        let id = registry
            .publish("short-lived", PublishType::Unsolicited, 2, b"")
            .unwrap();

        assert!(registry.update_after_announce(&[id]).is_empty());
        let events = registry.update_after_announce(&[id]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "short-lived");
        assert_eq!(
            events[0].1,
            ServiceEvent::PublishTerminated {
                publish_id: id,
                reason: TerminationReason::Timeout
            }
        );
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn unbounded_ttl_never_terminates() {
        let mut registry = ServiceRegistry::new();
        let id = registry
            .publish("stay", PublishType::Unsolicited, -1, b"")
            .unwrap();

        for _ in 0..10 {
            assert!(registry.update_after_announce(&[id]).is_empty());
        }
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn publish_descriptor_yields_discovery_result() {
        let mut registry = ServiceRegistry::new();
        let subscribe_id = registry
            .subscribe("chat", SubscribeType::Passive, -1, b"")
            .unwrap();

        let descriptor = descriptor(ServiceControlType::Publish, "chat", b"info");
        let (name, event) = registry
            .on_received_descriptor(&self_addr(), &peer_addr(), &EtherAddr::BROADCAST, &descriptor)
            .unwrap();

        assert_eq!(name, "chat");
        assert_eq!(
            event,
            ServiceEvent::DiscoveryResult {
                subscribe_id,
                publish_id: 42,
                address: peer_addr(),
                service_update_indicator: 0,
                service_info: b"info".to_vec(),
            }
        );
        // The active-announce latch closed.
        let service = registry.get(subscribe_id).unwrap();
        assert_eq!(
            service.kind,
            ServiceKind::Subscribed {
                subscribe_type: SubscribeType::Passive,
                is_subscribed: true
            }
        );
    }

    #[test]
    fn follow_up_requires_our_address() {
        let mut registry = ServiceRegistry::new();
        let id = registry
            .publish("chat", PublishType::Both, -1, b"")
            .unwrap();
        let descriptor = descriptor(ServiceControlType::FollowUp, "chat", b"hi");

        // Addressed elsewhere: dropped.
        assert!(registry
            .on_received_descriptor(&self_addr(), &peer_addr(), &peer_addr(), &descriptor)
            .is_none());

        // Addressed to us: a receive event.
        let (_, event) = registry
            .on_received_descriptor(&self_addr(), &peer_addr(), &self_addr(), &descriptor)
            .unwrap();
        assert_eq!(
            event,
            ServiceEvent::Receive {
                instance_id: id,
                peer_instance_id: 42,
                address: peer_addr(),
                service_info: b"hi".to_vec(),
            }
        );
    }

    #[test]
    fn update_publish_bumps_the_indicator() {
        let mut registry = ServiceRegistry::new();
        let id = registry.publish("chat", PublishType::Both, -1, b"v1").unwrap();

        registry.update_publish(id, b"v2").unwrap();

        let service = registry.get(id).unwrap();
        assert_eq!(service.service_specific_info, b"v2");
        assert_eq!(service.service_update_indicator, 1);

        assert_eq!(
            registry.update_publish(99, b""),
            Err(ServiceError::UnknownInstance)
        );
    }
}
