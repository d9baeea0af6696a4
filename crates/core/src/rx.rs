//! The receive pipeline: radiotap → FCS → 802.11 → NAN dispatch.
//!
//! Every failure is a value. Parse errors drop the frame (the daemon may
//! dump it); ignores are traced and dropped. State mutated before a
//! failure stays mutated, per the recoverability contract.

use tracing::{debug, trace, warn};

use nan_wire::attrs::{
    self, Attributes, MasterIndication, ClusterAttribute, ServiceControlType, ServiceDescriptor,
    ServiceDescriptorExtension,
};
use nan_wire::buf::ByteReader;
use nan_wire::ether::{EtherAddr, Oui};
use nan_wire::frame::{
    self, BeaconKind, BeaconParseError, ACTION_HEADER_LEN, NAN_NETWORK_ID, NAN_OUI,
    NAN_OUI_TYPE_ACTION, NAN_OUI_TYPE_SERVICE_DISCOVERY, SERVICE_DISCOVERY_HEADER_LEN,
};
use nan_wire::ieee80211::{
    MgmtHeader, IEEE80211_FTYPE_MGMT, IEEE80211_STYPE_ACTION, IEEE80211_STYPE_BEACON,
    MGMT_HEADER_LEN,
};
use nan_wire::radiotap::{self, IEEE80211_RADIOTAP_F_BADFCS, IEEE80211_RADIOTAP_F_FCS};
use nan_wire::{ByteWriter, ieee80211};

use crate::cluster;
use crate::election;
use crate::event::ServiceEvent;
use crate::peer::PeerStatus;
use crate::state::NanState;

/// OUI marking relayed frames in the desync experiment.
const RELAY_MARKER_OUI: Oui = Oui([0xa2, 0xdf, 0xff]);
/// Replacement payload for modified relays.
const MODIFY_PAYLOAD: &[u8] = b"#0000ff";

/// Frames dropped without touching protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    FromSelf,
    FailedCrc,
    ForeignOui,
    UnknownActionType,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::FromSelf => "ignore from self",
            IgnoreReason::FailedCrc => "ignore failed crc",
            IgnoreReason::ForeignOui => "ignore oui",
            IgnoreReason::UnknownActionType => "ignore unknown action type",
        }
    }
}

/// Unrecoverable parse failures; the frame is dropped and may be dumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RxError {
    #[error("too short")]
    TooShort,
    #[error("unexpected format")]
    UnexpectedFormat,
    #[error("unexpected type")]
    UnexpectedType,
    #[error("unexpected value")]
    UnexpectedValue,
    #[error("missing mandatory attribute")]
    MissingMandatoryAttribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    Ignored(IgnoreReason),
}

/// What a received frame did to the state machine.
#[derive(Debug)]
pub struct RxReport {
    pub disposition: Disposition,
    /// Events dispatched while handling the frame, in order.
    pub events: Vec<(String, ServiceEvent)>,
}

impl RxReport {
    fn handled() -> Self {
        Self {
            disposition: Disposition::Handled,
            events: Vec::new(),
        }
    }

    fn ignored(reason: IgnoreReason) -> Self {
        trace!(target: "nan::rx", "{}", reason.as_str());
        Self {
            disposition: Disposition::Ignored(reason),
            events: Vec::new(),
        }
    }
}

/// Entry point: classify and process one captured frame.
pub fn rx(
    state: &mut NanState,
    rng: &mut fastrand::Rng,
    frame_bytes: &[u8],
    now_usec: u64,
) -> Result<RxReport, RxError> {
    let mut reader = ByteReader::new(frame_bytes);
    let info = radiotap::parse_header(&mut reader).map_err(|_| {
        trace!(target: "nan::rx", "radiotap: cannot parse header");
        RxError::UnexpectedFormat
    })?;

    if info.flags & IEEE80211_RADIOTAP_F_BADFCS != 0 {
        return Ok(RxReport::ignored(IgnoreReason::FailedCrc));
    }
    if info.flags & IEEE80211_RADIOTAP_F_FCS != 0 {
        reader.take(4);
        if reader.had_error() {
            return Err(RxError::TooShort);
        }
    }

    if reader.rest() < MGMT_HEADER_LEN {
        trace!(target: "nan::rx", "ieee80211: header too short");
        return Err(RxError::TooShort);
    }
    let header = MgmtHeader::parse(&mut reader).map_err(|_| RxError::TooShort)?;

    if header.src == state.self_address {
        return Ok(RxReport::ignored(IgnoreReason::FromSelf));
    }

    match header.ftype_stype() {
        t if t == (IEEE80211_FTYPE_MGMT | IEEE80211_STYPE_BEACON) => {
            rx_beacon(state, rng, reader, &header, info.rssi.unwrap_or(0), now_usec)
        }
        t if t == (IEEE80211_FTYPE_MGMT | IEEE80211_STYPE_ACTION) => {
            trace!(target: "nan::rx", "received action frame");
            rx_action(state, reader, &header, now_usec)
        }
        _ => {
            trace!(
                target: "nan::rx",
                "ieee80211: cannot handle frame control {:#x} from {}",
                header.frame_control, header.src
            );
            Err(RxError::UnexpectedType)
        }
    }
}

fn rx_beacon(
    state: &mut NanState,
    rng: &mut fastrand::Rng,
    mut reader: ByteReader<'_>,
    header: &MgmtHeader,
    rssi: i8,
    now_usec: u64,
) -> Result<RxReport, RxError> {
    let src = header.src;
    let cluster_id = header.bssid;

    let head = match frame::parse_beacon_head(&mut reader) {
        Ok(head) => head,
        Err(BeaconParseError::ForeignOui) => return Ok(RxReport::ignored(IgnoreReason::ForeignOui)),
        Err(BeaconParseError::UnknownInterval(interval)) => {
            warn!(target: "nan::rx", "unknown beacon interval {}", interval);
            return Err(RxError::UnexpectedType);
        }
        Err(BeaconParseError::Wire(_)) => return Err(RxError::TooShort),
    };

    trace!(
        target: "nan::rx",
        "received {} beacon from {} (cluster {})", head.kind.as_str(), src, cluster_id
    );

    let status = state
        .peers
        .add_or_update(src, cluster_id, now_usec, state.timer.base_time_usec());

    if !state.timer.initial_scan_done(now_usec) {
        state.timer.initial_scan_cancel();
    }

    for attr in Attributes::new(reader) {
        let attr = attr.map_err(|_| RxError::TooShort)?;
        match attr.id {
            attrs::MASTER_INDICATION_ATTRIBUTE => {
                let mi = MasterIndication::parse(attr.data).map_err(|_| RxError::TooShort)?;
                if let Some(peer) = state.peers.get_mut(&src) {
                    peer.set_master_indication(mi.master_preference, mi.random_factor);
                }
            }
            attrs::CLUSTER_ATTRIBUTE => {
                let cluster_attr =
                    ClusterAttribute::parse(attr.data).map_err(|_| RxError::TooShort)?;
                if let Some(peer) = state.peers.get_mut(&src) {
                    peer.set_anchor_info(
                        cluster_attr.anchor_master_rank,
                        cluster_attr.ambtt,
                        cluster_attr.hop_count,
                    );
                }
            }
            id => {
                trace!(target: "nan::rx", "unhandled attribute: {}", attrs::attribute_name(id));
            }
        }
    }

    if let Some(peer) = state.peers.get(&src) {
        if peer.anchor_master_rank != peer.last_anchor_master_rank {
            if election::is_rank_issuer(&state.self_address, peer.anchor_master_rank) {
                debug!(target: "nan::rx", "peer {} selected us as anchor master", peer.addr);
            } else if election::is_rank_issuer(&peer.addr, peer.anchor_master_rank) {
                debug!(target: "nan::rx", "peer {} selected itself as anchor master", peer.addr);
            } else {
                debug!(
                    target: "nan::rx",
                    "peer {} selected {} as anchor master",
                    peer.addr,
                    election::rank_issuer(peer.anchor_master_rank)
                );
            }
        }
    }

    if let Some(peer) = state.peers.get_mut(&src) {
        peer.set_beacon_info(rssi, head.timestamp);
    }
    {
        let peer = state.peers.get(&src).expect("peer was just added");
        state.sync.update_master_preference(rng, peer, now_usec);
    }
    if let Some(peer) = state.peers.get_mut(&src) {
        state.sync.check_master_candidate(peer);
        peer.last_beacon_time_usec = now_usec;
    }

    let is_new_cluster = cluster_id != state.cluster.cluster_id;
    let in_initial_cluster = state.peers.len() == 1 && status == PeerStatus::Added;

    if is_new_cluster || in_initial_cluster {
        let synced_time_usec = state.timer.synced_time_usec(now_usec);
        let peer_master_preference = state
            .peers
            .get(&src)
            .map(|p| p.master_preference)
            .unwrap_or(0);

        if cluster::peer_grade_wins(
            state.sync.master_preference,
            synced_time_usec,
            peer_master_preference,
            head.timestamp,
        ) {
            state.cluster.cluster_id = cluster_id;
            state.timer.sync_time(now_usec, head.timestamp);
            debug!(target: "nan::rx", "joined new cluster: {}", cluster_id);
        } else {
            trace!(target: "nan::rx", "found cluster with lower grade: {}", cluster_id);
        }
    } else if state.desync.enabled {
        if let Some(peer) = state.peers.get_mut(&src) {
            if head.kind == BeaconKind::Sync {
                peer.count_sync += 1;
            }
            peer.timer.sync_error(now_usec, head.timestamp);
            peer.old_timer.sync_time(now_usec, head.timestamp);
            peer.old_timer_send_count = 0;
            debug!(target: "nan::rx", "peer {} not in sync", peer.addr);
        }
    } else if head.kind == BeaconKind::Sync {
        if state.sync.is_anchor_master(&src) {
            state.timer.sync_time(now_usec, head.timestamp);
        } else {
            state.timer.sync_error(now_usec, head.timestamp);
        }

        let synced_time_tu = state.timer.synced_time_tu(now_usec);
        let peer = state.peers.get(&src).expect("peer was just added");
        state.sync.anchor_master_selection(peer, synced_time_tu);
    } else if !state.sync.is_anchor_master(&src) {
        state.timer.sync_error(now_usec, head.timestamp);
    }

    Ok(RxReport::handled())
}

fn rx_action(
    state: &mut NanState,
    mut reader: ByteReader<'_>,
    header: &MgmtHeader,
    now_usec: u64,
) -> Result<RxReport, RxError> {
    if reader.rest() < ACTION_HEADER_LEN {
        trace!(target: "nan::rx", "action frame too short");
        return Err(RxError::TooShort);
    }
    let head = frame::peek_action_head(&reader).map_err(|_| RxError::TooShort)?;

    if head.oui != NAN_OUI {
        return Ok(RxReport::ignored(IgnoreReason::ForeignOui));
    }

    state
        .peers
        .add_or_update(header.src, header.bssid, now_usec, state.timer.base_time_usec());

    if head.oui_type == NAN_OUI_TYPE_SERVICE_DISCOVERY {
        // Service discovery is one byte shorter than a NAN action frame.
        reader.advance(SERVICE_DISCOVERY_HEADER_LEN);
        return rx_service_discovery(state, reader, header, now_usec);
    }
    if head.oui_type != NAN_OUI_TYPE_ACTION {
        warn!(target: "nan::rx", "unknown action frame oui type: {}", head.oui_type);
        return Ok(RxReport::ignored(IgnoreReason::UnknownActionType));
    }

    reader.advance(ACTION_HEADER_LEN);
    trace!(
        target: "nan::rx",
        "received {} from {}",
        frame::action_subtype_name(head.oui_subtype),
        header.src
    );
    Ok(RxReport::handled())
}

fn rx_service_discovery(
    state: &mut NanState,
    reader: ByteReader<'_>,
    header: &MgmtHeader,
    now_usec: u64,
) -> Result<RxReport, RxError> {
    let src = header.src;
    let forwarding = state.peers.get(&src).map_or(false, |p| p.forward);
    if forwarding {
        relay_service_discovery(state, header, reader);
    }

    let mut descriptors: Vec<ServiceDescriptor> = Vec::new();
    let mut extensions: Vec<ServiceDescriptorExtension> = Vec::new();

    for attr in Attributes::new(reader) {
        let attr = attr.map_err(|_| RxError::TooShort)?;
        match attr.id {
            attrs::SERVICE_DESCRIPTOR_ATTRIBUTE => {
                descriptors.push(
                    ServiceDescriptor::parse(attr.data).map_err(|_| RxError::TooShort)?,
                );
            }
            attrs::SERVICE_DESCRIPTOR_EXTENSION_ATTRIBUTE => {
                extensions.push(
                    ServiceDescriptorExtension::parse(attr.data).map_err(|_| RxError::TooShort)?,
                );
            }
            id => {
                trace!(target: "nan::rx", "unhandled attribute: {}", attrs::attribute_name(id));
            }
        }
    }

    let mut report = RxReport::handled();
    let self_address = state.self_address;

    for descriptor in &descriptors {
        if descriptor.control.control_type == ServiceControlType::Publish {
            if let Some(peer) = state.peers.get_mut(&src) {
                if !peer.publisher {
                    peer.publisher = true;
                    debug!(target: "nan::rx", "publisher: {}", peer.addr);
                }
            }
        }

        trace!(
            target: "nan::rx",
            "received service discovery for {} of type {:?}",
            descriptor.service_id, descriptor.control.control_type
        );
        if let Some((name, event)) = state.services.on_received_descriptor(
            &self_address,
            &src,
            &header.dst,
            descriptor,
        ) {
            state.events.dispatch(&name, &event);
            report.events.push((name, event));
        }

        if descriptor.control.control_type == ServiceControlType::FollowUp {
            if let Some(peer) = state.peers.get_mut(&src) {
                peer.last_follow_up_time_usec = now_usec;
            }
        }
    }

    Ok(report)
}

/// Relay a service-discovery frame toward its destination peer, marking
/// it with a vendor attribute and optionally rewriting the payload.
/// Desync experiment only.
fn relay_service_discovery(
    state: &mut NanState,
    header: &MgmtHeader,
    attr_reader: ByteReader<'_>,
) {
    let src = header.src;
    let target_addr = if header.dst == NAN_NETWORK_ID {
        state
            .peers
            .iter()
            .map(|p| p.addr)
            .find(|addr| *addr != src)
    } else {
        state.peers.get(&header.dst).map(|p| p.addr)
    };
    let Some(target_addr) = target_addr else {
        return;
    };
    let Some(target) = state.peers.get(&target_addr) else {
        return;
    };
    if !target.frame_queue.is_empty() {
        return;
    }
    // Already relayed once: leave it alone.
    let mut probe = attr_reader;
    if probe.rest() == 0 || probe.read_u8() == attrs::VENDOR_SPECIFIC_ATTRIBUTE {
        return;
    }

    let modify = state.peers.get(&src).map_or(false, |p| p.modify);

    let mut writer = ByteWriter::new();
    radiotap::write_header(&mut writer, state.fcs);
    // The 802.11 header travels unchanged; the relay keeps the original
    // source so the receiver attributes the frame to the publisher.
    header.write(&mut writer);
    frame::write_service_discovery_head(&mut writer);
    attrs::write_vendor_marker(&mut writer, RELAY_MARKER_OUI);

    for attr in Attributes::new(attr_reader) {
        let Ok(attr) = attr else {
            return;
        };
        if attr.id != attrs::SERVICE_DESCRIPTOR_ATTRIBUTE {
            continue;
        }
        let Ok(mut descriptor) = ServiceDescriptor::parse(attr.data) else {
            return;
        };
        if modify && descriptor.control.service_info_present {
            descriptor.service_info = MODIFY_PAYLOAD.to_vec();
        }
        descriptor.write(&mut writer);
    }

    if state.fcs {
        ieee80211::append_fcs(&mut writer);
    }
    let Ok(frame_bytes) = writer.finish() else {
        return;
    };

    if let Some(target) = state.peers.get_mut(&target_addr) {
        if target.frame_queue.push(frame_bytes).is_err() {
            warn!(target: "nan::rx", "could not queue relayed frame for {}", target_addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::election::{master_rank, Role};
    use crate::service::{PublishType, SubscribeType};
    use crate::time::tu_to_usec;
    use crate::tx;

    fn make_state(last: u8, seed: u64) -> (NanState, fastrand::Rng) {
        let mut rng = fastrand::Rng::with_seed(seed);
        let state = NanState::new(
            "host",
            EtherAddr([2, 0, 0, 0, 0, last]),
            0,
            &mut rng,
            Config::default(),
        );
        (state, rng)
    }

    fn sync_beacon_from(sender: &mut NanState, now: u64) -> Vec<u8> {
        tx::build_beacon_frame(sender, BeaconKind::Sync, now, None).unwrap()
    }

    #[test]
    fn scenario_cluster_adoption_by_grade() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(2, 2);
        sender.sync.master_preference = 200;

        // The sender's cluster clock reads 500 000 µs.
        let now = 100_000;
        sender.timer.sync_time(now, 500_000);
        let beacon = sync_beacon_from(&mut sender, now);

        let report = rx(&mut device, &mut rng, &beacon, now).unwrap();

        assert_eq!(report.disposition, Disposition::Handled);
        assert_eq!(device.cluster.cluster_id, sender.cluster.cluster_id);
        // Hard-synced to the sender's timestamp.
        assert_eq!(device.timer.synced_time_usec(now), 500_000);
        assert!(device.peers.get(&sender.self_address).is_some());
    }

    #[test]
    fn scenario_anchor_adoption() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(2, 2);
        // Same cluster; anchor selection applies to in-cluster beacons.
        sender.cluster.cluster_id = device.cluster.cluster_id;

        let anchor = master_rank(254, 254, &EtherAddr([2, 0, 0, 0, 0, 0xaa]));
        sender.sync.anchor_master_rank = anchor;
        sender.sync.hop_count = 1;
        sender.sync.ambtt = 0;

        // The first beacon introduces the peer; the second runs the
        // selection procedure on the recorded anchor information.
        let now = 1_000;
        let first = sync_beacon_from(&mut sender, now);
        let _ = rx(&mut device, &mut rng, &first, now).unwrap();

        let later = now + tu_to_usec(512);
        let second = sync_beacon_from(&mut sender, later);
        let _ = rx(&mut device, &mut rng, &second, later).unwrap();

        assert_eq!(device.sync.anchor_master_rank, anchor);
        assert_eq!(device.sync.hop_count, 2);
    }

    #[test]
    fn ignores_own_frames_and_bad_crc() {
        let (mut device, mut rng) = make_state(1, 1);

        // A frame we sent ourselves.
        let own = tx::build_beacon_frame(&mut device, BeaconKind::Sync, 0, None).unwrap();
        let report = rx(&mut device, &mut rng, &own, 0).unwrap();
        assert_eq!(report.disposition, Disposition::Ignored(IgnoreReason::FromSelf));

        // A frame flagged as failing the FCS check.
        let mut w = ByteWriter::new();
        w.write_u8(0).write_u8(0).write_le16(9);
        w.write_le32(1 << 1); // flags present
        w.write_u8(IEEE80211_RADIOTAP_F_BADFCS);
        w.write_bytes(&[0u8; 32]);
        let bad = w.finish().unwrap();
        let report = rx(&mut device, &mut rng, &bad, 0).unwrap();
        assert_eq!(report.disposition, Disposition::Ignored(IgnoreReason::FailedCrc));
    }

    #[test]
    fn foreign_vendor_beacon_is_ignored() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(2, 2);
        let mut beacon = sync_beacon_from(&mut sender, 0);

        // Corrupt the OUI inside the vendor element (radiotap 11 + header
        // 24 + timestamp 8 + interval 2 + capability 2 + id/len 2).
        let oui_at = 11 + 24 + 14;
        beacon[oui_at] = 0x00;
        // The FCS no longer matches, but RX only checks the radiotap flag.
        let report = rx(&mut device, &mut rng, &beacon, 0).unwrap();

        assert_eq!(report.disposition, Disposition::Ignored(IgnoreReason::ForeignOui));
        assert!(device.peers.is_empty());
    }

    #[test]
    fn truncated_beacon_is_too_short() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(2, 2);
        let beacon = sync_beacon_from(&mut sender, 0);

        // Drop the tail: still enough for the 802.11 header, not for the
        // beacon body.
        let report = rx(&mut device, &mut rng, &beacon[..11 + 24 + 6], 0);

        assert_eq!(report.unwrap_err(), RxError::TooShort);
    }

    #[test]
    fn non_management_frames_are_unexpected() {
        let (mut device, mut rng) = make_state(1, 1);

        let mut w = ByteWriter::new();
        radiotap::write_header(&mut w, false);
        MgmtHeader {
            frame_control: 0x0008, // data frame
            duration_id: 0,
            dst: EtherAddr::BROADCAST,
            src: EtherAddr([2, 0, 0, 0, 0, 7]),
            bssid: EtherAddr::ZERO,
            seq_ctrl: 0,
        }
        .write(&mut w);
        let bytes = w.finish().unwrap();

        assert_eq!(rx(&mut device, &mut rng, &bytes, 0).unwrap_err(), RxError::UnexpectedType);
    }

    #[test]
    fn anchor_master_beacon_hard_syncs_the_timer() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(2, 2);
        sender.cluster.cluster_id = device.cluster.cluster_id;

        // First beacon introduces the sender.
        let beacon = sync_beacon_from(&mut sender, 0);
        rx(&mut device, &mut rng, &beacon, 0).unwrap();

        // Make the sender our anchor master, then let its clock jump.
        device.sync.anchor_master_rank = master_rank(
            sender.sync.master_preference,
            sender.sync.random_factor,
            &sender.self_address,
        );
        sender.timer.sync_time(0, 2_000_000);

        let now = tu_to_usec(512 * 3);
        let beacon = sync_beacon_from(&mut sender, now);
        rx(&mut device, &mut rng, &beacon, now).unwrap();

        assert_eq!(
            device.timer.synced_time_usec(now),
            sender.timer.synced_time_usec(now)
        );
    }

    #[test]
    fn scenario_publish_discover_follow_up() {
        // Device A publishes, device B subscribes.
        let (mut a, mut rng_a) = make_state(0xa, 10);
        let (mut b, mut rng_b) = make_state(0xb, 11);

        let publish_id = a
            .services
            .publish("chat", PublishType::Unsolicited, -1, b"hello")
            .unwrap();
        let subscribe_id = b
            .services
            .subscribe("chat", SubscribeType::Passive, -1, b"")
            .unwrap();

        // A emits its DW service-discovery frame; B receives it.
        let announced = a.services.announce_candidates();
        assert_eq!(announced, vec![publish_id]);
        let sdf = tx::build_service_discovery_frame(&mut a, &NAN_NETWORK_ID, &announced).unwrap();

        let report = rx(&mut b, &mut rng_b, &sdf, 1_000).unwrap();

        assert_eq!(report.events.len(), 1);
        let (name, event) = &report.events[0];
        assert_eq!(name, "chat");
        assert_eq!(
            *event,
            ServiceEvent::DiscoveryResult {
                subscribe_id,
                publish_id,
                address: a.self_address,
                service_update_indicator: 0,
                service_info: b"hello".to_vec(),
            }
        );

        // B answers with a follow-up; A receives exactly one event.
        tx::transmit(&mut b, &a.self_address, subscribe_id, publish_id, b"hi").unwrap();
        let follow_up = b.buffer.pop().unwrap();
        let report = rx(&mut a, &mut rng_a, &follow_up, 2_000).unwrap();

        assert_eq!(report.events.len(), 1);
        assert_eq!(
            report.events[0].1,
            ServiceEvent::Receive {
                instance_id: publish_id,
                peer_instance_id: subscribe_id,
                address: b.self_address,
                service_info: b"hi".to_vec(),
            }
        );
        // The follow-up time was recorded on B's peer entry.
        let peer = a.peers.get(&b.self_address).unwrap();
        assert_eq!(peer.last_follow_up_time_usec, 2_000);
    }

    #[test]
    fn follow_up_for_someone_else_is_dropped() {
        let (mut a, mut rng_a) = make_state(0xa, 10);
        let (mut b, _) = make_state(0xb, 11);
        let (c, _) = make_state(0xc, 12);

        a.services.publish("chat", PublishType::Both, -1, b"").unwrap();
        let id = b
            .services
            .subscribe("chat2", SubscribeType::Passive, -1, b"")
            .unwrap();

        // B addresses its follow-up to C, but A overhears it.
        tx::transmit(&mut b, &c.self_address, id, 1, b"hi").unwrap();
        let frame_bytes = b.buffer.pop().unwrap();
        let report = rx(&mut a, &mut rng_a, &frame_bytes, 0).unwrap();

        assert!(report.events.is_empty());
    }

    #[test]
    fn relay_rewrites_marked_frames_once() {
        let (mut mitm, mut rng) = make_state(1, 5);
        mitm.desync.enabled = true;

        let (mut publisher, _) = make_state(0xa, 6);
        let (subscriber, _) = make_state(0xb, 7);

        // Both ends are known peers; the publisher is forwarded+modified.
        let now = 100;
        let base = mitm.timer.base_time_usec();
        mitm.peers
            .add_or_update(publisher.self_address, mitm.cluster.cluster_id, now, base);
        mitm.peers
            .add_or_update(subscriber.self_address, mitm.cluster.cluster_id, now, base);
        {
            let peer = mitm.peers.get_mut(&publisher.self_address).unwrap();
            peer.forward = true;
            peer.modify = true;
        }

        let id = publisher
            .services
            .publish("chat", PublishType::Unsolicited, -1, b"#ff0000")
            .unwrap();
        let sdf =
            tx::build_service_discovery_frame(&mut publisher, &NAN_NETWORK_ID, &[id]).unwrap();

        rx(&mut mitm, &mut rng, &sdf, now).unwrap();

        let relayed = {
            let peer = mitm.peers.get_mut(&subscriber.self_address).unwrap();
            let frame_bytes = peer.frame_queue.pop().unwrap();
            assert!(peer.frame_queue.is_empty());
            frame_bytes
        };

        // The relayed frame leads with the vendor marker and carries the
        // rewritten payload.
        let mut reader = ByteReader::new(&relayed);
        radiotap::parse_header(&mut reader).unwrap();
        reader.take(4);
        let header = MgmtHeader::parse(&mut reader).unwrap();
        assert_eq!(header.src, publisher.self_address);
        reader.advance(SERVICE_DISCOVERY_HEADER_LEN);

        let raw: Vec<_> = Attributes::new(reader).collect::<Result<_, _>>().unwrap();
        assert_eq!(raw[0].id, attrs::VENDOR_SPECIFIC_ATTRIBUTE);
        let descriptor = ServiceDescriptor::parse(raw[1].data).unwrap();
        assert_eq!(descriptor.service_info, MODIFY_PAYLOAD);

        // Feeding the marked frame back in does not relay it again.
        rx(&mut mitm, &mut rng, &relayed, now + 1).unwrap();
        let peer = mitm.peers.get(&subscriber.self_address).unwrap();
        assert!(peer.frame_queue.is_empty());
    }

    #[test]
    fn role_transition_after_strong_peer_beacon() {
        let (mut device, mut rng) = make_state(1, 1);
        let (mut sender, _) = make_state(9, 2);
        sender.sync.master_preference = 254;
        sender.sync.random_factor = 7;
        sender.sync.update_master_rank(None);

        assert_eq!(device.sync.role, Role::Master);

        let beacon = sync_beacon_from(&mut sender, 0);
        rx(&mut device, &mut rng, &beacon, 0).unwrap();

        // Strong signal, higher master rank: election demotes us.
        device.sync.master_election(device.peers.iter(), 0);
        assert_eq!(device.sync.role, Role::Sync);
    }
}
