//! Frame building: beacons, service-discovery frames and follow-ups.

use tracing::{error, trace, warn};

use nan_wire::attrs::{
    self, ClusterAttribute, MasterIndication, SdControl, ServiceControlType, ServiceDescriptor,
    ServiceDescriptorExtension,
};
use nan_wire::buf::{ByteWriter, WireError};
use nan_wire::ether::EtherAddr;
use nan_wire::frame::{
    self, BeaconKind, NAN_BROADCAST_ADDRESS,
};
use nan_wire::ieee80211::{
    self, MgmtHeader, IEEE80211_FTYPE_MGMT, IEEE80211_STYPE_ACTION, IEEE80211_STYPE_BEACON,
};
use nan_wire::radiotap;

use crate::election::Role;
use crate::peer::Peer;
use crate::service::{Service, ServiceFilter, ServiceKind};
use crate::state::NanState;

/// Info this long leaves the descriptor and rides in the extension.
const LARGE_INFO_THRESHOLD: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    #[error("unknown service instance {0}")]
    UnknownService(u8),
    #[error("unknown peer {0}")]
    UnknownPeer(EtherAddr),
    #[error("outbound frame buffer full")]
    BufferFull,
    #[error("frame build failed")]
    Build(#[from] WireError),
}

/// Whether a discovery beacon may go out right now: masters only, after
/// the initial scan, paced at the discovery-beacon interval, and never
/// inside a discovery window.
pub fn can_send_discovery_beacon(state: &NanState, now_usec: u64) -> bool {
    state.sync.role == Role::Master
        && state.timer.initial_scan_done(now_usec)
        && !state.timer.in_dw(now_usec)
        && state.timer.can_send_discovery_beacon(now_usec)
}

fn mgmt_header(
    state: &mut NanState,
    destination: &EtherAddr,
    ftype_stype: u16,
) -> MgmtHeader {
    MgmtHeader {
        frame_control: ftype_stype,
        duration_id: 0,
        dst: *destination,
        src: state.interface_address,
        bssid: state.cluster.cluster_id,
        seq_ctrl: state.sequence_numbers.next_seq_ctrl(),
    }
}

/// Build a complete beacon frame. With `peer` set, the beacon is unicast
/// and carries that peer's view of cluster time (desync mode).
pub fn build_beacon_frame(
    state: &mut NanState,
    kind: BeaconKind,
    now_usec: u64,
    peer: Option<&Peer>,
) -> Result<Vec<u8>, WireError> {
    let timestamp = match peer {
        Some(peer) => peer.timer.synced_time_usec(now_usec),
        None => state.timer.synced_time_usec(now_usec),
    };
    let destination = peer.map(|p| p.addr).unwrap_or(NAN_BROADCAST_ADDRESS);

    let mut writer = ByteWriter::new();
    radiotap::write_header(&mut writer, state.fcs);
    mgmt_header(state, &destination, IEEE80211_FTYPE_MGMT | IEEE80211_STYPE_BEACON)
        .write(&mut writer);

    let ie_length_at = frame::write_beacon_head(&mut writer, kind, timestamp);
    let attrs_start = writer.len();
    MasterIndication {
        master_preference: state.sync.master_preference,
        random_factor: state.sync.random_factor,
    }
    .write(&mut writer);
    ClusterAttribute {
        anchor_master_rank: state.sync.anchor_master_rank,
        hop_count: state.sync.hop_count,
        ambtt: state.sync.ambtt,
    }
    .write(&mut writer);
    let ie_length = writer.len() - attrs_start;
    frame::patch_beacon_ie_length(&mut writer, ie_length_at, ie_length);

    if state.fcs {
        ieee80211::append_fcs(&mut writer);
    }
    writer.finish()
}

fn write_service_attributes(writer: &mut ByteWriter, service: &Service) {
    let control_type = match &service.kind {
        ServiceKind::Published { .. } => ServiceControlType::Publish,
        ServiceKind::Subscribed { .. } => ServiceControlType::Subscribe,
    };

    ServiceDescriptor {
        service_id: service.service_id,
        instance_id: service.instance_id,
        requestor_instance_id: 0,
        control: SdControl::new(control_type),
        service_info: service.service_specific_info.clone(),
    }
    .write(writer);

    let mut extension = ServiceDescriptorExtension::new(service.instance_id);
    if service.is_published() {
        extension.service_update_indicator = Some(service.service_update_indicator);
    }
    if service.service_specific_info.len() >= LARGE_INFO_THRESHOLD {
        extension.service_info = service.service_specific_info.clone();
    }
    extension.write(writer);
}

/// Build the service-discovery frame announcing `announced` services.
pub fn build_service_discovery_frame(
    state: &mut NanState,
    destination: &EtherAddr,
    announced: &[u8],
) -> Result<Vec<u8>, WireError> {
    let mut writer = ByteWriter::new();
    radiotap::write_header(&mut writer, state.fcs);
    mgmt_header(state, destination, IEEE80211_FTYPE_MGMT | IEEE80211_STYPE_ACTION)
        .write(&mut writer);
    frame::write_service_discovery_head(&mut writer);

    attrs::write_device_capability(&mut writer);
    attrs::write_availability(&mut writer);

    for instance_id in announced {
        let Some(service) = state.services.get(*instance_id) else {
            continue;
        };
        write_service_attributes(&mut writer, service);
    }

    if state.fcs {
        ieee80211::append_fcs(&mut writer);
    }
    writer.finish()
}

/// Build a follow-up frame for `service` addressed to a peer instance.
pub fn build_follow_up_frame(
    state: &mut NanState,
    destination: &EtherAddr,
    instance_id: u8,
    requestor_instance_id: u8,
    service_specific_info: &[u8],
) -> Result<Vec<u8>, TransmitError> {
    let service = state
        .services
        .get(instance_id)
        .ok_or(TransmitError::UnknownService(instance_id))?;
    let service_id = service.service_id;

    let mut control = SdControl::new(ServiceControlType::FollowUp);
    control.service_info_present =
        !service_specific_info.is_empty() && service_specific_info.len() < LARGE_INFO_THRESHOLD;

    let mut writer = ByteWriter::new();
    radiotap::write_header(&mut writer, state.fcs);
    mgmt_header(state, destination, IEEE80211_FTYPE_MGMT | IEEE80211_STYPE_ACTION)
        .write(&mut writer);
    frame::write_service_discovery_head(&mut writer);

    ServiceDescriptor {
        service_id,
        instance_id,
        requestor_instance_id,
        control,
        service_info: if control.service_info_present {
            service_specific_info.to_vec()
        } else {
            Vec::new()
        },
    }
    .write(&mut writer);

    if service_specific_info.len() >= LARGE_INFO_THRESHOLD {
        let mut extension = ServiceDescriptorExtension::new(instance_id);
        extension.service_info = service_specific_info.to_vec();
        extension.write(&mut writer);
    }

    if state.fcs {
        ieee80211::append_fcs(&mut writer);
    }
    Ok(writer.finish()?)
}

/// Queue a follow-up for transmission in the next DW. In desync mode the
/// frame goes into the destination peer's own queue.
pub fn transmit(
    state: &mut NanState,
    destination: &EtherAddr,
    instance_id: u8,
    requestor_instance_id: u8,
    service_specific_info: &[u8],
) -> Result<(), TransmitError> {
    if state
        .services
        .get_filtered(instance_id, ServiceFilter::Any)
        .is_none()
    {
        error!(target: "nan::tx", "transmit for unknown service: {}", instance_id);
        return Err(TransmitError::UnknownService(instance_id));
    }

    let frame = build_follow_up_frame(
        state,
        destination,
        instance_id,
        requestor_instance_id,
        service_specific_info,
    )?;

    if state.desync.enabled {
        let Some(peer) = state.peers.get_mut(destination) else {
            warn!(target: "nan::tx", "unknown peer {}", destination);
            return Err(TransmitError::UnknownPeer(*destination));
        };
        peer.frame_queue.push(frame).map_err(|_| {
            warn!(target: "nan::tx", "could not queue follow up for {}", destination);
            TransmitError::BufferFull
        })
    } else {
        state.buffer.push(frame).map_err(|_| {
            warn!(target: "nan::tx", "could not queue follow up");
            TransmitError::BufferFull
        })
    }
}

/// Trace the announced service names after a service-discovery frame.
pub fn trace_announced(state: &NanState, announced: &[u8]) {
    for instance_id in announced {
        if let Some(service) = state.services.get(*instance_id) {
            trace!(target: "nan::tx", " * {}", service.service_name);
        }
    }
}
