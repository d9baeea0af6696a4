//! NAN frame bodies: beacons, service-discovery frames and NAN action
//! frames, plus the well-known addresses of the protocol.

use crate::buf::{ByteReader, ByteWriter, WireError};
use crate::ether::{EtherAddr, Oui};
use crate::ieee80211::{IEEE80211_PUBLIC_ACTION_FRAME, IEEE80211_PUBLIC_ACTION_FRAME_VENDOR_SPECIFIC};

pub const NAN_OUI: Oui = Oui([0x50, 0x6f, 0x9a]);
pub const NAN_OUI_TYPE_BEACON: u8 = 0x13;
pub const NAN_OUI_TYPE_SERVICE_DISCOVERY: u8 = 0x13;
pub const NAN_OUI_TYPE_ACTION: u8 = 0x18;

pub const NAN_BROADCAST_ADDRESS: EtherAddr = EtherAddr([0xff; 6]);
pub const NAN_NETWORK_ID: EtherAddr = EtherAddr([0x51, 0x6f, 0x9a, 0x01, 0x00, 0x00]);
pub const NAN_CLUSTER_ID_BASE: EtherAddr = EtherAddr([0x50, 0x6f, 0x9a, 0x01, 0x00, 0x00]);

pub const NAN_SYNC_BEACON_INTERVAL_TU: u16 = 512;
pub const NAN_DISCOVERY_BEACON_INTERVAL_TU: u16 = 100;

const BEACON_CAPABILITY: u16 = 0x0420;
const VENDOR_SPECIFIC_ELEMENT_ID: u8 = 0xdd;
/// OUI + OUI type inside the vendor-specific element.
const NAN_INFORMATION_ELEMENT_FIXED_LENGTH: u8 = 4;

/// Offset of the vendor-element length byte within the beacon body, used
/// to patch the attribute length in after the body is complete.
const BEACON_IE_LENGTH_OFFSET: usize = 8 + 2 + 2 + 1;

/// Length of the service-discovery prelude: category, action, OUI, type.
pub const SERVICE_DISCOVERY_HEADER_LEN: usize = 6;
/// A NAN action frame additionally carries an OUI subtype.
pub const ACTION_HEADER_LEN: usize = 7;

/// The two beacon flavors, distinguished on the wire by their interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconKind {
    Sync,
    Discovery,
}

impl BeaconKind {
    pub fn from_interval(interval_tu: u16) -> Option<Self> {
        match interval_tu {
            NAN_SYNC_BEACON_INTERVAL_TU => Some(BeaconKind::Sync),
            NAN_DISCOVERY_BEACON_INTERVAL_TU => Some(BeaconKind::Discovery),
            _ => None,
        }
    }

    pub fn interval_tu(&self) -> u16 {
        match self {
            BeaconKind::Sync => NAN_SYNC_BEACON_INTERVAL_TU,
            BeaconKind::Discovery => NAN_DISCOVERY_BEACON_INTERVAL_TU,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BeaconKind::Sync => "SYNC",
            BeaconKind::Discovery => "DISCOVERY",
        }
    }
}

/// Parsed fixed part of a NAN beacon body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconHead {
    pub kind: BeaconKind,
    pub timestamp: u64,
}

/// Outcome of parsing a beacon body head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BeaconParseError {
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The vendor element is not the NAN element.
    #[error("foreign oui")]
    ForeignOui,
    #[error("unknown beacon interval {0}")]
    UnknownInterval(u16),
}

/// Parse the beacon body head, leaving the reader at the first attribute.
pub fn parse_beacon_head(reader: &mut ByteReader<'_>) -> Result<BeaconHead, BeaconParseError> {
    let timestamp = reader.read_le64();
    let beacon_interval = reader.read_le16();
    let _capability = reader.read_le16();
    let _element_id = reader.read_u8();
    let _length = reader.read_u8();
    let oui = reader.read_bytes(3);
    let oui_type = reader.read_u8();
    reader.finish()?;

    if oui != NAN_OUI.0 || oui_type != NAN_OUI_TYPE_BEACON {
        return Err(BeaconParseError::ForeignOui);
    }
    let kind = BeaconKind::from_interval(beacon_interval)
        .ok_or(BeaconParseError::UnknownInterval(beacon_interval))?;

    Ok(BeaconHead { kind, timestamp })
}

/// Write the beacon body head. Returns the writer offset of the vendor
/// element's length byte so the caller can patch it once the attributes
/// are in place.
pub fn write_beacon_head(writer: &mut ByteWriter, kind: BeaconKind, timestamp: u64) -> usize {
    let body_start = writer.len();
    writer.write_le64(timestamp);
    writer.write_le16(kind.interval_tu());
    writer.write_le16(BEACON_CAPABILITY);
    writer.write_u8(VENDOR_SPECIFIC_ELEMENT_ID);
    writer.write_u8(NAN_INFORMATION_ELEMENT_FIXED_LENGTH);
    writer.write_bytes(&NAN_OUI.0);
    writer.write_u8(NAN_OUI_TYPE_BEACON);

    body_start + BEACON_IE_LENGTH_OFFSET
}

/// Close the vendor element by adding the attribute byte count to its
/// length field.
pub fn patch_beacon_ie_length(writer: &mut ByteWriter, length_at: usize, attributes_len: usize) {
    writer.patch_u8(
        length_at,
        NAN_INFORMATION_ELEMENT_FIXED_LENGTH.wrapping_add(attributes_len as u8),
    );
}

/// Write the service-discovery frame prelude.
pub fn write_service_discovery_head(writer: &mut ByteWriter) {
    writer.write_u8(IEEE80211_PUBLIC_ACTION_FRAME);
    writer.write_u8(IEEE80211_PUBLIC_ACTION_FRAME_VENDOR_SPECIFIC);
    writer.write_bytes(&NAN_OUI.0);
    writer.write_u8(NAN_OUI_TYPE_SERVICE_DISCOVERY);
}

/// Fixed prelude shared by NAN action and service-discovery frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionHead {
    pub category: u8,
    pub action: u8,
    pub oui: Oui,
    pub oui_type: u8,
    /// Only present on NAN action frames, not on service discovery.
    pub oui_subtype: u8,
}

/// Peek the action-frame prelude without committing the reader; service
/// discovery frames are one byte shorter than NAN action frames, so the
/// caller advances by the right amount after dispatching on `oui_type`.
pub fn peek_action_head(reader: &ByteReader<'_>) -> Result<ActionHead, WireError> {
    let mut probe = *reader;
    let head = ActionHead {
        category: probe.read_u8(),
        action: probe.read_u8(),
        oui: {
            let bytes = probe.read_bytes(3);
            if bytes.len() == 3 {
                Oui([bytes[0], bytes[1], bytes[2]])
            } else {
                Oui([0; 3])
            }
        },
        oui_type: probe.read_u8(),
        oui_subtype: probe.read_u8(),
    };
    probe.finish()?;
    Ok(head)
}

pub fn action_subtype_name(subtype: u8) -> &'static str {
    match subtype {
        1 => "NAF_RANGING_REQUEST",
        2 => "NAF_RANGING_RESPONSE",
        3 => "NAF_RANGING_TERMINATION",
        4 => "NAN_RANGING_REPORT",
        5 => "NAF_DATA_PATH_REQUEST",
        6 => "NAF_DATA_PATH_RESPONSE",
        7 => "NAF_DATA_PATH_CONFIRM",
        8 => "NAF_DATA_PATH_KEY_INSTALLMENT",
        9 => "NAF_DATA_PATH_TERMINATION",
        10 => "NAF_SCHEDULE_REQUEST",
        11 => "NAF_SCHEDULE_RESPONSE",
        12 => "NAF_SCHEDULE_CONFIRM",
        13 => "NAF_SCHEDULE_UPDATE_NOTIFICATION",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_head_round_trip() {
        let mut w = ByteWriter::new();
        let length_at = write_beacon_head(&mut w, BeaconKind::Sync, 123456);
        patch_beacon_ie_length(&mut w, length_at, 21);
        let bytes = w.finish().unwrap();

        assert_eq!(bytes[length_at], 4 + 21);

        let mut r = ByteReader::new(&bytes);
        let head = parse_beacon_head(&mut r).unwrap();
        assert_eq!(head.kind, BeaconKind::Sync);
        assert_eq!(head.timestamp, 123456);
        assert_eq!(r.rest(), 0);
    }

    #[test]
    fn beacon_interval_is_little_endian_on_the_wire() {
        let mut w = ByteWriter::new();
        write_beacon_head(&mut w, BeaconKind::Discovery, 0);
        let bytes = w.finish().unwrap();

        assert_eq!(&bytes[8..10], &100u16.to_le_bytes());
    }

    #[test]
    fn foreign_vendor_element_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_le64(0)
            .write_le16(512)
            .write_le16(BEACON_CAPABILITY)
            .write_u8(0xdd)
            .write_u8(4)
            .write_bytes(&[0x00, 0x11, 0x22])
            .write_u8(NAN_OUI_TYPE_BEACON);
        let bytes = w.finish().unwrap();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(parse_beacon_head(&mut r), Err(BeaconParseError::ForeignOui));
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let mut w = ByteWriter::new();
        w.write_le64(0)
            .write_le16(200)
            .write_le16(BEACON_CAPABILITY)
            .write_u8(0xdd)
            .write_u8(4)
            .write_bytes(&NAN_OUI.0)
            .write_u8(NAN_OUI_TYPE_BEACON);
        let bytes = w.finish().unwrap();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(
            parse_beacon_head(&mut r),
            Err(BeaconParseError::UnknownInterval(200))
        );
    }

    #[test]
    fn service_discovery_head_matches_action_peek() {
        let mut w = ByteWriter::new();
        write_service_discovery_head(&mut w);
        // One attribute byte so the subtype peek has something to read.
        w.write_u8(0xaa);
        let bytes = w.finish().unwrap();

        let r = ByteReader::new(&bytes);
        let head = peek_action_head(&r).unwrap();

        assert_eq!(head.category, IEEE80211_PUBLIC_ACTION_FRAME);
        assert_eq!(head.action, IEEE80211_PUBLIC_ACTION_FRAME_VENDOR_SPECIFIC);
        assert_eq!(head.oui, NAN_OUI);
        assert_eq!(head.oui_type, NAN_OUI_TYPE_SERVICE_DISCOVERY);
    }
}
