//! NAN attribute TLVs.
//!
//! Every attribute is `id:u8 ‖ length:LE16 ‖ value`. Unknown attribute ids
//! are skipped by the iterator, never fatal. Bit-level control fields are
//! packed and unpacked explicitly; layout here is authoritative, not the
//! compiler's.

use std::fmt;

use crate::buf::{ByteReader, ByteWriter, WireError};
use crate::ether::Oui;
use crate::frame::NAN_OUI;

pub const MASTER_INDICATION_ATTRIBUTE: u8 = 0x00;
pub const CLUSTER_ATTRIBUTE: u8 = 0x01;
pub const SERVICE_ID_LIST_ATTRIBUTE: u8 = 0x02;
pub const SERVICE_DESCRIPTOR_ATTRIBUTE: u8 = 0x03;
pub const SERVICE_DESCRIPTOR_EXTENSION_ATTRIBUTE: u8 = 0x0e;
pub const DEVICE_CAPABILITY_ATTRIBUTE: u8 = 0x0f;
pub const NAN_AVAILABILITY_ATTRIBUTE: u8 = 0x12;
pub const VENDOR_SPECIFIC_ATTRIBUTE: u8 = 0xdd;

pub const NAN_SERVICE_ID_LENGTH: usize = 6;
/// id + LE16 length.
pub const ATTRIBUTE_HEADER_LEN: usize = 3;

pub fn attribute_name(id: u8) -> &'static str {
    match id {
        MASTER_INDICATION_ATTRIBUTE => "master indication",
        CLUSTER_ATTRIBUTE => "cluster",
        SERVICE_ID_LIST_ATTRIBUTE => "service id list",
        SERVICE_DESCRIPTOR_ATTRIBUTE => "service descriptor",
        0x04 => "connection capability",
        0x09 => "further service discovery",
        SERVICE_DESCRIPTOR_EXTENSION_ATTRIBUTE => "service descriptor extension",
        DEVICE_CAPABILITY_ATTRIBUTE => "device capability",
        0x10 => "data path",
        NAN_AVAILABILITY_ATTRIBUTE => "availability",
        VENDOR_SPECIFIC_ATTRIBUTE => "vendor specific",
        _ => "unknown",
    }
}

/// First six octets of SHA-256 over the lowercased service name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(pub [u8; NAN_SERVICE_ID_LENGTH]);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A raw attribute as cut out of a frame.
#[derive(Debug, Clone, Copy)]
pub struct RawAttribute<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// Iterator over the attribute TLVs of a frame tail.
///
/// A cleanly exhausted stream ends the iteration; trailing bytes that do
/// not form a whole attribute yield one final `Err`.
pub struct Attributes<'a> {
    reader: ByteReader<'a>,
    failed: bool,
}

impl<'a> Attributes<'a> {
    pub fn new(reader: ByteReader<'a>) -> Self {
        Self { reader, failed: false }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<RawAttribute<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.rest() == 0 {
            return None;
        }
        let id = self.reader.read_u8();
        let length = self.reader.read_le16() as usize;
        let data = self.reader.read_bytes(length);

        if self.reader.had_error() {
            self.failed = true;
            return Some(Err(WireError::TooShort));
        }
        Some(Ok(RawAttribute { id, data }))
    }
}

fn write_attribute_header(writer: &mut ByteWriter, id: u8) -> usize {
    writer.write_u8(id);
    let length_at = writer.len();
    writer.write_le16(0);
    length_at
}

fn close_attribute(writer: &mut ByteWriter, length_at: usize) {
    let length = writer.len() - length_at - 2;
    writer.patch_le16(length_at, length as u16);
}

/// Master Indication attribute (0x00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterIndication {
    pub master_preference: u8,
    pub random_factor: u8,
}

impl MasterIndication {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let attr = Self {
            master_preference: r.read_u8(),
            random_factor: r.read_u8(),
        };
        r.finish()?;
        Ok(attr)
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        let length_at = write_attribute_header(writer, MASTER_INDICATION_ATTRIBUTE);
        writer.write_u8(self.master_preference);
        writer.write_u8(self.random_factor);
        close_attribute(writer, length_at);
    }
}

/// Cluster attribute (0x01).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterAttribute {
    pub anchor_master_rank: u64,
    pub hop_count: u8,
    pub ambtt: u32,
}

impl ClusterAttribute {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let attr = Self {
            anchor_master_rank: r.read_le64(),
            hop_count: r.read_u8(),
            ambtt: r.read_le32(),
        };
        r.finish()?;
        Ok(attr)
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        let length_at = write_attribute_header(writer, CLUSTER_ATTRIBUTE);
        writer.write_le64(self.anchor_master_rank);
        writer.write_u8(self.hop_count);
        writer.write_le32(self.ambtt);
        close_attribute(writer, length_at);
    }
}

/// Service Descriptor control-type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceControlType {
    Publish,
    Subscribe,
    FollowUp,
}

impl ServiceControlType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Publish),
            1 => Some(Self::Subscribe),
            2 => Some(Self::FollowUp),
            _ => None,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            Self::Publish => 0,
            Self::Subscribe => 1,
            Self::FollowUp => 2,
        }
    }
}

/// Service Descriptor control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdControl {
    pub control_type: ServiceControlType,
    pub matching_filter_present: bool,
    pub service_response_filter_present: bool,
    pub service_info_present: bool,
    pub discovery_range_limited: bool,
    pub binding_bitmap_present: bool,
}

impl SdControl {
    pub fn new(control_type: ServiceControlType) -> Self {
        Self {
            control_type,
            matching_filter_present: false,
            service_response_filter_present: false,
            service_info_present: false,
            discovery_range_limited: false,
            binding_bitmap_present: false,
        }
    }

    pub fn unpack(byte: u8) -> Result<Self, WireError> {
        let control_type =
            ServiceControlType::from_bits(byte & 0x03).ok_or(WireError::UnexpectedFormat)?;
        Ok(Self {
            control_type,
            matching_filter_present: byte & 0x04 != 0,
            service_response_filter_present: byte & 0x08 != 0,
            service_info_present: byte & 0x10 != 0,
            discovery_range_limited: byte & 0x20 != 0,
            binding_bitmap_present: byte & 0x40 != 0,
        })
    }

    pub fn pack(&self) -> u8 {
        let mut byte = self.control_type.bits();
        if self.matching_filter_present {
            byte |= 0x04;
        }
        if self.service_response_filter_present {
            byte |= 0x08;
        }
        if self.service_info_present {
            byte |= 0x10;
        }
        if self.discovery_range_limited {
            byte |= 0x20;
        }
        if self.binding_bitmap_present {
            byte |= 0x40;
        }
        byte
    }
}

/// Service Descriptor attribute (0x03).
///
/// Matching filter, service response filter and binding bitmap are parsed
/// over but not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service_id: ServiceId,
    pub instance_id: u8,
    pub requestor_instance_id: u8,
    pub control: SdControl,
    pub service_info: Vec<u8>,
}

impl ServiceDescriptor {
    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);

        let id_bytes = r.read_bytes(NAN_SERVICE_ID_LENGTH);
        let mut service_id = [0u8; NAN_SERVICE_ID_LENGTH];
        if id_bytes.len() == NAN_SERVICE_ID_LENGTH {
            service_id.copy_from_slice(id_bytes);
        }
        let instance_id = r.read_u8();
        let requestor_instance_id = r.read_u8();
        let control = SdControl::unpack(r.read_u8())?;

        if control.binding_bitmap_present {
            r.advance(2);
        }
        if control.matching_filter_present {
            let length = r.read_u8() as usize;
            r.advance(length);
        }
        if control.service_response_filter_present {
            let length = r.read_u8() as usize;
            r.advance(length);
        }
        let service_info = if control.service_info_present {
            let length = r.read_u8() as usize;
            r.read_bytes(length).to_vec()
        } else {
            Vec::new()
        };
        r.finish()?;

        Ok(Self {
            service_id: ServiceId(service_id),
            instance_id,
            requestor_instance_id,
            control,
            service_info,
        })
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        let length_at = write_attribute_header(writer, SERVICE_DESCRIPTOR_ATTRIBUTE);
        writer.write_bytes(&self.service_id.0);
        writer.write_u8(self.instance_id);
        writer.write_u8(self.requestor_instance_id);

        let mut control = self.control;
        // Info over 255 bytes travels in the extension attribute instead.
        control.service_info_present =
            !self.service_info.is_empty() && self.service_info.len() < 256;
        writer.write_u8(control.pack());

        if control.service_info_present {
            writer.write_u8(self.service_info.len() as u8);
            writer.write_bytes(&self.service_info);
        }
        close_attribute(writer, length_at);
    }
}

/// Service Descriptor Extension control field (LE16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SdeControl {
    pub data_path_required: bool,
    pub range_limit_present: bool,
    pub service_update_indicator_present: bool,
}

impl SdeControl {
    pub fn unpack(bits: u16) -> Self {
        Self {
            data_path_required: bits & (1 << 2) != 0,
            range_limit_present: bits & (1 << 8) != 0,
            service_update_indicator_present: bits & (1 << 9) != 0,
        }
    }

    pub fn pack(&self) -> u16 {
        let mut bits = 0;
        if self.data_path_required {
            bits |= 1 << 2;
        }
        if self.range_limit_present {
            bits |= 1 << 8;
        }
        if self.service_update_indicator_present {
            bits |= 1 << 9;
        }
        bits
    }
}

/// Service Descriptor Extension attribute (0x0e).
///
/// Large (≥ 256 byte) service info travels here as
/// `len:LE16 ‖ oui:3 ‖ protocol:1 ‖ bytes`, with `len` covering the OUI,
/// the protocol byte and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptorExtension {
    pub instance_id: u8,
    pub control: SdeControl,
    pub service_update_indicator: Option<u8>,
    pub oui: Oui,
    pub service_protocol_type: u8,
    pub service_info: Vec<u8>,
}

impl ServiceDescriptorExtension {
    pub fn new(instance_id: u8) -> Self {
        Self {
            instance_id,
            control: SdeControl::default(),
            service_update_indicator: None,
            oui: NAN_OUI,
            service_protocol_type: 2,
            service_info: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let mut r = ByteReader::new(data);
        let instance_id = r.read_u8();
        let control = SdeControl::unpack(r.read_le16());

        if control.range_limit_present {
            r.advance(4);
        }
        let service_update_indicator = if control.service_update_indicator_present {
            Some(r.read_u8())
        } else {
            None
        };

        let mut oui = NAN_OUI;
        let mut service_protocol_type = 0;
        let mut service_info = Vec::new();
        if r.rest() > 0 {
            let length = r.read_le16() as usize;
            if length < 4 {
                return Err(WireError::UnexpectedFormat);
            }
            let oui_bytes = r.read_bytes(3);
            if oui_bytes.len() == 3 {
                oui = Oui([oui_bytes[0], oui_bytes[1], oui_bytes[2]]);
            }
            service_protocol_type = r.read_u8();
            service_info = r.read_bytes(length - 4).to_vec();
        }
        r.finish()?;

        Ok(Self {
            instance_id,
            control,
            service_update_indicator,
            oui,
            service_protocol_type,
            service_info,
        })
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        let length_at = write_attribute_header(writer, SERVICE_DESCRIPTOR_EXTENSION_ATTRIBUTE);
        writer.write_u8(self.instance_id);

        let mut control = self.control;
        control.service_update_indicator_present = self.service_update_indicator.is_some();
        writer.write_le16(control.pack());

        if let Some(indicator) = self.service_update_indicator {
            writer.write_u8(indicator);
        }
        if !self.service_info.is_empty() {
            writer.write_le16((self.service_info.len() + 4) as u16);
            writer.write_bytes(&self.oui.0);
            writer.write_u8(self.service_protocol_type);
            writer.write_bytes(&self.service_info);
        }
        close_attribute(writer, length_at);
    }
}

/// Device Capability attribute (0x0f), populated with the minimal sane
/// defaults: awake in every 2.4 GHz DW, 2.4 GHz band support only.
pub fn write_device_capability(writer: &mut ByteWriter) {
    let length_at = write_attribute_header(writer, DEVICE_CAPABILITY_ATTRIBUTE);
    writer.write_u8(0); // map id: not specified
    writer.write_le16(0x0001); // committed DW info: every 2.4 GHz DW
    writer.write_u8(0x04); // supported bands: 2.4 GHz
    writer.write_u8(0); // operation mode
    writer.write_u8(0); // antennas: no information
    writer.write_le16(0); // max channel switch time: no information
    writer.write_u8(0); // capabilities
    close_attribute(writer, length_at);
}

/// NAN Availability attribute (0x12): one committed entry, no time bitmap.
pub fn write_availability(writer: &mut ByteWriter) {
    let length_at = write_attribute_header(writer, NAN_AVAILABILITY_ATTRIBUTE);
    writer.write_u8(0); // sequence id
    writer.write_le16(0x0001); // attribute control: map id 1
    writer.write_le16(5); // entry length
    writer.write_le16(0x0001); // entry control: committed
    writer.write_le16(0); // time bitmap control
    writer.write_u8(0); // time bitmap length
    close_attribute(writer, length_at);
}

/// Vendor-specific attribute (0xdd) carrying only an OUI; marks relayed
/// frames in the desync experiment.
pub fn write_vendor_marker(writer: &mut ByteWriter, oui: Oui) {
    let length_at = write_attribute_header(writer, VENDOR_SPECIFIC_ATTRIBUTE);
    writer.write_bytes(&oui.0);
    close_attribute(writer, length_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn collect(bytes: &[u8]) -> Vec<RawAttribute<'_>> {
        Attributes::new(ByteReader::new(bytes))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn master_indication_and_cluster_round_trip() {
        let mi = MasterIndication {
            master_preference: 200,
            random_factor: 100,
        };
        let cluster = ClusterAttribute {
            anchor_master_rank: 0x11223344aabbccdd,
            hop_count: 2,
            ambtt: 0xdeadbeef,
        };

        let mut w = ByteWriter::new();
        mi.write(&mut w);
        cluster.write(&mut w);
        let bytes = w.finish().unwrap();

        let attrs = collect(&bytes);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].id, MASTER_INDICATION_ATTRIBUTE);
        assert_eq!(MasterIndication::parse(attrs[0].data).unwrap(), mi);
        assert_eq!(attrs[1].id, CLUSTER_ATTRIBUTE);
        assert_eq!(ClusterAttribute::parse(attrs[1].data).unwrap(), cluster);
    }

    #[test]
    fn cluster_attribute_layout_is_fixed() {
        let cluster = ClusterAttribute {
            anchor_master_rank: 1,
            hop_count: 3,
            ambtt: 2,
        };
        let mut w = ByteWriter::new();
        cluster.write(&mut w);
        let bytes = w.finish().unwrap();

        assert_eq!(bytes.len(), ATTRIBUTE_HEADER_LEN + 13);
        assert_eq!(bytes[1], 13); // LE16 length low byte
        assert_eq!(bytes[2], 0);
    }

    #[test]
    fn service_descriptor_round_trip_with_info() {
        let sd = ServiceDescriptor {
            service_id: ServiceId([1, 2, 3, 4, 5, 6]),
            instance_id: 7,
            requestor_instance_id: 9,
            control: {
                let mut c = SdControl::new(ServiceControlType::FollowUp);
                c.service_info_present = true;
                c
            },
            service_info: b"hi".to_vec(),
        };

        let mut w = ByteWriter::new();
        sd.write(&mut w);
        let bytes = w.finish().unwrap();

        let attrs = collect(&bytes);
        let parsed = ServiceDescriptor::parse(attrs[0].data).unwrap();
        assert_eq!(parsed, sd);
    }

    #[test]
    fn service_descriptor_skips_filters() {
        // service id, ids, control with matching filter + binding bitmap.
        let mut control = SdControl::new(ServiceControlType::Publish);
        control.matching_filter_present = true;
        control.binding_bitmap_present = true;

        let mut w = ByteWriter::new();
        w.write_bytes(&[9; 6]);
        w.write_u8(1).write_u8(0).write_u8(control.pack());
        w.write_le16(0xffff); // binding bitmap
        w.write_u8(3).write_bytes(&[1, 2, 3]); // matching filter
        let bytes = w.finish().unwrap();

        let parsed = ServiceDescriptor::parse(&bytes).unwrap();
        assert_eq!(parsed.instance_id, 1);
        assert!(parsed.service_info.is_empty());
    }

    #[test]
    fn extension_round_trip_with_large_info() {
        let mut sdea = ServiceDescriptorExtension::new(5);
        sdea.service_update_indicator = Some(3);
        sdea.control.service_update_indicator_present = true;
        sdea.service_info = vec![0x55; 300];

        let mut w = ByteWriter::new();
        sdea.write(&mut w);
        let bytes = w.finish().unwrap();

        let attrs = collect(&bytes);
        let parsed = ServiceDescriptorExtension::parse(attrs[0].data).unwrap();
        assert_eq!(parsed, sdea);
    }

    #[test]
    fn unknown_attributes_are_yielded_not_fatal() {
        let mut w = ByteWriter::new();
        w.write_u8(0x42).write_le16(2).write_bytes(&[0, 0]);
        MasterIndication {
            master_preference: 1,
            random_factor: 2,
        }
        .write(&mut w);
        let bytes = w.finish().unwrap();

        let attrs = collect(&bytes);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].id, 0x42);
        assert_eq!(attrs[1].id, MASTER_INDICATION_ATTRIBUTE);
    }

    #[test]
    fn trailing_garbage_fails_the_iteration() {
        let mut w = ByteWriter::new();
        MasterIndication {
            master_preference: 1,
            random_factor: 2,
        }
        .write(&mut w);
        w.write_u8(0x03).write_le16(50); // claims 50 bytes, has none
        let bytes = w.finish().unwrap();

        let items: Vec<_> = Attributes::new(ByteReader::new(&bytes)).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn device_capability_and_availability_have_fixed_sizes() {
        let mut w = ByteWriter::new();
        write_device_capability(&mut w);
        write_availability(&mut w);
        let bytes = w.finish().unwrap();

        let attrs = collect(&bytes);
        assert_eq!(attrs[0].id, DEVICE_CAPABILITY_ATTRIBUTE);
        assert_eq!(attrs[0].data.len(), 9);
        assert_eq!(attrs[1].id, NAN_AVAILABILITY_ATTRIBUTE);
        assert_eq!(attrs[1].data.len(), 10);
    }

    quickcheck! {
        fn master_indication_round_trips(mp: u8, rf: u8) -> bool {
            let attr = MasterIndication { master_preference: mp, random_factor: rf };
            let mut w = ByteWriter::new();
            attr.write(&mut w);
            let bytes = w.finish().unwrap();
            let raw = collect(&bytes);
            MasterIndication::parse(raw[0].data).unwrap() == attr
        }

        fn cluster_round_trips(amr: u64, hc: u8, ambtt: u32) -> bool {
            let attr = ClusterAttribute { anchor_master_rank: amr, hop_count: hc, ambtt };
            let mut w = ByteWriter::new();
            attr.write(&mut w);
            let bytes = w.finish().unwrap();
            let raw = collect(&bytes);
            ClusterAttribute::parse(raw[0].data).unwrap() == attr
        }

        fn descriptor_info_round_trips(info: Vec<u8>) -> bool {
            let info = if info.len() >= 256 { info[..255].to_vec() } else { info };
            let mut control = SdControl::new(ServiceControlType::Publish);
            control.service_info_present = !info.is_empty();
            let sd = ServiceDescriptor {
                service_id: ServiceId([0xab; 6]),
                instance_id: 1,
                requestor_instance_id: 0,
                control,
                service_info: info,
            };
            let mut w = ByteWriter::new();
            sd.write(&mut w);
            let bytes = w.finish().unwrap();
            let raw = collect(&bytes);
            ServiceDescriptor::parse(raw[0].data).unwrap() == sd
        }
    }
}
