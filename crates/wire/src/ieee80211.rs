//! IEEE 802.11 management header and FCS handling.

use crate::buf::{ByteReader, ByteWriter, WireError};
use crate::crc32::crc32;
use crate::ether::EtherAddr;

pub const IEEE80211_FCTL_FTYPE: u16 = 0x000c;
pub const IEEE80211_FCTL_STYPE: u16 = 0x00f0;

pub const IEEE80211_FTYPE_MGMT: u16 = 0x0000;

pub const IEEE80211_STYPE_BEACON: u16 = 0x0080;
pub const IEEE80211_STYPE_ACTION: u16 = 0x00d0;

pub const IEEE80211_PUBLIC_ACTION_FRAME: u8 = 0x04;
pub const IEEE80211_PUBLIC_ACTION_FRAME_VENDOR_SPECIFIC: u8 = 0x09;

pub const FCS_LEN: usize = 4;
pub const MGMT_HEADER_LEN: usize = 24;

/// Three-address management header. `bssid` carries the NAN cluster id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtHeader {
    pub frame_control: u16,
    pub duration_id: u16,
    pub dst: EtherAddr,
    pub src: EtherAddr,
    pub bssid: EtherAddr,
    pub seq_ctrl: u16,
}

impl MgmtHeader {
    pub fn ftype_stype(&self) -> u16 {
        self.frame_control & (IEEE80211_FCTL_FTYPE | IEEE80211_FCTL_STYPE)
    }

    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self, WireError> {
        let header = Self {
            frame_control: reader.read_le16(),
            duration_id: reader.read_le16(),
            dst: reader.read_ether_addr(),
            src: reader.read_ether_addr(),
            bssid: reader.read_ether_addr(),
            seq_ctrl: reader.read_le16(),
        };
        reader.finish()?;
        Ok(header)
    }

    pub fn write(&self, writer: &mut ByteWriter) {
        writer
            .write_le16(self.frame_control)
            .write_le16(self.duration_id)
            .write_ether_addr(&self.dst)
            .write_ether_addr(&self.src)
            .write_ether_addr(&self.bssid)
            .write_le16(self.seq_ctrl);
    }
}

/// Monotonic 802.11 sequence-number state.
#[derive(Debug, Default, Clone)]
pub struct SequenceNumbers {
    next: u16,
}

impl SequenceNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value for `seq_ctrl`: the sequence number occupies the upper
    /// twelve bits, the fragment number is always zero.
    pub fn next_seq_ctrl(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq << 4
    }
}

/// Append the FCS over everything written so far, radiotap included; the
/// injection path hands the driver the buffer exactly as built here.
pub fn append_fcs(writer: &mut ByteWriter) {
    let fcs = crc32(writer.as_slice());
    writer.write_le32(fcs);
}
