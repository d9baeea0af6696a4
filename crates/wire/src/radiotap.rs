//! Radiotap header encode and parse.
//!
//! TX headers carry the minimal field set monitor-mode injection needs
//! (FCS flag, rate, antenna-signal placeholder). RX parsing walks the
//! present bitmap with the standard per-field alignment rules and extracts
//! the fields the pipeline consumes: TSFT, flags and antenna signal.

use crate::buf::{ByteReader, ByteWriter, WireError};

pub const IEEE80211_RADIOTAP_TSFT: u32 = 0;
pub const IEEE80211_RADIOTAP_FLAGS: u32 = 1;
pub const IEEE80211_RADIOTAP_RATE: u32 = 2;
pub const IEEE80211_RADIOTAP_DBM_ANTSIGNAL: u32 = 5;

/// Frame includes a trailing FCS.
pub const IEEE80211_RADIOTAP_F_FCS: u8 = 0x10;
/// Frame failed the FCS check.
pub const IEEE80211_RADIOTAP_F_BADFCS: u8 = 0x40;

/// `(size, alignment)` for the standard radiotap fields, indexed by
/// present-bitmap bit. Parsing stops at the first set bit past this table
/// since later fields cannot be skipped without knowing their size.
const FIELD_LAYOUT: [(usize, usize); 23] = [
    (8, 8), // TSFT
    (1, 1), // flags
    (1, 1), // rate
    (4, 2), // channel
    (2, 2), // FHSS
    (1, 1), // dBm antenna signal
    (1, 1), // dBm antenna noise
    (2, 2), // lock quality
    (2, 2), // TX attenuation
    (2, 2), // dB TX attenuation
    (1, 1), // dBm TX power
    (1, 1), // antenna
    (1, 1), // dB antenna signal
    (1, 1), // dB antenna noise
    (2, 2), // RX flags
    (2, 2), // TX flags
    (1, 1), // RTS retries
    (1, 1), // data retries
    (8, 4), // XChannel
    (3, 1), // MCS
    (8, 4), // A-MPDU status
    (12, 2), // VHT
    (12, 8), // timestamp
];

/// Fields of interest extracted from a received radiotap header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxInfo {
    pub rssi: Option<i8>,
    pub flags: u8,
    pub tsft: Option<u64>,
}

/// Parse the radiotap header and leave the reader at the 802.11 frame.
pub fn parse_header(reader: &mut ByteReader<'_>) -> Result<RxInfo, WireError> {
    let header_start = reader.position();

    let _version = reader.read_u8();
    let _pad = reader.read_u8();
    let it_len = reader.read_le16() as usize;

    // Present words chain while bit 31 is set.
    let mut present_words = Vec::with_capacity(1);
    loop {
        let word = reader.read_le32();
        present_words.push(word);
        if reader.had_error() {
            return Err(WireError::TooShort);
        }
        if word & (1 << 31) == 0 {
            break;
        }
    }

    let fields_start = reader.position() - header_start;
    if it_len < fields_start {
        return Err(WireError::UnexpectedFormat);
    }

    let mut info = RxInfo::default();
    let present = present_words[0];
    let data = reader.read_bytes(it_len - fields_start);
    if reader.had_error() {
        return Err(WireError::TooShort);
    }

    // Field alignment is relative to the start of the radiotap header.
    let mut offset = fields_start;
    for bit in 0..29u32 {
        if present & (1 << bit) == 0 {
            continue;
        }
        let Some(&(size, align)) = FIELD_LAYOUT.get(bit as usize) else {
            // Unknown field size; everything we care about sits below.
            break;
        };
        offset = (offset + align - 1) & !(align - 1);
        let Some(field) = data.get(offset - fields_start..offset - fields_start + size) else {
            return Err(WireError::TooShort);
        };

        match bit {
            IEEE80211_RADIOTAP_TSFT => {
                let mut b = [0u8; 8];
                b.copy_from_slice(field);
                info.tsft = Some(u64::from_le_bytes(b));
            }
            IEEE80211_RADIOTAP_FLAGS => info.flags = field[0],
            IEEE80211_RADIOTAP_DBM_ANTSIGNAL => info.rssi = Some(field[0] as i8),
            _ => {}
        }
        offset += size;
    }

    Ok(info)
}

/// Write the injection radiotap header.
pub fn write_header(writer: &mut ByteWriter, fcs: bool) {
    let start = writer.len();
    writer.write_u8(0); // it_version
    writer.write_u8(0); // it_pad
    let len_at = writer.len();
    writer.write_le16(0);

    let mut present = 0u32;
    let present_at = writer.len();
    writer.write_le32(0);

    if fcs {
        present |= 1 << IEEE80211_RADIOTAP_FLAGS;
        writer.write_u8(IEEE80211_RADIOTAP_F_FCS);
    }
    present |= 1 << IEEE80211_RADIOTAP_RATE;
    writer.write_u8(2);

    // Antenna-signal placeholder; ignored by the injecting driver.
    present |= 1 << IEEE80211_RADIOTAP_DBM_ANTSIGNAL;
    writer.write_u8(200);

    let it_len = (writer.len() - start) as u16;
    writer.patch_le16(len_at, it_len);
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&present.to_le_bytes());
    writer
        .patch_u8(present_at, bytes[0])
        .patch_u8(present_at + 1, bytes[1])
        .patch_u8(present_at + 2, bytes[2])
        .patch_u8(present_at + 3, bytes[3]);
}
