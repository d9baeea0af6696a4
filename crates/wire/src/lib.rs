//! Wire layer for NAN frames: cursor buffers, radiotap, IEEE 802.11
//! management headers, NAN frame bodies and NAN attribute TLVs.
pub mod attrs;
pub mod buf;
pub mod crc32;
pub mod ether;
pub mod frame;
pub mod ieee80211;
pub mod radiotap;

pub use buf::{ByteReader, ByteWriter, WireError};
pub use ether::{EtherAddr, Oui};

/// Upper bound for any frame we build or accept.
pub const BUF_MAX_LENGTH: usize = 65535;
