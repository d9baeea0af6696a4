//! Ethernet addresses and OUIs.

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

/// A 48-bit IEEE 802 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EtherAddr(pub [u8; 6]);

impl EtherAddr {
    pub const ZERO: EtherAddr = EtherAddr([0; 6]);
    pub const BROADCAST: EtherAddr = EtherAddr([0xff; 6]);

    pub fn octets(&self) -> &[u8; 6] {
        &self.0
    }

    /// Group (multicast/broadcast) addresses have the I/G bit set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Derive the link-local IPv6 address per RFC 4291 (modified EUI-64).
    pub fn ipv6_link_local(&self) -> Ipv6Addr {
        let o = &self.0;
        let mut b = [0u8; 16];
        b[0] = 0xfe;
        b[1] = 0x80;
        b[8] = o[0] ^ 0x02;
        b[9] = o[1];
        b[10] = o[2];
        b[11] = 0xff;
        b[12] = 0xfe;
        b[13] = o[3];
        b[14] = o[4];
        b[15] = o[5];
        Ipv6Addr::from(b)
    }
}

impl fmt::Display for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for EtherAddr {
    type Err = InvalidEtherAddr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or(InvalidEtherAddr)?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| InvalidEtherAddr)?;
        }
        if parts.next().is_some() {
            return Err(InvalidEtherAddr);
        }
        Ok(EtherAddr(octets))
    }
}

/// Failure to parse a textual ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid ethernet address")]
pub struct InvalidEtherAddr;

/// A 24-bit organizationally unique identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oui(pub [u8; 3]);

impl fmt::Display for Oui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}:{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let addr = EtherAddr([0x02, 0x00, 0x0a, 0xff, 0x00, 0x01]);
        let text = addr.to_string();

        assert_eq!(text, "02:00:0a:ff:00:01");
        assert_eq!(text.parse::<EtherAddr>().unwrap(), addr);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("02:00:0a".parse::<EtherAddr>().is_err());
        assert!("02:00:0a:ff:00:01:07".parse::<EtherAddr>().is_err());
        assert!("gg:00:0a:ff:00:01".parse::<EtherAddr>().is_err());
    }

    #[test]
    fn multicast_bit() {
        assert!(EtherAddr::BROADCAST.is_multicast());
        assert!(EtherAddr([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(!EtherAddr([0x02, 0, 0, 0, 0, 1]).is_multicast());
    }

    #[test]
    fn ipv6_link_local_flips_universal_bit() {
        let addr = EtherAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let ip = addr.ipv6_link_local();

        assert_eq!(
            ip.octets(),
            [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0x00, 0x11, 0x22, 0xff, 0xfe, 0x33, 0x44, 0x55]
        );
    }
}
