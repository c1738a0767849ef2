//! IPv4 header codec.
//!
//! Fixed-shape headers only: IHL 5 (no IP options) on the send path, and
//! arbitrary IHL accepted on parse so the payload offset is honored. The
//! checksum field is zeroed by [`marshal`](Ipv4Header::marshal) and filled
//! by the checksum engine at send time.

use std::net::Ipv4Addr;

use super::PacketError;

/// Size of a header with no options.
pub const HEADER_LEN: usize = 20;

/// Protocol numbers the stack dispatches on.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Don't-fragment bit of the 3-bit flags field.
pub const FLAG_DF: u8 = 0b010;

/// TTL stamped on every outbound packet.
pub const DEFAULT_TTL: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags: u8,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for an outbound TCP segment carrying `payload_len` bytes of
    /// TCP header + data. DF set, TTL 128, no options.
    pub fn for_tcp(id: u16, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Self {
        Self {
            version: 4,
            ihl: 5,
            tos: 0,
            total_len: (HEADER_LEN + payload_len) as u16,
            id,
            flags: FLAG_DF,
            frag_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: PROTO_TCP,
            checksum: 0,
            src,
            dst,
        }
    }

    /// Parse a header from the front of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                kind: "IPv4",
                len: bytes.len(),
            });
        }
        let ihl = bytes[0] & 0x0F;
        if ihl < 5 {
            return Err(PacketError::BadIhl(ihl));
        }
        if bytes.len() < ihl as usize * 4 {
            return Err(PacketError::Truncated {
                kind: "IPv4",
                len: bytes.len(),
            });
        }
        let flags_frag = u16::from_be_bytes([bytes[6], bytes[7]]);
        Ok(Self {
            version: bytes[0] >> 4,
            ihl,
            tos: bytes[1],
            total_len: u16::from_be_bytes([bytes[2], bytes[3]]),
            id: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags: (flags_frag >> 13) as u8,
            frag_offset: flags_frag & 0x1FFF,
            ttl: bytes[8],
            protocol: bytes[9],
            checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
            src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        })
    }

    /// Byte offset where the payload starts.
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Serialize to 20 bytes with the checksum field zeroed.
    pub fn marshal(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.version << 4) | (self.ihl & 0x0F);
        buf[1] = self.tos;
        buf[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.to_be_bytes());
        let flags_frag = ((self.flags as u16) << 13) | (self.frag_offset & 0x1FFF);
        buf[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        buf[8] = self.ttl;
        buf[9] = self.protocol;
        // bytes 10-11: checksum, filled at send time
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());
        buf
    }
}

// =============================================================================
// Tests
// =============================================================================
