//! TCP header codec.
//!
//! The stack emits headers with data offset 5 (no options) and a fixed
//! advertised window. Peers routinely send options on the SYN+ACK, so
//! parse honors the data offset and skips them; their content is ignored.

use super::PacketError;

/// Control flag bits.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

/// Size of a header with no options.
pub const HEADER_LEN: usize = 20;

/// Advertised receive window on every outbound segment.
pub const DEFAULT_WINDOW: u16 = 64420;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
    pub payload: Vec<u8>,
}

impl TcpHeader {
    /// Outbound segment with the stack's fixed shape: offset 5, window
    /// 64420, no urgent pointer.
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack,
            data_offset: 5,
            flags,
            window: DEFAULT_WINDOW,
            checksum: 0,
            urgent: 0,
            payload,
        }
    }

    /// Parse a segment; everything past the data offset is payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                kind: "TCP",
                len: bytes.len(),
            });
        }
        let data_offset = bytes[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::BadDataOffset(data_offset));
        }
        let header_len = data_offset as usize * 4;
        if bytes.len() < header_len {
            return Err(PacketError::Truncated {
                kind: "TCP",
                len: bytes.len(),
            });
        }
        Ok(Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            seq: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ack: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            data_offset,
            flags: bytes[13] & 0x3F,
            window: u16::from_be_bytes([bytes[14], bytes[15]]),
            checksum: u16::from_be_bytes([bytes[16], bytes[17]]),
            urgent: u16::from_be_bytes([bytes[18], bytes[19]]),
            payload: bytes[header_len..].to_vec(),
        })
    }

    /// Serialize header + payload with the checksum field zeroed.
    /// Options are never emitted; `data_offset` is written as given.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack.to_be_bytes());
        buf[12] = self.data_offset << 4;
        buf[13] = self.flags;
        buf[14..16].copy_from_slice(&self.window.to_be_bytes());
        // bytes 16-17: checksum, filled at send time
        buf[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// True when every bit of `mask` is set.
    pub fn has_flag(&self, mask: u8) -> bool {
        self.flags & mask == mask
    }
}

// =============================================================================
// Tests
// =============================================================================
