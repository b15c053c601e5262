//! BEP-3 handshake: the fixed 68-byte preamble exchanged before any
//! length-prefixed message. Implemented as explicit byte slicing rather
//! than a derive, since the reserved-byte flags (BEP-5 DHT, BEP-6 Fast
//! Extension, BEP-10 LTEP) need bit-level access a struct derive doesn't
//! give us.

use crate::metainfo::InfoHash;

pub const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Bit 0x04 of reserved byte 7: BEP-6 Fast Extension.
const RESERVED_FAST_EXTENSION: (usize, u8) = (7, 0x04);
/// Bit 0x01 of reserved byte 7: BEP-5 DHT.
const RESERVED_DHT: (usize, u8) = (7, 0x01);
/// Bit 0x10 of reserved byte 5: BEP-10 LTEP.
const RESERVED_LTEP: (usize, u8) = (5, 0x10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake was {got} bytes, expected {HANDSHAKE_LEN}")]
    WrongLength { got: usize },
    #[error("protocol identifier byte was {0}, expected 19")]
    BadProtocolLen(u8),
    #[error("protocol string did not match \"BitTorrent protocol\"")]
    BadProtocolString,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    fn set_bit(&mut self, (byte, mask): (usize, u8)) {
        self.reserved[byte] |= mask;
    }

    fn has_bit(&self, (byte, mask): (usize, u8)) -> bool {
        self.reserved[byte] & mask != 0
    }

    pub fn with_fast_extension(mut self) -> Self {
        self.set_bit(RESERVED_FAST_EXTENSION);
        self
    }

    pub fn with_dht(mut self) -> Self {
        self.set_bit(RESERVED_DHT);
        self
    }

    pub fn with_ltep(mut self) -> Self {
        self.set_bit(RESERVED_LTEP);
        self
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.has_bit(RESERVED_FAST_EXTENSION)
    }

    pub fn supports_dht(&self) -> bool {
        self.has_bit(RESERVED_DHT)
    }

    pub fn supports_ltep(&self) -> bool {
        self.has_bit(RESERVED_LTEP)
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = 19;
        out[1..20].copy_from_slice(PROTOCOL_ID);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash.0);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::WrongLength { got: buf.len() });
        }
        if buf[0] != 19 {
            return Err(HandshakeError::BadProtocolLen(buf[0]));
        }
        if &buf[1..20] != PROTOCOL_ID {
            return Err(HandshakeError::BadProtocolString);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id,
        })
    }
}
