//! BEP-11 peer exchange (`ut_pex`). Gossips the peers we know about to
//! connected peers every [`PEX_INTERVAL`], capped at
//! [`PEX_MAX_PEERS_PER_MSG`] per direction and per address family. Grounded
//! on `libtransmission/peer-msgs.cc`'s `ut_pex` message building (the
//! `added`/`added.f`/`dropped` compact-peer dict, the per-tick cap); the
//! IPv6 sibling fields (`added6`/`added6.f`/`dropped6`, 18-byte records)
//! are the teacher's dict keys too, but the teacher's own parser never
//! populates them — `spec.md` §4.5 calls for both families explicitly, so
//! this module fills that gap using the same compact-record shape.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::{Deserialize, Serialize};

use crate::conf::PEX_MAX_PEERS_PER_MSG;

/// Bit 0x02 of a peer's `added.f` flag byte: they are a seed.
pub const FLAG_SEED: u8 = 0x02;
/// Bit 0x01: peer supports encryption.
pub const FLAG_PREFERS_ENCRYPTION: u8 = 0x01;
/// Bit 0x04: peer supports µTP.
pub const FLAG_SUPPORTS_UTP: u8 = 0x04;

/// One peer plus the flags we know about it, prior to compact encoding.
/// Holds either family; which wire field (`added`/`added6`) it lands in is
/// decided at encode time by `addr`'s variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: u8,
}

impl PexPeer {
    pub fn new(addr: SocketAddr, flags: u8) -> Self {
        Self { addr, flags }
    }

    pub fn v4(addr: SocketAddrV4, flags: u8) -> Self {
        Self { addr: SocketAddr::V4(addr), flags }
    }

    pub fn v6(addr: SocketAddrV6, flags: u8) -> Self {
        Self { addr: SocketAddr::V6(addr), flags }
    }
}

fn compact_encode_v4(peers: &[PexPeer]) -> (Vec<u8>, Vec<u8>) {
    let mut added = Vec::with_capacity(peers.len() * 6);
    let mut added_f = Vec::with_capacity(peers.len());
    for p in peers {
        if let SocketAddr::V4(addr) = p.addr {
            added.extend_from_slice(&addr.ip().octets());
            added.extend_from_slice(&addr.port().to_be_bytes());
            added_f.push(p.flags);
        }
    }
    (added, added_f)
}

fn compact_encode_v6(peers: &[PexPeer]) -> (Vec<u8>, Vec<u8>) {
    let mut added = Vec::with_capacity(peers.len() * 18);
    let mut added_f = Vec::with_capacity(peers.len());
    for p in peers {
        if let SocketAddr::V6(addr) = p.addr {
            added.extend_from_slice(&addr.ip().octets());
            added.extend_from_slice(&addr.port().to_be_bytes());
            added_f.push(p.flags);
        }
    }
    (added, added_f)
}

fn compact_decode_v4(added: &[u8], added_f: &[u8]) -> Vec<PexPeer> {
    added
        .chunks_exact(6)
        .enumerate()
        .map(|(i, chunk)| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            let flags = added_f.get(i).copied().unwrap_or(0);
            PexPeer::v4(SocketAddrV4::new(ip, port), flags)
        })
        .collect()
}

fn compact_decode_v6(added: &[u8], added_f: &[u8]) -> Vec<PexPeer> {
    added
        .chunks_exact(18)
        .enumerate()
        .map(|(i, chunk)| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            let flags = added_f.get(i).copied().unwrap_or(0);
            PexPeer::v6(SocketAddrV6::new(ip, port, 0, 0), flags)
        })
        .collect()
}

fn compact_encode_dropped_v4(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for addr in peers {
        if let SocketAddr::V4(addr) = addr {
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

fn compact_encode_dropped_v6(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 18);
    for addr in peers {
        if let SocketAddr::V6(addr) = addr {
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

fn compact_decode_dropped_v4(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}

fn compact_decode_dropped_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(18)
        .map(|chunk| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&chunk[0..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([chunk[16], chunk[17]]);
            SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))
        })
        .collect()
}

/// The bencoded `ut_pex` dictionary. `added`/`added.f`/`dropped` (IPv4) and
/// `added6`/`added6.f`/`dropped6` (IPv6) are compact byte strings, so we
/// hand-roll (de)serialization through `serde_bytes` rather than deriving
/// it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PexWire {
    #[serde(rename = "added", with = "serde_bytes")]
    added: Vec<u8>,
    #[serde(rename = "added.f", with = "serde_bytes")]
    added_f: Vec<u8>,
    #[serde(rename = "dropped", with = "serde_bytes")]
    dropped: Vec<u8>,
    #[serde(rename = "added6", with = "serde_bytes")]
    added6: Vec<u8>,
    #[serde(rename = "added6.f", with = "serde_bytes")]
    added6_f: Vec<u8>,
    #[serde(rename = "dropped6", with = "serde_bytes")]
    dropped6: Vec<u8>,
}

impl PexMessage {
    pub fn to_bencode(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        let (added, added_f) = compact_encode_v4(&self.added);
        let (added6, added6_f) = compact_encode_v6(&self.added);
        let dropped = compact_encode_dropped_v4(&self.dropped);
        let dropped6 = compact_encode_dropped_v6(&self.dropped);
        serde_bencode::to_bytes(&PexWire {
            added,
            added_f,
            dropped,
            added6,
            added6_f,
            dropped6,
        })
    }

    pub fn from_bencode(data: &[u8]) -> Result<Self, serde_bencode::Error> {
        let wire: PexWire = serde_bencode::from_bytes(data)?;
        let mut added = compact_decode_v4(&wire.added, &wire.added_f);
        added.extend(compact_decode_v6(&wire.added6, &wire.added6_f));
        let mut dropped = compact_decode_dropped_v4(&wire.dropped);
        dropped.extend(compact_decode_dropped_v6(&wire.dropped6));
        Ok(Self { added, dropped })
    }
}

/// Splits a larger known-peer set into `ut_pex`-sized chunks, each capped
/// at [`PEX_MAX_PEERS_PER_MSG`] added peers per address family (IPv4 and
/// IPv6 counted separately, matching `peer-msgs.cc`'s per-tick, per-family
/// cap), grounded on the same per-tick limit.
pub fn chunk_added(peers: &[PexPeer]) -> Vec<Vec<PexPeer>> {
    let (v4, v6): (Vec<_>, Vec<_>) = peers.iter().copied().partition(|p| p.addr.is_ipv4());
    let mut chunks: Vec<Vec<PexPeer>> = v4.chunks(PEX_MAX_PEERS_PER_MSG).map(|c| c.to_vec()).collect();
    chunks.extend(v6.chunks(PEX_MAX_PEERS_PER_MSG).map(|c| c.to_vec()));
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer4(a: u8, b: u8, c: u8, d: u8, port: u16, flags: u8) -> PexPeer {
        PexPeer::v4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port), flags)
    }

    fn peer6(segments: [u16; 8], port: u16, flags: u8) -> PexPeer {
        PexPeer::v6(SocketAddrV6::new(Ipv6Addr::from(segments), port, 0, 0), flags)
    }

    #[test]
    fn roundtrip_through_bencode_preserves_peers_and_flags() {
        let msg = PexMessage {
            added: vec![
                peer4(192, 168, 1, 1, 6881, FLAG_SEED),
                peer4(10, 0, 0, 5, 51413, FLAG_PREFERS_ENCRYPTION),
            ],
            dropped: vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6882))],
        };
        let bytes = msg.to_bencode().unwrap();
        let parsed = PexMessage::from_bencode(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn roundtrip_preserves_ipv6_peers_in_separate_18_byte_fields() {
        let msg = PexMessage {
            added: vec![
                peer4(192, 168, 1, 1, 6881, 0),
                peer6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 6882, FLAG_SUPPORTS_UTP),
            ],
            dropped: vec![SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from([0x2001, 0xdb8, 0, 0, 0, 0, 0, 2]),
                6883,
                0,
                0,
            ))],
        };
        let bytes = msg.to_bencode().unwrap();
        let parsed = PexMessage::from_bencode(&bytes).unwrap();
        assert_eq!(parsed.added.len(), 2);
        assert!(parsed.added.iter().any(|p| p.addr.is_ipv4()));
        assert!(parsed.added.iter().any(|p| p.addr.is_ipv6()));
        assert_eq!(parsed, msg);
    }

    #[test]
    fn chunking_never_exceeds_the_per_message_cap_per_family() {
        let mut peers: Vec<_> = (0..130u8).map(|i| peer4(10, 0, 0, i, 6881, 0)).collect();
        peers.push(peer6([0x2001, 0xdb8, 0, 0, 0, 0, 0, 1], 6881, 0));
        let chunks = chunk_added(&peers);
        for chunk in &chunks {
            assert!(chunk.len() <= PEX_MAX_PEERS_PER_MSG);
        }
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 131);
    }

    #[test]
    fn empty_message_roundtrips() {
        let msg = PexMessage::default();
        let bytes = msg.to_bencode().unwrap();
        let parsed = PexMessage::from_bencode(&bytes).unwrap();
        assert_eq!(parsed, msg);
    }
}
