//! LTEP (BEP-10): the extension protocol handshake dict and dispatch.
//! The `m` dict advertises both `ut_metadata` and `ut_pex`.

pub mod pex;

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value as BValue;
use serde_bytes::ByteBuf;

use crate::conf::{LTEP_ID_UT_METADATA, LTEP_ID_UT_PEX, OUR_REQQ};

/// The `m` dict plus the handful of top-level scalars clients conventionally
/// advertise alongside it, per BEP-10's "Handshake" section.
#[derive(Debug, Serialize, Deserialize)]
pub struct LtepHandshake {
    pub m: HashMap<String, u8>,
    pub p: Option<u16>,
    pub v: Option<String>,
    /// 1 iff we prefer encryption.
    pub e: Option<u8>,
    pub reqq: Option<u32>,
    /// Present once metadata size is known, per BEP-9, and only if the
    /// torrent is public.
    pub metadata_size: Option<usize>,
    /// The peer's address as seen by us, compact 4 or 18 bytes.
    pub yourip: Option<ByteBuf>,
    pub ipv4: Option<ByteBuf>,
    pub ipv6: Option<ByteBuf>,
    /// 1 iff we are a seed for this torrent.
    pub upload_only: Option<u8>,
    #[serde(flatten)]
    other: HashMap<String, BValue>,
}

impl LtepHandshake {
    /// Builds our own handshake dict. Neither `ut_pex` nor `ut_metadata`
    /// is offered for a private torrent, per the `m` entry's own
    /// parenthetical (both require the torrent to be public); `metadata_size`
    /// is likewise withheld, since it only makes sense alongside
    /// `ut_metadata`.
    #[allow(clippy::too_many_arguments)]
    pub fn ours(
        listen_port: u16,
        client_version: &str,
        metadata_size: Option<usize>,
        is_private: bool,
        prefer_encryption: bool,
        upload_only: bool,
        peer_addr_seen: Option<IpAddr>,
        our_external_addr: Option<IpAddr>,
    ) -> Self {
        let mut m = HashMap::new();
        if !is_private {
            m.insert("ut_metadata".to_string(), LTEP_ID_UT_METADATA);
            m.insert("ut_pex".to_string(), LTEP_ID_UT_PEX);
        }

        let (ipv4, ipv6) = match our_external_addr {
            Some(IpAddr::V4(v4)) => (Some(ByteBuf::from(v4.octets().to_vec())), None),
            Some(IpAddr::V6(v6)) => (None, Some(ByteBuf::from(v6.octets().to_vec()))),
            None => (None, None),
        };

        Self {
            m,
            p: Some(listen_port),
            v: Some(client_version.to_string()),
            e: Some(prefer_encryption as u8),
            reqq: Some(OUR_REQQ),
            metadata_size: if is_private { None } else { metadata_size },
            yourip: peer_addr_seen.map(|ip| match ip {
                IpAddr::V4(v4) => ByteBuf::from(v4.octets().to_vec()),
                IpAddr::V6(v6) => ByteBuf::from(v6.octets().to_vec()),
            }),
            ipv4,
            ipv6,
            upload_only: Some(upload_only as u8),
            other: HashMap::new(),
        }
    }

    /// Maps an extension name to the numeric id the peer wants it sent
    /// under, as advertised in their `m` dict.
    pub fn peer_id_for(&self, name: &str) -> Option<u8> {
        self.m.get(name).copied()
    }

    pub fn prefers_encryption(&self) -> bool {
        self.e == Some(1)
    }

    pub fn is_upload_only(&self) -> bool {
        self.upload_only == Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_handshake_advertises_both_extensions_when_public() {
        let hs = LtepHandshake::ours(6881, "test/1.0", Some(4096), false, true, false, None, None);
        assert_eq!(hs.m.get("ut_metadata"), Some(&LTEP_ID_UT_METADATA));
        assert_eq!(hs.m.get("ut_pex"), Some(&LTEP_ID_UT_PEX));
        assert_eq!(hs.reqq, Some(OUR_REQQ));
        assert_eq!(hs.metadata_size, Some(4096));
        assert!(hs.prefers_encryption());
        assert!(!hs.is_upload_only());
    }

    /// spec.md §4.5: both extensions, and `metadata_size`, require the
    /// torrent to be public.
    #[test]
    fn our_handshake_omits_both_extensions_and_metadata_size_when_private() {
        let hs = LtepHandshake::ours(6881, "test/1.0", Some(4096), true, true, false, None, None);
        assert_eq!(hs.m.get("ut_metadata"), None);
        assert_eq!(hs.m.get("ut_pex"), None);
        assert_eq!(hs.metadata_size, None);
    }

    #[test]
    fn peer_id_lookup_reflects_peers_m_dict() {
        let mut m = HashMap::new();
        m.insert("ut_pex".to_string(), 7u8);
        let hs = LtepHandshake {
            m,
            p: None,
            v: None,
            e: None,
            reqq: None,
            metadata_size: None,
            yourip: None,
            ipv4: None,
            ipv6: None,
            upload_only: None,
            other: HashMap::new(),
        };
        assert_eq!(hs.peer_id_for("ut_pex"), Some(7));
        assert_eq!(hs.peer_id_for("ut_metadata"), None);
    }
}
