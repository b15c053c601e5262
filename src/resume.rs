//! Resume file: a bencoded dict this crate reads/writes the keys it's
//! responsible for, leaving everything else (bandwidth limits, speed caps,
//! tracker overrides) to the daemon layer above it.
//!
//! Grounded on `libtransmission/resume.c` (`KEY_DOWNLOAD_DIR`, `KEY_PAUSED`,
//! `KEY_PEERS`/`KEY_PEERS6`, `KEY_FILE_PRIORITIES`, `KEY_DND`,
//! `KEY_PROGRESS`/`KEY_PROGRESS_HAVE`/`KEY_PROGRESS_BITFIELD`/
//! `KEY_PROGRESS_CHECKTIME`): `saveProgress`/`loadProgress`'s "all" vs.
//! raw-bitfield dichotomy maps directly onto [`Bitfield`]'s have-all/array
//! split, so loading a resume file is really just feeding its bytes through
//! [`Bitfield::set_from_raw`] or [`Bitfield::set_has_all`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use serde::de::{self, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::bitfield::Bitfield;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactPeers4(pub Vec<SocketAddrV4>);
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactPeers6(pub Vec<SocketAddrV6>);

macro_rules! compact_peer_list {
    ($ty:ident, $addr:ty, $new:expr, $record_len:expr, $visitor:ident, $expecting:literal) => {
        struct $visitor;

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut bytes = Vec::with_capacity(self.0.len() * $record_len);
                for addr in &self.0 {
                    encode_addr(addr, &mut bytes);
                }
                serializer.serialize_bytes(&bytes)
            }
        }

        impl<'de> Visitor<'de> for $visitor {
            type Value = $ty;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str($expecting)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<$ty, E> {
                if v.len() % $record_len != 0 {
                    return Err(de::Error::custom(format!(
                        "expected a multiple of {} bytes, got {}",
                        $record_len,
                        v.len()
                    )));
                }
                Ok($ty(v.chunks_exact($record_len).map(decode_addr).collect()))
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<$ty, D::Error> {
                deserializer.deserialize_bytes($visitor)
            }
        }
    };
}

fn encode_addr(addr: &SocketAddrV4, out: &mut Vec<u8>) {
    out.extend_from_slice(&addr.ip().octets());
    out.extend_from_slice(&addr.port().to_be_bytes());
}

fn decode_addr(chunk: &[u8]) -> SocketAddrV4 {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddrV4::new(ip, port)
}

compact_peer_list!(CompactPeers4, SocketAddrV4, SocketAddrV4::new, 6, Peers4Visitor, "a multiple of 6 bytes");

impl Serialize for CompactPeers6 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = Vec::with_capacity(self.0.len() * 18);
        for addr in &self.0 {
            bytes.extend_from_slice(&addr.ip().octets());
            bytes.extend_from_slice(&addr.port().to_be_bytes());
        }
        serializer.serialize_bytes(&bytes)
    }
}

struct Peers6Visitor;
impl<'de> Visitor<'de> for Peers6Visitor {
    type Value = CompactPeers6;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a multiple of 18 bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<CompactPeers6, E> {
        if v.len() % 18 != 0 {
            return Err(de::Error::custom(format!(
                "expected a multiple of 18 bytes, got {}",
                v.len()
            )));
        }
        Ok(CompactPeers6(
            v.chunks_exact(18)
                .map(|c| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&c[..16]);
                    let port = u16::from_be_bytes([c[16], c[17]]);
                    SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)
                })
                .collect(),
        ))
    }
}

impl<'de> Deserialize<'de> for CompactPeers6 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<CompactPeers6, D::Error> {
        deserializer.deserialize_bytes(Peers6Visitor)
    }
}

/// `progress.have: "all"` OR `progress.bitfield: <raw bytes>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaveProgress {
    All,
    Bitfield(Vec<u8>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    #[serde(rename = "have", default, skip_serializing_if = "Option::is_none")]
    have_all: Option<String>,
    #[serde(rename = "bitfield", default, skip_serializing_if = "Option::is_none", with = "serde_bytes_opt")]
    bitfield: Option<Vec<u8>>,
    #[serde(rename = "time-checked", default)]
    pub time_checked: Vec<i64>,
}

/// `with = "serde_bytes"` doesn't support `Option<Vec<u8>>` directly; this
/// is the standard adapter shape for it.
mod serde_bytes_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => serde_bytes::Bytes::new(bytes).serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let buf = Option::<serde_bytes::ByteBuf>::deserialize(d)?;
        Ok(buf.map(|b| b.into_vec()))
    }
}

impl Progress {
    pub fn have(&self) -> Result<Option<HaveProgress>, ResumeError> {
        if let Some(s) = &self.have_all {
            if s == "all" {
                return Ok(Some(HaveProgress::All));
            }
            return Err(ResumeError::InvalidHaveValue(s.clone()));
        }
        Ok(self.bitfield.clone().map(HaveProgress::Bitfield))
    }

    pub fn set_have_all(&mut self) {
        self.have_all = Some("all".to_string());
        self.bitfield = None;
    }

    pub fn set_bitfield(&mut self, raw: Vec<u8>) {
        self.have_all = None;
        self.bitfield = Some(raw);
    }
}

/// The keys this crate is responsible for; everything else in a real resume
/// file (speed limits, tracker overrides, labels) lives above this layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(rename = "peers2", default, skip_serializing_if = "Option::is_none")]
    pub peers2: Option<CompactPeers4>,
    #[serde(rename = "peers2-6", default, skip_serializing_if = "Option::is_none")]
    pub peers2_6: Option<CompactPeers6>,
    #[serde(default)]
    pub priority: Vec<i64>,
    #[serde(default)]
    pub dnd: Vec<bool>,
    #[serde(default)]
    pub progress: Progress,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("failed to decode resume file bencode: {0}")]
    InvalidBencode(#[from] serde_bencode::Error),
    #[error("invalid value for progress.have: {0:?} (only \"all\" is recognised)")]
    InvalidHaveValue(String),
}

impl ResumeFile {
    pub fn to_bencode(&self) -> Result<Vec<u8>, ResumeError> {
        Ok(serde_bencode::to_bytes(self)?)
    }

    pub fn from_bencode(data: &[u8]) -> Result<Self, ResumeError> {
        Ok(serde_bencode::from_bytes(data)?)
    }

    /// Loads the saved block bitfield into `blocks`. If the bitfield's
    /// length doesn't match the torrent's current block count, the torrent
    /// is marked for re-verify. Returns whether a full re-verify is
    /// required (length mismatch, missing progress, or an invalid `have`
    /// value), matching `loadProgress`'s `err != NULL` path.
    pub fn load_into(&self, blocks: &mut Bitfield) -> Result<bool, ResumeError> {
        match self.progress.have()? {
            Some(HaveProgress::All) => {
                blocks.set_has_all();
                Ok(false)
            }
            Some(HaveProgress::Bitfield(raw)) => match blocks.set_from_raw(&raw) {
                Ok(()) => Ok(false),
                Err(_) => {
                    log::warn!("resume bitfield length mismatch, forcing re-verify");
                    Ok(true)
                }
            },
            None => {
                log::debug!("no saved progress, forcing re-verify");
                Ok(true)
            }
        }
    }

    /// Mirrors `saveProgress`: a seed records `have: "all"`; anyone else
    /// records the raw block bitfield.
    pub fn save_progress(&mut self, blocks: &Bitfield, time_checked: Vec<i64>) {
        if blocks.has_all() {
            self.progress.set_have_all();
        } else {
            self.progress.set_bitfield(blocks.to_raw());
        }
        self.progress.time_checked = time_checked;
    }
}
