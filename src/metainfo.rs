//! `.torrent` metainfo: the dictionary a peer-wire session and its block
//! arithmetic, bitfield and completion tracking are all ultimately driven
//! by. Supports both single-file and multi-file torrents and hands out a
//! [`BlockInfo`] directly.

use std::fmt;
use std::path::Path;

use serde::de::{self, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::block_info::BlockInfo;

/// SHA-1 of the bencoded `info` dict; the torrent's unique identifier on
/// the wire and with the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

/// The flattened, 20-bytes-per-entry `pieces` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashes(pub Vec<[u8; 20]>);

struct HashesVisitor;

impl Serialize for Hashes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0.concat())
    }
}

impl<'de> Visitor<'de> for HashesVisitor {
    type Value = Hashes;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a byte string whose length is a multiple of 20")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        if v.len() % 20 != 0 {
            return Err(de::Error::custom(format!(
                "pieces length must be a multiple of 20, got {}",
                v.len()
            )));
        }
        Ok(Hashes(
            v.chunks_exact(20)
                .map(|c| c.try_into().expect("chunks_exact(20) yields 20 bytes"))
                .collect(),
        ))
    }
}

impl<'de> Deserialize<'de> for Hashes {
    fn deserialize<D>(deserializer: D) -> Result<Hashes, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(HashesVisitor)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Torrent {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub pieces: Hashes,
    #[serde(flatten)]
    pub files: Key,
    #[serde(default, rename = "private", skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Key {
    SingleFile {
        length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        md5sum: Option<String>,
    },
    MultiFile {
        files: Vec<File>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        md5sum: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Error, Debug)]
pub enum MetainfoError {
    #[error("failed to read torrent file {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: String,
    },
    #[error("failed to decode bencode: {0}")]
    InvalidBencode(#[from] serde_bencode::Error),
    #[error("failed to re-encode info dict for hashing: {0}")]
    ReencodeFailed(serde_bencode::Error),
}

impl Torrent {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, MetainfoError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| MetainfoError::Io {
            source,
            path: path.display().to_string(),
        })?;
        Ok(serde_bencode::from_bytes(&bytes)?)
    }

    pub fn info_hash(&self) -> Result<InfoHash, MetainfoError> {
        self.info.info_hash()
    }

    pub fn block_info(&self) -> Result<BlockInfo, MetainfoError> {
        Ok(BlockInfo::new(self.info.total_length(), self.info.piece_length))
    }
}

impl Info {
    pub fn info_hash(&self) -> Result<InfoHash, MetainfoError> {
        let bytes = serde_bencode::to_bytes(self).map_err(MetainfoError::ReencodeFailed)?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(InfoHash(hasher.finalize().into()))
    }

    /// Total torrent size: a single file's length, or the concatenation of
    /// all files in the multi-file case, in list order.
    pub fn total_length(&self) -> u64 {
        match &self.files {
            Key::SingleFile { length, .. } => *length,
            Key::MultiFile { files, .. } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.0.len()
    }

    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }
}
