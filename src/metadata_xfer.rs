//! BEP-9 metadata exchange. Fetches the info-dictionary from peers for
//! magnet-bootstrapped torrents: a round-robin pending list, a SHA-1
//! verify-and-reset loop driven by an explicit
//! `Unneeded | Sizing | Fetching | Verifying` state machine, plus a
//! bounded reply queue for the serving side (reject on overflow,
//! private-torrent suppression), grounded on
//! `libtransmission/torrent-magnet.c`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use sha1::{Digest, Sha1};

use crate::conf::{METADATA_PIECE_SIZE, METADATA_REQ_QUEUE_MAX, METADATA_SIZE_HARD_CAP, MIN_METADATA_REREQUEST_INTERVAL};
use crate::error::CoreError;
use crate::metainfo::InfoHash;

#[derive(Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

/// The bencoded `ut_metadata` dictionary, BEP-9.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataMessage {
    pub msg_type: MetadataMsgType,
    #[serde(rename = "piece")]
    pub piece_index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u32>,
}

fn piece_count(total_size: usize) -> usize {
    total_size.div_ceil(METADATA_PIECE_SIZE)
}

fn piece_len(total_size: usize, piece: usize) -> usize {
    let start = piece * METADATA_PIECE_SIZE;
    (total_size - start).min(METADATA_PIECE_SIZE)
}

/// One pending-piece slot in the round-robin fetch list.
#[derive(Debug, Clone, Copy)]
struct Pending {
    piece: u32,
    last_requested_at: Option<Duration>,
}

/// Per-torrent metadata-fetch state machine.
#[derive(Debug)]
pub enum MetadataState {
    Unneeded,
    Sizing,
    Fetching { pending: Vec<Pending> },
    Verifying,
}

/// Owns the fetch state machine and the assembled metadata buffer for one
/// torrent. Not `Send`/thread-shared: lives inside the single torrent
/// actor that owns it.
pub struct MetadataTransfer {
    info_hash: InfoHash,
    state: MetadataState,
    buffer: Vec<u8>,
    total_size: usize,
}

impl MetadataTransfer {
    /// Info-dict already known (regular .torrent file): nothing to do.
    pub fn unneeded(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            state: MetadataState::Unneeded,
            buffer: Vec::new(),
            total_size: 0,
        }
    }

    /// Magnet-bootstrapped: no size hint yet.
    pub fn sizing(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            state: MetadataState::Sizing,
            buffer: Vec::new(),
            total_size: 0,
        }
    }

    pub fn is_unneeded(&self) -> bool {
        matches!(self.state, MetadataState::Unneeded)
    }

    /// First accepted LTEP handshake with a `metadata_size` sets it,
    /// bounded by [`METADATA_SIZE_HARD_CAP`] to prevent a malicious peer
    /// from claiming an unbounded size. Transitions `Sizing -> Fetching`.
    /// A no-op once already sized.
    pub fn set_size(&mut self, total_size: usize) -> Result<(), CoreError> {
        if !matches!(self.state, MetadataState::Sizing) {
            return Ok(());
        }
        if total_size > METADATA_SIZE_HARD_CAP {
            return Err(CoreError::ProtocolViolation(format!(
                "peer claimed metadata_size {total_size}, exceeding the {METADATA_SIZE_HARD_CAP}-byte cap"
            )));
        }
        self.total_size = total_size;
        self.buffer = vec![0u8; total_size];
        let pending = (0..piece_count(total_size) as u32)
            .map(|piece| Pending { piece, last_requested_at: None })
            .collect();
        self.state = MetadataState::Fetching { pending };
        Ok(())
    }

    /// Picks the next piece to request from the head of the round-robin
    /// list, if one is due (`now - last_requested_at >=
    /// MinReRequestInterval`, or never requested). Moves it to the tail
    /// and stamps `last_requested_at`. Returns `None` if nothing is due
    /// right now, or we aren't in `Fetching`.
    pub fn next_request(&mut self, now: Duration) -> Option<MetadataMessage> {
        let MetadataState::Fetching { pending } = &mut self.state else {
            return None;
        };
        let pos = pending.iter().position(|p| match p.last_requested_at {
            None => true,
            Some(last) => now.saturating_sub(last) >= MIN_METADATA_REREQUEST_INTERVAL,
        })?;
        let mut piece = pending.remove(pos);
        piece.last_requested_at = Some(now);
        let index = piece.piece;
        pending.push(piece);
        Some(MetadataMessage {
            msg_type: MetadataMsgType::Request,
            piece_index: index,
            total_size: None,
        })
    }

    /// Installs a received metadata piece. Once every piece has arrived,
    /// verifies the assembled buffer against the info-hash: on match,
    /// hands the bytes up and transitions to `Unneeded`; on mismatch,
    /// discards the buffer and rebuilds the pending list from scratch,
    /// returning to `Fetching`.
    pub fn receive_piece(&mut self, piece: u32, data: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        let MetadataState::Fetching { pending } = &mut self.state else {
            return Ok(None);
        };
        let expected_len = piece_len(self.total_size, piece as usize);
        if data.len() != expected_len {
            return Err(CoreError::ProtocolViolation(format!(
                "metadata piece {piece} was {} bytes, expected {expected_len}",
                data.len()
            )));
        }
        let begin = piece as usize * METADATA_PIECE_SIZE;
        self.buffer[begin..begin + data.len()].copy_from_slice(data);
        pending.retain(|p| p.piece != piece);

        if !pending.is_empty() {
            return Ok(None);
        }

        self.state = MetadataState::Verifying;
        let mut hasher = Sha1::new();
        hasher.update(&self.buffer);
        let digest: [u8; 20] = hasher.finalize().into();

        if digest == self.info_hash.0 {
            self.state = MetadataState::Unneeded;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            let pending = (0..piece_count(self.total_size) as u32)
                .map(|piece| Pending { piece, last_requested_at: None })
                .collect();
            self.buffer = vec![0u8; self.total_size];
            self.state = MetadataState::Fetching { pending };
            Err(CoreError::MetadataChecksumMismatch)
        }
    }
}

/// Serving side: a bounded reply queue of pieces we owe peers, used when
/// we hold the full info-dict and a peer is requesting pieces of it from
/// us. Overflow past [`METADATA_REQ_QUEUE_MAX`] gets a `Reject` instead
/// of being queued.
#[derive(Debug, Default)]
pub struct MetadataServeQueue {
    pending: Vec<u32>,
}

impl MetadataServeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// `is_private` torrents never serve metadata to anyone.
    pub fn enqueue(&mut self, piece: u32, is_private: bool) -> MetadataMsgType {
        if is_private || self.pending.len() >= METADATA_REQ_QUEUE_MAX {
            return MetadataMsgType::Reject;
        }
        self.pending.push(piece);
        MetadataMsgType::Data
    }

    pub fn pop(&mut self) -> Option<u32> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
