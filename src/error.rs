//! Error taxonomy shared by the wire layer and the torrent-level policy
//! table.

use thiserror::Error;

/// Errors produced while parsing or validating a single peer-wire message.
/// Every variant here causes the owning [`PeerSession`](crate::peer::PeerSession)
/// to be dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message length prefix {got} does not match the expected length for this message type ({expected:?})")]
    MsgSize { got: u32, expected: Option<u32> },
    #[error("piece index {index} is out of range for a torrent with {piece_count} pieces")]
    Range { index: u32, piece_count: u32 },
    #[error("malformed LTEP dictionary or out-of-flight piece: {0}")]
    BadMsg(String),
    #[error("transport error: {0}")]
    NotConn(String),
    #[error("I/O error on the peer connection: {0}")]
    Io(String),
}

/// `tokio_util::codec::Framed` requires the codec's `Error` type to
/// absorb a raw transport I/O error; kept as a rendered string rather
/// than the source `std::io::Error` so `WireError` stays `Clone`/`Eq`
/// for event comparisons in tests.
impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e.to_string())
    }
}

/// Torrent-level error kinds and the policy that applies to each.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("failed to parse wire data: {0}")]
    ParseFailure(String),
    #[error("info-hash mismatch during handshake")]
    InfoHashMismatch,
    #[error("peer-id mismatch on an outbound connection")]
    PeerIdMismatch,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("piece {piece} failed SHA-1 verification")]
    ChecksumMismatch { piece: u32 },
    #[error("assembled info-dict failed SHA-1 verification against the info-hash")]
    MetadataChecksumMismatch,
    #[error("local I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// What a [`CoreError`] means should happen to the peer session / torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    DropPeer,
    StrikePeerAndRescheduleP,
    ResetMetadataPending,
    PauseTorrent,
}

impl CoreError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            CoreError::ParseFailure(_)
            | CoreError::InfoHashMismatch
            | CoreError::PeerIdMismatch
            | CoreError::ProtocolViolation(_)
            | CoreError::Timeout(_) => ErrorPolicy::DropPeer,
            CoreError::ChecksumMismatch { .. } => ErrorPolicy::StrikePeerAndRescheduleP,
            CoreError::MetadataChecksumMismatch => ErrorPolicy::ResetMetadataPending,
            CoreError::IoError(_) => ErrorPolicy::PauseTorrent,
        }
    }
}
