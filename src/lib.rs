//! A from-scratch BitTorrent client core: protocol plumbing (handshake,
//! wire messages, MSE, LTEP/BEP-9/BEP-11) plus the pure state machines that
//! sit above it (block arithmetic, bitfields, completion tracking,
//! metadata transfer, piece selection). Socket I/O, a tracker/DHT-driven
//! peer supply and on-disk piece storage are left to a caller; see
//! `src/bin/show_torrent.rs` for the smallest possible one.
//!
//! Module layout follows `peer/`, `peer_manager.rs`, `tracker.rs` with the
//! protocol-state pieces (`bitfield`, `block_info`, `completion`,
//! `metadata_xfer`) kept at crate root since they're shared by both `peer`
//! and `peer_manager` rather than owned by either.

pub mod bitfield;
pub mod block_info;
pub mod completion;
pub mod conf;
pub mod error;
pub mod extension;
pub mod magnet;
pub mod metadata_xfer;
pub mod metainfo;
pub mod peer;
pub mod peer_manager;
pub mod resume;
pub mod tracker;

pub use bitfield::{Bitfield, BitfieldError};
pub use block_info::{BlockIndex, BlockInfo, BlockSpan, ByteSpan, Location, PieceIndex};
pub use completion::{BlockCountMismatch, Completion, TorrentCompleteness};
pub use error::{CoreError, ErrorPolicy, WireError};
pub use magnet::{MagnetLink, MagnetLinkError};
pub use metadata_xfer::{MetadataMessage, MetadataMsgType, MetadataServeQueue, MetadataState, MetadataTransfer};
pub use metainfo::{File, Info, InfoHash, Key, MetainfoError, Torrent};
pub use peer::{Direction, PeerCounters, PeerEvent, PeerSession};
pub use peer_manager::{ManagerAction, PeerId, PeerManager, PieceSelector, peer_id_passes_self_check};
pub use resume::{HaveProgress, ResumeError, ResumeFile};
pub use tracker::{TrackerRequest, TrackerRequestError, TrackerResponse};
