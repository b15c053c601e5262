//! Tunable protocol and timing constants, gathered in one place.

use std::time::Duration;

/// Size of a peer-wire request/response block. Fixed by the protocol.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Size of a BEP-9 metadata piece. Also fixed by the protocol.
pub const METADATA_PIECE_SIZE: usize = 1 << 14;

/// Hard cap on a magnet-bootstrapped metadata size, to bound the DoS
/// a malicious peer could otherwise inflict via a bogus `metadata_size`.
pub const METADATA_SIZE_HARD_CAP: usize = 8 * 1024 * 1024;

/// Minimum time between re-requesting the same metadata piece from peers.
pub const MIN_METADATA_REREQUEST_INTERVAL: Duration = Duration::from_secs(3);

/// Max pending-to-serve metadata requests per peer before we start rejecting.
pub const METADATA_REQ_QUEUE_MAX: usize = 64;

/// Minimum time between choke-state changes toward the same peer.
pub const MIN_CHOKE_PERIOD: Duration = Duration::from_secs(10);

/// Emit a keep-alive if nothing has been sent to a peer for this long.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(100);

/// Target outstanding-request buffer, expressed in seconds of the current
/// smoothed inbound piece-data rate.
pub const REQUEST_BUF_SECS: u32 = 10;

/// Floor on the computed outstanding-request target.
pub const MIN_REQUEST_TARGET: usize = 32;

/// Hard cap on the outstanding-request target, independent of the peer's
/// advertised `reqq`.
pub const MAX_REQUEST_TARGET: usize = 250;

/// Our own advertised `reqq` in the LTEP handshake.
pub const OUR_REQQ: u32 = 512;

/// Peer-exchange gossip cadence (BEP-11).
pub const PEX_INTERVAL: Duration = Duration::from_secs(90);

/// Max peers advertised per PEX message, per direction (added/dropped).
pub const PEX_MAX_PEERS_PER_MSG: usize = 50;

/// Strikes against a peer before it is banned for a torrent.
pub const MAX_STRIKES: u32 = 3;

/// Cap on the number of tracker/webseed URLs a magnet link may carry.
pub const MAGNET_URL_CAP: usize = 64;

/// Our numeric LTEP extension ids, fixed for the lifetime of the client.
pub const LTEP_ID_UT_PEX: u8 = 1;
pub const LTEP_ID_UT_METADATA: u8 = 3;
