//! Peer-wire protocol state machine. One [`PeerSession`] per live
//! connection; the actual socket I/O and task spawning live in
//! `peer_manager.rs`, which drives a session's pure `handle_message`/tick
//! methods from a `tokio::spawn`ed per-peer loop.

pub mod choke;
pub mod handshake;
pub mod message;
pub mod mse;
pub mod request_queue;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::bitfield::Bitfield;
use crate::block_info::{BlockIndex, BlockInfo, PieceIndex};
use crate::conf::{LTEP_ID_UT_METADATA, LTEP_ID_UT_PEX};
use crate::error::WireError;

use self::choke::{ChokeOutcome, ChokeState};
use self::message::PeerMessage;
use self::mse::MseCiphers;
use self::request_queue::{OutstandingRequest, RequestQueue};

/// A block whose bytes are arriving piecemeal across more than one `Piece`
/// message: a `block_size`-byte buffer plus a byte-granularity coverage
/// mask. Removed from the session once every byte has arrived.
struct InFlightBlock {
    buf: Vec<u8>,
    have: Bitfield,
}

impl InFlightBlock {
    fn new(block_size: u32) -> Self {
        Self {
            buf: vec![0u8; block_size as usize],
            have: Bitfield::new(block_size as usize),
        }
    }

    /// Writes `data` at `offset` within the block and marks those bytes
    /// covered. Overlapping writes are permitted; the mask is idempotent.
    fn write(&mut self, offset: u32, data: &[u8]) {
        let begin = offset as usize;
        let end = begin + data.len();
        self.buf[begin..end].copy_from_slice(data);
        let _ = self.have.set_range(begin, end);
    }

    fn is_complete(&self) -> bool {
        self.have.has_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Events a session publishes to the owning `PeerManager`. `GotUnchoke`,
/// `GotInterested`, `GotNotInterested`, `GotRequest`, `GotCancel` and
/// `GotExtended` exist because a session can't actually react to the wire
/// without them (serving blocks needs `GotRequest`; sending requests at
/// all needs `GotUnchoke`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    GotBlock { piece: u32, offset: u32, len: u32 },
    GotBitfield,
    GotHave { piece: u32 },
    GotHaveAll,
    GotHaveNone,
    GotChoke,
    GotUnchoke,
    GotInterested,
    GotNotInterested,
    GotPieceData { len: u32 },
    GotRejected { piece: u32, offset: u32 },
    GotSuggest { piece: u32 },
    GotAllowedFast { piece: u32 },
    GotPort { port: u16 },
    GotRequest { piece: u32, offset: u32, len: u32 },
    GotCancel { piece: u32, offset: u32, len: u32 },
    GotExtended { id: u8, payload: Vec<u8> },
    SentPieceData { len: u32 },
    Error { kind: WireError },
}

/// Counters tracked per session: blocks sent/received, cancels
/// sent/received, strikes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerCounters {
    pub blocks_sent: u64,
    pub blocks_received: u64,
    pub cancels_sent: u64,
    pub cancels_received: u64,
    pub strikes: u32,
}

/// One live TCP/µTP connection. All state here is touched only from the
/// single-threaded loop that owns it; there is no internal locking.
pub struct PeerSession {
    pub peer_addr: SocketAddr,
    pub direction: Direction,
    pub peer_id: [u8; 20],

    /// "peer-has" bitfield, sized to our piece count.
    pub peer_has: Bitfield,

    /// Block/piece arithmetic for this torrent; used to map a `Piece`
    /// message's `(index, begin)` onto a block index and validate its
    /// bounds.
    pub block_info: BlockInfo,

    pub choke: ChokeState,
    pub outstanding: RequestQueue,
    /// Inbound requests waiting to be served, in arrival order.
    pub inbound_requests: Vec<OutstandingRequest>,
    /// Blocks currently being reassembled from sub-block `Piece` fragments.
    in_flight: HashMap<BlockIndex, InFlightBlock>,

    /// Our LTEP ids, fixed for the client's lifetime.
    pub our_ltep_ids: HashMap<&'static str, u8>,
    /// The peer's advertised LTEP ids (from their `m` dict), learned at
    /// LTEP handshake time.
    pub peer_ltep_ids: HashMap<String, u8>,

    pub supports_fast_extension: bool,
    pub supports_ltep: bool,

    pub mse: Option<MseCiphers>,

    pub counters: PeerCounters,

    /// Peer addresses we last reported to this peer via `ut_pex`, so the
    /// next tick can compute a set-difference instead of re-sending
    /// everyone we know about.
    pub pex_last_reported: std::collections::HashSet<SocketAddr>,
    /// When we last sent this peer a `ut_pex` message, for the
    /// 90-second cadence; `None` before the first tick.
    pub pex_last_tick: Option<Duration>,

    /// Tells `on_piece` whether we already have a piece complete, so a
    /// late-arriving duplicate of it is discarded instead of treated as
    /// unrequested. Injected as a closure, mirroring how `Completion`
    /// takes `piece_is_wanted` rather than owning file-selection state
    /// itself: this session stays ignorant of how completeness is
    /// tracked, only of whether a given piece already is.
    we_have_piece: Box<dyn Fn(PieceIndex) -> bool>,
}

impl PeerSession {
    pub fn new(
        peer_addr: SocketAddr,
        direction: Direction,
        peer_id: [u8; 20],
        block_info: BlockInfo,
        peer_reqq: u32,
        supports_fast_extension: bool,
        supports_ltep: bool,
        we_have_piece: impl Fn(PieceIndex) -> bool + 'static,
    ) -> Self {
        let mut our_ltep_ids = HashMap::new();
        our_ltep_ids.insert("ut_pex", LTEP_ID_UT_PEX);
        our_ltep_ids.insert("ut_metadata", LTEP_ID_UT_METADATA);

        Self {
            peer_addr,
            direction,
            peer_id,
            peer_has: Bitfield::new(block_info.piece_count() as usize),
            block_info,
            choke: ChokeState::new(),
            outstanding: RequestQueue::new(peer_reqq),
            inbound_requests: Vec::new(),
            in_flight: HashMap::new(),
            our_ltep_ids,
            peer_ltep_ids: HashMap::new(),
            supports_fast_extension,
            supports_ltep,
            mse: None,
            counters: PeerCounters::default(),
            pex_last_reported: std::collections::HashSet::new(),
            pex_last_tick: None,
            we_have_piece: Box::new(we_have_piece),
        }
    }

    /// Whether a `ut_pex` gossip tick is due for this peer: the first
    /// tick ever, or `PEX_INTERVAL` since the last one.
    pub fn pex_due(&self, now: Duration, interval: Duration) -> bool {
        match self.pex_last_tick {
            None => true,
            Some(last) => now.saturating_sub(last) >= interval,
        }
    }

    /// Processes one inbound wire message, mutating session state and
    /// returning the events it produces. Pure with respect to I/O: the
    /// caller is responsible for actually writing any reply messages this
    /// implies (e.g. a `Reject` when a choke drops queued requests).
    pub fn handle_message(&mut self, msg: PeerMessage, _now: Duration) -> Vec<PeerEvent> {
        match msg {
            PeerMessage::KeepAlive => vec![],
            PeerMessage::Choke => {
                self.choke.on_peer_choke(true);
                self.outstanding.drain_on_choke();
                vec![PeerEvent::GotChoke]
            }
            PeerMessage::Unchoke => {
                self.choke.on_peer_choke(false);
                vec![PeerEvent::GotUnchoke]
            }
            PeerMessage::Interested => {
                self.choke.on_peer_interested(true);
                vec![PeerEvent::GotInterested]
            }
            PeerMessage::NotInterested => {
                self.choke.on_peer_interested(false);
                vec![PeerEvent::GotNotInterested]
            }
            PeerMessage::Have { piece } => {
                let Some(err) = self.check_piece_range(piece) else {
                    let _ = self.peer_has.set(piece as usize);
                    return vec![PeerEvent::GotHave { piece }];
                };
                vec![err]
            }
            PeerMessage::Bitfield { raw } => {
                let expected = (self.peer_has.len() as u32).div_ceil(8);
                if self.peer_has.set_from_raw(&raw).is_err() {
                    return vec![PeerEvent::Error {
                        kind: WireError::MsgSize {
                            got: raw.len() as u32,
                            expected: Some(expected),
                        },
                    }];
                }
                vec![PeerEvent::GotBitfield]
            }
            PeerMessage::HaveAll => {
                self.peer_has.set_has_all();
                vec![PeerEvent::GotHaveAll]
            }
            PeerMessage::HaveNone => {
                self.peer_has.set_has_none();
                vec![PeerEvent::GotHaveNone]
            }
            PeerMessage::Request { index, begin, length } => {
                if let Some(err) = self.check_piece_range(index) {
                    return vec![err];
                }
                self.inbound_requests.push(OutstandingRequest {
                    piece: index,
                    begin,
                    length,
                });
                vec![PeerEvent::GotRequest {
                    piece: index,
                    offset: begin,
                    len: length,
                }]
            }
            PeerMessage::Cancel { index, begin, length } => {
                if let Some(err) = self.check_piece_range(index) {
                    return vec![err];
                }
                self.inbound_requests
                    .retain(|r| !(r.piece == index && r.begin == begin && r.length == length));
                self.counters.cancels_received += 1;
                vec![PeerEvent::GotCancel {
                    piece: index,
                    offset: begin,
                    len: length,
                }]
            }
            PeerMessage::Piece { index, begin, block } => self.on_piece(index, begin, &block),
            PeerMessage::Port { port } => vec![PeerEvent::GotPort { port }],
            PeerMessage::Suggest { piece } => vec![PeerEvent::GotSuggest { piece }],
            PeerMessage::AllowedFast { piece } => vec![PeerEvent::GotAllowedFast { piece }],
            PeerMessage::Reject { index, begin, length: _ } => {
                self.outstanding.remove(index, begin);
                let loc = self.block_info.piece_loc(index, begin, 0);
                self.in_flight.remove(&loc.block);
                vec![PeerEvent::GotRejected {
                    piece: index,
                    offset: begin,
                }]
            }
            PeerMessage::Extended { id, payload } => vec![PeerEvent::GotExtended { id, payload }],
        }
    }

    /// `ERANGE`: `Have`/`Request`/`Cancel` reference a piece past our
    /// known piece count.
    fn check_piece_range(&self, piece: u32) -> Option<PeerEvent> {
        let piece_count = self.block_info.piece_count();
        if piece >= piece_count {
            Some(PeerEvent::Error {
                kind: WireError::Range { index: piece, piece_count },
            })
        } else {
            None
        }
    }

    /// Applies an inbound `Piece` message: validates the fragment's bounds
    /// against its block, reassembles a block that arrives split across
    /// more than one sub-block fragment, and emits `GotBlock` exactly once
    /// per block regardless of whether it arrived atomically (`begin == 0`
    /// within the block, `len == block_size`) or piecemeal. A fragment that
    /// runs past its block's end is `EMSGSIZE`; a fragment toward a block
    /// we never requested and aren't already reassembling is a protocol
    /// violation — unless the piece it belongs to is one we already have
    /// complete, in which case it's a harmless late duplicate and is
    /// silently discarded instead.
    fn on_piece(&mut self, index: u32, begin: u32, data: &[u8]) -> Vec<PeerEvent> {
        let len = data.len() as u32;
        let loc = self.block_info.piece_loc(index, begin, 0);
        let block = loc.block;
        let block_offset = loc.block_offset;
        let block_size = self.block_info.block_size(block);

        if block_offset.checked_add(len).map_or(true, |end| end > block_size) {
            return vec![PeerEvent::Error {
                kind: WireError::MsgSize {
                    got: len,
                    expected: Some(block_size),
                },
            }];
        }

        let block_start = begin - block_offset;

        if (self.we_have_piece)(index) {
            self.in_flight.remove(&block);
            self.outstanding.remove(index, block_start);
            return Vec::new();
        }

        let already_in_flight = self.in_flight.contains_key(&block);
        if !already_in_flight && !self.outstanding.contains(index, block_start) {
            return vec![PeerEvent::Error {
                kind: WireError::BadMsg(format!("piece {index}/{begin} was not requested")),
            }];
        }

        self.counters.blocks_received += 1;
        let mut events = vec![PeerEvent::GotPieceData { len }];

        let completed_atomically = block_offset == 0 && len == block_size;
        if !completed_atomically {
            let entry = self.in_flight.entry(block).or_insert_with(|| InFlightBlock::new(block_size));
            entry.write(block_offset, data);
            if !entry.is_complete() {
                return events;
            }
            self.in_flight.remove(&block);
        }

        self.outstanding.remove(index, block_start);
        events.push(PeerEvent::GotBlock {
            piece: index,
            offset: block_start,
            len: block_size,
        });
        events
    }

    /// Attempts to change our choke state; see [`ChokeState::set_choke`].
    pub fn set_choke(&mut self, choke: bool, now: Duration) -> ChokeOutcome {
        self.choke.set_choke(choke, now)
    }

    /// A choke we send drops every queued inbound request. Returns the
    /// dropped requests so the caller can answer each with a
    /// `Reject` if Fast-Extension is negotiated, or silently discard them
    /// otherwise.
    pub fn choke_peer(&mut self, now: Duration) -> Vec<OutstandingRequest> {
        if self.set_choke(true, now) == ChokeOutcome::Applied {
            std::mem::take(&mut self.inbound_requests)
        } else {
            Vec::new()
        }
    }
}
