//! Owns all peer sessions for one torrent and wires completion tracking,
//! metadata transfer and peer-wire sessions together into piece selection
//! and ban decisions.
//!
//! The actual socket I/O (accepting connections, `tokio::spawn`ing a task
//! per peer, feeding decoded [`PeerMessage`](crate::peer::message::PeerMessage)s
//! into [`PeerSession::handle_message`](crate::peer::PeerSession::handle_message))
//! is left to the caller, the way `PeerSession` itself stays pure with
//! respect to I/O: this module is the single-threaded core that decides
//! what to do with each event, not the thing that reads bytes off a wire.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use crate::bitfield::Bitfield;
use crate::block_info::{BlockInfo, PieceIndex};
use crate::completion::Completion;
use crate::conf::{MAX_STRIKES, PEX_INTERVAL, PEX_MAX_PEERS_PER_MSG};
use crate::error::{CoreError, ErrorPolicy};
use crate::extension::pex::{FLAG_PREFERS_ENCRYPTION, FLAG_SEED, PexMessage, PexPeer};
use crate::metadata_xfer::MetadataTransfer;
use crate::peer::{PeerEvent, PeerSession};

pub type PeerId = [u8; 20];

/// The self-check some peer-id generators embed: the trailing 12
/// characters (the first 8 being a fixed client prefix), read as
/// case-insensitive base-36 digits, must sum to a multiple of 36.
/// Grounded on `libtransmission/tests/libtransmission/test-peer-id.c`'s
/// peer-id conventions. A character outside `[0-9A-Za-z]` fails the
/// check outright rather than being skipped.
pub fn peer_id_passes_self_check(peer_id: &PeerId) -> bool {
    let tail = &peer_id[8..];
    let mut sum: u32 = 0;
    for &b in tail {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'z' => (b - b'a') as u32 + 10,
            b'A'..=b'Z' => (b - b'A') as u32 + 10,
            _ => return false,
        };
        sum += digit;
    }
    sum % 36 == 0
}

/// Lazy rarity-tracking piece selector. Stale heap entries (pushed under
/// an earlier rarity count) are discarded on pop rather than removed
/// eagerly.
#[derive(Debug)]
pub struct PieceSelector {
    piece_rarity: Vec<u32>,
    priority_queue: BinaryHeap<Reverse<(u32, u32)>>,
    pieces_in_flight: Vec<bool>,
}

impl PieceSelector {
    pub fn new(piece_count: usize) -> Self {
        Self {
            piece_rarity: vec![0; piece_count],
            priority_queue: BinaryHeap::with_capacity(piece_count),
            pieces_in_flight: vec![false; piece_count],
        }
    }

    /// Folds in a peer's full bitfield: every piece they have that we
    /// don't gets its rarity bumped and re-pushed.
    pub fn on_peer_bitfield(&mut self, peer_has: &Bitfield, our_have: &Bitfield) {
        for i in 0..self.piece_rarity.len() {
            if peer_has.test(i) && !our_have.test(i) {
                self.piece_rarity[i] += 1;
                self.priority_queue.push(Reverse((self.piece_rarity[i], i as u32)));
            }
        }
    }

    pub fn on_peer_have(&mut self, piece: u32, our_have: &Bitfield) {
        let i = piece as usize;
        if i >= self.piece_rarity.len() || our_have.test(i) {
            return;
        }
        self.piece_rarity[i] += 1;
        self.priority_queue.push(Reverse((self.piece_rarity[i], piece)));
    }

    /// A peer disconnecting removes their contribution to every piece
    /// they had (rarity can only drop, so no re-push is needed: stale
    /// pops that overcount are cheaper than a full disconnect rescan).
    pub fn on_peer_gone(&mut self, peer_has: &Bitfield, our_have: &Bitfield) {
        for i in 0..self.piece_rarity.len() {
            if peer_has.test(i) && !our_have.test(i) {
                self.piece_rarity[i] = self.piece_rarity[i].saturating_sub(1);
            }
        }
    }

    /// Selects up to `count` rarest pieces this peer has that aren't
    /// already in flight. Pieces returned are marked in-flight; callers
    /// must [`release`](Self::release) them on completion or peer loss.
    pub fn select_for_peer(&mut self, peer_has: &Bitfield, count: usize) -> Vec<u32> {
        let mut selected = Vec::with_capacity(count);
        let mut carried = Vec::new();
        while selected.len() < count {
            let Some(Reverse((rarity, piece))) = self.priority_queue.pop() else {
                break;
            };
            let i = piece as usize;
            if self.piece_rarity[i] != rarity {
                continue; // stale entry, a later push superseded it
            }
            if self.pieces_in_flight[i] {
                continue;
            }
            if peer_has.test(i) {
                self.pieces_in_flight[i] = true;
                selected.push(piece);
            } else {
                carried.push(Reverse((rarity, piece)));
            }
        }
        for entry in carried {
            self.priority_queue.push(entry);
        }
        selected
    }

    /// Releases an in-flight piece (the peer holding it disconnected, or
    /// the request was cancelled) and re-queues it at its current rarity
    /// so it can be picked up by another peer.
    pub fn release(&mut self, piece: u32) {
        let i = piece as usize;
        if let Some(slot) = self.pieces_in_flight.get_mut(i) {
            *slot = false;
            self.priority_queue.push(Reverse((self.piece_rarity[i], piece)));
        }
    }

    /// Clears the in-flight flag for a piece that finished downloading,
    /// without re-queuing it: it's done, not available for reselection.
    pub fn mark_done(&mut self, piece: u32) {
        if let Some(slot) = self.pieces_in_flight.get_mut(piece as usize) {
            *slot = false;
        }
    }
}

/// What the caller should actually do in response to an event the
/// manager processed. Kept deliberately thin: the manager decides, the
/// caller (owning the actual sockets) acts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerAction {
    /// Nothing externally visible needs to happen.
    None,
    /// A piece finished downloading; caller should schedule SHA-1
    /// verification against the backing store.
    VerifyPiece { piece: u32 },
    /// The whole torrent just reached seed state.
    TorrentComplete,
    /// The named peer should be disconnected.
    DropPeer { peer_id: PeerId },
    /// A peer's `ut_pex` message named addresses we weren't already
    /// connected to; caller decides whether/how to dial them.
    NewPeersDiscovered { addrs: Vec<SocketAddr> },
}

/// Ties one torrent's [`Completion`], piece selector, metadata transfer
/// (if still magnet-bootstrapped) and live peer sessions together.
pub struct PeerManager<'a, F: Fn(PieceIndex) -> bool> {
    pub completion: Completion<'a, F>,
    pub selector: PieceSelector,
    pub metadata: Option<MetadataTransfer>,
    pub sessions: HashMap<PeerId, PeerSession>,
    strikes: HashMap<PeerId, u32>,
}

impl<'a, F: Fn(PieceIndex) -> bool> PeerManager<'a, F> {
    pub fn new(completion: Completion<'a, F>, metadata: Option<MetadataTransfer>) -> Self {
        let piece_count = completion.block_info().piece_count() as usize;
        Self {
            completion,
            selector: PieceSelector::new(piece_count),
            metadata,
            sessions: HashMap::new(),
            strikes: HashMap::new(),
        }
    }

    pub fn register_peer(&mut self, peer_id: PeerId, session: PeerSession) {
        self.sessions.insert(peer_id, session);
        self.strikes.entry(peer_id).or_insert(0);
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.remove(peer_id) {
            log::debug!("dropping peer {}", hex::encode(peer_id));
            let our_have = self.completion.create_piece_bitfield();
            self.selector.on_peer_gone(&session.peer_has, &our_have);
        }
        self.strikes.remove(peer_id);
    }

    /// Applies one event from `peer_id`'s session to torrent-level state,
    /// returning what the caller should do about it.
    pub fn handle_event(&mut self, peer_id: &PeerId, event: &PeerEvent) -> ManagerAction {
        let our_have = self.completion.create_piece_bitfield();
        match event {
            PeerEvent::GotBitfield | PeerEvent::GotHaveAll => {
                if let Some(session) = self.sessions.get(peer_id) {
                    self.selector.on_peer_bitfield(&session.peer_has, &our_have);
                }
                ManagerAction::None
            }
            PeerEvent::GotHave { piece } => {
                self.selector.on_peer_have(*piece, &our_have);
                ManagerAction::None
            }
            PeerEvent::GotBlock { piece, offset, .. } => {
                let block = self.completion.block_info().piece_loc(*piece, *offset, 0).block;
                self.completion.add_block(block);
                if self.completion.has_piece(*piece) {
                    self.selector.mark_done(*piece);
                    return ManagerAction::VerifyPiece { piece: *piece };
                }
                ManagerAction::None
            }
            PeerEvent::GotExtended { id, payload } => {
                let Some(session) = self.sessions.get(peer_id) else {
                    return ManagerAction::None;
                };
                if session.peer_ltep_ids.get("ut_pex") != Some(id) {
                    return ManagerAction::None;
                }
                match PexMessage::from_bencode(payload) {
                    Ok(msg) => {
                        let addrs = msg.added.into_iter().map(|p| p.addr).collect();
                        ManagerAction::NewPeersDiscovered { addrs }
                    }
                    Err(e) => {
                        log::warn!("malformed ut_pex message from {}: {e}", hex::encode(peer_id));
                        ManagerAction::None
                    }
                }
            }
            _ => ManagerAction::None,
        }
    }

    /// Builds the `ut_pex` message due to each peer that supports the
    /// extension and is due a tick, per the 90-second cadence. For each
    /// such peer this computes the set-difference between the peers we're
    /// currently connected to and the peers we last reported to it
    /// (`added`/`dropped`), skipping the send entirely if both end up
    /// empty. Each side is capped at `PEX_MAX_PEERS_PER_MSG`; anything
    /// over the cap simply isn't marked reported yet, so it surfaces again
    /// on the next tick rather than being lost.
    pub fn pex_tick(&mut self, now: Duration) -> Vec<(PeerId, PexMessage)> {
        let mut peer_flags: HashMap<SocketAddr, u8> = HashMap::new();
        for session in self.sessions.values() {
            let mut flags = 0u8;
            if session.peer_has.has_all() {
                flags |= FLAG_SEED;
            }
            if session.mse.is_some() {
                flags |= FLAG_PREFERS_ENCRYPTION;
            }
            peer_flags.insert(session.peer_addr, flags);
        }

        let mut outgoing = Vec::new();
        for (peer_id, session) in self.sessions.iter_mut() {
            if !session.supports_ltep || session.peer_ltep_ids.get("ut_pex").is_none() {
                continue;
            }
            if !session.pex_due(now, PEX_INTERVAL) {
                continue;
            }

            let current_peers: HashSet<SocketAddr> = peer_flags
                .keys()
                .filter(|addr| **addr != session.peer_addr)
                .copied()
                .collect();

            let added: Vec<PexPeer> = current_peers
                .difference(&session.pex_last_reported)
                .map(|addr| PexPeer::new(*addr, peer_flags.get(addr).copied().unwrap_or(0)))
                .collect();
            let dropped: Vec<SocketAddr> =
                session.pex_last_reported.difference(&current_peers).copied().collect();

            session.pex_last_tick = Some(now);
            if added.is_empty() && dropped.is_empty() {
                continue;
            }

            if added.len() > PEX_MAX_PEERS_PER_MSG || dropped.len() > PEX_MAX_PEERS_PER_MSG {
                log::debug!(
                    "ut_pex to {}: {} added / {} dropped exceeds the per-tick cap, deferring the rest",
                    hex::encode(peer_id),
                    added.len(),
                    dropped.len(),
                );
            }
            let sent_added: Vec<PexPeer> = added.iter().take(PEX_MAX_PEERS_PER_MSG).copied().collect();
            let sent_dropped: Vec<SocketAddr> = dropped.iter().take(PEX_MAX_PEERS_PER_MSG).copied().collect();

            let mut next_reported = session.pex_last_reported.clone();
            for addr in &sent_dropped {
                next_reported.remove(addr);
            }
            for p in &sent_added {
                next_reported.insert(p.addr);
            }
            session.pex_last_reported = next_reported;

            outgoing.push((*peer_id, PexMessage { added: sent_added, dropped: sent_dropped }));
        }
        outgoing
    }

    /// Confirms or fails a piece's SHA-1 check, applying
    /// [`CoreError::ChecksumMismatch`]'s policy (strike, rescheduled for
    /// re-download) on failure.
    pub fn report_piece_verification(&mut self, peer_id: &PeerId, piece: u32, ok: bool) -> ManagerAction {
        if ok {
            self.completion.add_piece(piece);
            if self.completion.has_total() == self.completion.block_info().total_size() {
                log::info!("torrent complete");
                return ManagerAction::TorrentComplete;
            }
            return ManagerAction::None;
        }
        log::warn!("piece {piece} failed verification, last sent by {}", hex::encode(peer_id));
        self.completion.remove_piece(piece);
        self.strike(peer_id, CoreError::ChecksumMismatch { piece })
    }

    /// Records a strike against a peer per [`CoreError::policy`]; bans
    /// (signals a drop) once [`MAX_STRIKES`] is reached.
    pub fn strike(&mut self, peer_id: &PeerId, err: CoreError) -> ManagerAction {
        match err.policy() {
            ErrorPolicy::DropPeer => ManagerAction::DropPeer { peer_id: *peer_id },
            ErrorPolicy::StrikePeerAndRescheduleP => {
                let count = self.strikes.entry(*peer_id).or_insert(0);
                *count += 1;
                if let Some(session) = self.sessions.get_mut(peer_id) {
                    session.counters.strikes = *count;
                }
                if *count >= MAX_STRIKES {
                    log::warn!("banning peer {} after {count} strikes", hex::encode(peer_id));
                    ManagerAction::DropPeer { peer_id: *peer_id }
                } else {
                    ManagerAction::None
                }
            }
            ErrorPolicy::ResetMetadataPending => ManagerAction::None,
            ErrorPolicy::PauseTorrent => ManagerAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rarer_piece_is_selected_before_a_more_common_one() {
        let mut selector = PieceSelector::new(4);
        let our_have = Bitfield::new(4);
        let mut a_has = Bitfield::new(4);
        a_has.set(0).unwrap();
        a_has.set(1).unwrap();
        let mut b_has = Bitfield::new(4);
        b_has.set(1).unwrap();

        // piece 1 is seen by two peers, piece 0 by only one: piece 0 is
        // rarer and should be picked first for a peer that has both.
        selector.on_peer_bitfield(&a_has, &our_have);
        selector.on_peer_bitfield(&b_has, &our_have);

        let picked = selector.select_for_peer(&a_has, 2);
        assert_eq!(picked[0], 0);
    }

    #[test]
    fn selected_pieces_are_marked_in_flight_until_released() {
        let mut selector = PieceSelector::new(2);
        let our_have = Bitfield::new(2);
        let mut peer_has = Bitfield::new(2);
        peer_has.set(0).unwrap();
        selector.on_peer_bitfield(&peer_has, &our_have);

        let first = selector.select_for_peer(&peer_has, 1);
        assert_eq!(first, vec![0]);
        assert!(selector.select_for_peer(&peer_has, 1).is_empty());

        selector.release(0);
        assert_eq!(selector.select_for_peer(&peer_has, 1), vec![0]);
    }

    #[test]
    fn pex_tick_reports_each_peer_to_the_other_and_then_goes_quiet() {
        use std::net::{IpAddr, Ipv4Addr};

        let block_info = BlockInfo::new(32768, 32768);
        let completion = Completion::new(|_| true, &block_info);
        let mut manager = PeerManager::new(completion, None);

        let addr_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 6881);
        let addr_b = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 6881);
        let id_a = [1u8; 20];
        let id_b = [2u8; 20];

        let mut session_a = PeerSession::new(addr_a, Direction::Inbound, id_a, block_info, 512, true, true, |_| false);
        session_a.peer_ltep_ids.insert("ut_pex".to_string(), 1);
        let mut session_b = PeerSession::new(addr_b, Direction::Inbound, id_b, block_info, 512, true, true, |_| false);
        session_b.peer_ltep_ids.insert("ut_pex".to_string(), 1);

        manager.register_peer(id_a, session_a);
        manager.register_peer(id_b, session_b);

        let first = manager.pex_tick(Duration::from_secs(0));
        assert_eq!(first.len(), 2);
        for (peer_id, msg) in &first {
            assert_eq!(msg.added.len(), 1);
            assert!(msg.dropped.is_empty());
            let other_addr = if *peer_id == id_a { addr_b } else { addr_a };
            assert_eq!(msg.added[0].addr, other_addr);
        }

        // nothing changed, and the interval hasn't elapsed: no more ticks.
        let second = manager.pex_tick(Duration::from_secs(1));
        assert!(second.is_empty());

        // a third peer joins; only the two already-reported sessions get
        // a fresh `added` entry once the interval has elapsed.
        let addr_c = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)), 6881);
        let id_c = [3u8; 20];
        let mut session_c = PeerSession::new(addr_c, Direction::Inbound, id_c, block_info, 512, true, true, |_| false);
        session_c.peer_ltep_ids.insert("ut_pex".to_string(), 1);
        manager.register_peer(id_c, session_c);

        let third = manager.pex_tick(PEX_INTERVAL);
        assert_eq!(third.len(), 3);
        for (peer_id, msg) in &third {
            assert!(msg.dropped.is_empty());
            if *peer_id == id_c {
                // brand new session: everyone else is "added" for it.
                assert_eq!(msg.added.len(), 2);
            } else {
                assert_eq!(msg.added.len(), 1);
                assert_eq!(msg.added[0].addr, addr_c);
            }
        }
    }

    #[test]
    fn got_extended_ut_pex_message_surfaces_new_peer_addresses() {
        use std::net::{IpAddr, Ipv4Addr};

        let block_info = BlockInfo::new(32768, 32768);
        let completion = Completion::new(|_| true, &block_info);
        let mut manager = PeerManager::new(completion, None);

        let peer_id = [9u8; 20];
        let mut session = PeerSession::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), 6881),
            Direction::Inbound,
            peer_id,
            block_info,
            512,
            true,
            true,
            |_| false,
        );
        session.peer_ltep_ids.insert("ut_pex".to_string(), 1);
        manager.register_peer(peer_id, session);

        let discovered_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 51413);
        let msg = PexMessage { added: vec![PexPeer::new(discovered_addr, 0)], dropped: vec![] };
        let payload = msg.to_bencode().unwrap();

        let action = manager.handle_event(&peer_id, &PeerEvent::GotExtended { id: 1, payload });
        assert_eq!(action, ManagerAction::NewPeersDiscovered { addrs: vec![discovered_addr] });
    }

    #[test]
    fn peer_id_self_check_accepts_a_tail_summing_to_a_multiple_of_36() {
        // prefix is irrelevant; tail "000000000000" sums to 0, divisible by 36.
        let mut id = [b'-'; 20];
        id[8..].copy_from_slice(b"000000000000");
        assert!(peer_id_passes_self_check(&id));
    }

    #[test]
    fn peer_id_self_check_rejects_a_tail_not_summing_to_a_multiple_of_36() {
        let mut id = [b'-'; 20];
        id[8..].copy_from_slice(b"100000000000");
        assert!(!peer_id_passes_self_check(&id));
    }

    #[test]
    fn checksum_mismatch_bans_peer_after_max_strikes() {
        let block_info = BlockInfo::new(32768 * 4, 32768);
        let completion = Completion::new(|_| true, &block_info);
        let mut manager = PeerManager::new(completion, None);
        let peer_id = [1u8; 20];

        for _ in 0..MAX_STRIKES - 1 {
            let action = manager.strike(&peer_id, CoreError::ChecksumMismatch { piece: 0 });
            assert_eq!(action, ManagerAction::None);
        }
        let action = manager.strike(&peer_id, CoreError::ChecksumMismatch { piece: 0 });
        assert_eq!(action, ManagerAction::DropPeer { peer_id });
    }
}
