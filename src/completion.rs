//! The authoritative record of which blocks/pieces we have, plus the
//! handful of derived statistics the rest of the client needs.
//!
//! Grounded on `libtransmission/completion.{h,cc}`.

use crate::bitfield::Bitfield;
use crate::block_info::{BlockIndex, BlockInfo, PieceIndex};

/// `tr_completeness`: the coarse state a torrent is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentCompleteness {
    /// Still missing wanted data, or metainfo not yet known.
    Leech,
    /// Have everything we want, but not everything that exists (some
    /// files are marked don't-want and we don't have them).
    PartialSeed,
    /// Have every byte of every piece.
    Seed,
}

/// Something the caller asked the bitfield to be mutated with, with a
/// length that didn't match [`BlockInfo::block_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bitfield length mismatch: completion has {expected} blocks, got {got}")]
pub struct BlockCountMismatch {
    pub got: usize,
    pub expected: usize,
}

/// Owns the block bitfield and two lazily-computed scalar caches. Holds a
/// non-owning reference to the torrent's [`BlockInfo`]; `piece_is_wanted`
/// is injected as a closure so this module stays ignorant of file
/// selection/priority, which lives above this layer entirely.
pub struct Completion<'a, F: Fn(PieceIndex) -> bool> {
    piece_is_wanted: F,
    block_info: &'a BlockInfo,
    blocks: Bitfield,
    size_now: u64,
    size_when_done: Option<u64>,
    has_valid: Option<u64>,
}

impl<'a, F: Fn(PieceIndex) -> bool> Completion<'a, F> {
    /// A fresh, empty completion: `has-none` over `block_info`'s block
    /// count. Magnet torrents construct this with `block_info.block_count()
    /// == 0` until metainfo arrives, then replace it wholesale.
    pub fn new(piece_is_wanted: F, block_info: &'a BlockInfo) -> Self {
        let blocks = Bitfield::new(block_info.block_count() as usize);
        Self {
            piece_is_wanted,
            block_info,
            blocks,
            size_now: 0,
            size_when_done: None,
            has_valid: None,
        }
    }

    pub fn blocks(&self) -> &Bitfield {
        &self.blocks
    }

    pub fn block_info(&self) -> &'a BlockInfo {
        self.block_info
    }

    /// Whether metainfo (and thus a block count) is known yet.
    pub fn has_metainfo(&self) -> bool {
        !self.blocks.is_empty()
    }

    pub fn has_all(&self) -> bool {
        self.has_metainfo() && self.blocks.has_all()
    }

    pub fn has_none(&self) -> bool {
        !self.has_metainfo() || self.blocks.has_none()
    }

    pub fn has_block(&self, block: BlockIndex) -> bool {
        self.blocks.test(block as usize)
    }

    pub fn has_blocks(&self, begin: BlockIndex, end: BlockIndex) -> bool {
        self.blocks
            .count_range(begin as usize, end as usize)
            .map(|n| n as u32 == end - begin)
            .unwrap_or(false)
    }

    fn count_missing_blocks_in_piece(&self, piece: PieceIndex) -> u32 {
        let span = self.block_info.block_span_for_piece(piece);
        let have = self
            .blocks
            .count_range(span.begin as usize, span.end as usize)
            .unwrap_or(0) as u32;
        span.len() - have
    }

    pub fn has_piece(&self, piece: PieceIndex) -> bool {
        self.block_info.piece_size(piece) != 0 && self.count_missing_blocks_in_piece(piece) == 0
    }

    /// Bytes we have now, verified or not (`size_now` in the original).
    pub fn has_total(&self) -> u64 {
        self.size_now
    }

    /// Bytes belonging to fully-complete pieces only; never counts a
    /// partial piece, even if all but one of its blocks has arrived.
    pub fn has_valid(&mut self) -> u64 {
        if let Some(v) = self.has_valid {
            return v;
        }
        let val = self.compute_has_valid();
        self.has_valid = Some(val);
        val
    }

    fn compute_has_valid(&self) -> u64 {
        let mut size = 0u64;
        for piece in 0..self.block_info.piece_count() {
            if self.has_piece(piece) {
                size += self.block_info.piece_size(piece) as u64;
            }
        }
        size
    }

    /// Bytes we'll have when every *wanted* file is complete; bytes of
    /// unwanted files we happen to already have still count.
    pub fn size_when_done(&mut self) -> u64 {
        if let Some(v) = self.size_when_done {
            return v;
        }
        let val = self.compute_size_when_done();
        self.size_when_done = Some(val);
        val
    }

    fn compute_size_when_done(&self) -> u64 {
        if self.has_all() {
            return self.block_info.total_size();
        }
        let mut size = 0u64;
        for piece in 0..self.block_info.piece_count() {
            if (self.piece_is_wanted)(piece) {
                size += self.block_info.piece_size(piece) as u64;
            } else {
                size += self.count_has_bytes_in_piece(piece);
            }
        }
        size
    }

    pub fn left_until_done(&mut self) -> u64 {
        self.size_when_done() - self.has_total()
    }

    pub fn percent_complete(&self) -> f64 {
        let denom = self.block_info.total_size();
        if denom == 0 {
            0.0
        } else {
            (self.size_now as f64 / denom as f64).clamp(0.0, 1.0)
        }
    }

    pub fn percent_done(&mut self) -> f64 {
        let denom = self.size_when_done();
        if denom == 0 {
            0.0
        } else {
            (self.size_now as f64 / denom as f64).clamp(0.0, 1.0)
        }
    }

    pub fn status(&mut self) -> TorrentCompleteness {
        if !self.has_metainfo() {
            return TorrentCompleteness::Leech;
        }
        if self.has_all() {
            return TorrentCompleteness::Seed;
        }
        if self.size_now == self.size_when_done() {
            return TorrentCompleteness::PartialSeed;
        }
        TorrentCompleteness::Leech
    }

    /// A piece-indexed bitfield derived from the block-indexed one, for
    /// publishing our `have` state to peers.
    pub fn create_piece_bitfield(&self) -> Bitfield {
        let n = self.block_info.piece_count();
        let mut pieces = Bitfield::new(n as usize);
        for piece in 0..n {
            if self.has_piece(piece) {
                pieces.set(piece as usize).expect("piece index in range");
            }
        }
        pieces
    }

    /// Fills `tab` with the fraction of blocks present in each of
    /// `tab.len()` evenly-divided chunks of the block range, for UI
    /// progress bars with finer granularity than whole pieces.
    pub fn amount_done(&self, tab: &mut [f32]) {
        if tab.is_empty() {
            return;
        }
        let total_blocks = self.blocks.len();
        let blocks_per_tab = total_blocks / tab.len();
        if blocks_per_tab == 0 {
            return;
        }
        for (i, slot) in tab.iter_mut().enumerate() {
            let begin = i * blocks_per_tab;
            let end = (begin + blocks_per_tab).min(total_blocks);
            let numerator = self.blocks.count_range(begin, end).unwrap_or(0);
            *slot = numerator as f32 / (end - begin) as f32;
        }
    }

    fn count_has_bytes_in_piece(&self, piece: PieceIndex) -> u64 {
        let span = self.block_info.byte_span_for_piece(piece);
        self.count_has_bytes_in_span(span.begin, span.end)
    }

    /// Bytes we have within the half-open byte span `[begin, end)`,
    /// crediting a boundary block only for the bytes of the span it
    /// actually overlaps.
    pub fn count_has_bytes_in_span(&self, begin: u64, end: u64) -> u64 {
        let total = self.block_info.total_size();
        let begin = begin.min(total);
        let end = end.min(total);
        if begin >= end {
            return 0;
        }

        let begin_block = self.block_info.byte_loc(begin).block;
        let final_block = self.block_info.byte_loc(end - 1).block;

        if begin_block == final_block {
            return if self.has_block(begin_block) { end - begin } else { 0 };
        }

        let mut total_have = 0u64;

        if self.has_block(begin_block) {
            let block_end = (begin_block as u64 + 1) * crate::conf::BLOCK_SIZE as u64;
            total_have += block_end - begin;
        }

        if begin_block + 1 < final_block {
            let middle = self
                .blocks
                .count_range((begin_block + 1) as usize, final_block as usize)
                .unwrap_or(0) as u64;
            total_have += middle * crate::conf::BLOCK_SIZE as u64;
        }

        if self.has_block(final_block) {
            let block_begin = final_block as u64 * crate::conf::BLOCK_SIZE as u64;
            total_have += end - block_begin;
        }

        total_have
    }

    // --- mutators ---

    /// Idempotent: adding a block we already have is a no-op.
    pub fn add_block(&mut self, block: BlockIndex) {
        if self.has_block(block) {
            return;
        }
        self.blocks.set(block as usize).expect("block index in range");
        self.size_now += self.block_info.block_size(block) as u64;
        self.size_when_done = None;
        self.has_valid = None;
    }

    fn remove_block(&mut self, block: BlockIndex) {
        if !self.has_block(block) {
            return;
        }
        self.blocks.clear(block as usize).expect("block index in range");
        self.size_now -= self.block_info.block_size(block) as u64;
        self.size_when_done = None;
        self.has_valid = None;
    }

    pub fn add_piece(&mut self, piece: PieceIndex) {
        let span = self.block_info.block_span_for_piece(piece);
        for block in span.iter() {
            self.add_block(block);
        }
    }

    /// Fails silently on a piece we don't have any blocks of, matching
    /// `remove_block`'s own no-op-if-absent behaviour.
    pub fn remove_piece(&mut self, piece: PieceIndex) {
        let span = self.block_info.block_span_for_piece(piece);
        for block in span.iter() {
            self.remove_block(block);
        }
    }

    pub fn set_has_piece(&mut self, piece: PieceIndex, has: bool) {
        if has {
            self.add_piece(piece);
        } else {
            self.remove_piece(piece);
        }
    }

    pub fn set_has_all(&mut self) {
        let total_size = self.block_info.total_size();
        self.blocks.set_has_all();
        self.size_now = total_size;
        self.size_when_done = Some(total_size);
        self.has_valid = Some(total_size);
    }

    /// Replaces the block bitfield wholesale (e.g. on resume-file load).
    pub fn set_blocks(&mut self, blocks: Bitfield) -> Result<(), BlockCountMismatch> {
        if blocks.len() != self.blocks.len() {
            return Err(BlockCountMismatch {
                got: blocks.len(),
                expected: self.blocks.len(),
            });
        }
        self.blocks = blocks;
        self.size_now = self.count_has_bytes_in_span(0, self.block_info.total_size());
        self.size_when_done = None;
        self.has_valid = None;
        Ok(())
    }

    pub fn invalidate_size_when_done(&mut self) {
        self.size_when_done = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_wanted(_: PieceIndex) -> bool {
        true
    }

    #[test]
    fn fresh_completion_is_leech_with_nothing() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        assert_eq!(c.has_total(), 0);
        assert_eq!(c.status(), TorrentCompleteness::Leech);
        assert!(c.has_none());
    }

    #[test]
    fn add_block_is_idempotent_and_updates_total() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.add_block(0);
        let after_first = c.has_total();
        c.add_block(0);
        assert_eq!(c.has_total(), after_first);
        assert_eq!(after_first, bi.block_size(0) as u64);
    }

    #[test]
    fn add_piece_makes_has_piece_true_and_counts_bytes() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.add_piece(0);
        assert!(c.has_piece(0));
        assert_eq!(c.has_valid(), 32768);
    }

    #[test]
    fn partial_piece_does_not_count_toward_has_valid() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        let span = bi.block_span_for_piece(0);
        // add all but the last block of piece 0
        for b in span.begin..span.end - 1 {
            c.add_block(b);
        }
        assert!(!c.has_piece(0));
        assert_eq!(c.has_valid(), 0);
        assert!(c.has_total() > 0);
    }

    #[test]
    fn set_has_all_makes_seed() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.set_has_all();
        assert_eq!(c.status(), TorrentCompleteness::Seed);
        assert_eq!(c.has_total(), bi.total_size());
        assert_eq!(c.percent_complete(), 1.0);
    }

    #[test]
    fn partial_seed_when_all_wanted_pieces_present_but_not_all_bytes() {
        let bi = BlockInfo::new(70000, 32768);
        // pretend piece 2 (the short final piece) is unwanted
        let mut c = Completion::new(|p| p != 2, &bi);
        c.add_piece(0);
        c.add_piece(1);
        assert_eq!(c.status(), TorrentCompleteness::PartialSeed);
        assert_eq!(c.left_until_done(), 0);
    }

    #[test]
    fn remove_piece_on_absent_piece_is_silent_noop() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.remove_piece(1);
        assert_eq!(c.has_total(), 0);
    }

    #[test]
    fn invariants_hold_across_mutations() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.add_block(0);
        c.add_piece(1);
        assert!(c.has_valid() <= c.has_total());
        assert!(c.has_total() <= c.size_when_done());
        assert!(c.size_when_done() <= bi.total_size());
    }

    #[test]
    fn piece_reception_over_two_fragments_reports_has_block_once() {
        // two writes that both land in the same block must still only flip
        // has_block once.
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        assert!(!c.has_block(0));
        c.add_block(0);
        assert!(c.has_block(0));
        c.add_block(0);
        assert!(c.has_block(0));
    }

    #[test]
    fn create_piece_bitfield_matches_has_piece() {
        let bi = BlockInfo::new(70000, 32768);
        let mut c = Completion::new(all_wanted, &bi);
        c.add_piece(0);
        let pb = c.create_piece_bitfield();
        assert!(pb.test(0));
        assert!(!pb.test(1));
    }
}
