//! Outstanding-request bookkeeping and the pipelining-target formula: the
//! target is derived from the smoothed inbound rate rather than a flat
//! piece-count schedule.

use crate::block_info::{BlockInfo, BlockSpan};
use crate::conf::{BLOCK_SIZE, MAX_REQUEST_TARGET, MIN_REQUEST_TARGET, REQUEST_BUF_SECS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// Splits a block span into per-block `Request`s. Since a block never
/// crosses a piece boundary, this already satisfies "requests must not
/// cross piece boundaries" without any extra grouping logic.
pub fn split_span_into_requests(block_info: &BlockInfo, span: BlockSpan) -> Vec<OutstandingRequest> {
    span.iter()
        .map(|block| {
            let loc = block_info.block_loc(block);
            OutstandingRequest {
                piece: loc.piece,
                begin: loc.piece_offset,
                length: block_info.block_size(block),
            }
        })
        .collect()
}

/// Exponential moving average of the inbound piece-data rate, used to
/// size the pipelining target.
#[derive(Debug, Clone, Copy)]
struct RateEstimator {
    bytes_per_sec: f64,
}

impl RateEstimator {
    const SMOOTHING: f64 = 0.2;

    fn new() -> Self {
        Self { bytes_per_sec: 0.0 }
    }

    fn record(&mut self, bytes: u32, elapsed_secs: f64) {
        if elapsed_secs <= 0.0 {
            return;
        }
        let sample = bytes as f64 / elapsed_secs;
        self.bytes_per_sec = Self::SMOOTHING * sample + (1.0 - Self::SMOOTHING) * self.bytes_per_sec;
    }
}

/// Per-session outstanding-request set plus the rate estimate the target
/// is computed from.
pub struct RequestQueue {
    outstanding: Vec<OutstandingRequest>,
    peer_reqq: u32,
    rate: RateEstimator,
}

impl RequestQueue {
    /// `peer_reqq` is the peer's advertised `reqq` from the LTEP
    /// handshake, defaulting to 512 if never sent.
    pub fn new(peer_reqq: u32) -> Self {
        Self {
            outstanding: Vec::new(),
            peer_reqq,
            rate: RateEstimator::new(),
        }
    }

    pub fn record_inbound_bytes(&mut self, bytes: u32, elapsed_secs: f64) {
        self.rate.record(bytes, elapsed_secs);
    }

    /// `take(current_rate * RequestBufSecs / block_size, floor to ≥32,
    /// cap to lesser of peer's reqq and 250)`.
    pub fn target(&self) -> usize {
        let by_rate = (self.rate.bytes_per_sec * REQUEST_BUF_SECS as f64 / BLOCK_SIZE as f64) as usize;
        let floored = by_rate.max(MIN_REQUEST_TARGET);
        floored.min(self.peer_reqq as usize).min(MAX_REQUEST_TARGET)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn wants_more(&self) -> bool {
        self.outstanding.len() < self.target()
    }

    pub fn room_for_more(&self) -> usize {
        self.target().saturating_sub(self.outstanding.len())
    }

    pub fn add(&mut self, req: OutstandingRequest) {
        self.outstanding.push(req);
    }

    /// Whether a request for `(piece, begin)` is currently outstanding.
    pub fn contains(&self, piece: u32, begin: u32) -> bool {
        self.outstanding.iter().any(|r| r.piece == piece && r.begin == begin)
    }

    /// Removes a matching outstanding request (on `Piece` arrival or our
    /// own `Cancel`). Returns whether one was found.
    pub fn remove(&mut self, piece: u32, begin: u32) -> bool {
        if let Some(pos) = self
            .outstanding
            .iter()
            .position(|r| r.piece == piece && r.begin == begin)
        {
            self.outstanding.remove(pos);
            true
        } else {
            false
        }
    }

    /// A choke from the peer means every outstanding request toward them
    /// is lost; drain and hand back to the manager for rescheduling.
    pub fn drain_on_choke(&mut self) -> Vec<OutstandingRequest> {
        std::mem::take(&mut self.outstanding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_floors_at_minimum_when_rate_is_zero() {
        let q = RequestQueue::new(512);
        assert_eq!(q.target(), MIN_REQUEST_TARGET);
    }

    #[test]
    fn target_caps_at_peer_reqq() {
        let mut q = RequestQueue::new(40);
        q.record_inbound_bytes(100 * BLOCK_SIZE, 1.0);
        // several samples to let the EMA approach the instantaneous rate
        for _ in 0..50 {
            q.record_inbound_bytes(100 * BLOCK_SIZE, 1.0);
        }
        assert_eq!(q.target(), 40);
    }

    #[test]
    fn target_never_exceeds_hard_cap() {
        let mut q = RequestQueue::new(1000);
        for _ in 0..50 {
            q.record_inbound_bytes(1000 * BLOCK_SIZE, 1.0);
        }
        assert_eq!(q.target(), MAX_REQUEST_TARGET);
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut q = RequestQueue::new(512);
        q.add(OutstandingRequest {
            piece: 1,
            begin: 0,
            length: BLOCK_SIZE,
        });
        assert_eq!(q.outstanding_count(), 1);
        assert!(q.remove(1, 0));
        assert_eq!(q.outstanding_count(), 0);
        assert!(!q.remove(1, 0));
    }

    #[test]
    fn choke_drains_all_outstanding_requests() {
        let mut q = RequestQueue::new(512);
        q.add(OutstandingRequest { piece: 0, begin: 0, length: BLOCK_SIZE });
        q.add(OutstandingRequest { piece: 0, begin: BLOCK_SIZE, length: BLOCK_SIZE });
        let drained = q.drain_on_choke();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.outstanding_count(), 0);
    }

    #[test]
    fn split_span_never_crosses_a_piece_boundary() {
        let bi = BlockInfo::new(70000, 32768);
        let span = bi.block_span_for_piece(0);
        let reqs = split_span_into_requests(&bi, span);
        for r in &reqs {
            assert_eq!(r.piece, 0);
        }
        assert_eq!(reqs.len(), span.len() as usize);
    }
}
