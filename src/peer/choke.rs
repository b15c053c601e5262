//! Choke/interest bookkeeping and the `set_choke` debounce. `now` is
//! threaded in as a `Duration` since session start rather than read from
//! the system clock, so the debounce window is exercised deterministically
//! in tests without a real 10-second sleep.

use std::time::Duration;

use crate::conf::MIN_CHOKE_PERIOD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeOutcome {
    /// The requested state differed from the current one and the debounce
    /// window had elapsed: the change took effect and must be sent.
    Applied,
    /// Debounced: the last change was too recent, or the requested state
    /// already matched the current one.
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ChokeState {
    am_choking: bool,
    peer_choking: bool,
    am_interested: bool,
    peer_interested: bool,
    last_choke_change: Option<Duration>,
}

impl Default for ChokeState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChokeState {
    /// Both sides start choked and not-interested, per BEP-3.
    pub fn new() -> Self {
        Self {
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            last_choke_change: None,
        }
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Attempts to change our choke state toward this peer. Refused if
    /// fewer than `MIN_CHOKE_PERIOD` have elapsed since the last accepted
    /// change.
    pub fn set_choke(&mut self, choke: bool, now: Duration) -> ChokeOutcome {
        if choke == self.am_choking {
            return ChokeOutcome::Unchanged;
        }
        if let Some(last) = self.last_choke_change {
            if now.saturating_sub(last) < MIN_CHOKE_PERIOD {
                return ChokeOutcome::Unchanged;
            }
        }
        self.am_choking = choke;
        self.last_choke_change = Some(now);
        ChokeOutcome::Applied
    }

    /// Interest has no debounce; applied immediately.
    pub fn set_interested(&mut self, interested: bool) -> ChokeOutcome {
        if interested == self.am_interested {
            return ChokeOutcome::Unchanged;
        }
        self.am_interested = interested;
        ChokeOutcome::Applied
    }

    pub fn on_peer_choke(&mut self, choke: bool) {
        self.peer_choking = choke;
    }

    pub fn on_peer_interested(&mut self, interested: bool) {
        self.peer_interested = interested;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choke_race_scenario() {
        // starts choked per `ChokeState::new`; unchoke first so the debounce
        // race below exercises an actual state change, not a same-state noop.
        let mut state = ChokeState::new();
        assert_eq!(state.set_choke(false, Duration::from_secs(0)), ChokeOutcome::Applied);
        assert!(!state.am_choking());

        assert_eq!(state.set_choke(true, Duration::from_secs(5)), ChokeOutcome::Unchanged);
        assert!(!state.am_choking(), "debounce window hasn't elapsed yet");

        assert_eq!(
            state.set_choke(true, Duration::from_millis(10_010)),
            ChokeOutcome::Applied
        );
        assert!(state.am_choking());
    }

    #[test]
    fn setting_same_state_is_a_noop_regardless_of_timing() {
        let mut state = ChokeState::new();
        assert_eq!(state.set_choke(true, Duration::from_secs(100)), ChokeOutcome::Unchanged);
    }

    #[test]
    fn interest_has_no_debounce() {
        let mut state = ChokeState::new();
        assert_eq!(state.set_interested(true), ChokeOutcome::Applied);
        assert_eq!(state.set_interested(true), ChokeOutcome::Unchanged);
        assert_eq!(state.set_interested(false), ChokeOutcome::Applied);
    }
}
