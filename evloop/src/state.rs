//! The loop's atomic state machine.
//!
//! One word, mutated only through CAS (or an unconditional store into the
//! absorbing `Terminated` state). Every other component reads this state to
//! decide whether it may still accept work.

use std::sync::atomic::{AtomicU8, Ordering};

/// The loop's lifecycle state.
///
/// Valid transitions: `Awake -> Running`; `Running <-> Sleeping`;
/// `{Awake, Running, Sleeping} -> Terminating`; `Terminating -> Terminated`.
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Constructed, `run` not yet called.
    Awake = 0,
    /// Executing a tick phase on the loop thread.
    Running = 1,
    /// Blocked inside `poll_io` (or its fast-mode equivalent).
    Sleeping = 2,
    /// Shutdown requested; draining in-flight work.
    Terminating = 3,
    /// Fully stopped. No further transitions are possible.
    Terminated = 4,
}

impl LoopState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Awake,
            1 => Self::Running,
            2 => Self::Sleeping,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }
}

/// Atomic wrapper around [`LoopState`].
#[derive(Debug)]
pub struct StateMachine {
    inner: AtomicU8,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a new state machine in the `Awake` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: AtomicU8::new(LoopState::Awake as u8),
        }
    }

    /// Reads the current state with acquire ordering.
    #[must_use]
    pub fn load(&self) -> LoopState {
        LoopState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Attempts `from -> to`. Returns `true` on success.
    pub fn try_transition(&self, from: LoopState, to: LoopState) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attempts a transition from any of `froms` to `to`, trying each in
    /// order until one succeeds.
    pub fn transition_any(&self, froms: &[LoopState], to: LoopState) -> bool {
        froms.iter().any(|&from| self.try_transition(from, to))
    }

    /// Unconditionally stores `to`. Only legitimately used for the
    /// `-> Terminated` sink, where no racing writer could plausibly need to
    /// observe a failed CAS.
    pub fn store(&self, to: LoopState) {
        self.inner.store(to as u8, Ordering::Release);
    }

    /// `true` iff the state is `Terminating` or `Terminated`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.load(), LoopState::Terminating | LoopState::Terminated)
    }

    /// `true` iff new work may still be accepted (i.e. not terminal).
    #[must_use]
    pub fn can_accept_work(&self) -> bool {
        !self.is_terminal()
    }

    /// `true` iff the state is `Running`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.load() == LoopState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_awake() {
        assert_eq!(StateMachine::new().load(), LoopState::Awake);
    }

    #[test]
    fn valid_transition_succeeds() {
        let sm = StateMachine::new();
        assert!(sm.try_transition(LoopState::Awake, LoopState::Running));
        assert_eq!(sm.load(), LoopState::Running);
    }

    #[test]
    fn invalid_transition_fails_and_state_unchanged() {
        let sm = StateMachine::new();
        assert!(!sm.try_transition(LoopState::Sleeping, LoopState::Running));
        assert_eq!(sm.load(), LoopState::Awake);
    }

    #[test]
    fn terminated_is_absorbing() {
        let sm = StateMachine::new();
        sm.store(LoopState::Terminated);
        assert!(!sm.try_transition(LoopState::Terminated, LoopState::Awake));
        assert!(sm.is_terminal());
        assert!(!sm.can_accept_work());
    }

    #[test]
    fn transition_any_tries_each_source() {
        let sm = StateMachine::new();
        sm.store(LoopState::Sleeping);
        assert!(sm.transition_any(
            &[LoopState::Awake, LoopState::Running, LoopState::Sleeping],
            LoopState::Terminating
        ));
        assert_eq!(sm.load(), LoopState::Terminating);
    }
}
