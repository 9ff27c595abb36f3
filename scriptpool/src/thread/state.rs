//! # Thread State Machine
//!
//! Every execution thread owns a [`ThreadState`]. The state is read and
//! written from both sides: the thread's own loop moves it forward while it
//! works, and outside callers (the runtime, the autoscaler, worker restarts)
//! use [`ThreadState::request_safe_state_change`] to interrupt it.
//!
//! ## Key Concepts
//! - Safe states: `Ready` and `Inactive`. Only these accept external transition requests.
//! - Refusing states: `Reserved`, `ShuttingDown` and `Done` refuse every request.
//! - Subscribers: `wait_for` registers a set of target states plus a one-shot
//!   [`Signal`]. A transition closes the signal of every subscriber whose set
//!   contains the new state and prunes it; the others stay registered.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use super::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StateId {
    /// Capacity that has not been booted yet
    Reserved,
    Booting,
    BootRequested,
    ShuttingDown,
    Done,

    // Steady states
    Inactive,
    Ready,

    // Worker restarts
    Restarting,
    Yielding,

    // Handler transitions
    TransitionRequested,
    TransitionInProgress,
    TransitionComplete,
}

impl StateId {
    pub fn name(&self) -> &'static str {
        match self {
            StateId::Reserved => "reserved",
            StateId::Booting => "booting",
            StateId::BootRequested => "boot requested",
            StateId::ShuttingDown => "shutting down",
            StateId::Done => "done",
            StateId::Inactive => "inactive",
            StateId::Ready => "ready",
            StateId::Restarting => "restarting",
            StateId::Yielding => "yielding",
            StateId::TransitionRequested => "transition requested",
            StateId::TransitionInProgress => "transition in progress",
            StateId::TransitionComplete => "transition complete",
        }
    }

    /// States from which an external caller may request a transition.
    pub fn is_safe(&self) -> bool {
        matches!(self, StateId::Ready | StateId::Inactive)
    }

    /// States from which every transition request is refused.
    pub fn refuses_requests(&self) -> bool {
        matches!(
            self,
            StateId::Reserved | StateId::ShuttingDown | StateId::Done
        )
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Subscriber {
    states: Vec<StateId>,
    signal: Arc<Signal>,
}

struct Inner {
    current: StateId,
    subscribers: Vec<Subscriber>,
    is_waiting: bool,
    waiting_since: Instant,
}

impl Inner {
    fn notify(&mut self, next: StateId) {
        self.subscribers.retain(|sub| {
            if sub.states.contains(&next) {
                sub.signal.close();
                false
            } else {
                true
            }
        });
    }
}

/// Per-thread finite state machine with blocking waits.
pub struct ThreadState {
    inner: Mutex<Inner>,
}

impl ThreadState {
    pub fn new() -> Self {
        Self::with_state(StateId::Reserved)
    }

    pub fn with_state(state: StateId) -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: state,
                subscribers: Vec::new(),
                is_waiting: false,
                waiting_since: Instant::now(),
            }),
        }
    }

    pub fn is(&self, state: StateId) -> bool {
        self.inner.lock().current == state
    }

    pub fn get(&self) -> StateId {
        self.inner.lock().current
    }

    pub fn name(&self) -> &'static str {
        self.get().name()
    }

    pub fn set(&self, next: StateId) {
        let mut inner = self.inner.lock();
        inner.current = next;
        inner.notify(next);
    }

    pub fn compare_and_swap(&self, from: StateId, to: StateId) -> bool {
        let mut inner = self.inner.lock();
        if inner.current != from {
            return false;
        }
        inner.current = to;
        inner.notify(to);
        true
    }

    /// Blocks until the state is one of `states`.
    pub fn wait_for(&self, states: &[StateId]) {
        let signal = {
            let mut inner = self.inner.lock();
            if states.contains(&inner.current) {
                return;
            }
            let signal = Arc::new(Signal::new());
            inner.subscribers.push(Subscriber {
                states: states.to_vec(),
                signal: Arc::clone(&signal),
            });
            signal
        };
        signal.wait();
    }

    /// The only entry point outside callers use to interrupt a running thread.
    ///
    /// Refused from `Reserved`, `ShuttingDown` and `Done`. Applied at once from
    /// a safe state. From any other state it waits until the thread reaches a
    /// safe state or starts shutting down, then tries again.
    pub fn request_safe_state_change(&self, next: StateId) -> bool {
        loop {
            {
                let mut inner = self.inner.lock();
                let current = inner.current;
                if current.refuses_requests() {
                    return false;
                }
                if current.is_safe() {
                    inner.current = next;
                    inner.notify(next);
                    return true;
                }
            }
            self.wait_for(&[StateId::Ready, StateId::Inactive, StateId::ShuttingDown]);
        }
    }

    pub fn mark_as_waiting(&self, is_waiting: bool) {
        let mut inner = self.inner.lock();
        if is_waiting {
            inner.is_waiting = true;
            inner.waiting_since = Instant::now();
        } else {
            inner.is_waiting = false;
        }
    }

    pub fn is_in_waiting_state(&self) -> bool {
        self.inner.lock().is_waiting
    }

    /// Milliseconds spent waiting, 0 when not waiting.
    pub fn wait_time(&self) -> u64 {
        let inner = self.inner.lock();
        if !inner.is_waiting {
            return 0;
        }
        inner.waiting_since.elapsed().as_millis() as u64
    }

    /// Overrides the waiting timestamp, marking the state as waiting.
    #[cfg(test)]
    pub(crate) fn set_wait_time(&self, since: Instant) {
        let mut inner = self.inner.lock();
        inner.is_waiting = true;
        inner.waiting_since = since;
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ThreadState")
            .field("current", &inner.current)
            .field("subscribers", &inner.subscribers.len())
            .field("is_waiting", &inner.is_waiting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    const ALL_STATES: [StateId; 12] = [
        StateId::Reserved,
        StateId::Booting,
        StateId::BootRequested,
        StateId::ShuttingDown,
        StateId::Done,
        StateId::Inactive,
        StateId::Ready,
        StateId::Restarting,
        StateId::Yielding,
        StateId::TransitionRequested,
        StateId::TransitionInProgress,
        StateId::TransitionComplete,
    ];

    #[test]
    fn wait_for_returns_immediately_when_already_in_state() {
        let state = ThreadState::with_state(StateId::Ready);
        state.wait_for(&[StateId::Inactive, StateId::Ready]);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn two_waiters_are_both_woken() {
        let state = Arc::new(ThreadState::new());
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.wait_for(&[StateId::Ready]))
            })
            .collect();

        while state.subscriber_count() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }
        state.set(StateId::Ready);
        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn non_matching_subscribers_stay_registered() {
        let state = Arc::new(ThreadState::new());
        let waiter = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.wait_for(&[StateId::Done]))
        };
        while state.subscriber_count() < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }

        state.set(StateId::Ready);
        assert_eq!(state.subscriber_count(), 1);
        state.set(StateId::Done);
        waiter.join().unwrap();
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn safe_state_change_is_refused_from_refusing_states() {
        for refusing in [StateId::Reserved, StateId::ShuttingDown, StateId::Done] {
            let state = ThreadState::with_state(refusing);
            assert!(!state.request_safe_state_change(StateId::Restarting));
            assert_eq!(state.get(), refusing);
        }
    }

    #[test]
    fn safe_state_change_applies_from_safe_states() {
        let state = ThreadState::with_state(StateId::Inactive);
        assert!(state.request_safe_state_change(StateId::TransitionRequested));
        assert_eq!(state.get(), StateId::TransitionRequested);
    }

    #[test]
    fn safe_state_change_waits_for_safe_state() {
        let state = Arc::new(ThreadState::with_state(StateId::Booting));
        let requester = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.request_safe_state_change(StateId::ShuttingDown))
        };
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(state.get(), StateId::Booting);

        state.set(StateId::Inactive);
        assert!(requester.join().unwrap());
        assert_eq!(state.get(), StateId::ShuttingDown);
    }

    #[test]
    fn safe_state_change_gives_up_once_shutting_down() {
        let state = Arc::new(ThreadState::with_state(StateId::Booting));
        let requester = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || state.request_safe_state_change(StateId::Restarting))
        };
        std::thread::sleep(Duration::from_millis(10));
        state.set(StateId::ShuttingDown);
        assert!(!requester.join().unwrap());
    }

    #[test]
    fn wait_time_tracks_waiting_flag() {
        let state = ThreadState::with_state(StateId::Ready);
        assert_eq!(state.wait_time(), 0);

        state.set_wait_time(Instant::now() - Duration::from_secs(2));
        assert!(state.is_in_waiting_state());
        assert!(state.wait_time() >= 2000);

        state.mark_as_waiting(false);
        assert_eq!(state.wait_time(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn subscribers_converge_to_zero(indices in proptest::collection::vec(0usize..12, 1..24)) {
            let state = Arc::new(ThreadState::new());
            let mut waiters = Vec::new();
            for (n, i) in indices.iter().enumerate() {
                let target = ALL_STATES[*i];
                let state_clone = Arc::clone(&state);
                waiters.push(std::thread::spawn(move || state_clone.wait_for(&[target])));
                if n % 3 == 0 {
                    state.set(ALL_STATES[(i + 1) % ALL_STATES.len()]);
                } else {
                    state.compare_and_swap(state.get(), ALL_STATES[*i]);
                }
            }
            // cycle through every state until each waiter has been released
            loop {
                for s in ALL_STATES {
                    state.set(s);
                }
                if waiters.iter().all(|w| w.is_finished()) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            for waiter in waiters {
                waiter.join().unwrap();
            }
            prop_assert_eq!(state.subscriber_count(), 0);
        }
    }
}
