//! Broadcast-once signal.
//!
//! A `Signal` is never sent on. Closing it wakes every receiver at once,
//! including receivers parked in a `crossbeam_channel::select!`, and every
//! later receive returns immediately. Drain channels, request completion and
//! state subscriptions are all built on it.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

pub struct Signal {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Closes the signal. Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Blocks until the signal is closed.
    pub fn wait(&self) {
        // Nothing is ever sent, so this only returns on disconnect.
        let _ = self.receiver.recv();
    }

    /// Blocks until the signal is closed or `timeout` elapses. Returns `true` if closed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Receiver usable as a `recv` arm in `select!`; it fires once the signal is closed.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn close_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_closed());
        assert!(signal.close());
        assert!(!signal.close());
        assert!(signal.is_closed());
    }

    #[test]
    fn close_wakes_all_waiters() {
        let signal = Arc::new(Signal::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = Arc::clone(&signal);
                std::thread::spawn(move || signal.wait())
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        signal.close();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn wait_timeout_reports_open_signal() {
        let signal = Signal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        signal.close();
        assert!(signal.wait_timeout(Duration::from_millis(5)));
    }
}
