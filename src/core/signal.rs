//! Completion handles for quiescent operations.

use std::sync::mpsc;
use std::time::Duration;

/// A one-shot handle delivered when a quiescent operation settles.
///
/// The engine never blocks internally; the caller decides whether and how
/// long to wait. Dropping the signal abandons the result without stopping
/// the underlying work.
pub struct Signal<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Signal<T> {
    pub(crate) fn new() -> (mpsc::Sender<T>, Signal<T>) {
        let (tx, rx) = mpsc::channel();
        (tx, Signal { rx })
    }

    /// Block until the operation settles.
    ///
    /// Blocks forever if the pool never reaches the required quiescence;
    /// use [`Signal::wait_timeout`] to bound the wait.
    pub fn wait(self) -> T {
        self.rx
            .recv()
            .expect("handler pool dropped before the quiescent operation settled")
    }

    /// Block for at most `timeout`. `None` means the operation has not
    /// settled yet; in-flight work is not stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}
