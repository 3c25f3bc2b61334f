use crate::error::Result;
use event_listener::{listener, Event};
use parking_lot::Mutex;

/// One-shot readiness signal.
///
/// The signal starts unpulsed and transitions to pulsed exactly once,
/// carrying the outcome of the operation the waiters are blocked on.
/// All waiters, past and future, observe the same outcome.
pub struct Signal {
    result: Mutex<Option<Result<()>>>,
    event: Event,
}

impl Signal {
    #[inline]
    pub fn new() -> Self {
        Signal {
            result: Mutex::new(None),
            event: Event::new(),
        }
    }

    /// Pulse the signal with the given outcome.
    ///
    /// Pulsing twice is a defect in the caller.
    #[inline]
    pub fn pulse(&self, res: Result<()>) {
        {
            let mut g = self.result.lock();
            assert!(g.is_none(), "one-shot signal pulsed twice");
            *g = Some(res);
        }
        self.event.notify(usize::MAX);
    }

    #[inline]
    pub fn is_pulsed(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Returns the pulsed outcome without waiting, if any.
    #[inline]
    pub fn try_result(&self) -> Option<Result<()>> {
        self.result.lock().clone()
    }

    /// Wait until the signal is pulsed and return the pulsed outcome.
    ///
    /// Returns immediately if the signal was pulsed before the call.
    #[inline]
    pub async fn wait(&self) -> Result<()> {
        loop {
            if let Some(res) = self.try_result() {
                return res;
            }
            // Register listener before re-check to avoid missed notification.
            listener!(self.event => listener);
            if let Some(res) = self.try_result() {
                return res;
            }
            listener.await;
        }
    }
}

impl Default for Signal {
    #[inline]
    fn default() -> Self {
        Signal::new()
    }
}
