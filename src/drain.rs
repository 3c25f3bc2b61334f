use event_listener::{listener, Event, Listener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks outstanding background work so shutdown can wait for it.
///
/// Every load task holds a [`DrainGuard`] for its whole lifetime.
/// [`Drainer::drain`] flips the drainer into draining mode and blocks until
/// the last guard is released. Acquiring a guard after draining has begun
/// is a defect in the caller.
pub struct Drainer {
    inner: Arc<DrainInner>,
}

struct DrainInner {
    outstanding: AtomicUsize,
    draining: AtomicBool,
    idle_ev: Event,
}

impl Drainer {
    #[inline]
    pub fn new() -> Self {
        Drainer {
            inner: Arc::new(DrainInner {
                outstanding: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                idle_ev: Event::new(),
            }),
        }
    }

    /// Acquire a guard that keeps the drainer busy until dropped.
    #[inline]
    pub fn acquire(&self) -> DrainGuard {
        assert!(
            !self.inner.draining.load(Ordering::Acquire),
            "guard acquired while draining"
        );
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        DrainGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Enter draining mode and block until all guards are released.
    #[inline]
    pub fn drain(&self) {
        self.inner.draining.store(true, Ordering::Release);
        loop {
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            // Register listener before re-check to avoid missed notification.
            listener!(self.inner.idle_ev => listener);
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                return;
            }
            listener.wait();
        }
    }
}

impl Default for Drainer {
    #[inline]
    fn default() -> Self {
        Drainer::new()
    }
}

/// Scoped token released on drop; see [`Drainer`].
pub struct DrainGuard {
    inner: Arc<DrainInner>,
}

impl Drop for DrainGuard {
    #[inline]
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle_ev.notify(usize::MAX);
        }
    }
}
