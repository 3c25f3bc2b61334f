use crate::cache::page::{Page, PageReadGuard, PageWriteGuard, Waiter};
use crate::error::Result;
use crate::signal::Signal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(0);

/// Single-use handle for waiting on a page's buffer and then accessing it.
///
/// An acquisition's lifetime must be strictly contained in the lifetime
/// of a [`PagePtr`](crate::cache::PagePtr) on the same page; the snapshot
/// reference is what keeps the page alive, the acquisition itself only
/// registers as a waiter.
pub struct PageAcquisition {
    page: Option<Arc<Page>>,
    waiter_id: u64,
    signal: Arc<Signal>,
}

impl PageAcquisition {
    #[inline]
    pub fn new() -> Self {
        PageAcquisition {
            page: None,
            waiter_id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            signal: Arc::new(Signal::new()),
        }
    }

    /// Register as a waiter on `page`. May be called once per acquisition.
    /// Never suspends; if the buffer is already resident the ready signal
    /// is pulsed before this returns.
    pub fn attach(&mut self, page: &Arc<Page>) {
        assert!(self.page.is_none(), "acquisition already attached");
        self.page = Some(Arc::clone(page));
        page.add_waiter(Waiter {
            id: self.waiter_id,
            signal: Arc::clone(&self.signal),
        });
    }

    #[inline]
    pub fn has(&self) -> bool {
        self.page.is_some()
    }

    /// The ready signal, pulsed exactly once when the buffer becomes
    /// available or the load fails.
    #[inline]
    pub fn ready(&self) -> &Signal {
        &self.signal
    }

    /// Wait until the page's buffer is ready. Returns immediately if the
    /// signal was pulsed at attach time.
    pub async fn wait_ready(&self) -> Result<()> {
        assert!(self.page.is_some(), "acquisition not attached");
        self.signal.wait().await
    }

    pub async fn buffer_size(&self) -> Result<usize> {
        self.wait_ready().await?;
        Ok(self.page().buf_size())
    }

    pub async fn read_buffer(&self) -> Result<PageReadGuard<'_>> {
        self.wait_ready().await?;
        Ok(self.page().buf_for_read())
    }

    /// Waits for readiness, marks the page dirty (drops its block token)
    /// and lends the buffer mutably.
    pub async fn write_buffer(&self) -> Result<PageWriteGuard<'_>> {
        self.wait_ready().await?;
        Ok(self.page().buf_for_write())
    }

    #[inline]
    fn page(&self) -> &Arc<Page> {
        self.page.as_ref().unwrap()
    }
}

impl Default for PageAcquisition {
    #[inline]
    fn default() -> Self {
        PageAcquisition::new()
    }
}

impl Drop for PageAcquisition {
    #[inline]
    fn drop(&mut self) {
        if let Some(page) = &self.page {
            page.remove_waiter(self.waiter_id);
        }
    }
}
