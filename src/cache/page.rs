use crate::cache::acq::PageAcquisition;
use crate::cache::evict::{EvictionBag, READ_AHEAD_ACCESS_TIME};
use crate::cache::ptr::PagePtr;
use crate::cache::CacheCtx;
use crate::drain::DrainGuard;
use crate::error::{Error, Result};
use crate::serializer::{BlockId, BlockToken, PageBuf, Serializer};
use crate::signal::Signal;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Cache-local page handle used by the evictor's bag bookkeeping.
/// Not a disk identity.
pub type PageId = u64;

/// In-memory state of one logical block.
///
/// A page may hold a resident buffer, a token for the block's on-disk
/// location, or both; which combinations are legal is governed by the
/// bag the evictor files the page under. Pages are shared as `Arc<Page>`
/// for memory liveness, but the logical lifetime is the snapshot
/// refcount: when the last [`PagePtr`] goes away the page is destroyed.
pub struct Page {
    id: PageId,
    access_time: AtomicU64,
    pub(crate) state: Mutex<PageState>,
    ctx: Arc<CacheCtx>,
}

pub struct PageState {
    pub(crate) serialized_size: usize,
    pub(crate) buffer: Option<PageBuf>,
    pub(crate) block_token: Option<Arc<BlockToken>>,
    pub(crate) snapshot_refcount: usize,
    pub(crate) waiters: Vec<Waiter>,
    /// Cancel flag shared with an in-flight load task. Present iff a load
    /// is in flight; set to true when the page is destroyed so the task
    /// aborts without touching page state.
    pub(crate) loading: Option<Arc<AtomicBool>>,
    /// Terminal outcome of a failed load, handed to waiters.
    pub(crate) load_failed: Option<Error>,
}

impl PageState {
    #[inline]
    fn unloaded(loading: Option<Arc<AtomicBool>>) -> Self {
        PageState {
            serialized_size: 0,
            buffer: None,
            block_token: None,
            snapshot_refcount: 0,
            waiters: Vec::new(),
            loading,
            load_failed: None,
        }
    }
}

pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) signal: Arc<Signal>,
}

/// Shared borrow of a page's loaded buffer. Read-only by construction.
pub struct PageReadGuard<'a>(MappedMutexGuard<'a, [u8]>);

impl Deref for PageReadGuard<'_> {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Exclusive borrow of a page's loaded buffer, handed out only through
/// the write path that drops the block token first.
pub struct PageWriteGuard<'a>(MappedMutexGuard<'a, [u8]>);

impl Deref for PageWriteGuard<'_> {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Page {
    /// Cold load: register the page as not-yet-loaded and dispatch a task
    /// that resolves the block id and reads the block.
    pub(crate) fn new_from_block_id(ctx: &Arc<CacheCtx>, block_id: BlockId) -> Arc<Page> {
        let canceled = Arc::new(AtomicBool::new(false));
        let page = Arc::new(Page {
            id: ctx.evictor.register_page_id(),
            access_time: AtomicU64::new(ctx.evictor.next_access_time()),
            state: Mutex::new(PageState::unloaded(Some(Arc::clone(&canceled)))),
            ctx: Arc::clone(ctx),
        });
        ctx.evictor.add_not_yet_loaded(&page);
        // Cancel flag and drain guard are in place before the task can
        // reach its first suspension point.
        let guard = ctx.drainer.acquire();
        ctx.spawn_load(load_with_block_id(
            Arc::downgrade(&page),
            canceled,
            guard,
            block_id,
            Arc::clone(ctx),
        ));
        page
    }

    /// Fresh page around an already-populated buffer with no on-disk copy.
    pub(crate) fn new_from_buf(ctx: &Arc<CacheCtx>, buf: PageBuf) -> Arc<Page> {
        assert!(!buf.is_empty());
        let size = buf.len();
        let mut st = PageState::unloaded(None);
        st.serialized_size = size;
        st.buffer = Some(buf);
        let page = Arc::new(Page {
            id: ctx.evictor.register_page_id(),
            access_time: AtomicU64::new(ctx.evictor.next_access_time()),
            state: Mutex::new(st),
            ctx: Arc::clone(ctx),
        });
        ctx.evictor.add_to_evictable_unbacked(&page);
        ctx.evictor.add_now_loaded_size(size);
        page
    }

    /// Read-ahead page: buffer and token already known. Gets an access
    /// time below every regular page so it is evicted first if unused.
    pub(crate) fn new_read_ahead(
        ctx: &Arc<CacheCtx>,
        buf: PageBuf,
        token: Arc<BlockToken>,
    ) -> Arc<Page> {
        assert!(!buf.is_empty());
        let size = token.block_size();
        let mut st = PageState::unloaded(None);
        st.serialized_size = size;
        st.buffer = Some(buf);
        st.block_token = Some(token);
        let page = Arc::new(Page {
            id: ctx.evictor.register_page_id(),
            access_time: AtomicU64::new(READ_AHEAD_ACCESS_TIME),
            state: Mutex::new(st),
            ctx: Arc::clone(ctx),
        });
        ctx.evictor.add_to_evictable_disk_backed(&page);
        ctx.evictor.add_now_loaded_size(size);
        page
    }

    /// Start an asynchronous copy of this page's contents.
    ///
    /// The new page is returned immediately in the not-yet-loaded state;
    /// the copy task waits for this page's buffer and then duplicates it.
    /// The returned page carries no snapshot reference yet and must be
    /// wrapped in a [`PagePtr`] right away.
    pub fn make_copy(self: &Arc<Self>) -> Arc<Page> {
        let ctx = &self.ctx;
        // Snapshot the copyee so it cannot be destroyed mid-copy.
        let copyee_ptr = PagePtr::new(Arc::clone(self));
        let canceled = Arc::new(AtomicBool::new(false));
        let page = Arc::new(Page {
            id: ctx.evictor.register_page_id(),
            access_time: AtomicU64::new(ctx.evictor.next_access_time()),
            state: Mutex::new(PageState::unloaded(Some(Arc::clone(&canceled)))),
            ctx: Arc::clone(ctx),
        });
        ctx.evictor.add_not_yet_loaded(&page);
        let guard = ctx.drainer.acquire();
        ctx.spawn_load(load_from_copyee(
            Arc::downgrade(&page),
            canceled,
            guard,
            copyee_ptr,
            Arc::clone(ctx),
        ));
        page
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn num_snapshot_references(&self) -> usize {
        self.state.lock().snapshot_refcount
    }

    /// Raise the snapshot refcount. Never suspends.
    pub(crate) fn add_snapshotter(&self) {
        let mut st = self.state.lock();
        st.snapshot_refcount += 1;
    }

    /// Lower the snapshot refcount; on zero the page is destroyed: any
    /// in-flight load is canceled and the page leaves its eviction bag.
    pub(crate) fn remove_snapshotter(&self) {
        let mut st = self.state.lock();
        assert!(st.snapshot_refcount > 0, "snapshot refcount underflow");
        st.snapshot_refcount -= 1;
        if st.snapshot_refcount == 0 {
            // Every acquisition is bounded by the lifetime of some
            // snapshot handle, so the waiter list must be empty here.
            assert!(st.waiters.is_empty());
            if let Some(flag) = &st.loading {
                flag.store(true, Ordering::Release);
            }
            self.ctx.evictor.remove_page(self.id, &st);
        }
    }

    /// Register a waiter and drive loading: pulse immediately if the
    /// buffer is resident, join an in-flight load, or dispatch a reload
    /// through the block token.
    pub(crate) fn add_waiter(self: &Arc<Self>, waiter: Waiter) {
        let mut st = self.state.lock();
        let old_bag = self.ctx.evictor.correct_eviction_category(&st);
        let signal = Arc::clone(&waiter.signal);
        st.waiters.push(waiter);
        self.ctx
            .evictor
            .change_to_correct_eviction_bag(old_bag, self.id, &st);
        if st.buffer.is_some() {
            signal.pulse(Ok(()));
        } else if st.loading.is_some() {
            // A load is in flight; publication pulses every waiter.
        } else if st.block_token.is_some() {
            // Reload after eviction, or retry after a failed read.
            let old_bag = self.ctx.evictor.correct_eviction_category(&st);
            let canceled = Arc::new(AtomicBool::new(false));
            st.loading = Some(Arc::clone(&canceled));
            st.load_failed = None;
            self.ctx
                .evictor
                .change_to_correct_eviction_bag(old_bag, self.id, &st);
            let guard = self.ctx.drainer.acquire();
            let token = Arc::clone(st.block_token.as_ref().unwrap());
            self.ctx.spawn_load(load_using_block_token(
                Arc::downgrade(self),
                canceled,
                guard,
                token,
                Arc::clone(&self.ctx),
            ));
        } else if let Some(err) = st.load_failed.clone() {
            // Terminal failure with nothing to reload from.
            signal.pulse(Err(err));
        } else {
            panic!("unloaded block is not in a loadable state");
        }
    }

    pub(crate) fn remove_waiter(&self, waiter_id: u64) {
        let mut st = self.state.lock();
        let old_bag = self.ctx.evictor.correct_eviction_category(&st);
        let pos = st
            .waiters
            .iter()
            .position(|w| w.id == waiter_id)
            .expect("waiter not attached to page");
        st.waiters.remove(pos);
        self.ctx
            .evictor
            .change_to_correct_eviction_bag(old_bag, self.id, &st);
        // Acquisitions are always outlived by some snapshot handle.
        assert!(st.snapshot_refcount > 0);
    }

    /// Size in bytes of the loaded buffer.
    pub fn buf_size(&self) -> usize {
        let st = self.state.lock();
        assert!(st.buffer.is_some(), "page buffer not loaded");
        assert!(st.serialized_size != 0);
        st.serialized_size
    }

    /// Borrow the loaded buffer for reading. Refreshes the access time.
    pub(crate) fn buf_for_read(&self) -> PageReadGuard<'_> {
        let st = self.state.lock();
        assert!(st.buffer.is_some(), "page buffer not loaded");
        self.touch();
        PageReadGuard(MutexGuard::map(st, |s| {
            let n = s.serialized_size;
            &mut s.buffer.as_mut().unwrap()[..n]
        }))
    }

    /// Borrow the loaded buffer for writing. The in-memory contents now
    /// diverge from disk, so the block token is dropped.
    pub(crate) fn buf_for_write(&self) -> PageWriteGuard<'_> {
        let mut st = self.state.lock();
        assert!(st.buffer.is_some(), "page buffer not loaded");
        self.reset_block_token(&mut st);
        self.touch();
        PageWriteGuard(MutexGuard::map(st, |s| {
            let n = s.serialized_size;
            &mut s.buffer.as_mut().unwrap()[..n]
        }))
    }

    /// Forget the on-disk location. The caller must hold an acquisition,
    /// so the page is unevictable and its bag does not change.
    fn reset_block_token(&self, st: &mut PageState) {
        assert!(!st.waiters.is_empty(), "write access without acquisition");
        st.block_token = None;
        debug_assert_eq!(
            self.ctx.evictor.correct_eviction_category(st),
            EvictionBag::Unevictable
        );
    }

    #[inline]
    fn touch(&self) {
        self.access_time
            .store(self.ctx.evictor.next_access_time(), Ordering::Relaxed);
    }

    /// Drop the resident buffer of a clean disk-backed page. The page
    /// stays in the cache and is reloaded through its token on next use.
    pub fn evict_self(&self) {
        let mut st = self.state.lock();
        // A page can only self-evict if it has a block token.
        assert!(st.waiters.is_empty());
        assert!(st.block_token.is_some());
        assert!(st.buffer.is_some());
        self.evict_locked(&mut st);
    }

    /// Eviction-thread entry: re-verifies the preconditions under the
    /// page lock and skips the page if they no longer hold. Returns the
    /// number of bytes freed.
    pub(crate) fn try_evict(&self) -> usize {
        let mut st = self.state.lock();
        // A destroyed page (refcount 0) already left its bag; the evictor
        // may still hold a stale candidate reference to it.
        if st.snapshot_refcount == 0
            || st.loading.is_some()
            || !st.waiters.is_empty()
            || st.buffer.is_none()
            || st.block_token.is_none()
        {
            return 0;
        }
        self.evict_locked(&mut st)
    }

    fn evict_locked(&self, st: &mut PageState) -> usize {
        let old_bag = self.ctx.evictor.correct_eviction_category(st);
        let buf = st.buffer.take();
        debug_assert!(buf.is_some());
        self.ctx.evictor.remove_now_loaded_size(st.serialized_size);
        self.ctx
            .evictor
            .change_to_correct_eviction_bag(old_bag, self.id, st);
        st.serialized_size
    }

    /// Called once a load has published its buffer: wake the waiters in
    /// insertion order, or with no waiters hand the page to the evictable
    /// bag its state calls for.
    fn pulse_waiters_or_make_evictable(&self, old_bag: EvictionBag, st: &mut PageState) {
        debug_assert!(self.ctx.evictor.page_is_in_unevictable_bag(self.id));
        if st.waiters.is_empty() {
            self.ctx.evictor.move_unevictable_to_evictable(self.id, st);
        } else {
            for w in &st.waiters {
                // No waiter can have been pulsed before publication.
                w.signal.pulse(Ok(()));
            }
            self.ctx
                .evictor
                .change_to_correct_eviction_bag(old_bag, self.id, st);
        }
    }

    /// Terminal outcome of a failed load: record the error, pulse every
    /// waiter with it and leave the not-yet-loaded state. With a resolved
    /// token the page becomes reloadable; without one it stays failed.
    fn publish_load_failure(&self, st: &mut PageState, err: Error, token: Option<Arc<BlockToken>>) {
        log::debug!("page {} load failed: {}", self.id, err);
        let old_bag = self.ctx.evictor.correct_eviction_category(st);
        st.loading = None;
        if st.block_token.is_none() {
            st.block_token = token;
        }
        st.load_failed = Some(err.clone());
        for w in &st.waiters {
            w.signal.pulse(Err(err.clone()));
        }
        self.ctx
            .evictor
            .change_to_correct_eviction_bag(old_bag, self.id, st);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // Destruction is the only cancellation: an in-flight load must
        // observe it at its resumption point.
        if let Some(flag) = &self.state.get_mut().loading {
            flag.store(true, Ordering::Release);
        }
    }
}

/// Cold load: resolve the block id, read the block, publish.
async fn load_with_block_id(
    page: Weak<Page>,
    canceled: Arc<AtomicBool>,
    guard: DrainGuard,
    block_id: BlockId,
    ctx: Arc<CacheCtx>,
) {
    let _guard = guard;
    let mut buf = ctx.serializer.allocate_buffer();
    let token_res = ctx.serializer.index_read(block_id).await;
    let read_res = match &token_res {
        Ok(token) => {
            ctx.serializer
                .block_read(token, &mut buf, &ctx.reads_io_account)
                .await
        }
        Err(_) => Ok(()),
    };

    // The one defined resumption point: if the page was destroyed
    // meanwhile, abort; the buffer is freed by scope exit.
    let Some(page) = page.upgrade() else { return };
    let mut st = page.state.lock();
    if canceled.load(Ordering::Acquire) {
        return;
    }
    debug_assert!(st.loading.is_some());
    match (token_res, read_res) {
        (Ok(token), Ok(())) => {
            assert!(st.block_token.is_none());
            assert!(st.buffer.is_none());
            let old_bag = ctx.evictor.correct_eviction_category(&st);
            st.serialized_size = token.block_size();
            st.buffer = Some(buf);
            st.block_token = Some(token);
            st.loading = None;
            ctx.evictor.add_now_loaded_size(st.serialized_size);
            page.pulse_waiters_or_make_evictable(old_bag, &mut st);
        }
        (Ok(token), Err(err)) => page.publish_load_failure(&mut st, err, Some(token)),
        (Err(err), _) => page.publish_load_failure(&mut st, err, None),
    }
}

/// Reload after eviction: the token is already known, so the index read
/// is skipped and the token stays on the page.
async fn load_using_block_token(
    page: Weak<Page>,
    canceled: Arc<AtomicBool>,
    guard: DrainGuard,
    token: Arc<BlockToken>,
    ctx: Arc<CacheCtx>,
) {
    let _guard = guard;
    let mut buf = ctx.serializer.allocate_buffer();
    let read_res = ctx
        .serializer
        .block_read(&token, &mut buf, &ctx.reads_io_account)
        .await;

    let Some(page) = page.upgrade() else { return };
    let mut st = page.state.lock();
    if canceled.load(Ordering::Acquire) {
        return;
    }
    debug_assert!(st.loading.is_some());
    match read_res {
        Ok(()) => {
            debug_assert!(st
                .block_token
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, &token)));
            assert!(st.buffer.is_none());
            debug_assert!(st.serialized_size == 0 || st.serialized_size == token.block_size());
            let old_bag = ctx.evictor.correct_eviction_category(&st);
            st.serialized_size = token.block_size();
            st.buffer = Some(buf);
            st.loading = None;
            ctx.evictor.add_now_loaded_size(st.serialized_size);
            page.pulse_waiters_or_make_evictable(old_bag, &mut st);
        }
        Err(err) => page.publish_load_failure(&mut st, err, None),
    }
}

/// Copy load: wait for the copyee's buffer, duplicate it, publish the
/// copy as an unbacked page.
async fn load_from_copyee(
    page: Weak<Page>,
    canceled: Arc<AtomicBool>,
    guard: DrainGuard,
    copyee: PagePtr,
    ctx: Arc<CacheCtx>,
) {
    let _guard = guard;
    let copy_res = copy_from(&copyee, &ctx).await;

    let Some(page) = page.upgrade() else { return };
    let mut st = page.state.lock();
    if canceled.load(Ordering::Acquire) {
        return;
    }
    debug_assert!(st.loading.is_some());
    match copy_res {
        Ok((buf, size)) => {
            assert!(st.buffer.is_none());
            let old_bag = ctx.evictor.correct_eviction_category(&st);
            st.serialized_size = size;
            st.buffer = Some(buf);
            st.loading = None;
            ctx.evictor.add_now_loaded_size(size);
            page.pulse_waiters_or_make_evictable(old_bag, &mut st);
        }
        Err(err) => page.publish_load_failure(&mut st, err, None),
    }
}

async fn copy_from(copyee: &PagePtr, ctx: &Arc<CacheCtx>) -> Result<(PageBuf, usize)> {
    let mut acq = PageAcquisition::new();
    acq.attach(copyee.for_read());
    acq.wait_ready().await?;
    // The acquisition keeps the copyee unevictable; copy without
    // suspending.
    let src = copyee.for_read();
    let src_st = src.state.lock();
    let size = src_st.serialized_size;
    let src_buf = src_st.buffer.as_ref().expect("copyee buffer not loaded");
    let mut buf = ctx.serializer.allocate_buffer();
    buf[..size].copy_from_slice(&src_buf[..size]);
    Ok((buf, size))
}
