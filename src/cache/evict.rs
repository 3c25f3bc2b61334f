use crate::cache::page::{Page, PageId, PageState};
use crate::cache::CacheCtx;
use crossbeam_utils::CachePadded;
use event_listener::{listener, Event, Listener};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// First access time handed out by a fresh evictor.
///
/// We pick a value far from zero so the logic and performance do not spaz
/// out if the access time counter overflows. Degradation is smooth if the
/// counter loops around past the initial value, as long as it is
/// incremented one step at a time.
pub const INITIAL_ACCESS_TIME: u64 = 1 << 30;

/// Access time given to read-ahead pages: one below the initial counter
/// value, so unused read-ahead pages are the first eviction candidates.
pub(crate) const READ_AHEAD_ACCESS_TIME: u64 = INITIAL_ACCESS_TIME - 1;

const EVICT_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// State classes the evictor files pages under. A page is in exactly one
/// bag at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionBag {
    /// A load task is in flight; the buffer is not in memory yet.
    NotYetLoaded,
    /// Loaded (or about to reload) with waiters attached; must not be evicted.
    Unevictable,
    /// No waiters, block token on disk. Holds both resident pages whose
    /// buffer may be dropped and already-evicted pages awaiting reload.
    EvictableDiskBacked,
    /// No waiters, resident buffer with no on-disk copy. Never an eviction
    /// source because writeback is not this layer's job.
    EvictableUnbacked,
}

#[derive(Default)]
struct Bags {
    not_yet_loaded: HashMap<PageId, Arc<Page>>,
    unevictable: HashMap<PageId, Arc<Page>>,
    evictable_disk_backed: HashMap<PageId, Arc<Page>>,
    evictable_unbacked: HashMap<PageId, Arc<Page>>,
}

impl Bags {
    #[inline]
    fn bag_mut(&mut self, kind: EvictionBag) -> &mut HashMap<PageId, Arc<Page>> {
        match kind {
            EvictionBag::NotYetLoaded => &mut self.not_yet_loaded,
            EvictionBag::Unevictable => &mut self.unevictable,
            EvictionBag::EvictableDiskBacked => &mut self.evictable_disk_backed,
            EvictionBag::EvictableUnbacked => &mut self.evictable_unbacked,
        }
    }

    #[inline]
    fn containing(&self, page_id: PageId) -> Option<EvictionBag> {
        if self.not_yet_loaded.contains_key(&page_id) {
            Some(EvictionBag::NotYetLoaded)
        } else if self.unevictable.contains_key(&page_id) {
            Some(EvictionBag::Unevictable)
        } else if self.evictable_disk_backed.contains_key(&page_id) {
            Some(EvictionBag::EvictableDiskBacked)
        } else if self.evictable_unbacked.contains_key(&page_id) {
            Some(EvictionBag::EvictableUnbacked)
        } else {
            None
        }
    }
}

/// Classifies pages into eviction bags and reclaims resident memory when
/// the configured limit is exceeded.
///
/// The page layer drives every transition: it reports each observable
/// state change and the evictor re-derives the correct bag, so the mapping
/// from state to bag lives in one place.
pub struct Evictor {
    bags: Mutex<Bags>,
    access_time: CachePadded<AtomicU64>,
    next_page_id: AtomicU64,
    in_memory_bytes: AtomicUsize,
    memory_limit: usize,
    evict_ev: Event,
    shutdown: AtomicBool,
}

impl Evictor {
    #[inline]
    pub(crate) fn new(memory_limit: usize) -> Self {
        Evictor {
            bags: Mutex::new(Bags::default()),
            access_time: CachePadded::new(AtomicU64::new(INITIAL_ACCESS_TIME)),
            next_page_id: AtomicU64::new(0),
            in_memory_bytes: AtomicUsize::new(0),
            memory_limit,
            evict_ev: Event::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Hand out the next monotone access timestamp.
    #[inline]
    pub fn next_access_time(&self) -> u64 {
        self.access_time.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn register_page_id(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pure mapping from a page's observable state to the bag it belongs in.
    pub fn correct_eviction_category(&self, st: &PageState) -> EvictionBag {
        if st.loading.is_some() {
            EvictionBag::NotYetLoaded
        } else if !st.waiters.is_empty() {
            EvictionBag::Unevictable
        } else if st.buffer.is_some() {
            if st.block_token.is_some() {
                EvictionBag::EvictableDiskBacked
            } else {
                EvictionBag::EvictableUnbacked
            }
        } else if st.block_token.is_some() {
            // Evicted: reloadable through the token.
            EvictionBag::EvictableDiskBacked
        } else if st.load_failed.is_some() {
            // Terminal load failure with nothing to reload from. The page
            // stays registered; waiters are pulsed with the stored error.
            EvictionBag::NotYetLoaded
        } else {
            panic!("unloaded block is not in a loadable state");
        }
    }

    #[inline]
    pub(crate) fn add_not_yet_loaded(&self, page: &Arc<Page>) {
        self.add_to_bag(EvictionBag::NotYetLoaded, page);
    }

    #[inline]
    pub(crate) fn add_to_evictable_unbacked(&self, page: &Arc<Page>) {
        self.add_to_bag(EvictionBag::EvictableUnbacked, page);
    }

    #[inline]
    pub(crate) fn add_to_evictable_disk_backed(&self, page: &Arc<Page>) {
        self.add_to_bag(EvictionBag::EvictableDiskBacked, page);
    }

    #[inline]
    fn add_to_bag(&self, kind: EvictionBag, page: &Arc<Page>) {
        let mut bags = self.bags.lock();
        debug_assert!(bags.containing(page.id()).is_none());
        bags.bag_mut(kind).insert(page.id(), Arc::clone(page));
    }

    /// Account for a buffer that just became resident.
    #[inline]
    pub(crate) fn add_now_loaded_size(&self, bytes: usize) {
        let total = self.in_memory_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if total > self.memory_limit {
            self.evict_ev.notify(1);
        }
    }

    #[inline]
    pub(crate) fn remove_now_loaded_size(&self, bytes: usize) {
        let prev = self.in_memory_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes);
    }

    /// Move a page from its previously-recorded bag to the bag its current
    /// state calls for. `old_bag` must be the category computed before the
    /// state change.
    pub(crate) fn change_to_correct_eviction_bag(
        &self,
        old_bag: EvictionBag,
        page_id: PageId,
        st: &PageState,
    ) {
        let new_bag = self.correct_eviction_category(st);
        if new_bag == old_bag {
            return;
        }
        {
            let mut bags = self.bags.lock();
            let page = bags
                .bag_mut(old_bag)
                .remove(&page_id)
                .expect("page not in recorded eviction bag");
            bags.bag_mut(new_bag).insert(page_id, page);
        }
        if new_bag == EvictionBag::EvictableDiskBacked && self.memory_pressure() > 0 {
            self.evict_ev.notify(1);
        }
    }

    /// Move a freshly-loaded page with no waiters out of its unevictable
    /// bag into the evictable bag its state calls for.
    pub(crate) fn move_unevictable_to_evictable(&self, page_id: PageId, st: &PageState) {
        let new_bag = self.correct_eviction_category(st);
        assert!(
            matches!(
                new_bag,
                EvictionBag::EvictableDiskBacked | EvictionBag::EvictableUnbacked
            ),
            "page state is not evictable"
        );
        let mut bags = self.bags.lock();
        let old_bag = bags.containing(page_id).expect("page not in any bag");
        assert!(
            matches!(
                old_bag,
                EvictionBag::NotYetLoaded | EvictionBag::Unevictable
            ),
            "page is not in an unevictable bag"
        );
        let page = bags.bag_mut(old_bag).remove(&page_id).unwrap();
        bags.bag_mut(new_bag).insert(page_id, page);
        drop(bags);
        if new_bag == EvictionBag::EvictableDiskBacked && self.memory_pressure() > 0 {
            self.evict_ev.notify(1);
        }
    }

    /// Drop a destroyed page from its bag and from memory accounting.
    pub(crate) fn remove_page(&self, page_id: PageId, st: &PageState) {
        let mut bags = self.bags.lock();
        let bag = bags.containing(page_id).expect("page not in any bag");
        bags.bag_mut(bag).remove(&page_id);
        drop(bags);
        if st.buffer.is_some() {
            self.remove_now_loaded_size(st.serialized_size);
        }
    }

    /// Which bag currently records the page, if any.
    #[inline]
    pub fn current_bag(&self, page_id: PageId) -> Option<EvictionBag> {
        self.bags.lock().containing(page_id)
    }

    #[inline]
    pub(crate) fn page_is_in_unevictable_bag(&self, page_id: PageId) -> bool {
        matches!(
            self.current_bag(page_id),
            Some(EvictionBag::NotYetLoaded) | Some(EvictionBag::Unevictable)
        )
    }

    #[inline]
    pub fn in_memory_bytes(&self) -> usize {
        self.in_memory_bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Bytes of resident buffers above the configured limit.
    #[inline]
    fn memory_pressure(&self) -> usize {
        self.in_memory_bytes().saturating_sub(self.memory_limit)
    }

    /// Disk-backed evictable pages, least recently accessed first.
    fn evict_candidates(&self) -> Vec<Arc<Page>> {
        let bags = self.bags.lock();
        let mut candidates: Vec<Arc<Page>> =
            bags.evictable_disk_backed.values().cloned().collect();
        drop(bags);
        candidates.sort_by_key(|page| page.access_time());
        candidates
    }

    #[inline]
    pub(crate) fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.evict_ev.notify(usize::MAX);
    }
}

/// Background eviction loop: whenever resident buffers exceed the memory
/// limit, drop buffers of the least recently used disk-backed pages until
/// back under the limit.
///
/// Candidates are collected from the bag before any page lock is taken;
/// each page re-verifies its own state under its lock, so a page that
/// gained waiters or lost its buffer in the meantime is skipped.
pub(crate) fn run_evictor(ctx: Arc<CacheCtx>) {
    let evictor = &ctx.evictor;
    loop {
        if evictor.shutdown.load(Ordering::Acquire) {
            return;
        }

        let over = evictor.memory_pressure();
        if over == 0 {
            // Register listener before re-check to avoid missed wakeups.
            listener!(evictor.evict_ev => listener);
            if evictor.shutdown.load(Ordering::Acquire) {
                return;
            }
            if evictor.memory_pressure() > 0 {
                continue;
            }
            listener.wait_timeout(EVICT_CHECK_INTERVAL);
            continue;
        }

        let mut freed = 0usize;
        for page in evictor.evict_candidates() {
            if freed >= over {
                break;
            }
            let bytes = page.try_evict();
            if bytes > 0 {
                log::trace!("evicted page {} ({} bytes)", page.id(), bytes);
                freed += bytes;
            }
        }

        if freed == 0 {
            // Nothing evictable right now; wait for a state change.
            listener!(evictor.evict_ev => listener);
            if evictor.shutdown.load(Ordering::Acquire) {
                return;
            }
            listener.wait_timeout(EVICT_CHECK_INTERVAL);
        }
    }
}
