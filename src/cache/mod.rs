pub mod acq;
pub mod evict;
pub mod page;
pub mod ptr;

pub use acq::PageAcquisition;
pub use evict::{EvictionBag, Evictor, INITIAL_ACCESS_TIME};
pub use page::{Page, PageId, PageReadGuard, PageWriteGuard};
pub use ptr::PagePtr;

use crate::cache::evict::run_evictor;
use crate::drain::Drainer;
use crate::error::{Error, Result};
use crate::serializer::{BlockId, BlockToken, IoAccount, PageBuf, Serializer};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) type LoadTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub(crate) enum WorkerMsg {
    Task(LoadTask),
    Shutdown,
}

/// Shared context every page holds: the collaborators page operations and
/// load tasks need to run unaided.
pub(crate) struct CacheCtx {
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) evictor: Evictor,
    pub(crate) drainer: Drainer,
    pub(crate) reads_io_account: IoAccount,
    task_tx: flume::Sender<WorkerMsg>,
}

impl CacheCtx {
    /// Hand a load task to the worker thread.
    #[inline]
    pub(crate) fn spawn_load(&self, task: impl Future<Output = ()> + Send + 'static) {
        let _ = self.task_tx.send(WorkerMsg::Task(Box::pin(task)));
    }
}

const DEFAULT_MEMORY_LIMIT: Byte = Byte::from_u64(64 * 1024 * 1024);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCacheConfig {
    memory_limit: Byte,
}

impl Default for PageCacheConfig {
    #[inline]
    fn default() -> Self {
        PageCacheConfig {
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

impl PageCacheConfig {
    /// Upper bound on resident buffer bytes before the evictor starts
    /// dropping disk-backed buffers.
    #[inline]
    pub fn memory_limit<T>(mut self, memory_limit: T) -> Self
    where
        Byte: From<T>,
    {
        self.memory_limit = Byte::from(memory_limit);
        self
    }

    pub fn build(self, serializer: Arc<dyn Serializer>) -> Result<PageCache> {
        let limit = self.memory_limit.as_u64() as usize;
        if limit < serializer.block_size() {
            return Err(Error::InvalidArgument);
        }
        let (task_tx, task_rx) = flume::unbounded();
        let ctx = Arc::new(CacheCtx {
            serializer,
            evictor: Evictor::new(limit),
            drainer: Drainer::new(),
            reads_io_account: IoAccount::default(),
            task_tx,
        });
        let worker = start_worker(task_rx);
        let evict_thread = {
            let ctx = Arc::clone(&ctx);
            spawn_named("CacheEvictor", move || run_evictor(ctx))
        };
        Ok(PageCache {
            ctx,
            worker: Some(worker),
            evict_thread: Some(evict_thread),
        })
    }
}

/// One cache shard: creates pages, runs their load tasks on a dedicated
/// worker thread and evicts resident buffers over the memory limit.
///
/// All [`PagePtr`] handles must be dropped before the cache; dropping the
/// cache drains outstanding loads and stops the worker and evictor
/// threads.
pub struct PageCache {
    ctx: Arc<CacheCtx>,
    worker: Option<JoinHandle<()>>,
    evict_thread: Option<JoinHandle<()>>,
}

impl PageCache {
    /// Cold load: a page whose contents are fetched from the serializer
    /// by block id.
    #[inline]
    pub fn page_for_block_id(&self, block_id: BlockId) -> PagePtr {
        PagePtr::new(Page::new_from_block_id(&self.ctx, block_id))
    }

    /// Fresh page around an already-populated buffer with no on-disk copy.
    #[inline]
    pub fn page_for_new_buf(&self, buf: PageBuf) -> PagePtr {
        PagePtr::new(Page::new_from_buf(&self.ctx, buf))
    }

    /// Read-ahead page: buffer and block token already known.
    #[inline]
    pub fn page_for_read_ahead(&self, buf: PageBuf, token: Arc<BlockToken>) -> PagePtr {
        PagePtr::new(Page::new_read_ahead(&self.ctx, buf, token))
    }

    #[inline]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.ctx.serializer
    }

    #[inline]
    pub fn evictor(&self) -> &Evictor {
        &self.ctx.evictor
    }

    /// Block reads issued on behalf of this cache.
    #[inline]
    pub fn issued_reads(&self) -> u64 {
        self.ctx.reads_io_account.issued_reads()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // All outstanding loads must finish before the worker can stop.
        self.ctx.drainer.drain();
        let _ = self.ctx.task_tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.ctx.evictor.stop();
        if let Some(handle) = self.evict_thread.take() {
            let _ = handle.join();
        }
    }
}

fn start_worker(task_rx: flume::Receiver<WorkerMsg>) -> JoinHandle<()> {
    spawn_named("CacheLoader", move || {
        let ex = async_executor::LocalExecutor::new();
        smol::block_on(ex.run(async {
            loop {
                match task_rx.recv_async().await {
                    Ok(WorkerMsg::Task(task)) => {
                        ex.spawn(task).detach();
                    }
                    Ok(WorkerMsg::Shutdown) | Err(_) => return,
                }
            }
        }));
    })
}

fn spawn_named<F>(name: &str, f: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn cache thread")
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::serializer::MemSerializer;
    use async_trait::async_trait;

    /// Serializer whose block reads wait for an explicit permit, letting
    /// tests control exactly when a load completes.
    pub(crate) struct GatedSerializer {
        pub(crate) inner: MemSerializer,
        gate: flume::Receiver<()>,
    }

    impl GatedSerializer {
        pub(crate) fn new(block_size: usize) -> (Arc<GatedSerializer>, flume::Sender<()>) {
            let (tx, rx) = flume::unbounded();
            let ser = Arc::new(GatedSerializer {
                inner: MemSerializer::new(block_size),
                gate: rx,
            });
            (ser, tx)
        }
    }

    #[async_trait]
    impl Serializer for GatedSerializer {
        fn block_size(&self) -> usize {
            self.inner.block_size()
        }

        async fn index_read(&self, block_id: BlockId) -> Result<Arc<BlockToken>> {
            self.inner.index_read(block_id).await
        }

        async fn block_read(
            &self,
            token: &BlockToken,
            buf: &mut PageBuf,
            account: &IoAccount,
        ) -> Result<()> {
            self.gate.recv_async().await.map_err(|_| Error::IOError)?;
            self.inner.block_read(token, buf, account).await
        }
    }

    pub(crate) fn test_cache(serializer: Arc<dyn Serializer>) -> PageCache {
        PageCacheConfig::default().build(serializer).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::serializer::MemSerializer;
    use rand::Rng;
    use std::thread;
    use std::time::Duration;

    const BLOCK_SIZE: usize = 512;

    fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_cold_read() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        ser.put_block(42, &[0x01, 0x02, 0x03, 0x04]);
        let cache = test_cache(ser);

        let ptr = cache.page_for_block_id(42);
        let page_id = ptr.for_read().id();
        smol::block_on(async {
            let mut acq = PageAcquisition::new();
            acq.attach(ptr.for_read());
            acq.wait_ready().await.unwrap();

            assert_eq!(acq.buffer_size().await.unwrap(), BLOCK_SIZE);
            let buf = acq.read_buffer().await.unwrap();
            assert_eq!(&buf[..4], &[0x01, 0x02, 0x03, 0x04]);
            drop(buf);

            // Unevictable while the acquisition is live.
            assert_eq!(
                cache.evictor().current_bag(page_id),
                Some(EvictionBag::Unevictable)
            );
        });
        assert_eq!(
            cache.evictor().current_bag(page_id),
            Some(EvictionBag::EvictableDiskBacked)
        );
        assert_eq!(cache.issued_reads(), 1);
    }

    #[test]
    fn test_copy_on_write() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        let cache = test_cache(ser);

        let mut buf = cache.serializer().allocate_buffer();
        buf[0] = 0xAA;
        let a = cache.page_for_new_buf(buf);
        let mut b = a.duplicate();
        assert_eq!(a.for_read().num_snapshot_references(), 2);

        smol::block_on(async {
            // Writing through b with two snapshot holders rebinds b to a copy.
            let page_b = b.for_write();
            assert!(!Arc::ptr_eq(a.for_read(), &page_b));
            assert!(Arc::ptr_eq(b.for_read(), &page_b));
            assert_eq!(a.for_read().num_snapshot_references(), 1);

            let mut acq = PageAcquisition::new();
            acq.attach(&page_b);
            {
                let mut wbuf = acq.write_buffer().await.unwrap();
                assert_eq!(wbuf[0], 0xAA);
                wbuf[0] = 0xFF;
            }
            drop(acq);

            // The other holder still observes its original contents.
            let mut acq = PageAcquisition::new();
            acq.attach(a.for_read());
            let rbuf = acq.read_buffer().await.unwrap();
            assert_eq!(rbuf[0], 0xAA);
        });

        // A sole holder writes in place, no copy.
        smol::block_on(async {
            let page_b2 = b.for_write();
            assert!(Arc::ptr_eq(b.for_read(), &page_b2));
        });
    }

    #[test]
    fn test_memory_limit_eviction() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        for block_id in 0..4u64 {
            ser.put_block(block_id, &[block_id as u8 + 1]);
        }
        let cache = PageCacheConfig::default()
            .memory_limit(2 * BLOCK_SIZE as u64)
            .build(ser)
            .unwrap();

        let ptrs: Vec<PagePtr> = (0..4u64)
            .map(|block_id| cache.page_for_block_id(block_id))
            .collect();
        smol::block_on(async {
            for ptr in &ptrs {
                let mut acq = PageAcquisition::new();
                acq.attach(ptr.for_read());
                acq.wait_ready().await.unwrap();
            }
        });

        // The evictor drops least recently used buffers until under limit.
        wait_until(|| cache.evictor().in_memory_bytes() <= 2 * BLOCK_SIZE);

        // Evicted pages reload transparently with identical contents.
        smol::block_on(async {
            for (i, ptr) in ptrs.iter().enumerate() {
                let mut acq = PageAcquisition::new();
                acq.attach(ptr.for_read());
                let buf = acq.read_buffer().await.unwrap();
                assert_eq!(buf[0], i as u8 + 1);
            }
        });
        drop(ptrs);
    }

    #[test]
    fn test_read_ahead_evicted_first() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        ser.put_block(1, &[1]);
        ser.put_block(2, &[2]);
        let ra_token = ser.put_block(3, &[3]);
        let cache = PageCacheConfig::default()
            .memory_limit(2 * BLOCK_SIZE as u64)
            .build(Arc::clone(&ser) as Arc<dyn Serializer>)
            .unwrap();

        let a = cache.page_for_block_id(1);
        smol::block_on(async {
            let mut acq = PageAcquisition::new();
            acq.attach(a.for_read());
            acq.wait_ready().await.unwrap();
        });

        let mut ra_buf = cache.serializer().allocate_buffer();
        ra_buf[0] = 3;
        let ra = cache.page_for_read_ahead(ra_buf, ra_token);
        assert_eq!(ra.for_read().access_time(), INITIAL_ACCESS_TIME - 1);

        // Loading one more page exceeds the limit; the unused read-ahead
        // page has the lowest access time and goes first.
        let b = cache.page_for_block_id(2);
        smol::block_on(async {
            let mut acq = PageAcquisition::new();
            acq.attach(b.for_read());
            acq.wait_ready().await.unwrap();
        });

        wait_until(|| ra.for_read().state.lock().buffer.is_none());
        assert!(a.for_read().state.lock().buffer.is_some());
        assert!(b.for_read().state.lock().buffer.is_some());
        assert_eq!(
            cache.evictor().current_bag(ra.for_read().id()),
            Some(EvictionBag::EvictableDiskBacked)
        );
    }

    #[test]
    fn test_random_ops_preserve_bag_invariant() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        for block_id in 0..8u64 {
            ser.put_block(block_id, &[block_id as u8]);
        }
        let cache = test_cache(ser);
        let mut rng = rand::rng();

        let check = |pages: &Vec<(Option<PageAcquisition>, PagePtr)>| {
            for (_, ptr) in pages {
                let page = ptr.for_read();
                let st = page.state.lock();
                assert_eq!(
                    cache.evictor().current_bag(page.id()),
                    Some(cache.evictor().correct_eviction_category(&st))
                );
            }
        };

        smol::block_on(async {
            // Acquisition stored before its snapshot handle so it drops first.
            let mut pages: Vec<(Option<PageAcquisition>, PagePtr)> = Vec::new();
            for _ in 0..300 {
                match rng.random_range(0..7) {
                    0 => {
                        let block_id = rng.random_range(0..8u64);
                        pages.push((None, cache.page_for_block_id(block_id)));
                    }
                    1 => {
                        let buf = cache.serializer().allocate_buffer();
                        pages.push((None, cache.page_for_new_buf(buf)));
                    }
                    2 if !pages.is_empty() => {
                        let i = rng.random_range(0..pages.len());
                        let dup = pages[i].1.duplicate();
                        pages.push((None, dup));
                    }
                    3 if !pages.is_empty() => {
                        let i = rng.random_range(0..pages.len());
                        let (acq, ptr) = pages.swap_remove(i);
                        // The acquisition must go before its snapshot handle.
                        drop(acq);
                        drop(ptr);
                    }
                    4 if !pages.is_empty() => {
                        let i = rng.random_range(0..pages.len());
                        if pages[i].0.is_none() {
                            let mut acq = PageAcquisition::new();
                            acq.attach(pages[i].1.for_read());
                            pages[i].0 = Some(acq);
                        }
                    }
                    5 if !pages.is_empty() => {
                        let i = rng.random_range(0..pages.len());
                        pages[i].0 = None;
                    }
                    6 if !pages.is_empty() => {
                        let i = rng.random_range(0..pages.len());
                        if let Some(acq) = &pages[i].0 {
                            if let Ok(mut buf) = acq.write_buffer().await {
                                buf[0] = buf[0].wrapping_add(1);
                            }
                        }
                    }
                    _ => {}
                }
                check(&pages);
            }
            // Settle all in-flight loads so teardown is orderly.
            for (acq, ptr) in &mut pages {
                if acq.is_none() {
                    let mut a = PageAcquisition::new();
                    a.attach(ptr.for_read());
                    *acq = Some(a);
                }
                let _ = acq.as_ref().unwrap().wait_ready().await;
            }
            check(&pages);
            pages.clear();
        });
    }

    #[test]
    fn test_build_rejects_tiny_memory_limit() {
        let ser = Arc::new(MemSerializer::new(BLOCK_SIZE));
        let res = PageCacheConfig::default()
            .memory_limit(BLOCK_SIZE as u64 / 2)
            .build(ser);
        assert!(matches!(res, Err(Error::InvalidArgument)));
    }
}
