use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, Layout};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub type BlockId = u64;

/// Alignment of serialized block buffers, matching the logical sector size
/// of common storage devices so implementations can use direct IO.
pub const BUFFER_ALIGN: usize = 512;

#[inline]
pub const fn align_to_buffer_size(size: usize) -> usize {
    (size + BUFFER_ALIGN - 1) / BUFFER_ALIGN * BUFFER_ALIGN
}

/// Owned, sector-aligned heap buffer holding one serialized block.
///
/// Allocated through [`Serializer::allocate_buffer`] so the serializer
/// controls size and alignment of every buffer it is asked to fill.
pub struct PageBuf {
    data: Box<[u8]>,
}

impl PageBuf {
    /// Allocate a zeroed buffer of `size` bytes, rounded up to alignment.
    #[inline]
    pub fn zeroed(size: usize) -> Self {
        assert!(size > 0, "zero-sized block buffer");
        let len = align_to_buffer_size(size);
        unsafe {
            // SAFETY: len is non-zero and a multiple of BUFFER_ALIGN; the
            // vec adopts the allocation with its exact size, so the usual
            // Box drop glue frees it.
            let layout = Layout::from_size_align_unchecked(len, BUFFER_ALIGN);
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "block buffer allocation failed");
            let vec = Vec::from_raw_parts(ptr, len, len);
            PageBuf {
                data: vec.into_boxed_slice(),
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for PageBuf {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PageBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Reference to a block's current on-disk location.
///
/// Required to re-read a block after its in-memory buffer is dropped.
/// Tokens are shared through `Arc` because a block location may be
/// referenced by a page and by in-flight reads at the same time.
#[derive(Debug)]
pub struct BlockToken {
    block_id: BlockId,
    offset: u64,
    block_size: usize,
}

impl BlockToken {
    #[inline]
    pub fn new(block_id: BlockId, offset: u64, block_size: usize) -> Self {
        BlockToken {
            block_id,
            offset,
            block_size,
        }
    }

    #[inline]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes of the serialized block behind this token.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

/// Accounting handle threaded through block reads.
#[derive(Default)]
pub struct IoAccount {
    issued_reads: AtomicU64,
}

impl IoAccount {
    #[inline]
    pub fn record_read(&self) {
        self.issued_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn issued_reads(&self) -> u64 {
        self.issued_reads.load(Ordering::Relaxed)
    }
}

/// On-disk block store as seen by the cache.
///
/// Implementations own all real IO. `index_read` resolves a block id to its
/// current location; `block_read` fills a buffer from a resolved location
/// and records the read on the account.
#[async_trait]
pub trait Serializer: Send + Sync + 'static {
    /// Size in bytes of one full serialized block.
    fn block_size(&self) -> usize;

    /// Allocate a zeroed, alignment-correct buffer able to hold one block.
    #[inline]
    fn allocate_buffer(&self) -> PageBuf {
        PageBuf::zeroed(self.block_size())
    }

    async fn index_read(&self, block_id: BlockId) -> Result<Arc<BlockToken>>;

    async fn block_read(
        &self,
        token: &BlockToken,
        buf: &mut PageBuf,
        account: &IoAccount,
    ) -> Result<()>;
}

/// In-memory block store.
///
/// Backs the crate's tests and serves as the reference implementation of
/// the [`Serializer`] contract. Supports injecting read failures so load
/// error paths can be exercised.
pub struct MemSerializer {
    block_size: usize,
    blocks: Mutex<HashMap<BlockId, Arc<[u8]>>>,
    fail_reads: AtomicUsize,
}

impl MemSerializer {
    #[inline]
    pub fn new(block_size: usize) -> Self {
        assert!(block_size > 0 && block_size % BUFFER_ALIGN == 0);
        MemSerializer {
            block_size,
            blocks: Mutex::new(HashMap::new()),
            fail_reads: AtomicUsize::new(0),
        }
    }

    /// Store block contents, zero-padded to the block size, and return a
    /// token for the stored location.
    #[inline]
    pub fn put_block(&self, block_id: BlockId, data: &[u8]) -> Arc<BlockToken> {
        assert!(data.len() <= self.block_size);
        let mut block = vec![0u8; self.block_size];
        block[..data.len()].copy_from_slice(data);
        let mut g = self.blocks.lock();
        g.insert(block_id, block.into());
        Arc::new(BlockToken::new(
            block_id,
            block_id * self.block_size as u64,
            self.block_size,
        ))
    }

    /// Make the next `n` block reads fail with an IO error.
    #[inline]
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::Release);
    }

    #[inline]
    fn take_injected_failure(&self) -> bool {
        let mut curr = self.fail_reads.load(Ordering::Acquire);
        loop {
            if curr == 0 {
                return false;
            }
            match self.fail_reads.compare_exchange(
                curr,
                curr - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(n) => curr = n,
            }
        }
    }
}

#[async_trait]
impl Serializer for MemSerializer {
    #[inline]
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn index_read(&self, block_id: BlockId) -> Result<Arc<BlockToken>> {
        let g = self.blocks.lock();
        if !g.contains_key(&block_id) {
            return Err(Error::BlockNotFound(block_id));
        }
        Ok(Arc::new(BlockToken::new(
            block_id,
            block_id * self.block_size as u64,
            self.block_size,
        )))
    }

    async fn block_read(
        &self,
        token: &BlockToken,
        buf: &mut PageBuf,
        account: &IoAccount,
    ) -> Result<()> {
        if self.take_injected_failure() {
            return Err(Error::IOError);
        }
        let g = self.blocks.lock();
        let block = g
            .get(&token.block_id())
            .ok_or(Error::BlockNotFound(token.block_id()))?;
        assert!(buf.len() >= block.len());
        buf[..block.len()].copy_from_slice(block);
        account.record_read();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_buf_alignment_and_zeroing() {
        let buf = PageBuf::zeroed(1000);
        assert_eq!(buf.len(), align_to_buffer_size(1000));
        assert_eq!(buf.as_ptr() as usize % BUFFER_ALIGN, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_page_buf_read_write() {
        let mut buf = PageBuf::zeroed(512);
        buf[0] = 0xAB;
        buf[511] = 0xCD;
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[511], 0xCD);
    }

    #[test]
    fn test_mem_serializer_round_trip() {
        smol::block_on(async {
            let ser = MemSerializer::new(512);
            ser.put_block(7, &[1, 2, 3, 4]);

            let token = ser.index_read(7).await.unwrap();
            assert_eq!(token.block_id(), 7);
            assert_eq!(token.block_size(), 512);

            let account = IoAccount::default();
            let mut buf = ser.allocate_buffer();
            ser.block_read(&token, &mut buf, &account).await.unwrap();
            assert_eq!(&buf[..4], &[1, 2, 3, 4]);
            assert!(buf[4..].iter().all(|&b| b == 0));
            assert_eq!(account.issued_reads(), 1);
        });
    }

    #[test]
    fn test_mem_serializer_missing_block() {
        smol::block_on(async {
            let ser = MemSerializer::new(512);
            let res = ser.index_read(99).await;
            assert!(matches!(res, Err(Error::BlockNotFound(99))));
        });
    }

    #[test]
    fn test_mem_serializer_injected_failures() {
        smol::block_on(async {
            let ser = MemSerializer::new(512);
            let token = ser.put_block(1, &[9]);
            ser.fail_next_reads(1);

            let account = IoAccount::default();
            let mut buf = ser.allocate_buffer();
            let res = ser.block_read(&token, &mut buf, &account).await;
            assert!(matches!(res, Err(Error::IOError)));
            assert_eq!(account.issued_reads(), 0);

            // Failure budget consumed, next read succeeds.
            ser.block_read(&token, &mut buf, &account).await.unwrap();
            assert_eq!(buf[0], 9);
        });
    }
}
