pub mod cache;
pub mod drain;
pub mod error;
pub mod serializer;
pub mod signal;

pub mod prelude {
    pub use crate::cache::{
        PageAcquisition, PageCache, PageCacheConfig, PagePtr, PageReadGuard, PageWriteGuard,
    };
    pub use crate::error::{Error, Result};
    pub use crate::serializer::{BlockId, BlockToken, MemSerializer, PageBuf, Serializer};
}
