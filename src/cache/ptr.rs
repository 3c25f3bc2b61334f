use crate::cache::page::Page;
use std::sync::Arc;

/// Owning snapshot handle on a [`Page`].
///
/// Each live `PagePtr` contributes one unit to the page's snapshot
/// refcount; dropping the last one destroys the page. Move-only: a second
/// snapshot on the same page is taken explicitly with [`duplicate`].
///
/// [`duplicate`]: PagePtr::duplicate
pub struct PagePtr {
    page: Option<Arc<Page>>,
}

impl PagePtr {
    #[inline]
    pub(crate) fn new(page: Arc<Page>) -> Self {
        page.add_snapshotter();
        PagePtr { page: Some(page) }
    }

    /// The referenced page, for read access. No state change.
    #[inline]
    pub fn for_read(&self) -> &Arc<Page> {
        self.page.as_ref().expect("released page handle")
    }

    /// The page to write through.
    ///
    /// With other snapshot holders present, the page is copied first and
    /// this handle is rebound to the copy; the original keeps the other
    /// holders' references. With a sole holder the page is returned as is.
    pub fn for_write(&mut self) -> Arc<Page> {
        let page = self.page.as_ref().expect("released page handle");
        if page.num_snapshot_references() > 1 {
            let copy = page.make_copy();
            *self = PagePtr::new(copy);
        }
        Arc::clone(self.page.as_ref().unwrap())
    }

    /// Take a second snapshot handle on the same page.
    #[inline]
    pub fn duplicate(&self) -> PagePtr {
        PagePtr::new(Arc::clone(self.for_read()))
    }

    /// Release the snapshot reference before the handle goes out of scope.
    #[inline]
    pub fn reset(&mut self) {
        if let Some(page) = self.page.take() {
            page.remove_snapshotter();
        }
    }
}

impl Drop for PagePtr {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}
