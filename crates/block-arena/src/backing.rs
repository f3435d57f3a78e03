//! Heaps an [`Arena`](crate::Arena) draws its blocks from.
//!
//! The arena never talks to the global allocator directly. Every block it
//! owns is obtained through a [`BackingAllocator`] and handed back to the
//! same allocator when the chain is freed or the arena is dropped. Blocks
//! wrapped around caller-owned memory or carved out of another block never
//! reach the backing allocator.

use core::{alloc::Layout, ptr::NonNull};

/// A source of heap blocks.
///
/// # Safety
///
/// Implementations must return memory that is valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, and not aliased by
/// anything else until it is passed back to
/// [`deallocate`](Self::deallocate).
pub unsafe trait BackingAllocator {
    /// Allocates a block described by `layout`.
    ///
    /// `layout.size()` is never zero. Returns `None` when no memory is
    /// available.
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a block previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by `allocate` on this allocator with the exact
    ///   same `layout`
    /// - `ptr` has not been deallocated before
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// The global heap (`alloc::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Global;

unsafe impl BackingAllocator for Global {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "Block layout must not be empty");
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

unsafe impl<B> BackingAllocator for &mut B
where
    B: BackingAllocator + ?Sized,
{
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{BackingAllocator, Global, Layout, NonNull};

    /// Counts calls into [`Global`] and refuses to allocate past `limit`.
    #[derive(Debug, Default)]
    pub(crate) struct CountingAllocator {
        pub(crate) allocations: usize,
        pub(crate) deallocations: usize,
        pub(crate) live_bytes: usize,
        pub(crate) limit: Option<usize>,
    }

    impl CountingAllocator {
        pub(crate) fn with_limit(limit: usize) -> Self {
            Self {
                limit: Some(limit),
                ..Self::default()
            }
        }
    }

    unsafe impl BackingAllocator for CountingAllocator {
        fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
            if self.limit.is_some_and(|limit| self.allocations >= limit) {
                return None;
            }
            let ptr = Global.allocate(layout)?;
            self.allocations += 1;
            self.live_bytes += layout.size();
            Some(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
            self.deallocations += 1;
            self.live_bytes -= layout.size();
            unsafe { Global.deallocate(ptr, layout) }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::{testing::CountingAllocator, *};

    #[test]
    fn test_global_round_trip() {
        let layout = Layout::from_size_align(256, 64).unwrap();
        let ptr = Global.allocate(layout).unwrap();
        assert_eq!(ptr.addr().get() % 64, 0);
        unsafe {
            ptr.as_ptr().write_bytes(0x33, layout.size());
            Global.deallocate(ptr, layout);
        }
    }

    #[test]
    fn test_counting_limit() {
        let layout = Layout::from_size_align(32, 16).unwrap();
        let mut heap = CountingAllocator::with_limit(1);
        let ptr = heap.allocate(layout).unwrap();
        assert!(heap.allocate(layout).is_none());
        assert_eq!(heap.live_bytes, 32);

        unsafe { heap.deallocate(ptr, layout) };
        assert_eq!(heap.deallocations, 1);
        assert_eq!(heap.live_bytes, 0);
    }
}
