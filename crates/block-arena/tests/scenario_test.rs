#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use core::{alloc::Layout, ptr::NonNull};
use std::collections::BTreeSet;

use block_arena::{
    Arena, BackingAllocator, BlockKind, ErrorKind, Global, MIN_BLOCK_SIZE, PushFlags, kib, mib,
};

/// Tracks every live block handed out by the global heap.
#[derive(Debug, Default)]
struct TrackingHeap {
    live: BTreeSet<usize>,
    allocated: usize,
    freed: usize,
}

unsafe impl BackingAllocator for TrackingHeap {
    fn allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = Global.allocate(layout)?;
        self.live.insert(ptr.addr().get());
        self.allocated += layout.size();
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        assert!(self.live.remove(&ptr.addr().get()), "block freed twice");
        self.freed += layout.size();
        unsafe { Global.deallocate(ptr, layout) }
    }
}

#[test]
fn growable_chain_of_large_pushes() {
    let mut heap = TrackingHeap::default();
    let mut arena = Arena::with_backing(&mut heap);
    let mem = arena.init(BlockKind::Growable, 0).unwrap();

    arena.push(mem, 3_000_000, PushFlags::empty()).unwrap();
    arena.push(mem, 64_000_000, PushFlags::CLEAR).unwrap();
    arena.push(mem, 5_000_000, PushFlags::empty()).unwrap();

    let blocks: Vec<_> = arena.blocks(mem).unwrap().collect();
    let sizes: Vec<_> = blocks.iter().map(|info| info.size).collect();
    let used: Vec<_> = blocks.iter().map(|info| info.used).collect();
    assert_eq!(sizes, [3_002_368, 64_000_000, 5_001_216]);
    assert_eq!(used, [3_000_000, 64_000_000, 5_000_000]);
    assert!(sizes.iter().all(|size| size % MIN_BLOCK_SIZE == 0));

    // 2368 bytes are left in the first block and 1216 in the third
    arena.push(mem, 1000, PushFlags::empty()).unwrap();
    assert_eq!(arena.used(mem).unwrap(), 3_001_000);

    arena.free(mem).unwrap();
    drop(arena);
    assert!(heap.live.is_empty());
    assert_eq!(heap.allocated, heap.freed);
}

#[test]
fn fixed_arena_stays_fixed() {
    let mut arena = Arena::new();
    let mem = arena.init(BlockKind::Fixed, kib(16)).unwrap();

    let ptr = arena
        .push(mem, size_of::<u32>() * 10, PushFlags::CLEAR)
        .unwrap();
    let values = unsafe { core::slice::from_raw_parts_mut(ptr.cast::<u32>().as_ptr(), 10) };
    assert!(values.iter().all(|&value| value == 0));
    values[3] = 7;

    let err = arena.push(mem, kib(32), PushFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);
    assert_eq!(arena.block_count(mem).unwrap(), 1);
    assert_eq!(arena.total_size(mem).unwrap(), kib(16));
    assert_eq!(arena.used(mem).unwrap(), 40);
}

#[test]
fn external_buffer_is_never_freed() {
    let mut buffer = vec![0xEE_u8; 512];
    let mut heap = TrackingHeap::default();
    {
        let mut arena = Arena::with_backing(&mut heap);
        let mem = unsafe { arena.init_from_external(buffer.as_mut_ptr(), buffer.len()) }.unwrap();
        assert_eq!(arena.kind(mem).unwrap(), BlockKind::Fixed);
        assert!(!arena.blocks(mem).unwrap().next().unwrap().owns_memory);

        let ptr = arena.push(mem, 16, PushFlags::CLEAR).unwrap();
        assert_eq!(ptr.as_ptr(), buffer.as_mut_ptr());
        arena.push(mem, 496, PushFlags::empty()).unwrap();
        arena.push(mem, 1, PushFlags::empty()).unwrap_err();

        arena.free(mem).unwrap();
    }
    assert_eq!(heap.allocated, 0);
    assert_eq!(heap.freed, 0);
    assert!(buffer[..16].iter().all(|&b| b == 0));
    assert!(buffer[16..].iter().all(|&b| b == 0xEE));
}

#[test]
fn external_buffer_rejects_bad_input() {
    let mut arena = Arena::new();
    let err = unsafe { arena.init_from_external(core::ptr::null_mut(), 64) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let mut byte = 0_u8;
    let err = unsafe { arena.init_from_external(&raw mut byte, 0) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn static_buffer_arena() {
    let buffer: &'static mut [u8] = Box::leak(vec![0_u8; 256].into_boxed_slice());
    let mut arena = Arena::new();
    let mem = arena.init_from_static(buffer).unwrap();
    let ptr = arena.push_aligned(mem, 32, 8, PushFlags::empty()).unwrap();
    assert_eq!(ptr.addr().get() % 8, 0);
    assert_eq!(arena.total_size(mem).unwrap(), 256);
}

#[test]
fn temporary_scope_over_growable_arena() {
    let mut arena = Arena::new();
    let mem = arena.init(BlockKind::Growable, mib(16)).unwrap();
    arena.push(mem, mib(4), PushFlags::empty()).unwrap();

    let before = arena.remaining_size(mem).unwrap();
    let temp = arena.begin_temporary(mem).unwrap();
    assert_eq!(arena.total_size(temp).unwrap(), before);

    let err = arena.push(mem, 1, PushFlags::empty()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Locked);

    let scratch = arena.push(temp, mib(1), PushFlags::CLEAR).unwrap();
    unsafe { scratch.as_ptr().write_bytes(0x5A, mib(1)) };
    arena.end_temporary(temp).unwrap();

    assert_eq!(arena.remaining_size(mem).unwrap(), before);
    let reused = arena.push(mem, mib(1), PushFlags::CLEAR).unwrap();
    assert_eq!(reused, scratch);
    let bytes = unsafe { core::slice::from_raw_parts(reused.as_ptr(), mib(1)) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn sub_blocks_and_reset() {
    let mut arena = Arena::new();
    let frame = arena.init(BlockKind::Growable, kib(64)).unwrap();

    for _ in 0..3 {
        let scratch = arena.push_block(frame, kib(8), PushFlags::empty()).unwrap();
        arena.push(scratch, kib(4), PushFlags::empty()).unwrap();
        arena.push(scratch, kib(4), PushFlags::empty()).unwrap();
        arena.push(scratch, 1, PushFlags::empty()).unwrap_err();
        assert_eq!(arena.used(frame).unwrap(), kib(8));

        arena.destroy(scratch).unwrap();
        arena.reset(frame).unwrap();
    }
    assert_eq!(arena.descriptor_count(), 1);
    assert_eq!(arena.remaining_size(frame).unwrap(), kib(64));
}

#[test]
fn independent_arenas_share_backing() {
    let mut heap = TrackingHeap::default();
    let mut arena = Arena::with_backing(&mut heap);
    let a = arena.init(BlockKind::Growable, 0).unwrap();
    let b = arena.init(BlockKind::Growable, 0).unwrap();

    let pa = arena.push(a, 100, PushFlags::empty()).unwrap();
    let pb = arena.push(b, 100, PushFlags::empty()).unwrap();
    assert_ne!(pa, pb);

    arena.destroy(a).unwrap();
    assert_eq!(arena.used(b).unwrap(), 100);
    assert_eq!(arena.backing().live.len(), 1);
    drop(arena);
    assert!(heap.live.is_empty());
}
