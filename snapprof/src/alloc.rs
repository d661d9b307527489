//! Sampling global allocator
//!
//! Heap profiles come from this wrapper unless the `jemalloc` feature is on.
//! Install it once in the host binary:
//!
//! ```no_run
//! use snapprof::alloc::SamplingAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: SamplingAllocator = SamplingAllocator::system();
//! ```
//!
//! While the memory profile rate is 0 every call costs two atomic loads on
//! top of the inner allocator.

use std::alloc::{GlobalAlloc, Layout, System};

use crate::instrumentation::heap_sampler::heap_sampler;

/// Forwards to `A` and reports sampled allocations to the heap profile
#[derive(Debug, Default)]
pub struct SamplingAllocator<A = System> {
    inner: A,
}

impl SamplingAllocator<System> {
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> SamplingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: every request is forwarded unchanged to `inner`; the sampler only
// records addresses and never touches the memory behind them
#[allow(unsafe_code)]
unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        heap_sampler().on_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        heap_sampler().on_alloc(ptr, layout.size());
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Before the free, so a reused address is never dropped by mistake
        heap_sampler().on_dealloc(ptr);
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let sampler = heap_sampler();
        sampler.on_dealloc(ptr);
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
        sampler.on_alloc(new_ptr, new_size);
        new_ptr
    }
}
