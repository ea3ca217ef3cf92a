//! This crate implements two classic free-list dynamic memory allocators
//! that run entirely inside a memory region supplied by the application.
//!
//!  - **[`ImplicitHeap`]** keeps nothing but a size-and-flag header in each
//!    block and finds free blocks by walking the whole region. Freed blocks
//!    are never merged.
//!
//!  - **[`ExplicitHeap`]** additionally threads a doubly-linked free list
//!    through the free blocks' payloads, searches only that list, and merges
//!    a freed block with both of its physical neighbors immediately.
//!
//!  - **The memory region is provided by an application.** The allocators
//!    never ask anyone for more memory, so a request larger than what the
//!    region has left simply fails.
//!
//!  - **This crate supports `#![no_std]`.** Neither allocator is
//!    thread-safe by itself; wrap one in a mutex to share it.
//!
//! Both allocators implement [`HeapAlloc`], which offers the usual
//! allocate/release/resize trio plus a consistency checker
//! ([`HeapAlloc::validate`]) and a human-readable dump
//! ([`HeapAlloc::dump`]) for tests and debugging.
//!
//! # Examples
//!
//! ```rust
//! use flalloc::{ExplicitHeap, HeapAlloc};
//! use std::mem::MaybeUninit;
//!
//! #[repr(align(16))]
//! struct Pool([MaybeUninit<u8>; 4096]);
//!
//! let mut pool = Pool([MaybeUninit::uninit(); 4096]);
//! let mut heap: ExplicitHeap = ExplicitHeap::INIT;
//! heap.init(&mut pool.0).unwrap();
//!
//! let a = heap.allocate(100).unwrap();
//! let b = heap.allocate(200).unwrap();
//! heap.release(a);
//!
//! // The most recently freed block is reused first
//! let c = heap.allocate(50).unwrap();
//! assert_eq!(c, a);
//!
//! // Grow `b` in place into the free space following it
//! let b2 = heap.resize(Some(b), 1000).unwrap();
//! assert_eq!(b2, b);
//!
//! assert!(heap.validate().is_ok());
//! ```
//!
//! # Details
//!
//! ## Block Layout
//!
//! Every block starts with a [`HEADER_SIZE`]-byte header holding the block's
//! total size, which is a multiple of [`ALIGNMENT`], and an allocation flag in
//! the lowest bit. The payload immediately follows the header. Blocks tile
//! the region exactly: summing the sizes from the region's start lands on
//! each header in turn and ends exactly at the region's end.
//!
//! ## Invalid Pointers
//!
//! [`HeapAlloc::release`] and [`HeapAlloc::resize`] check that a pointer
//! names a live allocation before touching the heap, and ignore it (or fail)
//! otherwise. A double release is therefore harmless for both allocators.
//!
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

use core::{fmt, mem::MaybeUninit, ptr::NonNull};

mod block;
mod check;
mod dump;
mod error;
mod explicit;
mod implicit;
mod utils;
pub use self::{
    block::{align_up, Header, ALIGNMENT, HEADER_SIZE},
    check::{Corruption, NoTrap, Trap},
    error::InitError,
    explicit::ExplicitHeap,
    implicit::ImplicitHeap,
};

/// The allocate/release/resize contract shared by every heap in this crate.
pub trait HeapAlloc<'pool> {
    /// Establish the heap over a memory block specified by a slice pointer,
    /// discarding any prior state.
    ///
    /// The region's length is rounded down to a multiple of [`ALIGNMENT`]
    /// and the region is zero-filled. On success, the whole region is one
    /// free block. On failure, the heap is left uninitialized.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self`. It must be valid
    /// for reads and writes and must outlive `self`.
    unsafe fn init_ptr(&mut self, region: NonNull<[u8]>) -> Result<(), InitError>;

    /// Establish the heap over a memory block specified by a slice,
    /// discarding any prior state.
    ///
    /// See [`Self::init_ptr`].
    ///
    /// The memory block must outlive `self`:
    ///
    /// ```rust,compile_fail
    /// use flalloc::{ImplicitHeap, HeapAlloc};
    /// use std::mem::MaybeUninit;
    /// let mut heap: ImplicitHeap = ImplicitHeap::INIT;
    /// let mut pool = [MaybeUninit::uninit(); 1024];
    /// heap.init(&mut pool).unwrap();
    /// drop(pool); // dropping the memory block first is not allowed
    /// drop(heap);
    /// ```
    #[inline]
    fn init(&mut self, region: &'pool mut [MaybeUninit<u8>]) -> Result<(), InitError> {
        // Safety: `region` is a mutable reference, which guarantees the
        //         absence of aliasing references. Being `'pool` means it will
        //         outlive `self`.
        unsafe {
            self.init_ptr(NonNull::new_unchecked(
                region as *mut [MaybeUninit<u8>] as *mut [u8],
            ))
        }
    }

    /// Attempt to allocate a block with at least `size` bytes of payload.
    ///
    /// Returns the payload's starting address on success; `None` if `size`
    /// is zero or no free block is large enough.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Release an allocation. Pointers that don't name a live allocation are
    /// ignored.
    fn release(&mut self, ptr: NonNull<u8>);

    /// Shrink or grow an allocation.
    ///
    ///  - `ptr == None` is the same as [`Self::allocate`]`(new_size)`.
    ///  - `new_size == 0` is the same as [`Self::release`]`(ptr)` and returns
    ///    `None`.
    ///
    /// Shrinking never moves the allocation. Growing may; the first
    /// `min(old payload size, new_size)` bytes are preserved. Returns `None`
    /// if the allocation can't be grown or `ptr` doesn't name a live
    /// allocation, in which case the allocation is left untouched.
    fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>>;

    /// Get the number of payload bytes usable through `ptr`, or `None` if
    /// `ptr` doesn't name a live allocation.
    fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize>;

    /// Check the heap's structural consistency. On failure, the installed
    /// [`Trap`] is invoked before the [`Corruption`] is returned.
    ///
    /// This walks the whole heap and is meant for tests and debugging.
    fn validate(&mut self) -> Result<(), Corruption>;

    /// Write a line per block describing the heap's current state. Stops at
    /// the first block that can't be walked past safely.
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

#[cfg(any(test, feature = "std"))]
extern crate std;
