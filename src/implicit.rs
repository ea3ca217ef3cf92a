//! The implicit free list allocator
use core::{
    debug_assert,
    fmt::{self, Write},
    ptr::NonNull,
};

use const_default1::ConstDefault;

use crate::{
    block::{block_size_for, Block, FreeBlock, Header, Region, ALIGNMENT, HEADER_SIZE},
    check::{self, Corruption, NoTrap, Trap},
    dump,
    error::InitError,
    HeapAlloc,
};

/// A heap whose blocks carry nothing but a size-and-flag header. Free blocks
/// are found by walking every block in address order.
///
///  - **Allocation** is first-fit over all blocks, allocated ones included.
///
///  - **Release** clears the allocation flag and does nothing else. Adjacent
///    free blocks are never merged, so a freed region may be too fragmented
///    to serve a request it has enough bytes for in total.
///
///  - **Release** of a pointer that is outside the region, misaligned, or not
///    currently allocated (e.g., a double release) is ignored.
///
///  - **Resize** shrinks in place but always relocates to grow.
pub struct ImplicitHeap<'pool, T = NoTrap> {
    region: Option<Region<'pool>>,
    trap: T,
}

// Safety: The region referenced by a particular instance of `ImplicitHeap` is
//         logically owned by that `ImplicitHeap` and every mutation requires
//         `&mut self`, so these are safe.
unsafe impl<T: Send> Send for ImplicitHeap<'_, T> {}

unsafe impl<T: Sync> Sync for ImplicitHeap<'_, T> {}

const MIN_PAYLOAD: usize = ALIGNMENT;

const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

impl<'pool, T: ConstDefault> ImplicitHeap<'pool, T> {
    /// A heap without a region. Every allocation fails until
    /// [`HeapAlloc::init`] is called.
    pub const INIT: Self = Self::with_trap(T::DEFAULT);
}

impl<T: Default> Default for ImplicitHeap<'_, T> {
    fn default() -> Self {
        Self::with_trap(T::default())
    }
}

impl<T> fmt::Debug for ImplicitHeap<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImplicitHeap")
            .field("region", &self.region)
            .finish()
    }
}

impl<'pool, T> ImplicitHeap<'pool, T> {
    /// The size of the smallest block, header included.
    pub const MIN_BLOCK: usize = MIN_BLOCK_SIZE;

    /// Construct an uninitialized heap that reports corruption to `trap`.
    pub const fn with_trap(trap: T) -> Self {
        Self { region: None, trap }
    }

    /// Get a reference to the installed [`Trap`].
    pub fn trap(&self) -> &T {
        &self.trap
    }
}

/// Shrink the allocated block at `offset` to `keep` bytes if the tail left
/// behind can form a block of its own. The tail becomes a free block.
fn split_off_tail(region: &mut Region<'_>, offset: usize, keep: usize) {
    let size = region.header(offset).size();
    debug_assert!(size >= keep);

    if size - keep >= MIN_BLOCK_SIZE {
        region.set_header(offset, Header::new(keep, true));
        region.set_header(offset + keep, Header::new(size - keep, false));
    }
}

impl<'pool, T: Trap> HeapAlloc<'pool> for ImplicitHeap<'pool, T> {
    unsafe fn init_ptr(&mut self, region: NonNull<[u8]>) -> Result<(), InitError> {
        self.region = None;

        let mut region = Region::claim(region, Self::MIN_BLOCK)?;

        // One big free block covering the entire region
        let size = region.size();
        region.set_header(0, Header::new(size, false));

        log::trace!("init: {:?}", region);
        self.region = Some(region);
        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let region = self.region.as_mut()?;
        let block_size = block_size_for(size, MIN_PAYLOAD)?;

        let fits = |block: &FreeBlock| {
            block.size >= block_size && block.size <= region.size() - block.offset
        };
        let block = region
            .blocks()
            .find_map(|(offset, _)| match region.block(offset) {
                Block::Free(block) if fits(&block) => Some(block),
                _ => None,
            })?;

        region.set_header(block.offset, Header::new(block.size, true));
        split_off_tail(region, block.offset, block_size);

        let ptr = region.payload(block.offset);
        log::trace!("allocate({}) = {:?}", size, ptr);
        Some(ptr)
    }

    fn release(&mut self, ptr: NonNull<u8>) {
        let region = if let Some(region) = self.region.as_mut() {
            region
        } else {
            return;
        };

        let (block, _) = if let Some(found) = region.live_block(ptr, Self::MIN_BLOCK) {
            found
        } else {
            log::debug!("release({:?}): not a live allocation; ignored", ptr);
            return;
        };

        log::trace!("release({:?}): {:?}", ptr, block);
        region.set_header(block.offset, Header::new(block.size, false));
    }

    fn resize(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let ptr = if let Some(ptr) = ptr {
            ptr
        } else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            self.release(ptr);
            return None;
        }

        let region = self.region.as_mut()?;
        let block = if let Some((block, _)) = region.live_block(ptr, Self::MIN_BLOCK) {
            block
        } else {
            log::debug!("resize({:?}, {}): not a live allocation", ptr, new_size);
            return None;
        };
        let block_size = block_size_for(new_size, MIN_PAYLOAD)?;

        if block_size <= block.size {
            log::trace!("resize({:?}, {}): shrink in place", ptr, new_size);
            split_off_tail(region, block.offset, block_size);
            return Some(ptr);
        }

        // Relocate. The old block stays intact if this fails.
        let new_ptr = self.allocate(new_size)?;
        let region = self.region.as_mut()?;
        let new_offset = region.block_of(new_ptr)?;
        region.copy_payload(
            block.offset,
            new_offset,
            (block.size - HEADER_SIZE).min(new_size),
        );
        self.release(ptr);

        log::trace!("resize({:?}, {}) = {:?}", ptr, new_size, new_ptr);
        Some(new_ptr)
    }

    fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let region = self.region.as_ref()?;
        let (block, _) = region.live_block(ptr, Self::MIN_BLOCK)?;
        Some(block.size - HEADER_SIZE)
    }

    fn validate(&mut self) -> Result<(), Corruption> {
        let result = match self.region.as_ref() {
            Some(region) => check::walk_blocks(region, Self::MIN_BLOCK, false).map(|_| ()),
            None => return Err(Corruption::Uninitialized),
        };

        match result {
            Ok(()) => Ok(()),
            Err(corruption) => check::fail(&mut self.trap, corruption),
        }
    }

    fn dump(&self, out: &mut dyn Write) -> fmt::Result {
        dump::write_banner(out, self.region.as_ref())?;
        let region = if let Some(region) = self.region.as_ref() {
            region
        } else {
            return Ok(());
        };

        for (index, (offset, header)) in region.blocks().enumerate() {
            dump::write_block(out, region, index, offset, header)?;
            writeln!(
                out,
                "  payload={:8}  next=0x{:x}",
                header.size().saturating_sub(HEADER_SIZE),
                region.address(offset).wrapping_add(header.size())
            )?;

            if header.size() > HEADER_SIZE {
                dump::write_preview(out, region, offset, header)?;
            }

            if dump::is_corrupt(region, offset, header, Self::MIN_BLOCK) {
                return dump::write_corrupt(out);
            }
        }

        writeln!(out, "end of heap")
    }
}
