//! The explicit free list allocator
use core::{
    debug_assert, debug_assert_eq,
    fmt::{self, Write},
    ptr::NonNull,
};

use const_default1::ConstDefault;

use crate::{
    block::{
        align_up, block_size_for, Block, FreeBlock, Header, Region, ALIGNMENT, HEADER_SIZE,
        WORD_SIZE,
    },
    check::{self, Corruption, NoTrap, Trap},
    dump,
    error::InitError,
    HeapAlloc,
};

#[cfg_attr(doc, svgbobdoc::transform)]
/// A heap that tracks its free blocks in an explicit, doubly-linked free
/// list threaded through the free blocks' payloads.
///
/// ```svgbob
///                 ,--------------------------------------------,
///                 |                                            v
///  +------+------+------+---------+------+-------------+------+------+------+-----+
///  | size | data | size | prev=∅  | next | ...         | size | data | size | ... |
///  |  U   |      |  F   |         |  •   |             |  U   |      |  F   |     |
///  +------+------+------+---------+------+-------------+------+------+------+-----+
///                   ^
///              free_head
/// ```
///
///  - **Allocation** is first-fit over the free list only, so its cost is
///    proportional to the number of free blocks.
///
///  - **Release** coalesces with both physical neighbors right away, so no two
///    adjacent blocks are ever free at the same time. The left neighbor is
///    found by walking the region from its start.
///
///  - **Resize** grows in place into a free right neighbor when possible.
///
/// Freed blocks are pushed to the front of the list, so the most recently
/// freed block is tried first.
pub struct ExplicitHeap<'pool, T = NoTrap> {
    region: Option<Region<'pool>>,
    free: FreeList,
    trap: T,
}

// Safety: The region referenced by a particular instance of `ExplicitHeap` is
//         logically owned by that `ExplicitHeap` and every mutation requires
//         `&mut self`, so these are safe.
unsafe impl<T: Send> Send for ExplicitHeap<'_, T> {}

unsafe impl<T: Sync> Sync for ExplicitHeap<'_, T> {}

/// The free list link value standing for "no block".
const NIL: usize = usize::MAX;

/// The smallest payload of a block. It must be able to hold the free list
/// links once the block is freed.
const MIN_PAYLOAD: usize = {
    let links = align_up(2 * WORD_SIZE);
    if links > ALIGNMENT {
        links
    } else {
        ALIGNMENT
    }
};

const MIN_BLOCK_SIZE: usize = HEADER_SIZE + MIN_PAYLOAD;

impl<'pool, T: ConstDefault> ExplicitHeap<'pool, T> {
    /// A heap without a region. Every allocation fails until
    /// [`HeapAlloc::init`] is called.
    pub const INIT: Self = Self::with_trap(T::DEFAULT);
}

impl<T: Default> Default for ExplicitHeap<'_, T> {
    fn default() -> Self {
        Self::with_trap(T::default())
    }
}

impl<T> fmt::Debug for ExplicitHeap<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitHeap")
            .field("region", &self.region)
            .field("free_head", &self.free.head)
            .finish()
    }
}

impl<'pool, T> ExplicitHeap<'pool, T> {
    /// The size of the smallest block, header included.
    pub const MIN_BLOCK: usize = MIN_BLOCK_SIZE;

    /// Construct an uninitialized heap that reports corruption to `trap`.
    pub const fn with_trap(trap: T) -> Self {
        Self {
            region: None,
            free: FreeList { head: None },
            trap,
        }
    }

    /// Get a reference to the installed [`Trap`].
    pub fn trap(&self) -> &T {
        &self.trap
    }
}

/// The `prev`/`next` links stored at the start of a free block's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

#[inline]
fn encode_link(link: Option<usize>) -> usize {
    link.unwrap_or(NIL)
}

#[inline]
fn decode_link(word: usize) -> Option<usize> {
    if word == NIL {
        None
    } else {
        Some(word)
    }
}

impl FreeBlock {
    #[inline]
    fn prev_link_offset(self) -> usize {
        self.offset + HEADER_SIZE
    }

    #[inline]
    fn next_link_offset(self) -> usize {
        self.offset + HEADER_SIZE + WORD_SIZE
    }

    #[inline]
    fn links(self, region: &Region<'_>) -> Links {
        Links {
            prev: decode_link(region.word(self.prev_link_offset())),
            next: decode_link(region.word(self.next_link_offset())),
        }
    }

    #[inline]
    fn set_prev(self, region: &mut Region<'_>, prev: Option<usize>) {
        region.set_word(self.prev_link_offset(), encode_link(prev));
    }

    #[inline]
    fn set_next(self, region: &mut Region<'_>, next: Option<usize>) {
        region.set_word(self.next_link_offset(), encode_link(next));
    }
}

/// Get the free block at `offset`, which is known to be a free list member.
#[inline]
fn free_block_at(region: &Region<'_>, offset: usize) -> FreeBlock {
    match region.block(offset) {
        Block::Free(block) => block,
        Block::Used(block) => {
            debug_assert!(false, "{:?} is in the free list", block);
            FreeBlock {
                offset,
                size: block.size,
            }
        }
    }
}

/// Returns `true` if `offset` names a block whose header and links lie
/// within the region.
#[inline]
fn is_node(region: &Region<'_>, offset: usize) -> bool {
    region.is_header_offset(offset) && region.size() - offset >= MIN_BLOCK_SIZE
}

/// The free list: an unordered, doubly-linked list of every free block.
#[derive(Debug)]
struct FreeList {
    head: Option<usize>,
}

impl FreeList {
    /// Push `block` to the front of the list.
    ///
    /// `block` must not currently be in the list.
    fn link_free_block(&mut self, region: &mut Region<'_>, block: FreeBlock) {
        block.set_prev(region, None);
        block.set_next(region, self.head);
        if let Some(head) = self.head {
            free_block_at(region, head).set_prev(region, Some(block.offset));
        }
        self.head = Some(block.offset);
    }

    /// Remove `block` from the list and clear its links.
    ///
    /// `block` must currently be in the list.
    fn unlink_free_block(&mut self, region: &mut Region<'_>, block: FreeBlock) {
        let Links { prev, next } = block.links(region);

        if let Some(prev) = prev {
            free_block_at(region, prev).set_next(region, next);
        } else {
            debug_assert_eq!(self.head, Some(block.offset));
            self.head = next;
        }

        if let Some(next) = next {
            free_block_at(region, next).set_prev(region, prev);
        }

        block.set_prev(region, None);
        block.set_next(region, None);
    }

    /// Merge every free block physically following the free block at
    /// `offset` into it. Returns the resulting block.
    fn coalesce_right(&mut self, region: &mut Region<'_>, offset: usize) -> FreeBlock {
        let mut size = region.header(offset).size();
        debug_assert!(region.header(offset).is_free());

        loop {
            let next = offset + size;
            if next >= region.size() {
                break;
            }
            match region.block(next) {
                Block::Free(next_block) => {
                    self.unlink_free_block(region, next_block);
                    size += next_block.size;
                    region.set_header(offset, Header::new(size, false));
                }
                Block::Used(_) => break,
            }
        }

        FreeBlock { offset, size }
    }

    /// Shrink the allocated block at `offset` to `keep` bytes if the tail
    /// left behind can form a block of its own. The tail is freed and merged
    /// with whatever free blocks follow it.
    fn split_off_tail(&mut self, region: &mut Region<'_>, offset: usize, keep: usize) {
        let size = region.header(offset).size();
        debug_assert!(region.header(offset).is_used());
        debug_assert!(size >= keep);

        if size - keep < MIN_BLOCK_SIZE {
            return;
        }

        region.set_header(offset, Header::new(keep, true));

        let tail = FreeBlock {
            offset: offset + keep,
            size: size - keep,
        };
        region.set_header(tail.offset, Header::new(tail.size, false));
        self.link_free_block(region, tail);
        self.coalesce_right(region, tail.offset);
    }

    /// Find the first free block at least `size` bytes large.
    fn find_first_fit(&self, region: &Region<'_>, size: usize) -> Option<FreeBlock> {
        let mut cursor = self.head;
        while let Some(offset) = cursor {
            let block = free_block_at(region, offset);
            if block.size >= size {
                return Some(block);
            }
            cursor = block.links(region).next;
        }
        None
    }

    /// Walk the list from its head, checking each node against the region.
    /// Detects cycles with a slow/fast cursor pair.
    ///
    /// Returns the number of nodes.
    fn check(&self, region: &Region<'_>) -> Result<usize, Corruption> {
        // Advance a cursor by one node without trusting the node
        let step = |cursor: Option<usize>| -> Option<usize> {
            let node = cursor?;
            if !is_node(region, node) {
                return None;
            }
            decode_link(region.word(node + HEADER_SIZE + WORD_SIZE))
        };

        let mut count = 0;
        let mut prev = None;
        let mut slow = self.head;
        let mut fast = self.head;

        while let Some(node) = slow {
            if !is_node(region, node) {
                return Err(Corruption::StrayFreeNode { node });
            }
            let block = match region.block(node) {
                Block::Free(block) => block,
                Block::Used(_) => return Err(Corruption::UsedBlockInFreeList { node }),
            };
            let links = block.links(region);
            if links.prev != prev {
                return Err(Corruption::BrokenFreeLink { node });
            }

            count += 1;
            prev = Some(node);
            slow = links.next;

            fast = step(step(fast));
            if let (Some(slow), Some(fast)) = (slow, fast) {
                if slow == fast {
                    return Err(Corruption::FreeListCycle { node: slow });
                }
            }
        }

        Ok(count)
    }
}

impl<'pool, T: Trap> ExplicitHeap<'pool, T> {
    /// Take `block` out of the free list and hand out its front `size`
    /// bytes.
    fn allocate_from_free(
        free: &mut FreeList,
        region: &mut Region<'pool>,
        block: FreeBlock,
        size: usize,
    ) -> NonNull<u8> {
        free.unlink_free_block(region, block);
        region.set_header(block.offset, Header::new(block.size, true));
        free.split_off_tail(region, block.offset, size);
        region.payload(block.offset)
    }

    /// Try to make the allocated block at `offset` at least `size` bytes
    /// large by absorbing the free blocks that follow it. Nothing is changed
    /// if they are not enough.
    fn grow_in_place(
        free: &mut FreeList,
        region: &mut Region<'pool>,
        offset: usize,
        size: usize,
    ) -> bool {
        let old_size = region.header(offset).size();

        // Measure first so that a failed attempt leaves the layout untouched
        let mut available = old_size;
        while available < size {
            let next = offset + available;
            if next >= region.size() {
                break;
            }
            match region.block(next) {
                Block::Free(block) => available += block.size,
                Block::Used(_) => break,
            }
        }
        if available < size {
            return false;
        }

        let mut cur = old_size;
        while cur < size {
            let block = free_block_at(region, offset + cur);
            free.unlink_free_block(region, block);
            cur += block.size;
        }
        region.set_header(offset, Header::new(cur, true));

        free.split_off_tail(region, offset, size);
        true
    }
}

impl<'pool, T: Trap> HeapAlloc<'pool> for ExplicitHeap<'pool, T> {
    unsafe fn init_ptr(&mut self, region: NonNull<[u8]>) -> Result<(), InitError> {
        self.region = None;
        self.free.head = None;

        let mut region = Region::claim(region, Self::MIN_BLOCK)?;

        let block = FreeBlock {
            offset: 0,
            size: region.size(),
        };
        region.set_header(0, Header::new(block.size, false));
        self.free.link_free_block(&mut region, block);

        log::trace!("init: {:?}", region);
        self.region = Some(region);
        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let region = self.region.as_mut()?;
        let block_size = block_size_for(size, MIN_PAYLOAD)?;

        let block = self.free.find_first_fit(region, block_size)?;
        let ptr = Self::allocate_from_free(&mut self.free, region, block, block_size);

        log::trace!("allocate({}) = {:?}", size, ptr);
        Some(ptr)
    }

    fn release(&mut self, ptr: NonNull<u8>) {
        let region = if let Some(region) = self.region.as_mut() {
            region
        } else {
            return;
        };

        let (block, left) = if let Some(found) = region.live_block(ptr, Self::MIN_BLOCK) {
            found
        } else {
            log::warn!("release({:?}): not a live allocation; ignored", ptr);
            return;
        };
        log::trace!("release({:?}): {:?}", ptr, block);

        region.set_header(block.offset, Header::new(block.size, false));

        let merged = match left {
            Some(left) if region.header(left).is_free() => {
                // `left` is already in the free list; the released block
                // never enters it
                let size = region.header(left).size() + block.size;
                region.set_header(left, Header::new(size, false));
                left
            }
            _ => {
                self.free.link_free_block(
                    region,
                    FreeBlock {
                        offset: block.offset,
                        size: block.size,
                    },
                );
                block.offset
            }
        };

        self.free.coalesce_right(region, merged);
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
            log::warn!("resize({:?}, {}): not a live allocation", ptr, new_size);
            return None;
        };
        let block_size = block_size_for(new_size, MIN_PAYLOAD)?;

        if block_size <= block.size {
            log::trace!("resize({:?}, {}): shrink in place", ptr, new_size);
            self.free.split_off_tail(region, block.offset, block_size);
            return Some(ptr);
        }

        if Self::grow_in_place(&mut self.free, region, block.offset, block_size) {
            log::trace!("resize({:?}, {}): grow in place", ptr, new_size);
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
        let region = if let Some(region) = self.region.as_ref() {
            region
        } else {
            return Err(Corruption::Uninitialized);
        };

        let result = check::walk_blocks(region, Self::MIN_BLOCK, true).and_then(|linear| {
            let listed = self.free.check(region)?;
            if linear == listed {
                Ok(())
            } else {
                Err(Corruption::FreeCountMismatch { linear, listed })
            }
        });

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
        match self.free.head {
            Some(head) => writeln!(out, "free_head=0x{:x}", region.address(head))?,
            None => writeln!(out, "free_head=-")?,
        }

        for (index, (offset, header)) in region.blocks().enumerate() {
            dump::write_block(out, region, index, offset, header)?;
            if dump::is_corrupt(region, offset, header, Self::MIN_BLOCK) {
                writeln!(out)?;
                return dump::write_corrupt(out);
            }

            if header.is_free() {
                let links = FreeBlock {
                    offset,
                    size: header.size(),
                }
                .links(region);
                let show = |link: Option<usize>| link.map(|o| region.address(o));
                writeln!(
                    out,
                    "  prev={:x?} next={:x?}",
                    show(links.prev),
                    show(links.next)
                )?;
            } else {
                writeln!(out)?;
            }
        }

        writeln!(out, "end of heap")
    }
}

#[cfg(test)]
mod tests;
