//! Block headers and the offset-based view of a heap region
use core::{
    debug_assert, fmt,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
};

use crate::{
    error::InitError,
    utils::{nonnull_slice_len, nonnull_slice_start},
};

cfg_if::cfg_if! {
    if #[cfg(feature = "align16")] {
        /// The alignment of every block, block size, and payload address.
        pub const ALIGNMENT: usize = 16;
    } else {
        /// The alignment of every block, block size, and payload address.
        ///
        /// It is the pointer width unless the `align16` feature is enabled.
        pub const ALIGNMENT: usize = mem::size_of::<usize>();
    }
}

/// The size of a block header. The header word is padded to [`ALIGNMENT`]
/// so that the payload following it stays aligned.
pub const HEADER_SIZE: usize = ALIGNMENT;

pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// The bit of a header indicating whether the block is allocated or not.
const HDR_USED: usize = 1;
/// The low bits of a header that can't be a part of a block size.
const HDR_FLAG_MASK: usize = ALIGNMENT - 1;
/// The bits of a header indicating the block's size.
const HDR_SIZE_MASK: usize = !HDR_FLAG_MASK;

/// Round `n` up to a multiple of [`ALIGNMENT`], saturating at `usize::MAX`
/// instead of wrapping around.
#[inline]
pub const fn align_up(n: usize) -> usize {
    if n > usize::MAX - HDR_FLAG_MASK {
        usize::MAX
    } else {
        (n + HDR_FLAG_MASK) & HDR_SIZE_MASK
    }
}

/// Calculate the total block size needed to serve a request of `request`
/// payload bytes. Returns `None` for a zero-sized request or on overflow.
#[inline]
pub(crate) fn block_size_for(request: usize, min_payload: usize) -> Option<usize> {
    if request == 0 {
        return None;
    }
    let payload = align_up(request.max(min_payload));
    if payload & HDR_FLAG_MASK != 0 {
        // `align_up` saturated
        return None;
    }
    payload.checked_add(HEADER_SIZE)
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// A block header: the total block size and the allocation flag packed into
/// one word.
///
/// ```svgbob
///   MSB                                             LSB
///  ,-----------------------------------+-----------+---,
///  |  size (multiple of ALIGNMENT)     | reserved  | U |
///  '-----------------------------------+-----------+---'
///                                                    |
///                                           1 = allocated
/// ```
///
/// The reserved bits are always zero in a well-formed header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Header(usize);

impl Header {
    #[inline]
    pub const fn new(size: usize, used: bool) -> Self {
        Self((size & HDR_SIZE_MASK) | if used { HDR_USED } else { 0 })
    }

    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// The size of the whole block, including the header.
    #[inline]
    pub const fn size(self) -> usize {
        self.0 & HDR_SIZE_MASK
    }

    #[inline]
    pub const fn is_used(self) -> bool {
        (self.0 & HDR_USED) != 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        !self.is_used()
    }

    /// Returns `true` if any of the bits that can't belong to a well-formed
    /// header is set, i.e., the raw size is not a multiple of [`ALIGNMENT`].
    #[inline]
    pub const fn has_reserved_bits(self) -> bool {
        (self.0 & HDR_FLAG_MASK & !HDR_USED) != 0
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("used", &self.is_used())
            .finish()
    }
}

/// An allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UsedBlock {
    pub offset: usize,
    pub size: usize,
}

/// A free block. Only free blocks give access to the free list links stored
/// in their payload (see `crate::explicit`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeBlock {
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Block {
    Used(UsedBlock),
    Free(FreeBlock),
}

/// The physical neighbor preceding a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrevPhys {
    /// The block is the first one in the region.
    None,
    Block(usize),
    /// No block starts at the given offset.
    NotABlock,
}

/// A heap region, addressed by byte offsets from its start.
///
/// The region is logically owned by the heap holding this `Region` for
/// `'pool`. Payload bytes of allocated blocks belong to the caller; `Region`
/// only touches them when asked to move a payload.
pub(crate) struct Region<'pool> {
    base: NonNull<u8>,
    size: usize,
    _phantom: PhantomData<&'pool mut [MaybeUninit<u8>]>,
}

impl fmt::Debug for Region<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

impl<'pool> Region<'pool> {
    /// Claim a memory block as a heap region, trimming its length down to a
    /// multiple of [`ALIGNMENT`] and zero-filling it.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes and must not be accessed
    /// through any other pointer for `'pool` except via the payload pointers
    /// handed out by the heap.
    pub(crate) unsafe fn claim(
        region: NonNull<[u8]>,
        min_block: usize,
    ) -> Result<Self, InitError> {
        let len = nonnull_slice_len(region);
        let base = nonnull_slice_start(region);
        let addr = base.as_ptr() as usize;

        if addr % ALIGNMENT != 0 {
            return Err(InitError::Misaligned { addr });
        }

        // Round down
        let size = len & HDR_SIZE_MASK;
        if size < min_block {
            return Err(InitError::TooSmall {
                size: len,
                min: min_block,
            });
        }

        if addr.checked_add(size).is_none() {
            return Err(InitError::Overflow { addr, size });
        }

        ptr::write_bytes(base.as_ptr(), 0, size);

        Ok(Self {
            base,
            size,
            _phantom: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// The address of the byte at `offset`.
    #[inline]
    pub(crate) fn address(&self, offset: usize) -> usize {
        self.base.as_ptr() as usize + offset
    }

    /// Returns `true` if a header could start at `offset`.
    #[inline]
    pub(crate) fn is_header_offset(&self, offset: usize) -> bool {
        offset % ALIGNMENT == 0
            && offset
                .checked_add(HEADER_SIZE)
                .map_or(false, |end| end <= self.size)
    }

    #[inline]
    pub(crate) fn word(&self, offset: usize) -> usize {
        debug_assert!(offset % WORD_SIZE == 0);
        debug_assert!(offset + WORD_SIZE <= self.size);
        // Safety: `offset` is in bounds and word-aligned, and the region was
        //         zero-filled when claimed
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().read() }
    }

    #[inline]
    pub(crate) fn set_word(&mut self, offset: usize, value: usize) {
        debug_assert!(offset % WORD_SIZE == 0);
        debug_assert!(offset + WORD_SIZE <= self.size);
        // Safety: `offset` is in bounds and word-aligned
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().write(value) }
    }

    #[inline]
    pub(crate) fn header(&self, offset: usize) -> Header {
        Header::from_raw(self.word(offset))
    }

    #[inline]
    pub(crate) fn set_header(&mut self, offset: usize, header: Header) {
        self.set_word(offset, header.raw());
    }

    #[inline]
    pub(crate) fn block(&self, offset: usize) -> Block {
        let header = self.header(offset);
        if header.is_used() {
            Block::Used(UsedBlock {
                offset,
                size: header.size(),
            })
        } else {
            Block::Free(FreeBlock {
                offset,
                size: header.size(),
            })
        }
    }

    /// The payload pointer of the block at `offset`.
    #[inline]
    pub(crate) fn payload(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(self.is_header_offset(offset));
        // Safety: `offset + HEADER_SIZE` is within the region (or one past
        //         its end), which starts at a non-null address
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset + HEADER_SIZE)) }
    }

    /// Find the header offset for a payload pointer. Returns `None` if the
    /// pointer can't be a payload pointer of this region.
    #[inline]
    pub(crate) fn block_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let offset = (ptr.as_ptr() as usize)
            .checked_sub(self.base.as_ptr() as usize)?
            .checked_sub(HEADER_SIZE)?;
        if self.is_header_offset(offset) {
            Some(offset)
        } else {
            None
        }
    }

    /// Check the header at `offset` for the shape of a live allocation: it
    /// must be well-formed, marked as allocated, and must not run past the
    /// region's end.
    fn used_header_at(&self, offset: usize, min_block: usize) -> Option<UsedBlock> {
        let header = self.header(offset);
        if header.is_free() || header.has_reserved_bits() || header.size() < min_block {
            return None;
        }
        if header.size() > self.size - offset {
            return None;
        }
        Some(UsedBlock {
            offset,
            size: header.size(),
        })
    }

    /// Find the block physically preceding the one at `offset` by walking
    /// the region from its start.
    fn prev_phys_block(&self, offset: usize) -> PrevPhys {
        let mut prev = None;
        for (block, _) in self.blocks() {
            if block == offset {
                return match prev {
                    Some(prev) => PrevPhys::Block(prev),
                    None => PrevPhys::None,
                };
            } else if block > offset {
                break;
            }
            prev = Some(block);
        }

        PrevPhys::NotABlock
    }

    /// Find the live allocation whose payload starts at `ptr`, along with
    /// the offset of the block physically preceding it.
    ///
    /// A header-shaped word inside some payload is not enough: the
    /// address-order walk must land on the block.
    pub(crate) fn live_block(
        &self,
        ptr: NonNull<u8>,
        min_block: usize,
    ) -> Option<(UsedBlock, Option<usize>)> {
        let offset = self.block_of(ptr)?;
        let block = self.used_header_at(offset, min_block)?;
        match self.prev_phys_block(offset) {
            PrevPhys::None => Some((block, None)),
            PrevPhys::Block(prev) => Some((block, Some(prev))),
            PrevPhys::NotABlock => None,
        }
    }

    /// Move `len` payload bytes from the block at `src` to the block at
    /// `dst`.
    #[inline]
    pub(crate) fn copy_payload(&mut self, src: usize, dst: usize, len: usize) {
        debug_assert!(src + HEADER_SIZE + len <= self.size);
        debug_assert!(dst + HEADER_SIZE + len <= self.size);
        // Safety: Both ranges are in bounds. `ptr::copy` tolerates overlap.
        unsafe {
            ptr::copy(
                self.payload(src).as_ptr(),
                self.payload(dst).as_ptr(),
                len,
            )
        };
    }

    /// Borrow `len` bytes starting at `offset` for inspection.
    #[inline]
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        // Safety: In bounds, and initialized because the region was
        //         zero-filled when claimed
        unsafe { core::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Iterate over blocks in address order.
    #[inline]
    pub(crate) fn blocks(&self) -> Blocks<'_, 'pool> {
        Blocks {
            region: self,
            offset: 0,
        }
    }
}

/// An iterator over `(offset, header)` of every block in address order.
///
/// The walk stops after a block whose size would not move it forward or
/// would carry it past the region's end, so it terminates on a corrupted
/// heap. Callers that care about such blocks must check the yielded headers.
pub(crate) struct Blocks<'a, 'pool> {
    region: &'a Region<'pool>,
    offset: usize,
}

impl Iterator for Blocks<'_, '_> {
    type Item = (usize, Header);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        if !self.region.is_header_offset(offset) {
            return None;
        }
        let header = self.region.header(offset);
        self.offset = if header.size() == 0 {
            usize::MAX
        } else {
            offset.saturating_add(header.size())
        };
        Some((offset, header))
    }
}
