//! Heap consistency checking
use core::fmt;

use crate::block::Region;

/// A structural inconsistency found by [`HeapAlloc::validate`].
///
/// Offsets are relative to the start of the heap region.
///
/// [`HeapAlloc::validate`]: crate::HeapAlloc::validate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The heap has not been initialized.
    Uninitialized,
    /// A header has bits set that can't be a part of an aligned size.
    MisalignedSize { offset: usize, raw: usize },
    /// A block is smaller than the minimum block size.
    BlockTooSmall { offset: usize, size: usize },
    /// A block extends past the end of the region.
    Overrun { offset: usize, size: usize },
    /// Two physically adjacent blocks are both free.
    AdjacentFree { offset: usize, next: usize },
    /// The block sizes don't add up to the region size.
    TilingMismatch { walked: usize, expected: usize },
    /// A free list node lies outside the region or off a header boundary.
    StrayFreeNode { node: usize },
    /// A free list node is marked as allocated.
    UsedBlockInFreeList { node: usize },
    /// A free list node's `prev` link doesn't name the node preceding it.
    BrokenFreeLink { node: usize },
    /// The free list loops back on itself.
    FreeListCycle { node: usize },
    /// The free list and the address-order walk disagree on the number of
    /// free blocks.
    FreeCountMismatch { linear: usize, listed: usize },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Uninitialized => write!(f, "heap is not initialized"),
            Self::MisalignedSize { offset, raw } => write!(
                f,
                "block at {}: header 0x{:x} has reserved bits set",
                offset, raw
            ),
            Self::BlockTooSmall { offset, size } => {
                write!(f, "block at {}: size {} is below the minimum", offset, size)
            }
            Self::Overrun { offset, size } => write!(
                f,
                "block at {}: size {} runs past the end of the region",
                offset, size
            ),
            Self::AdjacentFree { offset, next } => {
                write!(f, "free blocks at {} and {} are adjacent", offset, next)
            }
            Self::TilingMismatch { walked, expected } => write!(
                f,
                "blocks cover {} bytes of a {}-byte region",
                walked, expected
            ),
            Self::StrayFreeNode { node } => {
                write!(f, "free list node {} is not a block in the region", node)
            }
            Self::UsedBlockInFreeList { node } => {
                write!(f, "free list node {} is marked as allocated", node)
            }
            Self::BrokenFreeLink { node } => {
                write!(f, "free list node {} has an inconsistent prev link", node)
            }
            Self::FreeListCycle { node } => write!(f, "free list has a cycle at {}", node),
            Self::FreeCountMismatch { linear, listed } => write!(
                f,
                "{} free blocks in the region but {} in the free list",
                linear, listed
            ),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for Corruption {}

/// A hook invoked by [`HeapAlloc::validate`] at the moment it detects a
/// [`Corruption`], before it returns.
///
/// Any `FnMut(&Corruption)` is a `Trap`.
///
/// [`HeapAlloc::validate`]: crate::HeapAlloc::validate
pub trait Trap {
    fn trap(&mut self, corruption: &Corruption);
}

/// A [`Trap`] that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrap;

impl const_default1::ConstDefault for NoTrap {
    const DEFAULT: Self = Self;
}

impl Trap for NoTrap {
    #[inline]
    fn trap(&mut self, _: &Corruption) {}
}

impl<F: FnMut(&Corruption)> Trap for F {
    #[inline]
    fn trap(&mut self, corruption: &Corruption) {
        self(corruption)
    }
}

/// Report `corruption` through the log and `trap`, and hand it back as an
/// `Err`.
#[cold]
pub(crate) fn fail(trap: &mut impl Trap, corruption: Corruption) -> Result<(), Corruption> {
    log::error!("heap corruption: {}", corruption);
    trap.trap(&corruption);
    Err(corruption)
}

/// Walk every block in address order, checking that each one is well-formed
/// and that the blocks tile the region exactly. If `no_adjacent_free` is set,
/// two consecutive free blocks are a corruption as well.
///
/// Returns the number of free blocks.
pub(crate) fn walk_blocks(
    region: &Region<'_>,
    min_block: usize,
    no_adjacent_free: bool,
) -> Result<usize, Corruption> {
    let mut walked = 0usize;
    let mut num_free = 0;
    let mut prev_free = None;

    for (offset, header) in region.blocks() {
        let size = header.size();
        if header.has_reserved_bits() {
            return Err(Corruption::MisalignedSize {
                offset,
                raw: header.raw(),
            });
        }
        if size < min_block {
            return Err(Corruption::BlockTooSmall { offset, size });
        }
        if size > region.size() - offset {
            return Err(Corruption::Overrun { offset, size });
        }

        if header.is_free() {
            if let (true, Some(prev)) = (no_adjacent_free, prev_free) {
                return Err(Corruption::AdjacentFree {
                    offset: prev,
                    next: offset,
                });
            }
            num_free += 1;
            prev_free = Some(offset);
        } else {
            prev_free = None;
        }

        walked += size;
    }

    if walked != region.size() {
        return Err(Corruption::TilingMismatch {
            walked,
            expected: region.size(),
        });
    }

    Ok(num_free)
}
