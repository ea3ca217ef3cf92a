use core::fmt;

/// The reason [`HeapAlloc::init`] rejected a region.
///
/// The heap is left uninitialized whenever one of these is returned.
///
/// [`HeapAlloc::init`]: crate::HeapAlloc::init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The region's starting address is not a multiple of
    /// [`ALIGNMENT`](crate::ALIGNMENT).
    Misaligned { addr: usize },
    /// After trimming to a multiple of the alignment, the region cannot hold
    /// a single minimum-sized block.
    TooSmall { size: usize, min: usize },
    /// `addr + size` does not fit in the address space.
    Overflow { addr: usize, size: usize },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Misaligned { addr } => write!(
                f,
                "region start 0x{:x} is not aligned to {} bytes",
                addr,
                crate::ALIGNMENT
            ),
            Self::TooSmall { size, min } => write!(
                f,
                "region of {} bytes is smaller than the minimum block ({} bytes)",
                size, min
            ),
            Self::Overflow { addr, size } => write!(
                f,
                "region 0x{:x} + {} bytes overflows the address space",
                addr, size
            ),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}
