//! Human-readable heap snapshots
use core::fmt::{self, Write};

use crate::block::{Header, Region, HEADER_SIZE};

/// The number of payload bytes shown per block by a preview.
const PREVIEW_BYTES: usize = 16;

pub(crate) fn write_banner(out: &mut dyn Write, region: Option<&Region<'_>>) -> fmt::Result {
    match region {
        Some(region) => writeln!(
            out,
            "heap [0x{:x} .. 0x{:x}) size={}",
            region.address(0),
            region.address(region.size()),
            region.size()
        ),
        None => writeln!(out, "heap not initialized"),
    }
}

/// Returns `true` if the block can't be walked past safely.
pub(crate) fn is_corrupt(
    region: &Region<'_>,
    offset: usize,
    header: Header,
    min_block: usize,
) -> bool {
    header.size() < min_block
        || header.has_reserved_bits()
        || header.size() > region.size() - offset
}

pub(crate) fn write_block(
    out: &mut dyn Write,
    region: &Region<'_>,
    index: usize,
    offset: usize,
    header: Header,
) -> fmt::Result {
    write!(
        out,
        "#{:04} off={:8}  hdr=0x{:x}  raw=0x{:016x}  size={:8}  {}",
        index,
        offset,
        region.address(offset),
        header.raw(),
        header.size(),
        if header.is_used() { "ALLOC" } else { "FREE " }
    )
}

/// Write a hex preview of the first bytes of a block's payload.
pub(crate) fn write_preview(
    out: &mut dyn Write,
    region: &Region<'_>,
    offset: usize,
    header: Header,
) -> fmt::Result {
    let payload_len = header
        .size()
        .min(region.size() - offset)
        .saturating_sub(HEADER_SIZE);
    let len = payload_len.min(PREVIEW_BYTES);

    write!(out, "    data:")?;
    for byte in region.bytes(offset + HEADER_SIZE, len) {
        write!(out, " {:02x}", byte)?;
    }
    if payload_len > len {
        write!(out, " ...")?;
    }
    writeln!(out)
}

pub(crate) fn write_corrupt(out: &mut dyn Write) -> fmt::Result {
    writeln!(out, "  !! corrupt block (size/alignment/overrun); stopping dump")
}
