//! Uncompressed-NSO rewriting.

use zerocopy::IntoBytes;

use crate::error::Result;
use crate::nx::{NsoFlags, NsoHeader, NxFile, SegmentKind};

/// Produces an NSO container holding the segments verbatim.
///
/// The compression flag bits are cleared and each segment's file offset
/// and size rewritten to describe the flat image that follows the header.
/// Running this on its own output is byte-identical.
pub fn write_uncompressed(nx: &NxFile) -> Result<Vec<u8>> {
    let mut header = nx.header;
    header.magic = crate::nx::NSO_MAGIC;
    header.flags &= !NsoFlags::COMPRESSED.bits();

    for i in 0..SegmentKind::COUNT {
        header.segments[i].file_offset = header.segments[i].mem_offset + NsoHeader::SIZE as u32;
        header.segment_file_sizes[i] = header.segments[i].mem_size;
    }
    header.segments[SegmentKind::Text as usize].bss_align = 0x100;
    header.segments[SegmentKind::Rodata as usize].bss_align = 0;

    // Flat image through the end of data; the bss tail stays implicit.
    let data = header.segment(SegmentKind::Data);
    let image_size = data.mem_end() as usize;

    let mut out = vec![0u8; NsoHeader::SIZE + image_size];
    out[..NsoHeader::SIZE].copy_from_slice(header.as_bytes());
    out[NsoHeader::SIZE..].copy_from_slice(&nx.image[..image_size]);

    Ok(out)
}
