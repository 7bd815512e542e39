//! NX image container structures.
//!
//! These structures match the on-disk format of the three observed container
//! shapes: NSO (compressed, header-prefixed), NRO (flat in-memory image with
//! its own header at file offset 0x10), and raw MOD (a bare image whose only
//! descriptor is the `MOD0` header pointed to by the word at offset 4).
//! They are designed for zero-copy parsing using the `zerocopy` crate.

use std::fmt;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// NSO container magic.
pub const NSO_MAGIC: [u8; 4] = *b"NSO0";
/// NRO container magic.
pub const NRO_MAGIC: [u8; 4] = *b"NRO0";
/// MOD descriptor magic.
pub const MOD_MAGIC: [u8; 4] = *b"MOD0";

/// File offset of the NRO header (the `ModPointer` aligned up to 0x10).
pub const NRO_HEADER_OFFSET: usize = 0x10;

/// The detected container shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Header-prefixed, per-segment LZ4 compression.
    Nso,
    /// Flat memory image with a header at file offset 0x10.
    Nro,
    /// Bare memory image; only the MOD0 descriptor is present.
    Mod,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Nso => write!(f, "NSO"),
            FileKind::Nro => write!(f, "NRO"),
            FileKind::Mod => write!(f, "MOD"),
        }
    }
}

/// The three image segments, in fixed memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Executable code.
    Text = 0,
    /// Read-only data (holds .dynstr/.dynsym and usually MOD0).
    Rodata = 1,
    /// Writable data, followed in memory by the zero-initialized tail.
    Data = 2,
}

impl SegmentKind {
    /// Number of segments in an image.
    pub const COUNT: usize = 3;

    /// All segment kinds in memory order.
    pub const ALL: [SegmentKind; 3] = [SegmentKind::Text, SegmentKind::Rodata, SegmentKind::Data];

    /// Conventional protection string for the dump output.
    pub fn prot(self) -> &'static str {
        match self {
            SegmentKind::Text => "r-x",
            SegmentKind::Rodata => "r--",
            SegmentKind::Data => "rw-",
        }
    }
}

bitflags! {
    /// NSO header flag word. Bit i set means segment i is LZ4-compressed;
    /// bits 3..6 request digest checks (retained, never validated here).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsoFlags: u32 {
        const TEXT_COMPRESSED = 1 << 0;
        const RODATA_COMPRESSED = 1 << 1;
        const DATA_COMPRESSED = 1 << 2;
        const TEXT_CHECK_HASH = 1 << 3;
        const RODATA_CHECK_HASH = 1 << 4;
        const DATA_CHECK_HASH = 1 << 5;
        const COMPRESSED = Self::TEXT_COMPRESSED.bits()
            | Self::RODATA_COMPRESSED.bits()
            | Self::DATA_COMPRESSED.bits();
    }
}

// =============================================================================
// Header Structures
// =============================================================================

/// Per-segment descriptor in the NSO header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentHeader {
    /// File offset of the (possibly compressed) segment bytes
    pub file_offset: u32,
    /// Offset of the segment in the loaded image
    pub mem_offset: u32,
    /// Size of the segment in the loaded image
    pub mem_size: u32,
    /// For data: size of the zero-initialized tail; for text/rodata: a
    /// required alignment pad
    pub bss_align: u32,
}

impl SegmentHeader {
    /// End of the segment in the loaded image.
    #[inline]
    pub fn mem_end(&self) -> u64 {
        u64::from(self.mem_offset) + u64::from(self.mem_size)
    }

    /// Returns true if `addr` falls within the segment's in-memory range.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= u64::from(self.mem_offset) && addr < self.mem_end()
    }
}

/// An (offset, size) pair describing a region of the image or of a segment.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DataExtent {
    /// Region offset
    pub offset: u32,
    /// Region size
    pub size: u32,
}

/// NSO file header (0x100 bytes).
///
/// NRO and raw MOD inputs are translated into this form at load time, so the
/// rest of the pipeline only ever sees NSO-shaped metadata.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct NsoHeader {
    /// Magic "NSO0"
    pub magic: [u8; 4],
    /// Reserved
    pub version: u32,
    /// Reserved
    pub reserved_8: u32,
    /// Compression and digest-check flags (see [`NsoFlags`])
    pub flags: u32,
    /// Segment descriptors, memory order
    pub segments: [SegmentHeader; SegmentKind::COUNT],
    /// GNU build-id bytes (actual note length varies)
    pub gnu_build_id: [u8; 32],
    /// On-disk size of each segment's bytes
    pub segment_file_sizes: [u32; SegmentKind::COUNT],
    /// Reserved
    pub reserved_6c: [u32; 9],
    /// .dynstr extent, relative to rodata
    pub dynstr: DataExtent,
    /// .dynsym extent, relative to rodata
    pub dynsym: DataExtent,
    /// SHA-256 digest of each decompressed segment (never validated here)
    pub segment_digests: [[u8; 32]; SegmentKind::COUNT],
}

impl NsoHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 0x100;

    /// Returns an all-zero header to be filled by a translating loader.
    pub fn empty() -> Self {
        Self {
            magic: NSO_MAGIC,
            version: 0,
            reserved_8: 0,
            flags: 0,
            segments: [SegmentHeader::default(); SegmentKind::COUNT],
            gnu_build_id: [0; 32],
            segment_file_sizes: [0; SegmentKind::COUNT],
            reserved_6c: [0; 9],
            dynstr: DataExtent::default(),
            dynsym: DataExtent::default(),
            segment_digests: [[0; 32]; SegmentKind::COUNT],
        }
    }

    /// Returns true if segment `i` is LZ4-compressed on disk.
    #[inline]
    pub fn is_compressed(&self, i: usize) -> bool {
        self.flags & (1 << i) != 0
    }

    /// Returns the segment descriptor for `kind`.
    #[inline]
    pub fn segment(&self, kind: SegmentKind) -> &SegmentHeader {
        &self.segments[kind as usize]
    }

    /// Total size of the loaded image, including the data tail.
    #[inline]
    pub fn image_size(&self) -> u64 {
        let data = self.segment(SegmentKind::Data);
        data.mem_end() + u64::from(data.bss_align)
    }
}

/// NRO file header (0x70 bytes, at file offset 0x10).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct NroHeader {
    /// Magic "NRO0"
    pub magic: [u8; 4],
    /// Reserved
    pub version: u32,
    /// Total file size; must equal the on-disk length
    pub file_size: u32,
    /// Reserved
    pub reserved_c: u32,
    /// Segment extents; file offset equals memory offset
    pub segments: [DataExtent; SegmentKind::COUNT],
    /// Size of the zero-initialized tail after data
    pub bss_size: u32,
    /// Reserved
    pub reserved_3c: u32,
    /// GNU build-id bytes
    pub gnu_build_id: [u8; 32],
    /// Reserved
    pub reserved_60: [u32; 4],
    /// .dynstr extent, relative to rodata
    pub dynstr: DataExtent,
    /// .dynsym extent, relative to rodata
    pub dynsym: DataExtent,
}

impl NroHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 0x70;
}

/// The two words at image offset 0; the second points at the MOD0 header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ModPointer {
    /// Reserved
    pub reserved: u32,
    /// Absolute image offset of the MOD0 header
    pub magic_offset: u32,
}

impl ModPointer {
    /// Size of the pointer pair in bytes.
    pub const SIZE: usize = 8;
}

/// MOD0 header. All offsets are signed and relative to the header itself.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ModHeader {
    /// Magic "MOD0"
    pub magic: [u8; 4],
    /// Offset to the dynamic table
    pub dynamic_offset: i32,
    /// Offset to the start of bss
    pub bss_start_offset: i32,
    /// Offset to the end of bss
    pub bss_end_offset: i32,
    /// Offset to the start of .eh_frame_hdr
    pub eh_start_offset: i32,
    /// Offset to the end of .eh_frame_hdr
    pub eh_end_offset: i32,
    /// Offset to the runtime module object
    pub module_object_offset: i32,
}

impl ModHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

// =============================================================================
// Decoded Summaries
// =============================================================================

/// The decoded subset of the dynamic table consumed by the synthesizer.
///
/// Each field is an image-relative virtual address or a byte size; zero
/// means the tag was absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynInfo {
    /// DT_SYMTAB
    pub symtab: u64,
    /// DT_RELA
    pub rela: u64,
    /// DT_RELASZ
    pub relasz: u64,
    /// DT_JMPREL
    pub jmprel: u64,
    /// DT_PLTRELSZ
    pub pltrelsz: u64,
    /// DT_STRTAB
    pub strtab: u64,
    /// DT_STRSZ
    pub strsz: u64,
    /// DT_PLTGOT
    pub pltgot: u64,
    /// DT_HASH
    pub hash: u64,
    /// DT_GNU_HASH
    pub gnu_hash: u64,
    /// DT_INIT
    pub init: u64,
    /// DT_FINI
    pub fini: u64,
    /// DT_INIT_ARRAY
    pub init_array: u64,
    /// DT_INIT_ARRAYSZ
    pub init_arraysz: u64,
    /// DT_FINI_ARRAY
    pub fini_array: u64,
    /// DT_FINI_ARRAYSZ
    pub fini_arraysz: u64,
}

/// Location and size of the PLT, in image-relative virtual address space.
#[derive(Debug, Clone, Copy)]
pub struct PltInfo {
    /// Start of the 8-instruction PLT header pattern
    pub addr: u64,
    /// `32 + 16 * (pltrelsz / sizeof(Rela))`
    pub size: u64,
}

/// Exception-frame extents, in image-relative virtual address space.
#[derive(Debug, Clone, Copy, Default)]
pub struct EhInfo {
    /// Start of .eh_frame_hdr
    pub hdr_addr: u64,
    /// Size of .eh_frame_hdr (rounded up to 0x10 once measured)
    pub hdr_size: u64,
    /// Start of .eh_frame
    pub frame_addr: u64,
    /// Size of .eh_frame through its terminator (rounded up to 0x10)
    pub frame_size: u64,
}
