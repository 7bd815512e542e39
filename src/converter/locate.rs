//! Heuristic locators for structures the containers do not describe.
//!
//! The containers record only three segments and a dynamic table; everything
//! else a disassembler expects (.plt, .got, .got.plt, .init, .fini, .note)
//! is recovered here by pattern matching over the memory image. The needles
//! live in one place so false negatives stay easy to audit; every miss is
//! handled by omitting the affected section.

use zerocopy::FromBytes;

use crate::elf::{Elf64Nhdr, Elf64Rela, R_AARCH64_GLOB_DAT, R_AARCH64_JUMP_SLOT};
use crate::nx::{DynInfo, NsoHeader, PltInfo, SegmentKind};
use crate::util;

// =============================================================================
// PLT
// =============================================================================

/// The 8-instruction AArch64 PLT header. The first entry fills two 4-word
/// slots (the resolver thunk), so a matched PLT is `32 + 16 * nslots` bytes.
const PLT_PATTERN: [u32; 8] = [
    0xa9bf7bf0, 0xd00004d0, 0xf9428a11, 0x91144210, 0xd61f0220, 0xd503201f, 0xd503201f, 0xd503201f,
];

/// Per-word match masks: word 1 is a wildcard (page-relative ADRP immediate),
/// words 2-4 match on the opcode byte only.
const PLT_PATTERN_MASK: [u32; 8] = [
    0xffffffff, 0x00000000, 0xff000000, 0xff000000, 0xff000000, 0xffffffff, 0xffffffff, 0xffffffff,
];

/// Searches `region` for the PLT header pattern.
///
/// `base` is the image-relative address of `region`; the returned
/// [`PltInfo`] is expressed in image-relative terms. The PLT is assumed to
/// exactly match `.rela.plt`, so its size is derived from `pltrelsz`.
/// Returns `None` when there are no PLT relocations or no match.
pub fn find_plt(region: &[u8], base: u64, pltrelsz: u64) -> Option<PltInfo> {
    if pltrelsz == 0 {
        return None;
    }
    let mut needle = [0u8; 32];
    let mut mask = [0u8; 32];
    for (i, (word, word_mask)) in PLT_PATTERN.iter().zip(&PLT_PATTERN_MASK).enumerate() {
        needle[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        mask[i * 4..i * 4 + 4].copy_from_slice(&word_mask.to_le_bytes());
    }
    let hit = util::find_masked(region, &needle, &mask)?;
    let entry_count = pltrelsz / Elf64Rela::SIZE as u64;
    Some(PltInfo {
        addr: base + hit as u64,
        size: 32 + 16 * entry_count,
    })
}

// =============================================================================
// Relocation Scans
// =============================================================================

/// Iterates the relocation table at image offset `addr` spanning `size`
/// bytes. Entries outside the image are silently dropped.
pub fn rela_entries(image: &[u8], addr: u64, size: u64) -> impl Iterator<Item = Elf64Rela> + '_ {
    let count = (size / Elf64Rela::SIZE as u64) as usize;
    (0..count).filter_map(move |i| {
        let off = addr as usize + i * Elf64Rela::SIZE;
        let bytes = util::slice_at(image, off, Elf64Rela::SIZE).ok()?;
        Elf64Rela::read_from_bytes(bytes).ok()
    })
}

/// Returns one past the last byte written by a `R_AARCH64_JUMP_SLOT`
/// relocation, or 0 when there are none. This is the end of `.got.plt`.
pub fn jump_slot_end(image: &[u8], dyn_info: &DynInfo) -> u64 {
    if dyn_info.jmprel == 0 {
        return 0;
    }
    rela_entries(image, dyn_info.jmprel, dyn_info.pltrelsz)
        .filter(|rela| rela.kind() == R_AARCH64_JUMP_SLOT)
        .map(|rela| rela.r_offset + 8)
        .max()
        .unwrap_or(0)
}

/// Returns one past the last byte written by a `R_AARCH64_GLOB_DAT`
/// relocation, starting from `floor`. This is the end of `.got`.
pub fn glob_dat_end(image: &[u8], dyn_info: &DynInfo, floor: u64) -> u64 {
    rela_entries(image, dyn_info.rela, dyn_info.relasz)
        .filter(|rela| rela.kind() == R_AARCH64_GLOB_DAT)
        .map(|rela| rela.r_offset + 8)
        .fold(floor, u64::max)
}

/// Locates `.got` by scanning from `search_from` for a pointer-sized slot
/// holding the image-relative offset of `.dynamic` (the reserved self
/// pointer at the head of the GOT).
pub fn find_got(image: &[u8], search_from: u64, dynamic_off: u64) -> Option<u64> {
    let tail = image.get(search_from as usize..)?;
    let hit = util::find(tail, &dynamic_off.to_le_bytes())?;
    Some(search_from + hit as u64)
}

// =============================================================================
// Init / Fini Extents
// =============================================================================

/// AArch64 `RET`.
const INSN_RET: u32 = 0xd65f03c0;
/// Opcode byte of an unconditional `B`.
const INSN_B_OPCODE: u8 = 0x14;
/// How many instructions of `.fini` to scan before giving up.
const FINI_SCAN_LIMIT: usize = 32;

/// Measures `.init`: the distance from `init` to one instruction past the
/// first `RET`. Returns `None` when no `RET` exists before the image ends.
pub fn init_size(image: &[u8], init: u64) -> Option<u64> {
    let mut off = init as usize;
    while off + 4 <= image.len() {
        if util::read_u32_at(image, off).ok()? == INSN_RET {
            return Some(off as u64 + 4 - init);
        }
        off += 4;
    }
    None
}

/// Measures `.fini`: the distance from `fini` to one instruction past the
/// first unconditional branch within the first 32 instructions. Returns
/// `None` when no branch is found, in which case `.fini` is omitted.
pub fn fini_size(image: &[u8], fini: u64) -> Option<u64> {
    for i in 0..FINI_SCAN_LIMIT {
        let off = fini as usize + i * 4;
        let insn = util::read_u32_at(image, off).ok()?;
        if (insn >> 24) as u8 == INSN_B_OPCODE {
            return Some((i as u64 + 1) * 4);
        }
    }
    None
}

// =============================================================================
// Build-Id Note
// =============================================================================

/// Builds the 16-byte needle for a GNU build-id note header: an
/// `Elf64_Nhdr` with the given descriptor length followed by the owner
/// string `"GNU\0"`.
fn build_id_needle(descsz: u32) -> [u8; 16] {
    let mut needle = [0u8; 16];
    needle[0..4].copy_from_slice(&4u32.to_le_bytes());
    needle[4..8].copy_from_slice(&descsz.to_le_bytes());
    needle[8..12].copy_from_slice(&crate::elf::NT_GNU_BUILD_ID.to_le_bytes());
    needle[12..16].copy_from_slice(b"GNU\0");
    needle
}

/// Locates the GNU build-id note, returning its image offset.
///
/// Searches rodata, then text, then data; within each segment the MD5-sized
/// needle is tried before the SHA1-sized one, taking the last occurrence.
/// The needles are structural (full note header plus owner), which keeps
/// false positives rare.
pub fn find_note(image: &[u8], header: &NsoHeader) -> Option<u64> {
    let md5 = build_id_needle(16);
    let sha1 = build_id_needle(20);
    for kind in [SegmentKind::Rodata, SegmentKind::Text, SegmentKind::Data] {
        let seg = header.segment(kind);
        let start = seg.mem_offset as usize;
        let end = (seg.mem_end() as usize).min(image.len());
        let Some(region) = image.get(start..end) else {
            continue;
        };
        for needle in [&md5, &sha1] {
            if let Some(hit) = util::find_reverse(region, needle) {
                return Some(start as u64 + hit as u64);
            }
        }
    }
    None
}

/// Returns the note's total in-image span: header plus owner and
/// descriptor bytes.
pub fn note_span(image: &[u8], note_off: u64) -> Option<u64> {
    let bytes = util::slice_at(image, note_off as usize, Elf64Nhdr::SIZE).ok()?;
    let nhdr = Elf64Nhdr::read_from_bytes(bytes).ok()?;
    Some(Elf64Nhdr::SIZE as u64 + u64::from(nhdr.n_namesz) + u64::from(nhdr.n_descsz))
}
