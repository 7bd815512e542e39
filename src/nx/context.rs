//! NX container loading.
//!
//! [`NxFile`] owns the flat memory image for the lifetime of one conversion.
//! All three container shapes are normalized into the same NSO-shaped header
//! at load time; every derived location is kept as a byte offset into the
//! image, never a pointer.

use std::fs;
use std::path::Path;

use tracing::debug;
use zerocopy::FromBytes;

use crate::converter::locate;
use crate::elf::{Elf64Dyn, Elf64Nhdr, Elf64Sym, SHN_LORESERVE, SHN_UNDEF, STT_SECTION};
use crate::elf::{
    DT_FINI, DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_GNU_HASH, DT_HASH, DT_INIT, DT_INIT_ARRAY,
    DT_INIT_ARRAYSZ, DT_JMPREL, DT_NULL, DT_PLTGOT, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRSZ,
    DT_STRTAB, DT_SYMTAB,
};
use crate::error::{Error, Result};
use crate::nx::structs::*;
use crate::util::{self, align_up};

/// A loaded NX image: the materialized memory view plus everything decoded
/// from the container and the MOD0 descriptor.
#[derive(Debug)]
pub struct NxFile {
    /// Detected container shape
    pub kind: FileKind,
    /// NSO-shaped metadata (translated for NRO and raw MOD)
    pub header: NsoHeader,
    /// The flat post-load memory view: text, rodata, data
    pub image: Vec<u8>,
    /// Image offset of the MOD0 header
    pub mod_off: u64,
    /// Image offset of the dynamic table
    pub dynamic_off: u64,
    /// Dynamic entry count, including the terminator
    pub dyn_entries: usize,
    /// Decoded dynamic-table summary
    pub dyn_info: DynInfo,
    /// PLT location, when the header pattern matched
    pub plt_info: Option<PltInfo>,
    /// Image offset of the GNU build-id note, when found
    pub note_off: Option<u64>,
    /// Image offset of .eh_frame_hdr, from the MOD0 header
    pub eh_hdr_addr: u64,
    /// Size of .eh_frame_hdr, from the MOD0 header
    pub eh_hdr_size: u64,
}

impl NxFile {
    /// Loads and materializes an NX image from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::read(path).map_err(|e| Error::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_bytes(file)
    }

    /// Materializes an NX image from raw container bytes.
    pub fn from_bytes(file: Vec<u8>) -> Result<Self> {
        let (kind, mut header, image) = detect(file)?;
        debug!(kind = %kind, image_size = image.len(), "materialized image");

        // The word at image offset 4 points at the MOD0 header.
        let mod_ptr = ModPointer::read_from_bytes(
            util::slice_at(&image, 0, ModPointer::SIZE)
                .map_err(|_| Error::corrupt("image too small for MOD pointer"))?,
        )
        .map_err(|_| Error::corrupt("image too small for MOD pointer"))?;
        let mod_off = u64::from(mod_ptr.magic_offset);
        let mod_header = read_mod_header(&image, mod_off)?;

        let mod_rel = |rel: i32| (mod_off as i64 + i64::from(rel)) as u64;
        let dynamic_off = mod_rel(mod_header.dynamic_offset);
        let (dyn_info, dyn_entries) = parse_dynamic(&image, dynamic_off)?;

        let mut nx = NxFile {
            kind,
            header,
            image,
            mod_off,
            dynamic_off,
            dyn_entries,
            dyn_info,
            plt_info: None,
            note_off: None,
            eh_hdr_addr: mod_rel(mod_header.eh_start_offset),
            eh_hdr_size: mod_rel(mod_header.eh_end_offset)
                .saturating_sub(mod_rel(mod_header.eh_start_offset)),
        };

        match kind {
            FileKind::Nso | FileKind::Nro => {
                let text = nx.header.segment(SegmentKind::Text);
                let start = text.mem_offset as usize;
                let end = (text.mem_end() as usize).min(nx.image.len());
                if start < end {
                    nx.plt_info = locate::find_plt(
                        &nx.image[start..end],
                        u64::from(text.mem_offset),
                        nx.dyn_info.pltrelsz,
                    );
                }
            }
            FileKind::Mod => {
                let bss_start = mod_rel(mod_header.bss_start_offset);
                let bss_end = mod_rel(mod_header.bss_end_offset);
                header = nx.reconstruct_mod_segments(bss_start, bss_end)?;
                nx.header = header;
            }
        }

        nx.note_off = locate::find_note(&nx.image, &nx.header);

        // A bare MOD has no header to carry the build id; capture it from
        // the note when one was found.
        if nx.kind == FileKind::Mod {
            if let Some(note_off) = nx.note_off {
                nx.capture_build_id(note_off);
            }
        }

        Ok(nx)
    }

    /// Reconstructs the three segment descriptors for a raw MOD image,
    /// which carries no segment metadata at all.
    ///
    /// Relies on the PLT ending the text segment, `.dynstr` directly
    /// following `.dynsym`, and a `.dynsym` section symbol marking the
    /// start of data.
    fn reconstruct_mod_segments(&mut self, bss_start: u64, bss_end: u64) -> Result<NsoHeader> {
        let plt = locate::find_plt(&self.image, 0, self.dyn_info.pltrelsz)
            .ok_or(Error::MissingPlt)?;
        self.plt_info = Some(plt);

        if self.dyn_info.symtab >= self.dyn_info.strtab {
            return Err(Error::BadLayout {
                reason: ".dynstr does not directly follow .dynsym",
            });
        }
        let mut header = self.header;
        // Needed up front so the dynsym iteration below has a length.
        header.dynsym.size = (self.dyn_info.strtab - self.dyn_info.symtab) as u32;
        self.header = header;

        // Every segment is expected to have at least one symbol pointing
        // into it: text, rodata, data, bss in ascending index order.
        let mut seen_shndx: Vec<u16> = self
            .dynsym_entries()
            .filter(|sym| sym.st_shndx > SHN_UNDEF && sym.st_shndx < SHN_LORESERVE)
            .map(|sym| sym.st_shndx)
            .collect();
        seen_shndx.sort_unstable();
        seen_shndx.dedup();
        if seen_shndx.len() != SegmentKind::COUNT + 1 {
            return Err(Error::BadLayout {
                reason: "expected exactly four section indices in .dynsym",
            });
        }

        let data_shndx = seen_shndx[SegmentKind::Data as usize];
        let data_offset = self
            .dynsym_entries()
            .find(|sym| sym.kind() == STT_SECTION && sym.st_shndx == data_shndx)
            .map(|sym| sym.st_value)
            .filter(|&value| value != 0)
            .ok_or(Error::BadLayout {
                reason: "no .dynsym section symbol for .data",
            })?;

        let text_size = plt.addr + plt.size;
        let rodata_offset = align_up(text_size, 0x1000);
        let image_size = self.image.len() as u64;
        if data_offset <= rodata_offset || data_offset > image_size {
            return Err(Error::BadLayout {
                reason: ".data start does not follow .rodata",
            });
        }

        let offsets = [0, rodata_offset, data_offset];
        let sizes = [text_size, data_offset - rodata_offset, image_size - data_offset];
        // The init code clears bss_end - bss_start, but the linker places
        // the "end" symbol one byte past the 0x1000-aligned boundary, so
        // the tail is padded out to cover it.
        let data_tail = align_up(bss_end.saturating_sub(bss_start), 0x1000) + 1;
        let bss_aligns = [0x100, 1, data_tail as u32];

        for kind in SegmentKind::ALL {
            let i = kind as usize;
            header.segments[i] = SegmentHeader {
                file_offset: offsets[i] as u32,
                mem_offset: offsets[i] as u32,
                mem_size: sizes[i] as u32,
                bss_align: bss_aligns[i],
            };
            header.segment_file_sizes[i] = sizes[i] as u32;
        }
        header.dynstr.offset = (self.dyn_info.strtab - rodata_offset) as u32;
        header.dynstr.size = self.dyn_info.strsz as u32;
        header.dynsym.offset = (self.dyn_info.symtab - rodata_offset) as u32;

        Ok(header)
    }

    /// Copies the build-id descriptor bytes out of the located note.
    fn capture_build_id(&mut self, note_off: u64) {
        let Ok(bytes) = util::slice_at(&self.image, note_off as usize, Elf64Nhdr::SIZE) else {
            return;
        };
        let Ok(nhdr) = Elf64Nhdr::read_from_bytes(bytes) else {
            return;
        };
        let desc_off = note_off as usize + Elf64Nhdr::SIZE + nhdr.n_namesz as usize;
        let len = (nhdr.n_descsz as usize).min(self.header.gnu_build_id.len());
        if let Ok(desc) = util::slice_at(&self.image, desc_off, len) {
            self.header.gnu_build_id[..len].copy_from_slice(desc);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Number of `.dynsym` entries, from the header extent.
    pub fn dynsym_count(&self) -> usize {
        self.header.dynsym.size as usize / Elf64Sym::SIZE
    }

    /// Iterates `.dynsym`. The table base comes from the dynamic table, the
    /// length from the header extent; entries past the image are dropped.
    pub fn dynsym_entries(&self) -> impl Iterator<Item = Elf64Sym> + '_ {
        let base = self.dyn_info.symtab as usize;
        (0..self.dynsym_count()).filter_map(move |i| {
            let bytes = util::slice_at(&self.image, base + i * Elf64Sym::SIZE, Elf64Sym::SIZE)
                .ok()?;
            Elf64Sym::read_from_bytes(bytes).ok()
        })
    }

    /// The image offset where `.dynstr` starts.
    pub fn dynstr_base(&self) -> u64 {
        u64::from(self.header.segment(SegmentKind::Rodata).mem_offset)
            + u64::from(self.header.dynstr.offset)
    }

    /// Resolves a `.dynstr` offset to a name, for the verbose dump.
    fn dynstr_name(&self, st_name: u32) -> &str {
        let start = self.dynstr_base() as usize + st_name as usize;
        let Some(tail) = self.image.get(start..) else {
            return "";
        };
        let end = memchr::memchr(0, tail).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    // =========================================================================
    // Informational Dump
    // =========================================================================

    /// Prints the container summary to stdout.
    pub fn dump(&self, verbose: bool) {
        if verbose {
            println!("version: {:8x}", self.header.version);
            println!("reserved_8: {:8x}", self.header.reserved_8);
            println!("flags: {:8x}", self.header.flags);
        }

        println!("gnu_build_id: {}", hex(&self.header.gnu_build_id));

        println!(
            "         {:<8} {:<8} {:<8} {:<8} {:<8}",
            "file off", "file len", "mem off", "mem len", "bss/algn"
        );
        for kind in SegmentKind::ALL {
            let seg = self.header.segment(kind);
            println!(
                "{} [{}]: {:8x} {:8x} {:8x} {:8x} {:8x}",
                kind as usize,
                kind.prot(),
                seg.file_offset,
                self.header.segment_file_sizes[kind as usize],
                seg.mem_offset,
                seg.mem_size,
                seg.bss_align
            );
        }

        println!(".rodata-relative:");
        println!(
            "  .dynstr: {:8x} {:8x}",
            self.header.dynstr.offset, self.header.dynstr.size
        );
        println!(
            "  .dynsym: {:8x} {:8x}",
            self.header.dynsym.offset, self.header.dynsym.size
        );

        println!("segment digests:");
        for kind in SegmentKind::ALL {
            println!(
                "{} [{}]: {}",
                kind as usize,
                kind.prot(),
                hex(&self.header.segment_digests[kind as usize])
            );
        }
    }

    /// Prints the decoded dynamic table, relocation tables, and symbols.
    pub fn dump_elf_info(&self) {
        println!("dynamic:");
        for i in 0..self.dyn_entries {
            let off = self.dynamic_off as usize + i * Elf64Dyn::SIZE;
            let Ok(bytes) = util::slice_at(&self.image, off, Elf64Dyn::SIZE) else {
                break;
            };
            let Ok(dyn_entry) = Elf64Dyn::read_from_bytes(bytes) else {
                break;
            };
            println!("{:16x} {:16x}", dyn_entry.d_tag, dyn_entry.d_un);
        }

        println!("rela:");
        for rela in locate::rela_entries(&self.image, self.dyn_info.rela, self.dyn_info.relasz) {
            println!(
                "{:16x} {:8x} {:8x} {:16x}",
                rela.r_offset,
                rela.sym(),
                rela.kind(),
                rela.r_addend
            );
        }
        println!("jmprel:");
        for rela in
            locate::rela_entries(&self.image, self.dyn_info.jmprel, self.dyn_info.pltrelsz)
        {
            println!(
                "{:16x} {:8x} {:8x} {:16x}",
                rela.r_offset,
                rela.sym(),
                rela.kind(),
                rela.r_addend
            );
        }

        println!("symbols:");
        for sym in self.dynsym_entries() {
            println!(
                "{:x} {:x} {:x} {:4x} {:16x} {:16x} {}",
                sym.bind(),
                sym.kind(),
                sym.st_other & 0x3,
                sym.st_shndx,
                sym.st_value,
                sym.st_size,
                self.dynstr_name(sym.st_name)
            );
        }
    }

}

// =============================================================================
// Detection and Materialization
// =============================================================================

/// Detects the container shape and materializes the flat memory image.
fn detect(file: Vec<u8>) -> Result<(FileKind, NsoHeader, Vec<u8>)> {
    if file.len() >= NsoHeader::SIZE && file[..4] == NSO_MAGIC {
        let (header, image) = materialize_nso(&file)?;
        return Ok((FileKind::Nso, header, image));
    }

    if file.len() >= NRO_HEADER_OFFSET + NroHeader::SIZE
        && file[NRO_HEADER_OFFSET..NRO_HEADER_OFFSET + 4] == NRO_MAGIC
    {
        let header = translate_nro(&file)?;
        // The NRO file already is the flat memory image.
        return Ok((FileKind::Nro, header, file));
    }

    // Not NSO or NRO; some images are essentially headerless NROs that
    // still carry a MOD0 descriptor.
    if file.len() >= ModPointer::SIZE {
        let magic_offset = util::read_u32_at(&file, 4)? as usize;
        let magic_end = magic_offset.checked_add(ModHeader::SIZE);
        if magic_end.is_some_and(|end| end <= file.len())
            && file[magic_offset..magic_offset + 4] == MOD_MAGIC
        {
            return Ok((FileKind::Mod, NsoHeader::empty(), file));
        }
    }

    Err(Error::UnknownContainer)
}

/// Decompresses or copies each NSO segment into a freshly allocated image.
fn materialize_nso(file: &[u8]) -> Result<(NsoHeader, Vec<u8>)> {
    let header = NsoHeader::read_from_bytes(&file[..NsoHeader::SIZE])
        .map_err(|_| Error::corrupt("short NSO header"))?;

    let image_size = header.image_size() as usize;
    let mut image = vec![0u8; image_size];

    for (i, kind) in SegmentKind::ALL.into_iter().enumerate() {
        let seg = header.segment(kind);
        let file_size = header.segment_file_sizes[i] as usize;
        let src = util::slice_at(file, seg.file_offset as usize, file_size).map_err(|_| {
            Error::corrupt(format!("segment {} bytes outside the file", i))
        })?;

        if header.is_compressed(i) {
            let dst = image
                .get_mut(seg.mem_offset as usize..seg.mem_end() as usize)
                .ok_or_else(|| Error::corrupt(format!("segment {} outside the image", i)))?;
            let written = lz4_flex::block::decompress_into(src, dst)
                .map_err(|_| Error::Decompress { segment: i })?;
            if written != seg.mem_size as usize {
                return Err(Error::Decompress { segment: i });
            }
        } else {
            let dst = image
                .get_mut(seg.mem_offset as usize..seg.mem_offset as usize + file_size)
                .ok_or_else(|| Error::corrupt(format!("segment {} outside the image", i)))?;
            dst.copy_from_slice(src);
        }
    }

    Ok((header, image))
}

/// Translates the NRO header into the NSO-shaped internal form. NSO is a
/// superset, so only the segment descriptors and extents need mapping.
fn translate_nro(file: &[u8]) -> Result<NsoHeader> {
    let nro = NroHeader::read_from_bytes(
        &file[NRO_HEADER_OFFSET..NRO_HEADER_OFFSET + NroHeader::SIZE],
    )
    .map_err(|_| Error::corrupt("short NRO header"))?;

    if nro.file_size as usize != file.len() {
        return Err(Error::corrupt(format!(
            "NRO file_size {:#x} does not match on-disk length {:#x}",
            nro.file_size,
            file.len()
        )));
    }

    let mut header = NsoHeader::empty();
    for (i, kind) in SegmentKind::ALL.into_iter().enumerate() {
        let bss_align = match kind {
            SegmentKind::Text => 0x100,
            SegmentKind::Rodata => 1,
            SegmentKind::Data => nro.bss_size,
        };
        header.segments[i] = SegmentHeader {
            file_offset: nro.segments[i].offset,
            mem_offset: nro.segments[i].offset,
            mem_size: nro.segments[i].size,
            bss_align,
        };
        header.segment_file_sizes[i] = nro.segments[i].size;
    }
    header.gnu_build_id = nro.gnu_build_id;
    header.dynstr = nro.dynstr;
    header.dynsym = nro.dynsym;

    Ok(header)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Reads and validates the MOD0 header at `mod_off`.
fn read_mod_header(image: &[u8], mod_off: u64) -> Result<ModHeader> {
    let bytes = util::slice_at(image, mod_off as usize, ModHeader::SIZE)
        .map_err(|_| Error::corrupt("MOD0 header outside the image"))?;
    let mod_header =
        ModHeader::read_from_bytes(bytes).map_err(|_| Error::corrupt("short MOD0 header"))?;
    if mod_header.magic != MOD_MAGIC {
        return Err(Error::corrupt("MOD0 magic missing at pointed offset"));
    }
    Ok(mod_header)
}

/// Parses the dynamic table, returning the recognized-tag summary and the
/// entry count including the terminator.
fn parse_dynamic(image: &[u8], dynamic_off: u64) -> Result<(DynInfo, usize)> {
    let mut info = DynInfo::default();
    let mut count = 0usize;
    loop {
        let off = dynamic_off as usize + count * Elf64Dyn::SIZE;
        let bytes = util::slice_at(image, off, Elf64Dyn::SIZE)
            .map_err(|_| Error::corrupt("dynamic table runs past the image"))?;
        let entry = Elf64Dyn::read_from_bytes(bytes)
            .map_err(|_| Error::corrupt("dynamic table runs past the image"))?;
        count += 1;
        match entry.d_tag {
            DT_NULL => break,
            DT_SYMTAB => info.symtab = entry.d_un,
            DT_RELA => info.rela = entry.d_un,
            DT_RELASZ => info.relasz = entry.d_un,
            DT_JMPREL => info.jmprel = entry.d_un,
            DT_PLTRELSZ => info.pltrelsz = entry.d_un,
            DT_STRTAB => info.strtab = entry.d_un,
            DT_STRSZ => info.strsz = entry.d_un,
            DT_PLTGOT => info.pltgot = entry.d_un,
            DT_HASH => info.hash = entry.d_un,
            DT_GNU_HASH => info.gnu_hash = entry.d_un,
            DT_INIT => info.init = entry.d_un,
            DT_FINI => info.fini = entry.d_un,
            DT_INIT_ARRAY => info.init_array = entry.d_un,
            DT_INIT_ARRAYSZ => info.init_arraysz = entry.d_un,
            DT_FINI_ARRAY => info.fini_array = entry.d_un,
            DT_FINI_ARRAYSZ => info.fini_arraysz = entry.d_un,
            _ => {}
        }
    }
    Ok((info, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_rejects_garbage() {
        assert!(matches!(
            NxFile::from_bytes(vec![0u8; 4]),
            Err(Error::UnknownContainer)
        ));
        assert!(matches!(
            NxFile::from_bytes(vec![0xffu8; 0x40]),
            Err(Error::UnknownContainer)
        ));
    }

    #[test]
    fn test_detect_rejects_nro_size_mismatch() {
        let mut file = vec![0u8; 0x200];
        file[NRO_HEADER_OFFSET..NRO_HEADER_OFFSET + 4].copy_from_slice(&NRO_MAGIC);
        // file_size field disagrees with the actual length
        file[NRO_HEADER_OFFSET + 8..NRO_HEADER_OFFSET + 12]
            .copy_from_slice(&0x999u32.to_le_bytes());
        assert!(matches!(
            NxFile::from_bytes(file),
            Err(Error::CorruptContainer { .. })
        ));
    }

    #[test]
    fn test_parse_dynamic() {
        let mut image = vec![0u8; 0x100];
        let entries: [(i64, u64); 3] = [(DT_SYMTAB, 0x2000), (DT_STRSZ, 0x40), (DT_NULL, 0)];
        for (i, (tag, val)) in entries.iter().enumerate() {
            image[0x10 + i * 16..0x10 + i * 16 + 8].copy_from_slice(&tag.to_le_bytes());
            image[0x18 + i * 16..0x18 + i * 16 + 8].copy_from_slice(&val.to_le_bytes());
        }
        let (info, count) = parse_dynamic(&image, 0x10).unwrap();
        assert_eq!(info.symtab, 0x2000);
        assert_eq!(info.strsz, 0x40);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_parse_dynamic_unterminated() {
        // No terminator before the image ends.
        let mut image = vec![0u8; 0x20];
        image[0x10..0x18].copy_from_slice(&DT_SYMTAB.to_le_bytes());
        assert!(parse_dynamic(&image, 0x10).is_err());
    }
}
