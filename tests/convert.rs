//! End-to-end conversion scenarios over synthetic fixtures.
//!
//! Each fixture is a minimal but internally consistent image: a MOD0
//! descriptor in rodata, a dynamic table in data, `.dynsym`/`.dynstr` in
//! rodata, and optionally a PLT with its relocation tables, a GNU build-id
//! note, and measurable exception frames. The produced ELFs are verified
//! with the crate's own on-disk structures.

use zerocopy::{FromBytes, IntoBytes};

use nxelf::elf::*;
use nxelf::nx::{
    DataExtent, ModHeader, NroHeader, NsoFlags, NsoHeader, SegmentHeader, SegmentKind,
    MOD_MAGIC, NRO_MAGIC,
};
use nxelf::{Error, FileKind, NxFile};

// Image layout shared by every fixture.
const TEXT_SIZE: usize = 0x1000;
const RODATA_OFF: usize = 0x1000;
const RODATA_SIZE: usize = 0x400;
const DATA_OFF: usize = 0x1400;
const DATA_SIZE: usize = 0x200;
const BSS_SIZE: usize = 0x100;
const IMAGE_SIZE: usize = DATA_OFF + DATA_SIZE;

const INIT_OFF: usize = 0x100;
const FINI_OFF: usize = 0x110;
const PLT_OFF: usize = 0x200;
const MOD0_OFF: usize = 0x1010;
const DYNSYM_OFF: usize = 0x1100;
const NUM_SYMS: usize = 5;
const DYNSYM_SIZE: usize = NUM_SYMS * Elf64Sym::SIZE;
const DYNSTR_OFF: usize = DYNSYM_OFF + DYNSYM_SIZE; // contiguous after .dynsym
const DYNSTR: &[u8; 16] = b"\0main\0handler\0\0\0";
const NOTE_OFF: usize = 0x1300;
const EH_HDR_OFF: usize = 0x1340;
const EH_FRAME_OFF: usize = 0x1360;
const RELA_DYN_OFF: usize = 0x13a0;
const RELA_PLT_OFF: usize = 0x13d0;
const DYNAMIC_OFF: usize = DATA_OFF;
const PLTGOT_OFF: usize = 0x14c0;
const GOT_OFF: usize = 0x14e8;
const BSS_START: usize = DATA_OFF + DATA_SIZE;

#[derive(Clone, Copy)]
struct ImageOpts {
    plt: bool,
    note: bool,
    eh: bool,
    strtab: usize,
}

impl Default for ImageOpts {
    fn default() -> Self {
        Self {
            plt: true,
            note: true,
            eh: true,
            strtab: DYNSTR_OFF,
        }
    }
}

fn put_u32(image: &mut [u8], off: usize, value: u32) {
    image[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(image: &mut [u8], off: usize, value: u64) {
    image[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_sym(image: &mut [u8], index: usize, sym: Elf64Sym) {
    let off = DYNSYM_OFF + index * Elf64Sym::SIZE;
    image[off..off + Elf64Sym::SIZE].copy_from_slice(sym.as_bytes());
}

fn put_rela(image: &mut [u8], off: usize, r_offset: u64, kind: u32) {
    let rela = Elf64Rela {
        r_offset,
        r_info: u64::from(kind),
        r_addend: 0,
    };
    image[off..off + Elf64Rela::SIZE].copy_from_slice(rela.as_bytes());
}

/// Builds the flat memory image (without the bss tail).
fn build_image(opts: ImageOpts) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_SIZE];

    // MOD pointer.
    put_u32(&mut image, 4, MOD0_OFF as u32);

    // .init: two NOPs then RET; .fini: NOP then B.
    put_u32(&mut image, INIT_OFF, 0xd503201f);
    put_u32(&mut image, INIT_OFF + 4, 0xd503201f);
    put_u32(&mut image, INIT_OFF + 8, 0xd65f03c0);
    put_u32(&mut image, FINI_OFF, 0xd503201f);
    put_u32(&mut image, FINI_OFF + 4, 0x14000008);

    if opts.plt {
        let plt_header: [u32; 8] = [
            0xa9bf7bf0, 0x900000d0, 0xf9428a11, 0x91144210, 0xd61f0220, 0xd503201f, 0xd503201f,
            0xd503201f,
        ];
        for (i, word) in plt_header.iter().enumerate() {
            put_u32(&mut image, PLT_OFF + i * 4, *word);
        }
    }

    // MOD0 header: offsets are relative to the header itself.
    let mod_header = ModHeader {
        magic: MOD_MAGIC,
        dynamic_offset: (DYNAMIC_OFF - MOD0_OFF) as i32,
        bss_start_offset: (BSS_START - MOD0_OFF) as i32,
        bss_end_offset: (BSS_START + BSS_SIZE - MOD0_OFF) as i32,
        eh_start_offset: (EH_HDR_OFF - MOD0_OFF) as i32,
        eh_end_offset: (EH_HDR_OFF + 0x10 - MOD0_OFF) as i32,
        module_object_offset: 0,
    };
    image[MOD0_OFF..MOD0_OFF + ModHeader::SIZE].copy_from_slice(mod_header.as_bytes());

    // .dynsym: a null entry, section symbols for text/rodata/data, and a
    // global pointing into the bss tail.
    put_sym(&mut image, 0, Elf64Sym::default());
    for (index, vaddr) in [(1u16, 0u64), (2, RODATA_OFF as u64), (3, DATA_OFF as u64)] {
        put_sym(
            &mut image,
            index as usize,
            Elf64Sym {
                st_name: 0,
                st_info: STT_SECTION,
                st_other: 0,
                st_shndx: index,
                st_value: vaddr,
                st_size: 0,
            },
        );
    }
    put_sym(
        &mut image,
        4,
        Elf64Sym {
            st_name: 1,
            st_info: 1 << 4, // global notype
            st_other: 0,
            st_shndx: 4,
            st_value: BSS_START as u64 + 0x10,
            st_size: 8,
        },
    );

    image[opts.strtab..opts.strtab + DYNSTR.len()].copy_from_slice(DYNSTR);

    if opts.note {
        // MD5-sized GNU build-id note.
        put_u32(&mut image, NOTE_OFF, 4);
        put_u32(&mut image, NOTE_OFF + 4, 16);
        put_u32(&mut image, NOTE_OFF + 8, 3);
        image[NOTE_OFF + 12..NOTE_OFF + 16].copy_from_slice(b"GNU\0");
        image[NOTE_OFF + 16..NOTE_OFF + 32].copy_from_slice(&[0xab; 16]);
    }

    if opts.eh {
        image[EH_HDR_OFF] = 1; // version
        image[EH_HDR_OFF + 1] = 0x1b; // pcrel | sdata4
        image[EH_HDR_OFF + 2] = 0x03;
        image[EH_HDR_OFF + 3] = 0x3b;
        let delta = (EH_FRAME_OFF as i64 - (EH_HDR_OFF as i64 + 4)) as i32;
        put_u32(&mut image, EH_HDR_OFF + 4, delta as u32);
        // One 24-byte CIE then the zero terminator.
        put_u32(&mut image, EH_FRAME_OFF, 24);
        put_u32(&mut image, EH_FRAME_OFF + 28, 0);
    }

    // .rela.dyn: two GLOB_DAT slots right after the GOT sentinel.
    put_rela(&mut image, RELA_DYN_OFF, GOT_OFF as u64 + 8, R_AARCH64_GLOB_DAT);
    put_rela(
        &mut image,
        RELA_DYN_OFF + Elf64Rela::SIZE,
        GOT_OFF as u64 + 16,
        R_AARCH64_GLOB_DAT,
    );

    if opts.plt {
        // .rela.plt: two jump slots at the end of .got.plt.
        put_rela(
            &mut image,
            RELA_PLT_OFF,
            PLTGOT_OFF as u64 + 24,
            R_AARCH64_JUMP_SLOT,
        );
        put_rela(
            &mut image,
            RELA_PLT_OFF + Elf64Rela::SIZE,
            PLTGOT_OFF as u64 + 32,
            R_AARCH64_JUMP_SLOT,
        );
        // The GOT self pointer to .dynamic.
        put_u64(&mut image, GOT_OFF, DYNAMIC_OFF as u64);
    }

    // Dynamic table.
    let mut entries: Vec<(i64, u64)> = Vec::new();
    if opts.plt {
        entries.push((DT_PLTGOT, PLTGOT_OFF as u64));
        entries.push((DT_JMPREL, RELA_PLT_OFF as u64));
        entries.push((DT_PLTRELSZ, (2 * Elf64Rela::SIZE) as u64));
    }
    entries.push((DT_RELA, RELA_DYN_OFF as u64));
    entries.push((DT_RELASZ, (2 * Elf64Rela::SIZE) as u64));
    entries.push((DT_SYMTAB, DYNSYM_OFF as u64));
    entries.push((DT_STRTAB, opts.strtab as u64));
    entries.push((DT_STRSZ, DYNSTR.len() as u64));
    entries.push((DT_INIT, INIT_OFF as u64));
    entries.push((DT_FINI, FINI_OFF as u64));
    entries.push((DT_NULL, 0));
    for (i, (tag, value)) in entries.iter().enumerate() {
        let off = DYNAMIC_OFF + i * Elf64Dyn::SIZE;
        image[off..off + 8].copy_from_slice(&tag.to_le_bytes());
        image[off + 8..off + 16].copy_from_slice(&value.to_le_bytes());
    }

    image
}

/// Wraps an image in an NSO container, optionally LZ4-compressing every
/// segment.
fn wrap_nso(image: &[u8], compressed: bool) -> Vec<u8> {
    let mut header = NsoHeader::empty();
    let extents = [
        (0usize, TEXT_SIZE, 0x100u32),
        (RODATA_OFF, RODATA_SIZE, 1),
        (DATA_OFF, DATA_SIZE, BSS_SIZE as u32),
    ];

    let mut out = vec![0u8; NsoHeader::SIZE];
    for (i, (offset, size, bss_align)) in extents.into_iter().enumerate() {
        let seg_bytes = &image[offset..offset + size];
        let blob = if compressed {
            lz4_flex::block::compress(seg_bytes)
        } else {
            seg_bytes.to_vec()
        };
        header.segments[i] = SegmentHeader {
            file_offset: out.len() as u32,
            mem_offset: offset as u32,
            mem_size: size as u32,
            bss_align,
        };
        header.segment_file_sizes[i] = blob.len() as u32;
        out.extend_from_slice(&blob);
    }
    if compressed {
        header.flags = NsoFlags::COMPRESSED.bits();
    }
    header.dynstr = DataExtent {
        offset: (DYNSTR_OFF - RODATA_OFF) as u32,
        size: DYNSTR.len() as u32,
    };
    header.dynsym = DataExtent {
        offset: (DYNSYM_OFF - RODATA_OFF) as u32,
        size: DYNSYM_SIZE as u32,
    };
    out[..NsoHeader::SIZE].copy_from_slice(header.as_bytes());
    out
}

/// Writes an NRO header into the image's text prologue; the file is the
/// image itself.
fn wrap_nro(image: &[u8]) -> Vec<u8> {
    let mut out = image.to_vec();
    let header = NroHeader {
        magic: NRO_MAGIC,
        version: 0,
        file_size: out.len() as u32,
        reserved_c: 0,
        segments: [
            DataExtent {
                offset: 0,
                size: TEXT_SIZE as u32,
            },
            DataExtent {
                offset: RODATA_OFF as u32,
                size: RODATA_SIZE as u32,
            },
            DataExtent {
                offset: DATA_OFF as u32,
                size: DATA_SIZE as u32,
            },
        ],
        bss_size: BSS_SIZE as u32,
        reserved_3c: 0,
        gnu_build_id: [0xcd; 32],
        reserved_60: [0; 4],
        dynstr: DataExtent {
            offset: (DYNSTR_OFF - RODATA_OFF) as u32,
            size: DYNSTR.len() as u32,
        },
        dynsym: DataExtent {
            offset: (DYNSYM_OFF - RODATA_OFF) as u32,
            size: DYNSYM_SIZE as u32,
        },
    };
    out[0x10..0x10 + NroHeader::SIZE].copy_from_slice(header.as_bytes());
    out
}

// =============================================================================
// ELF read-back helpers
// =============================================================================

fn parse_ehdr(elf: &[u8]) -> Elf64Ehdr {
    Elf64Ehdr::read_from_bytes(&elf[..Elf64Ehdr::SIZE]).unwrap()
}

fn parse_phdrs(elf: &[u8]) -> Vec<Elf64Phdr> {
    let ehdr = parse_ehdr(elf);
    (0..ehdr.e_phnum as usize)
        .map(|i| {
            let start = ehdr.e_phoff as usize + i * Elf64Phdr::SIZE;
            Elf64Phdr::read_from_bytes(&elf[start..start + Elf64Phdr::SIZE]).unwrap()
        })
        .collect()
}

fn parse_shdrs(elf: &[u8]) -> Vec<Elf64Shdr> {
    let ehdr = parse_ehdr(elf);
    (0..ehdr.e_shnum as usize)
        .map(|i| {
            let start = ehdr.e_shoff as usize + i * Elf64Shdr::SIZE;
            Elf64Shdr::read_from_bytes(&elf[start..start + Elf64Shdr::SIZE]).unwrap()
        })
        .collect()
}

fn section_name<'a>(elf: &'a [u8], shdrs: &[Elf64Shdr], shdr: &Elf64Shdr) -> &'a [u8] {
    let ehdr = parse_ehdr(elf);
    let shstrtab = &shdrs[ehdr.e_shstrndx as usize];
    let start = shstrtab.sh_offset as usize + shdr.sh_name as usize;
    let tail = &elf[start..];
    let end = tail.iter().position(|&b| b == 0).unwrap();
    &tail[..end]
}

fn find_section(elf: &[u8], name: &str) -> Option<(u16, Elf64Shdr)> {
    let shdrs = parse_shdrs(elf);
    shdrs
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, shdr)| section_name(elf, &shdrs, shdr) == name.as_bytes())
        .map(|(index, shdr)| (index as u16, *shdr))
}

fn convert(file: Vec<u8>) -> Vec<u8> {
    let nx = NxFile::from_bytes(file).expect("fixture should load");
    nxelf::convert_to_elf(&nx).expect("fixture should convert")
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn converts_compressed_nso() {
    let image = build_image(ImageOpts::default());
    let file = wrap_nso(&image, true);
    let nx = NxFile::from_bytes(file).unwrap();
    assert_eq!(nx.kind, FileKind::Nso);
    // Decompression reproduced the flat image.
    assert_eq!(&nx.image[..IMAGE_SIZE], &image[..]);
    assert_eq!(nx.image.len(), IMAGE_SIZE + BSS_SIZE);

    let elf = nxelf::convert_to_elf(&nx).unwrap();
    let ehdr = parse_ehdr(&elf);
    assert_eq!(&ehdr.e_ident[..4], b"\x7fELF");
    assert_eq!(ehdr.e_type, ET_DYN);
    assert_eq!(ehdr.e_machine, EM_AARCH64);
    assert!(ehdr.e_shstrndx != SHN_UNDEF && ehdr.e_shstrndx < ehdr.e_shnum);

    let phdrs = parse_phdrs(&elf);
    assert_eq!(phdrs.iter().filter(|p| p.p_type == PT_LOAD).count(), 3);
    let dyn_phdr = phdrs.iter().find(|p| p.p_type == PT_DYNAMIC).unwrap();
    assert_eq!(dyn_phdr.p_vaddr, DYNAMIC_OFF as u64);
    assert_eq!(dyn_phdr.p_filesz, 11 * Elf64Dyn::SIZE as u64);

    for name in [".text", ".rodata", ".data", ".bss"] {
        assert!(find_section(&elf, name).is_some(), "missing {}", name);
    }
    let (_, bss) = find_section(&elf, ".bss").unwrap();
    assert_eq!(bss.sh_type, SHT_NOBITS);
    assert_eq!(bss.sh_addr, BSS_START as u64);
    assert_eq!(bss.sh_size, BSS_SIZE as u64);

    // .dynstr bytes survive conversion untouched.
    let (_, dynstr) = find_section(&elf, ".dynstr").unwrap();
    assert_eq!(dynstr.sh_addr, DYNSTR_OFF as u64);
    let start = dynstr.sh_offset as usize;
    assert_eq!(&elf[start..start + DYNSTR.len()], DYNSTR);

    // .dynsym links to .dynstr and counts its local symbols.
    let (dynstr_index, _) = find_section(&elf, ".dynstr").unwrap();
    let (_, dynsym) = find_section(&elf, ".dynsym").unwrap();
    assert_eq!(dynsym.sh_link, u32::from(dynstr_index));
    assert_eq!(dynsym.sh_info, 4);
    assert_eq!(dynsym.sh_entsize, Elf64Sym::SIZE as u64);
}

#[test]
fn converts_nro() {
    let image = build_image(ImageOpts::default());
    let file = wrap_nro(&image);
    let nx = NxFile::from_bytes(file).unwrap();
    assert_eq!(nx.kind, FileKind::Nro);
    assert_eq!(nx.header.gnu_build_id, [0xcd; 32]);

    let elf = nxelf::convert_to_elf(&nx).unwrap();
    let phdrs = parse_phdrs(&elf);
    assert_eq!(phdrs.iter().filter(|p| p.p_type == PT_LOAD).count(), 3);
    assert!(phdrs.iter().any(|p| p.p_type == PT_DYNAMIC));
    for name in [".text", ".rodata", ".data", ".bss", ".dynamic", ".rela.dyn"] {
        assert!(find_section(&elf, name).is_some(), "missing {}", name);
    }
}

#[test]
fn emits_build_id_note() {
    let elf = convert(wrap_nso(&build_image(ImageOpts::default()), true));
    let (_, note) = find_section(&elf, ".note").unwrap();
    assert_eq!(note.sh_type, SHT_NOTE);
    assert_eq!(note.sh_addr, NOTE_OFF as u64);
    // 12-byte header + 4-byte owner + 16-byte MD5 descriptor.
    assert_eq!(note.sh_size, 32);
}

#[test]
fn emits_plt_sections() {
    let elf = convert(wrap_nso(&build_image(ImageOpts::default()), true));

    let (plt_index, plt) = find_section(&elf, ".plt").unwrap();
    assert_eq!(plt.sh_addr, PLT_OFF as u64);
    assert_eq!(plt.sh_size, 32 + 16 * 2);

    let (_, got_plt) = find_section(&elf, ".got.plt").unwrap();
    assert_eq!(got_plt.sh_addr, PLTGOT_OFF as u64);
    assert_eq!(got_plt.sh_size, 40); // three reserved slots + two jump slots

    let (_, got) = find_section(&elf, ".got").unwrap();
    assert_eq!(got.sh_addr, GOT_OFF as u64);
    assert_eq!(got.sh_size, 24); // sentinel + two GLOB_DAT slots

    let (dynsym_index, _) = find_section(&elf, ".dynsym").unwrap();
    let (_, rela_plt) = find_section(&elf, ".rela.plt").unwrap();
    assert_eq!(rela_plt.sh_info, u32::from(plt_index));
    assert_eq!(rela_plt.sh_link, u32::from(dynsym_index));
    assert_eq!(rela_plt.sh_size, 2 * Elf64Rela::SIZE as u64);
    assert!(rela_plt.sh_flags & SHF_INFO_LINK != 0);
}

#[test]
fn emits_exception_frames() {
    let elf = convert(wrap_nso(&build_image(ImageOpts::default()), true));

    let phdrs = parse_phdrs(&elf);
    let eh_phdr = phdrs.iter().find(|p| p.p_type == PT_GNU_EH_FRAME).unwrap();
    assert_eq!(eh_phdr.p_vaddr, EH_HDR_OFF as u64);
    assert_eq!(eh_phdr.p_filesz, 0x10);

    let (_, eh_hdr) = find_section(&elf, ".eh_frame_hdr").unwrap();
    assert_eq!(eh_hdr.sh_addr, EH_HDR_OFF as u64);
    assert_eq!(eh_hdr.sh_size, 0x10);

    let (_, eh_frame) = find_section(&elf, ".eh_frame").unwrap();
    assert_eq!(eh_frame.sh_addr, EH_FRAME_OFF as u64);
    // 4 + 24 CIE + 4 terminator, rounded to 0x10.
    assert_eq!(eh_frame.sh_size, 0x20);
}

#[test]
fn reconstructs_raw_mod() {
    let image = build_image(ImageOpts::default());
    let nx = NxFile::from_bytes(image.clone()).unwrap();
    assert_eq!(nx.kind, FileKind::Mod);

    let text = nx.header.segment(SegmentKind::Text);
    let rodata = nx.header.segment(SegmentKind::Rodata);
    let data = nx.header.segment(SegmentKind::Data);
    assert_eq!(text.mem_offset, 0);
    // .text runs through the end of the PLT.
    assert_eq!(text.mem_size, PLT_OFF as u32 + 32 + 16 * 2);
    assert_eq!(rodata.mem_offset, 0x1000);
    assert_eq!(rodata.mem_offset % 0x1000, 0);
    assert_eq!(rodata.mem_size, (DATA_OFF - RODATA_OFF) as u32);
    assert_eq!(data.mem_offset, DATA_OFF as u32);
    assert_eq!(u64::from(data.mem_offset + data.mem_size), image.len() as u64);
    // bss tail padded to the page boundary plus the trailing "end" byte.
    assert_eq!(data.bss_align, 0x1001);

    // The build id was captured from the located note.
    assert_eq!(nx.header.gnu_build_id[..16], [0xab; 16]);
    assert_eq!(nx.header.dynsym.offset, (DYNSYM_OFF - RODATA_OFF) as u32);
    assert_eq!(nx.header.dynsym.size, DYNSYM_SIZE as u32);
    assert_eq!(nx.header.dynstr.offset, (DYNSTR_OFF - RODATA_OFF) as u32);

    let elf = nxelf::convert_to_elf(&nx).unwrap();
    let (_, bss) = find_section(&elf, ".bss").unwrap();
    assert_eq!(bss.sh_size, 0x1001);
    assert!(find_section(&elf, ".plt").is_some());
}

#[test]
fn raw_mod_requires_plt() {
    let image = build_image(ImageOpts {
        plt: false,
        ..Default::default()
    });
    // Without PLT relocations there is nothing to anchor the text size on.
    assert!(matches!(
        NxFile::from_bytes(image),
        Err(Error::MissingPlt)
    ));
}

#[test]
fn raw_mod_requires_contiguous_dynstr() {
    // .dynstr placed before .dynsym violates the reconstruction invariant.
    let image = build_image(ImageOpts {
        strtab: DYNSYM_OFF - 0x20,
        ..Default::default()
    });
    assert!(matches!(
        NxFile::from_bytes(image),
        Err(Error::BadLayout { .. })
    ));
}

#[test]
fn omits_sections_that_fail_discovery() {
    let image = build_image(ImageOpts {
        plt: false,
        note: false,
        eh: false,
        ..Default::default()
    });
    let elf = convert(wrap_nso(&image, false));

    for name in [
        ".plt",
        ".got",
        ".got.plt",
        ".rela.plt",
        ".note",
        ".eh_frame_hdr",
        ".eh_frame",
    ] {
        assert!(find_section(&elf, name).is_none(), "unexpected {}", name);
    }
    // The fifth program-header slot stays PT_NULL when measurement fails.
    let phdrs = parse_phdrs(&elf);
    assert_eq!(phdrs.len(), 5);
    assert_eq!(phdrs[4].p_type, PT_NULL);
    // Mandatory sections are still present.
    for name in [".dynstr", ".dynsym", ".dynamic", ".rela.dyn", ".init", ".fini"] {
        assert!(find_section(&elf, name).is_some(), "missing {}", name);
    }
}

// =============================================================================
// Quantified Invariants
// =============================================================================

#[test]
fn load_segments_cover_alloc_sections() {
    let elf = convert(wrap_nso(&build_image(ImageOpts::default()), true));
    let ehdr = parse_ehdr(&elf);
    let phdrs = parse_phdrs(&elf);
    let shdrs = parse_shdrs(&elf);

    assert!(ehdr.e_shstrndx < ehdr.e_shnum);

    let loads: Vec<_> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    for phdr in &loads {
        let end = phdr.p_offset + phdr.p_filesz;
        assert!(end as usize <= elf.len(), "PT_LOAD runs past the file");
    }
    // File ranges are pairwise disjoint.
    for (i, a) in loads.iter().enumerate() {
        for b in loads.iter().skip(i + 1) {
            let a_end = a.p_offset + a.p_filesz;
            let b_end = b.p_offset + b.p_filesz;
            assert!(a_end <= b.p_offset || b_end <= a.p_offset);
        }
    }

    for shdr in shdrs.iter().skip(1) {
        if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_type == SHT_NOBITS {
            continue;
        }
        let covering = loads
            .iter()
            .find(|p| shdr.sh_addr >= p.p_vaddr && shdr.sh_addr + shdr.sh_size <= p.p_vaddr + p.p_filesz)
            .unwrap_or_else(|| panic!("no PT_LOAD covers sh_addr {:#x}", shdr.sh_addr));
        assert_eq!(
            shdr.sh_offset,
            covering.p_offset + (shdr.sh_addr - covering.p_vaddr),
            "sh_offset inconsistent for sh_addr {:#x}",
            shdr.sh_addr
        );
    }

    // Every dynsym section reference resolves to a present header.
    let (_, dynsym) = find_section(&elf, ".dynsym").unwrap();
    let base = dynsym.sh_offset as usize;
    for i in 0..dynsym.sh_size as usize / Elf64Sym::SIZE {
        let sym =
            Elf64Sym::read_from_bytes(&elf[base + i * Elf64Sym::SIZE..base + (i + 1) * Elf64Sym::SIZE])
                .unwrap();
        if sym.st_shndx != SHN_UNDEF && sym.st_shndx < SHN_LORESERVE {
            assert!(sym.st_shndx < ehdr.e_shnum);
            assert_ne!(shdrs[sym.st_shndx as usize].sh_type, SHT_NULL);
        }
    }
}

#[test]
fn converter_is_deterministic() {
    let image = build_image(ImageOpts::default());
    let first = convert(wrap_nso(&image, true));
    let second = convert(wrap_nso(&image, true));
    assert_eq!(first, second);
}

#[test]
fn uncompressed_rewrite_is_idempotent() {
    let image = build_image(ImageOpts::default());
    let nx = NxFile::from_bytes(wrap_nso(&image, true)).unwrap();

    let once = nxelf::rewrite_uncompressed(&nx).unwrap();
    let header = NsoHeader::read_from_bytes(&once[..NsoHeader::SIZE]).unwrap();
    assert_eq!(header.flags & NsoFlags::COMPRESSED.bits(), 0);
    assert_eq!(once.len(), NsoHeader::SIZE + IMAGE_SIZE);
    // Segment bytes are stored verbatim after the header.
    assert_eq!(&once[NsoHeader::SIZE..], &image[..]);

    let again = NxFile::from_bytes(once.clone()).unwrap();
    assert_eq!(again.kind, FileKind::Nso);
    let twice = nxelf::rewrite_uncompressed(&again).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn code_bytes_survive_every_container_shape() {
    // The same image through NSO and raw MOD yields identical PLT bytes.
    let image = build_image(ImageOpts::default());
    let plt_len = 32 + 16 * 2;

    let from_nso = convert(wrap_nso(&image, true));
    let (_, text) = find_section(&from_nso, ".text").unwrap();
    let start = text.sh_offset as usize + PLT_OFF;
    let nso_plt = &from_nso[start..start + plt_len];
    assert_eq!(&nso_plt[..4], &0xa9bf7bf0u32.to_le_bytes());

    let from_mod = convert(image);
    let (_, text) = find_section(&from_mod, ".text").unwrap();
    let start = text.sh_offset as usize + PLT_OFF;
    assert_eq!(&from_mod[start..start + plt_len], nso_plt);
}
