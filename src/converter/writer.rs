//! ELF synthesis.
//!
//! Plans the section inventory and string table, lays out program and
//! section headers, and assembles the output ELF. Section indices
//! referenced from `.dynsym` entries are fixed and must be honored; all
//! other sections are placed by `insert_shdr`, which keeps a section's
//! index greater than that of the claimed section containing its address.
//! Some disassemblers collapse adjacent same-type sections when indices
//! run out of order, so the ordering discipline is load-bearing.

use std::collections::BTreeMap;

use tracing::warn;
use zerocopy::IntoBytes;

use crate::converter::locate;
use crate::converter::profile::Profile;
use crate::converter::strtab::StringTable;
use crate::elf::*;
use crate::error::{Error, Result};
use crate::nx::{EhInfo, NsoHeader, NxFile, PltInfo, SegmentKind};
use crate::util;

/// Three PT_LOADs plus PT_DYNAMIC and PT_GNU_EH_FRAME.
const NUM_PHDRS: usize = SegmentKind::COUNT + 2;

/// Synthesizes an ELF64 shared object from a loaded image and its profile.
pub fn write_elf(nx: &NxFile, profile: &Profile) -> Result<Vec<u8>> {
    let mut shstrtab = StringTable::new();
    shstrtab.add(".shstrtab");

    // ---- Claim fixed section indices from .dynsym -------------------------
    let mut max_shndx: u16 = 0;
    let mut known: BTreeMap<u16, Elf64Shdr> = BTreeMap::new();
    for sym in nx.dynsym_entries() {
        if sym.st_shndx >= SHN_LORESERVE {
            continue;
        }
        max_shndx = max_shndx.max(sym.st_shndx);
        if sym.st_shndx != SHN_UNDEF && !known.contains_key(&sym.st_shndx) {
            match segment_shdr(&nx.header, &mut shstrtab, sym.st_value) {
                Some(shdr) => {
                    known.insert(sym.st_shndx, shdr);
                }
                None => {
                    warn!("failed to make shdr for st_shndx {}", sym.st_shndx);
                }
            }
        }
    }

    // ---- Backfill standard segments nothing pointed into ------------------
    if known.len() != SegmentKind::COUNT + 1 {
        backfill_standard_sections(&nx.header, &mut shstrtab, &mut known);
    }
    // Index -> count.
    let mut num_shdrs = i64::from(max_shndx) + 1;

    // ---- Tally the additional sections ------------------------------------
    let mut shdrs_needed = known.len() as i64 - num_shdrs;
    shdrs_needed += 1; // index 0
    shdrs_needed += 1; // .shstrtab
    for name in [".dynstr", ".dynsym", ".dynamic", ".rela.dyn"] {
        shstrtab.add(name);
        shdrs_needed += 1;
    }

    let inventory = Inventory::plan(nx, profile);
    shdrs_needed += inventory.count();
    inventory.add_names(&mut shstrtab);

    shstrtab.finalize();
    if shdrs_needed > 0 {
        num_shdrs += shdrs_needed;
    }
    let num_shdrs = num_shdrs as usize;

    // ---- Compute the final ELF size ---------------------------------------
    let segments_size: u64 = SegmentKind::ALL
        .iter()
        .map(|&kind| u64::from(nx.header.segment(kind).mem_size))
        .sum();
    let elf_size = Elf64Ehdr::SIZE
        + Elf64Phdr::SIZE * NUM_PHDRS
        + Elf64Shdr::SIZE * num_shdrs
        + shstrtab.size as usize
        + segments_size as usize;
    let mut elf = vec![0u8; elf_size];

    // ---- File header ------------------------------------------------------
    let mut ehdr = Elf64Ehdr {
        e_ident: Elf64Ehdr::ident(),
        e_type: ET_DYN,
        e_machine: EM_AARCH64,
        e_version: u32::from(EV_CURRENT),
        e_entry: u64::from(nx.header.segment(SegmentKind::Text).mem_offset),
        e_phoff: Elf64Ehdr::SIZE as u64,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: Elf64Ehdr::SIZE as u16,
        e_phentsize: Elf64Phdr::SIZE as u16,
        e_phnum: NUM_PHDRS as u16,
        e_shentsize: Elf64Shdr::SIZE as u16,
        e_shnum: num_shdrs as u16,
        e_shstrndx: SHN_UNDEF,
    };
    ehdr.e_shoff = ehdr.e_phoff + u64::from(ehdr.e_phentsize) * u64::from(ehdr.e_phnum);

    shstrtab.offset = ehdr.e_shoff + (Elf64Shdr::SIZE * num_shdrs) as u64;
    let strtab_start = shstrtab.offset as usize;
    elf[strtab_start..strtab_start + shstrtab.buffer().len()].copy_from_slice(shstrtab.buffer());

    // ---- Program headers and segment bytes --------------------------------
    let mut phdrs = [Elf64Phdr::default(); NUM_PHDRS];
    let mut data_offset_cur = shstrtab.offset + shstrtab.size;

    for kind in SegmentKind::ALL {
        let seg = nx.header.segment(kind);
        let phdr = &mut phdrs[kind as usize];
        phdr.p_type = PT_LOAD;
        phdr.p_flags = match kind {
            SegmentKind::Text => PF_R | PF_X,
            SegmentKind::Rodata => PF_R,
            SegmentKind::Data => PF_R | PF_W,
        };
        phdr.p_vaddr = u64::from(seg.mem_offset);
        phdr.p_paddr = phdr.p_vaddr;
        phdr.p_offset = data_offset_cur;
        phdr.p_filesz = u64::from(seg.mem_size);
        if kind == SegmentKind::Data {
            phdr.p_memsz = u64::from(seg.mem_size) + u64::from(seg.bss_align);
            phdr.p_align = 1;
        } else {
            phdr.p_memsz = phdr.p_filesz;
            phdr.p_align = u64::from(seg.bss_align.max(1));
        }

        let src = util::slice_at(&nx.image, seg.mem_offset as usize, seg.mem_size as usize)?;
        let dst_start = phdr.p_offset as usize;
        elf[dst_start..dst_start + src.len()].copy_from_slice(src);

        // Claimed segment sections can now learn their file offsets.
        let p_vaddr = phdr.p_vaddr;
        let p_offset = phdr.p_offset;
        for shdr in known.values_mut() {
            if shdr.sh_addr == p_vaddr {
                shdr.sh_offset = p_offset;
            }
        }

        data_offset_cur += u64::from(seg.mem_size);
    }

    let loads = [phdrs[0], phdrs[1], phdrs[2]];
    let vaddr_to_foffset = |vaddr: u64| -> u64 {
        loads
            .iter()
            .find(|phdr| phdr.contains_vaddr(vaddr))
            .map(|phdr| phdr.p_offset + (vaddr - phdr.p_vaddr))
            .unwrap_or(0)
    };

    {
        let dyn_phdr = &mut phdrs[SegmentKind::COUNT];
        dyn_phdr.p_type = PT_DYNAMIC;
        dyn_phdr.p_flags = PF_R | PF_W;
        dyn_phdr.p_vaddr = nx.dynamic_off;
        dyn_phdr.p_paddr = nx.dynamic_off;
        dyn_phdr.p_offset = vaddr_to_foffset(nx.dynamic_off);
        dyn_phdr.p_filesz = (nx.dyn_entries * Elf64Dyn::SIZE) as u64;
        dyn_phdr.p_memsz = dyn_phdr.p_filesz;
        dyn_phdr.p_align = 8;
    }
    let dyn_phdr = phdrs[SegmentKind::COUNT];

    // PT_GNU_EH_FRAME only when the frames measured; the slot stays a
    // zeroed PT_NULL otherwise so e_phnum never varies.
    if let Some(eh) = &inventory.eh {
        let eh_phdr = &mut phdrs[SegmentKind::COUNT + 1];
        eh_phdr.p_type = PT_GNU_EH_FRAME;
        eh_phdr.p_flags = PF_R;
        eh_phdr.p_vaddr = eh.hdr_addr;
        eh_phdr.p_paddr = eh.hdr_addr;
        eh_phdr.p_offset = vaddr_to_foffset(eh.hdr_addr);
        eh_phdr.p_filesz = eh.hdr_size;
        eh_phdr.p_memsz = eh.hdr_size;
        eh_phdr.p_align = 4;
    }

    // ---- Section headers --------------------------------------------------
    let mut shdrs = vec![Elf64Shdr::default(); num_shdrs];
    for (&index, shdr) in &known {
        if (index as usize) < shdrs.len() {
            shdrs[index as usize] = *shdr;
        }
    }

    let mut inserter = ShdrInserter {
        shdrs: &mut shdrs,
        known: &known,
    };

    if let Some(size) = inventory.init {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".init"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: nx.dyn_info.init,
            sh_offset: vaddr_to_foffset(nx.dyn_info.init),
            sh_size: size,
            sh_addralign: 4,
            ..Default::default()
        };
        inserter.insert(shdr, true, ".init");
    }

    if let Some(size) = inventory.fini {
        let shdr = Elf64Shdr {
            sh_name: shstrtab.offset_of(".fini"),
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: nx.dyn_info.fini,
            sh_offset: vaddr_to_foffset(nx.dyn_info.fini),
            sh_size: size,
            sh_addralign: 4,
            ..Default::default()
        };
        inserter.insert(shdr, true, ".fini");
    }

    let rodata = nx.header.segment(SegmentKind::Rodata);
    let rodata_phdr = &loads[SegmentKind::Rodata as usize];

    let dynstr_shndx = inserter.insert(
        Elf64Shdr {
            sh_name: shstrtab.offset_of(".dynstr"),
            sh_type: SHT_STRTAB,
            sh_flags: SHF_ALLOC,
            sh_addr: u64::from(rodata.mem_offset) + u64::from(nx.header.dynstr.offset),
            sh_offset: rodata_phdr.p_offset + u64::from(nx.header.dynstr.offset),
            sh_size: u64::from(nx.header.dynstr.size),
            sh_addralign: 1,
            ..Default::default()
        },
        false,
        ".dynstr",
    );

    let last_local = nx
        .dynsym_entries()
        .enumerate()
        .filter(|(_, sym)| sym.bind() == STB_LOCAL)
        .map(|(index, _)| index as u32)
        .max()
        .unwrap_or(0);
    let dynsym_shndx = inserter.insert(
        Elf64Shdr {
            sh_name: shstrtab.offset_of(".dynsym"),
            sh_type: SHT_DYNSYM,
            sh_flags: SHF_ALLOC,
            sh_addr: u64::from(rodata.mem_offset) + u64::from(nx.header.dynsym.offset),
            sh_offset: rodata_phdr.p_offset + u64::from(nx.header.dynsym.offset),
            sh_size: u64::from(nx.header.dynsym.size),
            sh_link: u32::from(dynstr_shndx),
            sh_info: last_local + 1,
            sh_addralign: 8,
            sh_entsize: Elf64Sym::SIZE as u64,
        },
        false,
        ".dynsym",
    );

    inserter.insert(
        Elf64Shdr {
            sh_name: shstrtab.offset_of(".dynamic"),
            sh_type: SHT_DYNAMIC,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            sh_addr: dyn_phdr.p_vaddr,
            sh_offset: dyn_phdr.p_offset,
            sh_size: dyn_phdr.p_filesz,
            sh_link: u32::from(dynstr_shndx),
            sh_addralign: dyn_phdr.p_align,
            sh_entsize: Elf64Dyn::SIZE as u64,
            ..Default::default()
        },
        false,
        ".dynamic",
    );

    inserter.insert(
        Elf64Shdr {
            sh_name: shstrtab.offset_of(".rela.dyn"),
            sh_type: SHT_RELA,
            sh_flags: SHF_ALLOC,
            sh_addr: nx.dyn_info.rela,
            sh_offset: vaddr_to_foffset(nx.dyn_info.rela),
            sh_size: nx.dyn_info.relasz,
            sh_link: u32::from(dynsym_shndx),
            sh_addralign: 8,
            sh_entsize: Elf64Rela::SIZE as u64,
            ..Default::default()
        },
        false,
        ".rela.dyn",
    );

    let mut plt_shndx = SHN_UNDEF;
    if let Some(plt) = &inventory.plt {
        plt_shndx = inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".plt"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                sh_addr: plt.addr,
                sh_offset: vaddr_to_foffset(plt.addr),
                sh_size: plt.size,
                sh_addralign: 0x10,
                sh_entsize: 0x10,
                ..Default::default()
            },
            true,
            ".plt",
        );
    }

    if let Some((addr, size)) = inventory.got {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".got"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_addr: addr,
                sh_offset: vaddr_to_foffset(addr),
                sh_size: size,
                sh_addralign: 8,
                sh_entsize: 8,
                ..Default::default()
            },
            true,
            ".got",
        );
    }

    if let Some((addr, size)) = inventory.got_plt {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".got.plt"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_addr: addr,
                sh_offset: vaddr_to_foffset(addr),
                sh_size: size,
                sh_addralign: 8,
                sh_entsize: 8,
                ..Default::default()
            },
            true,
            ".got.plt",
        );
    }

    if inventory.rela_plt {
        if inventory.plt.is_none() {
            warn!(".rela.plt with no .plt");
        }
        let mut sh_flags = SHF_ALLOC;
        if plt_shndx != SHN_UNDEF {
            sh_flags |= SHF_INFO_LINK;
        }
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".rela.plt"),
                sh_type: SHT_RELA,
                sh_flags,
                sh_addr: nx.dyn_info.jmprel,
                sh_offset: vaddr_to_foffset(nx.dyn_info.jmprel),
                sh_size: nx.dyn_info.pltrelsz,
                sh_link: u32::from(dynsym_shndx),
                sh_info: u32::from(plt_shndx),
                sh_addralign: 8,
                sh_entsize: Elf64Rela::SIZE as u64,
            },
            false,
            ".rela.plt",
        );
    }

    if inventory.init_array {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".init_array"),
                sh_type: SHT_INIT_ARRAY,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_addr: nx.dyn_info.init_array,
                sh_offset: vaddr_to_foffset(nx.dyn_info.init_array),
                sh_size: nx.dyn_info.init_arraysz,
                sh_addralign: 8,
                ..Default::default()
            },
            true,
            ".init_array",
        );
    }

    if inventory.fini_array {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".fini_array"),
                sh_type: SHT_FINI_ARRAY,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_addr: nx.dyn_info.fini_array,
                sh_offset: vaddr_to_foffset(nx.dyn_info.fini_array),
                sh_size: nx.dyn_info.fini_arraysz,
                sh_addralign: 8,
                ..Default::default()
            },
            true,
            ".fini_array",
        );
    }

    if let Some(size) = inventory.hash {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".hash"),
                sh_type: SHT_HASH,
                sh_flags: SHF_ALLOC,
                sh_addr: nx.dyn_info.hash,
                sh_offset: vaddr_to_foffset(nx.dyn_info.hash),
                sh_size: size,
                sh_link: u32::from(dynsym_shndx),
                sh_addralign: 8,
                sh_entsize: 4,
                ..Default::default()
            },
            false,
            ".hash",
        );
    }

    if let Some(size) = inventory.gnu_hash {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".gnu.hash"),
                sh_type: SHT_GNU_HASH,
                sh_flags: SHF_ALLOC,
                sh_addr: nx.dyn_info.gnu_hash,
                sh_offset: vaddr_to_foffset(nx.dyn_info.gnu_hash),
                sh_size: size,
                sh_link: u32::from(dynsym_shndx),
                sh_addralign: 8,
                sh_entsize: 4,
                ..Default::default()
            },
            false,
            ".gnu.hash",
        );
    }

    if let Some((addr, size)) = inventory.note {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".note"),
                sh_type: SHT_NOTE,
                sh_flags: SHF_ALLOC,
                sh_addr: addr,
                sh_offset: vaddr_to_foffset(addr),
                sh_size: size,
                sh_addralign: 4,
                ..Default::default()
            },
            false,
            ".note",
        );
    }

    if let Some(eh) = &inventory.eh {
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".eh_frame_hdr"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC,
                sh_addr: eh.hdr_addr,
                sh_offset: vaddr_to_foffset(eh.hdr_addr),
                sh_size: eh.hdr_size,
                sh_addralign: 4,
                ..Default::default()
            },
            true,
            ".eh_frame_hdr",
        );
        inserter.insert(
            Elf64Shdr {
                sh_name: shstrtab.offset_of(".eh_frame"),
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC,
                sh_addr: eh.frame_addr,
                sh_offset: vaddr_to_foffset(eh.frame_addr),
                sh_size: eh.frame_size,
                sh_addralign: 4,
                ..Default::default()
            },
            true,
            ".eh_frame",
        );
    }

    // e_shstrndx is only assigned once the insertion has succeeded.
    let shstrndx = inserter.insert(
        Elf64Shdr {
            sh_name: shstrtab.offset_of(".shstrtab"),
            sh_type: SHT_STRTAB,
            sh_offset: shstrtab.offset,
            sh_size: shstrtab.buffer().len() as u64,
            sh_addralign: 1,
            ..Default::default()
        },
        false,
        ".shstrtab",
    );
    ehdr.e_shstrndx = shstrndx;

    // ---- Assemble ---------------------------------------------------------
    elf[..Elf64Ehdr::SIZE].copy_from_slice(ehdr.as_bytes());
    for (i, phdr) in phdrs.iter().enumerate() {
        let start = ehdr.e_phoff as usize + i * Elf64Phdr::SIZE;
        elf[start..start + Elf64Phdr::SIZE].copy_from_slice(phdr.as_bytes());
    }
    for (i, shdr) in shdrs.iter().enumerate() {
        let start = ehdr.e_shoff as usize + i * Elf64Shdr::SIZE;
        elf[start..start + Elf64Shdr::SIZE].copy_from_slice(shdr.as_bytes());
    }

    Ok(elf)
}

// =============================================================================
// Section Classification
// =============================================================================

/// Maps a virtual address onto the segment section containing it:
/// `.text`, `.rodata`, `.data`, or (for the data tail) `.bss`. The file
/// offset is fixed up once program-header offsets are assigned.
fn segment_shdr(header: &NsoHeader, shstrtab: &mut StringTable, vaddr: u64) -> Option<Elf64Shdr> {
    for kind in SegmentKind::ALL {
        let seg = header.segment(kind);
        if seg.contains(vaddr) {
            let (name, sh_flags) = match kind {
                SegmentKind::Text => (".text", SHF_ALLOC | SHF_EXECINSTR),
                SegmentKind::Rodata => (".rodata", SHF_ALLOC),
                SegmentKind::Data => (".data", SHF_ALLOC | SHF_WRITE),
            };
            shstrtab.add(name);
            return Some(Elf64Shdr {
                sh_name: shstrtab.offset_of(name),
                sh_type: SHT_PROGBITS,
                sh_flags,
                sh_addr: u64::from(seg.mem_offset),
                sh_size: u64::from(seg.mem_size),
                sh_addralign: 8,
                ..Default::default()
            });
        }
        if kind == SegmentKind::Data
            && vaddr >= seg.mem_end()
            && vaddr <= seg.mem_end() + u64::from(seg.bss_align)
        {
            shstrtab.add(".bss");
            return Some(Elf64Shdr {
                sh_name: shstrtab.offset_of(".bss"),
                sh_type: SHT_NOBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_addr: seg.mem_end(),
                sh_size: u64::from(seg.bss_align),
                sh_addralign: 8,
                ..Default::default()
            });
        }
    }
    None
}

/// Assigns each of `.text`/`.rodata`/`.data`/`.bss` that no `.dynsym`
/// entry claimed to the next free index, preserving the indices that were
/// claimed.
fn backfill_standard_sections(
    header: &NsoHeader,
    shstrtab: &mut StringTable,
    known: &mut BTreeMap<u16, Elf64Shdr>,
) {
    let next_free = |known: &BTreeMap<u16, Elf64Shdr>, start: u16| -> Option<u16> {
        (start + 1..SHN_LORESERVE).find(|index| !known.contains_key(index))
    };

    let text = header.segment(SegmentKind::Text);
    let rodata = header.segment(SegmentKind::Rodata);
    let data = header.segment(SegmentKind::Data);
    let candidates: [(&str, u64, bool); 4] = [
        (".text", u64::from(text.mem_offset), text.mem_size > 0),
        (".rodata", u64::from(rodata.mem_offset), rodata.mem_size > 0),
        (".data", u64::from(data.mem_offset), data.mem_size > 0),
        (".bss", data.mem_end(), data.bss_align > 0),
    ];

    let mut shndx = next_free(known, SHN_UNDEF);
    for (name, vaddr, wanted) in candidates {
        let Some(index) = shndx else { return };
        if wanted && !shstrtab.contains(name) {
            if let Some(shdr) = segment_shdr(header, shstrtab, vaddr) {
                known.insert(index, shdr);
                shndx = next_free(known, index);
            }
        }
    }
}

// =============================================================================
// Section Inventory
// =============================================================================

/// The conditional sections this image gets, with their resolved sizes.
#[derive(Debug, Default)]
struct Inventory {
    plt: Option<PltInfo>,
    got: Option<(u64, u64)>,
    got_plt: Option<(u64, u64)>,
    rela_plt: bool,
    hash: Option<u64>,
    gnu_hash: Option<u64>,
    init: Option<u64>,
    fini: Option<u64>,
    init_array: bool,
    fini_array: bool,
    note: Option<(u64, u64)>,
    eh: Option<EhInfo>,
}

impl Inventory {
    fn plan(nx: &NxFile, profile: &Profile) -> Self {
        let dyn_info = &nx.dyn_info;
        let mut inv = Inventory {
            plt: nx.plt_info,
            ..Default::default()
        };

        if profile.jump_slot_end != 0 && dyn_info.pltgot != 0 {
            inv.got_plt = Some((dyn_info.pltgot, profile.jump_slot_end - dyn_info.pltgot));
        }
        if let Some(got_addr) = profile.got_addr {
            if dyn_info.rela != 0 {
                inv.got = Some((got_addr, profile.glob_dat_end - got_addr));
            }
        }
        inv.rela_plt = inv.got_plt.is_some() && dyn_info.jmprel != 0 && dyn_info.pltrelsz != 0;

        if dyn_info.hash != 0 {
            inv.hash = hash_size(&nx.image, dyn_info.hash);
        }
        if dyn_info.gnu_hash != 0 {
            inv.gnu_hash = gnu_hash_size(&nx.image, dyn_info.gnu_hash, nx.dynsym_count() as u64);
        }

        inv.init = profile.init_size.filter(|_| dyn_info.init != 0);
        inv.fini = profile.fini_size.filter(|_| dyn_info.fini != 0);
        inv.init_array = dyn_info.init_array != 0 && dyn_info.init_arraysz != 0;
        inv.fini_array = dyn_info.fini_array != 0 && dyn_info.fini_arraysz != 0;

        if let Some(note_off) = nx.note_off {
            if let Some(span) = locate::note_span(&nx.image, note_off) {
                inv.note = Some((note_off, span));
            }
        }
        inv.eh = profile.eh;

        inv
    }

    /// How many section headers the conditional inventory consumes.
    fn count(&self) -> i64 {
        let mut count = 0;
        count += i64::from(self.plt.is_some());
        count += i64::from(self.got.is_some());
        count += i64::from(self.got_plt.is_some());
        count += i64::from(self.rela_plt);
        count += i64::from(self.hash.is_some());
        count += i64::from(self.gnu_hash.is_some());
        count += i64::from(self.init.is_some());
        count += i64::from(self.fini.is_some());
        count += i64::from(self.init_array);
        count += i64::from(self.fini_array);
        count += i64::from(self.note.is_some());
        count += 2 * i64::from(self.eh.is_some());
        count
    }

    fn add_names(&self, shstrtab: &mut StringTable) {
        let names: [(bool, &str); 12] = [
            (self.plt.is_some(), ".plt"),
            (self.got.is_some(), ".got"),
            (self.got_plt.is_some(), ".got.plt"),
            (self.rela_plt, ".rela.plt"),
            (self.hash.is_some(), ".hash"),
            (self.gnu_hash.is_some(), ".gnu.hash"),
            (self.init.is_some(), ".init"),
            (self.fini.is_some(), ".fini"),
            (self.init_array, ".init_array"),
            (self.fini_array, ".fini_array"),
            (self.note.is_some(), ".note"),
            (self.eh.is_some(), ".eh_frame_hdr"),
        ];
        for (wanted, name) in names {
            if wanted {
                shstrtab.add(name);
            }
        }
        if self.eh.is_some() {
            shstrtab.add(".eh_frame");
        }
    }
}

/// `.hash` size from the on-image table head: two counting words plus the
/// bucket and chain arrays.
fn hash_size(image: &[u8], addr: u64) -> Option<u64> {
    let nbucket = util::read_u32_at(image, addr as usize).ok()?;
    let nchain = util::read_u32_at(image, addr as usize + 4).ok()?;
    Some(8 + 4 * (u64::from(nbucket) + u64::from(nchain)))
}

/// `.gnu.hash` size from the on-image table head: the four-word header,
/// the bloom filter, the buckets, and one chain word per covered symbol.
fn gnu_hash_size(image: &[u8], addr: u64, dynsymcount: u64) -> Option<u64> {
    let base = addr as usize;
    let nbuckets = u64::from(util::read_u32_at(image, base).ok()?);
    let symndx = u64::from(util::read_u32_at(image, base + 4).ok()?);
    let maskwords = u64::from(util::read_u32_at(image, base + 8).ok()?);
    Some(16 + maskwords * 8 + nbuckets * 4 + dynsymcount.checked_sub(symndx)? * 4)
}

// =============================================================================
// Index Allocation
// =============================================================================

/// Places section headers into free slots, honoring the ordering
/// constraint for address-carrying sections.
struct ShdrInserter<'a> {
    shdrs: &'a mut [Elf64Shdr],
    known: &'a BTreeMap<u16, Elf64Shdr>,
}

impl ShdrInserter<'_> {
    /// Inserts `shdr` at the first free index. With `ordered`, the index
    /// must exceed that of the claimed section containing `sh_addr`; when
    /// no such slot is free the constraint is dropped with a warning
    /// rather than losing the section.
    fn insert(&mut self, shdr: Elf64Shdr, ordered: bool, name: &str) -> u16 {
        let mut start: u16 = 1;
        if ordered {
            for (&index, known_shdr) in self.known {
                if shdr.sh_addr >= known_shdr.sh_addr
                    && shdr.sh_addr < known_shdr.sh_addr + known_shdr.sh_size
                {
                    start = index + 1;
                }
            }
        }

        if let Some(index) = self.place(shdr, start) {
            return index;
        }
        if ordered && start != 1 {
            let err = Error::SectionSlotExhausted { addr: shdr.sh_addr };
            warn!("{}: {}", name, err);
            if let Some(index) = self.place(shdr, 1) {
                return index;
            }
        }
        warn!("failed to insert new shdr for {}", name);
        SHN_UNDEF
    }

    fn place(&mut self, shdr: Elf64Shdr, start: u16) -> Option<u16> {
        for index in start as usize..self.shdrs.len() {
            if self.shdrs[index].sh_type == SHT_NULL {
                self.shdrs[index] = shdr;
                return Some(index as u16);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserter_ordered_after_containing_section() {
        let mut known = BTreeMap::new();
        known.insert(
            1,
            Elf64Shdr {
                sh_addr: 0x0,
                sh_size: 0x1000,
                sh_type: SHT_PROGBITS,
                ..Default::default()
            },
        );
        known.insert(
            3,
            Elf64Shdr {
                sh_addr: 0x1000,
                sh_size: 0x1000,
                sh_type: SHT_PROGBITS,
                ..Default::default()
            },
        );
        let mut shdrs = vec![Elf64Shdr::default(); 6];
        shdrs[1] = known[&1];
        shdrs[3] = known[&3];
        let mut inserter = ShdrInserter {
            shdrs: &mut shdrs,
            known: &known,
        };

        // Address inside the section at index 3 -> lands after it.
        let shdr = Elf64Shdr {
            sh_addr: 0x1800,
            sh_type: SHT_PROGBITS,
            sh_size: 8,
            ..Default::default()
        };
        assert_eq!(inserter.insert(shdr, true, ".x"), 4);
        // Unordered fills the lowest hole.
        let shdr = Elf64Shdr {
            sh_type: SHT_STRTAB,
            ..Default::default()
        };
        assert_eq!(inserter.insert(shdr, false, ".y"), 2);
    }

    #[test]
    fn test_inserter_falls_back_when_constrained_slots_run_out() {
        let mut known = BTreeMap::new();
        known.insert(
            3,
            Elf64Shdr {
                sh_addr: 0x0,
                sh_size: 0x1000,
                sh_type: SHT_PROGBITS,
                ..Default::default()
            },
        );
        let mut shdrs = vec![Elf64Shdr::default(); 4];
        shdrs[3] = known[&3];
        let mut inserter = ShdrInserter {
            shdrs: &mut shdrs,
            known: &known,
        };
        // Only slots 1 and 2 are free, both below the required start of 4.
        let shdr = Elf64Shdr {
            sh_addr: 0x10,
            sh_type: SHT_PROGBITS,
            sh_size: 8,
            ..Default::default()
        };
        assert_eq!(inserter.insert(shdr, true, ".x"), 1);
    }

    #[test]
    fn test_hash_sizes() {
        let mut image = vec![0u8; 0x40];
        image[0..4].copy_from_slice(&3u32.to_le_bytes()); // nbucket
        image[4..8].copy_from_slice(&5u32.to_le_bytes()); // nchain
        assert_eq!(hash_size(&image, 0), Some(8 + 4 * 8));

        let mut image = vec![0u8; 0x40];
        image[0..4].copy_from_slice(&2u32.to_le_bytes()); // nbuckets
        image[4..8].copy_from_slice(&1u32.to_le_bytes()); // symndx
        image[8..12].copy_from_slice(&1u32.to_le_bytes()); // maskwords
        assert_eq!(gnu_hash_size(&image, 0, 6), Some(16 + 8 + 8 + 20));
    }
}
