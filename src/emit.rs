//! Stage 10: byte emission
//!
//! Layout handed every chunk a disjoint `[sh_offset, sh_offset+sh_size)`
//! range, so chunks write independently. Input sections are copied first,
//! then the relocation applier patches them in place (REL-format addends
//! and relaxation templates read the copied bytes back).

use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::elf::{
    Ehdr, Machine, Shdr, ET_DYN, ET_EXEC, ET_REL, SHF_ALLOC, SHF_EXECINSTR, SHN_LORESERVE,
    SHN_XINDEX, SHT_NOBITS,
};
use crate::error::Result;
use crate::output::{dynamic, dynsym, ehframe, got, notes, symtab, versions, ChunkKind};

/// ARM in big-endian mode writes BE8: instruction byte-swapping happens
/// at the very end of emission, driven by mapping symbols.
fn machine_eflags(cx: &Context) -> u32 {
    match cx.target.info().machine {
        // EF_ARM_EABI_VER5, plus EF_ARM_BE8 for big-endian output.
        Machine::Arm32 => {
            let mut flags = 0x0500_0000;
            if cx.target.info().endian == crate::elf::Endian::Big {
                flags |= 0x0080_0000;
            }
            flags
        }
        // EF_RISCV_FLOAT_ABI_DOUBLE | EF_RISCV_RVC
        Machine::Riscv => 0x0005,
        _ => 0,
    }
}

fn copy_ehdr(cx: &Context, out: &mut [u8]) {
    let info = cx.target.info();
    let num_sections = cx.chunks.iter().filter(|c| !c.is_header()).count() as u64 + 1;
    let shstrndx = cx
        .refs
        .shstrtab
        .map(|c| cx.chunk(c).shndx)
        .unwrap_or(0);

    let ehdr = Ehdr {
        class: cx.enc.class.ident_byte(),
        data: cx.enc.endian.ident_byte(),
        osabi: 0,
        e_type: if cx.options.relocatable {
            ET_REL
        } else if cx.options.pic() {
            ET_DYN
        } else {
            ET_EXEC
        },
        e_machine: info.machine as u16,
        e_entry: if cx.options.relocatable {
            0
        } else {
            crate::layout::entry_addr(cx)
        },
        e_phoff: cx
            .refs
            .phdr
            .map(|c| cx.chunk(c).shdr.sh_offset)
            .unwrap_or(0),
        e_shoff: cx
            .refs
            .shdr
            .map(|c| cx.chunk(c).shdr.sh_offset)
            .unwrap_or(0),
        e_flags: machine_eflags(cx),
        e_phentsize: crate::elf::Phdr::size(cx.enc.class) as u16,
        e_phnum: cx.phdrs.len() as u16,
        e_shentsize: Shdr::size(cx.enc.class) as u16,
        e_shnum: if num_sections >= 0xff00 {
            0
        } else {
            num_sections as u16
        },
        e_shstrndx: if shstrndx as u64 >= SHN_LORESERVE as u64 {
            SHN_XINDEX as u16
        } else {
            shstrndx as u16
        },
    };
    ehdr.write(cx.enc, out);
}

fn copy_phdr(cx: &Context, out: &mut [u8]) {
    let Some(phdr) = cx.refs.phdr else { return };
    let base = cx.chunk(phdr).shdr.sh_offset as usize;
    let entsize = crate::elf::Phdr::size(cx.enc.class);
    for (i, p) in cx.phdrs.iter().enumerate() {
        p.write_at(cx.enc, out, base + i * entsize);
    }
}

fn copy_shdr(cx: &Context, out: &mut [u8]) {
    let Some(shdr) = cx.refs.shdr else { return };
    let base = cx.chunk(shdr).shdr.sh_offset as usize;
    let entsize = Shdr::size(cx.enc.class);
    let num_sections = cx.chunks.iter().filter(|c| !c.is_header()).count() as u64 + 1;
    let shstrndx = cx.refs.shstrtab.map(|c| cx.chunk(c).shndx).unwrap_or(0);

    // Section zero carries the real counts when they overflow the ELF
    // header's 16-bit fields.
    let mut null = Shdr::default();
    if num_sections >= 0xff00 {
        null.sh_size = num_sections;
    }
    if shstrndx as u64 >= SHN_LORESERVE as u64 {
        null.sh_link = shstrndx;
    }
    null.write_at(cx.enc, out, base);

    for chunk in &cx.chunks {
        if chunk.is_header() {
            continue;
        }
        chunk
            .shdr
            .write_at(cx.enc, out, base + chunk.shndx as usize * entsize);
    }
}

fn copy_output_section(cx: &Context, chunk_idx: usize, out: &mut [u8]) -> Result<()> {
    let info = cx.target.info();
    let (members, base, size, is_exec, nobits) = {
        let chunk = &cx.chunks[chunk_idx];
        let ChunkKind::OutputSection(data) = &chunk.kind else {
            return Ok(());
        };
        (
            data.members.clone(),
            chunk.shdr.sh_offset as usize,
            chunk.shdr.sh_size as usize,
            chunk.shdr.sh_flags & SHF_EXECINSTR != 0,
            chunk.shdr.sh_type == SHT_NOBITS,
        )
    };
    if nobits {
        return Ok(());
    }

    // Copy contents and clear the alignment gaps. Executable gaps get
    // trap instructions so a disassembler doesn't wander into padding.
    for (i, r) in members.iter().enumerate() {
        let file = &cx.objs[r.file as usize];
        let isec = cx.isec(*r);
        if isec.shdr.sh_type != SHT_NOBITS {
            let bytes = file.section_bytes(isec);
            out[base + isec.offset as usize..base + isec.offset as usize + bytes.len()]
                .copy_from_slice(bytes);
        }

        let this_end = (isec.offset + isec.sh_size()) as usize;
        let next_start = members
            .get(i + 1)
            .map(|n| cx.isec(*n).offset as usize)
            .unwrap_or(size);
        if is_exec && next_start > this_end {
            let filler = info.filler;
            let gap = &mut out[base + this_end..base + next_start];
            for chunk in gap.chunks_mut(filler.len()) {
                let n = chunk.len().min(filler.len());
                chunk[..n].copy_from_slice(&filler[..n]);
            }
        }
    }

    // Apply relocations member by member. Relocatable output keeps the
    // raw bytes and re-emits the relocations instead.
    if !cx.options.relocatable {
        for r in &members {
            let isec = cx.isec(*r);
            if isec.rels.is_empty() {
                continue;
            }
            if isec.shdr.sh_flags & SHF_ALLOC != 0 {
                cx.target.apply_reloc_alloc(cx, r.file, r.shndx, out)?;
            } else {
                cx.target.apply_reloc_nonalloc(cx, r.file, r.shndx, out)?;
            }
        }
    }

    // Promoted absolute relocations and their dynamic entries.
    if !cx.options.relocatable {
        got::copy_osec_abs_rels(cx, chunk_idx, out);
    }

    // Thunk islands.
    let chunk = &cx.chunks[chunk_idx];
    if let ChunkKind::OutputSection(data) = &chunk.kind {
        for thunk in &data.thunks {
            let island_off = base + thunk.offset as usize;
            if info.thunk_hdr_size > 0 {
                let buf = &mut out[island_off..island_off + info.thunk_hdr_size as usize];
                cx.target.write_thunk_header(cx, buf);
            }
            for (i, &sym) in thunk.symbols.iter().enumerate() {
                let entry_addr = chunk.shdr.sh_addr
                    + thunk.offset
                    + info.thunk_hdr_size
                    + i as u64 * info.thunk_size;
                let off = island_off
                    + info.thunk_hdr_size as usize
                    + i * info.thunk_size as usize;
                let buf = &mut out[off..off + info.thunk_size as usize];
                cx.target.write_thunk_entry(cx, buf, entry_addr, sym);
            }
        }
    }
    Ok(())
}

fn copy_interp(cx: &Context, out: &mut [u8]) {
    let Some(interp) = cx.refs.interp else { return };
    let Some(path) = &cx.options.dynamic_linker else {
        return;
    };
    let base = cx.chunk(interp).shdr.sh_offset as usize;
    out[base..base + path.len()].copy_from_slice(path.as_bytes());
}

/// Write every chunk into a fresh buffer and return it
pub fn emit(cx: &mut Context) -> Result<Vec<u8>> {
    let mut out = vec![0u8; cx.filesize as usize];

    for c in 0..cx.chunks.len() {
        match &cx.chunks[c].kind {
            ChunkKind::Ehdr => copy_ehdr(cx, &mut out),
            ChunkKind::Phdr => copy_phdr(cx, &mut out),
            ChunkKind::Shdr => copy_shdr(cx, &mut out),
            ChunkKind::Interp => copy_interp(cx, &mut out),
            ChunkKind::OutputSection(_) => copy_output_section(cx, c, &mut out)?,
            ChunkKind::Merged(m) => got::copy_merged(cx, *m as usize, &mut out),
            ChunkKind::Got => got::copy_got(cx, &mut out),
            ChunkKind::GotPlt => got::copy_gotplt(cx, &mut out),
            ChunkKind::Plt => got::copy_plt(cx, &mut out),
            ChunkKind::PltGot => got::copy_pltgot(cx, &mut out),
            ChunkKind::RelPlt => got::copy_relplt(cx, &mut out),
            ChunkKind::RelrDyn => got::copy_relrdyn(cx, &mut out),
            ChunkKind::RelDyn => {} // written by its contributors
            ChunkKind::Dynsym => dynsym::copy_dynsym(cx, &mut out),
            ChunkKind::Dynstr(_) => dynsym::copy_dynstr(cx, &mut out),
            ChunkKind::Hash => dynsym::copy_hash(cx, &mut out),
            ChunkKind::GnuHash => dynsym::copy_gnu_hash(cx, &mut out),
            ChunkKind::Versym(_) | ChunkKind::Verneed(_) | ChunkKind::Verdef(_) => {}
            ChunkKind::Dynamic => dynamic::copy_dynamic(cx, &mut out),
            ChunkKind::Copyrel => {
                let relro = cx.chunks[c].is_relro;
                got::copy_copyrel(cx, &mut out, relro);
            }
            ChunkKind::EhFrame => ehframe::copy(cx, &mut out)?,
            ChunkKind::EhFrameHdr => {} // written together with .eh_frame
            ChunkKind::NoteBuildId | ChunkKind::NoteProperty { .. } | ChunkKind::NotePackage => {}
            ChunkKind::Symtab => symtab::copy_symtab(cx, &mut out),
            ChunkKind::Strtab(_) => {} // written together with .symtab
            ChunkKind::Shstrtab(_) => symtab::copy_strtab_pools(cx, &mut out),
            ChunkKind::RelroPadding => {}
            ChunkKind::RelocSec(_) => {
                crate::output::relocatable::copy_reloc_section(cx, c, &mut out)
            }
            ChunkKind::ComdatGroups(_) => {
                crate::output::relocatable::copy_comdat_groups(cx, c, &mut out)
            }
        }
    }
    versions::copy_versions(cx, &mut out);
    notes::copy_notes(cx, &mut out);

    if cx.options.z_rewrite_endbr && cx.target.info().machine == Machine::X86_64 {
        crate::arch::x86_64::rewrite_endbr(cx, &mut out);
    }

    if cx.target.info().machine == Machine::Arm32 && !cx.options.relocatable {
        crate::arch::arm32::sort_exidx(cx, &mut out);
        if cx.target.info().endian == crate::elf::Endian::Big {
            crate::arch::arm32::be8_swap_bytes(cx, &mut out);
        }
    }

    // The build-id hashes everything, so it goes in dead last.
    notes::write_build_id(cx, &mut out);
    Ok(out)
}

/// Sanity pass used by tests and by callers that want the §8 layout
/// invariants checked on the finished context.
pub fn verify_layout(cx: &Context) -> Result<()> {
    for p in &cx.phdrs {
        if p.p_type == crate::elf::PT_LOAD && p.p_align > 1 {
            let ok = p.p_vaddr % p.p_align == p.p_offset % p.p_align;
            if !ok {
                return Err(crate::error::Error::internal(format!(
                    "PT_LOAD congruence violated: vaddr {:#x} offset {:#x} align {:#x}",
                    p.p_vaddr, p.p_offset, p.p_align
                )));
            }
        }
        if p.p_type == crate::elf::PT_GNU_RELRO {
            let end = p.p_vaddr + p.p_memsz;
            if end % cx.page_size() != 0 {
                return Err(crate::error::Error::internal(format!(
                    "PT_GNU_RELRO does not end at a page boundary: {end:#x}"
                )));
            }
        }
    }

    // Alive input sections must occupy disjoint, aligned ranges.
    for chunk in &cx.chunks {
        let ChunkKind::OutputSection(data) = &chunk.kind else {
            continue;
        };
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for r in &data.members {
            let isec = cx.isec(*r);
            if !isec.is_alive.load(Ordering::Relaxed) {
                continue;
            }
            if isec.offset % (1 << isec.p2align) != 0 {
                return Err(crate::error::Error::internal(format!(
                    "misaligned section {} in {}",
                    isec.name, chunk.name
                )));
            }
            ranges.push((isec.offset, isec.offset + isec.sh_size()));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(crate::error::Error::internal(format!(
                    "overlapping sections in {}",
                    chunk.name
                )));
            }
        }
    }
    Ok(())
}

/// Compress eligible debug sections in place after emission, rebuilding
/// the tail of the file. The raw compressor is the driver's callback;
/// this function handles only the ELF container framing.
pub fn compress_debug_sections(cx: &mut Context, out: Vec<u8>) -> Result<Vec<u8>> {
    use crate::options::CompressKind;
    let Some(compress) = cx.options.compress_fn else {
        return Ok(out);
    };
    let ch_type = match cx.options.compress_debug_sections {
        CompressKind::None => return Ok(out),
        CompressKind::Zlib => crate::elf::ELFCOMPRESS_ZLIB,
        CompressKind::Zstd => crate::elf::ELFCOMPRESS_ZSTD,
    };

    // Collect compressed payloads for eligible chunks.
    let chdr_size = crate::elf::Chdr::size(cx.enc.class);
    let mut payloads: Vec<(usize, Vec<u8>)> = Vec::new();
    for (i, chunk) in cx.chunks.iter().enumerate() {
        if chunk.shdr.sh_flags & SHF_ALLOC != 0
            || !chunk.name.starts_with(".debug")
            || chunk.shdr.sh_size == 0
        {
            continue;
        }
        let start = chunk.shdr.sh_offset as usize;
        let end = start + chunk.shdr.sh_size as usize;
        let mut framed = vec![0u8; chdr_size];
        crate::elf::Chdr {
            ch_type,
            ch_size: chunk.shdr.sh_size,
            ch_addralign: chunk.shdr.sh_addralign,
        }
        .write_at(cx.enc, &mut framed, 0);
        framed.extend(compress(&out[start..end]));
        payloads.push((i, framed));
    }
    if payloads.is_empty() {
        return Ok(out);
    }

    let compressed: std::collections::HashSet<usize> =
        payloads.iter().map(|(i, _)| *i).collect();
    for (i, framed) in &payloads {
        let chunk = &mut cx.chunks[*i];
        chunk.shdr.sh_flags |= crate::elf::SHF_COMPRESSED;
        chunk.shdr.sh_size = framed.len() as u64;
    }

    // The non-alloc tail moved; re-layout it and rewrite every chunk that
    // lives there. Alloc chunks kept their offsets and are copied as-is.
    let filesize = crate::layout::assign_offsets(cx);
    cx.filesize = filesize;
    let mut new_out = vec![0u8; filesize as usize];
    let alloc_end = cx
        .chunks
        .iter()
        .filter(|c| c.shdr.sh_flags & SHF_ALLOC != 0 && c.shdr.sh_type != SHT_NOBITS)
        .map(|c| (c.shdr.sh_offset + c.shdr.sh_size) as usize)
        .max()
        .unwrap_or(0)
        .min(out.len());
    new_out[..alloc_end].copy_from_slice(&out[..alloc_end]);

    for c in 0..cx.chunks.len() {
        if cx.chunks[c].shdr.sh_flags & SHF_ALLOC != 0 || compressed.contains(&c) {
            continue;
        }
        match &cx.chunks[c].kind {
            ChunkKind::OutputSection(_) => copy_output_section(cx, c, &mut new_out)?,
            ChunkKind::Merged(m) => got::copy_merged(cx, *m as usize, &mut new_out),
            ChunkKind::Symtab => symtab::copy_symtab(cx, &mut new_out),
            ChunkKind::Shstrtab(_) => symtab::copy_strtab_pools(cx, &mut new_out),
            ChunkKind::Shdr => copy_shdr(cx, &mut new_out),
            _ => {}
        }
    }
    copy_ehdr(cx, &mut new_out);
    for (i, framed) in &payloads {
        let chunk = &cx.chunks[*i];
        let base = chunk.shdr.sh_offset as usize;
        new_out[base..base + framed.len()].copy_from_slice(framed);
    }
    notes::write_build_id(cx, &mut new_out);
    Ok(new_out)
}
