//! `-r` / `--emit-relocs` support
//!
//! Relocatable output keeps combining input sections but re-emits their
//! relocations, rewritten against the output symbol table: references
//! through section symbols move to the output section's section symbol
//! with the input section's offset folded into the addend. `-r` also
//! re-emits the surviving comdat groups so a later final link can keep
//! discarding duplicates.

use crate::context::Context;
use crate::elf::{Rel, GRP_COMDAT, SHF_GROUP, SHT_GROUP, SHT_REL, SHT_RELA, STT_SECTION};
use crate::output::{Chunk, ChunkKind};
use crate::symbol::{FileId, SymbolId};

/// Create one relocation-table chunk per output section that has any
/// member relocations, plus the comdat-group table for `-r`.
pub fn prepare(cx: &mut Context) {
    let info = cx.target.info();
    let entsize = Rel::entry_size(cx.enc.class, info.is_rela) as u64;

    let mut new_chunks: Vec<Chunk> = Vec::new();
    for (c, chunk) in cx.chunks.iter().enumerate() {
        let ChunkKind::OutputSection(data) = &chunk.kind else {
            continue;
        };
        let count: usize = data
            .members
            .iter()
            .map(|r| cx.isec(*r).rels.len())
            .sum();
        if count == 0 {
            continue;
        }
        let prefix = if info.is_rela { ".rela" } else { ".rel" };
        let mut rsec = Chunk::new(
            format!("{prefix}{}", chunk.name),
            ChunkKind::RelocSec(c as u32),
        );
        rsec.shdr.sh_type = if info.is_rela { SHT_RELA } else { SHT_REL };
        rsec.shdr.sh_flags = crate::elf::SHF_INFO_LINK;
        rsec.shdr.sh_entsize = entsize;
        rsec.shdr.sh_addralign = cx.word_size();
        rsec.shdr.sh_size = count as u64 * entsize;
        new_chunks.push(rsec);
    }
    for chunk in new_chunks {
        cx.push_chunk(chunk);
    }

    if cx.options.relocatable {
        let mut groups: Vec<(SymbolId, Vec<u32>)> = Vec::new();
        for f in 0..cx.objs.len() {
            if !cx.objs[f].is_alive {
                continue;
            }
            for g in 0..cx.objs[f].comdat_groups.len() {
                let sig = cx.objs[f].comdat_groups[g].signature.clone();
                if sig.is_empty() {
                    continue;
                }
                if cx.comdat_owners.get(&sig).map(|&(_, owner)| owner) != Some(f as u32) {
                    continue;
                }
                let Some(id) = cx.find_symbol(&sig) else { continue };
                let members: Vec<u32> = cx.objs[f].comdat_groups[g].members.clone();
                groups.push((id, members));
            }
        }
        if !groups.is_empty() {
            let size: u64 = groups
                .iter()
                .map(|(_, members)| 4 + members.len() as u64 * 4)
                .sum();
            let mut gsec = Chunk::new(".group", ChunkKind::ComdatGroups(groups));
            gsec.shdr.sh_type = SHT_GROUP;
            gsec.shdr.sh_entsize = 4;
            gsec.shdr.sh_addralign = 4;
            gsec.shdr.sh_size = size;
            cx.push_chunk(gsec);
        }
    }
}

/// Wire `sh_link`/`sh_info` once section indices exist
pub fn wire_links(cx: &mut Context) {
    let symtab_shndx = cx.refs.symtab.map(|c| cx.chunk(c).shndx).unwrap_or(0);
    let targets: Vec<(usize, u32)> = cx
        .chunks
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c.kind {
            ChunkKind::RelocSec(target) => {
                Some((i, cx.chunks[target as usize].shndx))
            }
            _ => None,
        })
        .collect();
    for (i, target_shndx) in targets {
        cx.chunks[i].shdr.sh_link = symtab_shndx;
        cx.chunks[i].shdr.sh_info = target_shndx;
    }
    for chunk in cx.chunks.iter_mut() {
        if matches!(chunk.kind, ChunkKind::ComdatGroups(_)) {
            chunk.shdr.sh_link = symtab_shndx;
        }
    }
}

/// The output symbol-table index a relocation against `id` should use
fn output_sym_idx(cx: &Context, fid: u32, rel: &Rel) -> (u32, i64) {
    let file = &cx.objs[fid as usize];
    let esym = file.elf_syms[rel.r_sym as usize];
    let id = file.symbols[rel.r_sym as usize];
    let sym = cx.sym(id);

    if esym.ty() == STT_SECTION {
        // References into a mergeable section follow the fragment to the
        // merged output section.
        if let Some(Some(m)) = file.mergeable.get(esym.st_shndx as usize) {
            let addend = rel.r_addend;
            if let Some((piece, off)) = m.piece_at(esym.st_value.wrapping_add(addend as u64)) {
                if let Some(&frag) = m.fragments.get(piece) {
                    let msec = &cx.merged[frag.msec as usize];
                    if let Some(chunk) = msec.chunk {
                        let frag_off = msec.frags[frag.frag as usize].offset as i64;
                        return (cx.chunk(chunk).shndx, frag_off + off as i64 - addend);
                    }
                }
            }
            return (0, 0);
        }
        // Rebind to the output section's section symbol; the member's
        // offset within it moves into the addend.
        if let Some(r) = sym.input_section() {
            let isec = cx.isec(r);
            if let Some(osec) = isec.osec {
                return (cx.chunk(osec).shndx, isec.offset as i64);
            }
        }
        return (0, 0);
    }

    let owner = match sym.file {
        Some(FileId::Obj(f)) => f,
        _ => fid,
    };
    let file = &cx.objs[owner as usize];
    let idx = sym.sym_idx as usize;
    if let Some(&out_idx) = file.output_sym_indices.get(idx) {
        if out_idx >= 0 {
            let base = if idx < file.first_global {
                file.local_symtab_idx
            } else {
                file.global_symtab_idx
            };
            return ((base + out_idx as usize) as u32, 0);
        }
    }
    (0, 0)
}

pub fn copy_reloc_section(cx: &Context, chunk_idx: usize, out: &mut [u8]) {
    let chunk = &cx.chunks[chunk_idx];
    let ChunkKind::RelocSec(target) = chunk.kind else {
        return;
    };
    let target_chunk = &cx.chunks[target as usize];
    let ChunkKind::OutputSection(data) = &target_chunk.kind else {
        return;
    };
    let info = cx.target.info();
    let enc = cx.enc;
    let entsize = Rel::entry_size(enc.class, info.is_rela);
    let base = chunk.shdr.sh_offset as usize;

    let mut slot = 0usize;
    for r in &data.members {
        let file = &cx.objs[r.file as usize];
        let isec = cx.isec(*r);
        let member_base = (target_chunk.shdr.sh_offset + isec.offset) as usize;
        for rel in file.section_rels(isec) {
            let (r_sym, extra_addend) = output_sym_idx(cx, r.file, rel);
            let out_rel = Rel {
                r_offset: target_chunk.shdr.sh_addr + isec.offset + rel.r_offset,
                r_sym,
                r_type: rel.r_type,
                r_addend: rel.r_addend + extra_addend,
            };
            out_rel.write_at(enc, info.is_rela, out, base + slot * entsize);
            slot += 1;

            // REL-format addends live in the section bytes; rebase them
            // in place when a section symbol moved.
            if !info.is_rela && extra_addend != 0 {
                let contents = &out[member_base..];
                let old = cx.target.get_addend(contents, rel);
                let rel_copy = *rel;
                cx.target
                    .write_addend(&mut out[member_base..], &rel_copy, old + extra_addend);
            }
        }
    }
}

pub fn copy_comdat_groups(cx: &Context, chunk_idx: usize, out: &mut [u8]) {
    let chunk = &cx.chunks[chunk_idx];
    let ChunkKind::ComdatGroups(groups) = &chunk.kind else {
        return;
    };
    let enc = cx.enc;
    let base = chunk.shdr.sh_offset as usize;
    let mut pos = base;
    for (id, members) in groups {
        enc.put_u32(out, pos, GRP_COMDAT);
        pos += 4;
        let sym = cx.sym(*id);
        for &m in members {
            // Member indices translate to the output sections the
            // surviving input sections landed in.
            let shndx = sym
                .file
                .and_then(|f| match f {
                    FileId::Obj(owner) => cx.objs[owner as usize]
                        .sections
                        .get(m as usize)
                        .and_then(|s| s.as_ref())
                        .and_then(|isec| isec.osec)
                        .map(|c| cx.chunk(c).shndx),
                    FileId::Dso(_) => None,
                })
                .unwrap_or(0);
            enc.put_u32(out, pos, shndx);
            pos += 4;
        }
    }
}

/// The group signature symbol's flags require its members to stay
/// grouped; mark the member output sections accordingly.
pub fn mark_group_sections(cx: &mut Context) {
    if !cx.options.relocatable {
        return;
    }
    let mut mark: Vec<u32> = Vec::new();
    for chunk in &cx.chunks {
        if let ChunkKind::ComdatGroups(groups) = &chunk.kind {
            for (id, members) in groups {
                let Some(FileId::Obj(owner)) = cx.sym(*id).file else {
                    continue;
                };
                for &m in members {
                    if let Some(Some(isec)) = cx.objs[owner as usize].sections.get(m as usize) {
                        if let Some(osec) = isec.osec {
                            mark.push(osec.0);
                        }
                    }
                }
            }
        }
    }
    for c in mark {
        cx.chunks[c as usize].shdr.sh_flags |= SHF_GROUP;
    }
}
