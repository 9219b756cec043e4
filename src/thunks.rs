//! Range-extension thunks
//!
//! On machines whose branch immediates cannot span the whole address
//! space (and on ARM32, where a plain branch cannot switch between ARM
//! and Thumb), branches may need to go through a linker-synthesized
//! veneer. Islands of veneers are interleaved with the input sections so
//! that every branch has one within reach; the applier then picks the
//! nearest island entry for its target.

use std::collections::BTreeSet;

use crate::context::Context;
use crate::elf::{Machine, SHF_EXECINSTR};
use crate::output::{ChunkKind, Thunk};
use crate::symbol::SymbolId;

/// Re-assign member offsets of executable output sections, inserting a
/// thunk island whenever the distance since the last one approaches the
/// branch range. Must run before virtual addresses are assigned.
pub fn create_range_extension_thunks(cx: &mut Context) {
    let info = cx.target.info();
    if !info.needs_thunks() {
        return;
    }
    // Stay well inside the architectural range so that a branch from
    // either end of a group still reaches the island.
    let group_size = (info.branch_reach / 4).max(0x10_0000);
    let always_island = info.machine == Machine::Arm32;

    for c in 0..cx.chunks.len() {
        let is_exec = {
            let chunk = &cx.chunks[c];
            matches!(chunk.kind, ChunkKind::OutputSection(_))
                && chunk.shdr.sh_flags & SHF_EXECINSTR != 0
        };
        if !is_exec {
            continue;
        }
        let members = match cx.chunks[c].osec_data() {
            Some(data) => data.members.clone(),
            None => continue,
        };
        if members.is_empty() {
            continue;
        }

        let mut thunks: Vec<Thunk> = Vec::new();
        let mut offset = 0u64;
        let mut align = cx.chunks[c].shdr.sh_addralign.max(4);
        let mut group_start = 0u64;
        let mut pending: BTreeSet<u32> = BTreeSet::new();
        let mut assignments: Vec<u64> = Vec::with_capacity(members.len());

        let mut flush =
            |offset: &mut u64, pending: &mut BTreeSet<u32>, thunks: &mut Vec<Thunk>| {
                if pending.is_empty() {
                    return;
                }
                *offset = (*offset + 3) & !3;
                let symbols: Vec<SymbolId> = pending.iter().map(|&s| SymbolId(s)).collect();
                let size =
                    info.thunk_hdr_size + symbols.len() as u64 * info.thunk_size;
                thunks.push(Thunk {
                    offset: *offset,
                    symbols,
                });
                *offset += size;
                pending.clear();
            };

        for r in &members {
            // Collect branch targets that may need a veneer: anything in
            // another section (final distance unknown at this point) or
            // anything that may require a mode switch.
            {
                let file = &cx.objs[r.file as usize];
                let isec = cx.isec(*r);
                for rel in file.section_rels(isec) {
                    if !cx.target.is_branch_reloc(rel.r_type) {
                        continue;
                    }
                    let id = file.symbols[rel.r_sym as usize];
                    let sym = cx.sym(id);
                    if sym.file.is_none() && !sym.is_synthetic {
                        continue;
                    }
                    let same_osec = sym
                        .input_section()
                        .and_then(|t| cx.try_isec(t))
                        .map(|t| t.osec == Some(crate::symbol::ChunkId(c as u32)))
                        .unwrap_or(false);
                    if !same_osec || always_island {
                        pending.insert(id.0);
                    }
                }
            }

            let isec = cx.isec(*r);
            let a = 1u64 << isec.p2align;
            offset = (offset + a - 1) & !(a - 1);

            if offset - group_start >= group_size {
                flush(&mut offset, &mut pending, &mut thunks);
                group_start = offset;
            }

            assignments.push(offset);
            offset += isec.sh_size();
            align = align.max(a);
        }
        flush(&mut offset, &mut pending, &mut thunks);

        if thunks.is_empty() {
            continue;
        }

        for (r, off) in members.iter().zip(assignments) {
            if let Some(isec) = cx.objs[r.file as usize].sections[r.shndx as usize].as_mut() {
                isec.offset = off;
            }
        }
        let chunk = &mut cx.chunks[c];
        chunk.shdr.sh_size = offset;
        chunk.shdr.sh_addralign = align;
        if let Some(data) = chunk.osec_data_mut() {
            data.thunks = thunks;
        }
    }
}

/// After virtual addresses are known, record every thunk entry address
/// under its symbol, sorted, for nearest-thunk lookup by the applier.
pub fn register_thunk_addrs(cx: &mut Context) {
    let info = cx.target.info();
    if !info.needs_thunks() {
        return;
    }
    let mut table: Vec<(SymbolId, u64)> = Vec::new();
    for chunk in &cx.chunks {
        let ChunkKind::OutputSection(data) = &chunk.kind else {
            continue;
        };
        for thunk in &data.thunks {
            let base = chunk.shdr.sh_addr + thunk.offset + info.thunk_hdr_size;
            for (i, &sym) in thunk.symbols.iter().enumerate() {
                table.push((sym, base + i as u64 * info.thunk_size));
            }
        }
    }
    for (sym, addr) in table {
        cx.thunk_addrs.entry(sym).or_default().push(addr);
    }
    for addrs in cx.thunk_addrs.values_mut() {
        addrs.sort_unstable();
    }
}
