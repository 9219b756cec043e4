//! GOT, PLT and dynamic relocation table construction
//!
//! The GOT is a linker-synthesized constant pool of word-size entries.
//! When an entry's value is known at link time we just write it;
//! otherwise we emit a dynamic relocation and let the loader fill the
//! slot. TLS entries come in the module/offset pair (general-dynamic),
//! TP-offset (initial-exec) and descriptor flavors.

use std::sync::atomic::Ordering;

use crate::context::{Context, NO_PLT};
use crate::elf::{Rel, R_NONE};
use crate::output::{AbsRelKind, ChunkKind};
use crate::symbol::SymbolId;

#[derive(Debug, Clone, Copy)]
/// One word of the GOT image plus the dynamic relocation it may need
pub struct GotEntry {
    /// Word index within `.got`
    pub idx: i64,
    pub val: u64,
    pub r_type: u32,
    pub sym: Option<SymbolId>,
}

impl GotEntry {
    pub fn is_relr(&self, cx: &Context) -> bool {
        self.r_type == cx.target.info().r_relative && cx.options.pack_dyn_relocs_relr
    }
}

/// Compute the complete `.got` image. The same walk sizes `.rel.dyn`,
/// packs RELR and writes the final bytes, so everything stays consistent.
pub fn get_got_entries(cx: &Context) -> Vec<GotEntry> {
    let info = cx.target.info();
    let mut entries = Vec::new();

    for &id in &cx.got_syms {
        let idx = cx.got_idx(id) as i64;
        let sym = cx.sym(id);

        if sym.is_ifunc() {
            // An ifunc's slot is always resolved at load time.
            if cx.is_pde_ifunc(id) {
                entries.push(GotEntry {
                    idx,
                    val: cx.plt_addr(id),
                    r_type: R_NONE,
                    sym: None,
                });
                entries.push(GotEntry {
                    idx: idx + 1,
                    val: cx.get_addr(id, NO_PLT),
                    r_type: info.r_irelative,
                    sym: None,
                });
            } else {
                entries.push(GotEntry {
                    idx,
                    val: cx.get_addr(id, NO_PLT),
                    r_type: info.r_irelative,
                    sym: None,
                });
            }
            continue;
        }

        if sym.is_imported {
            entries.push(GotEntry {
                idx,
                val: 0,
                r_type: info.r_glob_dat,
                sym: Some(id),
            });
        } else if cx.options.pic() && sym.is_relative() {
            entries.push(GotEntry {
                idx,
                val: cx.get_addr(id, NO_PLT),
                r_type: info.r_relative,
                sym: None,
            });
        } else {
            entries.push(GotEntry {
                idx,
                val: cx.get_addr(id, NO_PLT),
                r_type: R_NONE,
                sym: None,
            });
        }
    }

    for &id in &cx.tlsgd_syms {
        let idx = cx.tlsgd_idx(id) as i64;
        let sym = cx.sym(id);
        if sym.is_imported {
            entries.push(GotEntry {
                idx,
                val: 0,
                r_type: info.r_dtpmod,
                sym: Some(id),
            });
            entries.push(GotEntry {
                idx: idx + 1,
                val: 0,
                r_type: info.r_dtpoff,
                sym: Some(id),
            });
        } else if cx.options.shared {
            // The offset within our TLS block is fixed; the module ID is
            // the loader's to assign.
            entries.push(GotEntry {
                idx,
                val: 0,
                r_type: info.r_dtpmod,
                sym: None,
            });
            entries.push(GotEntry {
                idx: idx + 1,
                val: cx.get_addr(id, 0).wrapping_sub(cx.dtp_addr),
                r_type: R_NONE,
                sym: None,
            });
        } else {
            // Module ID 1 is the main executable.
            entries.push(GotEntry {
                idx,
                val: 1,
                r_type: R_NONE,
                sym: None,
            });
            entries.push(GotEntry {
                idx: idx + 1,
                val: cx.get_addr(id, 0).wrapping_sub(cx.dtp_addr),
                r_type: R_NONE,
                sym: None,
            });
        }
    }

    for &id in &cx.tlsdesc_syms {
        let idx = cx.tlsdesc_idx(id) as i64;
        let sym = cx.sym(id);
        // TLSDESC slot values depend on the libc, so a dynamic relocation
        // is emitted even for local symbols.
        if sym.is_imported {
            entries.push(GotEntry {
                idx,
                val: 0,
                r_type: info.r_tlsdesc,
                sym: Some(id),
            });
        } else {
            entries.push(GotEntry {
                idx,
                val: cx.get_addr(id, 0).wrapping_sub(cx.tls_begin),
                r_type: info.r_tlsdesc,
                sym: None,
            });
        }
    }

    for &id in &cx.gottp_syms {
        let idx = cx.gottp_idx(id) as i64;
        let sym = cx.sym(id);
        if sym.is_imported {
            entries.push(GotEntry {
                idx,
                val: 0,
                r_type: info.r_tpoff,
                sym: Some(id),
            });
        } else if cx.options.shared {
            entries.push(GotEntry {
                idx,
                val: cx.get_addr(id, 0).wrapping_sub(cx.tls_begin),
                r_type: info.r_tpoff,
                sym: None,
            });
        } else {
            entries.push(GotEntry {
                idx,
                val: cx.get_addr(id, 0).wrapping_sub(cx.tp_addr),
                r_type: R_NONE,
                sym: None,
            });
        }
    }

    if cx.tlsld_idx >= 0 {
        if cx.options.shared {
            entries.push(GotEntry {
                idx: cx.tlsld_idx,
                val: 0,
                r_type: info.r_dtpmod,
                sym: None,
            });
        } else {
            entries.push(GotEntry {
                idx: cx.tlsld_idx,
                val: 1,
                r_type: R_NONE,
                sym: None,
            });
        }
    }

    entries
}

/// Number of `.rel.dyn` entries the GOT contributes
pub fn got_reldyn_count(cx: &Context) -> usize {
    get_got_entries(cx)
        .iter()
        .filter(|e| e.r_type != R_NONE && !e.is_relr(cx))
        .count()
}

/// Pack the GOT's base relocations into the chunk's RELR vector
pub fn construct_got_relr(cx: &mut Context) {
    if !cx.options.pack_dyn_relocs_relr {
        return;
    }
    let word = cx.word_size();
    let positions: Vec<u64> = get_got_entries(cx)
        .iter()
        .filter(|e| e.is_relr(cx))
        .map(|e| e.idx as u64 * word)
        .collect();
    if let Some(got) = cx.refs.got {
        cx.chunk_mut(got).relr = crate::output::encode_relr(&positions, word);
    }
}

/// Append one dynamic relocation at the running `.rel.dyn` cursor
pub fn write_dynrel(cx: &Context, out: &mut [u8], cursor: &mut u64, rel: Rel) {
    let Some(reldyn) = cx.refs.reldyn else { return };
    let enc = cx.enc;
    let entsize = Rel::entry_size(enc.class, cx.target.info().is_rela) as u64;
    let off = cx.chunk(reldyn).shdr.sh_offset + *cursor;
    rel.write_at(enc, cx.target.info().is_rela, out, off as usize);
    *cursor += entsize;
}

/// Write `.got` together with its share of `.rel.dyn`
pub fn copy_got(cx: &Context, out: &mut [u8]) {
    let Some(got) = cx.refs.got else { return };
    let chunk = cx.chunk(got);
    let base = chunk.shdr.sh_offset as usize;
    let addr = chunk.shdr.sh_addr;
    let word = cx.word_size();
    let enc = cx.enc;
    let mut cursor = chunk.reldyn_offset;

    for ent in get_got_entries(cx) {
        if ent.r_type == R_NONE || ent.is_relr(cx) {
            enc.put_word(out, base + (ent.idx as usize) * word as usize, ent.val);
            continue;
        }
        write_dynrel(
            cx,
            out,
            &mut cursor,
            Rel {
                r_offset: addr + ent.idx as u64 * word,
                r_sym: ent.sym.map(|s| cx.dynsym_idx(s).max(0) as u32).unwrap_or(0),
                r_type: ent.r_type,
                r_addend: ent.val as i64,
            },
        );
        if cx.options.apply_dynamic_relocs {
            // A TLSDESC relocation covers two slots; its addend lands in
            // the second one (ARM32 inverts the layout).
            let mut idx = ent.idx;
            if ent.r_type == cx.target.info().r_tlsdesc
                && cx.target.info().machine != crate::elf::Machine::Arm32
            {
                idx += 1;
            }
            enc.put_word(out, base + idx as usize * word as usize, ent.val);
        }
    }
}

/// `.got.plt`: slot 0 holds `_DYNAMIC`, 1 and 2 are for the loader, the
/// rest point back at the PLT header so the first call goes through lazy
/// resolution.
pub fn copy_gotplt(cx: &Context, out: &mut [u8]) {
    let Some(gotplt) = cx.refs.gotplt else { return };
    let chunk = cx.chunk(gotplt);
    let base = chunk.shdr.sh_offset as usize;
    let word = cx.word_size() as usize;
    let enc = cx.enc;

    let dynamic = cx.chunk_addr(cx.refs.dynamic);
    enc.put_word(out, base, dynamic);

    let plt_hdr = cx.chunk_addr(cx.refs.plt);
    for (i, _) in cx.plt_syms.iter().enumerate() {
        enc.put_word(out, base + (3 + i) * word, plt_hdr);
    }
}

pub fn copy_plt(cx: &Context, out: &mut [u8]) {
    let Some(plt) = cx.refs.plt else { return };
    let info = cx.target.info();
    let chunk = cx.chunk(plt);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let base = chunk.shdr.sh_offset as usize;

    {
        let hdr = &mut out[base..base + info.plt_hdr_size as usize];
        cx.target.write_plt_header(cx, hdr);
    }
    for (i, &sym) in cx.plt_syms.iter().enumerate() {
        let off = base + info.plt_hdr_size as usize + i * info.plt_size as usize;
        let buf = &mut out[off..off + info.plt_size as usize];
        cx.target.write_plt_entry(cx, buf, sym);
    }
}

pub fn copy_pltgot(cx: &Context, out: &mut [u8]) {
    let Some(pltgot) = cx.refs.pltgot else { return };
    let info = cx.target.info();
    let base = cx.chunk(pltgot).shdr.sh_offset as usize;
    for (i, &sym) in cx.pltgot_syms.iter().enumerate() {
        let off = base + i * info.pltgot_size as usize;
        let buf = &mut out[off..off + info.pltgot_size as usize];
        cx.target.write_pltgot_entry(cx, buf, sym);
    }
}

/// `.rel.plt` carries one `R_JUMP_SLOT` per PLT entry (`R_IRELATIVE` for
/// locally-resolved ifuncs)
pub fn copy_relplt(cx: &Context, out: &mut [u8]) {
    let Some(relplt) = cx.refs.relplt else { return };
    let info = cx.target.info();
    let enc = cx.enc;
    let entsize = Rel::entry_size(enc.class, info.is_rela);
    let base = cx.chunk(relplt).shdr.sh_offset as usize;

    for (i, &id) in cx.plt_syms.iter().enumerate() {
        let sym = cx.sym(id);
        let rel = if sym.is_ifunc() && !sym.is_imported {
            Rel {
                r_offset: cx.gotplt_addr(id),
                r_sym: 0,
                r_type: info.r_irelative,
                r_addend: cx.get_addr(id, NO_PLT) as i64,
            }
        } else {
            Rel {
                r_offset: cx.gotplt_addr(id),
                r_sym: cx.dynsym_idx(id).max(0) as u32,
                r_type: info.r_jump_slot,
                r_addend: 0,
            }
        };
        rel.write_at(enc, info.is_rela, out, base + i * entsize);
    }
}

/// `.relr.dyn`: concatenation of every chunk's packed vector, in chunk
/// order
pub fn copy_relrdyn(cx: &Context, out: &mut [u8]) {
    let Some(relrdyn) = cx.refs.relrdyn else { return };
    let base = cx.chunk(relrdyn).shdr.sh_offset as usize;
    let word = cx.word_size() as usize;
    let enc = cx.enc;

    let mut off = base;
    for chunk in &cx.chunks {
        let chunk_addr = chunk.shdr.sh_addr;
        for &w in &chunk.relr {
            // Start words are chunk-relative positions; bitmap words pass
            // through untouched.
            let val = if w & 1 == 0 { chunk_addr + w } else { w };
            enc.put_word(out, off, val);
            off += word;
        }
    }
}

/// Copy relocations: reserve no bytes (the section is NOBITS) but emit
/// one `R_COPY` per copied symbol.
pub fn copy_copyrel(cx: &Context, out: &mut [u8], relro: bool) {
    let (chunk_id, syms) = if relro {
        (cx.refs.copyrel_relro, &cx.copyrel_relro_syms)
    } else {
        (cx.refs.copyrel, &cx.copyrel_syms)
    };
    let Some(chunk_id) = chunk_id else { return };
    let info = cx.target.info();
    let mut cursor = cx.chunk(chunk_id).reldyn_offset;

    let mut seen = std::collections::HashSet::new();
    for &id in syms {
        // Aliases share the reservation; only one R_COPY per address.
        if !seen.insert(cx.sym(id).value) {
            continue;
        }
        write_dynrel(
            cx,
            out,
            &mut cursor,
            Rel {
                r_offset: cx.get_addr(id, 0),
                r_sym: cx.dynsym_idx(id).max(0) as u32,
                r_type: info.r_copy,
                r_addend: 0,
            },
        );
    }
}

/// The output section share of `.rel.dyn`: promote gathered word-size
/// absolute relocations and write their final bytes.
pub fn copy_osec_abs_rels(cx: &Context, chunk_idx: usize, out: &mut [u8]) {
    let chunk = &cx.chunks[chunk_idx];
    let ChunkKind::OutputSection(data) = &chunk.kind else {
        return;
    };
    let enc = cx.enc;
    let info = cx.target.info();
    let mut cursor = chunk.reldyn_offset;

    for r in &data.abs_rels {
        let isec = cx.isec(r.isec);
        let loc = (chunk.shdr.sh_offset + isec.offset + r.offset) as usize;
        let p = chunk.shdr.sh_addr + isec.offset + r.offset;
        let (s, a) = match r.frag {
            Some((frag, off)) => (cx.frag_addr(frag), off),
            None => (cx.get_addr(r.sym, 0), r.addend),
        };

        match r.kind {
            AbsRelKind::None | AbsRelKind::Relr => {
                enc.put_word(out, loc, s.wrapping_add(a as u64));
            }
            AbsRelKind::Baserel => {
                let val = s.wrapping_add(a as u64);
                write_dynrel(
                    cx,
                    out,
                    &mut cursor,
                    Rel {
                        r_offset: p,
                        r_sym: 0,
                        r_type: info.r_relative,
                        r_addend: val as i64,
                    },
                );
                if cx.options.apply_dynamic_relocs {
                    enc.put_word(out, loc, val);
                }
            }
            AbsRelKind::Ifunc => {
                let val = cx.get_addr(r.sym, NO_PLT).wrapping_add(a as u64);
                write_dynrel(
                    cx,
                    out,
                    &mut cursor,
                    Rel {
                        r_offset: p,
                        r_sym: 0,
                        r_type: info.r_irelative,
                        r_addend: val as i64,
                    },
                );
                if cx.options.apply_dynamic_relocs {
                    enc.put_word(out, loc, val);
                }
            }
            AbsRelKind::Dynrel => {
                write_dynrel(
                    cx,
                    out,
                    &mut cursor,
                    Rel {
                        r_offset: p,
                        r_sym: cx.dynsym_idx(r.sym).max(0) as u32,
                        r_type: info.r_abs,
                        r_addend: a,
                    },
                );
                if cx.options.apply_dynamic_relocs {
                    enc.put_word(out, loc, a as u64);
                }
            }
        }
    }
}

/// Pack an output section's RELR-eligible absolute relocations
pub fn construct_osec_relr(cx: &mut Context) {
    if !cx.options.pack_dyn_relocs_relr {
        return;
    }
    let word = cx.word_size();
    for c in 0..cx.chunks.len() {
        let positions: Vec<u64> = {
            let chunk = &cx.chunks[c];
            let ChunkKind::OutputSection(data) = &chunk.kind else {
                continue;
            };
            let mut pos: Vec<u64> = data
                .abs_rels
                .iter()
                .filter(|r| r.kind == AbsRelKind::Relr)
                .map(|r| cx.isec(r.isec).offset + r.offset)
                .collect();
            pos.sort_unstable();
            pos
        };
        if !positions.is_empty() {
            cx.chunks[c].relr = crate::output::encode_relr(&positions, word);
        }
    }
}

/// Fragment liveness helper used when writing merged sections
pub fn copy_merged(cx: &Context, msec_idx: usize, out: &mut [u8]) {
    let msec = &cx.merged[msec_idx];
    let Some(chunk_id) = msec.chunk else { return };
    let base = cx.chunk(chunk_id).shdr.sh_offset as usize;
    for (i, frag) in msec.frags.iter().enumerate() {
        if !frag.is_alive.load(Ordering::Relaxed) {
            continue;
        }
        let bytes = &msec.frag_contents[i];
        out[base + frag.offset as usize..base + frag.offset as usize + bytes.len()]
            .copy_from_slice(bytes);
    }
}
