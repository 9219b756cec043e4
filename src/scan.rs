//! Stage 6: the relocation scan
//!
//! Each live relocation is classified per architecture into the PLT /
//! GOT / absolute / TLS buckets; the scan's only outputs are per-symbol
//! need-bits, per-output-section [`AbsRel`] records, and the `DT_TEXTREL`
//! verdict. Stage 7 then turns the need-bits into table slots.

use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::elf::{SHF_EXECINSTR, SHF_WRITE, STT_FUNC, STV_PROTECTED};
use crate::error::{Error, Result};
use crate::output::{AbsRel, AbsRelKind, ChunkKind};
use crate::symbol::{
    FileId, SymbolId, NEEDS_COPYREL, NEEDS_CPLT, NEEDS_GOT, NEEDS_GOTTP, NEEDS_PLT, NEEDS_TLSDESC,
    NEEDS_TLSGD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a scanned relocation demands from the output
pub enum Action {
    /// Nothing; the value is a link-time constant
    None,
    /// Not representable; the user must recompile with -fPIC
    Error,
    /// Import the data by copying it into the executable's BSS
    Copyrel,
    /// The symbol needs a PLT entry if it is imported
    Plt,
    /// The symbol needs a canonical PLT whose address stands for it
    Cplt,
}

/// Decision table for PC-relative relocations, indexed by
/// [output kind][symbol kind]
pub const PCREL_TABLE: [[Action; 4]; 3] = [
    // Absolute        Local          Imported data    Imported code
    [Action::Error, Action::None, Action::Error, Action::Plt], // shared object
    [Action::Error, Action::None, Action::Copyrel, Action::Plt], // PIE
    [Action::None, Action::None, Action::Copyrel, Action::Cplt], // executable
];

/// Decision table for absolute relocations narrower than a word
pub const ABSREL_TABLE: [[Action; 4]; 3] = [
    // Absolute        Local          Imported data    Imported code
    [Action::None, Action::Error, Action::Error, Action::Error], // shared object
    [Action::None, Action::Error, Action::Error, Action::Error], // PIE
    [Action::None, Action::None, Action::Copyrel, Action::Cplt], // executable
];

fn output_kind_row(cx: &Context) -> usize {
    if cx.options.shared {
        0
    } else if cx.options.pie {
        1
    } else {
        2
    }
}

fn symbol_kind_col(cx: &Context, id: SymbolId) -> usize {
    let sym = cx.sym(id);
    if sym.is_absolute() {
        0
    } else if !sym.is_imported {
        1
    } else if sym.st_type() != STT_FUNC {
        2
    } else {
        3
    }
}

/// Apply a decision table entry for one relocation
pub fn do_action(
    cx: &mut Context,
    table: &[[Action; 4]; 3],
    fid: u32,
    shndx: u32,
    rel: &crate::elf::Rel,
    id: SymbolId,
) {
    let action = table[output_kind_row(cx)][symbol_kind_col(cx, id)];
    match action {
        Action::None => {}
        Action::Error => {
            let err = Error::BadRelocation {
                file: cx.objs[fid as usize].name.clone(),
                section: cx
                    .try_isec(crate::symbol::SectionRef { file: fid, shndx })
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                offset: rel.r_offset,
                message: format!(
                    "relocation against symbol `{}' can not be used; recompile with -fPIC",
                    cx.sym(id).name
                ),
            };
            cx.diags.error(err);
        }
        Action::Copyrel => {
            if cx.options.z_copyreloc {
                cx.sym(id).set_flags(NEEDS_COPYREL);
            } else {
                cx.sym(id).set_flags(NEEDS_CPLT);
            }
        }
        Action::Plt => {
            if cx.sym(id).is_imported {
                cx.sym(id).set_flags(NEEDS_PLT);
            }
        }
        Action::Cplt => {
            cx.sym(id).set_flags(NEEDS_CPLT);
        }
    }
}

/// Record that a narrow absolute relocation points at a fragment, so the
/// merge engine packs it within 32-bit reach.
pub fn mark_frag_32bit(cx: &Context, fid: u32, rel: &crate::elf::Rel) {
    let file = &cx.objs[fid as usize];
    if let Some(id) = file.symbols.get(rel.r_sym as usize) {
        if let Some(frag) = cx.sym(*id).fragment() {
            cx.merged[frag.msec as usize].frags[frag.frag as usize]
                .is_32bit
                .store(true, Ordering::Relaxed);
        }
    }
}

/// A TLS local-exec access only works when the TP offset is a link-time
/// constant; report anything else.
pub fn check_tlsle(cx: &mut Context, fid: u32, shndx: u32, rel: &crate::elf::Rel, id: SymbolId) {
    if cx.options.shared {
        let err = Error::BadRelocation {
            file: cx.objs[fid as usize].name.clone(),
            section: cx
                .try_isec(crate::symbol::SectionRef { file: fid, shndx })
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            offset: rel.r_offset,
            message: format!(
                "relocation against `{}' in a shared object; recompile with -fPIC",
                cx.sym(id).name
            ),
        };
        cx.diags.error(err);
    }
}

/// Choose the cheapest TLS model a TLSDESC access can be rewritten to
pub fn scan_tlsdesc(cx: &mut Context, id: SymbolId) {
    if cx.options.relax && cx.is_tprel_linktime_const(id) {
        // Will be relaxed to local-exec; no table entry needed.
    } else if cx.options.relax && cx.is_tprel_runtime_const(id) {
        cx.sym(id).set_flags(NEEDS_GOTTP);
    } else {
        cx.sym(id).set_flags(NEEDS_TLSDESC);
    }
}

/// Run the per-architecture scan over every live allocated section
pub fn scan_relocations(cx: &mut Context) -> Result<()> {
    let target = cx.target;
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let section_ids: Vec<u32> = cx.objs[f]
            .sections
            .iter()
            .flatten()
            .filter(|isec| {
                isec.is_alive()
                    && isec.shdr.sh_flags & crate::elf::SHF_ALLOC != 0
                    && !isec.rels.is_empty()
            })
            .map(|isec| isec.shndx)
            .collect();
        for shndx in section_ids {
            target.scan_relocations(cx, f as u32, shndx)?;
        }

        // Exception-frame records reference personality routines; those
        // need PLT entries when imported.
        let cie_rels: Vec<u32> = cx.objs[f]
            .cies
            .iter()
            .flat_map(|cie| cie.rels.clone())
            .collect();
        for ri in cie_rels {
            let id = {
                let file = &cx.objs[f];
                file.symbols[file.rels[ri as usize].r_sym as usize]
            };
            if cx.sym(id).is_imported {
                cx.sym(id).set_flags(NEEDS_PLT);
            }
        }
    }

    scan_abs_relocations(cx);
    cx.diags.checkpoint()?;
    assign_slots(cx);
    Ok(())
}

fn get_abs_rel_kind(cx: &Context, id: SymbolId) -> AbsRelKind {
    let sym = cx.sym(id);
    if sym.is_ifunc() {
        return if cx.is_pde_ifunc(id) {
            AbsRelKind::None
        } else {
            AbsRelKind::Ifunc
        };
    }
    if sym.is_absolute() {
        return AbsRelKind::None;
    }
    let flags = sym.get_flags();
    if !sym.is_imported || flags & NEEDS_CPLT != 0 || flags & NEEDS_COPYREL != 0 {
        return if cx.options.pic() {
            AbsRelKind::Baserel
        } else {
            AbsRelKind::None
        };
    }
    AbsRelKind::Dynrel
}

/// Gather word-size absolute relocations per output section, promote
/// imported symbols to canonical PLTs / copy relocations where that saves
/// a text relocation, then classify what remains.
fn scan_abs_relocations(cx: &mut Context) {
    let word = cx.word_size();
    for c in 0..cx.chunks.len() {
        let members = match &cx.chunks[c].kind {
            ChunkKind::OutputSection(data) => data.members.clone(),
            _ => continue,
        };
        let osec_flags = cx.chunks[c].shdr.sh_flags;

        let mut abs_rels: Vec<AbsRel> = Vec::new();
        for r in members {
            let file = &cx.objs[r.file as usize];
            let isec = cx.isec(r);
            let contents = file.section_bytes(isec);
            for rel in file.section_rels(isec) {
                if cx.target.is_abs_rel(rel.r_type) {
                    let addend = cx.target.get_addend(contents, rel);
                    abs_rels.push(AbsRel {
                        isec: r,
                        offset: rel.r_offset,
                        sym: file.symbols[rel.r_sym as usize],
                        addend,
                        frag: cx.get_fragment(r.file, rel, addend),
                        kind: AbsRelKind::None,
                    });
                }
            }
        }
        if abs_rels.is_empty() {
            continue;
        }

        // In a position-dependent executable we can keep a read-only
        // section free of dynamic relocations by promoting the symbol.
        if !cx.options.pic() && osec_flags & SHF_WRITE == 0 {
            for r in &abs_rels {
                let sym = cx.sym(r.sym);
                if sym.is_imported && !sym.is_absolute() {
                    if sym.st_type() == STT_FUNC {
                        sym.set_flags(NEEDS_CPLT);
                    } else {
                        sym.set_flags(NEEDS_COPYREL);
                    }
                }
            }
        }

        for r in abs_rels.iter_mut() {
            r.kind = get_abs_rel_kind(cx, r.sym);
        }

        let mut textrel_errors = Vec::new();
        let mut has_textrel = false;
        for r in &abs_rels {
            let isec = cx.isec(r.isec);
            if r.kind != AbsRelKind::None && isec.shdr.sh_flags & SHF_WRITE == 0 {
                if cx.options.z_text {
                    textrel_errors.push(Error::BadRelocation {
                        file: cx.objs[r.isec.file as usize].name.clone(),
                        section: isec.name.clone(),
                        offset: r.offset,
                        message: format!(
                            "relocation against symbol `{}' can not be used with -z text; \
                             recompile with -fPIC",
                            cx.sym(r.sym).name
                        ),
                    });
                } else {
                    has_textrel = true;
                }
            }
        }
        for err in textrel_errors {
            cx.diags.error(err);
        }
        if has_textrel {
            cx.has_textrel = true;
        }

        if cx.options.pack_dyn_relocs_relr && osec_flags & SHF_EXECINSTR == 0 {
            for r in abs_rels.iter_mut() {
                if r.kind == AbsRelKind::Baserel
                    && cx.isec(r.isec).shdr.sh_addralign % word == 0
                    && r.offset % word == 0
                {
                    r.kind = AbsRelKind::Relr;
                }
            }
        }

        if let Some(data) = cx.chunks[c].osec_data_mut() {
            data.abs_rels = abs_rels;
        }
    }
}

/// Stage 7 entry: convert accumulated need-bits into table slots
pub fn assign_slots(cx: &mut Context) {
    // Reserve dynsym slot 0.
    if cx.dynsym_syms.is_empty() {
        cx.dynsym_syms.push(SymbolId(u32::MAX));
    }

    // GOT word 0 is reserved so `_GLOBAL_OFFSET_TABLE_` always has
    // something to point at.
    let mut got_words: i32 = 1;

    let ids: Vec<SymbolId> = (0..cx.symbols.len() as u32).map(SymbolId).collect();
    for id in ids {
        let sym = &cx.symbols[id.0 as usize];
        let flags = sym.get_flags();
        if flags == 0 && !sym.is_imported && !sym.is_exported {
            continue;
        }
        if flags != 0 {
            cx.add_aux(id);
        }
        if cx.sym(id).is_imported || cx.sym(id).is_exported {
            add_dynsym(cx, id);
        }

        if flags & NEEDS_GOT != 0 {
            let slots = if cx.is_pde_ifunc(id) { 2 } else { 1 };
            if let Some(aux) = cx.aux_mut(id) {
                aux.got_idx = got_words;
            }
            got_words += slots;
            cx.got_syms.push(id);
        }

        if flags & NEEDS_CPLT != 0 {
            cx.sym_mut(id).is_canonical = true;
            add_plt(cx, id);
        } else if flags & NEEDS_PLT != 0 {
            if flags & NEEDS_GOT != 0 {
                // The address is already in the GOT; a jump stub in
                // .plt.got is enough.
                let idx = cx.pltgot_syms.len() as i32;
                if let Some(aux) = cx.aux_mut(id) {
                    aux.pltgot_idx = idx;
                }
                cx.pltgot_syms.push(id);
            } else {
                add_plt(cx, id);
            }
        }

        if flags & NEEDS_GOTTP != 0 {
            if let Some(aux) = cx.aux_mut(id) {
                aux.gottp_idx = got_words;
            }
            got_words += 1;
            cx.gottp_syms.push(id);
        }
        if flags & NEEDS_TLSGD != 0 {
            if let Some(aux) = cx.aux_mut(id) {
                aux.tlsgd_idx = got_words;
            }
            got_words += 2;
            cx.tlsgd_syms.push(id);
        }
        if flags & NEEDS_TLSDESC != 0 {
            if let Some(aux) = cx.aux_mut(id) {
                aux.tlsdesc_idx = got_words;
            }
            got_words += 2;
            cx.tlsdesc_syms.push(id);
        }
        if flags & NEEDS_COPYREL != 0 {
            add_copyrel(cx, id);
        }
    }

    if cx.needs_tlsld {
        cx.tlsld_idx = got_words as i64;
        got_words += 2;
    }

    if let Some(got) = cx.refs.got {
        cx.chunk_mut(got).shdr.sh_size = got_words as u64 * cx.word_size();
    }
    if let Some(plt) = cx.refs.plt {
        let info = cx.target.info();
        cx.chunk_mut(plt).shdr.sh_size = if cx.plt_syms.is_empty() {
            0
        } else {
            info.plt_hdr_size + cx.plt_syms.len() as u64 * info.plt_size
        };
    }
    if let Some(pltgot) = cx.refs.pltgot {
        let size = cx.pltgot_syms.len() as u64 * cx.target.info().pltgot_size;
        cx.chunk_mut(pltgot).shdr.sh_size = size;
    }
    if let Some(gotplt) = cx.refs.gotplt {
        let size = cx.gotplt_hdr_size() + cx.plt_syms.len() as u64 * cx.word_size();
        cx.chunk_mut(gotplt).shdr.sh_size = size;
    }
}

fn add_plt(cx: &mut Context, id: SymbolId) {
    if cx.plt_idx(id) >= 0 {
        return;
    }
    cx.add_aux(id);
    let idx = cx.plt_syms.len() as i32;
    if let Some(aux) = cx.aux_mut(id) {
        aux.plt_idx = idx;
    }
    cx.plt_syms.push(id);
}

/// Put a symbol into `.dynsym` (index assignment happens when the table
/// is finalized and sorted for GNU-hash bucketing)
pub fn add_dynsym(cx: &mut Context, id: SymbolId) {
    if cx.dynsym_syms.is_empty() {
        cx.dynsym_syms.push(SymbolId(u32::MAX));
    }
    cx.add_aux(id);
    let Some(aux) = cx.aux_mut(id) else { return };
    if aux.dynsym_idx != -1 {
        return;
    }
    aux.dynsym_idx = -2; // pending; finalized by dynsym sorting
    cx.dynsym_syms.push(id);
}

/// Reserve copy-relocation space for an imported data symbol and repoint
/// every alias the DSO defines at the same address.
fn add_copyrel(cx: &mut Context, id: SymbolId) {
    if cx.sym(id).has_copyrel {
        return;
    }
    let Some(FileId::Dso(d)) = cx.sym(id).file else {
        cx.diags.error(Error::IncompatibleSymbol {
            file: cx
                .sym(id)
                .file
                .map(|f| cx.file_name(f).to_string())
                .unwrap_or_default(),
            name: cx.sym(id).name.clone(),
            message: "cannot create a copy relocation; recompile with -fPIC".into(),
        });
        return;
    };
    if cx.sym(id).visibility == STV_PROTECTED {
        cx.diags.error(Error::IncompatibleSymbol {
            file: cx.dsos[d as usize].name.clone(),
            name: cx.sym(id).name.clone(),
            message: "cannot create a copy relocation against a protected symbol".into(),
        });
        return;
    }

    let esym_idx = cx.sym(id).sym_idx as usize;
    let (alignment, size, readonly, aliases) = {
        let dso = &cx.dsos[d as usize];
        let readonly = dso
            .shdrs
            .get(dso.elf_syms[esym_idx].st_shndx as usize)
            .map(|s| s.sh_flags & SHF_WRITE == 0)
            .unwrap_or(false);
        (
            dso.symbol_alignment(esym_idx),
            dso.elf_syms[esym_idx].st_size,
            readonly,
            dso.symbols_at(esym_idx),
        )
    };

    let chunk_id = if readonly {
        cx.refs.copyrel_relro
    } else {
        cx.refs.copyrel
    };
    let Some(chunk_id) = chunk_id else { return };
    let chunk = cx.chunk_mut(chunk_id);
    let offset = (chunk.shdr.sh_size + alignment - 1) & !(alignment - 1);
    chunk.shdr.sh_size = offset + size;
    chunk.shdr.sh_addralign = chunk.shdr.sh_addralign.max(alignment);

    for alias_idx in aliases {
        let alias = cx.dsos[d as usize].symbols[alias_idx];
        cx.add_aux(alias);
        let sym = cx.sym_mut(alias);
        sym.is_imported = true;
        sym.is_exported = true;
        sym.has_copyrel = true;
        sym.is_copyrel_readonly = readonly;
        sym.value = offset;
        add_dynsym(cx, alias);
        if readonly {
            cx.copyrel_relro_syms.push(alias);
        } else {
            cx.copyrel_syms.push(alias);
        }
    }
}
