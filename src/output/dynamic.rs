//! `.dynamic` construction
//!
//! The tag list is computed twice with identical logic: once to size the
//! section during layout and once to emit the bytes, mirroring how the
//! rest of the synthetic chunks behave.

use crate::context::Context;
use crate::elf::{
    Dyn, DynFlags, DynFlags1, Machine, Rel, Sym, DT_AARCH64_VARIANT_PCS, DT_DEBUG, DT_FINI,
    DT_FINI_ARRAY, DT_FINI_ARRAYSZ, DT_FLAGS, DT_FLAGS_1, DT_GNU_HASH, DT_HASH, DT_INIT,
    DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTGOT, DT_PLTREL,
    DT_PLTRELSZ, DT_PREINIT_ARRAY, DT_PREINIT_ARRAYSZ, DT_REL, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_RELENT, DT_RELR, DT_RELRENT, DT_RELRSZ, DT_RELSZ, DT_RISCV_VARIANT_CC, DT_RPATH,
    DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB, DT_SYMENT, DT_SYMTAB, DT_TEXTREL, DT_VERDEF,
    DT_VERDEFNUM, DT_VERNEED, DT_VERNEEDNUM, DT_VERSYM, SHT_FINI_ARRAY, SHT_INIT_ARRAY,
    SHT_PREINIT_ARRAY,
};
use crate::output::ChunkKind;
use crate::symbol::ChunkId;

fn chunk_size(cx: &Context, id: Option<ChunkId>) -> u64 {
    id.map(|c| cx.chunk(c).shdr.sh_size).unwrap_or(0)
}

fn find_array_chunk(cx: &Context, sh_type: u32) -> Option<&crate::output::Chunk> {
    cx.chunks
        .iter()
        .find(|c| c.shdr.sh_type == sh_type && matches!(c.kind, ChunkKind::OutputSection(_)))
}

fn dynstr_find(cx: &Context, s: &str) -> u64 {
    if let Some(dynstr) = cx.refs.dynstr {
        if let ChunkKind::Dynstr(pool) = &cx.chunk(dynstr).kind {
            return pool.find(s);
        }
    }
    0
}

/// The `st_other` byte of a symbol as its owner file recorded it; the
/// AArch64/RISC-V variant-calling-convention bits live there.
fn sym_st_other(cx: &Context, id: crate::symbol::SymbolId) -> u8 {
    let sym = cx.sym(id);
    match sym.file {
        Some(crate::symbol::FileId::Obj(f)) => {
            cx.objs[f as usize].elf_syms[sym.sym_idx as usize].st_other
        }
        Some(crate::symbol::FileId::Dso(d)) => {
            cx.dsos[d as usize].elf_syms[sym.sym_idx as usize].st_other
        }
        None => 0,
    }
}

/// Compute the ordered tag list
pub fn dynamic_entries(cx: &Context) -> Vec<Dyn> {
    let mut vec: Vec<Dyn> = Vec::new();
    let mut define = |tag: u64, val: u64| vec.push(Dyn { d_tag: tag, d_val: val });
    let info = cx.target.info();
    let is_rela = info.is_rela;

    for dso in &cx.dsos {
        if dso.is_alive {
            define(DT_NEEDED, dynstr_find(cx, &dso.soname));
        }
    }

    if !cx.options.rpaths.is_empty() {
        let tag = if cx.options.enable_new_dtags {
            DT_RUNPATH
        } else {
            DT_RPATH
        };
        define(tag, dynstr_find(cx, &cx.options.rpaths));
    }

    if let Some(soname) = &cx.options.soname {
        define(DT_SONAME, dynstr_find(cx, soname));
    }

    if chunk_size(cx, cx.refs.reldyn) > 0 {
        let addr = cx.chunk_addr(cx.refs.reldyn);
        let entsize = Rel::entry_size(cx.enc.class, is_rela) as u64;
        define(if is_rela { DT_RELA } else { DT_REL }, addr);
        define(
            if is_rela { DT_RELASZ } else { DT_RELSZ },
            chunk_size(cx, cx.refs.reldyn),
        );
        define(if is_rela { DT_RELAENT } else { DT_RELENT }, entsize);
    }

    if chunk_size(cx, cx.refs.relrdyn) > 0 {
        define(DT_RELR, cx.chunk_addr(cx.refs.relrdyn));
        define(DT_RELRSZ, chunk_size(cx, cx.refs.relrdyn));
        define(DT_RELRENT, cx.word_size());
    }

    if chunk_size(cx, cx.refs.relplt) > 0 {
        define(DT_JMPREL, cx.chunk_addr(cx.refs.relplt));
        define(DT_PLTRELSZ, chunk_size(cx, cx.refs.relplt));
        define(DT_PLTREL, if is_rela { DT_RELA } else { DT_REL });
    }

    if chunk_size(cx, cx.refs.gotplt) > 0 {
        define(DT_PLTGOT, cx.chunk_addr(cx.refs.gotplt));
    }

    if chunk_size(cx, cx.refs.dynsym) > 0 {
        define(DT_SYMTAB, cx.chunk_addr(cx.refs.dynsym));
        define(DT_SYMENT, Sym::size(cx.enc.class) as u64);
    }
    if chunk_size(cx, cx.refs.dynstr) > 0 {
        define(DT_STRTAB, cx.chunk_addr(cx.refs.dynstr));
        define(DT_STRSZ, chunk_size(cx, cx.refs.dynstr));
    }

    if let Some(chunk) = find_array_chunk(cx, SHT_INIT_ARRAY) {
        define(DT_INIT_ARRAY, chunk.shdr.sh_addr);
        define(DT_INIT_ARRAYSZ, chunk.shdr.sh_size);
    }
    if let Some(chunk) = find_array_chunk(cx, SHT_PREINIT_ARRAY) {
        define(DT_PREINIT_ARRAY, chunk.shdr.sh_addr);
        define(DT_PREINIT_ARRAYSZ, chunk.shdr.sh_size);
    }
    if let Some(chunk) = find_array_chunk(cx, SHT_FINI_ARRAY) {
        define(DT_FINI_ARRAY, chunk.shdr.sh_addr);
        define(DT_FINI_ARRAYSZ, chunk.shdr.sh_size);
    }

    if chunk_size(cx, cx.refs.versym) > 0 {
        define(DT_VERSYM, cx.chunk_addr(cx.refs.versym));
    }
    if let Some(verneed) = cx.refs.verneed {
        let chunk = cx.chunk(verneed);
        if chunk.shdr.sh_size > 0 {
            define(DT_VERNEED, chunk.shdr.sh_addr);
            define(DT_VERNEEDNUM, chunk.shdr.sh_info as u64);
        }
    }
    if let Some(verdef) = cx.refs.verdef {
        let chunk = cx.chunk(verdef);
        if chunk.shdr.sh_size > 0 {
            define(DT_VERDEF, chunk.shdr.sh_addr);
            define(DT_VERDEFNUM, chunk.shdr.sh_info as u64);
        }
    }

    // DT_INIT/DT_FINI point at functions we define ourselves.
    for (name, tag) in [(&cx.options.init, DT_INIT), (&cx.options.fini, DT_FINI)] {
        if let Some(id) = cx.find_symbol(name) {
            let sym = cx.sym(id);
            if sym.file.map(|f| !f.is_dso()).unwrap_or(false) && !sym.esym_is_undef {
                define(tag, cx.get_addr(id, 0));
            }
        }
    }

    if chunk_size(cx, cx.refs.hash) > 0 {
        define(DT_HASH, cx.chunk_addr(cx.refs.hash));
    }
    if chunk_size(cx, cx.refs.gnu_hash) > 0 {
        define(DT_GNU_HASH, cx.chunk_addr(cx.refs.gnu_hash));
    }
    if cx.has_textrel {
        define(DT_TEXTREL, 0);
    }

    let mut flags = DynFlags::empty();
    let mut flags1 = DynFlags1::empty();
    if cx.options.pie {
        flags1 |= DynFlags1::PIE;
    }
    if cx.options.z_now {
        flags |= DynFlags::BIND_NOW;
        flags1 |= DynFlags1::NOW;
    }
    if cx.options.z_origin {
        flags |= DynFlags::ORIGIN;
        flags1 |= DynFlags1::ORIGIN;
    }
    if !cx.options.z_dlopen {
        flags1 |= DynFlags1::NOOPEN;
    }
    if cx.options.z_nodefaultlib {
        flags1 |= DynFlags1::NODEFLIB;
    }
    if !cx.options.z_delete {
        flags1 |= DynFlags1::NODELETE;
    }
    if !cx.options.z_dump {
        flags1 |= DynFlags1::NODUMP;
    }
    if cx.options.z_initfirst {
        flags1 |= DynFlags1::INITFIRST;
    }
    if cx.options.z_interpose {
        flags1 |= DynFlags1::INTERPOSE;
    }
    if cx.options.bsymbolic == crate::options::BsymbolicKind::All {
        flags |= DynFlags::SYMBOLIC;
    }
    if !cx.gottp_syms.is_empty() {
        flags |= DynFlags::STATIC_TLS;
    }
    if cx.has_textrel {
        flags |= DynFlags::TEXTREL;
    }
    if !flags.is_empty() {
        define(DT_FLAGS, flags.bits());
    }
    if !flags1.is_empty() {
        define(DT_FLAGS_1, flags1.bits());
    }

    match cx.target.info().machine {
        Machine::Aarch64 => {
            // STO_AARCH64_VARIANT_PCS
            if cx.plt_syms.iter().any(|&id| sym_st_other(cx, id) & 0x80 != 0) {
                define(DT_AARCH64_VARIANT_PCS, 0);
            }
        }
        Machine::Riscv => {
            // STO_RISCV_VARIANT_CC
            if cx.plt_syms.iter().any(|&id| sym_st_other(cx, id) & 0x80 != 0) {
                define(DT_RISCV_VARIANT_CC, 0);
            }
        }
        _ => {}
    }

    // GDB stores a word of its own here at runtime.
    if !cx.options.shared {
        define(DT_DEBUG, 0);
    }

    define(DT_NULL, 0);
    for _ in 0..cx.options.spare_dynamic_tags {
        define(DT_NULL, 0);
    }
    vec
}

/// Size `.dynamic` during layout
pub fn update_dynamic_size(cx: &mut Context) {
    let Some(dynamic) = cx.refs.dynamic else { return };
    let n = dynamic_entries(cx).len();
    let entsize = Dyn::size(cx.enc.class) as u64;
    let chunk = cx.chunk_mut(dynamic);
    chunk.shdr.sh_size = n as u64 * entsize;
    chunk.shdr.sh_entsize = entsize;
}

pub fn copy_dynamic(cx: &Context, out: &mut [u8]) {
    let Some(dynamic) = cx.refs.dynamic else { return };
    let chunk = cx.chunk(dynamic);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let enc = cx.enc;
    let base = chunk.shdr.sh_offset as usize;
    let entsize = Dyn::size(enc.class);
    for (i, dy) in dynamic_entries(cx).iter().enumerate() {
        dy.write_at(enc, out, base + i * entsize);
    }
}
