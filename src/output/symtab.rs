//! `.symtab` / `.strtab` and the shared output-symbol conversion

use crate::context::{Context, NO_PLT};
use crate::elf::{
    Sym, SHN_ABS, SHN_UNDEF, STB_GLOBAL, STB_GNU_UNIQUE, STT_FUNC, STT_SECTION, STT_TLS,
};
use crate::output::ChunkKind;
use crate::symbol::{FileId, SymbolId, SymbolOrigin};

/// Render a symbol the way it should appear in an output symbol table.
/// `st_name` is left for the caller, which owns the string pool.
pub fn to_output_esym(cx: &Context, id: SymbolId) -> Sym {
    let sym = cx.sym(id);
    let mut bind = sym.esym_info >> 4;
    if bind == STB_GNU_UNIQUE {
        bind = STB_GLOBAL;
    }
    let ty = sym.esym_info & 0xf;
    let mut esym = Sym {
        st_name: 0,
        st_info: Sym::info(bind, ty),
        st_other: sym.visibility,
        st_shndx: SHN_UNDEF,
        st_value: 0,
        st_size: sym.esym_size,
    };

    let osec_shndx = |r: crate::symbol::SectionRef| -> u32 {
        let isec = cx.isec(r);
        if let Some(osec) = isec.osec {
            return cx.chunk(osec).shndx;
        }
        if let Some(leader) = isec.leader {
            if leader != r {
                if let Some(osec) = cx.isec(leader).osec {
                    return cx.chunk(osec).shndx;
                }
            }
        }
        SHN_UNDEF
    };

    if sym.has_copyrel {
        let chunk = if sym.is_copyrel_readonly {
            cx.refs.copyrel_relro
        } else {
            cx.refs.copyrel
        };
        esym.st_shndx = chunk.map(|c| cx.chunk(c).shndx).unwrap_or(SHN_UNDEF);
        esym.st_value = cx.get_addr(id, 0);
    } else if sym.file.map(|f| f.is_dso()).unwrap_or(false) || sym.esym_is_undef {
        esym.st_shndx = SHN_UNDEF;
        esym.st_size = 0;
        if sym.is_canonical {
            // The canonical PLT address is what everyone must agree on.
            esym.st_value = cx.plt_addr(id);
        }
    } else {
        match sym.origin {
            SymbolOrigin::Chunk(c) => {
                esym.st_shndx = cx.chunk(c).shndx;
                esym.st_value = cx.get_addr(id, 0);
            }
            SymbolOrigin::Fragment(frag) => {
                esym.st_shndx = cx.merged[frag.msec as usize]
                    .chunk
                    .map(|c| cx.chunk(c).shndx)
                    .unwrap_or(SHN_UNDEF);
                esym.st_value = cx.get_addr(id, 0);
            }
            SymbolOrigin::Absolute => {
                esym.st_shndx = SHN_ABS;
                esym.st_value = cx.get_addr(id, 0);
            }
            SymbolOrigin::Section(r) => {
                if sym.st_type() == STT_TLS {
                    esym.st_shndx = osec_shndx(r);
                    esym.st_value = cx.get_addr(id, 0).wrapping_sub(cx.tls_begin);
                } else if cx.is_pde_ifunc(id) {
                    esym.st_shndx = osec_shndx(r);
                    esym.st_info = Sym::info(bind, STT_FUNC);
                    esym.st_value = cx.plt_addr(id);
                } else {
                    esym.st_shndx = osec_shndx(r);
                    esym.st_value = cx.get_addr(id, NO_PLT);
                }
            }
        }
    }
    esym
}

fn want_local_in_symtab(cx: &Context, f: usize, idx: usize) -> bool {
    let file = &cx.objs[f];
    let esym = file.elf_syms[idx];
    if file.sym_names[idx].is_empty() || esym.ty() == STT_SECTION {
        return false;
    }
    let id = file.symbols[idx];
    match cx.sym(id).origin {
        SymbolOrigin::Section(r) => cx
            .try_isec(r)
            .map(|isec| isec.is_alive() || isec.leader.is_some())
            .unwrap_or(false),
        SymbolOrigin::Fragment(_) | SymbolOrigin::Absolute => !esym.is_undef(),
        SymbolOrigin::Chunk(_) => true,
    }
}

fn want_global_in_symtab(cx: &Context, f: usize, idx: usize) -> bool {
    let id = cx.objs[f].symbols[idx];
    let sym = cx.sym(id);
    // A global belongs to the file that owns it; everyone else skips it.
    sym.file == Some(FileId::Obj(f as u32)) && sym.sym_idx as usize == idx
}

/// Count `.symtab` entries and `.strtab` bytes and assign per-file index
/// ranges. The table is locals first (per file), then globals.
pub fn compute_symtab(cx: &mut Context) {
    let mut local_idx = 1usize; // entry 0 is the null symbol
    let mut strtab_size = 1usize;

    // Relocatable output re-emits relocations, and those frequently bind
    // to section symbols; give every output section one, at an index
    // equal to its section header index.
    if cx.options.relocatable || cx.options.emit_relocs {
        local_idx += cx.chunks.iter().filter(|c| !c.is_header()).count();
    }

    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let first_global = cx.objs[f].first_global.min(cx.objs[f].elf_syms.len());
        let mut count = 0usize;
        for i in 1..first_global {
            if want_local_in_symtab(cx, f, i) {
                let id = cx.objs[f].symbols[i];
                cx.sym_mut(id).write_to_symtab = true;
                cx.objs[f].output_sym_indices[i] = count as i32;
                strtab_size += cx.objs[f].sym_names[i].len() + 1;
                count += 1;
            }
        }
        cx.objs[f].local_symtab_idx = local_idx;
        cx.objs[f].num_local_symtab = count;
        local_idx += count;
    }

    let mut global_idx = local_idx;
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let first_global = cx.objs[f].first_global;
        let mut count = 0usize;
        for i in first_global..cx.objs[f].elf_syms.len() {
            if want_global_in_symtab(cx, f, i) {
                let id = cx.objs[f].symbols[i];
                cx.sym_mut(id).write_to_symtab = true;
                cx.objs[f].output_sym_indices[i] = count as i32;
                strtab_size += cx.symbols[id.0 as usize].name.len() + 1;
                count += 1;
            }
        }
        cx.objs[f].global_symtab_idx = global_idx;
        cx.objs[f].num_global_symtab = count;
        global_idx += count;
    }

    let entsize = Sym::size(cx.enc.class) as u64;
    if let Some(symtab) = cx.refs.symtab {
        let chunk = cx.chunk_mut(symtab);
        chunk.shdr.sh_size = global_idx as u64 * entsize;
        chunk.shdr.sh_info = local_idx as u32;
    }
    if let Some(strtab) = cx.refs.strtab {
        cx.chunk_mut(strtab).shdr.sh_size = strtab_size as u64;
    }
}

pub fn copy_symtab(cx: &Context, out: &mut [u8]) {
    let Some(symtab) = cx.refs.symtab else { return };
    let Some(strtab) = cx.refs.strtab else { return };
    let enc = cx.enc;
    let entsize = Sym::size(enc.class);
    let sym_base = cx.chunk(symtab).shdr.sh_offset as usize;
    let str_base = cx.chunk(strtab).shdr.sh_offset as usize;

    Sym::default().write_at(enc, out, sym_base);
    if cx.options.relocatable || cx.options.emit_relocs {
        for chunk in &cx.chunks {
            if chunk.is_header() {
                continue;
            }
            let esym = Sym {
                st_info: Sym::info(crate::elf::STB_LOCAL, STT_SECTION),
                st_shndx: chunk.shndx,
                st_value: chunk.shdr.sh_addr,
                ..Sym::default()
            };
            esym.write_at(enc, out, sym_base + chunk.shndx as usize * entsize);
        }
    }
    let mut str_off = 1usize;
    let mut write = |slot: usize, mut esym: Sym, name: &str, out: &mut [u8]| {
        esym.st_name = str_off as u32;
        out[str_base + str_off..str_base + str_off + name.len()]
            .copy_from_slice(name.as_bytes());
        str_off += name.len() + 1;
        esym.write_at(enc, out, sym_base + slot * entsize);
    };

    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        let first_global = file.first_global.min(file.elf_syms.len());
        for i in 1..first_global {
            let rel_idx = file.output_sym_indices[i];
            let id = file.symbols[i];
            if rel_idx < 0 || !cx.sym(id).write_to_symtab {
                continue;
            }
            let esym = to_output_esym(cx, id);
            write(
                file.local_symtab_idx + rel_idx as usize,
                esym,
                &file.sym_names[i],
                out,
            );
        }
    }
    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        for i in file.first_global..file.elf_syms.len() {
            let rel_idx = file.output_sym_indices[i];
            let id = file.symbols[i];
            if rel_idx < 0 || !cx.sym(id).write_to_symtab {
                continue;
            }
            let esym = to_output_esym(cx, id);
            write(
                file.global_symtab_idx + rel_idx as usize,
                esym,
                &cx.sym(id).name,
                out,
            );
        }
    }
}

pub fn copy_strtab_pools(cx: &Context, out: &mut [u8]) {
    if let Some(shstrtab) = cx.refs.shstrtab {
        let chunk = cx.chunk(shstrtab);
        if let ChunkKind::Shstrtab(pool) = &chunk.kind {
            let base = chunk.shdr.sh_offset as usize;
            out[base..base + pool.len()].copy_from_slice(pool.bytes());
        }
    }
}
