//! Symbol version tables
//!
//! `.gnu.version` is a parallel array of version indices for `.dynsym`.
//! Indices above the reserved range refer either to `.gnu.version_r`
//! (requirements on DSOs we link against) or `.gnu.version_d` (versions
//! this output defines).

use crate::context::Context;
use crate::elf::{
    elf_hash, Verdaux, Verdef, Vernaux, Verneed, VER_FLG_BASE, VER_NDX_GLOBAL,
    VER_NDX_LAST_RESERVED, VER_NDX_LOCAL,
};
use crate::output::ChunkKind;
use crate::symbol::{FileId, SymbolId};

/// Build `.gnu.version_r` from the versioned imports, grouped by DSO,
/// and fill the import side of `.gnu.version`.
pub fn construct_verneed(cx: &mut Context) {
    let mut versym: Vec<u16> = vec![VER_NDX_GLOBAL; cx.dynsym_syms.len()];
    if !versym.is_empty() {
        versym[0] = VER_NDX_LOCAL;
    }

    // Imported symbols with a concrete version requirement.
    let mut syms: Vec<(u32, u16, SymbolId)> = Vec::new();
    for i in 1..cx.dynsym_syms.len() {
        let id = cx.dynsym_syms[i];
        let sym = cx.sym(id);
        if let Some(FileId::Dso(d)) = sym.file {
            if sym.ver_idx > VER_NDX_LAST_RESERVED {
                syms.push((d, sym.ver_idx, id));
            }
        }
    }
    syms.sort_by_key(|&(d, ver, _)| (cx.dsos[d as usize].soname.clone(), ver));

    let mut contents = Vec::new();
    let mut num_groups = 0u32;
    if !syms.is_empty() {
        let enc = cx.enc;
        let mut veridx = VER_NDX_LAST_RESERVED + cx.options.version_definitions.len() as u16;
        let mut group_fixup: Option<(usize, u16)> = None; // (verneed offset, count)
        let mut last_aux: Option<usize> = None;

        let mut dynstr_add = |cx: &mut Context, s: &str| -> u32 {
            if let Some(dynstr) = cx.refs.dynstr {
                if let ChunkKind::Dynstr(pool) = &mut cx.chunk_mut(dynstr).kind {
                    return pool.add(s) as u32;
                }
            }
            0
        };

        let mut start_group =
            |cx: &mut Context,
             contents: &mut Vec<u8>,
             d: u32,
             group_fixup: &mut Option<(usize, u16)>,
             last_aux: &mut Option<usize>| {
                // Seal the previous group header.
                if let Some((off, cnt)) = group_fixup.take() {
                    let next = (contents.len() - off) as u32;
                    let enc = cx.enc;
                    enc.put_u16(contents, off + 2, cnt);
                    enc.put_u32(contents, off + 12, next);
                }
                let soname = cx.dsos[d as usize].soname.clone();
                let vn_file = {
                    if let Some(dynstr) = cx.refs.dynstr {
                        if let ChunkKind::Dynstr(pool) = &mut cx.chunk_mut(dynstr).kind {
                            pool.add(&soname) as u32
                        } else {
                            0
                        }
                    } else {
                        0
                    }
                };
                let off = contents.len();
                contents.resize(off + Verneed::SIZE, 0);
                Verneed {
                    vn_version: 1,
                    vn_cnt: 0,
                    vn_file,
                    vn_aux: Verneed::SIZE as u32,
                    vn_next: 0,
                }
                .write_at(cx.enc, contents, off);
                *group_fixup = Some((off, 0));
                *last_aux = None;
            };

        let mut add_entry = |cx: &mut Context,
                             contents: &mut Vec<u8>,
                             name: &str,
                             idx: u16,
                             group_fixup: &mut Option<(usize, u16)>,
                             last_aux: &mut Option<usize>| {
            if let Some(prev) = last_aux.take() {
                let next = (contents.len() - prev) as u32;
                cx.enc.put_u32(contents, prev + 12, next);
            }
            let vna_name = dynstr_add(cx, name);
            let off = contents.len();
            contents.resize(off + Vernaux::SIZE, 0);
            Vernaux {
                vna_hash: elf_hash(name),
                vna_flags: 0,
                vna_other: idx,
                vna_name,
                vna_next: 0,
            }
            .write_at(cx.enc, contents, off);
            *last_aux = Some(off);
            if let Some((_, cnt)) = group_fixup.as_mut() {
                *cnt += 1;
            }
        };

        let mut cur_dso: Option<u32> = None;
        let mut cur_ver: Option<u16> = None;
        for (d, ver, id) in syms {
            if cur_dso != Some(d) {
                start_group(cx, &mut contents, d, &mut group_fixup, &mut last_aux);
                num_groups += 1;
                cur_dso = Some(d);
                cur_ver = None;

                // Packed relative relocations need glibc 2.38+; make older
                // loaders refuse to load the output instead of crashing.
                if cx.options.pack_dyn_relocs_relr
                    && cx.dsos[d as usize].soname.starts_with("libc.so.")
                {
                    veridx += 1;
                    add_entry(
                        cx,
                        &mut contents,
                        "GLIBC_ABI_DT_RELR",
                        veridx,
                        &mut group_fixup,
                        &mut last_aux,
                    );
                }
            }
            if cur_ver != Some(ver) {
                let name = cx.dsos[cur_dso.unwrap_or(d) as usize]
                    .version_name(ver)
                    .to_string();
                veridx += 1;
                add_entry(
                    cx,
                    &mut contents,
                    &name,
                    veridx,
                    &mut group_fixup,
                    &mut last_aux,
                );
                cur_ver = Some(ver);
            }
            if let Some(slot) = cx.dynsym_idx(id).try_into().ok().filter(|&i: &usize| i > 0) {
                versym[slot] = veridx;
            }
        }
        if let Some((off, cnt)) = group_fixup.take() {
            enc.put_u16(&mut contents, off + 2, cnt);
        }
    }

    if let Some(verneed) = cx.refs.verneed {
        let chunk = cx.chunk_mut(verneed);
        chunk.shdr.sh_size = contents.len() as u64;
        chunk.shdr.sh_info = num_groups;
        chunk.kind = ChunkKind::Verneed(contents);
    }

    // Version definitions for symbols we export.
    construct_verdef(cx, &mut versym);

    if let Some(versym_id) = cx.refs.versym {
        let chunk = cx.chunk_mut(versym_id);
        chunk.shdr.sh_size = versym.len() as u64 * 2;
        chunk.kind = ChunkKind::Versym(versym);
    }
}

fn construct_verdef(cx: &mut Context, versym: &mut [u16]) {
    if cx.options.version_definitions.is_empty() {
        return;
    }

    // Record the defined version of every exported symbol.
    for i in 1..cx.dynsym_syms.len() {
        let id = cx.dynsym_syms[i];
        let sym = cx.sym(id);
        if sym.file.map(|f| !f.is_dso()).unwrap_or(false)
            && sym.ver_idx != crate::elf::VER_NDX_UNSPECIFIED
        {
            versym[i] = sym.ver_idx;
        }
    }

    let mut contents = Vec::new();
    let mut num_defs = 0u32;
    let mut prev_off: Option<usize> = None;

    let mut dynstr_add = |cx: &mut Context, s: &str| -> u32 {
        if let Some(dynstr) = cx.refs.dynstr {
            if let ChunkKind::Dynstr(pool) = &mut cx.chunk_mut(dynstr).kind {
                return pool.add(s) as u32;
            }
        }
        0
    };

    let mut write = |cx: &mut Context,
                     contents: &mut Vec<u8>,
                     name: &str,
                     idx: u16,
                     flags: u16,
                     prev_off: &mut Option<usize>| {
        if let Some(prev) = prev_off.take() {
            let next = (contents.len() - prev) as u32;
            cx.enc.put_u32(contents, prev + 16, next);
        }
        let vda_name = dynstr_add(cx, name);
        let off = contents.len();
        contents.resize(off + Verdef::SIZE + Verdaux::SIZE, 0);
        Verdef {
            vd_version: 1,
            vd_flags: flags,
            vd_ndx: idx,
            vd_cnt: 1,
            vd_hash: elf_hash(name),
            vd_aux: Verdef::SIZE as u32,
            vd_next: 0,
        }
        .write_at(cx.enc, contents, off);
        Verdaux {
            vda_name,
            vda_next: 0,
        }
        .write_at(cx.enc, contents, off + Verdef::SIZE);
        *prev_off = Some(off);
    };

    let base_name = cx
        .options
        .soname
        .clone()
        .unwrap_or_else(|| {
            cx.options
                .output
                .rsplit('/')
                .next()
                .unwrap_or("a.out")
                .to_string()
        });
    write(cx, &mut contents, &base_name, 1, VER_FLG_BASE, &mut prev_off);
    num_defs += 1;

    let defs = cx.options.version_definitions.clone();
    for (i, name) in defs.iter().enumerate() {
        write(
            cx,
            &mut contents,
            name,
            VER_NDX_LAST_RESERVED + 1 + i as u16,
            0,
            &mut prev_off,
        );
        num_defs += 1;
    }

    if let Some(verdef) = cx.refs.verdef {
        let chunk = cx.chunk_mut(verdef);
        chunk.shdr.sh_size = contents.len() as u64;
        chunk.shdr.sh_info = num_defs;
        chunk.kind = ChunkKind::Verdef(contents);
    }
}

/// Write the three version chunks
pub fn copy_versions(cx: &Context, out: &mut [u8]) {
    if let Some(versym) = cx.refs.versym {
        let chunk = cx.chunk(versym);
        if let ChunkKind::Versym(contents) = &chunk.kind {
            let base = chunk.shdr.sh_offset as usize;
            for (i, &v) in contents.iter().enumerate() {
                cx.enc.put_u16(out, base + i * 2, v);
            }
        }
    }
    for id in [cx.refs.verneed, cx.refs.verdef].into_iter().flatten() {
        let chunk = cx.chunk(id);
        let bytes = match &chunk.kind {
            ChunkKind::Verneed(b) | ChunkKind::Verdef(b) => b,
            _ => continue,
        };
        let base = chunk.shdr.sh_offset as usize;
        out[base..base + bytes.len()].copy_from_slice(bytes);
    }
}
