//! Mark-sweep garbage collection for `--gc-sections`
//!
//! Vertices are sections, edges are relocations. Everything reachable from
//! the root set stays; unmarked `SHF_ALLOC` sections are killed together
//! with their FDEs. Liveness is a monotone fixpoint, so visit order never
//! changes the result.

use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::elf::{
    SHF_ALLOC, SHF_GNU_RETAIN, SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOTE, SHT_PREINIT_ARRAY,
};
use crate::symbol::{FileId, SectionRef, SymbolId};

/// Names like `__start_<section>` work only for C-identifier section
/// names, so such sections must survive collection.
pub fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn should_keep(isec: &crate::input::InputSection) -> bool {
    let ty = isec.shdr.sh_type;
    let flags = isec.shdr.sh_flags;
    let name = isec.name.as_str();

    flags & SHF_GNU_RETAIN != 0
        || ty == SHT_NOTE
        || ty == SHT_INIT_ARRAY
        || ty == SHT_FINI_ARRAY
        || ty == SHT_PREINIT_ARRAY
        || name.starts_with(".ctors")
        || name.starts_with(".dtors")
        || name.starts_with(".init")
        || name.starts_with(".fini")
        || is_c_identifier(name)
}

/// Atomically claim a section for visiting. Returns true the first time.
fn mark_section(cx: &Context, r: SectionRef) -> bool {
    let Some(isec) = cx.try_isec(r) else {
        return false;
    };
    isec.is_alive() && !isec.is_visited.swap(true, Ordering::Relaxed)
}

fn enqueue_symbol(cx: &Context, rootset: &mut Vec<SectionRef>, id: SymbolId) {
    let sym = cx.sym(id);
    if let Some(frag) = sym.fragment() {
        cx.merged[frag.msec as usize].frags[frag.frag as usize]
            .is_alive
            .store(true, Ordering::Relaxed);
    } else if let Some(r) = sym.input_section() {
        if mark_section(cx, r) {
            rootset.push(r);
        }
    }
}

fn collect_root_set(cx: &Context) -> Vec<SectionRef> {
    let mut rootset = Vec::new();

    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        for isec in file.sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            // Only SHF_ALLOC sections are subject to collection; debug
            // info lives or dies with what it describes, not on its own.
            if isec.shdr.sh_flags & SHF_ALLOC == 0 {
                isec.is_visited.store(true, Ordering::Relaxed);
                continue;
            }
            if should_keep(isec) {
                let r = SectionRef {
                    file: f as u32,
                    shndx: isec.shndx,
                };
                if mark_section(cx, r) {
                    rootset.push(r);
                }
            }
        }
    }

    // Sections holding a root or exported symbol.
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for &id in &cx.objs[f].symbols {
            let sym = cx.sym(id);
            if sym.file == Some(FileId::Obj(f as u32)) && (sym.gc_root || sym.is_exported) {
                enqueue_symbol(cx, &mut rootset, id);
            }
        }
    }

    // CIEs are always kept, and so is whatever they reference (usually a
    // personality routine).
    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        for cie in &file.cies {
            for ri in cie.rels.clone() {
                let rel = file.rels[ri as usize];
                enqueue_symbol(cx, &mut rootset, file.symbols[rel.r_sym as usize]);
            }
        }
    }

    rootset
}

fn visit(cx: &Context, queue: &mut Vec<SectionRef>, r: SectionRef) {
    let file = &cx.objs[r.file as usize];
    let isec = cx.isec(r);

    // Keep the exception-handling records of this function alive, along
    // with their LSDA targets.
    for fi in isec.fde_begin..isec.fde_end {
        let fde = &file.fdes[fi as usize];
        for ri in fde.rels.clone().skip(1) {
            let rel = file.rels[ri as usize];
            let sym = cx.sym(file.symbols[rel.r_sym as usize]);
            if let Some(target) = sym.input_section() {
                if mark_section(cx, target) {
                    queue.push(target);
                }
            }
        }
    }

    let contents = file.section_bytes(isec);
    for rel in file.section_rels(isec) {
        let sym = cx.sym(file.symbols[rel.r_sym as usize]);
        if let Some(frag) = sym.fragment() {
            cx.merged[frag.msec as usize].frags[frag.frag as usize]
                .is_alive
                .store(true, Ordering::Relaxed);
        } else if let Some(target) = sym.input_section() {
            if mark_section(cx, target) {
                queue.push(target);
            }
        }
        // A section-symbol reference may address a different piece than
        // the symbol itself; keep the exact one the addend picks.
        let addend = cx.target.get_addend(contents, rel);
        if let Some((frag, _)) = cx.get_fragment(r.file, rel, addend) {
            cx.merged[frag.msec as usize].frags[frag.frag as usize]
                .is_alive
                .store(true, Ordering::Relaxed);
        }
    }

    if let Some(exidx) = isec.exidx {
        let target = SectionRef {
            file: r.file,
            shndx: exidx,
        };
        if mark_section(cx, target) {
            queue.push(target);
        }
    }
}

fn sweep(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        let mut dead_ranges: Vec<(u32, u32)> = Vec::new();
        {
            let file = &cx.objs[f];
            if !file.is_alive {
                continue;
            }
            for isec in file.sections.iter().flatten() {
                if isec.is_alive() && !isec.is_visited.load(Ordering::Relaxed) {
                    if cx.options.print_gc_sections {
                        log::info!("removing unused section {}:({})", file.name, isec.name);
                    }
                    isec.kill();
                    dead_ranges.push((isec.fde_begin, isec.fde_end));
                }
            }
        }
        for (begin, end) in dead_ranges {
            for fi in begin..end {
                cx.objs[f].fdes[fi as usize].is_alive = false;
            }
        }
    }
}

/// Stage 3: mark everything reachable from the roots, then kill the rest
pub fn gc_sections(cx: &mut Context) {
    let mut queue = collect_root_set(cx);
    while let Some(r) = queue.pop() {
        visit(cx, &mut queue, r);
    }
    sweep(cx);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_c_identifier_names() {
        assert!(is_c_identifier("my_custom_section"));
        assert!(is_c_identifier("__libc_atexit"));
        assert!(!is_c_identifier(".text"));
        assert!(!is_c_identifier("0abc"));
        assert!(!is_c_identifier(""));
        assert!(!is_c_identifier("has-dash"));
    }
}
