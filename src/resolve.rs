//! Symbol resolution
//!
//! For each global name exactly one input file ends up as the owner,
//! chosen on a bind-class lattice with file priority as the tie break:
//!
//! ```text
//!   undefined < common < archive-member-defined < shared-defined < regular-defined
//!   weak < strong            (within the same bucket)
//! ```
//!
//! Archive members and `--as-needed` DSOs participate lazily: a member is
//! pulled in when it provides a definition some live file needs, which may
//! itself introduce new undefineds, so extraction runs to a fixpoint.

use std::sync::atomic::AtomicBool;

use crate::context::Context;
use crate::elf::{
    SHF_ALLOC, SHF_WRITE, SHT_NOBITS, STB_GNU_UNIQUE, STB_WEAK, STV_DEFAULT, VER_NDX_GLOBAL,
    VER_NDX_LAST_RESERVED, VER_NDX_LOCAL, VER_NDX_UNSPECIFIED,
};
use crate::error::{Error, Result};
use crate::input::InputSection;
use crate::options::{BsymbolicKind, DefsymValue, UnresolvedPolicy};
use crate::script;
use crate::symbol::{FileId, Symbol, SymbolId, SymbolOrigin};

/// Strength bucket on the resolution lattice; greater wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Bucket {
    Undef = 0,
    Common = 1,
    ArchiveDefined = 2,
    SharedDefined = 3,
    RegularDefined = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rank {
    bucket: Bucket,
    strong: bool,
    priority: u32,
}

impl Rank {
    /// True if `self` should replace `other` as the owner
    fn beats(&self, other: &Rank) -> bool {
        let lhs = (self.bucket, self.strong);
        let rhs = (other.bucket, other.strong);
        lhs > rhs || (lhs == rhs && self.priority < other.priority)
    }
}

fn undef_rank() -> Rank {
    Rank {
        bucket: Bucket::Undef,
        strong: false,
        priority: u32::MAX,
    }
}

/// Entry point for stage 2 (first half): bind global names, claim comdat
/// groups, extract needed archive members, convert commons.
pub fn resolve_symbols(cx: &mut Context) -> Result<()> {
    prepare_wrapped_symbols(cx);
    intern_file_symbols(cx);
    apply_defsyms(cx);

    merge_all(cx);
    extract_lazy_files(cx);
    // Dead lazy members may still own symbols from the first merge; redo
    // the merge over the surviving set.
    clear_owners(cx);
    merge_all(cx);

    claim_comdat_groups(cx);
    convert_common_symbols(cx);
    assign_object_versions(cx);
    report_duplicate_definitions(cx);
    cx.diags.checkpoint()
}

fn prepare_wrapped_symbols(cx: &mut Context) {
    for i in 0..cx.options.wrap.len() {
        let name = cx.options.wrap[i].clone();
        let id = cx.intern_symbol(&name, &name);
        cx.sym_mut(id).is_wrapped = true;
        let wrap = format!("__wrap_{name}");
        let real = format!("__real_{name}");
        cx.intern_symbol(&wrap, &wrap);
        cx.intern_symbol(&real, &real);
    }
}

/// The symbol a reference from a regular object actually lands on, after
/// `--wrap` rewriting
fn reference_target(cx: &mut Context, name: &str, key: &str) -> SymbolId {
    if let Some(base) = name.strip_prefix("__real_") {
        if cx
            .find_symbol(base)
            .map(|id| cx.sym(id).is_wrapped)
            .unwrap_or(false)
        {
            return cx.intern_symbol(base, base);
        }
    }
    let id = cx.intern_symbol(key, name);
    if cx.sym(id).is_wrapped {
        let wrap = format!("__wrap_{name}");
        return cx.intern_symbol(&wrap, &wrap);
    }
    id
}

/// Create or look up a `Symbol` for every symbol-table entry of every file
fn intern_file_symbols(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        let nsyms = cx.objs[f].elf_syms.len();
        let first_global = cx.objs[f].first_global;
        let mut ids = Vec::with_capacity(nsyms);

        for i in 0..nsyms {
            if i < first_global {
                // Locals are owned by their file outright.
                let (mut sym, defined) = {
                    let file = &cx.objs[f];
                    let esym = file.elf_syms[i];
                    let mut sym = Symbol::new(file.sym_names[i].clone());
                    sym.file = Some(FileId::Obj(f as u32));
                    sym.sym_idx = i as u32;
                    sym.value = esym.st_value;
                    sym.visibility = esym.visibility();
                    sym.esym_info = esym.st_info;
                    sym.esym_size = esym.st_size;
                    sym.esym_is_undef = esym.is_undef();
                    sym.esym_is_undef_weak = esym.is_undef_weak();
                    let defined = !esym.is_undef();
                    if esym.is_abs() {
                        sym.origin = SymbolOrigin::Absolute;
                    }
                    (sym, defined)
                };
                if defined {
                    set_local_origin(cx, f as u32, &mut sym);
                }
                let id = cx.add_local_symbol(sym);
                ids.push(id);
            } else {
                let (name, key, is_undef) = {
                    let file = &cx.objs[f];
                    let name = file.sym_names[i].clone();
                    let key = match &file.sym_vers[i] {
                        Some((ver, false)) => format!("{name}@{ver}"),
                        _ => name.clone(),
                    };
                    (name, key, file.elf_syms[i].is_undef())
                };
                let id = if is_undef {
                    reference_target(cx, &name, &key)
                } else {
                    cx.intern_symbol(&key, &name)
                };
                // A default-versioned definition also answers unversioned
                // references.
                if let Some((ver, true)) = &cx.objs[f].sym_vers[i].clone() {
                    let versioned = format!("{name}@{ver}");
                    cx.sym_map.insert(versioned, id);
                    cx.sym_mut(id).is_versioned_default = true;
                }
                merge_visibility(cx, id, f, i);
                cx.sym_mut(id).referenced_by_regular_obj = true;
                ids.push(id);
            }
        }
        cx.objs[f].symbols = ids;
    }

    for d in 0..cx.dsos.len() {
        let nsyms = cx.dsos[d].elf_syms.len();
        let mut ids = Vec::with_capacity(nsyms);
        for i in 0..nsyms {
            let name = cx.dsos[d].sym_names[i].clone();
            let id = cx.intern_symbol(&name, &name);
            ids.push(id);
        }
        cx.dsos[d].symbols = ids;
    }
}

fn merge_visibility(cx: &mut Context, id: SymbolId, f: usize, esym_idx: usize) {
    // The most restrictive visibility across all mentions wins.
    let strictness = |v: u8| -> u8 {
        match v {
            crate::elf::STV_INTERNAL => 3,
            crate::elf::STV_HIDDEN => 2,
            crate::elf::STV_PROTECTED => 1,
            _ => 0,
        }
    };
    let new_vis = cx.objs[f].elf_syms[esym_idx].visibility();
    let sym = cx.sym_mut(id);
    if strictness(new_vis) > strictness(sym.visibility) {
        sym.visibility = new_vis;
    }
}

fn set_local_origin(cx: &Context, f: u32, sym: &mut Symbol) {
    let file = &cx.objs[f as usize];
    let esym = file.elf_syms[sym.sym_idx as usize];
    if esym.is_abs() {
        sym.origin = SymbolOrigin::Absolute;
        return;
    }
    let shndx = esym.st_shndx;
    if let Some(Some(m)) = file.mergeable.get(shndx as usize).map(Option::as_ref) {
        if let Some((piece, off)) = m.piece_at(esym.st_value) {
            if let Some(&frag) = m.fragments.get(piece) {
                sym.origin = SymbolOrigin::Fragment(frag);
                sym.value = off;
                return;
            }
        }
    }
    if file
        .sections
        .get(shndx as usize)
        .map(|s| s.is_some())
        .unwrap_or(false)
    {
        sym.origin = SymbolOrigin::Section(crate::symbol::SectionRef { file: f, shndx });
    } else {
        sym.origin = SymbolOrigin::Absolute;
    }
}

fn apply_defsyms(cx: &mut Context) {
    for i in 0..cx.options.defsyms.len() {
        let (name, value) = cx.options.defsyms[i].clone();
        let id = cx.intern_symbol(&name, &name);
        let sym = cx.sym_mut(id);
        sym.is_synthetic = true;
        match value {
            DefsymValue::Addr(addr) => {
                sym.origin = SymbolOrigin::Absolute;
                sym.value = addr;
                sym.esym_is_undef = false;
            }
            DefsymValue::Alias(target) => {
                // The alias picks up the target's address once layout has
                // fixed it; interning the target here lets it pull a
                // definition out of an archive.
                cx.intern_symbol(&target, &target);
            }
        }
    }
}

fn rank_of(cx: &Context, file_is_alive: bool, fid: FileId, esym_idx: usize) -> Rank {
    let (esym, priority, is_dso) = match fid {
        FileId::Obj(f) => {
            let file = &cx.objs[f as usize];
            (file.elf_syms[esym_idx], file.priority, false)
        }
        FileId::Dso(d) => {
            let file = &cx.dsos[d as usize];
            (file.elf_syms[esym_idx], file.priority, true)
        }
    };
    let strong = esym.bind() != STB_WEAK;
    let bucket = if esym.is_undef() {
        Bucket::Undef
    } else if esym.is_common() {
        Bucket::Common
    } else if is_dso {
        Bucket::SharedDefined
    } else if !file_is_alive {
        Bucket::ArchiveDefined
    } else {
        Bucket::RegularDefined
    };
    Rank {
        bucket,
        strong: strong && bucket != Bucket::Undef,
        priority,
    }
}

fn current_rank(cx: &Context, id: SymbolId) -> Rank {
    let sym = cx.sym(id);
    let Some(fid) = sym.file else {
        return undef_rank();
    };
    let alive = match fid {
        FileId::Obj(f) => cx.objs[f as usize].is_alive,
        FileId::Dso(d) => cx.dsos[d as usize].is_alive,
    };
    rank_of(cx, alive, fid, sym.sym_idx as usize)
}

/// One full merge round: every file offers its definitions
fn merge_all(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        let first_global = cx.objs[f].first_global;
        let nsyms = cx.objs[f].elf_syms.len();
        for i in first_global..nsyms {
            let id = cx.objs[f].symbols[i];
            let alive = cx.objs[f].is_alive;
            offer(cx, id, FileId::Obj(f as u32), i, alive);
        }
    }
    for d in 0..cx.dsos.len() {
        for i in 0..cx.dsos[d].elf_syms.len() {
            if cx.dsos[d].elf_syms[i].is_undef() {
                continue;
            }
            let id = cx.dsos[d].symbols[i];
            offer(cx, id, FileId::Dso(d as u32), i, true);
        }
    }
}

fn offer(cx: &mut Context, id: SymbolId, fid: FileId, esym_idx: usize, file_alive: bool) {
    let new_rank = rank_of(cx, file_alive, fid, esym_idx);
    if new_rank.bucket == Bucket::Undef {
        return;
    }
    let cur = current_rank(cx, id);
    if !new_rank.beats(&cur) {
        return;
    }

    let (value, info, size, vis, weak, is_undef, is_undef_weak) = match fid {
        FileId::Obj(f) => {
            let e = cx.objs[f as usize].elf_syms[esym_idx];
            (
                e.st_value,
                e.st_info,
                e.st_size,
                e.visibility(),
                e.is_weak(),
                e.is_undef(),
                e.is_undef_weak(),
            )
        }
        FileId::Dso(d) => {
            let e = cx.dsos[d as usize].elf_syms[esym_idx];
            (
                e.st_value,
                e.st_info,
                e.st_size,
                e.visibility(),
                e.is_weak(),
                e.is_undef(),
                e.is_undef_weak(),
            )
        }
    };

    {
        let sym = cx.sym_mut(id);
        sym.file = Some(fid);
        sym.sym_idx = esym_idx as u32;
        sym.value = value;
        sym.is_weak = weak;
        sym.esym_info = info;
        sym.esym_size = size;
        sym.esym_is_undef = is_undef;
        sym.esym_is_undef_weak = is_undef_weak;
        if vis != STV_DEFAULT {
            sym.visibility = vis;
        }
        sym.origin = SymbolOrigin::Absolute;
        sym.ver_idx = VER_NDX_UNSPECIFIED;
    }

    match fid {
        FileId::Obj(f) => {
            let esym = cx.objs[f as usize].elf_syms[esym_idx];
            if !esym.is_common() && !esym.is_abs() && !esym.is_undef() {
                let mut sym = std::mem::replace(cx.sym_mut(id), Symbol::new(""));
                set_local_origin(cx, f, &mut sym);
                *cx.sym_mut(id) = sym;
            }
        }
        FileId::Dso(d) => {
            let ver = cx.dsos[d as usize].versyms[esym_idx];
            cx.sym_mut(id).ver_idx = ver.max(VER_NDX_GLOBAL);
        }
    }

    if cx.sym(id).is_traced {
        log::info!(
            "trace-symbol: {}: definition chosen from {}",
            cx.sym(id).name,
            cx.file_name(fid)
        );
    }
}

fn clear_owners(cx: &mut Context) {
    // Forget owners that live in files we decided not to extract.
    for id in 0..cx.symbols.len() {
        let sym = &cx.symbols[id];
        let Some(fid) = sym.file else { continue };
        let keep = match fid {
            FileId::Obj(f) => cx.objs[f as usize].is_alive,
            FileId::Dso(d) => cx.dsos[d as usize].is_alive,
        };
        if !keep && !sym.is_synthetic {
            let sym = &mut cx.symbols[id];
            // Locals always belong to their file.
            if sym.sym_idx as usize
                >= match fid {
                    FileId::Obj(f) => cx.objs[f as usize].first_global,
                    FileId::Dso(_) => 0,
                }
            {
                sym.file = None;
                sym.origin = SymbolOrigin::Absolute;
                sym.value = 0;
                sym.esym_is_undef = true;
            }
        }
    }
}

/// Extract archive members (and mark `--as-needed` DSOs as needed) until
/// no live file has an unresolved strong reference a lazy file could
/// satisfy.
fn extract_lazy_files(cx: &mut Context) {
    let mut queue: Vec<FileId> = Vec::new();
    for f in 0..cx.objs.len() {
        if cx.objs[f].is_alive {
            queue.push(FileId::Obj(f as u32));
        }
    }
    for d in 0..cx.dsos.len() {
        if cx.dsos[d].is_alive {
            queue.push(FileId::Dso(d as u32));
        }
    }

    // Names the link itself requires behave like strong references from a
    // live file: the entry point and init/fini may only exist in archives.
    let mut forced: Vec<SymbolId> = Vec::new();
    let entry = cx
        .options
        .entry
        .clone()
        .unwrap_or_else(|| "_start".to_string());
    for name in [entry, cx.options.init.clone(), cx.options.fini.clone()] {
        if let Some(id) = cx.find_symbol(&name) {
            forced.push(id);
        }
    }
    for id in forced {
        if let Some(FileId::Obj(f)) = cx.sym(id).file {
            if !cx.objs[f as usize].is_alive {
                cx.objs[f as usize].is_alive = true;
                queue.push(FileId::Obj(f));
            }
        }
    }

    while let Some(fid) = queue.pop() {
        let refs: Vec<(SymbolId, bool)> = match fid {
            FileId::Obj(f) => {
                let file = &cx.objs[f as usize];
                (file.first_global..file.elf_syms.len())
                    .filter(|&i| file.elf_syms[i].is_undef())
                    .map(|i| (file.symbols[i], file.elf_syms[i].is_weak()))
                    .collect()
            }
            FileId::Dso(d) => {
                let file = &cx.dsos[d as usize];
                (0..file.elf_syms.len())
                    .filter(|&i| file.elf_syms[i].is_undef())
                    .map(|i| (file.symbols[i], file.elf_syms[i].is_weak()))
                    .collect()
            }
        };

        for (id, is_weak) in refs {
            // An undefined weak from a DSO must not pull archive members.
            if is_weak && fid.is_dso() {
                continue;
            }
            let Some(owner) = cx.sym(id).file else { continue };
            match owner {
                FileId::Obj(f) if !cx.objs[f as usize].is_alive => {
                    cx.objs[f as usize].is_alive = true;
                    log::debug!(
                        "extracting archive member {} for {}",
                        cx.objs[f as usize].name,
                        cx.sym(id).name
                    );
                    queue.push(owner);
                }
                FileId::Dso(d) if !cx.dsos[d as usize].is_alive => {
                    cx.dsos[d as usize].is_alive = true;
                    queue.push(owner);
                }
                _ => {}
            }
        }
    }
}

/// Comdat groups: the lowest-priority file keeps each group; everybody
/// else guts their copy.
fn claim_comdat_groups(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let priority = cx.objs[f].priority;
        for g in 0..cx.objs[f].comdat_groups.len() {
            let sig = cx.objs[f].comdat_groups[g].signature.clone();
            if sig.is_empty() {
                continue;
            }
            let entry = cx
                .comdat_owners
                .entry(sig)
                .or_insert((priority, f as u32));
            if priority < entry.0 {
                *entry = (priority, f as u32);
            }
        }
    }

    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for g in 0..cx.objs[f].comdat_groups.len() {
            let group = &cx.objs[f].comdat_groups[g];
            if group.signature.is_empty() {
                continue;
            }
            let owner = cx.comdat_owners[&group.signature].1;
            if owner == f as u32 {
                continue;
            }
            for m in group.members.clone() {
                if let Some(Some(isec)) = cx.objs[f].sections.get(m as usize) {
                    isec.kill();
                }
            }
        }
    }
}

/// Tentative (common) definitions get backing storage in a synthetic
/// `.common` BSS section of their owner file.
fn convert_common_symbols(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let first_global = cx.objs[f].first_global;
        for i in first_global..cx.objs[f].elf_syms.len() {
            let id = cx.objs[f].symbols[i];
            let sym = cx.sym(id);
            if sym.file != Some(FileId::Obj(f as u32)) || sym.sym_idx as usize != i {
                continue;
            }
            if !cx.objs[f].elf_syms[i].is_common() {
                continue;
            }

            let esym = cx.objs[f].elf_syms[i];
            let align = esym.st_value.max(1);
            let shndx = cx.objs[f].sections.len() as u32;
            let shdr = crate::elf::Shdr {
                sh_type: SHT_NOBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                sh_size: esym.st_size,
                sh_addralign: align,
                ..Default::default()
            };
            cx.objs[f].sections.push(Some(InputSection {
                shndx,
                name: ".common".to_string(),
                shdr,
                contents: 0..0,
                rels: 0..0,
                fde_begin: 0,
                fde_end: 0,
                p2align: align.trailing_zeros() as u8,
                offset: 0,
                osec: None,
                is_alive: AtomicBool::new(true),
                is_visited: AtomicBool::new(false),
                address_taken: AtomicBool::new(false),
                leader: None,
                exidx: None,
            }));
            cx.objs[f].mergeable.push(None);

            let sym = cx.sym_mut(id);
            sym.origin = SymbolOrigin::Section(crate::symbol::SectionRef {
                file: f as u32,
                shndx,
            });
            sym.value = 0;
        }
    }
}

/// Assign version indices to symbols we define, from `@`/`@@` suffixes and
/// from the version-script patterns.
fn assign_object_versions(cx: &mut Context) {
    if cx.options.version_patterns.is_empty() && cx.options.version_definitions.is_empty() {
        // Without a version script every defined symbol is plain global.
        return;
    }
    let matcher = script::VersionMatcher::new(&cx.options.version_patterns);

    for id in 0..cx.symbols.len() {
        let sym = &cx.symbols[id];
        let Some(FileId::Obj(f)) = sym.file else {
            continue;
        };
        let file = &cx.objs[f as usize];
        if !file.is_alive || (sym.sym_idx as usize) < file.first_global {
            continue;
        }
        if sym.ver_idx != VER_NDX_UNSPECIFIED {
            continue;
        }

        // An explicit suffix on the defining symbol wins over patterns.
        let suffix = file.sym_vers[sym.sym_idx as usize].clone();
        let ver = match suffix {
            Some((ver_name, _)) => version_index(cx, &ver_name),
            None => match matcher.match_name(&cx.symbols[id].name) {
                Some(idx) => idx,
                None => VER_NDX_GLOBAL,
            },
        };
        cx.symbols[id].ver_idx = ver;
    }
}

fn version_index(cx: &Context, name: &str) -> u16 {
    match cx
        .options
        .version_definitions
        .iter()
        .position(|v| v == name)
    {
        Some(pos) => VER_NDX_LAST_RESERVED + 1 + pos as u16,
        None => VER_NDX_GLOBAL,
    }
}

fn report_duplicate_definitions(cx: &mut Context) {
    if cx.options.allow_multiple_definition {
        return;
    }
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let first_global = cx.objs[f].first_global;
        for i in first_global..cx.objs[f].elf_syms.len() {
            let esym = cx.objs[f].elf_syms[i];
            if esym.is_undef() || esym.is_common() || esym.bind() == STB_WEAK {
                continue;
            }
            if esym.bind() == STB_GNU_UNIQUE {
                continue;
            }
            // A definition that lost to a strong definition from another
            // regular object is a duplicate.
            let id = cx.objs[f].symbols[i];
            let sym = cx.sym(id);
            let Some(owner) = sym.file else { continue };
            if owner == FileId::Obj(f as u32) && sym.sym_idx as usize == i {
                continue;
            }
            if let FileId::Obj(of) = owner {
                let owner_esym = cx.objs[of as usize].elf_syms[sym.sym_idx as usize];
                if owner_esym.bind() != STB_WEAK && !owner_esym.is_common() {
                    cx.diags.error(Error::DuplicateDefinition {
                        name: sym.name.clone(),
                        file1: cx.objs[of as usize].name.clone(),
                        file2: cx.objs[f].name.clone(),
                    });
                }
            }
        }
    }
}

/// Stage 2 (second half), run after mark-live: decide the export set and
/// which symbols are imported at runtime.
pub fn compute_import_export(cx: &mut Context) {
    let dynamic_matcher = script::VersionMatcher::new(&cx.options.dynamic_list);
    let has_dynamic_list = !cx.options.dynamic_list.is_empty();

    // --exclude-libs hides everything an archive member contributes.
    let excluded_file = |cx: &Context, f: u32| -> bool {
        let file = &cx.objs[f as usize];
        if !file.in_archive || cx.options.exclude_libs.is_empty() {
            return false;
        }
        let archive = file.name.split('(').next().unwrap_or("");
        let basename = archive.rsplit('/').next().unwrap_or(archive);
        cx.options
            .exclude_libs
            .iter()
            .any(|lib| lib == "ALL" || lib == basename)
    };

    // Symbols defined by DSOs and referenced from regular objects are
    // imports; in an executable that's the complete import story.
    for id in 0..cx.symbols.len() {
        let sym = &cx.symbols[id];
        if let Some(FileId::Dso(_)) = sym.file {
            if sym.referenced_by_regular_obj {
                let sym = &mut cx.symbols[id];
                sym.is_imported = true;
            }
        }
    }

    if cx.dsos.is_empty() && !cx.options.pic() && !cx.options.export_dynamic && !has_dynamic_list {
        return;
    }

    for id in 0..cx.symbols.len() {
        let sym = &cx.symbols[id];
        let Some(FileId::Obj(f)) = sym.file else {
            continue;
        };
        if !cx.objs[f as usize].is_alive {
            continue;
        }
        if (sym.sym_idx as usize) < cx.objs[f as usize].first_global {
            continue;
        }
        if sym.visibility == crate::elf::STV_HIDDEN || sym.visibility == crate::elf::STV_INTERNAL {
            continue;
        }
        if sym.ver_idx == VER_NDX_LOCAL {
            continue;
        }
        if excluded_file(cx, f) {
            continue;
        }

        let name = sym.name.clone();
        let exported = if cx.options.shared {
            true
        } else {
            cx.options.export_dynamic
                || (has_dynamic_list && dynamic_matcher.match_name(&name).is_some())
                || cx.options.export_dynamic_symbols.iter().any(|s| s == &name)
        };
        if !exported {
            continue;
        }

        let sym = &mut cx.symbols[id];
        sym.is_exported = true;

        // In a DSO an exported default-visibility symbol is preemptible
        // unless -Bsymbolic says otherwise.
        if cx.options.shared && sym.visibility != crate::elf::STV_PROTECTED {
            let symbolic = match cx.options.bsymbolic {
                BsymbolicKind::All => true,
                BsymbolicKind::Functions => sym.st_type() == crate::elf::STT_FUNC,
                BsymbolicKind::None => false,
            };
            if !symbolic {
                sym.is_imported = true;
            }
        }
    }
}

/// Collect unresolved references and report them per
/// `--unresolved-symbols` policy.
pub fn claim_unresolved_symbols(cx: &mut Context) -> Result<()> {
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let first_global = cx.objs[f].first_global;
        for i in first_global..cx.objs[f].elf_syms.len() {
            let esym = cx.objs[f].elf_syms[i];
            if !esym.is_undef() {
                continue;
            }
            let id = cx.objs[f].symbols[i];
            let sym = cx.sym(id);
            if sym.file.is_some() || sym.is_synthetic {
                continue;
            }
            if esym.is_weak() {
                // Remaining weak undefineds become 0 in executables and
                // dynamic imports in DSOs; either way, not an error.
                continue;
            }

            let report_error = match cx.options.unresolved_symbols {
                UnresolvedPolicy::IgnoreAll => false,
                UnresolvedPolicy::IgnoreInObjectFiles => false,
                UnresolvedPolicy::ReportAll | UnresolvedPolicy::IgnoreInSharedLibs => {
                    // In a DSO, unresolved symbols are expected to come
                    // from the executable at load time.
                    !cx.options.shared || cx.options.no_undefined
                }
            };
            let err = Error::UndefinedSymbol {
                name: sym.name.clone(),
                referer: cx.objs[f].name.clone(),
            };
            if report_error {
                cx.diags.error(err);
            } else {
                cx.diags.warn(err);
            }
        }
    }

    // With --no-allow-shlib-undefined, a DSO's own dangling strong
    // references are our problem rather than the loader's.
    if !cx.options.allow_shlib_undefined
        && !matches!(
            cx.options.unresolved_symbols,
            UnresolvedPolicy::IgnoreAll | UnresolvedPolicy::IgnoreInSharedLibs
        )
    {
        for d in 0..cx.dsos.len() {
            if !cx.dsos[d].is_alive {
                continue;
            }
            for i in 0..cx.dsos[d].elf_syms.len() {
                let esym = cx.dsos[d].elf_syms[i];
                if !esym.is_undef() || esym.is_weak() {
                    continue;
                }
                let id = cx.dsos[d].symbols[i];
                if cx.sym(id).file.is_none() && !cx.sym(id).is_synthetic {
                    let err = Error::UndefinedSymbol {
                        name: cx.sym(id).name.clone(),
                        referer: cx.dsos[d].name.clone(),
                    };
                    cx.diags.error(err);
                }
            }
        }
    }
    cx.diags.checkpoint()
}
