//! Chunk ordering, address assignment and program header synthesis
//!
//! Layout decides the one thing everything downstream depends on: which
//! byte of the file and which virtual address every chunk owns. Chunks
//! are sorted so that sections with equal segment flags are contiguous,
//! RELRO chunks end at a page boundary, and `p_vaddr ≡ p_offset` modulo
//! the page size for every loadable segment.

use crate::context::Context;
use crate::elf::{
    Machine, Phdr, Rel, Shdr, PF_R, PF_W, PF_X, PT_ARM_EXIDX, PT_DYNAMIC, PT_GNU_EH_FRAME,
    PT_GNU_PROPERTY, PT_GNU_RELRO, PT_GNU_STACK, PT_INTERP, PT_LOAD, PT_NOTE,
    PT_OPENBSD_RANDOMIZE, PT_PHDR, PT_TLS, SHF_ALLOC, SHF_EXECINSTR, SHF_TLS, SHF_WRITE,
    SHN_LORESERVE, SHT_ARM_EXIDX, SHT_DYNAMIC, SHT_DYNSYM, SHT_GNU_HASH, SHT_GNU_VERDEF,
    SHT_GNU_VERNEED, SHT_GNU_VERSYM, SHT_HASH, SHT_NOBITS, SHT_NOTE, SHT_PROGBITS, SHT_REL,
    SHT_RELA, SHT_RELR, SHT_STRTAB, SHT_SYMTAB,
};
use crate::error::{Error, Result};
use crate::gc::is_c_identifier;
use crate::options::HashStyle;
use crate::output::{got, Chunk, ChunkKind, StrPool};
use crate::symbol::{ChunkId, SymbolOrigin};

/// Create the synthetic chunks this link will need. Sizes come later;
/// existence is decided here so the relocation scan has slots to fill.
pub fn create_synthetic_chunks(cx: &mut Context) {
    let info = cx.target.info();
    let word = cx.word_size();
    // Static non-PIE executables are the only outputs with no dynamic
    // state at all; a static PIE still needs relocations for its own base.
    let is_dynamic = !cx.options.relocatable
        && (cx.options.pic() || (!cx.options.static_ && !cx.dsos.is_empty()));

    let mut add = |cx: &mut Context, chunk: Chunk| -> ChunkId { cx.push_chunk(chunk) };

    let mut ehdr = Chunk::new("EHDR", ChunkKind::Ehdr);
    ehdr.shdr.sh_flags = SHF_ALLOC;
    ehdr.shdr.sh_size = crate::elf::Ehdr::size(cx.enc.class) as u64;
    ehdr.shdr.sh_addralign = word;
    cx.refs.ehdr = Some(add(cx, ehdr));

    if !cx.options.relocatable {
        let mut phdr = Chunk::new("PHDR", ChunkKind::Phdr);
        phdr.shdr.sh_flags = SHF_ALLOC;
        phdr.shdr.sh_addralign = word;
        cx.refs.phdr = Some(add(cx, phdr));
    }

    let shdr = Chunk::new("SHDR", ChunkKind::Shdr);
    cx.refs.shdr = Some(add(cx, shdr));

    if is_dynamic && !cx.options.shared && !cx.options.static_ {
        if let Some(path) = cx.options.dynamic_linker.clone() {
            let mut interp = Chunk::new(".interp", ChunkKind::Interp);
            interp.shdr.sh_type = SHT_PROGBITS;
            interp.shdr.sh_flags = SHF_ALLOC;
            interp.shdr.sh_size = path.len() as u64 + 1;
            cx.refs.interp = Some(add(cx, interp));
        }
    }

    if cx.options.relocatable {
        // Relocatable output carries only the symbol table trio; input
        // relocations are re-emitted against it.
        let mut symtab = Chunk::new(".symtab", ChunkKind::Symtab);
        symtab.shdr.sh_type = SHT_SYMTAB;
        symtab.shdr.sh_entsize = crate::elf::Sym::size(cx.enc.class) as u64;
        symtab.shdr.sh_addralign = word;
        cx.refs.symtab = Some(add(cx, symtab));

        let mut strtab = Chunk::new(".strtab", ChunkKind::Strtab(StrPool::new()));
        strtab.shdr.sh_type = SHT_STRTAB;
        cx.refs.strtab = Some(add(cx, strtab));

        let mut shstrtab = Chunk::new(".shstrtab", ChunkKind::Shstrtab(StrPool::new()));
        shstrtab.shdr.sh_type = SHT_STRTAB;
        cx.refs.shstrtab = Some(add(cx, shstrtab));
        return;
    }

    let mut got = Chunk::new(".got", ChunkKind::Got);
    got.shdr.sh_type = SHT_PROGBITS;
    got.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
    got.shdr.sh_addralign = word;
    got.shdr.sh_size = word; // slot for _GLOBAL_OFFSET_TABLE_ to anchor
    got.is_relro = true;
    cx.refs.got = Some(add(cx, got));

    let mut gotplt = Chunk::new(".got.plt", ChunkKind::GotPlt);
    gotplt.shdr.sh_type = SHT_PROGBITS;
    gotplt.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
    gotplt.shdr.sh_addralign = word;
    gotplt.is_relro = cx.options.z_now;
    cx.refs.gotplt = Some(add(cx, gotplt));

    let mut plt = Chunk::new(".plt", ChunkKind::Plt);
    plt.shdr.sh_type = SHT_PROGBITS;
    plt.shdr.sh_flags = SHF_ALLOC | SHF_EXECINSTR;
    plt.shdr.sh_addralign = 16;
    cx.refs.plt = Some(add(cx, plt));

    let mut pltgot = Chunk::new(".plt.got", ChunkKind::PltGot);
    pltgot.shdr.sh_type = SHT_PROGBITS;
    pltgot.shdr.sh_flags = SHF_ALLOC | SHF_EXECINSTR;
    pltgot.shdr.sh_addralign = 16;
    cx.refs.pltgot = Some(add(cx, pltgot));

    let rel_name = |base: &str| -> String {
        if info.is_rela {
            format!(".rela{base}")
        } else {
            format!(".rel{base}")
        }
    };
    let rel_type = if info.is_rela { SHT_RELA } else { SHT_REL };
    let rel_entsize = Rel::entry_size(cx.enc.class, info.is_rela) as u64;

    if is_dynamic {
        let mut reldyn = Chunk::new(rel_name(".dyn"), ChunkKind::RelDyn);
        reldyn.shdr.sh_type = rel_type;
        reldyn.shdr.sh_flags = SHF_ALLOC;
        reldyn.shdr.sh_entsize = rel_entsize;
        reldyn.shdr.sh_addralign = word;
        cx.refs.reldyn = Some(add(cx, reldyn));

        let mut relplt = Chunk::new(rel_name(".plt"), ChunkKind::RelPlt);
        relplt.shdr.sh_type = rel_type;
        relplt.shdr.sh_flags = SHF_ALLOC;
        relplt.shdr.sh_entsize = rel_entsize;
        relplt.shdr.sh_addralign = word;
        cx.refs.relplt = Some(add(cx, relplt));

        if cx.options.pack_dyn_relocs_relr {
            let mut relr = Chunk::new(".relr.dyn", ChunkKind::RelrDyn);
            relr.shdr.sh_type = SHT_RELR;
            relr.shdr.sh_flags = SHF_ALLOC;
            relr.shdr.sh_entsize = word;
            relr.shdr.sh_addralign = word;
            cx.refs.relrdyn = Some(add(cx, relr));
        }

        let mut dynsym = Chunk::new(".dynsym", ChunkKind::Dynsym);
        dynsym.shdr.sh_type = SHT_DYNSYM;
        dynsym.shdr.sh_flags = SHF_ALLOC;
        dynsym.shdr.sh_entsize = crate::elf::Sym::size(cx.enc.class) as u64;
        dynsym.shdr.sh_addralign = word;
        cx.refs.dynsym = Some(add(cx, dynsym));

        let mut dynstr = Chunk::new(".dynstr", ChunkKind::Dynstr(StrPool::new()));
        dynstr.shdr.sh_type = SHT_STRTAB;
        dynstr.shdr.sh_flags = SHF_ALLOC;
        cx.refs.dynstr = Some(add(cx, dynstr));

        if matches!(cx.options.hash_style, HashStyle::Sysv | HashStyle::Both) {
            let mut hash = Chunk::new(".hash", ChunkKind::Hash);
            hash.shdr.sh_type = SHT_HASH;
            hash.shdr.sh_flags = SHF_ALLOC;
            hash.shdr.sh_entsize = 4;
            hash.shdr.sh_addralign = 4;
            cx.refs.hash = Some(add(cx, hash));
        }
        if matches!(cx.options.hash_style, HashStyle::Gnu | HashStyle::Both) {
            let mut gnu_hash = Chunk::new(".gnu.hash", ChunkKind::GnuHash);
            gnu_hash.shdr.sh_type = SHT_GNU_HASH;
            gnu_hash.shdr.sh_flags = SHF_ALLOC;
            gnu_hash.shdr.sh_addralign = word;
            cx.refs.gnu_hash = Some(add(cx, gnu_hash));
        }

        let mut versym = Chunk::new(".gnu.version", ChunkKind::Versym(Vec::new()));
        versym.shdr.sh_type = SHT_GNU_VERSYM;
        versym.shdr.sh_flags = SHF_ALLOC;
        versym.shdr.sh_entsize = 2;
        versym.shdr.sh_addralign = 2;
        cx.refs.versym = Some(add(cx, versym));

        let mut verneed = Chunk::new(".gnu.version_r", ChunkKind::Verneed(Vec::new()));
        verneed.shdr.sh_type = SHT_GNU_VERNEED;
        verneed.shdr.sh_flags = SHF_ALLOC;
        verneed.shdr.sh_addralign = word;
        cx.refs.verneed = Some(add(cx, verneed));

        if !cx.options.version_definitions.is_empty() {
            let mut verdef = Chunk::new(".gnu.version_d", ChunkKind::Verdef(Vec::new()));
            verdef.shdr.sh_type = SHT_GNU_VERDEF;
            verdef.shdr.sh_flags = SHF_ALLOC;
            verdef.shdr.sh_addralign = word;
            cx.refs.verdef = Some(add(cx, verdef));
        }

        let mut dynamic = Chunk::new(".dynamic", ChunkKind::Dynamic);
        dynamic.shdr.sh_type = SHT_DYNAMIC;
        dynamic.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
        dynamic.shdr.sh_addralign = word;
        dynamic.is_relro = true;
        cx.refs.dynamic = Some(add(cx, dynamic));

        if !cx.options.shared {
            let mut copyrel = Chunk::new(".copyrel", ChunkKind::Copyrel);
            copyrel.shdr.sh_type = SHT_NOBITS;
            copyrel.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
            cx.refs.copyrel = Some(add(cx, copyrel));

            let mut copyrel_relro = Chunk::new(".copyrel.rel.ro", ChunkKind::Copyrel);
            copyrel_relro.shdr.sh_type = SHT_NOBITS;
            copyrel_relro.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
            copyrel_relro.is_relro = true;
            cx.refs.copyrel_relro = Some(add(cx, copyrel_relro));
        }
    }

    let has_ehframe = cx.objs.iter().any(|f| f.is_alive && !f.cies.is_empty());
    if has_ehframe {
        let mut eh = Chunk::new(".eh_frame", ChunkKind::EhFrame);
        eh.shdr.sh_type = SHT_PROGBITS;
        eh.shdr.sh_flags = SHF_ALLOC;
        eh.shdr.sh_addralign = word;
        cx.refs.eh_frame = Some(add(cx, eh));

        let mut hdr = Chunk::new(".eh_frame_hdr", ChunkKind::EhFrameHdr);
        hdr.shdr.sh_type = SHT_PROGBITS;
        hdr.shdr.sh_flags = SHF_ALLOC;
        hdr.shdr.sh_addralign = 4;
        cx.refs.eh_frame_hdr = Some(add(cx, hdr));
    }

    if cx.options.build_id.size() > 0 {
        let mut note = Chunk::new(".note.gnu.build-id", ChunkKind::NoteBuildId);
        note.shdr.sh_type = SHT_NOTE;
        note.shdr.sh_flags = SHF_ALLOC;
        note.shdr.sh_addralign = 4;
        cx.refs.note_buildid = Some(add(cx, note));
    }

    let features = merged_x86_features(cx);
    let isa = isa_property(cx);
    if features != 0 || isa != 0 {
        let mut note = Chunk::new(
            ".note.gnu.property",
            ChunkKind::NoteProperty { features, isa },
        );
        note.shdr.sh_type = SHT_NOTE;
        note.shdr.sh_flags = SHF_ALLOC;
        note.shdr.sh_addralign = word;
        cx.refs.note_property = Some(add(cx, note));
    }

    if cx.options.package_metadata.is_some() {
        let mut note = Chunk::new(".note.package", ChunkKind::NotePackage);
        note.shdr.sh_type = SHT_NOTE;
        note.shdr.sh_flags = SHF_ALLOC;
        note.shdr.sh_addralign = 4;
        cx.refs.note_package = Some(add(cx, note));
    }

    if cx.options.z_relro {
        let mut pad = Chunk::new(".relro_padding", ChunkKind::RelroPadding);
        pad.shdr.sh_type = SHT_NOBITS;
        pad.shdr.sh_flags = SHF_ALLOC | SHF_WRITE;
        pad.is_relro = true;
        cx.refs.relro_padding = Some(add(cx, pad));
    }

    let mut symtab = Chunk::new(".symtab", ChunkKind::Symtab);
    symtab.shdr.sh_type = SHT_SYMTAB;
    symtab.shdr.sh_entsize = crate::elf::Sym::size(cx.enc.class) as u64;
    symtab.shdr.sh_addralign = word;
    cx.refs.symtab = Some(add(cx, symtab));

    let mut strtab = Chunk::new(".strtab", ChunkKind::Strtab(StrPool::new()));
    strtab.shdr.sh_type = SHT_STRTAB;
    cx.refs.strtab = Some(add(cx, strtab));

    let mut shstrtab = Chunk::new(".shstrtab", ChunkKind::Shstrtab(StrPool::new()));
    shstrtab.shdr.sh_type = SHT_STRTAB;
    cx.refs.shstrtab = Some(add(cx, shstrtab));
}

/// AND of the `GNU_PROPERTY_X86_FEATURE_1_AND` words across inputs; a
/// file without the note clears everything unless forced back on.
fn merged_x86_features(cx: &Context) -> u32 {
    if !matches!(cx.target.info().machine, Machine::X86_64 | Machine::I386) {
        return 0;
    }
    let mut features = u32::MAX;
    for f in cx.objs.iter().filter(|f| f.is_alive) {
        features &= f.feature_1_and.unwrap_or(0);
    }
    if features == u32::MAX {
        features = 0;
    }
    if cx.options.z_ibt {
        features |= crate::elf::GNU_PROPERTY_X86_FEATURE_1_IBT;
    }
    if cx.options.z_shstk {
        features |= crate::elf::GNU_PROPERTY_X86_FEATURE_1_SHSTK;
    }
    features
}

fn isa_property(cx: &Context) -> u32 {
    use crate::options::X86IsaLevel;
    match cx.options.z_isa_level {
        X86IsaLevel::Baseline => 0,
        X86IsaLevel::V2 => crate::elf::GNU_PROPERTY_X86_ISA_1_V2,
        X86IsaLevel::V3 => crate::elf::GNU_PROPERTY_X86_ISA_1_V3,
        X86IsaLevel::V4 => crate::elf::GNU_PROPERTY_X86_ISA_1_V4,
    }
}

/// Intern the names the link itself requires, before file symbols bind.
/// The entry point and init/fini get `gc_root` here so archive extraction
/// and the mark pass treat them as live references.
pub fn define_linker_symbols(cx: &mut Context) {
    let entry_name = cx
        .options
        .entry
        .clone()
        .unwrap_or_else(|| "_start".to_string());
    let id = cx.intern_symbol(&entry_name, &entry_name);
    cx.sym_mut(id).gc_root = true;
    for name in [cx.options.init.clone(), cx.options.fini.clone()] {
        let id = cx.intern_symbol(&name, &name);
        cx.sym_mut(id).gc_root = true;
    }
}

/// After resolution, referenced-but-undefined reserved names become
/// definitions of the linker's own; their values land during layout.
pub fn mark_synthetic_symbols(cx: &mut Context) {
    for name in cx.options.export_dynamic_symbols.clone() {
        if let Some(id) = cx.find_symbol(&name) {
            cx.sym_mut(id).gc_root = true;
        }
    }

    let names = [
        "__ehdr_start",
        "__executable_start",
        "_GLOBAL_OFFSET_TABLE_",
        "_PROCEDURE_LINKAGE_TABLE_",
        "_DYNAMIC",
        "__bss_start",
        "__dso_handle",
        "_end",
        "end",
        "_etext",
        "etext",
        "_edata",
        "edata",
        "__init_array_start",
        "__init_array_end",
        "__fini_array_start",
        "__fini_array_end",
        "__preinit_array_start",
        "__preinit_array_end",
        "__rel_iplt_start",
        "__rel_iplt_end",
        "__GNU_EH_FRAME_HDR",
        "__exidx_start",
        "__exidx_end",
        "__global_pointer$",
        "_TLS_MODULE_BASE_",
    ];
    for name in names {
        if let Some(id) = cx.find_symbol(name) {
            let sym = cx.sym_mut(id);
            if sym.file.is_none() {
                sym.is_synthetic = true;
                sym.esym_is_undef = false;
            }
        }
    }

    // __start_SECNAME / __stop_SECNAME references
    let referenced: Vec<String> = cx
        .sym_map
        .keys()
        .filter(|k| k.starts_with("__start_") || k.starts_with("__stop_"))
        .cloned()
        .collect();
    for key in referenced {
        let sec = key
            .trim_start_matches("__start_")
            .trim_start_matches("__stop_");
        if is_c_identifier(sec) {
            if let Some(id) = cx.find_symbol(&key) {
                let sym = cx.sym_mut(id);
                if sym.file.is_none() {
                    sym.is_synthetic = true;
                    sym.esym_is_undef = false;
                    sym.gc_root = true;
                }
            }
        }
    }
}

fn to_phdr_flags(cx: &Context, chunk: &Chunk) -> u32 {
    if cx.options.omagic {
        return PF_R | PF_W | PF_X;
    }
    let write = chunk.shdr.sh_flags & SHF_WRITE != 0;
    let mut exec = chunk.shdr.sh_flags & SHF_EXECINSTR != 0;
    if exec && cx.options.execute_only {
        return PF_X;
    }
    if !write && !cx.options.rosegment {
        exec = true;
    }
    PF_R | if write { PF_W } else { 0 } | if exec { PF_X } else { 0 }
}

fn chunk_rank(cx: &Context, chunk: &Chunk) -> (u32, u32, u32) {
    let alloc = chunk.shdr.sh_flags & SHF_ALLOC != 0;
    let write = chunk.shdr.sh_flags & SHF_WRITE != 0;
    let exec = chunk.shdr.sh_flags & SHF_EXECINSTR != 0;
    let tls = chunk.shdr.sh_flags & SHF_TLS != 0;
    let nobits = chunk.shdr.sh_type == SHT_NOBITS;

    match chunk.kind {
        ChunkKind::Ehdr => return (0, 0, 0),
        ChunkKind::Phdr => return (1, 0, 0),
        ChunkKind::Interp => return (2, 0, 0),
        ChunkKind::Symtab => return (100, 0, 0),
        ChunkKind::Strtab(_) => return (101, 0, 0),
        ChunkKind::Shstrtab(_) => return (102, 0, 0),
        ChunkKind::Shdr => return (103, 0, 0),
        _ => {}
    }
    if !alloc {
        return (90, 0, 0);
    }
    if chunk.shdr.sh_type == SHT_NOTE {
        return (3, chunk.shdr.sh_addralign as u32, 0);
    }

    let group = match (write, exec, nobits) {
        (false, false, _) => 4,
        (false, true, _) => 5,
        (true, _, _) if chunk.is_relro => 6,
        (true, false, false) => 7,
        (true, true, _) => 7,
        (true, false, true) => 8,
    };

    // Fine order inside the read-only group mirrors the traditional
    // section order; within RELRO the padding must come last and TLS
    // data first.
    let sub = match &chunk.kind {
        ChunkKind::Hash => 1,
        ChunkKind::GnuHash => 2,
        ChunkKind::Dynsym => 3,
        ChunkKind::Dynstr(_) => 4,
        ChunkKind::Versym(_) => 5,
        ChunkKind::Verneed(_) => 6,
        ChunkKind::Verdef(_) => 7,
        ChunkKind::RelDyn => 8,
        ChunkKind::RelrDyn => 9,
        ChunkKind::RelPlt => 10,
        ChunkKind::Plt => 11,
        ChunkKind::PltGot => 12,
        ChunkKind::EhFrameHdr => 40,
        ChunkKind::EhFrame => 41,
        ChunkKind::RelroPadding => 99,
        ChunkKind::Got => 30,
        ChunkKind::Dynamic => 31,
        ChunkKind::GotPlt => 21,
        ChunkKind::Copyrel => {
            if chunk.is_relro {
                32
            } else {
                60
            }
        }
        _ => {
            if tls {
                if nobits {
                    11
                } else {
                    10
                }
            } else if nobits {
                50
            } else {
                20
            }
        }
    };
    (group, sub, 0)
}

/// Stable-sort the chunk list and rebuild every `ChunkId`-typed
/// reference to follow the move.
pub fn sort_chunks(cx: &mut Context) {
    let n = cx.chunks.len();
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_by_key(|&i| chunk_rank(cx, &cx.chunks[i as usize]));

    // old index -> new index
    let mut remap = vec![0u32; n];
    for (new, &old) in order.iter().enumerate() {
        remap[old as usize] = new as u32;
    }

    let mut sorted: Vec<Option<Chunk>> = cx.chunks.drain(..).map(Some).collect();
    let mut new_chunks: Vec<Chunk> = Vec::with_capacity(n);
    for &old in &order {
        if let Some(chunk) = sorted[old as usize].take() {
            new_chunks.push(chunk);
        }
    }
    cx.chunks = new_chunks;

    let fix = |id: &mut Option<ChunkId>| {
        if let Some(c) = id {
            *c = ChunkId(remap[c.0 as usize]);
        }
    };
    let refs = &mut cx.refs;
    for id in [
        &mut refs.ehdr,
        &mut refs.phdr,
        &mut refs.shdr,
        &mut refs.interp,
        &mut refs.got,
        &mut refs.gotplt,
        &mut refs.plt,
        &mut refs.pltgot,
        &mut refs.relplt,
        &mut refs.reldyn,
        &mut refs.relrdyn,
        &mut refs.dynsym,
        &mut refs.dynstr,
        &mut refs.dynamic,
        &mut refs.hash,
        &mut refs.gnu_hash,
        &mut refs.versym,
        &mut refs.verneed,
        &mut refs.verdef,
        &mut refs.copyrel,
        &mut refs.copyrel_relro,
        &mut refs.eh_frame,
        &mut refs.eh_frame_hdr,
        &mut refs.note_buildid,
        &mut refs.note_property,
        &mut refs.note_package,
        &mut refs.symtab,
        &mut refs.strtab,
        &mut refs.shstrtab,
        &mut refs.relro_padding,
    ] {
        fix(id);
    }

    for m in cx.merged.iter_mut() {
        if let Some(c) = &mut m.chunk {
            *c = ChunkId(remap[c.0 as usize]);
        }
    }
    for file in cx.objs.iter_mut() {
        for isec in file.sections.iter_mut().flatten() {
            if let Some(c) = &mut isec.osec {
                *c = ChunkId(remap[c.0 as usize]);
            }
        }
    }
    for sym in cx.symbols.iter_mut() {
        if let SymbolOrigin::Chunk(c) = &mut sym.origin {
            *c = ChunkId(remap[c.0 as usize]);
        }
    }
    for chunk in cx.chunks.iter_mut() {
        if let ChunkKind::RelocSec(t) = &mut chunk.kind {
            *t = remap[*t as usize];
        }
    }
}

/// Distribute `.rel.dyn` between its contributors and set its size
pub fn assign_reldyn_offsets(cx: &mut Context) {
    let entsize = Rel::entry_size(cx.enc.class, cx.target.info().is_rela) as u64;
    let mut offset = 0u64;

    if let Some(got_id) = cx.refs.got {
        cx.chunk_mut(got_id).reldyn_offset = offset;
        offset += got::got_reldyn_count(cx) as u64 * entsize;
    }
    for c in 0..cx.chunks.len() {
        let count = match &cx.chunks[c].kind {
            ChunkKind::OutputSection(data) => data
                .abs_rels
                .iter()
                .filter(|r| {
                    matches!(
                        r.kind,
                        crate::output::AbsRelKind::Baserel
                            | crate::output::AbsRelKind::Dynrel
                            | crate::output::AbsRelKind::Ifunc
                    )
                })
                .count(),
            _ => continue,
        };
        cx.chunks[c].reldyn_offset = offset;
        offset += count as u64 * entsize;
    }
    for (chunk_id, syms) in [
        (cx.refs.copyrel, cx.copyrel_syms.clone()),
        (cx.refs.copyrel_relro, cx.copyrel_relro_syms.clone()),
    ] {
        if let Some(id) = chunk_id {
            cx.chunk_mut(id).reldyn_offset = offset;
            let unique: std::collections::HashSet<u64> =
                syms.iter().map(|&s| cx.sym(s).value).collect();
            offset += unique.len() as u64 * entsize;
        }
    }

    if let Some(reldyn) = cx.refs.reldyn {
        cx.chunk_mut(reldyn).shdr.sh_size = offset;
    }
    if let Some(relplt) = cx.refs.relplt {
        cx.chunk_mut(relplt).shdr.sh_size = cx.plt_syms.len() as u64 * entsize;
    }
    if let Some(relrdyn) = cx.refs.relrdyn {
        let words: usize = cx.chunks.iter().map(|c| c.relr.len()).sum();
        cx.chunk_mut(relrdyn).shdr.sh_size = words as u64 * cx.word_size();
    }
}

/// Drop synthetic chunks that ended up empty so they don't clutter the
/// section table, then assign header names and indices.
pub fn finalize_section_table(cx: &mut Context) {
    let keep = |chunk: &Chunk| -> bool {
        if chunk.is_header() {
            return true;
        }
        match &chunk.kind {
            ChunkKind::Strtab(_) | ChunkKind::Shstrtab(_) | ChunkKind::Symtab => true,
            ChunkKind::RelroPadding => true,
            _ => chunk.shdr.sh_size != 0,
        }
    };

    // Drop empty chunks, tracking where the survivors move so the `-r`
    // relocation tables keep pointing at their sections.
    let mut remap: Vec<Option<u32>> = Vec::with_capacity(cx.chunks.len());
    let mut kept: Vec<Chunk> = Vec::with_capacity(cx.chunks.len());
    for chunk in cx.chunks.drain(..) {
        if keep(&chunk) {
            remap.push(Some(kept.len() as u32));
            kept.push(chunk);
        } else {
            remap.push(None);
        }
    }
    cx.chunks = kept;
    for chunk in cx.chunks.iter_mut() {
        if let ChunkKind::RelocSec(t) = &mut chunk.kind {
            if let Some(new) = remap[*t as usize] {
                *t = new;
            }
        }
    }
    // Everything else is re-resolved by kind.
    rebuild_refs(cx);

    let mut shndx = 1u32;
    let mut names: Vec<(usize, String)> = Vec::new();
    for (i, chunk) in cx.chunks.iter_mut().enumerate() {
        if chunk.is_header() {
            chunk.shndx = 0;
            continue;
        }
        chunk.shndx = shndx;
        shndx += 1;
        names.push((i, chunk.name.clone()));
    }

    if let Some(shstrtab) = cx.refs.shstrtab {
        let mut assigned: Vec<(usize, u32)> = Vec::new();
        if let ChunkKind::Shstrtab(pool) = &mut cx.chunk_mut(shstrtab).kind {
            for (i, name) in &names {
                assigned.push((*i, pool.add(name) as u32));
            }
        }
        for (i, off) in assigned {
            cx.chunks[i].shdr.sh_name = off;
        }
        let size = {
            let chunk = cx.chunk(shstrtab);
            match &chunk.kind {
                ChunkKind::Shstrtab(pool) => pool.len() as u64,
                _ => 0,
            }
        };
        cx.chunk_mut(shstrtab).shdr.sh_size = size;
    }

    // Section header table size.
    let num_sections = shndx as u64;
    if let Some(shdr) = cx.refs.shdr {
        let entsize = Shdr::size(cx.enc.class) as u64;
        let word_size = cx.enc.class.word_size() as u64;
        let chunk = cx.chunk_mut(shdr);
        chunk.shdr.sh_size = (num_sections) * entsize;
        chunk.shdr.sh_addralign = word_size;
    }

    wire_section_links(cx);
}

/// After `retain`, every `ChunkId` must be looked up again
fn rebuild_refs(cx: &mut Context) {
    let mut refs = crate::context::ChunkRefs::default();
    for (i, chunk) in cx.chunks.iter().enumerate() {
        let id = Some(ChunkId(i as u32));
        match &chunk.kind {
            ChunkKind::Ehdr => refs.ehdr = id,
            ChunkKind::Phdr => refs.phdr = id,
            ChunkKind::Shdr => refs.shdr = id,
            ChunkKind::Interp => refs.interp = id,
            ChunkKind::Got => refs.got = id,
            ChunkKind::GotPlt => refs.gotplt = id,
            ChunkKind::Plt => refs.plt = id,
            ChunkKind::PltGot => refs.pltgot = id,
            ChunkKind::RelPlt => refs.relplt = id,
            ChunkKind::RelDyn => refs.reldyn = id,
            ChunkKind::RelrDyn => refs.relrdyn = id,
            ChunkKind::Dynsym => refs.dynsym = id,
            ChunkKind::Dynstr(_) => refs.dynstr = id,
            ChunkKind::Dynamic => refs.dynamic = id,
            ChunkKind::Hash => refs.hash = id,
            ChunkKind::GnuHash => refs.gnu_hash = id,
            ChunkKind::Versym(_) => refs.versym = id,
            ChunkKind::Verneed(_) => refs.verneed = id,
            ChunkKind::Verdef(_) => refs.verdef = id,
            ChunkKind::Copyrel => {
                if chunk.is_relro {
                    refs.copyrel_relro = id;
                } else {
                    refs.copyrel = id;
                }
            }
            ChunkKind::EhFrame => refs.eh_frame = id,
            ChunkKind::EhFrameHdr => refs.eh_frame_hdr = id,
            ChunkKind::NoteBuildId => refs.note_buildid = id,
            ChunkKind::NoteProperty { .. } => refs.note_property = id,
            ChunkKind::NotePackage => refs.note_package = id,
            ChunkKind::Symtab => refs.symtab = id,
            ChunkKind::Strtab(_) => refs.strtab = id,
            ChunkKind::Shstrtab(_) => refs.shstrtab = id,
            ChunkKind::RelroPadding => refs.relro_padding = id,
            ChunkKind::OutputSection(_)
            | ChunkKind::Merged(_)
            | ChunkKind::RelocSec(_)
            | ChunkKind::ComdatGroups(_) => {}
        }
    }
    cx.refs = refs;

    // Re-point sections, merged sections and chunk-origin symbols.
    let mut by_kind: std::collections::HashMap<u32, ChunkId> = std::collections::HashMap::new();
    for (i, chunk) in cx.chunks.iter().enumerate() {
        if let ChunkKind::Merged(m) = chunk.kind {
            by_kind.insert(m, ChunkId(i as u32));
        }
    }
    for (m, msec) in cx.merged.iter_mut().enumerate() {
        msec.chunk = by_kind.get(&(m as u32)).copied();
    }

    // Output-section membership is authoritative for isec.osec.
    let mut assignments: Vec<(crate::symbol::SectionRef, ChunkId)> = Vec::new();
    for (i, chunk) in cx.chunks.iter().enumerate() {
        if let ChunkKind::OutputSection(data) = &chunk.kind {
            for &r in &data.members {
                assignments.push((r, ChunkId(i as u32)));
            }
        }
    }
    for (r, id) in assignments {
        if let Some(isec) = cx.objs[r.file as usize].sections[r.shndx as usize].as_mut() {
            isec.osec = Some(id);
        }
    }
}

fn wire_section_links(cx: &mut Context) {
    let dynsym_shndx = cx.refs.dynsym.map(|c| cx.chunk(c).shndx).unwrap_or(0);
    let dynstr_shndx = cx.refs.dynstr.map(|c| cx.chunk(c).shndx).unwrap_or(0);
    let strtab_shndx = cx.refs.strtab.map(|c| cx.chunk(c).shndx).unwrap_or(0);
    let gotplt_shndx = cx.refs.gotplt.map(|c| cx.chunk(c).shndx).unwrap_or(0);
    let text_shndx = cx
        .chunks
        .iter()
        .find(|c| c.name == ".text")
        .map(|c| c.shndx)
        .unwrap_or(0);

    for chunk in cx.chunks.iter_mut() {
        match &chunk.kind {
            ChunkKind::Symtab => chunk.shdr.sh_link = strtab_shndx,
            ChunkKind::Dynsym => chunk.shdr.sh_link = dynstr_shndx,
            ChunkKind::Hash | ChunkKind::GnuHash | ChunkKind::Versym(_) => {
                chunk.shdr.sh_link = dynsym_shndx
            }
            ChunkKind::Verneed(_) | ChunkKind::Verdef(_) | ChunkKind::Dynamic => {
                chunk.shdr.sh_link = dynstr_shndx
            }
            ChunkKind::RelDyn => chunk.shdr.sh_link = dynsym_shndx,
            ChunkKind::RelPlt => {
                chunk.shdr.sh_link = dynsym_shndx;
                chunk.shdr.sh_info = gotplt_shndx;
            }
            _ => {}
        }
        if chunk.shdr.sh_type == SHT_ARM_EXIDX {
            chunk.shdr.sh_link = text_shndx;
        }
    }
}

/// Assign virtual addresses and file offsets. Returns the file size.
pub fn assign_offsets(cx: &mut Context) -> u64 {
    let page = cx.page_size();

    if cx.options.relocatable {
        // No addresses in relocatable output; only aligned file offsets.
        let mut off = 0u64;
        for chunk in cx.chunks.iter_mut() {
            let align = chunk.shdr.sh_addralign.max(1);
            off = (off + align - 1) & !(align - 1);
            chunk.shdr.sh_offset = off;
            if chunk.shdr.sh_type != SHT_NOBITS {
                off += chunk.shdr.sh_size;
            }
        }
        return off;
    }

    let image_base = if cx.options.pic() {
        0
    } else {
        cx.options
            .image_base
            .unwrap_or(cx.target.info().default_image_base)
    };

    let mut addr = image_base;
    let mut off: u64 = 0;
    let mut prev_flags: Option<u32> = None;

    for c in 0..cx.chunks.len() {
        let alloc = cx.chunks[c].shdr.sh_flags & SHF_ALLOC != 0;
        if !alloc {
            continue;
        }
        let flags = to_phdr_flags(cx, &cx.chunks[c]);
        if prev_flags != Some(flags) && !cx.options.omagic {
            addr = (addr + page - 1) & !(page - 1);
            prev_flags = Some(flags);
        }

        if matches!(cx.chunks[c].kind, ChunkKind::RelroPadding) {
            let pad = (page - addr % page) % page;
            cx.chunks[c].shdr.sh_size = pad;
        }

        let align = cx.chunks[c].shdr.sh_addralign.max(1);
        addr = (addr + align - 1) & !(align - 1);
        let chunk = &mut cx.chunks[c];
        chunk.shdr.sh_addr = addr;

        let nobits = chunk.shdr.sh_type == SHT_NOBITS;
        if nobits {
            chunk.shdr.sh_offset = off;
        } else {
            off += addr.wrapping_sub(off) & (page - 1);
            chunk.shdr.sh_offset = off;
            off += chunk.shdr.sh_size;
        }

        let tls_nobits = nobits && chunk.shdr.sh_flags & SHF_TLS != 0;
        if !tls_nobits {
            addr += chunk.shdr.sh_size;
        }
    }

    for c in 0..cx.chunks.len() {
        let chunk = &mut cx.chunks[c];
        if chunk.shdr.sh_flags & SHF_ALLOC != 0 {
            continue;
        }
        let align = chunk.shdr.sh_addralign.max(1);
        off = (off + align - 1) & !(align - 1);
        chunk.shdr.sh_offset = off;
        if chunk.shdr.sh_type != SHT_NOBITS {
            off += chunk.shdr.sh_size;
        }
    }
    off
}

/// Build the program header table
pub fn create_phdrs(cx: &Context) -> Vec<Phdr> {
    let page = cx.page_size();
    let mut vec: Vec<Phdr> = Vec::new();

    let define = |vec: &mut Vec<Phdr>, p_type: u32, p_flags: u32, chunk: &Chunk| {
        let mut phdr = Phdr {
            p_type,
            p_flags,
            p_align: chunk.shdr.sh_addralign,
            ..Phdr::default()
        };
        if chunk.shdr.sh_type == SHT_NOBITS {
            phdr.p_offset = chunk.shdr.sh_addr % page;
        } else {
            phdr.p_offset = chunk.shdr.sh_offset;
            phdr.p_filesz = chunk.shdr.sh_size;
        }
        phdr.p_vaddr = chunk.shdr.sh_addr;
        phdr.p_paddr = chunk.shdr.sh_addr;
        if chunk.shdr.sh_flags & SHF_ALLOC != 0 {
            phdr.p_memsz = chunk.shdr.sh_size;
        }
        vec.push(phdr);
    };

    let append = |vec: &mut Vec<Phdr>, chunk: &Chunk| {
        if let Some(phdr) = vec.last_mut() {
            phdr.p_align = phdr.p_align.max(chunk.shdr.sh_addralign);
            phdr.p_memsz = chunk.shdr.sh_addr + chunk.shdr.sh_size - phdr.p_vaddr;
            if chunk.shdr.sh_type != SHT_NOBITS {
                phdr.p_filesz = phdr.p_memsz;
            }
        }
    };

    let is_tbss =
        |c: &Chunk| c.shdr.sh_type == SHT_NOBITS && c.shdr.sh_flags & SHF_TLS != 0;
    let is_bss = |c: &Chunk| c.shdr.sh_type == SHT_NOBITS;

    let chunks: Vec<&Chunk> = cx
        .chunks
        .iter()
        .filter(|c| c.shdr.sh_flags & SHF_ALLOC != 0 && !is_tbss(c))
        .collect();

    if let Some(phdr_chunk) = cx.refs.phdr.map(|c| cx.chunk(c)) {
        define(&mut vec, PT_PHDR, PF_R, phdr_chunk);
    }
    if let Some(interp) = cx.refs.interp.map(|c| cx.chunk(c)) {
        define(&mut vec, PT_INTERP, PF_R, interp);
    }

    // Note segments.
    let mut i = 0usize;
    while i < chunks.len() {
        let first = chunks[i];
        i += 1;
        if first.shdr.sh_type == SHT_NOTE {
            let flags = to_phdr_flags(cx, first);
            define(&mut vec, PT_NOTE, flags, first);
            while i < chunks.len()
                && chunks[i].shdr.sh_type == SHT_NOTE
                && to_phdr_flags(cx, chunks[i]) == flags
            {
                append(&mut vec, chunks[i]);
                i += 1;
            }
        }
    }

    // Load segments.
    let mut i = 0usize;
    while i < chunks.len() {
        let first = chunks[i];
        i += 1;
        let flags = to_phdr_flags(cx, first);
        define(&mut vec, PT_LOAD, flags, first);
        if let Some(phdr) = vec.last_mut() {
            phdr.p_align = phdr.p_align.max(page);
        }
        if !is_bss(first) {
            while i < chunks.len()
                && !is_bss(chunks[i])
                && to_phdr_flags(cx, chunks[i]) == flags
                && chunks[i].shdr.sh_offset - first.shdr.sh_offset
                    == chunks[i].shdr.sh_addr - first.shdr.sh_addr
            {
                append(&mut vec, chunks[i]);
                i += 1;
            }
        }
        while i < chunks.len() && is_bss(chunks[i]) && to_phdr_flags(cx, chunks[i]) == flags {
            append(&mut vec, chunks[i]);
            i += 1;
        }
    }

    // TLS template segment.
    let mut i = 0usize;
    while i < cx.chunks.len() {
        let first = &cx.chunks[i];
        i += 1;
        if first.shdr.sh_flags & SHF_TLS != 0 {
            define(&mut vec, PT_TLS, PF_R, first);
            while i < cx.chunks.len() && cx.chunks[i].shdr.sh_flags & SHF_TLS != 0 {
                append(&mut vec, &cx.chunks[i]);
                i += 1;
            }
        }
    }

    if let Some(dynamic) = cx.refs.dynamic.map(|c| cx.chunk(c)) {
        if dynamic.shdr.sh_size > 0 {
            define(&mut vec, PT_DYNAMIC, to_phdr_flags(cx, dynamic), dynamic);
        }
    }
    if let Some(hdr) = cx.refs.eh_frame_hdr.map(|c| cx.chunk(c)) {
        define(&mut vec, PT_GNU_EH_FRAME, PF_R, hdr);
    }
    if let Some(prop) = cx.refs.note_property.map(|c| cx.chunk(c)) {
        define(&mut vec, PT_GNU_PROPERTY, PF_R, prop);
    }

    // Stack permission marker.
    vec.push(Phdr {
        p_type: PT_GNU_STACK,
        p_flags: if cx.options.z_execstack {
            PF_R | PF_W | PF_X
        } else {
            PF_R | PF_W
        },
        p_memsz: cx.options.z_stack_size,
        p_align: 1,
        ..Phdr::default()
    });

    if cx.options.z_relro {
        let mut i = 0usize;
        while i < chunks.len() {
            let first = chunks[i];
            i += 1;
            if first.is_relro {
                define(&mut vec, PT_GNU_RELRO, PF_R, first);
                while i < chunks.len() && chunks[i].is_relro {
                    append(&mut vec, chunks[i]);
                    i += 1;
                }
                if let Some(phdr) = vec.last_mut() {
                    phdr.p_align = 1;
                }
            }
        }
    }

    if cx.target.info().machine == Machine::Arm32 {
        if let Some(exidx) = cx.chunks.iter().find(|c| c.shdr.sh_type == SHT_ARM_EXIDX) {
            define(&mut vec, PT_ARM_EXIDX, PF_R, exidx);
        }
    }
    for chunk in &cx.chunks {
        if chunk.name == ".openbsd.randomdata" {
            define(&mut vec, PT_OPENBSD_RANDOMIZE, PF_R | PF_W, chunk);
        }
    }

    // ROM images: p_paddr tracks a physical flash location.
    if let Some(base) = cx.options.physical_image_base {
        let mut paddr = base;
        let mut in_sync = false;
        let mut started = false;
        for phdr in vec.iter_mut() {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            if !started {
                in_sync = phdr.p_vaddr == paddr;
                phdr.p_paddr = paddr;
                paddr += phdr.p_memsz;
                started = true;
                continue;
            }
            if in_sync && paddr <= phdr.p_vaddr && phdr.p_vaddr < paddr + page * 2 {
                phdr.p_paddr = phdr.p_vaddr;
                paddr = phdr.p_vaddr + phdr.p_memsz;
            } else {
                in_sync = false;
                phdr.p_paddr = paddr;
                paddr += phdr.p_memsz;
            }
        }
    }

    for _ in 0..cx.options.spare_program_headers {
        vec.push(Phdr::default());
    }
    vec
}

/// Fix TLS anchors from the finished `PT_TLS` segment
pub fn set_tls_addresses(cx: &mut Context) {
    let Some(tls) = cx.phdrs.iter().find(|p| p.p_type == PT_TLS) else {
        return;
    };
    cx.tls_begin = tls.p_vaddr;
    cx.tp_addr = cx.target.tp_addr(tls.p_vaddr, tls.p_memsz, tls.p_align);
    cx.dtp_addr = cx.target.dtp_addr(tls.p_vaddr);
}

fn define_synthetic(cx: &mut Context, name: &str, chunk: Option<ChunkId>, value: u64) {
    let Some(id) = cx.find_symbol(name) else { return };
    let sym = cx.sym_mut(id);
    if !sym.is_synthetic {
        return;
    }
    match chunk {
        Some(c) => {
            sym.origin = SymbolOrigin::Chunk(c);
            sym.value = value;
        }
        None => {
            sym.origin = SymbolOrigin::Absolute;
            sym.value = value;
        }
    }
}

/// Give the linker-defined symbols their final values
pub fn fix_synthetic_symbols(cx: &mut Context) {
    let ehdr = cx.refs.ehdr;
    define_synthetic(cx, "__ehdr_start", ehdr, 0);
    define_synthetic(cx, "__executable_start", ehdr, 0);
    define_synthetic(cx, "__dso_handle", ehdr, 0);

    let got_anchor = match cx.target.info().machine {
        Machine::X86_64 | Machine::I386 => cx.refs.gotplt,
        _ => cx.refs.got,
    };
    define_synthetic(cx, "_GLOBAL_OFFSET_TABLE_", got_anchor, 0);
    define_synthetic(cx, "_PROCEDURE_LINKAGE_TABLE_", cx.refs.plt, 0);
    define_synthetic(cx, "_DYNAMIC", cx.refs.dynamic, 0);
    define_synthetic(cx, "__GNU_EH_FRAME_HDR", cx.refs.eh_frame_hdr, 0);

    let find_osec = |cx: &Context, name: &str| -> Option<ChunkId> {
        cx.chunks
            .iter()
            .position(|c| c.name == name && !c.is_header())
            .map(|i| ChunkId(i as u32))
    };

    if let Some(bss) = find_osec(cx, ".bss") {
        define_synthetic(cx, "__bss_start", Some(bss), 0);
    }

    let mut etext = 0u64;
    let mut edata = 0u64;
    let mut end = 0u64;
    for chunk in &cx.chunks {
        if chunk.shdr.sh_flags & SHF_ALLOC == 0 {
            continue;
        }
        let addr_end = chunk.shdr.sh_addr + chunk.shdr.sh_size;
        end = end.max(addr_end);
        if chunk.shdr.sh_flags & SHF_EXECINSTR != 0 {
            etext = etext.max(addr_end);
        }
        if chunk.shdr.sh_type != SHT_NOBITS && chunk.shdr.sh_flags & SHF_WRITE != 0 {
            edata = edata.max(addr_end);
        }
    }
    for name in ["_end", "end"] {
        define_synthetic(cx, name, None, end);
    }
    for name in ["_etext", "etext"] {
        define_synthetic(cx, name, None, etext);
    }
    for name in ["_edata", "edata"] {
        define_synthetic(cx, name, None, edata);
    }

    for (sec, start, stop) in [
        (".init_array", "__init_array_start", "__init_array_end"),
        (".fini_array", "__fini_array_start", "__fini_array_end"),
        (
            ".preinit_array",
            "__preinit_array_start",
            "__preinit_array_end",
        ),
    ] {
        if let Some(chunk) = find_osec(cx, sec) {
            let size = cx.chunk(chunk).shdr.sh_size;
            define_synthetic(cx, start, Some(chunk), 0);
            define_synthetic(cx, stop, Some(chunk), size);
        } else {
            define_synthetic(cx, start, None, 0);
            define_synthetic(cx, stop, None, 0);
        }
    }

    if let Some(relplt) = cx.refs.relplt {
        let size = cx.chunk(relplt).shdr.sh_size;
        define_synthetic(cx, "__rel_iplt_start", Some(relplt), 0);
        define_synthetic(cx, "__rel_iplt_end", Some(relplt), size);
    } else {
        define_synthetic(cx, "__rel_iplt_start", None, 0);
        define_synthetic(cx, "__rel_iplt_end", None, 0);
    }

    if let Some(exidx) = cx
        .chunks
        .iter()
        .position(|c| c.shdr.sh_type == SHT_ARM_EXIDX)
        .map(|i| ChunkId(i as u32))
    {
        let size = cx.chunk(exidx).shdr.sh_size;
        define_synthetic(cx, "__exidx_start", Some(exidx), 0);
        define_synthetic(cx, "__exidx_end", Some(exidx), size);
    }

    if cx.target.info().machine == Machine::Riscv {
        // Global pointer relaxation anchors gp at .sdata+0x800.
        let anchor = find_osec(cx, ".sdata")
            .or_else(|| find_osec(cx, ".data"))
            .or(cx.refs.got);
        define_synthetic(cx, "__global_pointer$", anchor, 0x800);
    }

    define_synthetic(cx, "_TLS_MODULE_BASE_", None, cx.tls_begin);

    for c in 0..cx.chunks.len() {
        let (name, size) = {
            let chunk = &cx.chunks[c];
            if chunk.is_header() {
                continue;
            }
            (chunk.name.clone(), chunk.shdr.sh_size)
        };
        if is_c_identifier(&name) {
            define_synthetic(cx, &format!("__start_{name}"), Some(ChunkId(c as u32)), 0);
            define_synthetic(cx, &format!("__stop_{name}"), Some(ChunkId(c as u32)), size);
        }
    }
}

/// The runtime entry point address
pub fn entry_addr(cx: &Context) -> u64 {
    let entry_name = cx.options.entry.as_deref().unwrap_or("_start");
    if let Some(id) = cx.find_symbol(entry_name) {
        let sym = cx.sym(id);
        if sym.file.is_some() || sym.is_synthetic {
            return cx.get_addr(id, 0);
        }
    }
    // Fall back to the beginning of .text, like everyone else does.
    if let Some(chunk) = cx.chunks.iter().find(|c| c.name == ".text") {
        log::warn!("entry symbol {entry_name} not found; defaulting to .text");
        return chunk.shdr.sh_addr;
    }
    0
}

/// Run the offset/phdr loop to a fixed point: the program header table's
/// own size feeds back into the offsets.
pub fn do_layout(cx: &mut Context) -> Result<u64> {
    let phdr_entsize = Phdr::size(cx.enc.class) as u64;
    let mut filesize;
    let mut iterations = 0;
    loop {
        filesize = assign_offsets(cx);
        if cx.options.relocatable {
            break;
        }
        cx.phdrs = create_phdrs(cx);
        let want = cx.phdrs.len() as u64 * phdr_entsize;
        let have = cx
            .refs
            .phdr
            .map(|c| cx.chunk(c).shdr.sh_size)
            .unwrap_or(0);
        if want == have {
            break;
        }
        if let Some(phdr) = cx.refs.phdr {
            cx.chunk_mut(phdr).shdr.sh_size = want;
        }
        iterations += 1;
        if iterations > 4 {
            return Err(Error::internal("program header layout did not converge"));
        }
    }

    // Section count overflow handling is done when the header is written;
    // here we only sanity-check the sizes.
    let num_sections = cx.chunks.iter().filter(|c| !c.is_header()).count() as u64;
    if num_sections >= SHN_LORESERVE as u64 {
        log::debug!("large section count: {num_sections}, using SHN_XINDEX escape");
    }

    set_tls_addresses(cx);
    fix_synthetic_symbols(cx);
    resolve_defsym_aliases(cx);
    crate::thunks::register_thunk_addrs(cx);
    cx.filesize = filesize;
    Ok(filesize)
}

/// `A = B;` script aliases take B's final address
fn resolve_defsym_aliases(cx: &mut Context) {
    for (name, value) in cx.options.defsyms.clone() {
        let crate::options::DefsymValue::Alias(target) = value else {
            continue;
        };
        let (Some(id), Some(target_id)) = (cx.find_symbol(&name), cx.find_symbol(&target))
        else {
            continue;
        };
        let addr = cx.get_addr(target_id, 0);
        let sym = cx.sym_mut(id);
        sym.origin = SymbolOrigin::Absolute;
        sym.value = addr;
        sym.esym_is_undef = false;
    }
}
