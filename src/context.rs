//! The link context
//!
//! One [`Context`] value owns every pool — input files, the global symbol
//! vector, merged sections, output chunks, diagnostics — and is threaded
//! through all passes. Cross-references between pools are index handles,
//! so the only mutation after a pool is built happens through the atomic
//! flags the concurrent passes rely on.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::arch::Target;
use crate::elf::{Encoding, Phdr, Rel, STT_SECTION, STT_TLS};
use crate::error::Diagnostics;
use crate::input::{ObjectFile, SharedFile};
use crate::merge::MergedSection;
use crate::options::LinkOptions;
use crate::output::Chunk;
use crate::symbol::{ChunkId, FileId, FragRef, SectionRef, Symbol, SymbolAux, SymbolId};

/// `get_addr` flag: never return a PLT address
pub const NO_PLT: u8 = 1;

#[derive(Debug, Default)]
/// Handles to the singleton synthetic chunks
pub struct ChunkRefs {
    pub ehdr: Option<ChunkId>,
    pub phdr: Option<ChunkId>,
    pub shdr: Option<ChunkId>,
    pub interp: Option<ChunkId>,
    pub got: Option<ChunkId>,
    pub gotplt: Option<ChunkId>,
    pub plt: Option<ChunkId>,
    pub pltgot: Option<ChunkId>,
    pub relplt: Option<ChunkId>,
    pub reldyn: Option<ChunkId>,
    pub relrdyn: Option<ChunkId>,
    pub dynsym: Option<ChunkId>,
    pub dynstr: Option<ChunkId>,
    pub dynamic: Option<ChunkId>,
    pub hash: Option<ChunkId>,
    pub gnu_hash: Option<ChunkId>,
    pub versym: Option<ChunkId>,
    pub verneed: Option<ChunkId>,
    pub verdef: Option<ChunkId>,
    pub copyrel: Option<ChunkId>,
    pub copyrel_relro: Option<ChunkId>,
    pub eh_frame: Option<ChunkId>,
    pub eh_frame_hdr: Option<ChunkId>,
    pub note_buildid: Option<ChunkId>,
    pub note_property: Option<ChunkId>,
    pub note_package: Option<ChunkId>,
    pub symtab: Option<ChunkId>,
    pub strtab: Option<ChunkId>,
    pub shstrtab: Option<ChunkId>,
    pub relro_padding: Option<ChunkId>,
}

/// The root value threaded through every pass
pub struct Context {
    pub options: LinkOptions,
    pub target: &'static dyn Target,
    pub enc: Encoding,

    pub objs: Vec<ObjectFile>,
    pub dsos: Vec<SharedFile>,

    pub symbols: Vec<Symbol>,
    pub sym_map: HashMap<String, SymbolId>,
    pub symbol_aux: Vec<SymbolAux>,

    pub merged: Vec<MergedSection>,
    pub chunks: Vec<Chunk>,
    pub comdat_owners: HashMap<String, (u32, u32)>,

    pub diags: Diagnostics,
    pub refs: ChunkRefs,

    // Populations of the synthetic chunks, in insertion order
    pub got_syms: Vec<SymbolId>,
    pub gottp_syms: Vec<SymbolId>,
    pub tlsgd_syms: Vec<SymbolId>,
    pub tlsdesc_syms: Vec<SymbolId>,
    /// Word index of the shared local-dynamic GOT pair, -1 if unused
    pub tlsld_idx: i64,
    pub plt_syms: Vec<SymbolId>,
    pub pltgot_syms: Vec<SymbolId>,
    pub copyrel_syms: Vec<SymbolId>,
    pub copyrel_relro_syms: Vec<SymbolId>,
    /// `.dynsym` contents; index 0 is the reserved null entry
    pub dynsym_syms: Vec<SymbolId>,
    pub num_exported_dynsyms: usize,

    // Layout products
    pub phdrs: Vec<Phdr>,
    pub tp_addr: u64,
    pub dtp_addr: u64,
    pub tls_begin: u64,
    pub filesize: u64,

    pub has_textrel: bool,
    pub needs_tlsld: bool,
    pub comment_msec: Option<u32>,
    /// Sorted thunk entry addresses per symbol
    pub thunk_addrs: HashMap<SymbolId, Vec<u64>>,
}

impl Context {
    pub fn new(options: LinkOptions, target: &'static dyn Target) -> Context {
        let fatal_warnings = options.fatal_warnings;
        Context {
            options,
            target,
            enc: target.info().encoding(),
            objs: Vec::new(),
            dsos: Vec::new(),
            symbols: Vec::new(),
            sym_map: HashMap::new(),
            symbol_aux: Vec::new(),
            merged: Vec::new(),
            chunks: Vec::new(),
            comdat_owners: HashMap::new(),
            diags: Diagnostics::new(fatal_warnings),
            refs: ChunkRefs::default(),
            got_syms: Vec::new(),
            gottp_syms: Vec::new(),
            tlsgd_syms: Vec::new(),
            tlsdesc_syms: Vec::new(),
            tlsld_idx: -1,
            plt_syms: Vec::new(),
            pltgot_syms: Vec::new(),
            copyrel_syms: Vec::new(),
            copyrel_relro_syms: Vec::new(),
            dynsym_syms: Vec::new(),
            num_exported_dynsyms: 0,
            phdrs: Vec::new(),
            tp_addr: 0,
            dtp_addr: 0,
            tls_begin: 0,
            filesize: 0,
            has_textrel: false,
            needs_tlsld: false,
            comment_msec: None,
            thunk_addrs: HashMap::new(),
        }
    }

    pub fn word_size(&self) -> u64 {
        self.target.info().word_size()
    }

    pub fn page_size(&self) -> u64 {
        self.target.info().page_size
    }

    // ---- pool accessors ----

    pub fn isec(&self, r: SectionRef) -> &crate::input::InputSection {
        match self.objs[r.file as usize].sections[r.shndx as usize] {
            Some(ref isec) => isec,
            None => unreachable!("section handle points at a skipped section"),
        }
    }

    pub fn try_isec(&self, r: SectionRef) -> Option<&crate::input::InputSection> {
        self.objs
            .get(r.file as usize)?
            .sections
            .get(r.shndx as usize)?
            .as_ref()
    }

    pub fn sym(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn sym_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.0 as usize]
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.chunks[id.0 as usize]
    }

    pub fn file_name(&self, file: FileId) -> &str {
        match file {
            FileId::Obj(i) => &self.objs[i as usize].name,
            FileId::Dso(i) => &self.dsos[i as usize].name,
        }
    }

    pub fn file_priority(&self, file: FileId) -> u32 {
        match file {
            FileId::Obj(i) => self.objs[i as usize].priority,
            FileId::Dso(i) => self.dsos[i as usize].priority,
        }
    }

    /// Find or create the unique symbol for `key` (name plus an optional
    /// `@version` suffix); `name` is the bare name stored on the symbol.
    pub fn intern_symbol(&mut self, key: &str, name: &str) -> SymbolId {
        if let Some(&id) = self.sym_map.get(key) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        let mut sym = Symbol::new(name);
        sym.is_traced = self.options.trace_symbols.iter().any(|t| t == name);
        self.symbols.push(sym);
        self.sym_map.insert(key.to_owned(), id);
        id
    }

    /// Create an anonymous (local) symbol slot
    pub fn add_local_symbol(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(sym);
        id
    }

    pub fn find_symbol(&self, name: &str) -> Option<SymbolId> {
        self.sym_map.get(name).copied()
    }

    // ---- aux table ----

    pub fn add_aux(&mut self, id: SymbolId) {
        if self.symbols[id.0 as usize].aux_idx < 0 {
            self.symbols[id.0 as usize].aux_idx = self.symbol_aux.len() as i32;
            self.symbol_aux.push(SymbolAux::default());
        }
    }

    pub fn aux(&self, id: SymbolId) -> Option<&SymbolAux> {
        let idx = self.symbols[id.0 as usize].aux_idx;
        if idx < 0 {
            None
        } else {
            Some(&self.symbol_aux[idx as usize])
        }
    }

    pub fn aux_mut(&mut self, id: SymbolId) -> Option<&mut SymbolAux> {
        let idx = self.symbols[id.0 as usize].aux_idx;
        if idx < 0 {
            None
        } else {
            Some(&mut self.symbol_aux[idx as usize])
        }
    }

    pub fn got_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.got_idx).unwrap_or(-1)
    }

    pub fn gottp_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.gottp_idx).unwrap_or(-1)
    }

    pub fn tlsgd_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.tlsgd_idx).unwrap_or(-1)
    }

    pub fn tlsdesc_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.tlsdesc_idx).unwrap_or(-1)
    }

    pub fn plt_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.plt_idx).unwrap_or(-1)
    }

    pub fn pltgot_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.pltgot_idx).unwrap_or(-1)
    }

    pub fn dynsym_idx(&self, id: SymbolId) -> i32 {
        self.aux(id).map(|a| a.dynsym_idx).unwrap_or(-1)
    }

    pub fn has_plt(&self, id: SymbolId) -> bool {
        self.plt_idx(id) >= 0 || self.pltgot_idx(id) >= 0
    }

    pub fn has_got(&self, id: SymbolId) -> bool {
        self.got_idx(id) >= 0
    }

    pub fn has_gottp(&self, id: SymbolId) -> bool {
        self.gottp_idx(id) >= 0
    }

    pub fn has_tlsgd(&self, id: SymbolId) -> bool {
        self.tlsgd_idx(id) >= 0
    }

    pub fn has_tlsdesc(&self, id: SymbolId) -> bool {
        self.tlsdesc_idx(id) >= 0
    }

    // ---- addresses ----

    pub fn chunk_addr(&self, id: Option<ChunkId>) -> u64 {
        id.map(|c| self.chunk(c).shdr.sh_addr).unwrap_or(0)
    }

    pub fn isec_addr(&self, r: SectionRef) -> u64 {
        let isec = self.isec(r);
        match isec.osec {
            Some(osec) => self.chunk(osec).shdr.sh_addr + isec.offset,
            None => 0,
        }
    }

    pub fn frag_addr(&self, r: FragRef) -> u64 {
        let msec = &self.merged[r.msec as usize];
        let base = msec
            .chunk
            .map(|c| self.chunk(c).shdr.sh_addr)
            .unwrap_or(0);
        base + msec.frags[r.frag as usize].offset
    }

    /// The address a reference to this symbol resolves to. Depending on
    /// the symbol's state this is its own location, a copy-relocated
    /// location, a (canonical) PLT entry, or an ICF leader's location.
    pub fn get_addr(&self, id: SymbolId, flags: u8) -> u64 {
        let sym = self.sym(id);

        if let Some(frag) = sym.fragment() {
            let msec = &self.merged[frag.msec as usize];
            if !msec.frags[frag.frag as usize]
                .is_alive
                .load(Ordering::Relaxed)
            {
                return 0;
            }
            return self.frag_addr(frag) + sym.value;
        }

        if sym.has_copyrel {
            let chunk = if sym.is_copyrel_readonly {
                self.refs.copyrel_relro
            } else {
                self.refs.copyrel
            };
            return self.chunk_addr(chunk) + sym.value;
        }

        if flags & NO_PLT == 0 && self.has_plt(id) && (sym.is_imported || sym.is_ifunc()) {
            return self.plt_addr(id);
        }

        match sym.origin {
            crate::symbol::SymbolOrigin::Absolute => sym.value,
            crate::symbol::SymbolOrigin::Chunk(c) => self.chunk(c).shdr.sh_addr + sym.value,
            crate::symbol::SymbolOrigin::Fragment(_) => 0,
            crate::symbol::SymbolOrigin::Section(r) => {
                let isec = self.isec(r);
                if !isec.is_alive() {
                    if let Some(leader) = isec.leader {
                        if leader != r {
                            return self.isec_addr(leader) + sym.value;
                        }
                    }
                    if isec.name == ".eh_frame" {
                        // CRT files carry begin/end markers into .eh_frame,
                        // which we rebuilt from records.
                        let base = self.chunk_addr(self.refs.eh_frame);
                        let size = self
                            .refs
                            .eh_frame
                            .map(|c| self.chunk(c).shdr.sh_size)
                            .unwrap_or(0);
                        let name = &sym.name;
                        if name.starts_with("__FRAME_END__")
                            || name.starts_with("__EH_FRAME_LIST_END__")
                        {
                            return base + size;
                        }
                        return base;
                    }
                    return 0;
                }
                self.isec_addr(r) + sym.value
            }
        }
    }

    pub fn got_addr(&self, id: SymbolId) -> u64 {
        self.chunk_addr(self.refs.got) + self.got_idx(id) as u64 * self.word_size()
    }

    pub fn gottp_addr(&self, id: SymbolId) -> u64 {
        self.chunk_addr(self.refs.got) + self.gottp_idx(id) as u64 * self.word_size()
    }

    pub fn tlsgd_addr(&self, id: SymbolId) -> u64 {
        self.chunk_addr(self.refs.got) + self.tlsgd_idx(id) as u64 * self.word_size()
    }

    pub fn tlsdesc_addr(&self, id: SymbolId) -> u64 {
        self.chunk_addr(self.refs.got) + self.tlsdesc_idx(id) as u64 * self.word_size()
    }

    pub fn tlsld_addr(&self) -> u64 {
        self.chunk_addr(self.refs.got) + self.tlsld_idx.max(0) as u64 * self.word_size()
    }

    pub fn gotplt_hdr_size(&self) -> u64 {
        3 * self.word_size()
    }

    pub fn gotplt_addr(&self, id: SymbolId) -> u64 {
        self.chunk_addr(self.refs.gotplt)
            + self.gotplt_hdr_size()
            + self.plt_idx(id) as u64 * self.word_size()
    }

    pub fn plt_addr(&self, id: SymbolId) -> u64 {
        let info = self.target.info();
        let idx = self.plt_idx(id);
        if idx >= 0 {
            return self.chunk_addr(self.refs.plt) + info.plt_hdr_size + idx as u64 * info.plt_size;
        }
        self.chunk_addr(self.refs.pltgot) + self.pltgot_idx(id) as u64 * info.pltgot_size
    }

    /// The nearest thunk for `id` reachable from address `p`
    pub fn thunk_addr(&self, id: SymbolId, p: u64) -> Option<u64> {
        let addrs = self.thunk_addrs.get(&id)?;
        let reach = self.target.info().branch_reach as i64;
        let idx = addrs.partition_point(|&a| a < p);
        let mut best: Option<u64> = None;
        for &cand in addrs[idx.saturating_sub(1)..].iter().take(2) {
            let dist = (cand as i64 - p as i64).abs();
            if dist < reach && best.map(|b| (b as i64 - p as i64).abs() > dist).unwrap_or(true) {
                best = Some(cand);
            }
        }
        best
    }

    // ---- predicates ----

    pub fn is_local(&self, id: SymbolId) -> bool {
        let sym = self.sym(id);
        !sym.is_imported && !sym.is_exported
    }

    /// An ifunc in a position-dependent executable uses two GOT slots and
    /// its PLT entry doubles as the canonical address
    pub fn is_pde_ifunc(&self, id: SymbolId) -> bool {
        self.sym(id).is_ifunc() && !self.options.pic()
    }

    /// True if the symbol's PC-relative address is a link-time constant
    pub fn is_pcrel_linktime_const(&self, id: SymbolId) -> bool {
        let sym = self.sym(id);
        !sym.is_imported && !sym.is_ifunc() && (sym.is_relative() || !self.options.pic())
    }

    /// True if the TP-relative offset is known at link time
    pub fn is_tprel_linktime_const(&self, id: SymbolId) -> bool {
        let sym = self.sym(id);
        sym.st_type() == STT_TLS && !self.options.shared && !sym.is_imported
    }

    /// True if the TP-relative offset is fixed no later than load time
    pub fn is_tprel_runtime_const(&self, id: SymbolId) -> bool {
        let sym = self.sym(id);
        sym.st_type() == STT_TLS && !(self.options.shared && self.options.z_dlopen)
    }

    // ---- relocation helpers ----

    /// Resolve a relocation against a section symbol of a mergeable
    /// section to (fragment, addend)
    pub fn get_fragment(&self, fid: u32, rel: &Rel, addend: i64) -> Option<(FragRef, i64)> {
        let file = &self.objs[fid as usize];
        let esym = file.elf_syms.get(rel.r_sym as usize)?;
        if esym.ty() != STT_SECTION {
            return None;
        }
        let m = file.mergeable.get(esym.st_shndx as usize)?.as_ref()?;
        let offset = esym.st_value.wrapping_add(addend as u64);
        let (piece, piece_off) = m.piece_at(offset)?;
        Some((m.fragments[piece], piece_off as i64))
    }

    /// The sentinel written into a debug section that refers to a dead
    /// section. 1 for `.debug_loc`/`.debug_ranges` (0 terminates lists
    /// there), 0 elsewhere; `.debug_line` references into ICF-folded code
    /// keep their real (leader) value.
    pub fn get_tombstone(
        &self,
        referer_name: &str,
        sym_id: SymbolId,
        frag: Option<FragRef>,
    ) -> Option<u64> {
        if let Some(frag) = frag {
            let alive = self.merged[frag.msec as usize].frags[frag.frag as usize]
                .is_alive
                .load(Ordering::Relaxed);
            return if alive { None } else { Some(0) };
        }
        let sym = self.sym(sym_id);
        let isec_ref = sym.input_section()?;
        let isec = self.isec(isec_ref);
        if isec.is_alive() {
            return None;
        }
        if isec.icf_removed(isec_ref) && referer_name == ".debug_line" {
            return None;
        }
        if referer_name == ".debug_loc" || referer_name == ".debug_ranges" {
            Some(1)
        } else {
            Some(0)
        }
    }

    pub fn push_chunk(&mut self, chunk: Chunk) -> ChunkId {
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(chunk);
        id
    }
}
