//! The global symbol model
//!
//! One [`Symbol`] exists per unique name (plus one per local symbol table
//! entry). Cross-references use index handles rather than pointers; the
//! resolver establishes `origin` once and nothing mutates it afterwards.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::elf::{STT_FUNC, STT_GNU_IFUNC, STV_DEFAULT, VER_NDX_UNSPECIFIED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index into the process-wide symbol vector
pub struct SymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle to an input file
pub enum FileId {
    /// Relocatable object, index into `Context::objs`
    Obj(u32),
    /// Shared object, index into `Context::dsos`
    Dso(u32),
}

impl FileId {
    pub fn is_dso(&self) -> bool {
        matches!(self, FileId::Dso(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle to an input section: (object file index, section header index)
pub struct SectionRef {
    pub file: u32,
    pub shndx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle to a deduplicated fragment: (merged section index, fragment index)
pub struct FragRef {
    pub msec: u32,
    pub frag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index into the output chunk list
pub struct ChunkId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What a symbol's value is measured against. Exactly one of these holds
/// for any resolved symbol.
pub enum SymbolOrigin {
    /// `value` is the address itself
    #[default]
    Absolute,
    /// `value` is an offset into an input section
    Section(SectionRef),
    /// `value` is an offset into an output chunk (linker-defined symbols)
    Chunk(ChunkId),
    /// `value` is an offset from a mergeable fragment
    Fragment(FragRef),
}

pub const NEEDS_GOT: u8 = 1 << 0;
pub const NEEDS_PLT: u8 = 1 << 1;
pub const NEEDS_CPLT: u8 = 1 << 2;
pub const NEEDS_GOTTP: u8 = 1 << 3;
pub const NEEDS_TLSGD: u8 = 1 << 4;
pub const NEEDS_COPYREL: u8 = 1 << 5;
pub const NEEDS_TLSDESC: u8 = 1 << 6;

/// A symbol. For each unique global name we create one instance; local
/// symbols get one instance per symbol-table slot. A symbol can have
/// several addresses at runtime (its own, a PLT entry, GOT slots); the
/// index slots for those live in [`SymbolAux`], allocated only when some
/// relocation asked for them.
#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    /// Owner after resolution; `None` means undefined
    pub file: Option<FileId>,
    /// Index into the owner's symbol table
    pub sym_idx: u32,
    pub origin: SymbolOrigin,
    pub value: u64,
    pub ver_idx: u16,
    pub visibility: u8,
    /// `NEEDS_*` bits, set concurrently during the relocation scan
    pub flags: AtomicU8,
    /// Index into `Context::symbol_aux`; `-1` if never allocated
    pub aux_idx: i32,

    pub is_weak: bool,
    pub is_imported: bool,
    pub is_exported: bool,
    pub is_canonical: bool,
    pub has_copyrel: bool,
    pub is_copyrel_readonly: bool,
    pub gc_root: bool,
    pub write_to_symtab: bool,
    pub referenced_by_regular_obj: bool,
    pub is_versioned_default: bool,
    pub is_wrapped: bool,
    pub is_traced: bool,
    /// Defined by the linker itself (`__ehdr_start` and friends); the
    /// value and origin are fixed during layout
    pub is_synthetic: bool,
    /// Cached `st_info`/`st_size` of the defining symbol table entry
    pub esym_info: u8,
    pub esym_size: u64,
    pub esym_is_undef: bool,
    pub esym_is_undef_weak: bool,
}

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Symbol {
            name: name.into(),
            file: None,
            sym_idx: 0,
            origin: SymbolOrigin::Absolute,
            value: 0,
            ver_idx: VER_NDX_UNSPECIFIED,
            visibility: STV_DEFAULT,
            flags: AtomicU8::new(0),
            aux_idx: -1,
            is_weak: false,
            is_imported: false,
            is_exported: false,
            is_canonical: false,
            has_copyrel: false,
            is_copyrel_readonly: false,
            gc_root: false,
            write_to_symtab: false,
            referenced_by_regular_obj: false,
            is_versioned_default: false,
            is_wrapped: false,
            is_traced: false,
            is_synthetic: false,
            esym_info: 0,
            esym_size: 0,
            esym_is_undef: true,
            esym_is_undef_weak: false,
        }
    }

    pub fn set_flags(&self, bits: u8) {
        self.flags.fetch_or(bits, Ordering::Relaxed);
    }

    pub fn get_flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn st_type(&self) -> u8 {
        // An ifunc defined in a DSO is seen by us as an ordinary function;
        // the resolver in that DSO is not ours to call.
        let ty = self.esym_info & 0xf;
        if ty == STT_GNU_IFUNC && self.file.map(|f| f.is_dso()).unwrap_or(false) {
            return STT_FUNC;
        }
        ty
    }

    pub fn is_ifunc(&self) -> bool {
        self.st_type() == STT_GNU_IFUNC
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self.origin, SymbolOrigin::Absolute) && !self.is_imported
    }

    pub fn is_relative(&self) -> bool {
        !self.is_absolute()
    }

    pub fn input_section(&self) -> Option<SectionRef> {
        match self.origin {
            SymbolOrigin::Section(isec) => Some(isec),
            _ => None,
        }
    }

    pub fn fragment(&self) -> Option<FragRef> {
        match self.origin {
            SymbolOrigin::Fragment(frag) => Some(frag),
            _ => None,
        }
    }

    /// A weak undefined that nothing provided: resolves to zero in an
    /// executable, becomes a dynamic symbol in a DSO.
    pub fn is_remaining_undef_weak(&self) -> bool {
        !self.is_imported && self.esym_is_undef_weak
    }
}

/// Per-symbol table indices into the synthetic chunks. Allocated lazily:
/// most symbols never touch the dynamic tables and pay only the `aux_idx`
/// field for them.
#[derive(Debug, Clone, Copy)]
pub struct SymbolAux {
    pub got_idx: i32,
    pub gottp_idx: i32,
    pub tlsgd_idx: i32,
    pub tlsdesc_idx: i32,
    pub plt_idx: i32,
    pub pltgot_idx: i32,
    pub dynsym_idx: i32,
    pub djb_hash: u32,
}

impl Default for SymbolAux {
    fn default() -> Self {
        SymbolAux {
            got_idx: -1,
            gottp_idx: -1,
            tlsgd_idx: -1,
            tlsdesc_idx: -1,
            plt_idx: -1,
            pltgot_idx: -1,
            dynsym_idx: -1,
            djb_hash: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_need_bits_accumulate() {
        let sym = Symbol::new("foo");
        sym.set_flags(NEEDS_GOT);
        sym.set_flags(NEEDS_PLT);
        assert_eq!(sym.get_flags(), NEEDS_GOT | NEEDS_PLT);
    }

    #[test]
    fn test_dso_ifunc_reads_as_func() {
        let mut sym = Symbol::new("resolver");
        sym.esym_info = STT_GNU_IFUNC;
        sym.file = Some(FileId::Dso(0));
        assert_eq!(sym.st_type(), STT_FUNC);
        sym.file = Some(FileId::Obj(0));
        assert_eq!(sym.st_type(), STT_GNU_IFUNC);
    }
}
