//! Output chunks
//!
//! A [`Chunk`] is any contiguous byte region of the output file: the file
//! headers, a synthetic table, an aggregation of input sections, or a
//! merged string pool. Layout assigns every chunk a disjoint file-offset
//! range, which is what makes the final emission embarrassingly parallel.

use std::collections::HashMap;

use crate::elf::Shdr;
use crate::symbol::{SectionRef, SymbolId};

pub mod dynamic;
pub mod dynsym;
pub mod ehframe;
pub mod got;
pub mod notes;
pub mod osec;
pub mod relocatable;
pub mod symtab;
pub mod versions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a word-size absolute relocation is realized at output time
pub enum AbsRelKind {
    /// Link-time constant; write the value and nothing else
    None,
    /// Needs an `R_*_RELATIVE` dynamic relocation
    Baserel,
    /// As `Baserel`, but packed into `.relr.dyn`
    Relr,
    /// Needs an `R_*_IRELATIVE`
    Ifunc,
    /// Needs a symbolic dynamic relocation against the dynsym index
    Dynrel,
}

#[derive(Debug, Clone, Copy)]
/// A word-size absolute relocation gathered per output section
pub struct AbsRel {
    pub isec: SectionRef,
    pub offset: u64,
    pub sym: SymbolId,
    pub addend: i64,
    /// Resolved (fragment, in-fragment offset) when the relocation goes
    /// through a section symbol of a mergeable section
    pub frag: Option<(crate::symbol::FragRef, i64)>,
    pub kind: AbsRelKind,
}

#[derive(Debug)]
/// A range-extension thunk island inside an output section
pub struct Thunk {
    /// Offset of the island within the output section
    pub offset: u64,
    pub symbols: Vec<SymbolId>,
}

#[derive(Debug, Default)]
/// An output section aggregating input sections
pub struct OutputSectionData {
    pub members: Vec<SectionRef>,
    pub abs_rels: Vec<AbsRel>,
    pub thunks: Vec<Thunk>,
}

#[derive(Debug, Default)]
/// A deduplicating string pool (`.dynstr`, `.strtab`, `.shstrtab`)
pub struct StrPool {
    data: Vec<u8>,
    map: HashMap<String, u64>,
}

impl StrPool {
    pub fn new() -> Self {
        StrPool {
            data: vec![0],
            map: HashMap::new(),
        }
    }

    pub fn add(&mut self, s: &str) -> u64 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&off) = self.map.get(s) {
            return off;
        }
        let off = self.data.len() as u64;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.map.insert(s.to_owned(), off);
        off
    }

    pub fn find(&self, s: &str) -> u64 {
        if s.is_empty() {
            return 0;
        }
        self.map.get(s).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
/// What a chunk is, beyond its header
pub enum ChunkKind {
    /// ELF header
    Ehdr,
    /// Program header table
    Phdr,
    /// Section header table
    Shdr,
    Interp,
    OutputSection(OutputSectionData),
    /// Index into `Context::merged`
    Merged(u32),
    Got,
    GotPlt,
    Plt,
    PltGot,
    RelPlt,
    RelDyn,
    RelrDyn,
    Dynsym,
    Dynstr(StrPool),
    Dynamic,
    Hash,
    GnuHash,
    Versym(Vec<u16>),
    Verneed(Vec<u8>),
    Verdef(Vec<u8>),
    Copyrel,
    EhFrame,
    EhFrameHdr,
    NoteBuildId,
    NoteProperty { features: u32, isa: u32 },
    NotePackage,
    Symtab,
    Strtab(StrPool),
    Shstrtab(StrPool),
    /// Pads `PT_GNU_RELRO` out to a page boundary
    RelroPadding,
    /// `-r`/`--emit-relocs`: the rewritten relocation table of one output
    /// section (the `ChunkId` of the section it describes)
    RelocSec(u32),
    /// `-r`: re-emitted comdat group table
    ComdatGroups(Vec<(SymbolId, Vec<u32>)>),
}

#[derive(Debug)]
/// One contiguous region of the output file
pub struct Chunk {
    pub name: String,
    pub shdr: Shdr,
    /// Section header index after layout; 0 while unassigned
    pub shndx: u32,
    pub is_relro: bool,
    /// Byte offset of this chunk's entries within `.rel.dyn`
    pub reldyn_offset: u64,
    /// Packed base relocations destined for `.relr.dyn`
    pub relr: Vec<u64>,
    pub kind: ChunkKind,

    // Synthetic local symbols this chunk contributes to .symtab
    pub local_symtab_idx: usize,
    pub num_local_symtab: usize,
    pub strtab_size: usize,
    pub strtab_offset: usize,
}

impl Chunk {
    pub fn new(name: impl Into<String>, kind: ChunkKind) -> Chunk {
        Chunk {
            name: name.into(),
            shdr: Shdr {
                sh_addralign: 1,
                ..Shdr::default()
            },
            shndx: 0,
            is_relro: false,
            reldyn_offset: 0,
            relr: Vec::new(),
            kind,
            local_symtab_idx: 0,
            num_local_symtab: 0,
            strtab_size: 0,
            strtab_offset: 0,
        }
    }

    /// Header chunks occupy file space but get no section header entry
    pub fn is_header(&self) -> bool {
        matches!(self.kind, ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr)
    }

    pub fn flags(&self) -> u64 {
        self.shdr.sh_flags
    }

    pub fn osec_data(&self) -> Option<&OutputSectionData> {
        match &self.kind {
            ChunkKind::OutputSection(data) => Some(data),
            _ => None,
        }
    }

    pub fn osec_data_mut(&mut self) -> Option<&mut OutputSectionData> {
        match &mut self.kind {
            ChunkKind::OutputSection(data) => Some(data),
            _ => None,
        }
    }
}

/// Encode base-relocation offsets into the packed RELR form: a start
/// address followed by bitmap words covering the next 63 (or 31) word-size
/// slots, distinguished by the least significant bit.
pub fn encode_relr(positions: &[u64], word_size: u64) -> Vec<u64> {
    let num_bits = word_size * 8 - 1;
    let max_delta = word_size * num_bits;
    let mut vec = Vec::new();
    let mut i = 0usize;

    while i < positions.len() {
        vec.push(positions[i]);
        let mut base = positions[i] + word_size;
        i += 1;

        loop {
            let mut bits: u64 = 0;
            while i < positions.len() && positions[i] - base < max_delta {
                bits |= 1u64 << ((positions[i] - base) / word_size);
                i += 1;
            }
            if bits == 0 {
                break;
            }
            vec.push((bits << 1) | 1);
            base += max_delta;
        }
    }
    vec
}

/// Expand packed RELR words back to offsets (the inverse of
/// [`encode_relr`]; used by tests and by `-r` passthrough checks)
pub fn decode_relr(words: &[u64], word_size: u64) -> Vec<u64> {
    let num_bits = word_size * 8 - 1;
    let mut out = Vec::new();
    let mut base = 0u64;
    for &w in words {
        if w & 1 == 0 {
            out.push(w);
            base = w + word_size;
        } else {
            let mut bits = w >> 1;
            let mut off = base;
            while bits != 0 {
                if bits & 1 != 0 {
                    out.push(off);
                }
                bits >>= 1;
                off += word_size;
            }
            base += word_size * num_bits;
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_strpool_dedups() {
        let mut pool = StrPool::new();
        let a = pool.add("libc.so.6");
        let b = pool.add("libm.so.6");
        let c = pool.add("libc.so.6");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.find("libm.so.6"), b);
        assert_eq!(pool.bytes()[0], 0);
    }

    #[test]
    fn test_relr_roundtrip() {
        // 1000 consecutive pointer slots: one start word plus ceil(999/63)
        // bitmap words.
        let positions: Vec<u64> = (0..1000u64).map(|i| 0x1000 + i * 8).collect();
        let packed = encode_relr(&positions, 8);
        assert_eq!(packed.len(), 1 + 999usize.div_ceil(63));
        assert_eq!(decode_relr(&packed, 8), positions);
    }

    #[test]
    fn test_relr_sparse_and_32bit() {
        let positions = vec![0x100, 0x108, 0x200000, 0x200010];
        let packed = encode_relr(&positions, 8);
        assert_eq!(decode_relr(&packed, 8), positions);

        let positions32 = vec![0x10, 0x14, 0x90];
        let packed32 = encode_relr(&positions32, 4);
        assert_eq!(decode_relr(&packed32, 4), positions32);
    }
}
