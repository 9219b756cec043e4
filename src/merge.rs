//! Mergeable section deduplication
//!
//! Every `SHF_MERGE` input section was split into pieces at parse time.
//! Pieces with identical bytes collapse into one [`SectionFragment`] of the
//! output [`MergedSection`]; stage 5 assigns each surviving fragment its
//! in-section offset.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::Context;
use crate::elf::{SHF_COMPRESSED, SHF_GROUP, SHF_STRINGS};
use crate::hash::HyperLogLog;
use crate::symbol::{ChunkId, FragRef};

#[derive(Debug)]
/// One deduplicated piece of a merged section
pub struct SectionFragment {
    /// Offset within the merged section, assigned in stage 5
    pub offset: u64,
    pub p2align: u8,
    pub is_alive: AtomicBool,
    /// Hint that a 32-bit-wide relocation refers to this fragment; such
    /// fragments are packed first so small-model code can reach them
    pub is_32bit: AtomicBool,
}

#[derive(Debug)]
/// An output section that aggregates deduplicated fragments
pub struct MergedSection {
    pub name: String,
    pub sh_flags: u64,
    pub sh_type: u32,
    pub entsize: u64,
    /// The chunk this merged section became
    pub chunk: Option<ChunkId>,
    map: HashMap<Vec<u8>, u32>,
    pub frags: Vec<SectionFragment>,
    pub frag_contents: Vec<Vec<u8>>,
    pub estimator: HyperLogLog,
}

impl MergedSection {
    pub fn new(name: String, sh_flags: u64, sh_type: u32, entsize: u64) -> Self {
        MergedSection {
            name,
            sh_flags: sh_flags & !SHF_GROUP & !SHF_COMPRESSED,
            sh_type,
            entsize,
            chunk: None,
            map: HashMap::new(),
            frags: Vec::new(),
            frag_contents: Vec::new(),
            estimator: HyperLogLog::new(),
        }
    }

    /// Deduplicating insert. Alignment requirements accumulate: the
    /// fragment keeps the strictest alignment any inserter asked for.
    pub fn insert(&mut self, content: &[u8], hash: u64, p2align: u8, alive: bool) -> u32 {
        self.estimator.insert(hash);
        if self.map.capacity() == 0 {
            let hint = self.estimator.estimate();
            self.map.reserve(hint.max(16));
        }
        match self.map.get(content) {
            Some(&idx) => {
                if self.frags[idx as usize].p2align < p2align {
                    // Alignment only grows; a plain store is fine here.
                    self.frags[idx as usize].p2align = p2align;
                }
                if alive {
                    self.frags[idx as usize].is_alive.store(true, Ordering::Relaxed);
                }
                idx
            }
            None => {
                let idx = self.frags.len() as u32;
                self.frags.push(SectionFragment {
                    offset: 0,
                    p2align,
                    is_alive: AtomicBool::new(alive),
                    is_32bit: AtomicBool::new(false),
                });
                self.frag_contents.push(content.to_vec());
                self.map.insert(content.to_vec(), idx);
                idx
            }
        }
    }

    /// Assign offsets to alive fragments. Ordering is deterministic:
    /// 32-bit-hinted first, then stricter alignment, then content bytes.
    /// Returns (section size, section alignment).
    pub fn assign_offsets(&mut self) -> (u64, u64) {
        let mut order: Vec<u32> = (0..self.frags.len() as u32)
            .filter(|&i| self.frags[i as usize].is_alive.load(Ordering::Relaxed))
            .collect();
        order.sort_by(|&a, &b| {
            let fa = &self.frags[a as usize];
            let fb = &self.frags[b as usize];
            fb.is_32bit
                .load(Ordering::Relaxed)
                .cmp(&fa.is_32bit.load(Ordering::Relaxed))
                .then(fb.p2align.cmp(&fa.p2align))
                .then_with(|| self.frag_contents[a as usize].cmp(&self.frag_contents[b as usize]))
        });

        let mut offset = 0u64;
        let mut align = 1u64;
        for idx in order {
            let frag = &mut self.frags[idx as usize];
            let a = 1u64 << frag.p2align;
            offset = (offset + a - 1) & !(a - 1);
            frag.offset = offset;
            offset += self.frag_contents[idx as usize].len() as u64;
            align = align.max(a);
        }
        (offset, align)
    }
}

/// The output-section name a mergeable input section lands in. Compilers
/// append symbol names to `.rodata.str*`/`.rodata.cst*` section names; the
/// symbol part is dropped so equal pools merge across files.
pub fn merged_output_name(name: &str, sh_flags: u64, entsize: u64, addralign: u64) -> String {
    if let Some(rest) = name.strip_prefix(".rodata.") {
        if sh_flags & SHF_STRINGS != 0 {
            let canonical = format!("str{entsize}.{addralign}");
            if rest != canonical {
                return format!(".rodata.str{entsize}.{addralign}");
            }
        } else {
            let canonical = format!("cst{entsize}");
            if rest != canonical {
                return format!(".rodata.cst{entsize}");
            }
        }
    }
    name.to_string()
}

/// Find or create the `MergedSection` for each parsed mergeable input
/// section and point the input at it.
pub fn create_merged_sections(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        for s in 0..cx.objs[f].mergeable.len() {
            if cx.objs[f].mergeable[s].is_none() {
                continue;
            }
            let (name, flags, ty, entsize) = {
                let file = &cx.objs[f];
                let Some(isec) = file.sections[s].as_ref() else {
                    continue;
                };
                let shdr = isec.shdr;
                let entsize = if shdr.sh_entsize != 0 {
                    shdr.sh_entsize
                } else if shdr.sh_flags & SHF_STRINGS != 0 {
                    1
                } else {
                    shdr.sh_addralign
                };
                (
                    merged_output_name(
                        &isec.name,
                        shdr.sh_flags,
                        entsize,
                        shdr.sh_addralign.max(1),
                    ),
                    shdr.sh_flags & !SHF_GROUP & !SHF_COMPRESSED,
                    shdr.sh_type,
                    entsize,
                )
            };
            let msec = find_or_create(cx, name, flags, ty, entsize);
            if let Some(m) = cx.objs[f].mergeable[s].as_mut() {
                m.msec = msec;
            }
        }
    }
}

pub fn find_or_create(
    cx: &mut Context,
    name: String,
    sh_flags: u64,
    sh_type: u32,
    entsize: u64,
) -> u32 {
    let flags = sh_flags & !SHF_GROUP & !SHF_COMPRESSED;
    for (i, m) in cx.merged.iter().enumerate() {
        if m.name == name && m.sh_flags == flags && m.sh_type == sh_type && m.entsize == entsize {
            return i as u32;
        }
    }
    cx.merged
        .push(MergedSection::new(name, flags, sh_type, entsize));
    (cx.merged.len() - 1) as u32
}

/// Feed every piece of every mergeable input section into its merged
/// section. Fragment liveness starts out false only under `--gc-sections`;
/// the mark pass revives referenced ones.
pub fn register_fragments(cx: &mut Context) {
    let alive = !cx.options.gc_sections;
    let Context { objs, merged, .. } = cx;
    for file in objs.iter_mut() {
        if !file.is_alive {
            continue;
        }
        for m in file.mergeable.iter_mut().flatten() {
            let msec = &mut merged[m.msec as usize];
            let data = &file.data[m.contents.clone()];
            m.fragments = Vec::with_capacity(m.piece_offsets.len());
            for (i, &start) in m.piece_offsets.iter().enumerate() {
                let end = m
                    .piece_offsets
                    .get(i + 1)
                    .map(|&e| e as usize)
                    .unwrap_or(data.len());
                let frag =
                    msec.insert(&data[start as usize..end], m.piece_hashes[i], m.p2align, alive);
                m.fragments.push(FragRef {
                    msec: m.msec,
                    frag,
                });
            }
        }
    }
}

/// Re-point symbols that address into a mergeable input section at the
/// deduplicated fragment. Runs once fragments exist; symbol values become
/// offsets within their fragment.
pub fn fix_mergeable_origins(cx: &mut Context) {
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for i in 0..cx.objs[f].elf_syms.len() {
            let id = cx.objs[f].symbols[i];
            {
                let sym = &cx.symbols[id.0 as usize];
                let owner_here = sym.file == Some(crate::symbol::FileId::Obj(f as u32))
                    && sym.sym_idx as usize == i;
                if !owner_here {
                    continue;
                }
            }
            let esym = cx.objs[f].elf_syms[i];
            let Some(Some(m)) = cx.objs[f].mergeable.get(esym.st_shndx as usize) else {
                continue;
            };
            let Some((piece, off)) = m.piece_at(esym.st_value) else {
                continue;
            };
            let Some(&frag) = m.fragments.get(piece) else {
                continue;
            };
            let sym = &mut cx.symbols[id.0 as usize];
            sym.origin = crate::symbol::SymbolOrigin::Fragment(frag);
            sym.value = off;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::elf::{SHF_ALLOC, SHF_MERGE, SHT_PROGBITS};
    use crate::hash::hash_bytes;

    #[test]
    fn test_insert_dedups_and_accumulates_alignment() {
        let mut m = MergedSection::new(
            ".rodata.str1.1".into(),
            SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
            SHT_PROGBITS,
            1,
        );
        let a = m.insert(b"hi\0", hash_bytes(b"hi\0"), 0, true);
        let b = m.insert(b"hi\0", hash_bytes(b"hi\0"), 2, true);
        let c = m.insert(b"world\0", hash_bytes(b"world\0"), 0, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.frags[a as usize].p2align, 2);
    }

    #[test]
    fn test_offsets_are_aligned_and_disjoint() {
        let mut m = MergedSection::new(".rodata.cst8".into(), SHF_ALLOC | SHF_MERGE, SHT_PROGBITS, 8);
        for i in 0..10u64 {
            let bytes = i.to_le_bytes();
            m.insert(&bytes, hash_bytes(&bytes), 3, true);
        }
        let (size, align) = m.assign_offsets();
        assert_eq!(size, 80);
        assert_eq!(align, 8);
        let mut offsets: Vec<u64> = m.frags.iter().map(|f| f.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        assert_eq!(offsets.len(), 10);
        assert!(m.frags.iter().all(|f| f.offset % 8 == 0));
    }

    #[test]
    fn test_rodata_names_are_canonicalized() {
        assert_eq!(
            merged_output_name(".rodata.str1.1._Zfoo", SHF_STRINGS, 1, 1),
            ".rodata.str1.1"
        );
        assert_eq!(
            merged_output_name(".rodata.cst16.bar", 0, 16, 16),
            ".rodata.cst16"
        );
        assert_eq!(merged_output_name(".comment", SHF_STRINGS, 1, 1), ".comment");
        assert_eq!(
            merged_output_name(".rodata.str1.1", SHF_STRINGS, 1, 1),
            ".rodata.str1.1"
        );
    }
}
