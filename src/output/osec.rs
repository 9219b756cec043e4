//! Binning input sections into output sections

use crate::context::Context;
use crate::elf::{
    Shdr, SHF_ALLOC, SHF_COMPRESSED, SHF_EXECINSTR, SHF_GROUP, SHF_LINK_ORDER, SHF_MERGE,
    SHF_TLS, SHF_WRITE, SHT_ARM_EXIDX, SHT_NOBITS, SHT_PROGBITS,
};
use crate::output::{Chunk, ChunkKind, OutputSectionData};
use crate::symbol::{ChunkId, SectionRef};

/// Prefixes whose suffixed variants (`.text.foo`) collapse into the base
/// output section. `.text.hot` and friends are kept separate by keeping
/// the longest matching prefix.
static PREFIXES: &[&str] = &[
    ".text.",
    ".data.rel.ro.",
    ".data.",
    ".rodata.",
    ".bss.rel.ro.",
    ".bss.",
    ".init_array.",
    ".fini_array.",
    ".tbss.",
    ".tdata.",
    ".gcc_except_table.",
    ".ctors.",
    ".dtors.",
    ".gnu.warning.",
    ".openbsd.randomdata.",
];

/// The name of the output section an input section lands in
pub fn output_name(name: &str) -> &str {
    for prefix in PREFIXES {
        let base = &prefix[..prefix.len() - 1];
        if name == base || name.starts_with(prefix) {
            return base;
        }
    }
    name
}

/// Flags that propagate from input sections to their output section
fn output_flags(sh_flags: u64) -> u64 {
    sh_flags & !SHF_GROUP & !SHF_COMPRESSED & !SHF_LINK_ORDER & !crate::elf::SHF_GNU_RETAIN
}

/// Stage 5½: create one `OutputSection` chunk per (name, type, flags)
/// class of live input sections, plus a chunk per merged section, and
/// point every input section at its home.
pub fn bin_sections(cx: &mut Context) {
    let mut refs: Vec<(SectionRef, String, u32, u64, bool)> = Vec::new();
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for isec in cx.objs[f].sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            let name = output_name(&isec.name).to_string();
            let sh_type = if isec.shdr.sh_type == SHT_NOBITS {
                SHT_NOBITS
            } else if isec.shdr.sh_type == SHT_ARM_EXIDX {
                SHT_ARM_EXIDX
            } else if isec.shdr.sh_flags & SHF_MERGE != 0 {
                isec.shdr.sh_type
            } else {
                // Everything else degrades to PROGBITS except the array
                // types, which the loader distinguishes.
                match isec.shdr.sh_type {
                    crate::elf::SHT_INIT_ARRAY
                    | crate::elf::SHT_FINI_ARRAY
                    | crate::elf::SHT_PREINIT_ARRAY
                    | crate::elf::SHT_NOTE => isec.shdr.sh_type,
                    _ => SHT_PROGBITS,
                }
            };
            let relro = is_relro(&name, sh_type, isec.shdr.sh_flags);
            refs.push((
                SectionRef {
                    file: f as u32,
                    shndx: isec.shndx,
                },
                name,
                sh_type,
                output_flags(isec.shdr.sh_flags),
                relro,
            ));
        }
    }

    // Deterministic assignment: the first file to contribute decides the
    // member order within each output section.
    for (r, name, sh_type, sh_flags, relro) in refs {
        let chunk_id = find_or_create_osec(cx, &name, sh_type, sh_flags, relro);
        {
            let chunk = cx.chunk_mut(chunk_id);
            chunk.shdr.sh_flags |= sh_flags;
            if let ChunkKind::OutputSection(data) = &mut chunk.kind {
                data.members.push(r);
            }
        }
        if let Some(isec) = cx.objs[r.file as usize].sections[r.shndx as usize].as_mut() {
            isec.osec = Some(chunk_id);
        }
    }

    // Merged sections become chunks of their own.
    for m in 0..cx.merged.len() {
        if cx.merged[m].chunk.is_some() {
            continue;
        }
        let (name, sh_flags, sh_type, entsize) = {
            let msec = &cx.merged[m];
            (msec.name.clone(), msec.sh_flags, msec.sh_type, msec.entsize)
        };
        let mut chunk = Chunk::new(name.clone(), ChunkKind::Merged(m as u32));
        chunk.shdr = Shdr {
            sh_type,
            sh_flags: output_flags(sh_flags),
            sh_entsize: entsize,
            sh_addralign: 1,
            ..Shdr::default()
        };
        chunk.is_relro = is_relro(&name, sh_type, sh_flags);
        let id = cx.push_chunk(chunk);
        cx.merged[m].chunk = Some(id);
    }
}

/// RELRO covers sections that the loader can remap read-only once
/// relocation is done.
pub fn is_relro(name: &str, sh_type: u32, sh_flags: u64) -> bool {
    if sh_flags & SHF_WRITE == 0 {
        return false;
    }
    sh_flags & SHF_TLS != 0
        || sh_type == crate::elf::SHT_INIT_ARRAY
        || sh_type == crate::elf::SHT_FINI_ARRAY
        || sh_type == crate::elf::SHT_PREINIT_ARRAY
        || name == ".data.rel.ro"
        || name.starts_with(".data.rel.ro.")
        || name == ".ctors"
        || name == ".dtors"
        || name == ".toc"
        || name.ends_with(".rel.ro")
}

fn find_or_create_osec(
    cx: &mut Context,
    name: &str,
    sh_type: u32,
    sh_flags: u64,
    relro: bool,
) -> ChunkId {
    let key_flags = sh_flags & (SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR | SHF_TLS);
    for (i, chunk) in cx.chunks.iter().enumerate() {
        if let ChunkKind::OutputSection(_) = chunk.kind {
            if chunk.name == name
                && chunk.shdr.sh_type == sh_type
                && chunk.shdr.sh_flags & (SHF_ALLOC | SHF_WRITE | SHF_EXECINSTR | SHF_TLS)
                    == key_flags
            {
                return ChunkId(i as u32);
            }
        }
    }
    let mut chunk = Chunk::new(name, ChunkKind::OutputSection(OutputSectionData::default()));
    chunk.shdr.sh_type = sh_type;
    chunk.shdr.sh_flags = sh_flags;
    chunk.is_relro = relro;
    cx.push_chunk(chunk)
}

/// Assign member offsets within every output section and set its size
/// and alignment. Thunk islands claimed their offsets beforehand.
pub fn compute_section_sizes(cx: &mut Context) {
    for c in 0..cx.chunks.len() {
        let ChunkKind::OutputSection(_) = cx.chunks[c].kind else {
            continue;
        };
        let members = match cx.chunks[c].osec_data() {
            Some(data) => data.members.clone(),
            None => continue,
        };

        let mut offset = 0u64;
        let mut align = cx.chunks[c].shdr.sh_addralign.max(1);
        let mut assignments = Vec::with_capacity(members.len());
        for r in &members {
            let isec = cx.isec(*r);
            let a = 1u64 << isec.p2align;
            offset = (offset + a - 1) & !(a - 1);
            assignments.push(offset);
            offset += isec.sh_size();
            align = align.max(a);
        }

        // ARM's exception index table gets a trailing CANTUNWIND sentinel.
        if cx.chunks[c].shdr.sh_type == SHT_ARM_EXIDX {
            offset += 8;
        }

        for (r, off) in members.iter().zip(assignments) {
            if let Some(isec) = cx.objs[r.file as usize].sections[r.shndx as usize].as_mut() {
                isec.offset = off;
            }
        }
        let chunk = &mut cx.chunks[c];
        chunk.shdr.sh_size = chunk.shdr.sh_size.max(offset);
        chunk.shdr.sh_addralign = align;
    }

    for m in 0..cx.merged.len() {
        let (size, align) = cx.merged[m].assign_offsets();
        if let Some(chunk_id) = cx.merged[m].chunk {
            let chunk = cx.chunk_mut(chunk_id);
            chunk.shdr.sh_size = size;
            chunk.shdr.sh_addralign = align.max(1);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_output_names() {
        assert_eq!(output_name(".text.startup.main"), ".text");
        assert_eq!(output_name(".text"), ".text");
        assert_eq!(output_name(".data.rel.ro.local"), ".data.rel.ro");
        assert_eq!(output_name(".data.foo"), ".data");
        assert_eq!(output_name(".mysection"), ".mysection");
        assert_eq!(output_name(".tbss.var"), ".tbss");
    }

    #[test]
    fn test_relro_classes() {
        use crate::elf::{SHT_INIT_ARRAY, SHT_PROGBITS};
        assert!(is_relro(
            ".data.rel.ro",
            SHT_PROGBITS,
            SHF_ALLOC | SHF_WRITE
        ));
        assert!(is_relro(
            ".init_array",
            SHT_INIT_ARRAY,
            SHF_ALLOC | SHF_WRITE
        ));
        assert!(!is_relro(".data", SHT_PROGBITS, SHF_ALLOC | SHF_WRITE));
        assert!(!is_relro(".rodata", SHT_PROGBITS, SHF_ALLOC));
    }
}
