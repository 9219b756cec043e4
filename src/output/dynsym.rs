//! `.dynsym`, `.dynstr` and the two hash table flavors
//!
//! The dynamic symbol table is built in two halves: unexported symbols
//! first, then the exported ones sorted by GNU-hash bucket so the hash
//! section can address them as contiguous chains.

use crate::context::Context;
use crate::elf::{djb_hash, elf_hash, Sym};
use crate::options::HashStyle;
use crate::output::ChunkKind;
use crate::symbol::SymbolId;

pub const GNU_HASH_LOAD_FACTOR: usize = 8;
pub const GNU_HASH_HEADER_SIZE: usize = 16;
pub const GNU_HASH_BLOOM_SHIFT: u32 = 26;

fn gnu_hash_buckets(num_exported: usize) -> usize {
    num_exported / GNU_HASH_LOAD_FACTOR + 1
}

fn gnu_hash_bloom(num_exported: usize, word_bits: usize) -> usize {
    ((num_exported * 12) / word_bits).next_power_of_two().max(1)
}

/// Order `.dynsym`, assign indices and string offsets, and size the
/// dependent chunks. No symbol may be added afterwards.
pub fn finalize_dynsym(cx: &mut Context) {
    if cx.refs.dynsym.is_none() || cx.dynsym_syms.is_empty() {
        return;
    }
    let use_gnu = cx.options.hash_style != HashStyle::Sysv;

    let mut body: Vec<SymbolId> = cx.dynsym_syms[1..].to_vec();

    // A symbol participates in the GNU hash only if a lookup may find it
    // here, i.e. if we define and export it.
    let is_hashed = |cx: &Context, id: SymbolId| -> bool {
        let sym = cx.sym(id);
        sym.is_exported && !sym.esym_is_undef
    };

    let num_exported = body.iter().filter(|&&id| is_hashed(cx, id)).count();
    let num_buckets = gnu_hash_buckets(num_exported);

    body.sort_by_cached_key(|&id| {
        let sym = cx.sym(id);
        let hashed = is_hashed(cx, id);
        let hash = djb_hash(&sym.name);
        (
            hashed,
            if use_gnu && hashed {
                (hash as usize % num_buckets, hash)
            } else {
                (0, 0)
            },
            sym.file.map(|f| cx.file_priority(f)).unwrap_or(u32::MAX),
            sym.name.clone(),
        )
    });

    cx.num_exported_dynsyms = if use_gnu { num_exported } else { 0 };
    cx.dynsym_syms.truncate(1);
    cx.dynsym_syms.extend(body);

    // Assign indices, hashes and names.
    let ids: Vec<SymbolId> = cx.dynsym_syms[1..].to_vec();
    for (i, id) in ids.iter().enumerate() {
        let name = cx.sym(*id).name.clone();
        let hash = djb_hash(&name);
        if let Some(aux) = cx.aux_mut(*id) {
            aux.dynsym_idx = (i + 1) as i32;
            aux.djb_hash = hash;
        }
        if let Some(dynstr) = cx.refs.dynstr {
            if let ChunkKind::Dynstr(pool) = &mut cx.chunk_mut(dynstr).kind {
                pool.add(&name);
            }
        }
    }

    let nsyms = cx.dynsym_syms.len();
    let entsize = Sym::size(cx.enc.class) as u64;
    if let Some(dynsym) = cx.refs.dynsym {
        let chunk = cx.chunk_mut(dynsym);
        chunk.shdr.sh_size = nsyms as u64 * entsize;
        chunk.shdr.sh_info = 1;
    }

    let word = cx.word_size() as usize;
    if let Some(hash) = cx.refs.hash {
        if matches!(cx.options.hash_style, HashStyle::Sysv | HashStyle::Both) {
            let chunk = cx.chunk_mut(hash);
            chunk.shdr.sh_size = (2 + nsyms * 2) as u64 * 4;
        }
    }
    if let Some(gnu_hash) = cx.refs.gnu_hash {
        if use_gnu {
            let num_bloom = gnu_hash_bloom(num_exported.max(1), word * 8);
            let size = GNU_HASH_HEADER_SIZE + num_bloom * word + num_buckets * 4 + num_exported * 4;
            cx.chunk_mut(gnu_hash).shdr.sh_size = size as u64;
        }
    }
}

/// Write `.dynsym`
pub fn copy_dynsym(cx: &Context, out: &mut [u8]) {
    let Some(dynsym) = cx.refs.dynsym else { return };
    let chunk = cx.chunk(dynsym);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let enc = cx.enc;
    let base = chunk.shdr.sh_offset as usize;
    let entsize = Sym::size(enc.class);

    let dynstr = cx.refs.dynstr;
    for (i, &id) in cx.dynsym_syms.iter().enumerate() {
        if i == 0 {
            Sym::default().write_at(enc, out, base);
            continue;
        }
        let mut esym = crate::output::symtab::to_output_esym(cx, id);
        if let Some(dynstr) = dynstr {
            if let ChunkKind::Dynstr(pool) = &cx.chunk(dynstr).kind {
                esym.st_name = pool.find(&cx.sym(id).name) as u32;
            }
        }
        esym.write_at(enc, out, base + i * entsize);
    }
}

pub fn copy_dynstr(cx: &Context, out: &mut [u8]) {
    let Some(dynstr) = cx.refs.dynstr else { return };
    let chunk = cx.chunk(dynstr);
    if let ChunkKind::Dynstr(pool) = &chunk.kind {
        let base = chunk.shdr.sh_offset as usize;
        out[base..base + pool.len()].copy_from_slice(pool.bytes());
    }
}

/// The classic System V hash table: one bucket and one chain slot per
/// symbol.
pub fn copy_hash(cx: &Context, out: &mut [u8]) {
    let Some(hash) = cx.refs.hash else { return };
    let chunk = cx.chunk(hash);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let enc = cx.enc;
    let base = chunk.shdr.sh_offset as usize;
    let nsyms = cx.dynsym_syms.len();

    enc.put_u32(out, base, nsyms as u32);
    enc.put_u32(out, base + 4, nsyms as u32);
    let buckets = base + 8;
    let chains = buckets + nsyms * 4;

    for (i, &id) in cx.dynsym_syms.iter().enumerate().skip(1) {
        let h = elf_hash(&cx.sym(id).name) as usize % nsyms;
        let head = enc.u32_at(out, buckets + h * 4).unwrap_or(0);
        enc.put_u32(out, chains + i * 4, head);
        enc.put_u32(out, buckets + h * 4, i as u32);
    }
}

/// The GNU hash table: a bloom filter sized at roughly 12 bits per
/// exported symbol, hash buckets, and LSB-terminated hash chains over
/// the exported tail of `.dynsym`.
pub fn copy_gnu_hash(cx: &Context, out: &mut [u8]) {
    let Some(gnu_hash) = cx.refs.gnu_hash else { return };
    let chunk = cx.chunk(gnu_hash);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let enc = cx.enc;
    let word = cx.word_size() as usize;
    let base = chunk.shdr.sh_offset as usize;

    let num_exported = cx.num_exported_dynsyms;
    let num_buckets = gnu_hash_buckets(num_exported);
    let num_bloom = gnu_hash_bloom(num_exported.max(1), word * 8);
    let first_exported = cx.dynsym_syms.len() - num_exported;

    enc.put_u32(out, base, num_buckets as u32);
    enc.put_u32(out, base + 4, first_exported as u32);
    enc.put_u32(out, base + 8, num_bloom as u32);
    enc.put_u32(out, base + 12, GNU_HASH_BLOOM_SHIFT);

    let syms = &cx.dynsym_syms[first_exported..];
    if syms.is_empty() {
        return;
    }

    let bloom_base = base + GNU_HASH_HEADER_SIZE;
    let word_bits = (word * 8) as u32;
    let hashes: Vec<u32> = syms
        .iter()
        .map(|&id| {
            cx.aux(id)
                .map(|a| a.djb_hash)
                .unwrap_or_else(|| djb_hash(&cx.sym(id).name))
        })
        .collect();

    for &h in &hashes {
        let idx = (h / word_bits) as usize % num_bloom;
        let mut w = enc.word_at(out, bloom_base + idx * word).unwrap_or(0);
        w |= 1u64.checked_shl(h % word_bits).unwrap_or(0);
        w |= 1u64
            .checked_shl((h >> GNU_HASH_BLOOM_SHIFT) % word_bits)
            .unwrap_or(0);
        enc.put_word(out, bloom_base + idx * word, w);
    }

    // Bucket i points at the first chain member whose hash lands in i.
    let buckets_base = bloom_base + num_bloom * word;
    for (i, &h) in hashes.iter().enumerate().rev() {
        let b = h as usize % num_buckets;
        enc.put_u32(out, buckets_base + b * 4, (first_exported + i) as u32);
    }

    // The last entry of each chain carries the LSB terminator.
    let table_base = buckets_base + num_buckets * 4;
    for (i, &h) in hashes.iter().enumerate() {
        let last_in_chain = i + 1 == hashes.len()
            || hashes[i] as usize % num_buckets != hashes[i + 1] as usize % num_buckets;
        let val = if last_in_chain { h | 1 } else { h & !1 };
        enc.put_u32(out, table_base + i * 4, val);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_gnu_hash_sizing() {
        assert_eq!(gnu_hash_buckets(0), 1);
        assert_eq!(gnu_hash_buckets(16), 3);
        // 12 bits per symbol, rounded to a power of two in words.
        assert_eq!(gnu_hash_bloom(64, 64), 16);
        assert_eq!(gnu_hash_bloom(1, 64), 1);
    }
}
