//! Identical code folding
//!
//! Sections are partitioned by a content digest, then the partition is
//! refined: each round re-hashes every section together with the current
//! class of every section it references, which converges in O(log N)
//! rounds. Equal classes fold into a deterministically chosen leader.
//! Digest equality is backed by an exact comparison before anything folds.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::context::Context;
use crate::elf::{
    SecFlags, SHT_FINI_ARRAY, SHT_INIT_ARRAY, SHT_NOBITS, SHT_PREINIT_ARRAY, STT_FUNC,
};
use crate::gc::is_c_identifier;
use crate::hash::SipHash13;
use crate::options::IcfMode;
use crate::symbol::SectionRef;

fn is_eligible(cx: &Context, r: SectionRef) -> bool {
    let isec = cx.isec(r);
    let shdr = &isec.shdr;
    let flags = shdr.flags();
    let name = isec.name.as_str();

    isec.is_alive()
        && flags.contains(SecFlags::ALLOC)
        && !flags.intersects(SecFlags::WRITE | SecFlags::TLS)
        && shdr.sh_type != SHT_NOBITS
        && shdr.sh_size != 0
        && !matches!(
            shdr.sh_type,
            SHT_INIT_ARRAY | SHT_FINI_ARRAY | SHT_PREINIT_ARRAY
        )
        && !name.starts_with(".init")
        && !name.starts_with(".fini")
        && !name.starts_with(".ctors")
        && !name.starts_with(".dtors")
        && name != ".eh_frame"
        && !is_c_identifier(name)
        && (cx.options.icf == IcfMode::All || !isec.address_taken.load(Ordering::Relaxed))
}

/// Conservatively mark sections whose address escapes. Any reference to a
/// function through something other than a branch means the address may be
/// compared, so folding it would be observable.
fn mark_address_taken(cx: &Context) {
    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        for isec in file.sections.iter().flatten() {
            if !isec.is_alive() {
                continue;
            }
            for rel in file.section_rels(isec) {
                if cx.target.is_branch_reloc(rel.r_type) {
                    continue;
                }
                let sym = cx.sym(file.symbols[rel.r_sym as usize]);
                if sym.st_type() != STT_FUNC {
                    continue;
                }
                if let Some(target) = sym.input_section() {
                    if let Some(target_isec) = cx.try_isec(target) {
                        target_isec.address_taken.store(true, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

/// What a relocation points at, reduced to something hashable per round
enum RelTarget {
    /// Another eligible section, identified by its position in the group
    Class(u32),
    /// Anything else, pinned by a stable identity
    Fixed(u64),
}

fn rel_target(
    cx: &Context,
    index: &HashMap<SectionRef, u32>,
    fid: u32,
    rel: &crate::elf::Rel,
) -> RelTarget {
    let file = &cx.objs[fid as usize];
    let id = file.symbols[rel.r_sym as usize];
    let sym = cx.sym(id);
    if let Some(target) = sym.input_section() {
        if let Some(&class) = index.get(&target) {
            return RelTarget::Class(class);
        }
    }
    let mut h = SipHash13::new(0x5bd1e995, 0x27d4eb2f);
    h.update(&id.0.to_le_bytes());
    h.update(&sym.value.to_le_bytes());
    RelTarget::Fixed(h.finish())
}

fn initial_digest(cx: &Context, r: SectionRef) -> u64 {
    let file = &cx.objs[r.file as usize];
    let isec = cx.isec(r);
    let mut h = SipHash13::new(0x243f6a88, 0x85a308d3);
    h.update(file.section_bytes(isec));
    h.update(&isec.shdr.sh_flags.to_le_bytes());
    h.update(&isec.shdr.sh_type.to_le_bytes());
    h.update(&[isec.p2align]);
    h.update(&(isec.rels.len() as u64).to_le_bytes());
    for rel in file.section_rels(isec) {
        h.update(&rel.r_offset.to_le_bytes());
        h.update(&rel.r_type.to_le_bytes());
        h.update(&rel.r_addend.to_le_bytes());
    }
    h.finish()
}

fn refine_digest(
    cx: &Context,
    index: &HashMap<SectionRef, u32>,
    digests: &[u64],
    r: SectionRef,
    own: u64,
) -> u64 {
    let file = &cx.objs[r.file as usize];
    let isec = cx.isec(r);
    let mut h = SipHash13::new(0x13198a2e, 0x03707344);
    h.update(&own.to_le_bytes());
    for rel in file.section_rels(isec) {
        match rel_target(cx, index, r.file, rel) {
            RelTarget::Class(c) => h.update(&digests[c as usize].to_le_bytes()),
            RelTarget::Fixed(v) => h.update(&v.to_le_bytes()),
        }
    }
    h.finish()
}

/// Exact comparison used before folding `b` into `a`
fn sections_identical(cx: &Context, a: SectionRef, b: SectionRef) -> bool {
    let fa = &cx.objs[a.file as usize];
    let fb = &cx.objs[b.file as usize];
    let ia = cx.isec(a);
    let ib = cx.isec(b);
    if fa.section_bytes(ia) != fb.section_bytes(ib)
        || ia.shdr.sh_flags != ib.shdr.sh_flags
        || ia.p2align != ib.p2align
    {
        return false;
    }
    let ra = fa.section_rels(ia);
    let rb = fb.section_rels(ib);
    if ra.len() != rb.len() {
        return false;
    }
    for (x, y) in ra.iter().zip(rb.iter()) {
        if x.r_offset != y.r_offset || x.r_type != y.r_type || x.r_addend != y.r_addend {
            return false;
        }
        let sx = cx.sym(fa.symbols[x.r_sym as usize]);
        let sy = cx.sym(fb.symbols[y.r_sym as usize]);
        let tx = sx.input_section();
        let ty = sy.input_section();
        match (tx, ty) {
            (Some(tx), Some(ty)) => {
                // References within the candidate pair must mirror each
                // other; anything else must be literally the same place.
                let mirrored = (tx == a && ty == b) || (tx == b && ty == a);
                if !mirrored && (tx != ty || sx.value != sy.value) {
                    return false;
                }
                if sx.value != sy.value {
                    return false;
                }
            }
            (None, None) => {
                if fa.symbols[x.r_sym as usize] != fb.symbols[y.r_sym as usize]
                    || sx.value != sy.value
                {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

/// Stage 4: fold byte-identical read-only sections
pub fn fold_identical_sections(cx: &mut Context) {
    if cx.options.icf == IcfMode::None {
        return;
    }
    if cx.options.icf == IcfMode::Safe {
        mark_address_taken(cx);
    }

    let mut sections: Vec<SectionRef> = Vec::new();
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for isec in cx.objs[f].sections.iter().flatten() {
            let r = SectionRef {
                file: f as u32,
                shndx: isec.shndx,
            };
            if is_eligible(cx, r) {
                sections.push(r);
            }
        }
    }
    if sections.is_empty() {
        return;
    }

    let index: HashMap<SectionRef, u32> = sections
        .iter()
        .enumerate()
        .map(|(i, &r)| (r, i as u32))
        .collect();

    let mut digests: Vec<u64> = sections.iter().map(|&r| initial_digest(cx, r)).collect();
    let mut num_classes = count_distinct(&digests);
    loop {
        let next: Vec<u64> = sections
            .iter()
            .enumerate()
            .map(|(i, &r)| refine_digest(cx, &index, &digests, r, digests[i]))
            .collect();
        let n = count_distinct(&next);
        digests = next;
        if n == num_classes {
            break;
        }
        num_classes = n;
    }

    // Group by digest, fold into the best-ranked member.
    let mut groups: HashMap<u64, Vec<u32>> = HashMap::new();
    for (i, &d) in digests.iter().enumerate() {
        groups.entry(d).or_default().push(i as u32);
    }

    let mut num_folded = 0usize;
    for (_, mut members) in groups {
        if members.len() < 2 {
            if let Some(&only) = members.first() {
                mark_leader(cx, sections[only as usize], sections[only as usize]);
            }
            continue;
        }
        members.sort_by_key(|&i| {
            let r = sections[i as usize];
            (cx.objs[r.file as usize].priority, r.shndx)
        });
        let leader = sections[members[0] as usize];
        mark_leader(cx, leader, leader);

        for &m in &members[1..] {
            let r = sections[m as usize];
            if !sections_identical(cx, leader, r) {
                mark_leader(cx, r, r);
                continue;
            }
            mark_leader(cx, r, leader);
            cx.isec(r).kill();
            num_folded += 1;
            if cx.options.print_icf_sections {
                log::info!(
                    "icf: folding {}:({}) into {}:({})",
                    cx.objs[r.file as usize].name,
                    cx.isec(r).name,
                    cx.objs[leader.file as usize].name,
                    cx.isec(leader).name
                );
            }
        }
    }
    log::debug!("icf: folded {num_folded} sections");
}

fn mark_leader(cx: &mut Context, r: SectionRef, leader: SectionRef) {
    if let Some(isec) = cx.objs[r.file as usize].sections[r.shndx as usize].as_mut() {
        isec.leader = Some(leader);
    }
}

fn count_distinct(digests: &[u64]) -> usize {
    let mut sorted = digests.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_count_distinct() {
        assert_eq!(count_distinct(&[1, 2, 2, 3]), 3);
        assert_eq!(count_distinct(&[]), 0);
    }
}
