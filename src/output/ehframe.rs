//! `.eh_frame` reconstruction and the binary-search header
//!
//! CIEs with identical bytes and relocation images collapse into one
//! leader; FDEs are re-pointed at their leader's output offset. The
//! `.eh_frame_hdr` table pairs each FDE's function address with the FDE
//! location, sorted so the unwinder can binary-search it.

use crate::context::Context;
use crate::elf::{DW_EH_PE_DATAREL, DW_EH_PE_PCREL, DW_EH_PE_SDATA4, DW_EH_PE_UDATA4};
use crate::error::Result;

/// Compare two CIEs for output identity: same bytes, same relocation
/// image (type, addend, resolved target).
fn cie_equals(cx: &Context, fa: usize, a: usize, fb: usize, b: usize) -> bool {
    let file_a = &cx.objs[fa];
    let file_b = &cx.objs[fb];
    let cie_a = &file_a.cies[a];
    let cie_b = &file_b.cies[b];

    let bytes_a = &file_a.data[cie_contents(cx, fa, a)];
    let bytes_b = &file_b.data[cie_contents(cx, fb, b)];
    if bytes_a != bytes_b {
        return false;
    }
    if cie_a.rels.len() != cie_b.rels.len() {
        return false;
    }
    for (ra, rb) in cie_a.rels.clone().zip(cie_b.rels.clone()) {
        let rel_a = file_a.rels[ra as usize];
        let rel_b = file_b.rels[rb as usize];
        if rel_a.r_type != rel_b.r_type
            || rel_a.r_addend != rel_b.r_addend
            || rel_a.r_offset - cie_a.input_offset as u64
                != rel_b.r_offset - cie_b.input_offset as u64
        {
            return false;
        }
        let sym_a = file_a.symbols[rel_a.r_sym as usize];
        let sym_b = file_b.symbols[rel_b.r_sym as usize];
        if sym_a != sym_b && cx.get_addr(sym_a, 0) != cx.get_addr(sym_b, 0) {
            return false;
        }
    }
    true
}

fn cie_contents(cx: &Context, f: usize, c: usize) -> std::ops::Range<usize> {
    let file = &cx.objs[f];
    let cie = &file.cies[c];
    let base = ehframe_base(cx, f);
    base + cie.input_offset as usize..base + (cie.input_offset + cie.size) as usize
}

fn fde_contents(cx: &Context, f: usize, i: usize) -> std::ops::Range<usize> {
    let file = &cx.objs[f];
    let fde = &file.fdes[i];
    let base = ehframe_base(cx, f);
    base + fde.input_offset as usize..base + (fde.input_offset + fde.size) as usize
}

fn ehframe_base(cx: &Context, f: usize) -> usize {
    cx.objs[f]
        .sections
        .iter()
        .flatten()
        .find(|s| s.name == ".eh_frame")
        .map(|s| s.contents.start)
        .unwrap_or(0)
}

/// Stage 7: drop dead FDEs, uniquify CIEs and lay the section out.
/// An FDE whose covered text section died (by GC, comdat or ICF) dies
/// with it.
pub fn construct(cx: &mut Context) {
    // Re-check FDE liveness against the sections they describe.
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let dead: Vec<usize> = {
            let file = &cx.objs[f];
            (0..file.fdes.len())
                .filter(|&i| {
                    let fde = &file.fdes[i];
                    let alive = fde
                        .function_rel()
                        .and_then(|ri| file.rels.get(ri as usize))
                        .and_then(|rel| file.symbols.get(rel.r_sym as usize))
                        .and_then(|&id| cx.sym(id).input_section())
                        .and_then(|r| cx.try_isec(r))
                        .map(|isec| isec.is_alive())
                        .unwrap_or(false);
                    !alive
                })
                .collect()
        };
        for i in dead {
            cx.objs[f].fdes[i].is_alive = false;
        }
    }

    // Uniquify CIEs across all files.
    let mut leaders: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0u32;
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        for c in 0..cx.objs[f].cies.len() {
            let mut found = None;
            for &(lf, lc) in &leaders {
                if cie_equals(cx, lf, lc, f, c) {
                    found = Some(cx.objs[lf].cies[lc].output_offset);
                    break;
                }
            }
            match found {
                Some(leader_off) => {
                    cx.objs[f].cies[c].output_offset = leader_off;
                }
                None => {
                    cx.objs[f].cies[c].output_offset = offset;
                    cx.objs[f].cies[c].is_leader = true;
                    offset += cx.objs[f].cies[c].size;
                    leaders.push((f, c));
                }
            }
        }
    }

    // Give each file its FDE block.
    let mut fde_idx = 0usize;
    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }
        let file = &mut cx.objs[f];
        let mut off = 0u32;
        let mut live = 0usize;
        for fde in file.fdes.iter_mut().filter(|fde| fde.is_alive) {
            fde.output_offset = off;
            off += fde.size;
            live += 1;
        }
        file.fde_offset = offset as usize;
        file.fde_size = off as usize;
        file.fde_idx = fde_idx;
        fde_idx += live;
        offset += off;
    }

    // The section ends with a null length word.
    if let Some(eh) = cx.refs.eh_frame {
        cx.chunk_mut(eh).shdr.sh_size = offset as u64 + 4;
    }
    if let Some(hdr) = cx.refs.eh_frame_hdr {
        cx.chunk_mut(hdr).shdr.sh_size = HDR_SIZE as u64 + fde_idx as u64 * 8;
    }
}

pub const HDR_SIZE: usize = 12;

/// Write `.eh_frame` (and the search table of `.eh_frame_hdr`)
pub fn copy(cx: &Context, out: &mut [u8]) -> Result<()> {
    let Some(eh) = cx.refs.eh_frame else {
        return Ok(());
    };
    let chunk = cx.chunk(eh);
    if chunk.shdr.sh_size == 0 {
        return Ok(());
    }
    let base = chunk.shdr.sh_offset as usize;
    let enc = cx.enc;

    let hdr = cx.refs.eh_frame_hdr.map(|h| cx.chunk(h));
    let mut hdr_entries: Vec<(i64, i64)> = Vec::new();

    for f in 0..cx.objs.len() {
        if !cx.objs[f].is_alive {
            continue;
        }

        for c in 0..cx.objs[f].cies.len() {
            if !cx.objs[f].cies[c].is_leader {
                continue;
            }
            let contents = cie_contents(cx, f, c);
            let out_off = cx.objs[f].cies[c].output_offset as usize;
            let bytes = cx.objs[f].data[contents].to_vec();
            out[base + out_off..base + out_off + bytes.len()].copy_from_slice(&bytes);

            let cie = &cx.objs[f].cies[c];
            for ri in cie.rels.clone() {
                let rel = cx.objs[f].rels[ri as usize];
                let id = cx.objs[f].symbols[rel.r_sym as usize];
                let loc = out_off as u64 + (rel.r_offset - cie.input_offset as u64);
                let val = cx.get_addr(id, 0).wrapping_add(rel.r_addend as u64);
                cx.target.apply_eh_reloc(cx, &rel, loc, val, out)?;
            }
        }

        for i in 0..cx.objs[f].fdes.len() {
            if !cx.objs[f].fdes[i].is_alive {
                continue;
            }
            let contents = fde_contents(cx, f, i);
            let out_off = cx.objs[f].fde_offset + cx.objs[f].fdes[i].output_offset as usize;
            let bytes = cx.objs[f].data[contents].to_vec();
            out[base + out_off..base + out_off + bytes.len()].copy_from_slice(&bytes);

            // Rewrite the CIE pointer for the new layout.
            let cie_out = cx.objs[f].cies[cx.objs[f].fdes[i].cie_idx as usize].output_offset;
            enc.put_u32(
                out,
                base + out_off + 4,
                (out_off as u32 + 4).wrapping_sub(cie_out),
            );

            let fde_rels = cx.objs[f].fdes[i].rels.clone();
            let input_offset = cx.objs[f].fdes[i].input_offset as u64;
            for (j, ri) in fde_rels.enumerate() {
                let rel = cx.objs[f].rels[ri as usize];
                let id = cx.objs[f].symbols[rel.r_sym as usize];
                let loc = out_off as u64 + (rel.r_offset - input_offset);
                let val = cx.get_addr(id, 0).wrapping_add(rel.r_addend as u64);
                cx.target.apply_eh_reloc(cx, &rel, loc, val, out)?;

                if j == 0 {
                    if let Some(hdr) = hdr {
                        let origin = hdr.shdr.sh_addr as i64;
                        hdr_entries.push((
                            val as i64 - origin,
                            (chunk.shdr.sh_addr + out_off as u64) as i64 - origin,
                        ));
                    }
                }
            }
        }
    }

    // Null terminator record.
    enc.put_u32(out, base + chunk.shdr.sh_size as usize - 4, 0);

    if let Some(hdr) = hdr {
        let hdr_base = hdr.shdr.sh_offset as usize;
        out[hdr_base] = 1; // version
        out[hdr_base + 1] = DW_EH_PE_PCREL | DW_EH_PE_SDATA4;
        out[hdr_base + 2] = DW_EH_PE_UDATA4;
        out[hdr_base + 3] = DW_EH_PE_DATAREL | DW_EH_PE_SDATA4;
        enc.put_u32(
            out,
            hdr_base + 4,
            (chunk.shdr.sh_addr as i64 - hdr.shdr.sh_addr as i64 - 4) as u32,
        );
        enc.put_u32(out, hdr_base + 8, hdr_entries.len() as u32);

        hdr_entries.sort_unstable();
        for (i, (init, fde)) in hdr_entries.iter().enumerate() {
            enc.put_u32(out, hdr_base + HDR_SIZE + i * 8, *init as u32);
            enc.put_u32(out, hdr_base + HDR_SIZE + i * 8 + 4, *fde as u32);
        }
    }
    Ok(())
}
