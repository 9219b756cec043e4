//! i386 backend
//!
//! i386 has no PC-relative memory addressing, so PIC code materializes its
//! own address with a `get_pc_thunk` call and keeps the GOT address in
//! %ebx. PLT entries come in position-dependent and position-independent
//! flavors depending on whether %ebx can be assumed to hold the GOT.
//! Relocations are REL-format: addends live in the relocated fields.

use crate::arch::{check_range, define_rels, Target, TargetInfo};
use crate::context::Context;
use crate::elf::{Class, Endian, Machine, Rel, R_NONE};
use crate::error::{Error, Result};
use crate::scan::{self, ABSREL_TABLE, PCREL_TABLE};
use crate::symbol::{SectionRef, SymbolId, NEEDS_GOT, NEEDS_GOTTP, NEEDS_PLT, NEEDS_TLSGD};

define_rels!(
    I386,
    NONE = 0,
    ABS32 as "R_386_32" = 1,
    PC32 = 2,
    GOT32 = 3,
    PLT32 = 4,
    COPY = 5,
    GLOB_DAT = 6,
    JUMP_SLOT = 7,
    RELATIVE = 8,
    GOTOFF = 9,
    GOTPC = 10,
    TLS_TPOFF = 14,
    TLS_IE = 15,
    TLS_GOTIE = 16,
    TLS_LE = 17,
    TLS_GD = 18,
    TLS_LDM = 19,
    ABS16 as "R_386_16" = 20,
    PC16 = 21,
    ABS8 as "R_386_8" = 22,
    PC8 = 23,
    TLS_LDO_32 = 32,
    TLS_DTPMOD32 = 35,
    TLS_DTPOFF32 = 36,
    SIZE32 = 38,
    TLS_GOTDESC = 39,
    TLS_DESC_CALL = 40,
    TLS_DESC = 41,
    IRELATIVE = 42,
    GOT32X = 43,
);

pub static TARGET: I386 = I386;

static INFO: TargetInfo = TargetInfo {
    machine: Machine::I386,
    class: Class::Elf32,
    endian: Endian::Little,
    page_size: 4096,
    default_image_base: 0x400000,
    is_rela: false,
    supports_tlsdesc: true,
    plt_hdr_size: 16,
    plt_size: 16,
    pltgot_size: 8,
    r_copy: R_I386_COPY,
    r_glob_dat: R_I386_GLOB_DAT,
    r_jump_slot: R_I386_JUMP_SLOT,
    r_relative: R_I386_RELATIVE,
    r_irelative: R_I386_IRELATIVE,
    r_abs: R_I386_ABS32,
    r_dtpmod: R_I386_TLS_DTPMOD32,
    r_dtpoff: R_I386_TLS_DTPOFF32,
    r_tpoff: R_I386_TLS_TPOFF,
    r_tlsdesc: R_I386_TLS_DESC,
    branch_reach: 0,
    thunk_size: 0,
    thunk_hdr_size: 0,
    filler: &[0xcc],
};

pub struct I386;

fn put32(out: &mut [u8], off: usize, val: u32) {
    out[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put16(out: &mut [u8], off: usize, val: u16) {
    out[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn read32(data: &[u8], off: usize) -> u32 {
    data.get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

/// `mov imm(%reg1), %reg2` -> `lea imm(%reg1), %reg2`
fn relax_got32x(prefix: &[u8]) -> u32 {
    if prefix[0] == 0x8b {
        0x8d00 | prefix[1] as u32
    } else {
        0
    }
}

fn relax_gd_to_le(out: &mut [u8], loc: usize, next_type: u32, val: u32) -> Result<()> {
    const INSN: [u8; 12] = [
        0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0, %eax
        0x81, 0xc0, 0, 0, 0, 0, // add $tp_offset, %eax
    ];
    match next_type {
        R_I386_PLT32 | R_I386_PC32 => {
            out[loc - 3..loc + 9].copy_from_slice(&INSN);
            put32(out, loc + 5, val);
            Ok(())
        }
        R_I386_GOT32 | R_I386_GOT32X => {
            out[loc - 2..loc + 10].copy_from_slice(&INSN);
            put32(out, loc + 6, val);
            Ok(())
        }
        _ => Err(Error::internal("unexpected TLS_GD companion relocation")),
    }
}

fn relax_ld_to_le(out: &mut [u8], loc: usize, next_type: u32, tls_size: u32) -> Result<()> {
    match next_type {
        R_I386_PLT32 | R_I386_PC32 => {
            const INSN: [u8; 11] = [
                0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0, %eax
                0x2d, 0, 0, 0, 0, // sub $tls_size, %eax
            ];
            out[loc - 2..loc + 9].copy_from_slice(&INSN);
            put32(out, loc + 5, tls_size);
            Ok(())
        }
        R_I386_GOT32 | R_I386_GOT32X => {
            const INSN: [u8; 12] = [
                0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0, %eax
                0x81, 0xe8, 0, 0, 0, 0, // sub $tls_size, %eax
            ];
            out[loc - 2..loc + 10].copy_from_slice(&INSN);
            put32(out, loc + 6, tls_size);
            Ok(())
        }
        _ => Err(Error::internal("unexpected TLS_LDM companion relocation")),
    }
}

/// `lea 0(%ebx), %reg` -> `mov 0(%ebx), %reg`
fn relax_tlsdesc_to_ie(prefix: &[u8]) -> u32 {
    match (prefix[0] as u32) << 8 | prefix[1] as u32 {
        0x8d83 => 0x8b83,
        0x8d9b => 0x8b9b,
        0x8d8b => 0x8b8b,
        0x8d93 => 0x8b93,
        0x8db3 => 0x8bb3,
        0x8dbb => 0x8bbb,
        0x8da3 => 0x8ba3,
        0x8dab => 0x8bab,
        _ => 0,
    }
}

/// `lea 0(%ebx), %reg` -> `nop; mov $0, %reg`
fn relax_tlsdesc_to_le(prefix: &[u8]) -> u32 {
    match (prefix[0] as u32) << 8 | prefix[1] as u32 {
        0x8d83 => 0x90b8,
        0x8d9b => 0x90bb,
        0x8d8b => 0x90b9,
        0x8d93 => 0x90ba,
        0x8db3 => 0x90be,
        0x8dbb => 0x90bf,
        0x8da3 => 0x90bc,
        0x8dab => 0x90bd,
        _ => 0,
    }
}

fn validate_tls_pair(cx: &Context, fid: u32, shndx: u32, rels: &[Rel], i: usize) -> Result<()> {
    let ok = i + 1 < rels.len()
        && matches!(
            rels[i + 1].r_type,
            R_I386_PLT32 | R_I386_PC32 | R_I386_GOT32 | R_I386_GOT32X
        );
    if ok {
        return Ok(());
    }
    Err(Error::BadRelocation {
        file: cx.objs[fid as usize].name.clone(),
        section: cx.isec(SectionRef { file: fid, shndx }).name.clone(),
        offset: rels[i].r_offset,
        message: "TLS relocation must be followed by PLT or GOT32".to_string(),
    })
}

impl Target for I386 {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn rel_name(&self, r_type: u32) -> Option<&'static str> {
        rel_name(r_type)
    }

    fn is_abs_rel(&self, r_type: u32) -> bool {
        r_type == R_I386_ABS32
    }

    fn is_branch_reloc(&self, r_type: u32) -> bool {
        r_type == R_I386_PLT32
    }

    fn get_addend(&self, contents: &[u8], rel: &Rel) -> i64 {
        let off = rel.r_offset as usize;
        match rel.r_type {
            R_I386_ABS8 | R_I386_PC8 => contents.get(off).copied().unwrap_or(0) as i8 as i64,
            R_I386_ABS16 | R_I386_PC16 => contents
                .get(off..off + 2)
                .and_then(|b| b.try_into().ok())
                .map(u16::from_le_bytes)
                .unwrap_or(0) as i16 as i64,
            R_I386_ABS32 | R_I386_PC32 | R_I386_GOT32 | R_I386_GOT32X | R_I386_PLT32
            | R_I386_GOTOFF | R_I386_GOTPC | R_I386_TLS_LDM | R_I386_TLS_GOTIE | R_I386_TLS_LE
            | R_I386_TLS_IE | R_I386_TLS_GD | R_I386_TLS_LDO_32 | R_I386_SIZE32
            | R_I386_TLS_GOTDESC => read32(contents, off) as i32 as i64,
            _ => 0,
        }
    }

    fn write_addend(&self, contents: &mut [u8], rel: &Rel, val: i64) {
        let off = rel.r_offset as usize;
        match rel.r_type {
            R_I386_ABS8 | R_I386_PC8 => contents[off] = val as u8,
            R_I386_ABS16 | R_I386_PC16 => put16(contents, off, val as u16),
            R_I386_ABS32 | R_I386_PC32 | R_I386_GOT32 | R_I386_GOT32X | R_I386_PLT32
            | R_I386_GOTOFF | R_I386_GOTPC | R_I386_TLS_LDM | R_I386_TLS_GOTIE | R_I386_TLS_LE
            | R_I386_TLS_IE | R_I386_TLS_GD | R_I386_TLS_LDO_32 | R_I386_SIZE32
            | R_I386_TLS_GOTDESC => put32(contents, off, val as u32),
            _ => {}
        }
    }

    fn scan_relocations(&self, cx: &mut Context, fid: u32, shndx: u32) -> Result<()> {
        let r = SectionRef { file: fid, shndx };
        let rels: Vec<Rel> = cx.objs[fid as usize].section_rels(cx.isec(r)).to_vec();
        let contents_range = cx.isec(r).contents.clone();

        let mut i = 0usize;
        while i < rels.len() {
            let rel = rels[i];
            if rel.r_type == R_NONE {
                i += 1;
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];

            if cx.sym(id).is_ifunc() {
                cx.sym(id).set_flags(NEEDS_GOT | NEEDS_PLT);
            }

            match rel.r_type {
                R_I386_ABS8 | R_I386_ABS16 => {
                    scan::do_action(cx, &ABSREL_TABLE, fid, shndx, &rel, id);
                    scan::mark_frag_32bit(cx, fid, &rel);
                }
                R_I386_PC8 | R_I386_PC16 | R_I386_PC32 => {
                    scan::do_action(cx, &PCREL_TABLE, fid, shndx, &rel, id);
                }
                R_I386_GOT32 | R_I386_GOTPC => {
                    cx.sym(id).set_flags(NEEDS_GOT);
                }
                R_I386_GOT32X => {
                    // Relaxed even under --no-relax; static PIEs rely on it.
                    let off = rel.r_offset as usize;
                    let relaxable = off >= 2 && {
                        let data = &cx.objs[fid as usize].data[contents_range.clone()];
                        relax_got32x(&data[off - 2..off]) != 0
                    };
                    if !(cx.is_pcrel_linktime_const(id) && relaxable) {
                        cx.sym(id).set_flags(NEEDS_GOT);
                    }
                }
                R_I386_PLT32 => {
                    if cx.sym(id).is_imported {
                        cx.sym(id).set_flags(NEEDS_PLT);
                    }
                }
                R_I386_TLS_GOTIE | R_I386_TLS_IE => {
                    cx.sym(id).set_flags(NEEDS_GOTTP);
                }
                R_I386_TLS_GD => {
                    validate_tls_pair(cx, fid, shndx, &rels, i)?;
                    if cx.options.static_
                        || (cx.options.relax && cx.is_tprel_linktime_const(id))
                    {
                        i += 1;
                    } else {
                        cx.sym(id).set_flags(NEEDS_TLSGD);
                    }
                }
                R_I386_TLS_LDM => {
                    validate_tls_pair(cx, fid, shndx, &rels, i)?;
                    if cx.options.static_ || (cx.options.relax && !cx.options.shared) {
                        i += 1;
                    } else {
                        cx.needs_tlsld = true;
                    }
                }
                R_I386_TLS_GOTDESC => {
                    scan::scan_tlsdesc(cx, id);
                }
                R_I386_TLS_LE => {
                    scan::check_tlsle(cx, fid, shndx, &rel, id);
                }
                R_I386_ABS32
                | R_I386_GOTOFF
                | R_I386_TLS_LDO_32
                | R_I386_SIZE32
                | R_I386_TLS_DESC_CALL => {}
                ty => {
                    return Err(Error::UnknownRelocation {
                        file: cx.objs[fid as usize].name.clone(),
                        section: cx.isec(r).name.clone(),
                        rel_type: ty,
                    });
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn apply_reloc_alloc(&self, cx: &Context, fid: u32, shndx: u32, out: &mut [u8]) -> Result<()> {
        let r = SectionRef { file: fid, shndx };
        let isec = cx.isec(r);
        let Some(osec) = isec.osec else {
            return Ok(());
        };
        let base_off = (cx.chunk(osec).shdr.sh_offset + isec.offset) as usize;
        let base_addr = cx.chunk(osec).shdr.sh_addr + isec.offset;
        let rels: Vec<Rel> = cx.objs[fid as usize].section_rels(isec).to_vec();
        let got = cx.chunk_addr(cx.refs.got);

        let mut i = 0usize;
        while i < rels.len() {
            let rel = rels[i];
            if rel.r_type == R_NONE {
                i += 1;
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let s = cx.get_addr(id, 0);
            // REL format: the addend is the value currently in the field.
            let in_a = self.get_addend(&out[base_off..], &rel);
            let (s, a) = match cx.get_fragment(fid, &rel, in_a) {
                Some((frag, off)) => (cx.frag_addr(frag), off as u64),
                None => (s, in_a as u64),
            };
            let p = base_addr + rel.r_offset;
            let g = cx.got_idx(id).max(0) as u64 * 4;

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, &rel, val, lo, hi);

            match rel.r_type {
                R_I386_ABS8 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 8)?;
                    out[loc] = val as u8;
                }
                R_I386_ABS16 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 16)?;
                    put16(out, loc, val as u16);
                }
                R_I386_ABS32 => {
                    // Handled with the output section's absolute-relocation
                    // records.
                }
                R_I386_PC8 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 7), 1 << 7)?;
                    out[loc] = val as u8;
                }
                R_I386_PC16 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 15), 1 << 15)?;
                    put16(out, loc, val as u16);
                }
                R_I386_PC32 | R_I386_PLT32 => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_I386_GOT32 => {
                    put32(out, loc, g.wrapping_add(a) as u32);
                }
                R_I386_GOT32X => {
                    if cx.has_got(id) {
                        put32(out, loc, g.wrapping_add(a) as u32);
                    } else {
                        let insn = relax_got32x(&out[loc - 2..loc]);
                        if insn == 0 {
                            return Err(Error::BadRelocation {
                                file: cx.objs[fid as usize].name.clone(),
                                section: isec.name.clone(),
                                offset: rel.r_offset,
                                message: "unrecognized instruction for GOT32X relaxation".into(),
                            });
                        }
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        put32(out, loc, s.wrapping_add(a).wrapping_sub(got) as u32);
                    }
                }
                R_I386_GOTOFF => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(got) as u32);
                }
                R_I386_GOTPC => {
                    put32(out, loc, got.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_I386_TLS_GOTIE => {
                    put32(
                        out,
                        loc,
                        cx.gottp_addr(id).wrapping_add(a).wrapping_sub(got) as u32,
                    );
                }
                R_I386_TLS_LE => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr) as u32);
                }
                R_I386_TLS_IE => {
                    put32(out, loc, cx.gottp_addr(id).wrapping_add(a) as u32);
                }
                R_I386_TLS_GD => {
                    if cx.has_tlsgd(id) {
                        put32(
                            out,
                            loc,
                            cx.tlsgd_addr(id).wrapping_add(a).wrapping_sub(got) as u32,
                        );
                    } else {
                        i += 1;
                        relax_gd_to_le(
                            out,
                            loc,
                            rels[i].r_type,
                            s.wrapping_sub(cx.tp_addr) as u32,
                        )?;
                    }
                }
                R_I386_TLS_LDM => {
                    if cx.tlsld_idx >= 0 {
                        put32(
                            out,
                            loc,
                            cx.tlsld_addr().wrapping_add(a).wrapping_sub(got) as u32,
                        );
                    } else {
                        i += 1;
                        relax_ld_to_le(
                            out,
                            loc,
                            rels[i].r_type,
                            cx.tp_addr.wrapping_sub(cx.tls_begin) as u32,
                        )?;
                    }
                }
                R_I386_TLS_LDO_32 => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr) as u32);
                }
                R_I386_SIZE32 => {
                    put32(out, loc, cx.sym(id).esym_size.wrapping_add(a) as u32);
                }
                R_I386_TLS_GOTDESC => {
                    if cx.has_tlsdesc(id) {
                        put32(
                            out,
                            loc,
                            cx.tlsdesc_addr(id).wrapping_add(a).wrapping_sub(got) as u32,
                        );
                    } else if cx.has_gottp(id) {
                        let insn = relax_tlsdesc_to_ie(&out[loc - 2..loc]);
                        if insn == 0 {
                            return Err(self.bad_insn(cx, fid, shndx, &rel));
                        }
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        put32(
                            out,
                            loc,
                            cx.gottp_addr(id).wrapping_add(a).wrapping_sub(got) as u32,
                        );
                    } else {
                        let insn = relax_tlsdesc_to_le(&out[loc - 2..loc]);
                        if insn == 0 {
                            return Err(self.bad_insn(cx, fid, shndx, &rel));
                        }
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr) as u32);
                    }
                }
                R_I386_TLS_DESC_CALL => {
                    if !cx.has_tlsdesc(id) {
                        // call *(%eax) -> nop
                        out[loc] = 0x66;
                        out[loc + 1] = 0x90;
                    }
                }
                ty => {
                    return Err(Error::UnknownRelocation {
                        file: cx.objs[fid as usize].name.clone(),
                        section: isec.name.clone(),
                        rel_type: ty,
                    });
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn apply_reloc_nonalloc(
        &self,
        cx: &Context,
        fid: u32,
        shndx: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let r = SectionRef { file: fid, shndx };
        let isec = cx.isec(r);
        let Some(osec) = isec.osec else {
            return Ok(());
        };
        let base_off = (cx.chunk(osec).shdr.sh_offset + isec.offset) as usize;
        let rels: Vec<Rel> = cx.objs[fid as usize].section_rels(isec).to_vec();
        let referer = isec.name.clone();
        let got = cx.chunk_addr(cx.refs.got);

        for rel in &rels {
            if rel.r_type == R_NONE {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let in_addend = self.get_addend(&out[base_off..], rel);
            let frag = cx.get_fragment(fid, rel, in_addend);
            let (s, a) = match frag {
                Some((f, addend)) => (cx.frag_addr(f), addend as u64),
                None => (cx.get_addr(id, 0), in_addend as u64),
            };
            let tomb = cx.get_tombstone(&referer, id, frag.map(|(f, _)| f));

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, rel, val, lo, hi);

            match rel.r_type {
                R_I386_ABS8 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 8)?;
                    out[loc] = val as u8;
                }
                R_I386_ABS16 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 16)?;
                    put16(out, loc, val as u16);
                }
                R_I386_ABS32 => match tomb {
                    Some(v) => put32(out, loc, v as u32),
                    None => put32(out, loc, s.wrapping_add(a) as u32),
                },
                R_I386_PC8 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, -(1 << 7), 1 << 7)?;
                    out[loc] = val as u8;
                }
                R_I386_PC16 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, -(1 << 15), 1 << 15)?;
                    put16(out, loc, val as u16);
                }
                R_I386_PC32 => {
                    put32(out, loc, s.wrapping_add(a) as u32);
                }
                R_I386_GOTPC => {
                    put32(out, loc, got.wrapping_add(a) as u32);
                }
                R_I386_GOTOFF => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(got) as u32);
                }
                R_I386_TLS_LDO_32 => match tomb {
                    Some(v) => put32(out, loc, v as u32),
                    None => put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr) as u32),
                },
                R_I386_SIZE32 => {
                    put32(out, loc, cx.sym(id).esym_size.wrapping_add(a) as u32);
                }
                ty => {
                    return Err(Error::BadRelocation {
                        file: cx.objs[fid as usize].name.clone(),
                        section: referer.clone(),
                        offset: rel.r_offset,
                        message: format!(
                            "invalid relocation type {ty} for a non-allocated section"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_plt_header(&self, cx: &Context, buf: &mut [u8]) {
        let gotplt = cx.chunk_addr(cx.refs.gotplt);
        let got = cx.chunk_addr(cx.refs.got);
        if cx.options.pic() {
            const INSN: [u8; 16] = [
                0x51, // push %ecx
                0x8d, 0x8b, 0, 0, 0, 0, // lea GOTPLT+4(%ebx), %ecx
                0xff, 0x31, // push (%ecx)
                0xff, 0x61, 0x04, // jmp *0x4(%ecx)
                0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 3, gotplt.wrapping_sub(got).wrapping_add(4) as u32);
        } else {
            const INSN: [u8; 16] = [
                0x51, // push %ecx
                0xb9, 0, 0, 0, 0, // mov GOTPLT+4, %ecx
                0xff, 0x31, // push (%ecx)
                0xff, 0x61, 0x04, // jmp *0x4(%ecx)
                0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 2, gotplt.wrapping_add(4) as u32);
        }
    }

    fn write_plt_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        let reloc_offset = cx.plt_idx(sym) as u32 * 8;
        let gotplt = cx.gotplt_addr(sym);
        let got = cx.chunk_addr(cx.refs.got);
        if cx.options.pic() {
            const INSN: [u8; 16] = [
                0xb9, 0, 0, 0, 0, // mov $reloc_offset, %ecx
                0xff, 0xa3, 0, 0, 0, 0, // jmp *foo@GOT(%ebx)
                0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 1, reloc_offset);
            put32(buf, 7, gotplt.wrapping_sub(got) as u32);
        } else {
            const INSN: [u8; 16] = [
                0xb9, 0, 0, 0, 0, // mov $reloc_offset, %ecx
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOT
                0xcc, 0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 1, reloc_offset);
            put32(buf, 7, gotplt as u32);
        }
    }

    fn write_pltgot_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        let got_entry = cx.got_addr(sym);
        let got = cx.chunk_addr(cx.refs.got);
        if cx.options.pic() {
            const INSN: [u8; 8] = [
                0xff, 0xa3, 0, 0, 0, 0, // jmp *foo@GOT(%ebx)
                0xcc, 0xcc, // (padding)
            ];
            buf[..8].copy_from_slice(&INSN);
            put32(buf, 2, got_entry.wrapping_sub(got) as u32);
        } else {
            const INSN: [u8; 8] = [
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOT
                0xcc, 0xcc, // (padding)
            ];
            buf[..8].copy_from_slice(&INSN);
            put32(buf, 2, got_entry as u32);
        }
    }

    fn apply_eh_reloc(
        &self,
        cx: &Context,
        rel: &Rel,
        offset: u64,
        val: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let Some(eh) = cx.refs.eh_frame else {
            return Ok(());
        };
        let chunk = cx.chunk(eh);
        let loc = (chunk.shdr.sh_offset + offset) as usize;
        match rel.r_type {
            R_NONE => {}
            R_I386_ABS32 => put32(out, loc, val as u32),
            R_I386_PC32 => put32(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset) as u32),
            ty => {
                return Err(Error::UnknownRelocation {
                    file: "<output>".into(),
                    section: ".eh_frame".into(),
                    rel_type: ty,
                })
            }
        }
        Ok(())
    }

    fn tp_addr(&self, p_vaddr: u64, p_memsz: u64, p_align: u64) -> u64 {
        let end = p_vaddr + p_memsz;
        (end + p_align - 1) & !(p_align.max(1) - 1)
    }
}

impl I386 {
    fn bad_insn(&self, cx: &Context, fid: u32, shndx: u32, rel: &Rel) -> Error {
        Error::BadRelocation {
            file: cx.objs[fid as usize].name.clone(),
            section: cx.isec(SectionRef { file: fid, shndx }).name.clone(),
            offset: rel.r_offset,
            message: "unrecognized instruction sequence for TLSDESC relaxation".into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_got32x_relaxation_matches_mov_only() {
        assert_eq!(relax_got32x(&[0x8b, 0x83]), 0x8d83);
        assert_eq!(relax_got32x(&[0x8d, 0x83]), 0);
    }

    #[test]
    fn test_rel_addend_comes_from_the_field() {
        let t = I386;
        let contents = [0u8, 0, 0, 0, 0xfc, 0xff, 0xff, 0xff];
        let rel = Rel {
            r_offset: 4,
            r_sym: 0,
            r_type: R_I386_PC32,
            r_addend: 0,
        };
        assert_eq!(t.get_addend(&contents, &rel), -4);
    }
}
