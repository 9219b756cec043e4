//! ARM64 backend
//!
//! All memory access is register-relative; code addresses 4KiB pages with
//! ADRP and fills in the low 12 bits with ADD/LDR immediates. Branches
//! carry a 26-bit word displacement, so calls reach only ±128MiB and far
//! branches go through range-extension thunks.
//!
//! TP points 16 bytes below the TLS block (the TCB), so TP-relative
//! offsets in the first module start at 16.

use crate::arch::{check_range, define_rels, Target, TargetInfo};
use crate::context::Context;
use crate::elf::{Class, Endian, Machine, Rel, R_NONE};
use crate::error::{Error, Result};
use crate::scan::{self, ABSREL_TABLE, PCREL_TABLE};
use crate::symbol::{SectionRef, SymbolId, NEEDS_GOT, NEEDS_GOTTP, NEEDS_PLT, NEEDS_TLSGD};

define_rels!(
    AARCH64,
    NONE = 0,
    ABS64 = 257,
    ABS32 = 258,
    ABS16 = 259,
    PREL64 = 260,
    PREL32 = 261,
    PREL16 = 262,
    MOVW_UABS_G0 = 263,
    MOVW_UABS_G0_NC = 264,
    MOVW_UABS_G1 = 265,
    MOVW_UABS_G1_NC = 266,
    MOVW_UABS_G2 = 267,
    MOVW_UABS_G2_NC = 268,
    MOVW_UABS_G3 = 269,
    ADR_PREL_LO21 = 274,
    ADR_PREL_PG_HI21 = 275,
    ADR_PREL_PG_HI21_NC = 276,
    ADD_ABS_LO12_NC = 277,
    LDST8_ABS_LO12_NC = 278,
    TSTBR14 = 279,
    CONDBR19 = 280,
    JUMP26 = 282,
    CALL26 = 283,
    LDST16_ABS_LO12_NC = 284,
    LDST32_ABS_LO12_NC = 285,
    LDST64_ABS_LO12_NC = 286,
    LDST128_ABS_LO12_NC = 299,
    ADR_GOT_PAGE = 311,
    LD64_GOT_LO12_NC = 312,
    LD64_GOTPAGE_LO15 = 313,
    TLSGD_ADR_PAGE21 = 513,
    TLSGD_ADD_LO12_NC = 514,
    TLSIE_ADR_GOTTPREL_PAGE21 = 541,
    TLSIE_LD64_GOTTPREL_LO12_NC = 542,
    TLSLE_ADD_TPREL_HI12 = 549,
    TLSLE_ADD_TPREL_LO12 = 550,
    TLSLE_ADD_TPREL_LO12_NC = 551,
    TLSDESC_ADR_PAGE21 = 560,
    TLSDESC_LD64_LO12 = 561,
    TLSDESC_ADD_LO12 = 562,
    TLSDESC_CALL = 569,
    COPY = 1024,
    GLOB_DAT = 1025,
    JUMP_SLOT = 1026,
    RELATIVE = 1027,
    TLS_DTPMOD64 = 1028,
    TLS_DTPREL64 = 1029,
    TLS_TPREL64 = 1030,
    TLSDESC = 1031,
    IRELATIVE = 1032,
);

pub static TARGET: Aarch64 = Aarch64;

static INFO: TargetInfo = TargetInfo {
    machine: Machine::Aarch64,
    class: Class::Elf64,
    endian: Endian::Little,
    page_size: 65536,
    default_image_base: 0x200000,
    is_rela: true,
    supports_tlsdesc: true,
    plt_hdr_size: 32,
    plt_size: 16,
    pltgot_size: 16,
    r_copy: R_AARCH64_COPY,
    r_glob_dat: R_AARCH64_GLOB_DAT,
    r_jump_slot: R_AARCH64_JUMP_SLOT,
    r_relative: R_AARCH64_RELATIVE,
    r_irelative: R_AARCH64_IRELATIVE,
    r_abs: R_AARCH64_ABS64,
    r_dtpmod: R_AARCH64_TLS_DTPMOD64,
    r_dtpoff: R_AARCH64_TLS_DTPREL64,
    r_tpoff: R_AARCH64_TLS_TPREL64,
    r_tlsdesc: R_AARCH64_TLSDESC,
    branch_reach: 1 << 27,
    thunk_size: 12,
    thunk_hdr_size: 0,
    filler: &[0x00, 0x7d, 0x20, 0xd4], // brk #0x3e8
};

pub struct Aarch64;

fn read32(out: &[u8], loc: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&out[loc..loc + 4]);
    u32::from_le_bytes(bytes)
}

fn put32(out: &mut [u8], loc: usize, val: u32) {
    out[loc..loc + 4].copy_from_slice(&val.to_le_bytes());
}

fn put64(out: &mut [u8], loc: usize, val: u64) {
    out[loc..loc + 8].copy_from_slice(&val.to_le_bytes());
}

fn put16(out: &mut [u8], loc: usize, val: u16) {
    out[loc..loc + 2].copy_from_slice(&val.to_le_bytes());
}

fn page(addr: u64) -> u64 {
    addr & !0xfff
}

/// Patch the 21-bit page immediate of an ADRP
fn write_adrp(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc);
    word &= !((0x7ffff << 5) | (0x3 << 29));
    let imm = (val >> 12) as u32;
    word |= (imm & 0x3) << 29;
    word |= ((imm >> 2) & 0x7ffff) << 5;
    put32(out, loc, word);
}

/// Patch the 21-bit byte immediate of an ADR
fn write_adr(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc);
    word &= !((0x7ffff << 5) | (0x3 << 29));
    word |= ((val & 0x3) as u32) << 29;
    word |= (((val >> 2) & 0x7ffff) as u32) << 5;
    put32(out, loc, word);
}

/// Patch the 12-bit unsigned immediate of an ADD/LDR/STR
fn write_imm12(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc);
    word &= !(0xfff << 10);
    word |= ((val & 0xfff) as u32) << 10;
    put32(out, loc, word);
}

/// Patch the 16-bit immediate of a MOVZ/MOVK
fn write_movw(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc);
    word &= !(0xffff << 5);
    word |= ((val & 0xffff) as u32) << 5;
    put32(out, loc, word);
}

fn write_branch26(out: &mut [u8], loc: usize, val: i64) {
    let mut word = read32(out, loc);
    word &= !0x03ff_ffff;
    word |= ((val >> 2) as u32) & 0x03ff_ffff;
    put32(out, loc, word);
}

impl Target for Aarch64 {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn rel_name(&self, r_type: u32) -> Option<&'static str> {
        rel_name(r_type)
    }

    fn is_abs_rel(&self, r_type: u32) -> bool {
        r_type == R_AARCH64_ABS64
    }

    fn is_branch_reloc(&self, r_type: u32) -> bool {
        matches!(
            r_type,
            R_AARCH64_CALL26 | R_AARCH64_JUMP26 | R_AARCH64_CONDBR19 | R_AARCH64_TSTBR14
        )
    }

    fn scan_relocations(&self, cx: &mut Context, fid: u32, shndx: u32) -> Result<()> {
        let r = SectionRef { file: fid, shndx };
        let rels: Vec<Rel> = cx.objs[fid as usize].section_rels(cx.isec(r)).to_vec();

        for rel in &rels {
            if rel.r_type == R_NONE {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];

            if cx.sym(id).is_ifunc() {
                cx.sym(id).set_flags(NEEDS_GOT | NEEDS_PLT);
            }

            match rel.r_type {
                R_AARCH64_ABS16 | R_AARCH64_ABS32 | R_AARCH64_MOVW_UABS_G0
                | R_AARCH64_MOVW_UABS_G0_NC | R_AARCH64_MOVW_UABS_G1
                | R_AARCH64_MOVW_UABS_G1_NC | R_AARCH64_MOVW_UABS_G2
                | R_AARCH64_MOVW_UABS_G2_NC | R_AARCH64_MOVW_UABS_G3 => {
                    scan::do_action(cx, &ABSREL_TABLE, fid, shndx, rel, id);
                    scan::mark_frag_32bit(cx, fid, rel);
                }
                R_AARCH64_PREL16 | R_AARCH64_PREL32 | R_AARCH64_PREL64
                | R_AARCH64_ADR_PREL_LO21 | R_AARCH64_ADR_PREL_PG_HI21
                | R_AARCH64_ADR_PREL_PG_HI21_NC => {
                    scan::do_action(cx, &PCREL_TABLE, fid, shndx, rel, id);
                }
                R_AARCH64_CALL26 | R_AARCH64_JUMP26 | R_AARCH64_CONDBR19 | R_AARCH64_TSTBR14 => {
                    if cx.sym(id).is_imported {
                        cx.sym(id).set_flags(NEEDS_PLT);
                    }
                }
                R_AARCH64_ADR_GOT_PAGE | R_AARCH64_LD64_GOT_LO12_NC
                | R_AARCH64_LD64_GOTPAGE_LO15 => {
                    cx.sym(id).set_flags(NEEDS_GOT);
                }
                R_AARCH64_TLSGD_ADR_PAGE21 | R_AARCH64_TLSGD_ADD_LO12_NC => {
                    cx.sym(id).set_flags(NEEDS_TLSGD);
                }
                R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 | R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                    cx.sym(id).set_flags(NEEDS_GOTTP);
                }
                R_AARCH64_TLSDESC_ADR_PAGE21 => {
                    scan::scan_tlsdesc(cx, id);
                }
                R_AARCH64_TLSLE_ADD_TPREL_HI12 | R_AARCH64_TLSLE_ADD_TPREL_LO12
                | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                    scan::check_tlsle(cx, fid, shndx, rel, id);
                }
                R_AARCH64_ABS64
                | R_AARCH64_ADD_ABS_LO12_NC
                | R_AARCH64_LDST8_ABS_LO12_NC
                | R_AARCH64_LDST16_ABS_LO12_NC
                | R_AARCH64_LDST32_ABS_LO12_NC
                | R_AARCH64_LDST64_ABS_LO12_NC
                | R_AARCH64_LDST128_ABS_LO12_NC
                | R_AARCH64_TLSDESC_LD64_LO12
                | R_AARCH64_TLSDESC_ADD_LO12
                | R_AARCH64_TLSDESC_CALL => {}
                ty => {
                    return Err(Error::UnknownRelocation {
                        file: cx.objs[fid as usize].name.clone(),
                        section: cx.isec(r).name.clone(),
                        rel_type: ty,
                    });
                }
            }
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

        for rel in &rels {
            if rel.r_type == R_NONE {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let (s, a) = match cx.get_fragment(fid, rel, rel.r_addend) {
                Some((frag, off)) => (cx.frag_addr(frag), off as u64),
                None => (cx.get_addr(id, 0), rel.r_addend as u64),
            };
            let p = base_addr + rel.r_offset;

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, rel, val, lo, hi);

            match rel.r_type {
                R_AARCH64_ABS16 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 16)?;
                    put16(out, loc, val as u16);
                }
                R_AARCH64_ABS32 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_AARCH64_ABS64 => {
                    // Emitted with the output section's absolute records.
                }
                R_AARCH64_PREL16 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 15), 1 << 15)?;
                    put16(out, loc, val as u16);
                }
                R_AARCH64_PREL32 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 31), 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_AARCH64_PREL64 => {
                    put64(out, loc, s.wrapping_add(a).wrapping_sub(p));
                }
                R_AARCH64_ADR_PREL_LO21 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 20), 1 << 20)?;
                    write_adr(out, loc, val as u64);
                }
                R_AARCH64_ADR_PREL_PG_HI21 | R_AARCH64_ADR_PREL_PG_HI21_NC => {
                    let val = page(s.wrapping_add(a)).wrapping_sub(page(p)) as i64;
                    if rel.r_type == R_AARCH64_ADR_PREL_PG_HI21 {
                        check(val, -(1i64 << 32), 1i64 << 32)?;
                    }
                    write_adrp(out, loc, val as u64);
                }
                R_AARCH64_ADD_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a));
                }
                R_AARCH64_LDST8_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a));
                }
                R_AARCH64_LDST16_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a) >> 1);
                }
                R_AARCH64_LDST32_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a) >> 2);
                }
                R_AARCH64_LDST64_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a) >> 3);
                }
                R_AARCH64_LDST128_ABS_LO12_NC => {
                    write_imm12(out, loc, s.wrapping_add(a) >> 4);
                }
                R_AARCH64_MOVW_UABS_G0 | R_AARCH64_MOVW_UABS_G0_NC => {
                    if rel.r_type == R_AARCH64_MOVW_UABS_G0 {
                        check(s.wrapping_add(a) as i64, 0, 1 << 16)?;
                    }
                    write_movw(out, loc, s.wrapping_add(a));
                }
                R_AARCH64_MOVW_UABS_G1 | R_AARCH64_MOVW_UABS_G1_NC => {
                    if rel.r_type == R_AARCH64_MOVW_UABS_G1 {
                        check(s.wrapping_add(a) as i64, 0, 1i64 << 32)?;
                    }
                    write_movw(out, loc, s.wrapping_add(a) >> 16);
                }
                R_AARCH64_MOVW_UABS_G2 | R_AARCH64_MOVW_UABS_G2_NC => {
                    if rel.r_type == R_AARCH64_MOVW_UABS_G2 {
                        check(s.wrapping_add(a) as i64, 0, 1i64 << 48)?;
                    }
                    write_movw(out, loc, s.wrapping_add(a) >> 32);
                }
                R_AARCH64_MOVW_UABS_G3 => {
                    write_movw(out, loc, s.wrapping_add(a) >> 48);
                }
                R_AARCH64_CONDBR19 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 20), 1 << 20)?;
                    let mut word = read32(out, loc);
                    word &= !(0x7ffff << 5);
                    word |= (((val >> 2) as u32) & 0x7ffff) << 5;
                    put32(out, loc, word);
                }
                R_AARCH64_TSTBR14 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 15), 1 << 15)?;
                    let mut word = read32(out, loc);
                    word &= !(0x3fff << 5);
                    word |= (((val >> 2) as u32) & 0x3fff) << 5;
                    put32(out, loc, word);
                }
                R_AARCH64_CALL26 | R_AARCH64_JUMP26 => {
                    let mut target = s.wrapping_add(a);
                    let mut val = target.wrapping_sub(p) as i64;
                    let reach = INFO.branch_reach as i64;
                    if (val < -reach || val >= reach) && cx.sym(id).file.is_some() {
                        if let Some(thunk) = cx.thunk_addr(id, p) {
                            target = thunk;
                            val = target.wrapping_sub(p) as i64;
                        }
                    }
                    check(val, -reach, reach)?;
                    write_branch26(out, loc, val);
                }
                R_AARCH64_ADR_GOT_PAGE => {
                    let val = page(cx.got_addr(id).wrapping_add(a)).wrapping_sub(page(p));
                    write_adrp(out, loc, val);
                }
                R_AARCH64_LD64_GOT_LO12_NC => {
                    write_imm12(out, loc, cx.got_addr(id).wrapping_add(a) >> 3);
                }
                R_AARCH64_LD64_GOTPAGE_LO15 => {
                    let got = cx.chunk_addr(cx.refs.got);
                    let val = cx.got_addr(id).wrapping_add(a).wrapping_sub(page(got));
                    check(val as i64, 0, 1 << 15)?;
                    let mut word = read32(out, loc);
                    word &= !(0xfff << 10);
                    word |= (((val >> 3) as u32) & 0xfff) << 10;
                    put32(out, loc, word);
                }
                R_AARCH64_TLSGD_ADR_PAGE21 => {
                    let val = page(cx.tlsgd_addr(id).wrapping_add(a)).wrapping_sub(page(p));
                    write_adrp(out, loc, val);
                }
                R_AARCH64_TLSGD_ADD_LO12_NC => {
                    write_imm12(out, loc, cx.tlsgd_addr(id).wrapping_add(a));
                }
                R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                    let val = page(cx.gottp_addr(id).wrapping_add(a)).wrapping_sub(page(p));
                    write_adrp(out, loc, val);
                }
                R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                    write_imm12(out, loc, cx.gottp_addr(id).wrapping_add(a) >> 3);
                }
                R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                    let val = s.wrapping_add(a).wrapping_sub(cx.tp_addr);
                    check(val as i64, 0, 1i64 << 24)?;
                    write_imm12(out, loc, val >> 12);
                }
                R_AARCH64_TLSLE_ADD_TPREL_LO12 | R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                    let val = s.wrapping_add(a).wrapping_sub(cx.tp_addr);
                    if rel.r_type == R_AARCH64_TLSLE_ADD_TPREL_LO12 {
                        check(val as i64, 0, 1 << 12)?;
                    }
                    write_imm12(out, loc, val);
                }
                R_AARCH64_TLSDESC_ADR_PAGE21 => {
                    if cx.has_tlsdesc(id) {
                        let val = page(cx.tlsdesc_addr(id).wrapping_add(a)).wrapping_sub(page(p));
                        write_adrp(out, loc, val);
                    } else if cx.has_gottp(id) {
                        let val = page(cx.gottp_addr(id).wrapping_add(a)).wrapping_sub(page(p));
                        write_adrp(out, loc, val);
                    } else {
                        // movz x0, #:tprel_g1:
                        let val = s.wrapping_add(a).wrapping_sub(cx.tp_addr);
                        put32(out, loc, 0xd2a0_0000 | ((((val >> 16) & 0xffff) as u32) << 5));
                    }
                }
                R_AARCH64_TLSDESC_LD64_LO12 => {
                    if cx.has_tlsdesc(id) {
                        write_imm12(out, loc, cx.tlsdesc_addr(id).wrapping_add(a) >> 3);
                    } else if cx.has_gottp(id) {
                        write_imm12(out, loc, cx.gottp_addr(id).wrapping_add(a) >> 3);
                    } else {
                        // movk x0, #:tprel_g0_nc:
                        let val = s.wrapping_add(a).wrapping_sub(cx.tp_addr);
                        put32(out, loc, 0xf280_0000 | (((val & 0xffff) as u32) << 5));
                    }
                }
                R_AARCH64_TLSDESC_ADD_LO12 => {
                    if cx.has_tlsdesc(id) {
                        write_imm12(out, loc, cx.tlsdesc_addr(id).wrapping_add(a));
                    } else {
                        put32(out, loc, 0xd503_201f); // nop
                    }
                }
                R_AARCH64_TLSDESC_CALL => {
                    if !cx.has_tlsdesc(id) {
                        put32(out, loc, 0xd503_201f); // nop
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

        for rel in &rels {
            if rel.r_type == R_NONE {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let frag = cx.get_fragment(fid, rel, rel.r_addend);
            let (s, a) = match frag {
                Some((f, addend)) => (cx.frag_addr(f), addend as u64),
                None => (cx.get_addr(id, 0), rel.r_addend as u64),
            };
            let tomb = cx.get_tombstone(&referer, id, frag.map(|(f, _)| f));

            match rel.r_type {
                R_AARCH64_ABS16 => put16(out, loc, s.wrapping_add(a) as u16),
                R_AARCH64_ABS32 => match tomb {
                    Some(v) => put32(out, loc, v as u32),
                    None => put32(out, loc, s.wrapping_add(a) as u32),
                },
                R_AARCH64_ABS64 => match tomb {
                    Some(v) => put64(out, loc, v),
                    None => put64(out, loc, s.wrapping_add(a)),
                },
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
        // stp x16, x30, [sp, #-16]!; the resolver needs gotplt[2].
        const INSN: [u32; 8] = [
            0xa9bf_7bf0, // stp x16, x30, [sp, #-16]!
            0x9000_0010, // adrp x16, .got.plt[2]
            0xf940_0211, // ldr x17, [x16, lo12]
            0x9100_0210, // add x16, x16, lo12
            0xd61f_0220, // br x17
            0xd503_201f, // nop
            0xd503_201f, // nop
            0xd503_201f, // nop
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let gotplt = cx.chunk_addr(cx.refs.gotplt) + 16;
        let plt = cx.chunk_addr(cx.refs.plt);
        write_adrp(buf, 4, page(gotplt).wrapping_sub(page(plt + 4)));
        write_imm12(buf, 8, gotplt >> 3);
        write_imm12(buf, 12, gotplt);
    }

    fn write_plt_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0x9000_0010, // adrp x16, foo@.got.plt
            0xf940_0211, // ldr x17, [x16, lo12]
            0x9100_0210, // add x16, x16, lo12
            0xd61f_0220, // br x17
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let gotplt = cx.gotplt_addr(sym);
        let plt = cx.plt_addr(sym);
        write_adrp(buf, 0, page(gotplt).wrapping_sub(page(plt)));
        write_imm12(buf, 4, gotplt >> 3);
        write_imm12(buf, 8, gotplt);
    }

    fn write_pltgot_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0x9000_0010, // adrp x16, foo@.got
            0xf940_0211, // ldr x17, [x16, lo12]
            0xd61f_0220, // br x17
            0xd503_201f, // nop
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let got = cx.got_addr(sym);
        let plt = cx.plt_addr(sym);
        write_adrp(buf, 0, page(got).wrapping_sub(page(plt)));
        write_imm12(buf, 4, got >> 3);
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
            R_AARCH64_ABS64 => put64(out, loc, val),
            R_AARCH64_ABS32 => put32(out, loc, val as u32),
            R_AARCH64_PREL64 => put64(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset)),
            R_AARCH64_PREL32 => {
                put32(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset) as u32)
            }
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

    fn write_thunk_entry(&self, cx: &Context, buf: &mut [u8], entry_addr: u64, sym: SymbolId) {
        const INSN: [u32; 3] = [
            0x9000_0010, // adrp x16, sym
            0x9100_0210, // add x16, x16, lo12
            0xd61f_0200, // br x16
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let target = cx.get_addr(sym, 0);
        write_adrp(buf, 0, page(target).wrapping_sub(page(entry_addr)));
        write_imm12(buf, 4, target);
    }

    fn tp_addr(&self, p_vaddr: u64, _p_memsz: u64, p_align: u64) -> u64 {
        // Variant 1: a 16-byte TCB sits right below the TLS block.
        let tcb = (16 + p_align.max(1) - 1) & !(p_align.max(1) - 1);
        p_vaddr - tcb
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::arch::bits;

    #[test]
    fn test_adrp_encoding() {
        let mut buf = vec![0u8; 4];
        put32(&mut buf, 0, 0x9000_0010); // adrp x16, 0
        write_adrp(&mut buf, 0, 0x3000);
        let word = read32(&buf, 0);
        // imm = 3: immlo = 3 & 3, immhi = 0
        assert_eq!(bits(word as u64, 30, 29), 3);
        assert_eq!(bits(word as u64, 23, 5), 0);

        write_adrp(&mut buf, 0, 0x10000);
        let word = read32(&buf, 0);
        assert_eq!(bits(word as u64, 30, 29), 0);
        assert_eq!(bits(word as u64, 23, 5), 4);
    }

    #[test]
    fn test_branch26_encoding() {
        let mut buf = vec![0u8; 4];
        put32(&mut buf, 0, 0x9400_0000); // bl 0
        write_branch26(&mut buf, 0, 0x1000);
        assert_eq!(read32(&buf, 0), 0x9400_0400);
        write_branch26(&mut buf, 0, -4);
        assert_eq!(read32(&buf, 0), 0x97ff_ffff);
    }

    #[test]
    fn test_tp_sits_below_the_block() {
        let t = Aarch64;
        assert_eq!(t.tp_addr(0x10000, 0x100, 8), 0x10000 - 16);
        assert_eq!(t.tp_addr(0x10000, 0x100, 64), 0x10000 - 64);
    }
}
