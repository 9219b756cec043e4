//! RISC-V 64 backend
//!
//! RISC-V addresses far data with AUIPC/load pairs: the `PCREL_LO12`
//! relocation does not point at its target directly but at the location
//! of the companion `*_HI20`, whose value supplies the upper bits. The
//! psABI also defines in-place ADD/SUB/SET arithmetic relocations that
//! debug info and jump tables rely on.
//!
//! `R_RISCV_RELAX` marks instruction pairs the linker may shrink; we keep
//! the conservative code the compiler emitted, which also keeps every
//! `R_RISCV_ALIGN` request satisfied by the padding already present.

use crate::arch::{bits, check_range, define_rels, Target, TargetInfo};
use crate::context::Context;
use crate::elf::{Class, Endian, Machine, Rel, R_NONE};
use crate::error::{Error, Result};
use crate::scan::{self, ABSREL_TABLE, PCREL_TABLE};
use crate::symbol::{SectionRef, SymbolId, NEEDS_GOT, NEEDS_GOTTP, NEEDS_PLT, NEEDS_TLSGD};

define_rels!(
    RISCV,
    NONE = 0,
    ABS32 as "R_RISCV_32" = 1,
    ABS64 as "R_RISCV_64" = 2,
    RELATIVE = 3,
    COPY = 4,
    JUMP_SLOT = 5,
    TLS_DTPMOD64 = 7,
    TLS_DTPREL64 = 9,
    TLS_TPREL64 = 11,
    BRANCH = 16,
    JAL = 17,
    CALL = 18,
    CALL_PLT = 19,
    GOT_HI20 = 20,
    TLS_GOT_HI20 = 21,
    TLS_GD_HI20 = 22,
    PCREL_HI20 = 23,
    PCREL_LO12_I = 24,
    PCREL_LO12_S = 25,
    HI20 = 26,
    LO12_I = 27,
    LO12_S = 28,
    TPREL_HI20 = 29,
    TPREL_LO12_I = 30,
    TPREL_LO12_S = 31,
    TPREL_ADD = 32,
    ADD8 = 33,
    ADD16 = 34,
    ADD32 = 35,
    ADD64 = 36,
    SUB8 = 37,
    SUB16 = 38,
    SUB32 = 39,
    SUB64 = 40,
    ALIGN = 43,
    RVC_BRANCH = 44,
    RVC_JUMP = 45,
    RELAX = 51,
    SUB6 = 52,
    SET6 = 53,
    SET8 = 54,
    SET16 = 55,
    SET32 = 56,
    PCREL32 as "R_RISCV_32_PCREL" = 57,
    IRELATIVE = 58,
    PLT32 = 59,
);

pub static TARGET: Riscv64 = Riscv64;

static INFO: TargetInfo = TargetInfo {
    machine: Machine::Riscv,
    class: Class::Elf64,
    endian: Endian::Little,
    page_size: 4096,
    default_image_base: 0x10000,
    is_rela: true,
    supports_tlsdesc: false,
    plt_hdr_size: 32,
    plt_size: 16,
    pltgot_size: 16,
    r_copy: R_RISCV_COPY,
    r_glob_dat: R_RISCV_ABS64,
    r_jump_slot: R_RISCV_JUMP_SLOT,
    r_relative: R_RISCV_RELATIVE,
    r_irelative: R_RISCV_IRELATIVE,
    r_abs: R_RISCV_ABS64,
    r_dtpmod: R_RISCV_TLS_DTPMOD64,
    r_dtpoff: R_RISCV_TLS_DTPREL64,
    r_tpoff: R_RISCV_TLS_TPREL64,
    r_tlsdesc: R_NONE,
    branch_reach: 0,
    thunk_size: 0,
    thunk_hdr_size: 0,
    filler: &[0x73, 0x00, 0x10, 0x00], // ebreak
};

pub struct Riscv64;

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

/// U-type: AUIPC/LUI upper-20 immediate. The +0x800 compensates for the
/// sign extension of the companion low-12 immediate.
fn write_utype(out: &mut [u8], loc: usize, val: u64) {
    let word = read32(out, loc) & 0xfff;
    put32(out, loc, word | ((val.wrapping_add(0x800) as u32) & 0xffff_f000));
}

fn write_itype(out: &mut [u8], loc: usize, val: u64) {
    let word = read32(out, loc) & 0x000f_ffff;
    put32(out, loc, word | (((val & 0xfff) as u32) << 20));
}

fn write_stype(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc) & !0xfe00_0f80u32;
    word |= (bits(val, 11, 5) as u32) << 25;
    word |= (bits(val, 4, 0) as u32) << 7;
    put32(out, loc, word);
}

fn write_btype(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc) & !0xfe00_0f80u32;
    word |= (crate::arch::bit(val, 12) as u32) << 31;
    word |= (bits(val, 10, 5) as u32) << 25;
    word |= (bits(val, 4, 1) as u32) << 8;
    word |= (crate::arch::bit(val, 11) as u32) << 7;
    put32(out, loc, word);
}

fn write_jtype(out: &mut [u8], loc: usize, val: u64) {
    let mut word = read32(out, loc) & 0xfff;
    word |= (crate::arch::bit(val, 20) as u32) << 31;
    word |= (bits(val, 10, 1) as u32) << 21;
    word |= (crate::arch::bit(val, 11) as u32) << 20;
    word |= (bits(val, 19, 12) as u32) << 12;
    put32(out, loc, word);
}

fn write_cbtype(out: &mut [u8], loc: usize, val: u64) {
    let mut word = (read32(out, loc) as u16) & 0xe383;
    word |= (crate::arch::bit(val, 8) as u16) << 12;
    word |= (bits(val, 4, 3) as u16) << 10;
    word |= (bits(val, 7, 6) as u16) << 5;
    word |= (bits(val, 2, 1) as u16) << 3;
    word |= (crate::arch::bit(val, 5) as u16) << 2;
    put16(out, loc, word);
}

fn write_cjtype(out: &mut [u8], loc: usize, val: u64) {
    let mut word = (read32(out, loc) as u16) & 0xe003;
    word |= (crate::arch::bit(val, 11) as u16) << 12;
    word |= (crate::arch::bit(val, 4) as u16) << 11;
    word |= (bits(val, 9, 8) as u16) << 9;
    word |= (crate::arch::bit(val, 10) as u16) << 8;
    word |= (crate::arch::bit(val, 6) as u16) << 7;
    word |= (crate::arch::bit(val, 7) as u16) << 6;
    word |= (bits(val, 3, 1) as u16) << 3;
    word |= (crate::arch::bit(val, 5) as u16) << 2;
    put16(out, loc, word);
}

impl Riscv64 {
    /// `PCREL_LO12` refers to the address of its companion HI20; find
    /// that relocation and recompute its value.
    fn find_hi20_value(
        &self,
        cx: &Context,
        fid: u32,
        isec: &crate::input::InputSection,
        hi_addr: u64,
        base_addr: u64,
    ) -> Option<u64> {
        let file = &cx.objs[fid as usize];
        for rel in file.section_rels(isec) {
            if base_addr + rel.r_offset != hi_addr {
                continue;
            }
            let id = file.symbols[rel.r_sym as usize];
            let s = cx.get_addr(id, 0);
            let a = rel.r_addend as u64;
            return match rel.r_type {
                R_RISCV_PCREL_HI20 => Some(s.wrapping_add(a).wrapping_sub(hi_addr)),
                R_RISCV_GOT_HI20 => Some(cx.got_addr(id).wrapping_sub(hi_addr)),
                R_RISCV_TLS_GOT_HI20 => Some(cx.gottp_addr(id).wrapping_sub(hi_addr)),
                R_RISCV_TLS_GD_HI20 => Some(cx.tlsgd_addr(id).wrapping_sub(hi_addr)),
                _ => None,
            };
        }
        None
    }
}

impl Target for Riscv64 {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn rel_name(&self, r_type: u32) -> Option<&'static str> {
        rel_name(r_type)
    }

    fn is_abs_rel(&self, r_type: u32) -> bool {
        r_type == R_RISCV_ABS64
    }

    fn is_branch_reloc(&self, r_type: u32) -> bool {
        matches!(
            r_type,
            R_RISCV_CALL | R_RISCV_CALL_PLT | R_RISCV_JAL | R_RISCV_PLT32
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
                R_RISCV_ABS32 | R_RISCV_HI20 => {
                    scan::do_action(cx, &ABSREL_TABLE, fid, shndx, rel, id);
                    scan::mark_frag_32bit(cx, fid, rel);
                }
                R_RISCV_PCREL32 | R_RISCV_PCREL_HI20 => {
                    scan::do_action(cx, &PCREL_TABLE, fid, shndx, rel, id);
                }
                R_RISCV_CALL | R_RISCV_CALL_PLT | R_RISCV_PLT32 => {
                    if cx.sym(id).is_imported {
                        cx.sym(id).set_flags(NEEDS_PLT);
                    }
                }
                R_RISCV_GOT_HI20 => {
                    cx.sym(id).set_flags(NEEDS_GOT);
                }
                R_RISCV_TLS_GOT_HI20 => {
                    cx.sym(id).set_flags(NEEDS_GOTTP);
                }
                R_RISCV_TLS_GD_HI20 => {
                    cx.sym(id).set_flags(NEEDS_TLSGD);
                }
                R_RISCV_TPREL_HI20 | R_RISCV_TPREL_LO12_I | R_RISCV_TPREL_LO12_S => {
                    scan::check_tlsle(cx, fid, shndx, rel, id);
                }
                R_RISCV_ABS64
                | R_RISCV_BRANCH
                | R_RISCV_JAL
                | R_RISCV_PCREL_LO12_I
                | R_RISCV_PCREL_LO12_S
                | R_RISCV_LO12_I
                | R_RISCV_LO12_S
                | R_RISCV_TPREL_ADD
                | R_RISCV_ADD8
                | R_RISCV_ADD16
                | R_RISCV_ADD32
                | R_RISCV_ADD64
                | R_RISCV_SUB8
                | R_RISCV_SUB16
                | R_RISCV_SUB32
                | R_RISCV_SUB64
                | R_RISCV_ALIGN
                | R_RISCV_RVC_BRANCH
                | R_RISCV_RVC_JUMP
                | R_RISCV_RELAX
                | R_RISCV_SUB6
                | R_RISCV_SET6
                | R_RISCV_SET8
                | R_RISCV_SET16
                | R_RISCV_SET32
                | R_RISCV_TLS_DTPREL64 => {}
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
            if rel.r_type == R_NONE || rel.r_type == R_RISCV_RELAX || rel.r_type == R_RISCV_ALIGN
            {
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
                R_RISCV_ABS32 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_RISCV_ABS64 => {
                    // Emitted with the output section's absolute records.
                }
                R_RISCV_BRANCH => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 12), 1 << 12)?;
                    write_btype(out, loc, val as u64);
                }
                R_RISCV_JAL => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 20), 1 << 20)?;
                    write_jtype(out, loc, val as u64);
                }
                R_RISCV_CALL | R_RISCV_CALL_PLT => {
                    // AUIPC at `loc`, JALR right after.
                    let val = s.wrapping_add(a).wrapping_sub(p);
                    check(val as i64, -(1i64 << 31), 1i64 << 31)?;
                    write_utype(out, loc, val);
                    write_itype(out, loc + 4, val);
                }
                R_RISCV_GOT_HI20 => {
                    let val = cx.got_addr(id).wrapping_add(a).wrapping_sub(p);
                    write_utype(out, loc, val);
                }
                R_RISCV_TLS_GOT_HI20 => {
                    let val = cx.gottp_addr(id).wrapping_add(a).wrapping_sub(p);
                    write_utype(out, loc, val);
                }
                R_RISCV_TLS_GD_HI20 => {
                    let val = cx.tlsgd_addr(id).wrapping_add(a).wrapping_sub(p);
                    write_utype(out, loc, val);
                }
                R_RISCV_PCREL_HI20 => {
                    let val = s.wrapping_add(a).wrapping_sub(p);
                    check(val as i64, -(1i64 << 31), 1i64 << 31)?;
                    write_utype(out, loc, val);
                }
                R_RISCV_PCREL_LO12_I | R_RISCV_PCREL_LO12_S => {
                    // S here is the address of the companion HI20.
                    let hi_addr = s.wrapping_add(a);
                    let val = self
                        .find_hi20_value(cx, fid, isec, hi_addr, base_addr)
                        .ok_or_else(|| Error::BadRelocation {
                            file: cx.objs[fid as usize].name.clone(),
                            section: isec.name.clone(),
                            offset: rel.r_offset,
                            message: "PCREL_LO12 without a companion HI20".into(),
                        })?;
                    if rel.r_type == R_RISCV_PCREL_LO12_I {
                        write_itype(out, loc, val);
                    } else {
                        write_stype(out, loc, val);
                    }
                }
                R_RISCV_HI20 => {
                    let val = s.wrapping_add(a);
                    check(val as i64, -(1i64 << 31), 1i64 << 31)?;
                    write_utype(out, loc, val);
                }
                R_RISCV_LO12_I => write_itype(out, loc, s.wrapping_add(a)),
                R_RISCV_LO12_S => write_stype(out, loc, s.wrapping_add(a)),
                R_RISCV_TPREL_HI20 => {
                    write_utype(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr));
                }
                R_RISCV_TPREL_LO12_I => {
                    write_itype(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr));
                }
                R_RISCV_TPREL_LO12_S => {
                    write_stype(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr));
                }
                R_RISCV_TPREL_ADD => {
                    // Marker for the linker-relaxable TP addition; nothing
                    // to patch when we keep the full sequence.
                }
                R_RISCV_ADD8 => out[loc] = out[loc].wrapping_add(s.wrapping_add(a) as u8),
                R_RISCV_ADD16 => {
                    let cur = u16::from_le_bytes([out[loc], out[loc + 1]]);
                    put16(out, loc, cur.wrapping_add(s.wrapping_add(a) as u16));
                }
                R_RISCV_ADD32 => {
                    let cur = read32(out, loc);
                    put32(out, loc, cur.wrapping_add(s.wrapping_add(a) as u32));
                }
                R_RISCV_ADD64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&out[loc..loc + 8]);
                    let cur = u64::from_le_bytes(bytes);
                    put64(out, loc, cur.wrapping_add(s.wrapping_add(a)));
                }
                R_RISCV_SUB8 => out[loc] = out[loc].wrapping_sub(s.wrapping_add(a) as u8),
                R_RISCV_SUB16 => {
                    let cur = u16::from_le_bytes([out[loc], out[loc + 1]]);
                    put16(out, loc, cur.wrapping_sub(s.wrapping_add(a) as u16));
                }
                R_RISCV_SUB32 => {
                    let cur = read32(out, loc);
                    put32(out, loc, cur.wrapping_sub(s.wrapping_add(a) as u32));
                }
                R_RISCV_SUB64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&out[loc..loc + 8]);
                    let cur = u64::from_le_bytes(bytes);
                    put64(out, loc, cur.wrapping_sub(s.wrapping_add(a)));
                }
                R_RISCV_RVC_BRANCH => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 8), 1 << 8)?;
                    write_cbtype(out, loc, val as u64);
                }
                R_RISCV_RVC_JUMP => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 11), 1 << 11)?;
                    write_cjtype(out, loc, val as u64);
                }
                R_RISCV_SUB6 => {
                    let cur = out[loc] & 0x3f;
                    out[loc] = (out[loc] & 0xc0)
                        | (cur.wrapping_sub(s.wrapping_add(a) as u8) & 0x3f);
                }
                R_RISCV_SET6 => {
                    out[loc] = (out[loc] & 0xc0) | (s.wrapping_add(a) as u8 & 0x3f);
                }
                R_RISCV_SET8 => out[loc] = s.wrapping_add(a) as u8,
                R_RISCV_SET16 => put16(out, loc, s.wrapping_add(a) as u16),
                R_RISCV_SET32 => put32(out, loc, s.wrapping_add(a) as u32),
                R_RISCV_PCREL32 => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_RISCV_PLT32 => {
                    put32(out, loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_RISCV_TLS_DTPREL64 => {
                    put64(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr));
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
                R_RISCV_ABS32 => match tomb {
                    Some(v) => put32(out, loc, v as u32),
                    None => put32(out, loc, s.wrapping_add(a) as u32),
                },
                R_RISCV_ABS64 => match tomb {
                    Some(v) => put64(out, loc, v),
                    None => put64(out, loc, s.wrapping_add(a)),
                },
                R_RISCV_ADD8 => out[loc] = out[loc].wrapping_add(s.wrapping_add(a) as u8),
                R_RISCV_ADD16 => {
                    let cur = u16::from_le_bytes([out[loc], out[loc + 1]]);
                    put16(out, loc, cur.wrapping_add(s.wrapping_add(a) as u16));
                }
                R_RISCV_ADD32 => {
                    let cur = read32(out, loc);
                    put32(out, loc, cur.wrapping_add(s.wrapping_add(a) as u32));
                }
                R_RISCV_ADD64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&out[loc..loc + 8]);
                    put64(
                        out,
                        loc,
                        u64::from_le_bytes(bytes).wrapping_add(s.wrapping_add(a)),
                    );
                }
                R_RISCV_SUB8 => out[loc] = out[loc].wrapping_sub(s.wrapping_add(a) as u8),
                R_RISCV_SUB16 => {
                    let cur = u16::from_le_bytes([out[loc], out[loc + 1]]);
                    put16(out, loc, cur.wrapping_sub(s.wrapping_add(a) as u16));
                }
                R_RISCV_SUB32 => {
                    let cur = read32(out, loc);
                    put32(out, loc, cur.wrapping_sub(s.wrapping_add(a) as u32));
                }
                R_RISCV_SUB64 => {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&out[loc..loc + 8]);
                    put64(
                        out,
                        loc,
                        u64::from_le_bytes(bytes).wrapping_sub(s.wrapping_add(a)),
                    );
                }
                R_RISCV_SUB6 => {
                    let cur = out[loc] & 0x3f;
                    out[loc] = (out[loc] & 0xc0)
                        | (cur.wrapping_sub(s.wrapping_add(a) as u8) & 0x3f);
                }
                R_RISCV_SET6 => {
                    out[loc] = (out[loc] & 0xc0) | (s.wrapping_add(a) as u8 & 0x3f);
                }
                R_RISCV_SET8 => out[loc] = s.wrapping_add(a) as u8,
                R_RISCV_SET16 => put16(out, loc, s.wrapping_add(a) as u16),
                R_RISCV_SET32 => put32(out, loc, s.wrapping_add(a) as u32),
                R_RISCV_TLS_DTPREL64 => match tomb {
                    Some(v) => put64(out, loc, v),
                    None => put64(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr)),
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
        const INSN: [u32; 8] = [
            0x0000_0397, // auipc  t2, %pcrel_hi(.got.plt)
            0x41c3_0333, // sub    t1, t1, t3
            0x0003_be03, // ld     t3, %pcrel_lo(.got.plt)(t2)
            0xfd43_0313, // addi   t1, t1, -44
            0x0003_8293, // addi   t0, t2, %pcrel_lo(.got.plt)
            0x0013_5313, // srli   t1, t1, 1
            0x0082_b283, // ld     t0, 8(t0)
            0x000e_0067, // jr     t3
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let gotplt = cx.chunk_addr(cx.refs.gotplt);
        let plt = cx.chunk_addr(cx.refs.plt);
        let val = gotplt.wrapping_sub(plt);
        write_utype(buf, 0, val);
        write_itype(buf, 8, val);
        write_itype(buf, 16, val);
    }

    fn write_plt_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0x0000_0e17, // auipc  t3, %pcrel_hi(function@.got.plt)
            0x000e_3e03, // ld     t3, %pcrel_lo(function@.got.plt)(t3)
            0x000e_0367, // jalr   t1, t3
            0x0010_0073, // ebreak
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let gotplt = cx.gotplt_addr(sym);
        let plt = cx.plt_addr(sym);
        let val = gotplt.wrapping_sub(plt);
        write_utype(buf, 0, val);
        write_itype(buf, 4, val);
    }

    fn write_pltgot_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0x0000_0e17, // auipc  t3, %pcrel_hi(function@.got)
            0x000e_3e03, // ld     t3, %pcrel_lo(function@.got)(t3)
            0x000e_0067, // jr     t3
            0x0010_0073, // ebreak
        ];
        for (i, w) in INSN.iter().enumerate() {
            put32(buf, i * 4, *w);
        }
        let got = cx.got_addr(sym);
        let plt = cx.plt_addr(sym);
        let val = got.wrapping_sub(plt);
        write_utype(buf, 0, val);
        write_itype(buf, 4, val);
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
            R_RISCV_ABS32 => put32(out, loc, val as u32),
            R_RISCV_ABS64 => put64(out, loc, val),
            R_RISCV_PCREL32 => {
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

    fn tp_addr(&self, p_vaddr: u64, _p_memsz: u64, _p_align: u64) -> u64 {
        p_vaddr
    }

    fn dtp_addr(&self, p_vaddr: u64) -> u64 {
        // The psABI biases DTP-relative offsets by 0x800 so that a 12-bit
        // immediate covers the first 4KiB in both directions.
        p_vaddr + 0x800
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_utype_rounds_toward_lo12() {
        let mut buf = vec![0u8; 4];
        put32(&mut buf, 0, 0x0000_0397); // auipc t2, 0
        write_utype(&mut buf, 0, 0x1800);
        assert_eq!(read32(&buf, 0) >> 12, 0x2); // 0x1800 + 0x800 carries
        write_utype(&mut buf, 0, 0x17ff);
        assert_eq!(read32(&buf, 0) >> 12, 0x1);
    }

    #[test]
    fn test_branch_encodings() {
        let mut buf = vec![0u8; 4];
        put32(&mut buf, 0, 0x0000_0063); // beq x0, x0, 0
        write_btype(&mut buf, 0, 8);
        // imm[4:1] = 0b0100 at bits 8..11
        assert_eq!((read32(&buf, 0) >> 8) & 0xf, 0b0100);

        put32(&mut buf, 0, 0x0000_006f); // jal x0, 0
        write_jtype(&mut buf, 0, 0x800);
        assert_eq!(crate::arch::bit(read32(&buf, 0) as u64, 20), 1);
    }
}
