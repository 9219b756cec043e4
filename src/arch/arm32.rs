//! ARM32 backend
//!
//! ARM supports the 32-bit ARM and 16-bit Thumb instruction sets, and a
//! function pointer's bit 0 records which one the target uses. Direct
//! branches cannot switch mode by themselves except BL/BLX, so the linker
//! emits interworking thunks with one Thumb and one ARM entry point. The
//! same thunk islands carry the shared TLSDESC trampoline the psABI
//! expects the linker to synthesize.
//!
//! Exception handling uses `.ARM.exidx`, a sorted table of PREL31 address
//! ranges, instead of `.eh_frame_hdr`. Big-endian output uses the BE8
//! format: data big-endian, instructions little-endian, with the byte
//! swapping driven by `$a`/`$t`/`$d` mapping symbols.

use std::sync::atomic::Ordering;

use crate::arch::{bit, bits, check_range, define_rels, is_int, sign_extend, Target, TargetInfo};
use crate::context::Context;
use crate::elf::{Class, Encoding, Endian, Machine, Rel, R_NONE, SHF_EXECINSTR, SHT_ARM_EXIDX};
use crate::error::{Error, Result};
use crate::input::MapKind;
use crate::output::ChunkKind;
use crate::scan::{self, ABSREL_TABLE, PCREL_TABLE};
use crate::symbol::{SectionRef, SymbolId, NEEDS_GOT, NEEDS_GOTTP, NEEDS_PLT, NEEDS_TLSGD};

define_rels!(
    ARM,
    NONE = 0,
    ABS32 = 2,
    REL32 = 3,
    ABS16 = 5,
    ABS8 = 8,
    THM_CALL = 10,
    TLS_DTPMOD32 = 17,
    TLS_DTPOFF32 = 18,
    TLS_TPOFF32 = 19,
    COPY = 20,
    GLOB_DAT = 21,
    JUMP_SLOT = 22,
    RELATIVE = 23,
    GOTOFF32 = 24,
    BASE_PREL = 25,
    GOT_BREL = 26,
    PLT32 = 27,
    CALL = 28,
    JUMP24 = 29,
    THM_JUMP24 = 30,
    TARGET1 = 38,
    V4BX = 40,
    TARGET2 = 41,
    PREL31 = 42,
    MOVW_ABS_NC = 43,
    MOVT_ABS = 44,
    MOVW_PREL_NC = 45,
    MOVT_PREL = 46,
    THM_MOVW_ABS_NC = 47,
    THM_MOVT_ABS = 48,
    THM_MOVW_PREL_NC = 49,
    THM_MOVT_PREL = 50,
    THM_JUMP19 = 51,
    TLS_GOTDESC = 90,
    TLS_CALL = 91,
    THM_TLS_CALL = 93,
    GOT_PREL = 96,
    THM_JUMP11 = 102,
    THM_JUMP8 = 103,
    TLS_GD32 = 104,
    TLS_LDM32 = 105,
    TLS_LDO32 = 106,
    TLS_IE32 = 107,
    TLS_LE32 = 108,
    TLS_DESC = 13,
    IRELATIVE = 160,
);

pub static TARGET: Arm32 = Arm32 { be8: false };
pub static TARGET_BE: Arm32 = Arm32 { be8: true };

static INFO: TargetInfo = base_info();

// BE8: data is big-endian while instructions stay little-endian; the
// encoding here governs data.
static INFO_BE: TargetInfo = TargetInfo {
    endian: Endian::Big,
    ..base_info()
};

const fn base_info() -> TargetInfo {
    TargetInfo {
        machine: Machine::Arm32,
        class: Class::Elf32,
        endian: Endian::Little,
        page_size: 4096,
        default_image_base: 0x10000,
        is_rela: false,
        supports_tlsdesc: true,
        plt_hdr_size: 32,
        plt_size: 16,
        pltgot_size: 16,
        r_copy: R_ARM_COPY,
        r_glob_dat: R_ARM_GLOB_DAT,
        r_jump_slot: R_ARM_JUMP_SLOT,
        r_relative: R_ARM_RELATIVE,
        r_irelative: R_ARM_IRELATIVE,
        r_abs: R_ARM_ABS32,
        r_dtpmod: R_ARM_TLS_DTPMOD32,
        r_dtpoff: R_ARM_TLS_DTPOFF32,
        r_tpoff: R_ARM_TLS_TPOFF32,
        r_tlsdesc: R_ARM_TLS_DESC,
        branch_reach: 1 << 24,
        thunk_size: 16,
        thunk_hdr_size: 16,
        filler: &[0xfe, 0xde, 0xff, 0xe7], // udf
    }
}

pub struct Arm32 {
    be8: bool,
}

impl Arm32 {
    fn enc(&self) -> Encoding {
        self.info().encoding()
    }

    fn read32(&self, out: &[u8], loc: usize) -> u32 {
        self.enc().u32_at(out, loc).unwrap_or(0)
    }

    fn read16(&self, out: &[u8], loc: usize) -> u16 {
        self.enc().u16_at(out, loc).unwrap_or(0)
    }

    fn put32(&self, out: &mut [u8], loc: usize, val: u32) {
        self.enc().put_u32(out, loc, val);
    }

    fn put16(&self, out: &mut [u8], loc: usize, val: u16) {
        self.enc().put_u16(out, loc, val);
    }

    /// Patch the imm16 of a MOVW/MOVT
    fn write_arm_mov(&self, out: &mut [u8], loc: usize, val: u32) {
        let word = self.read32(out, loc);
        let imm12 = val & 0xfff;
        let imm4 = (val >> 12) & 0xf;
        self.put32(out, loc, (word & 0xfff0_f000) | (imm4 << 16) | imm12);
    }

    /// Patch a 21-bit Thumb conditional branch displacement
    fn write_thm_b21(&self, out: &mut [u8], loc: usize, val: u32) {
        let s = bit(val as u64, 20) as u16;
        let j2 = bit(val as u64, 19) as u16;
        let j1 = bit(val as u64, 18) as u16;
        let imm6 = bits(val as u64, 17, 12) as u16;
        let imm11 = bits(val as u64, 11, 1) as u16;
        let lo = self.read16(out, loc);
        let hi = self.read16(out, loc + 2);
        self.put16(out, loc, (lo & 0b1111_1011_1100_0000) | (s << 10) | imm6);
        self.put16(
            out,
            loc + 2,
            (hi & 0b1101_0000_0000_0000) | (j1 << 13) | (j2 << 11) | imm11,
        );
    }

    /// Patch a 25-bit Thumb BL/BLX displacement
    fn write_thm_b25(&self, out: &mut [u8], loc: usize, val: u32) {
        let s = bit(val as u64, 24) as u16;
        let i1 = bit(val as u64, 23) as u16;
        let i2 = bit(val as u64, 22) as u16;
        let j1 = (i1 ^ 1) ^ s;
        let j2 = (i2 ^ 1) ^ s;
        let imm10 = bits(val as u64, 21, 12) as u16;
        let imm11 = bits(val as u64, 11, 1) as u16;
        let lo = self.read16(out, loc);
        let hi = self.read16(out, loc + 2);
        self.put16(out, loc, (lo & 0b1111_1000_0000_0000) | (s << 10) | imm10);
        self.put16(
            out,
            loc + 2,
            (hi & 0b1101_0000_0000_0000) | (j1 << 13) | (j2 << 11) | imm11,
        );
    }

    /// Patch the imm16 of a Thumb MOVW/MOVT
    fn write_thm_mov(&self, out: &mut [u8], loc: usize, val: u32) {
        let imm4 = bits(val as u64, 15, 12) as u16;
        let i = bit(val as u64, 11) as u16;
        let imm3 = bits(val as u64, 10, 8) as u16;
        let imm8 = bits(val as u64, 7, 0) as u16;
        let lo = self.read16(out, loc);
        let hi = self.read16(out, loc + 2);
        self.put16(out, loc, (lo & 0b1111_1011_1111_0000) | (i << 10) | imm4);
        self.put16(
            out,
            loc + 2,
            (hi & 0b1000_1111_0000_0000) | (imm3 << 12) | imm8,
        );
    }

    /// The address of the TLSDESC trampoline serving address `p`: the
    /// header of the first thunk island past it.
    fn tlsdesc_trampoline_addr(&self, cx: &Context, osec: crate::symbol::ChunkId, p: u64) -> u64 {
        let chunk = cx.chunk(osec);
        if let ChunkKind::OutputSection(data) = &chunk.kind {
            for thunk in &data.thunks {
                let addr = chunk.shdr.sh_addr + thunk.offset;
                if addr > p {
                    return addr;
                }
            }
            if let Some(last) = data.thunks.last() {
                return chunk.shdr.sh_addr + last.offset;
            }
        }
        0
    }
}

impl Target for Arm32 {
    fn info(&self) -> &'static TargetInfo {
        if self.be8 {
            &INFO_BE
        } else {
            &INFO
        }
    }

    fn rel_name(&self, r_type: u32) -> Option<&'static str> {
        rel_name(r_type)
    }

    fn is_abs_rel(&self, r_type: u32) -> bool {
        // TARGET1 is used for .init_array entries and behaves as ABS32 on
        // every platform we support.
        r_type == R_ARM_ABS32 || r_type == R_ARM_TARGET1
    }

    fn is_branch_reloc(&self, r_type: u32) -> bool {
        matches!(
            r_type,
            R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 | R_ARM_THM_CALL | R_ARM_THM_JUMP24
        )
    }

    fn get_addend(&self, contents: &[u8], rel: &Rel) -> i64 {
        let loc = rel.r_offset as usize;
        let arm = self.read32(contents, loc) as u64;
        let thm0 = self.read16(contents, loc) as u64;
        let thm1 = self.read16(contents, loc + 2) as u64;

        match rel.r_type {
            R_ARM_ABS32 | R_ARM_REL32 | R_ARM_BASE_PREL | R_ARM_GOTOFF32 | R_ARM_GOT_PREL
            | R_ARM_GOT_BREL | R_ARM_TLS_GD32 | R_ARM_TLS_LDM32 | R_ARM_TLS_LDO32
            | R_ARM_TLS_IE32 | R_ARM_TLS_LE32 | R_ARM_TLS_GOTDESC | R_ARM_TARGET1
            | R_ARM_TARGET2 => arm as u32 as i32 as i64,
            R_ARM_THM_JUMP8 => sign_extend(thm0, 8) << 1,
            R_ARM_THM_JUMP11 => sign_extend(thm0, 11) << 1,
            R_ARM_THM_JUMP19 => {
                let s = bit(thm0, 10);
                let j2 = bit(thm1, 11);
                let j1 = bit(thm1, 13);
                let imm6 = bits(thm0, 5, 0);
                let imm11 = bits(thm1, 10, 0);
                sign_extend((s << 20) | (j2 << 19) | (j1 << 18) | (imm6 << 12) | (imm11 << 1), 21)
            }
            R_ARM_THM_CALL | R_ARM_THM_JUMP24 | R_ARM_THM_TLS_CALL => {
                let s = bit(thm0, 10);
                let j1 = bit(thm1, 13);
                let j2 = bit(thm1, 11);
                let i1 = (j1 ^ s) ^ 1;
                let i2 = (j2 ^ s) ^ 1;
                let imm10 = bits(thm0, 9, 0);
                let imm11 = bits(thm1, 10, 0);
                sign_extend(
                    (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1),
                    25,
                )
            }
            R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 | R_ARM_TLS_CALL => {
                sign_extend(arm, 24) << 2
            }
            R_ARM_MOVW_PREL_NC | R_ARM_MOVW_ABS_NC | R_ARM_MOVT_PREL | R_ARM_MOVT_ABS => {
                let imm4 = bits(arm, 19, 16);
                let imm12 = bits(arm, 11, 0);
                sign_extend((imm4 << 12) | imm12, 16)
            }
            R_ARM_PREL31 => sign_extend(arm, 31),
            R_ARM_THM_MOVW_PREL_NC | R_ARM_THM_MOVW_ABS_NC | R_ARM_THM_MOVT_PREL
            | R_ARM_THM_MOVT_ABS => {
                let imm4 = bits(thm0, 3, 0);
                let i = bit(thm0, 10);
                let imm3 = bits(thm1, 14, 12);
                let imm8 = bits(thm1, 7, 0);
                sign_extend((imm4 << 12) | (i << 11) | (imm3 << 8) | imm8, 16)
            }
            _ => 0,
        }
    }

    fn write_addend(&self, contents: &mut [u8], rel: &Rel, val: i64) {
        // Only the word-size data forms; branch immediates never carry a
        // section-relative addend that `-r` would have to rebase.
        match rel.r_type {
            R_ARM_ABS32 | R_ARM_REL32 | R_ARM_BASE_PREL | R_ARM_GOTOFF32 | R_ARM_GOT_PREL
            | R_ARM_GOT_BREL | R_ARM_TLS_GD32 | R_ARM_TLS_LDM32 | R_ARM_TLS_LDO32
            | R_ARM_TLS_IE32 | R_ARM_TLS_LE32 | R_ARM_TLS_GOTDESC | R_ARM_TARGET1
            | R_ARM_TARGET2 => {
                self.put32(contents, rel.r_offset as usize, val as u32);
            }
            _ => {}
        }
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
                R_ARM_MOVW_ABS_NC | R_ARM_THM_MOVW_ABS_NC | R_ARM_ABS16 | R_ARM_ABS8 => {
                    scan::do_action(cx, &ABSREL_TABLE, fid, shndx, rel, id);
                    scan::mark_frag_32bit(cx, fid, rel);
                }
                R_ARM_THM_CALL | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 | R_ARM_THM_JUMP24 => {
                    if cx.sym(id).is_imported {
                        cx.sym(id).set_flags(NEEDS_PLT);
                    }
                }
                R_ARM_GOT_PREL | R_ARM_GOT_BREL | R_ARM_TARGET2 => {
                    cx.sym(id).set_flags(NEEDS_GOT);
                }
                R_ARM_MOVT_PREL | R_ARM_THM_MOVT_PREL | R_ARM_PREL31 => {
                    scan::do_action(cx, &PCREL_TABLE, fid, shndx, rel, id);
                }
                R_ARM_TLS_GD32 => {
                    cx.sym(id).set_flags(NEEDS_TLSGD);
                }
                R_ARM_TLS_LDM32 => {
                    cx.needs_tlsld = true;
                }
                R_ARM_TLS_IE32 => {
                    cx.sym(id).set_flags(NEEDS_GOTTP);
                }
                R_ARM_TLS_CALL | R_ARM_THM_TLS_CALL => {
                    scan::scan_tlsdesc(cx, id);
                }
                R_ARM_TLS_LE32 => {
                    scan::check_tlsle(cx, fid, shndx, rel, id);
                }
                R_ARM_ABS32 | R_ARM_TARGET1 | R_ARM_MOVT_ABS | R_ARM_THM_MOVT_ABS | R_ARM_REL32
                | R_ARM_BASE_PREL | R_ARM_GOTOFF32 | R_ARM_THM_JUMP8 | R_ARM_THM_JUMP11
                | R_ARM_THM_JUMP19 | R_ARM_MOVW_PREL_NC | R_ARM_THM_MOVW_PREL_NC
                | R_ARM_TLS_LDO32 | R_ARM_V4BX | R_ARM_TLS_GOTDESC => {}
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
        let got = cx.chunk_addr(cx.refs.got);

        for rel in &rels {
            if rel.r_type == R_NONE || rel.r_type == R_ARM_V4BX {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let in_a = self.get_addend(&out[base_off..], rel);
            let (s, a) = match cx.get_fragment(fid, rel, in_a) {
                Some((frag, off)) => (cx.frag_addr(frag), off as u64),
                None => (cx.get_addr(id, 0), in_a as u64),
            };
            let p = base_addr + rel.r_offset;
            let t = s & 1;
            let g = cx.got_idx(id).max(0) as u64 * 4;

            // Interworking thunks have a Thumb entry at +0 and an ARM
            // entry at +4.
            let thumb_thunk = || cx.thunk_addr(id, p).unwrap_or(0);
            let arm_thunk = || cx.thunk_addr(id, p).unwrap_or(0) + 4;

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, rel, val, lo, hi);

            match rel.r_type {
                R_ARM_ABS32 | R_ARM_TARGET1 => {
                    // Emitted with the output section's absolute records.
                }
                R_ARM_REL32 => {
                    self.put32(out, loc, s.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_ARM_ABS16 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 16)?;
                    self.put16(out, loc, val as u16);
                }
                R_ARM_ABS8 => {
                    let val = s.wrapping_add(a) as i64;
                    check(val, 0, 1 << 8)?;
                    out[loc] = val as u8;
                }
                R_ARM_THM_CALL => {
                    if cx.sym(id).is_remaining_undef_weak() {
                        // Calling an unresolved weak symbol becomes a no-op.
                        self.put32(out, loc, 0x8000_f3af); // nop.w
                        continue;
                    }
                    let val1 = s.wrapping_add(a).wrapping_sub(p) as i64;
                    let val2 = ((s.wrapping_add(a).wrapping_sub(p) as i64) + 3) & !3;
                    if t != 0 && is_int(val1, 25) {
                        let hi = self.read16(out, loc + 2);
                        self.put16(out, loc + 2, hi | 0x1000); // BL
                        self.write_thm_b25(out, loc, val1 as u32);
                    } else if t == 0 && is_int(val2, 25) {
                        let hi = self.read16(out, loc + 2);
                        self.put16(out, loc + 2, hi & !0x1000); // BLX
                        self.write_thm_b25(out, loc, val2 as u32);
                    } else {
                        let hi = self.read16(out, loc + 2);
                        self.put16(out, loc + 2, hi | 0x1000); // BL
                        let val = thumb_thunk().wrapping_add(a).wrapping_sub(p);
                        self.write_thm_b25(out, loc, val as u32);
                    }
                }
                R_ARM_BASE_PREL => {
                    self.put32(out, loc, got.wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_ARM_GOTOFF32 => {
                    self.put32(out, loc, (s.wrapping_add(a) | t).wrapping_sub(got) as u32);
                }
                R_ARM_GOT_PREL | R_ARM_TARGET2 => {
                    self.put32(
                        out,
                        loc,
                        got.wrapping_add(g).wrapping_add(a).wrapping_sub(p) as u32,
                    );
                }
                R_ARM_GOT_BREL => {
                    self.put32(out, loc, g.wrapping_add(a) as u32);
                }
                R_ARM_CALL => {
                    if cx.sym(id).is_remaining_undef_weak() {
                        self.put32(out, loc, 0xe320_f000); // nop
                        continue;
                    }
                    let word = self.read32(out, loc);
                    let is_bl = word & 0xff00_0000 == 0xeb00_0000;
                    let is_blx = word & 0xfe00_0000 == 0xfa00_0000;
                    if !is_bl && !is_blx {
                        return Err(Error::BadRelocation {
                            file: cx.objs[fid as usize].name.clone(),
                            section: isec.name.clone(),
                            offset: rel.r_offset,
                            message: "R_ARM_CALL refers to neither BL nor BLX".into(),
                        });
                    }
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    if is_int(val, 26) {
                        if t != 0 {
                            let w = 0xfa00_0000u32
                                | ((bit(val as u64, 1) as u32) << 24)
                                | (bits(val as u64, 25, 2) as u32);
                            self.put32(out, loc, w); // BLX
                        } else {
                            self.put32(out, loc, 0xeb00_0000 | bits(val as u64, 25, 2) as u32);
                        }
                    } else {
                        let val = arm_thunk().wrapping_add(a).wrapping_sub(p);
                        self.put32(out, loc, 0xeb00_0000 | bits(val, 25, 2) as u32);
                    }
                }
                R_ARM_JUMP24 => {
                    if cx.sym(id).is_remaining_undef_weak() {
                        self.put32(out, loc, 0xe320_f000); // nop
                        continue;
                    }
                    // B cannot switch mode; a thunk does it instead.
                    let mut val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    if t != 0 || !is_int(val, 26) {
                        val = arm_thunk().wrapping_add(a).wrapping_sub(p) as i64;
                    }
                    let word = self.read32(out, loc);
                    self.put32(
                        out,
                        loc,
                        (word & 0xff00_0000) | bits(val as u64, 25, 2) as u32,
                    );
                }
                R_ARM_PLT32 => {
                    if cx.sym(id).is_remaining_undef_weak() {
                        self.put32(out, loc, 0xe320_f000); // nop
                    } else {
                        let target = if t != 0 { arm_thunk() } else { s };
                        let val = target.wrapping_add(a).wrapping_sub(p);
                        let word = self.read32(out, loc);
                        self.put32(out, loc, (word & 0xff00_0000) | bits(val, 25, 2) as u32);
                    }
                }
                R_ARM_THM_JUMP8 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 8), 1 << 8)?;
                    let w = self.read16(out, loc);
                    self.put16(out, loc, (w & 0xff00) | bits(val as u64, 8, 1) as u16);
                }
                R_ARM_THM_JUMP11 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 11), 1 << 11)?;
                    let w = self.read16(out, loc);
                    self.put16(out, loc, (w & 0xf800) | bits(val as u64, 11, 1) as u16);
                }
                R_ARM_THM_JUMP19 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1 << 20), 1 << 20)?;
                    self.write_thm_b21(out, loc, val as u32);
                }
                R_ARM_THM_JUMP24 => {
                    if cx.sym(id).is_remaining_undef_weak() {
                        self.put32(out, loc, 0x8000_f3af); // nop.w
                        continue;
                    }
                    let mut val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    if t == 0 || !is_int(val, 25) {
                        val = thumb_thunk().wrapping_add(a).wrapping_sub(p) as i64;
                    }
                    self.write_thm_b25(out, loc, val as u32);
                }
                R_ARM_MOVW_PREL_NC => {
                    self.write_arm_mov(out, loc, ((s.wrapping_add(a) | t).wrapping_sub(p)) as u32);
                }
                R_ARM_MOVW_ABS_NC => {
                    self.write_arm_mov(out, loc, (s.wrapping_add(a) | t) as u32);
                }
                R_ARM_THM_MOVW_PREL_NC => {
                    self.write_thm_mov(out, loc, ((s.wrapping_add(a) | t).wrapping_sub(p)) as u32);
                }
                R_ARM_THM_MOVW_ABS_NC => {
                    self.write_thm_mov(out, loc, (s.wrapping_add(a) | t) as u32);
                }
                R_ARM_PREL31 => {
                    let val = s.wrapping_add(a).wrapping_sub(p) as i64;
                    check(val, -(1i64 << 30), 1i64 << 30)?;
                    let word = self.read32(out, loc);
                    self.put32(
                        out,
                        loc,
                        (word & 0x8000_0000) | (val as u32 & 0x7fff_ffff),
                    );
                }
                R_ARM_MOVT_PREL => {
                    self.write_arm_mov(out, loc, (s.wrapping_add(a).wrapping_sub(p) >> 16) as u32);
                }
                R_ARM_THM_MOVT_PREL => {
                    self.write_thm_mov(out, loc, (s.wrapping_add(a).wrapping_sub(p) >> 16) as u32);
                }
                R_ARM_MOVT_ABS => {
                    self.write_arm_mov(out, loc, (s.wrapping_add(a) >> 16) as u32);
                }
                R_ARM_THM_MOVT_ABS => {
                    self.write_thm_mov(out, loc, (s.wrapping_add(a) >> 16) as u32);
                }
                R_ARM_TLS_GD32 => {
                    self.put32(
                        out,
                        loc,
                        cx.tlsgd_addr(id).wrapping_add(a).wrapping_sub(p) as u32,
                    );
                }
                R_ARM_TLS_LDM32 => {
                    self.put32(out, loc, cx.tlsld_addr().wrapping_add(a).wrapping_sub(p) as u32);
                }
                R_ARM_TLS_LDO32 => {
                    self.put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr) as u32);
                }
                R_ARM_TLS_IE32 => {
                    self.put32(
                        out,
                        loc,
                        cx.gottp_addr(id).wrapping_add(a).wrapping_sub(p) as u32,
                    );
                }
                R_ARM_TLS_LE32 => {
                    self.put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.tp_addr) as u32);
                }
                R_ARM_TLS_GOTDESC => {
                    if cx.has_tlsdesc(id) {
                        // The addend is odd if the paired TLS_CALL is Thumb.
                        let bias = if a & 1 != 0 { 6 } else { 4 };
                        self.put32(
                            out,
                            loc,
                            cx.tlsdesc_addr(id)
                                .wrapping_sub(p)
                                .wrapping_add(a)
                                .wrapping_sub(bias) as u32,
                        );
                    } else if cx.has_gottp(id) {
                        let bias = if a & 1 != 0 { 5 } else { 8 };
                        self.put32(
                            out,
                            loc,
                            cx.gottp_addr(id)
                                .wrapping_sub(p)
                                .wrapping_add(a)
                                .wrapping_sub(bias) as u32,
                        );
                    } else {
                        self.put32(out, loc, s.wrapping_sub(cx.tp_addr) as u32);
                    }
                }
                R_ARM_TLS_CALL => {
                    if cx.has_tlsdesc(id) {
                        let tramp = self.tlsdesc_trampoline_addr(cx, osec, p);
                        let val = tramp.wrapping_sub(p).wrapping_sub(8);
                        self.put32(out, loc, 0xeb00_0000 | bits(val, 25, 2) as u32);
                    } else if cx.has_gottp(id) {
                        self.put32(out, loc, 0xe79f_0000); // ldr r0, [pc, r0]
                    } else {
                        self.put32(out, loc, 0xe320_f000); // nop
                    }
                }
                R_ARM_THM_TLS_CALL => {
                    if cx.has_tlsdesc(id) {
                        let tramp = self.tlsdesc_trampoline_addr(cx, osec, p);
                        let val = (tramp.wrapping_sub(p).wrapping_sub(4) + 3) & !3;
                        self.write_thm_b25(out, loc, val as u32);
                        let hi = self.read16(out, loc + 2);
                        self.put16(out, loc + 2, hi & !0x1000); // BL -> BLX
                    } else if cx.has_gottp(id) {
                        // `ldr r0, [pc, r0]` has no Thumb encoding.
                        self.put16(out, loc, 0x4478); // add r0, pc
                        self.put16(out, loc + 2, 0x6800); // ldr r0, [r0]
                    } else {
                        self.put32(out, loc, 0x8000_f3af); // nop.w
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

            let in_addend = self.get_addend(&out[base_off..], rel);
            let frag = cx.get_fragment(fid, rel, in_addend);
            let (s, a) = match frag {
                Some((f, addend)) => (cx.frag_addr(f), addend as u64),
                None => (cx.get_addr(id, 0), in_addend as u64),
            };
            let tomb = cx.get_tombstone(&referer, id, frag.map(|(f, _)| f));

            match rel.r_type {
                R_ARM_ABS32 => match tomb {
                    Some(v) => self.put32(out, loc, v as u32),
                    None => self.put32(out, loc, s.wrapping_add(a) as u32),
                },
                R_ARM_TLS_LDO32 => match tomb {
                    Some(v) => self.put32(out, loc, v as u32),
                    None => {
                        self.put32(out, loc, s.wrapping_add(a).wrapping_sub(cx.dtp_addr) as u32)
                    }
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
            0xe52d_e004, //    push {lr}
            0xe59f_e004, //    ldr lr, 2f
            0xe08f_e00e, // 1: add lr, pc, lr
            0xe5be_f008, //    ldr pc, [lr, #8]!
            0x0000_0000, // 2: .word .got.plt - 1b - 8
            0x0000_0000, //    (padding)
            0x0000_0000, //    (padding)
            0x0000_0000, //    (padding)
        ];
        for (i, w) in INSN.iter().enumerate() {
            self.put32(buf, i * 4, *w);
        }
        let gotplt = cx.chunk_addr(cx.refs.gotplt);
        let plt = cx.chunk_addr(cx.refs.plt);
        self.put32(buf, 16, gotplt.wrapping_sub(plt).wrapping_sub(16) as u32);
    }

    fn write_plt_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0xe59f_c004, // 1: ldr ip, 2f
            0xe08c_c00f, //    add ip, ip, pc
            0xe59c_f000, //    ldr pc, [ip]
            0x0000_0000, // 2: .word sym@GOT - 1b
        ];
        for (i, w) in INSN.iter().enumerate() {
            self.put32(buf, i * 4, *w);
        }
        let gotplt = cx.gotplt_addr(sym);
        let plt = cx.plt_addr(sym);
        self.put32(buf, 12, gotplt.wrapping_sub(plt).wrapping_sub(12) as u32);
    }

    fn write_pltgot_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u32; 4] = [
            0xe59f_c004, // 1: ldr ip, 2f
            0xe08c_c00f, //    add ip, ip, pc
            0xe59c_f000, //    ldr pc, [ip]
            0x0000_0000, // 2: .word sym@GOT - 1b
        ];
        for (i, w) in INSN.iter().enumerate() {
            self.put32(buf, i * 4, *w);
        }
        let got = cx.got_addr(sym);
        let plt = cx.plt_addr(sym);
        self.put32(buf, 12, got.wrapping_sub(plt).wrapping_sub(12) as u32);
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
            R_ARM_ABS32 => self.put32(out, loc, val as u32),
            R_ARM_REL32 => {
                self.put32(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset) as u32)
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

    fn write_thunk_header(&self, _cx: &Context, buf: &mut [u8]) {
        // The shared TLSDESC trampoline the psABI expects the linker to
        // provide; entered via BL with the descriptor address in r0.
        // Instructions are always stored little-endian (BE8 keeps code
        // little-endian even in big-endian mode).
        const INSN: [u32; 4] = [
            0xe08e_0000, // add r0, lr, r0
            0xe590_1004, // ldr r1, [r0, #4]
            0xe12f_ff11, // bx  r1
            0xe320_f000, // nop
        ];
        for (i, w) in INSN.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    fn write_thunk_entry(&self, cx: &Context, buf: &mut [u8], entry_addr: u64, sym: SymbolId) {
        // Two entry points: +0 for Thumb callers, +4 for ARM callers.
        // The trailing literal word is data and follows the data encoding.
        const INSN: [u8; 16] = [
            0x78, 0x47, // bx   pc  (Thumb; jumps to 1f)
            0xc0, 0x46, // nop
            0x00, 0xc0, 0x9f, 0xe5, // 1: ldr  ip, 3f
            0x0f, 0xf0, 0x8c, 0xe0, // 2: add  pc, ip, pc
            0x00, 0x00, 0x00, 0x00, // 3: .word sym - 2b
        ];
        buf[..16].copy_from_slice(&INSN);
        let target = cx.get_addr(sym, 0);
        self.put32(
            buf,
            12,
            target.wrapping_sub(entry_addr).wrapping_sub(16) as u32,
        );
    }

    fn tp_addr(&self, p_vaddr: u64, _p_memsz: u64, p_align: u64) -> u64 {
        // Variant 1 with an 8-byte TCB.
        let tcb = (8 + p_align.max(1) - 1) & !(p_align.max(1) - 1);
        p_vaddr - tcb
    }
}

/// Post-layout fixup for `.ARM.exidx`: translate the PREL31 entries to
/// section-relative form, sort the table by address, rewrite them
/// self-relative and terminate with a CANTUNWIND sentinel.
pub fn sort_exidx(cx: &Context, out: &mut [u8]) {
    const CANTUNWIND: u32 = 1;

    let Some((chunk_idx, _)) = cx
        .chunks
        .iter()
        .enumerate()
        .find(|(_, c)| c.shdr.sh_type == SHT_ARM_EXIDX)
    else {
        return;
    };
    let chunk = &cx.chunks[chunk_idx];
    let base = chunk.shdr.sh_offset as usize;
    let addr = chunk.shdr.sh_addr;
    let size = chunk.shdr.sh_size as usize;
    if size < 8 {
        return;
    }
    let n = size / 8;
    let enc = cx.enc;

    // The end of the text segment bounds the last range.
    let text_end = cx
        .chunks
        .iter()
        .filter(|c| c.shdr.sh_flags & SHF_EXECINSTR != 0)
        .map(|c| c.shdr.sh_addr + c.shdr.sh_size)
        .max()
        .unwrap_or(0);

    let mut entries: Vec<(i64, u32)> = Vec::with_capacity(n);
    for i in 0..n - 1 {
        let off = base + i * 8;
        let rel_addr = enc.u32_at(out, off).unwrap_or(0);
        let val = enc.u32_at(out, off + 4).unwrap_or(0);
        let mut a = sign_extend(rel_addr as u64, 31) + (i as i64 * 8);
        if a < 0 {
            a = 0;
        }
        let v = if val != CANTUNWIND && val & 0x8000_0000 == 0 {
            0x7fff_ffff & val.wrapping_add(i as u32 * 8)
        } else {
            val
        };
        entries.push((a, v));
    }
    // Sentinel: everything past the known functions cannot unwind.
    entries.push(((text_end as i64).wrapping_sub(addr as i64), CANTUNWIND));
    entries.sort_by_key(|&(a, _)| a);

    for (i, (a, v)) in entries.iter().enumerate() {
        let off = base + i * 8;
        let rel = (a - i as i64 * 8) as u32 & 0x7fff_ffff;
        let val = if *v != CANTUNWIND && v & 0x8000_0000 == 0 {
            0x7fff_ffff & v.wrapping_sub(i as u32 * 8)
        } else {
            *v
        };
        enc.put_u32(out, off, rel);
        enc.put_u32(out, off + 4, val);
    }
}

/// BE8: instructions were read and relocated big-endian; swap ARM words
/// and Thumb halfwords to little-endian, leaving data alone. Sections
/// without mapping symbols are left as they are.
pub fn be8_swap_bytes(cx: &Context, out: &mut [u8]) {
    for f in 0..cx.objs.len() {
        let file = &cx.objs[f];
        if !file.is_alive {
            continue;
        }
        let maps = &file.mapping_symbols;
        for (i, m) in maps.iter().enumerate() {
            if m.kind == MapKind::Data {
                continue;
            }
            let Some(Some(isec)) = file.sections.get(m.shndx as usize) else {
                continue;
            };
            if !isec.is_alive() || isec.shdr.sh_flags & SHF_EXECINSTR == 0 {
                continue;
            }
            let Some(osec) = isec.osec else { continue };
            let sec_base = (cx.chunk(osec).shdr.sh_offset + isec.offset) as usize;

            let end = maps
                .get(i + 1)
                .filter(|next| next.shndx == m.shndx)
                .map(|next| next.offset)
                .unwrap_or(isec.sh_size());

            let unit = if m.kind == MapKind::Arm { 4 } else { 2 };
            let mut off = m.offset as usize;
            while off + unit <= end as usize {
                let lo = sec_base + off;
                out[lo..lo + unit].reverse();
                off += unit;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_thm_b25_roundtrip() {
        let t = &TARGET;
        let mut buf = vec![0u8; 4];
        t.put16(&mut buf, 0, 0xf000); // bl
        t.put16(&mut buf, 2, 0xf800);
        for val in [0x10i64, -0x10, 0x3ffffe] {
            let val = val & !1;
            t.write_thm_b25(&mut buf, 0, val as u32);
            let rel = Rel {
                r_offset: 0,
                r_sym: 0,
                r_type: R_ARM_THM_CALL,
                r_addend: 0,
            };
            assert_eq!(t.get_addend(&buf, &rel), val);
        }
    }

    #[test]
    fn test_arm_mov_roundtrip() {
        let t = &TARGET;
        let mut buf = vec![0u8; 4];
        t.put32(&mut buf, 0, 0xe300_0000); // movw r0, #0
        t.write_arm_mov(&mut buf, 0, 0xabcd);
        let rel = Rel {
            r_offset: 0,
            r_sym: 0,
            r_type: R_ARM_MOVW_ABS_NC,
            r_addend: 0,
        };
        assert_eq!(t.get_addend(&buf, &rel) as u64 & 0xffff, 0xabcd);
    }
}
