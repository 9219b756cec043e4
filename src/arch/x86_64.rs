//! x86-64 backend
//!
//! x86-64 is the easy target: PC-relative addressing everywhere, 32-bit
//! branch displacements (so no range-extension thunks), and a
//! well-documented set of TLS code sequences the linker may rewrite.
//! The PLT layout starts every entry with an `endbr64` when IBT is
//! requested; entries clobber %r11, which the lazy resolver clobbers
//! anyway.
//!
//! TP points past the end of the TLS block on x86, so TP-relative offsets
//! of the main executable are negative.

use crate::arch::{check_range, define_rels, is_int, Target, TargetInfo};
use crate::context::Context;
use crate::elf::{Class, Endian, Machine, Rel, R_NONE, SHF_ALLOC};
use crate::error::{Error, Result};
use crate::scan::{self, ABSREL_TABLE, PCREL_TABLE};
use crate::symbol::{SectionRef, SymbolId, NEEDS_GOT, NEEDS_PLT};

define_rels!(
    X86_64,
    NONE = 0,
    QUAD as "R_X86_64_64" = 1,
    PC32 = 2,
    GOT32 = 3,
    PLT32 = 4,
    COPY = 5,
    GLOB_DAT = 6,
    JUMP_SLOT = 7,
    RELATIVE = 8,
    GOTPCREL = 9,
    ABS32 as "R_X86_64_32" = 10,
    ABS32S as "R_X86_64_32S" = 11,
    ABS16 as "R_X86_64_16" = 12,
    PC16 = 13,
    ABS8 as "R_X86_64_8" = 14,
    PC8 = 15,
    DTPMOD64 = 16,
    DTPOFF64 = 17,
    TPOFF64 = 18,
    TLSGD = 19,
    TLSLD = 20,
    DTPOFF32 = 21,
    GOTTPOFF = 22,
    TPOFF32 = 23,
    PC64 = 24,
    GOTOFF64 = 25,
    GOTPC32 = 26,
    GOT64 = 27,
    GOTPCREL64 = 28,
    GOTPC64 = 29,
    PLTOFF64 = 31,
    SIZE32 = 32,
    SIZE64 = 33,
    GOTPC32_TLSDESC = 34,
    TLSDESC_CALL = 35,
    TLSDESC = 36,
    IRELATIVE = 37,
    GOTPCRELX = 41,
    REX_GOTPCRELX = 42,
    CODE_4_GOTPCRELX = 43,
    CODE_4_GOTTPOFF = 44,
    CODE_4_GOTPC32_TLSDESC = 45,
    CODE_6_GOTTPOFF = 46,
);

pub static TARGET: X8664 = X8664;

static INFO: TargetInfo = TargetInfo {
    machine: Machine::X86_64,
    class: Class::Elf64,
    endian: Endian::Little,
    page_size: 4096,
    default_image_base: 0x200000,
    is_rela: true,
    supports_tlsdesc: true,
    plt_hdr_size: 32,
    plt_size: 16,
    pltgot_size: 8,
    r_copy: R_X86_64_COPY,
    r_glob_dat: R_X86_64_GLOB_DAT,
    r_jump_slot: R_X86_64_JUMP_SLOT,
    r_relative: R_X86_64_RELATIVE,
    r_irelative: R_X86_64_IRELATIVE,
    r_abs: R_X86_64_QUAD,
    r_dtpmod: R_X86_64_DTPMOD64,
    r_dtpoff: R_X86_64_DTPOFF64,
    r_tpoff: R_X86_64_TPOFF64,
    r_tlsdesc: R_X86_64_TLSDESC,
    branch_reach: 0,
    thunk_size: 0,
    thunk_hdr_size: 0,
    filler: &[0xcc],
};

pub struct X8664;

fn put32(out: &mut [u8], off: usize, val: u32) {
    out[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put64(out: &mut [u8], off: usize, val: u64) {
    out[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn put16(out: &mut [u8], off: usize, val: u16) {
    out[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

/// Rewrite a GOT-load into a direct form when the target is known:
/// `call/jmp *0(%rip)` drop the indirection, `mov 0(%rip), %reg` becomes
/// `lea`. Returns the replacement opcode bytes or 0 when the surrounding
/// instruction is not a recognized template.
fn relax_gotpcrelx(prefix: &[u8], rel_type: u32) -> u32 {
    if rel_type == R_X86_64_GOTPCRELX {
        match (prefix[0] as u32) << 8 | prefix[1] as u32 {
            0xff15 => 0x40e8, // call *0(%rip) -> call 0
            0xff25 => 0x40e9, // jmp  *0(%rip) -> jmp  0
            _ => 0,
        }
    } else {
        match (prefix[0] as u32) << 16 | (prefix[1] as u32) << 8 | prefix[2] as u32 {
            0x488b05 => 0x8d05, // mov 0(%rip), %rax -> lea 0(%rip), %rax
            0x488b0d => 0x8d0d,
            0x488b15 => 0x8d15,
            0x488b1d => 0x8d1d,
            0x488b25 => 0x8d25,
            0x488b2d => 0x8d2d,
            0x488b35 => 0x8d35,
            0x488b3d => 0x8d3d,
            0x4c8b05 => 0x8d05, // mov 0(%rip), %r8 -> lea 0(%rip), %r8
            0x4c8b0d => 0x8d0d,
            0x4c8b15 => 0x8d15,
            0x4c8b1d => 0x8d1d,
            0x4c8b25 => 0x8d25,
            0x4c8b2d => 0x8d2d,
            0x4c8b35 => 0x8d35,
            0x4c8b3d => 0x8d3d,
            _ => 0,
        }
    }
}

/// `mov foo@gottpoff(%rip), %reg` -> `mov $tpoff, %reg`
fn relax_gottpoff(prefix: &[u8]) -> u32 {
    match (prefix[0] as u32) << 16 | (prefix[1] as u32) << 8 | prefix[2] as u32 {
        0x488b05 => 0x48c7c0,
        0x488b0d => 0x48c7c1,
        0x488b15 => 0x48c7c2,
        0x488b1d => 0x48c7c3,
        0x488b25 => 0x48c7c4,
        0x488b2d => 0x48c7c5,
        0x488b35 => 0x48c7c6,
        0x488b3d => 0x48c7c7,
        0x4c8b05 => 0x49c7c0,
        0x4c8b0d => 0x49c7c1,
        0x4c8b15 => 0x49c7c2,
        0x4c8b1d => 0x49c7c3,
        0x4c8b25 => 0x49c7c4,
        0x4c8b2d => 0x49c7c5,
        0x4c8b35 => 0x49c7c6,
        0x4c8b3d => 0x49c7c7,
        _ => 0,
    }
}

/// `lea 0(%rip), %reg` (TLSDESC) -> `mov 0(%rip), %reg` (initial-exec)
fn relax_tlsdesc_to_ie(prefix: &[u8]) -> u32 {
    match (prefix[0] as u32) << 16 | (prefix[1] as u32) << 8 | prefix[2] as u32 {
        0x488d05 => 0x488b05,
        0x488d0d => 0x488b0d,
        0x488d15 => 0x488b15,
        0x488d1d => 0x488b1d,
        0x488d25 => 0x488b25,
        0x488d2d => 0x488b2d,
        0x488d35 => 0x488b35,
        0x488d3d => 0x488b3d,
        0x4c8d05 => 0x4c8b05,
        0x4c8d0d => 0x4c8b0d,
        0x4c8d15 => 0x4c8b15,
        0x4c8d1d => 0x4c8b1d,
        0x4c8d25 => 0x4c8b25,
        0x4c8d2d => 0x4c8b2d,
        0x4c8d35 => 0x4c8b35,
        0x4c8d3d => 0x4c8b3d,
        _ => 0,
    }
}

/// `lea 0(%rip), %reg` (TLSDESC) -> `mov $tpoff, %reg` (local-exec)
fn relax_tlsdesc_to_le(prefix: &[u8]) -> u32 {
    match (prefix[0] as u32) << 16 | (prefix[1] as u32) << 8 | prefix[2] as u32 {
        0x488d05 => 0x48c7c0,
        0x488d0d => 0x48c7c1,
        0x488d15 => 0x48c7c2,
        0x488d1d => 0x48c7c3,
        0x488d25 => 0x48c7c4,
        0x488d2d => 0x48c7c5,
        0x488d35 => 0x48c7c6,
        0x488d3d => 0x48c7c7,
        0x4c8d05 => 0x49c7c0,
        0x4c8d0d => 0x49c7c1,
        0x4c8d15 => 0x49c7c2,
        0x4c8d1d => 0x49c7c3,
        0x4c8d25 => 0x49c7c4,
        0x4c8d2d => 0x49c7c5,
        0x4c8d35 => 0x49c7c6,
        0x4c8d3d => 0x49c7c7,
        _ => 0,
    }
}

/// `lea foo@tlsgd(%rip), %rdi; call __tls_get_addr` ->
/// `mov %fs:0, %rax; add $tp_off, %rax`
fn relax_gd_to_le(out: &mut [u8], loc: usize, next_type: u32, val: u32) -> Result<()> {
    match next_type {
        R_X86_64_PLT32 | R_X86_64_PC32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX => {
            const INSN: [u8; 16] = [
                0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                0x48, 0x81, 0xc0, 0, 0, 0, 0, // add $tp_offset, %rax
            ];
            out[loc - 4..loc + 12].copy_from_slice(&INSN);
            put32(out, loc + 8, val);
            Ok(())
        }
        R_X86_64_PLTOFF64 => {
            const INSN: [u8; 22] = [
                0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                0x48, 0x81, 0xc0, 0, 0, 0, 0, // add $tp_offset, %rax
                0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
            ];
            out[loc - 3..loc + 19].copy_from_slice(&INSN);
            put32(out, loc + 9, val);
            Ok(())
        }
        _ => Err(Error::internal("unexpected TLSGD companion relocation")),
    }
}

fn relax_gd_to_ie(out: &mut [u8], loc: usize, next_type: u32, val: u32) -> Result<()> {
    match next_type {
        R_X86_64_PLT32 | R_X86_64_PC32 | R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX => {
            const INSN: [u8; 16] = [
                0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                0x48, 0x03, 0x05, 0, 0, 0, 0, // add foo@gottpoff(%rip), %rax
            ];
            out[loc - 4..loc + 12].copy_from_slice(&INSN);
            put32(out, loc + 8, val.wrapping_sub(12));
            Ok(())
        }
        R_X86_64_PLTOFF64 => {
            const INSN: [u8; 22] = [
                0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                0x48, 0x03, 0x05, 0, 0, 0, 0, // add foo@gottpoff(%rip), %rax
                0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00, // nop
            ];
            out[loc - 3..loc + 19].copy_from_slice(&INSN);
            put32(out, loc + 9, val.wrapping_sub(13));
            Ok(())
        }
        _ => Err(Error::internal("unexpected TLSGD companion relocation")),
    }
}

/// `lea foo@tlsld(%rip), %rdi; call __tls_get_addr` -> materialize the
/// TLS block base directly
fn relax_ld_to_le(out: &mut [u8], loc: usize, next_type: u32, tls_size: u32) -> Result<()> {
    match next_type {
        R_X86_64_PLT32 | R_X86_64_PC32 => {
            const INSN: [u8; 12] = [
                0x31, 0xc0, // xor %eax, %eax
                0x64, 0x48, 0x8b, 0x00, // mov %fs:(%rax), %rax
                0x48, 0x2d, 0, 0, 0, 0, // sub $tls_size, %rax
            ];
            out[loc - 3..loc + 9].copy_from_slice(&INSN);
            put32(out, loc + 5, tls_size);
            Ok(())
        }
        R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX => {
            const INSN: [u8; 13] = [
                0x48, 0x31, 0xc0, // xor %rax, %rax
                0x64, 0x48, 0x8b, 0x00, // mov %fs:(%rax), %rax
                0x48, 0x2d, 0, 0, 0, 0, // sub $tls_size, %rax
            ];
            out[loc - 3..loc + 10].copy_from_slice(&INSN);
            put32(out, loc + 6, tls_size);
            Ok(())
        }
        R_X86_64_PLTOFF64 => {
            const INSN: [u8; 22] = [
                0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0, %rax
                0x48, 0x2d, 0, 0, 0, 0, // sub $tls_size, %rax
                0x0f, 0x1f, 0x80, 0x00, 0x00, 0x00, 0x00, // nop
            ];
            out[loc - 3..loc + 19].copy_from_slice(&INSN);
            put32(out, loc + 8, tls_size);
            Ok(())
        }
        _ => Err(Error::internal("unexpected TLSLD companion relocation")),
    }
}

fn validate_tls_pair(cx: &Context, fid: u32, shndx: u32, rels: &[Rel], i: usize) -> Result<()> {
    let bad = |msg: &str| -> Error {
        Error::BadRelocation {
            file: cx.objs[fid as usize].name.clone(),
            section: cx.isec(SectionRef { file: fid, shndx }).name.clone(),
            offset: rels[i].r_offset,
            message: msg.to_string(),
        }
    };
    if i + 1 == rels.len() {
        return Err(bad("TLS relocation must be followed by PLT or GOTPCREL"));
    }
    match rels[i + 1].r_type {
        R_X86_64_PLT32 | R_X86_64_PC32 | R_X86_64_PLTOFF64 | R_X86_64_GOTPCREL
        | R_X86_64_GOTPCRELX => Ok(()),
        _ => Err(bad("TLS relocation must be followed by PLT or GOTPCREL")),
    }
}

impl Target for X8664 {
    fn info(&self) -> &'static TargetInfo {
        &INFO
    }

    fn rel_name(&self, r_type: u32) -> Option<&'static str> {
        rel_name(r_type)
    }

    fn is_abs_rel(&self, r_type: u32) -> bool {
        r_type == R_X86_64_QUAD
    }

    fn is_branch_reloc(&self, r_type: u32) -> bool {
        r_type == R_X86_64_PLT32 || r_type == R_X86_64_PLTOFF64
    }

    fn scan_relocations(&self, cx: &mut Context, fid: u32, shndx: u32) -> Result<()> {
        let r = SectionRef {
            file: fid,
            shndx,
        };
        let rels: Vec<Rel> = cx.objs[fid as usize]
            .section_rels(cx.isec(r))
            .to_vec();
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
                R_X86_64_ABS8 | R_X86_64_ABS16 | R_X86_64_ABS32 | R_X86_64_ABS32S => {
                    scan::do_action(cx, &ABSREL_TABLE, fid, shndx, &rel, id);
                    scan::mark_frag_32bit(cx, fid, &rel);
                }
                R_X86_64_PC8 | R_X86_64_PC16 | R_X86_64_PC32 | R_X86_64_PC64 => {
                    scan::do_action(cx, &PCREL_TABLE, fid, shndx, &rel, id);
                }
                R_X86_64_GOT32 | R_X86_64_GOT64 | R_X86_64_GOTPC32 | R_X86_64_GOTPC64
                | R_X86_64_GOTPCREL | R_X86_64_GOTPCREL64 | R_X86_64_GOTPCRELX
                | R_X86_64_REX_GOTPCRELX | R_X86_64_CODE_4_GOTPCRELX => {
                    cx.sym(id).set_flags(NEEDS_GOT);
                }
                R_X86_64_PLT32 | R_X86_64_PLTOFF64 => {
                    if cx.sym(id).is_imported {
                        cx.sym(id).set_flags(NEEDS_PLT);
                    }
                }
                R_X86_64_TLSGD => {
                    validate_tls_pair(cx, fid, shndx, &rels, i)?;
                    if cx.options.static_
                        || (cx.options.relax && cx.is_tprel_linktime_const(id))
                    {
                        i += 1;
                    } else if cx.options.relax && cx.is_tprel_runtime_const(id) {
                        cx.sym(id).set_flags(crate::symbol::NEEDS_GOTTP);
                        i += 1;
                    } else {
                        cx.sym(id).set_flags(crate::symbol::NEEDS_TLSGD);
                    }
                }
                R_X86_64_TLSLD => {
                    validate_tls_pair(cx, fid, shndx, &rels, i)?;
                    if cx.options.static_ || (cx.options.relax && !cx.options.shared) {
                        i += 1;
                    } else {
                        cx.needs_tlsld = true;
                    }
                }
                R_X86_64_GOTTPOFF => {
                    let off = rel.r_offset as usize;
                    let relaxable = off >= 3 && {
                        let data = &cx.objs[fid as usize].data[contents_range.clone()];
                        relax_gottpoff(&data[off - 3..off]) != 0
                    };
                    if !cx.options.relax || !cx.is_tprel_linktime_const(id) || !relaxable {
                        cx.sym(id).set_flags(crate::symbol::NEEDS_GOTTP);
                    }
                }
                R_X86_64_CODE_4_GOTTPOFF | R_X86_64_CODE_6_GOTTPOFF => {
                    cx.sym(id).set_flags(crate::symbol::NEEDS_GOTTP);
                }
                R_X86_64_TLSDESC_CALL => {
                    scan::scan_tlsdesc(cx, id);
                }
                R_X86_64_TPOFF32 | R_X86_64_TPOFF64 => {
                    scan::check_tlsle(cx, fid, shndx, &rel, id);
                }
                R_X86_64_QUAD
                | R_X86_64_GOTOFF64
                | R_X86_64_DTPOFF32
                | R_X86_64_DTPOFF64
                | R_X86_64_SIZE32
                | R_X86_64_SIZE64
                | R_X86_64_GOTPC32_TLSDESC
                | R_X86_64_CODE_4_GOTPC32_TLSDESC => {}
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
        let gotplt_base = cx.chunk_addr(cx.refs.gotplt);

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
            let a = rel.r_addend;
            // Section-symbol references into merged sections follow the
            // surviving fragment.
            let (s, a) = match cx.get_fragment(fid, &rel, a) {
                Some((frag, off)) => (cx.frag_addr(frag), off),
                None => (s, a),
            };
            let p = base_addr + rel.r_offset;
            let g = cx.got_addr(id).wrapping_sub(gotplt_base);
            let got = gotplt_base;

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, &rel, val, lo, hi);

            match rel.r_type {
                R_X86_64_ABS8 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 8)?;
                    out[loc] = val as u8;
                }
                R_X86_64_ABS16 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 16)?;
                    put16(out, loc, val as u16);
                }
                R_X86_64_ABS32 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_ABS32S => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_QUAD => {
                    // Word-size absolute relocations are emitted with the
                    // output section, which may turn them into dynamic
                    // relocations.
                }
                R_X86_64_PC8 => {
                    let val = s.wrapping_add(a as u64).wrapping_sub(p) as i64;
                    check(val, -(1 << 7), 1 << 7)?;
                    out[loc] = val as u8;
                }
                R_X86_64_PC16 => {
                    let val = s.wrapping_add(a as u64).wrapping_sub(p) as i64;
                    check(val, -(1 << 15), 1 << 15)?;
                    put16(out, loc, val as u16);
                }
                R_X86_64_PC32 | R_X86_64_PLT32 => {
                    let val = s.wrapping_add(a as u64).wrapping_sub(p) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_PC64 => {
                    put64(out, loc, s.wrapping_add(a as u64).wrapping_sub(p));
                }
                R_X86_64_GOT32 => {
                    let val = g.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_GOT64 => {
                    put64(out, loc, g.wrapping_add(a as u64));
                }
                R_X86_64_GOTOFF64 | R_X86_64_PLTOFF64 => {
                    put64(out, loc, s.wrapping_add(a as u64).wrapping_sub(got));
                }
                R_X86_64_GOTPC32 => {
                    let val = got.wrapping_add(a as u64).wrapping_sub(p) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_GOTPC64 => {
                    put64(out, loc, got.wrapping_add(a as u64).wrapping_sub(p));
                }
                R_X86_64_GOTPCREL => {
                    let val = g
                        .wrapping_add(got)
                        .wrapping_add(a as u64)
                        .wrapping_sub(p) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_GOTPCREL64 => {
                    put64(
                        out,
                        loc,
                        g.wrapping_add(got).wrapping_add(a as u64).wrapping_sub(p),
                    );
                }
                R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX | R_X86_64_CODE_4_GOTPCRELX => {
                    // Always relax when possible; static PIE startup code
                    // depends on reading the final address here.
                    let pcrel = s.wrapping_add(a as u64).wrapping_sub(p) as i64;
                    let mut done = false;
                    if cx.is_pcrel_linktime_const(id)
                        && is_int(pcrel, 32)
                        && rel.r_type != R_X86_64_CODE_4_GOTPCRELX
                    {
                        let n = if rel.r_type == R_X86_64_GOTPCRELX { 2 } else { 3 };
                        let insn = relax_gotpcrelx(&out[loc - n..loc], rel.r_type);
                        if insn != 0 {
                            // The REX form keeps its prefix byte; in both
                            // cases two opcode bytes are replaced.
                            out[loc - 2] = (insn >> 8) as u8;
                            out[loc - 1] = insn as u8;
                            put32(out, loc, pcrel as u32);
                            done = true;
                        }
                    }
                    if !done {
                        let val = g
                            .wrapping_add(got)
                            .wrapping_add(a as u64)
                            .wrapping_sub(p) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
                    }
                }
                R_X86_64_TLSGD => {
                    if cx.has_tlsgd(id) {
                        let val =
                            cx.tlsgd_addr(id).wrapping_add(a as u64).wrapping_sub(p) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
                    } else if cx.has_gottp(id) {
                        i += 1;
                        relax_gd_to_ie(
                            out,
                            loc,
                            rels[i].r_type,
                            cx.gottp_addr(id).wrapping_sub(p) as u32,
                        )?;
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
                R_X86_64_TLSLD => {
                    if cx.tlsld_idx >= 0 {
                        let val = cx.tlsld_addr().wrapping_add(a as u64).wrapping_sub(p) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
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
                R_X86_64_DTPOFF32 => {
                    let val = s.wrapping_add(a as u64).wrapping_sub(cx.dtp_addr) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_DTPOFF64 => {
                    put64(out, loc, s.wrapping_add(a as u64).wrapping_sub(cx.dtp_addr));
                }
                R_X86_64_TPOFF32 => {
                    let val = s.wrapping_add(a as u64).wrapping_sub(cx.tp_addr) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_TPOFF64 => {
                    put64(out, loc, s.wrapping_add(a as u64).wrapping_sub(cx.tp_addr));
                }
                R_X86_64_GOTTPOFF | R_X86_64_CODE_4_GOTTPOFF | R_X86_64_CODE_6_GOTTPOFF => {
                    if cx.has_gottp(id) {
                        let val =
                            cx.gottp_addr(id).wrapping_add(a as u64).wrapping_sub(p) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
                    } else {
                        let insn = relax_gottpoff(&out[loc - 3..loc]);
                        if insn == 0 {
                            return Err(self.bad_insn(cx, fid, shndx, &rel));
                        }
                        out[loc - 3] = (insn >> 16) as u8;
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        let val = s.wrapping_sub(cx.tp_addr) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
                    }
                }
                R_X86_64_GOTPC32_TLSDESC | R_X86_64_CODE_4_GOTPC32_TLSDESC => {
                    if cx.has_tlsdesc(id) {
                        let val =
                            cx.tlsdesc_addr(id).wrapping_add(a as u64).wrapping_sub(p) as i64;
                        check(val, -(1 << 31), 1 << 31)?;
                        put32(out, loc, val as u32);
                    } else if cx.has_gottp(id) {
                        let insn = relax_tlsdesc_to_ie(&out[loc - 3..loc]);
                        if insn == 0 {
                            return Err(self.bad_insn(cx, fid, shndx, &rel));
                        }
                        out[loc - 3] = (insn >> 16) as u8;
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        let val =
                            cx.gottp_addr(id).wrapping_add(a as u64).wrapping_sub(p) as i64;
                        put32(out, loc, val as u32);
                    } else {
                        let insn = relax_tlsdesc_to_le(&out[loc - 3..loc]);
                        if insn == 0 {
                            return Err(self.bad_insn(cx, fid, shndx, &rel));
                        }
                        out[loc - 3] = (insn >> 16) as u8;
                        out[loc - 2] = (insn >> 8) as u8;
                        out[loc - 1] = insn as u8;
                        put32(out, loc, s.wrapping_sub(cx.tp_addr) as u32);
                    }
                }
                R_X86_64_TLSDESC_CALL => {
                    if !cx.has_tlsdesc(id) {
                        // call *(%rax) -> nop
                        out[loc] = 0x66;
                        out[loc + 1] = 0x90;
                    }
                }
                R_X86_64_SIZE32 => {
                    let val = cx.sym(id).esym_size.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_SIZE64 => {
                    put64(out, loc, cx.sym(id).esym_size.wrapping_add(a as u64));
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

        for rel in &rels {
            if rel.r_type == R_NONE {
                continue;
            }
            let id = cx.objs[fid as usize].symbols[rel.r_sym as usize];
            let loc = base_off + rel.r_offset as usize;

            let frag = cx.get_fragment(fid, rel, rel.r_addend);
            let (s, a) = match frag {
                Some((f, addend)) => (cx.frag_addr(f), addend),
                None => (cx.get_addr(id, 0), rel.r_addend),
            };
            let tomb = cx.get_tombstone(&referer, id, frag.map(|(f, _)| f));

            let check = |val: i64, lo: i64, hi: i64| check_range(cx, fid, shndx, rel, val, lo, hi);

            match rel.r_type {
                R_X86_64_ABS8 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 8)?;
                    out[loc] = val as u8;
                }
                R_X86_64_ABS16 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 16)?;
                    put16(out, loc, val as u16);
                }
                R_X86_64_ABS32 => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_ABS32S => {
                    let val = s.wrapping_add(a as u64) as i64;
                    check(val, -(1 << 31), 1 << 31)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_QUAD => match tomb {
                    Some(v) => put64(out, loc, v),
                    None => put64(out, loc, s.wrapping_add(a as u64)),
                },
                R_X86_64_DTPOFF32 => match tomb {
                    Some(v) => put32(out, loc, v as u32),
                    None => {
                        put32(out, loc, s.wrapping_add(a as u64).wrapping_sub(cx.dtp_addr) as u32)
                    }
                },
                R_X86_64_DTPOFF64 => match tomb {
                    Some(v) => put64(out, loc, v),
                    None => put64(out, loc, s.wrapping_add(a as u64).wrapping_sub(cx.dtp_addr)),
                },
                R_X86_64_GOTOFF64 => {
                    put64(
                        out,
                        loc,
                        s.wrapping_add(a as u64)
                            .wrapping_sub(cx.chunk_addr(cx.refs.gotplt)),
                    );
                }
                R_X86_64_GOTPC64 => {
                    put64(out, loc, cx.chunk_addr(cx.refs.gotplt).wrapping_add(a as u64));
                }
                R_X86_64_SIZE32 => {
                    let val = cx.sym(id).esym_size.wrapping_add(a as u64) as i64;
                    check(val, 0, 1 << 32)?;
                    put32(out, loc, val as u32);
                }
                R_X86_64_SIZE64 => {
                    put64(out, loc, cx.sym(id).esym_size.wrapping_add(a as u64));
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
        const INSN: [u8; 32] = [
            0xf3, 0x0f, 0x1e, 0xfa, // endbr64
            0x41, 0x53, // push %r11
            0xff, 0x35, 0, 0, 0, 0, // push GOTPLT+8(%rip)
            0xff, 0x25, 0, 0, 0, 0, // jmp *GOTPLT+16(%rip)
            0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            0xcc, 0xcc, // (padding)
        ];
        buf[..32].copy_from_slice(&INSN);
        let gotplt = cx.chunk_addr(cx.refs.gotplt);
        let plt = cx.chunk_addr(cx.refs.plt);
        put32(buf, 8, gotplt.wrapping_sub(plt).wrapping_sub(4) as u32);
        put32(buf, 14, gotplt.wrapping_sub(plt).wrapping_sub(2) as u32);
    }

    fn write_plt_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        let plt_idx = cx.plt_idx(sym);
        let plt_addr = cx.plt_addr(sym);
        let gotplt_addr = cx.gotplt_addr(sym);
        if cx.sym(sym).is_canonical {
            // Address-taken entries start with a landing pad.
            const INSN: [u8; 16] = [
                0xf3, 0x0f, 0x1e, 0xfa, // endbr64
                0x41, 0xbb, 0, 0, 0, 0, // mov $index_in_relplt, %r11d
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOTPLT
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 6, plt_idx as u32);
            put32(
                buf,
                12,
                gotplt_addr.wrapping_sub(plt_addr).wrapping_sub(16) as u32,
            );
        } else {
            const INSN: [u8; 16] = [
                0x41, 0xbb, 0, 0, 0, 0, // mov $index_in_relplt, %r11d
                0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOTPLT
                0xcc, 0xcc, 0xcc, 0xcc, // (padding)
            ];
            buf[..16].copy_from_slice(&INSN);
            put32(buf, 2, plt_idx as u32);
            put32(
                buf,
                8,
                gotplt_addr.wrapping_sub(plt_addr).wrapping_sub(12) as u32,
            );
        }
    }

    fn write_pltgot_entry(&self, cx: &Context, buf: &mut [u8], sym: SymbolId) {
        const INSN: [u8; 8] = [
            0xff, 0x25, 0, 0, 0, 0, // jmp *foo@GOT
            0xcc, 0xcc, // (padding)
        ];
        buf[..8].copy_from_slice(&INSN);
        let got = cx.got_addr(sym);
        let plt = cx.plt_addr(sym);
        put32(buf, 2, got.wrapping_sub(plt).wrapping_sub(6) as u32);
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
            R_X86_64_ABS32 => put32(out, loc, val as u32),
            R_X86_64_QUAD => put64(out, loc, val),
            R_X86_64_PC32 => put32(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset) as u32),
            R_X86_64_PC64 => put64(out, loc, val.wrapping_sub(chunk.shdr.sh_addr + offset)),
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
        // Variant 2: TP sits just past the TLS block, aligned up.
        let end = p_vaddr + p_memsz;
        (end + p_align - 1) & !(p_align.max(1) - 1)
    }
}

impl X8664 {
    fn bad_insn(&self, cx: &Context, fid: u32, shndx: u32, rel: &Rel) -> Error {
        Error::BadRelocation {
            file: cx.objs[fid as usize].name.clone(),
            section: cx.isec(SectionRef { file: fid, shndx }).name.clone(),
            offset: rel.r_offset,
            message: format!(
                "unrecognized instruction sequence for {} relaxation",
                self.rel_name(rel.r_type).unwrap_or("TLS")
            ),
        }
    }
}

/// Rewrite `endbr64` landing pads of functions whose address is never
/// taken into NOPs (`-z rewrite-endbr`).
pub fn rewrite_endbr(cx: &Context, out: &mut [u8]) {
    const ENDBR64: [u8; 4] = [0xf3, 0x0f, 0x1e, 0xfa];
    const NOP: [u8; 4] = [0x0f, 0x1f, 0x40, 0x00];

    for id in 0..cx.symbols.len() {
        let sym = &cx.symbols[id];
        if sym.st_type() != crate::elf::STT_FUNC {
            continue;
        }
        let Some(r) = sym.input_section() else { continue };
        let Some(isec) = cx.try_isec(r) else { continue };
        if !isec.is_alive() || isec.shdr.sh_flags & SHF_ALLOC == 0 {
            continue;
        }
        if isec.address_taken.load(std::sync::atomic::Ordering::Relaxed) {
            continue;
        }
        if sym.is_exported || cx.has_plt(SymbolId(id as u32)) {
            continue;
        }
        let Some(osec) = isec.osec else { continue };
        let loc = (cx.chunk(osec).shdr.sh_offset + isec.offset + sym.value) as usize;
        if out.get(loc..loc + 4) == Some(&ENDBR64[..]) {
            out[loc..loc + 4].copy_from_slice(&NOP);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    #[test]
    fn test_relax_tables_recognize_standard_sequences() {
        // mov 0(%rip), %rax with a REX prefix
        assert_eq!(relax_gottpoff(&[0x48, 0x8b, 0x05]), 0x48c7c0);
        assert_eq!(relax_gottpoff(&[0x4c, 0x8b, 0x3d]), 0x49c7c7);
        assert_eq!(relax_gottpoff(&[0x90, 0x90, 0x90]), 0);

        assert_eq!(relax_tlsdesc_to_ie(&[0x48, 0x8d, 0x05]), 0x488b05);
        assert_eq!(relax_tlsdesc_to_le(&[0x48, 0x8d, 0x05]), 0x48c7c0);

        assert_eq!(relax_gotpcrelx(&[0xff, 0x15], R_X86_64_GOTPCRELX), 0x40e8);
        assert_eq!(
            relax_gotpcrelx(&[0x48, 0x8b, 0x05], R_X86_64_REX_GOTPCRELX),
            0x8d05
        );
    }

    #[test]
    fn test_tp_is_past_the_tls_block() {
        let t = X8664;
        assert_eq!(t.tp_addr(0x1000, 0x20, 8), 0x1020);
        assert_eq!(t.tp_addr(0x1000, 0x21, 16), 0x1030);
    }

    #[test]
    fn test_rel_names() {
        assert_eq!(rel_name(R_X86_64_PC32), Some("R_X86_64_PC32"));
        assert_eq!(rel_name(R_X86_64_TLSGD), Some("R_X86_64_TLSGD"));
        assert_eq!(rel_name(0xdead), None);
    }
}
