//! A multi-architecture ELF linker core
//!
//! The crate consumes relocatable objects, shared objects and archives as
//! in-memory buffers and produces a complete executable or shared object
//! image. The pipeline is strictly staged: parse, resolve, mark-live,
//! fold, merge, scan, build synthetics, lay out, range-extend, emit.
//! File discovery, command-line parsing and script expansion belong to
//! the driver; this library starts at bytes and ends at bytes.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;

pub mod arch;
pub mod context;
pub mod elf;
pub mod emit;
pub mod error;
pub mod gc;
pub mod hash;
pub mod icf;
pub mod input;
pub mod layout;
pub mod merge;
pub mod options;
pub mod output;
pub mod resolve;
pub mod scan;
pub mod script;
pub mod symbol;
pub mod thunks;

pub use context::Context;
pub use error::{Error, Result};
pub use options::LinkOptions;

use crate::arch::Target;
use crate::elf::Machine;
use crate::input::{
    archive::MemberData, file_kind, read_archive_members, FileKind, ObjectFile, SharedFile,
};

/// Identification string recorded in the output's `.comment` section
pub const IDENT: &str = concat!("sold ", env!("CARGO_PKG_VERSION"));

/// One input handed to [`link`]. Thin archive members carry only paths in
/// the archive itself; the driver resolves those paths and passes the
/// bytes alongside.
#[derive(Debug)]
pub struct LinkInput {
    pub name: String,
    pub data: Vec<u8>,
    /// `--as-needed` state at the point this input appeared
    pub as_needed: bool,
    /// (path, bytes) pairs for thin-archive members
    pub thin_members: Vec<(String, Vec<u8>)>,
}

impl LinkInput {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> LinkInput {
        LinkInput {
            name: name.into(),
            data,
            as_needed: false,
            thin_members: Vec::new(),
        }
    }
}

fn pick_target(options: &LinkOptions, inputs: &[LinkInput]) -> Result<&'static dyn Target> {
    let sniffed = inputs.iter().find_map(|input| {
        crate::elf::Ehdr::parse(&input.data)
            .and_then(|(ehdr, enc)| Machine::from_e_machine(ehdr.e_machine).map(|m| (m, enc)))
    });
    let machine = options
        .machine
        .or(sniffed.map(|(m, _)| m))
        .ok_or_else(|| Error::user("cannot determine target machine from inputs"))?;

    if machine == Machine::Arm32 {
        if let Some((_, enc)) = sniffed {
            if enc.endian == crate::elf::Endian::Big {
                return Ok(&arch::arm32::TARGET_BE);
            }
        }
    }
    arch::target_for(machine)
}

fn parse_inputs(cx: &mut Context, inputs: Vec<LinkInput>) -> Result<()> {
    let machine = cx.target.info().machine;
    let mut priority: u32 = 1;

    for input in inputs {
        match file_kind(&input.data) {
            FileKind::Empty => {}
            FileKind::Object => {
                let obj =
                    ObjectFile::parse(input.name, input.data, priority, false, machine)?;
                priority += 1;
                cx.objs.push(obj);
            }
            FileKind::SharedObject => {
                let dso = SharedFile::parse(
                    input.name,
                    input.data,
                    priority,
                    input.as_needed,
                    machine,
                )?;
                priority += 1;
                cx.dsos.push(dso);
            }
            FileKind::Archive | FileKind::ThinArchive => {
                let thin: HashMap<String, Vec<u8>> = input.thin_members.into_iter().collect();
                for member in read_archive_members(&input.name, &input.data)? {
                    let member_name = format!("{}({})", input.name, member.name);
                    let bytes = match member.data {
                        MemberData::Inline(range) => input.data[range].to_vec(),
                        MemberData::External(path) => thin
                            .get(&path)
                            .cloned()
                            .ok_or_else(|| {
                                Error::user(format!(
                                    "{member_name}: thin archive member bytes were not provided"
                                ))
                            })?,
                    };
                    match file_kind(&bytes) {
                        FileKind::Object => {
                            let obj = ObjectFile::parse(
                                member_name,
                                bytes,
                                priority,
                                true,
                                machine,
                            )?;
                            priority += 1;
                            cx.objs.push(obj);
                        }
                        FileKind::Empty => {}
                        FileKind::LlvmBitcode | FileKind::GccLto => {
                            return Err(Error::unsupported(
                                member_name,
                                "LTO objects must be handled by the LTO plugin",
                            ));
                        }
                        _ => {
                            return Err(Error::malformed(
                                member_name,
                                0,
                                "archive member is not a relocatable object",
                            ));
                        }
                    }
                }
            }
            FileKind::LlvmBitcode | FileKind::GccLto => {
                return Err(Error::unsupported(
                    input.name,
                    "LTO objects must be handled by the LTO plugin",
                ));
            }
            FileKind::Text => {
                return Err(Error::user(format!(
                    "{}: linker scripts must be expanded by the driver",
                    input.name
                )));
            }
            FileKind::Unknown => {
                return Err(Error::malformed(input.name, 0, "unrecognized file type"));
            }
        }
    }

    if cx.objs.is_empty() {
        return Err(Error::user("no input object files"));
    }
    Ok(())
}

/// Insert the linker identification into `.comment`
fn add_comment_string(cx: &mut Context) {
    use crate::elf::{SHF_MERGE, SHF_STRINGS, SHT_PROGBITS};
    let msec = merge::find_or_create(
        cx,
        ".comment".to_string(),
        SHF_MERGE | SHF_STRINGS,
        SHT_PROGBITS,
        1,
    );
    let mut text = IDENT.to_string();
    if let Some(cmdline) = &cx.options.append_cmdline_to_comment {
        text.push('\0');
        text.push_str(cmdline);
    }
    text.push('\0');
    let bytes = text.into_bytes();
    let hash = crate::hash::hash_bytes(&bytes);
    cx.merged[msec as usize].insert(&bytes, hash, 0, true);
    cx.comment_msec = Some(msec);
}

/// Feed the strings `.dynamic` will reference into `.dynstr`, then fix
/// the pool's size.
fn prepare_dynamic_strings(cx: &mut Context) {
    let mut strings: Vec<String> = Vec::new();
    for dso in &cx.dsos {
        if dso.is_alive {
            strings.push(dso.soname.clone());
        }
    }
    if !cx.options.rpaths.is_empty() {
        strings.push(cx.options.rpaths.clone());
    }
    if let Some(soname) = &cx.options.soname {
        strings.push(soname.clone());
    }
    if let Some(dynstr) = cx.refs.dynstr {
        if let output::ChunkKind::Dynstr(pool) = &mut cx.chunk_mut(dynstr).kind {
            for s in strings {
                pool.add(&s);
            }
        }
    }
}

fn finalize_dynstr_size(cx: &mut Context) {
    if let Some(dynstr) = cx.refs.dynstr {
        let size = match &cx.chunk(dynstr).kind {
            output::ChunkKind::Dynstr(pool) => pool.len() as u64,
            _ => 0,
        };
        cx.chunk_mut(dynstr).shdr.sh_size = size;
    }
}

/// Link the given inputs into a complete output image
pub fn link(options: LinkOptions, inputs: Vec<LinkInput>) -> Result<Vec<u8>> {
    options.validate()?;
    let target = pick_target(&options, &inputs)?;
    let mut cx = Context::new(options, target);
    log::debug!("target: {}", target.info().machine);

    // Stage 1: parse.
    parse_inputs(&mut cx, inputs)?;
    cx.diags.checkpoint()?;

    // Stage 2: resolve. Linker-defined names are interned first so the
    // entry point can pull its definition out of an archive.
    layout::define_linker_symbols(&mut cx);
    resolve::resolve_symbols(&mut cx)?;

    // Mergeable fragments exist once the surviving file set is known;
    // symbols into mergeable sections then resolve to fragments.
    merge::create_merged_sections(&mut cx);
    merge::register_fragments(&mut cx);
    merge::fix_mergeable_origins(&mut cx);
    add_comment_string(&mut cx);
    layout::mark_synthetic_symbols(&mut cx);

    // Export decisions feed both the GC root set and the scanner.
    resolve::compute_import_export(&mut cx);

    // Stage 3: mark-live.
    if cx.options.gc_sections {
        gc::gc_sections(&mut cx);
    }

    // Stage 4: fold.
    icf::fold_identical_sections(&mut cx);

    resolve::claim_unresolved_symbols(&mut cx)?;

    // Stage 5: merge offsets and output sections.
    layout::create_synthetic_chunks(&mut cx);
    output::osec::bin_sections(&mut cx);
    output::osec::compute_section_sizes(&mut cx);
    thunks::create_range_extension_thunks(&mut cx);

    if cx.options.relocatable || cx.options.emit_relocs {
        output::relocatable::prepare(&mut cx);
        output::relocatable::mark_group_sections(&mut cx);
    }

    if !cx.options.relocatable {
        // Stage 6: scan relocations; stage 7: populate the synthetics.
        scan::scan_relocations(&mut cx)?;
        prepare_dynamic_strings(&mut cx);
        output::dynsym::finalize_dynsym(&mut cx);
        output::versions::construct_verneed(&mut cx);
        finalize_dynstr_size(&mut cx);
        output::got::construct_got_relr(&mut cx);
        output::got::construct_osec_relr(&mut cx);
        layout::assign_reldyn_offsets(&mut cx);
        output::ehframe::construct(&mut cx);
        output::notes::update_note_sizes(&mut cx);
        output::dynamic::update_dynamic_size(&mut cx);
    }

    // Stage 8: lay out.
    layout::sort_chunks(&mut cx);
    layout::finalize_section_table(&mut cx);
    if cx.options.relocatable || cx.options.emit_relocs {
        output::relocatable::wire_links(&mut cx);
    }
    output::symtab::compute_symtab(&mut cx);
    layout::do_layout(&mut cx)?;
    emit::verify_layout(&cx)?;

    // Stages 9 and 10 happened inside layout (thunk addresses) and
    // happen now (bytes).
    let out = emit::emit(&mut cx)?;
    let out = emit::compress_debug_sections(&mut cx, out)?;
    cx.diags.checkpoint()?;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::elf::{
        Class, Encoding, Endian, Rel, Shdr, Sym, DT_NEEDED, DT_RELR, DT_RELRENT, DT_RELRSZ,
        ET_DYN, ET_EXEC, ET_REL, SHF_ALLOC, SHF_EXECINSTR, SHF_MERGE, SHF_STRINGS, SHF_TLS,
        SHF_WRITE, SHT_DYNAMIC, SHT_NOBITS, SHT_PROGBITS, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
        STB_GLOBAL, STT_FUNC, STT_NOTYPE, STT_OBJECT, STT_TLS, STV_HIDDEN,
    };

    const ENC: Encoding = Encoding {
        class: Class::Elf64,
        endian: Endian::Little,
    };

    #[derive(Clone)]
    struct TSec {
        name: &'static str,
        sh_type: u32,
        sh_flags: u64,
        addralign: u64,
        entsize: u64,
        data: Vec<u8>,
        /// (offset, r_type, symbol index, addend)
        rels: Vec<(u64, u32, usize, i64)>,
    }

    impl TSec {
        fn text(data: Vec<u8>) -> TSec {
            TSec {
                name: ".text",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                addralign: 16,
                entsize: 0,
                data,
                rels: Vec::new(),
            }
        }
    }

    #[derive(Clone)]
    struct TSym {
        name: &'static str,
        bind: u8,
        ty: u8,
        other: u8,
        /// 0 = undefined, SHN_ABS, or 1-based section index
        shndx: u32,
        value: u64,
        size: u64,
    }

    impl TSym {
        fn func(name: &'static str, shndx: u32, value: u64) -> TSym {
            TSym {
                name,
                bind: STB_GLOBAL,
                ty: STT_FUNC,
                other: 0,
                shndx,
                value,
                size: 1,
            }
        }

        fn undef(name: &'static str) -> TSym {
            TSym {
                name,
                bind: STB_GLOBAL,
                ty: STT_NOTYPE,
                other: 0,
                shndx: 0,
                value: 0,
                size: 0,
            }
        }
    }

    /// Assemble a minimal x86-64 relocatable object from section and
    /// symbol specs, using the crate's own record writers.
    fn build_object(secs: &[TSec], syms: &[TSym]) -> Vec<u8> {
        let align_to = |v: usize, a: usize| (v + a - 1) & !(a - 1);

        // Build .strtab and .shstrtab contents.
        let mut strtab = vec![0u8];
        let mut sym_name_offs = Vec::new();
        for sym in syms {
            sym_name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);
        }

        let mut shstrtab = vec![0u8];
        let mut name_off = |tab: &mut Vec<u8>, name: &str| -> u32 {
            let off = tab.len() as u32;
            tab.extend_from_slice(name.as_bytes());
            tab.push(0);
            off
        };

        // Section index map: 0 null, 1..=n user, then rela, symtab,
        // strtab, shstrtab.
        let nsec = secs.len();
        let rela_secs: Vec<usize> = (0..nsec).filter(|&i| !secs[i].rels.is_empty()).collect();
        let symtab_idx = 1 + nsec + rela_secs.len();
        let strtab_idx = symtab_idx + 1;
        let shstrtab_idx = strtab_idx + 1;
        let num_shdrs = shstrtab_idx + 1;

        let mut out: Vec<u8> = vec![0; crate::elf::Ehdr::size(Class::Elf64)];
        let mut shdrs: Vec<Shdr> = vec![Shdr::default(); num_shdrs];

        for (i, sec) in secs.iter().enumerate() {
            let off = align_to(out.len(), sec.addralign.max(1) as usize);
            out.resize(off, 0);
            out.extend_from_slice(&sec.data);
            shdrs[1 + i] = Shdr {
                sh_name: name_off(&mut shstrtab, sec.name),
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                sh_offset: off as u64,
                sh_size: sec.data.len() as u64,
                sh_addralign: sec.addralign,
                sh_entsize: sec.entsize,
                ..Shdr::default()
            };
            if sec.sh_type == SHT_NOBITS {
                out.truncate(off);
            }
        }

        for (k, &i) in rela_secs.iter().enumerate() {
            let off = align_to(out.len(), 8);
            out.resize(off, 0);
            let entsize = Rel::entry_size(Class::Elf64, true);
            let start = out.len();
            out.resize(start + secs[i].rels.len() * entsize, 0);
            for (j, &(r_offset, r_type, sym, r_addend)) in secs[i].rels.iter().enumerate() {
                Rel {
                    r_offset,
                    r_sym: sym as u32 + 1,
                    r_type,
                    r_addend,
                }
                .write_at(ENC, true, &mut out, start + j * entsize);
            }
            let mut rela_name = String::from(".rela");
            rela_name.push_str(secs[i].name);
            shdrs[1 + nsec + k] = Shdr {
                sh_name: name_off(&mut shstrtab, &rela_name),
                sh_type: SHT_RELA,
                sh_offset: off as u64,
                sh_size: (secs[i].rels.len() * entsize) as u64,
                sh_link: symtab_idx as u32,
                sh_info: 1 + i as u32,
                sh_addralign: 8,
                sh_entsize: entsize as u64,
                ..Shdr::default()
            };
        }

        // Symbol table: null entry, then everything as globals.
        let off = align_to(out.len(), 8);
        out.resize(off, 0);
        let entsize = Sym::size(Class::Elf64);
        let start = out.len();
        out.resize(start + (syms.len() + 1) * entsize, 0);
        for (i, sym) in syms.iter().enumerate() {
            Sym {
                st_name: sym_name_offs[i],
                st_info: Sym::info(sym.bind, sym.ty),
                st_other: sym.other,
                st_shndx: sym.shndx,
                st_value: sym.value,
                st_size: sym.size,
            }
            .write_at(ENC, &mut out, start + (i + 1) * entsize);
        }
        shdrs[symtab_idx] = Shdr {
            sh_name: name_off(&mut shstrtab, ".symtab"),
            sh_type: SHT_SYMTAB,
            sh_offset: off as u64,
            sh_size: ((syms.len() + 1) * entsize) as u64,
            sh_link: strtab_idx as u32,
            sh_info: 1, // all symbols are global
            sh_addralign: 8,
            sh_entsize: entsize as u64,
            ..Shdr::default()
        };

        let off = out.len();
        out.extend_from_slice(&strtab);
        shdrs[strtab_idx] = Shdr {
            sh_name: name_off(&mut shstrtab, ".strtab"),
            sh_type: SHT_STRTAB,
            sh_offset: off as u64,
            sh_size: strtab.len() as u64,
            sh_addralign: 1,
            ..Shdr::default()
        };

        let shstrtab_name = name_off(&mut shstrtab, ".shstrtab");
        let off = out.len();
        out.extend_from_slice(&shstrtab);
        shdrs[shstrtab_idx] = Shdr {
            sh_name: shstrtab_name,
            sh_type: SHT_STRTAB,
            sh_offset: off as u64,
            sh_size: shstrtab.len() as u64,
            sh_addralign: 1,
            ..Shdr::default()
        };

        let shoff = align_to(out.len(), 8);
        out.resize(shoff + num_shdrs * Shdr::size(Class::Elf64), 0);
        for (i, shdr) in shdrs.iter().enumerate() {
            shdr.write_at(ENC, &mut out, shoff + i * Shdr::size(Class::Elf64));
        }

        let ehdr = crate::elf::Ehdr {
            class: crate::elf::ELFCLASS64,
            data: crate::elf::ELFDATA2LSB,
            osabi: 0,
            e_type: ET_REL,
            e_machine: crate::elf::EM_X86_64,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: shoff as u64,
            e_flags: 0,
            e_phentsize: 0,
            e_phnum: 0,
            e_shentsize: Shdr::size(Class::Elf64) as u16,
            e_shnum: num_shdrs as u16,
            e_shstrndx: shstrtab_idx as u16,
        };
        ehdr.write(ENC, &mut out);
        out
    }

    // ---- output inspection helpers ----

    fn sections(out: &[u8]) -> Vec<(String, Shdr)> {
        let (ehdr, enc) = crate::elf::Ehdr::parse(out).unwrap();
        let mut shdrs = Vec::new();
        for i in 0..ehdr.e_shnum as usize {
            let off = ehdr.e_shoff as usize + i * Shdr::size(enc.class);
            shdrs.push(Shdr::parse_at(enc, out, off).unwrap());
        }
        let strtab = &shdrs[ehdr.e_shstrndx as usize];
        let names = &out[strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize];
        shdrs
            .iter()
            .map(|s| {
                let rest = &names[s.sh_name as usize..];
                let end = rest.iter().position(|&b| b == 0).unwrap_or(0);
                (String::from_utf8_lossy(&rest[..end]).to_string(), *s)
            })
            .collect()
    }

    fn section(out: &[u8], name: &str) -> Option<Shdr> {
        sections(out)
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    fn out_symbols(out: &[u8]) -> Vec<(String, Sym)> {
        let secs = sections(out);
        let (_, symtab) = secs
            .iter()
            .find(|(n, s)| n == ".symtab" && s.sh_type == SHT_SYMTAB)
            .unwrap();
        let strtab = &secs[symtab.sh_link as usize].1;
        let names = &out[strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize];
        let n = symtab.sh_size as usize / Sym::size(Class::Elf64);
        (0..n)
            .map(|i| {
                let sym = Sym::parse_at(
                    ENC,
                    out,
                    symtab.sh_offset as usize + i * Sym::size(Class::Elf64),
                )
                .unwrap();
                let rest = &names[sym.st_name as usize..];
                let end = rest.iter().position(|&b| b == 0).unwrap_or(0);
                (String::from_utf8_lossy(&rest[..end]).to_string(), sym)
            })
            .collect()
    }

    fn sym_value(out: &[u8], name: &str) -> Option<u64> {
        out_symbols(out)
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.st_value)
    }

    fn dyn_tags(out: &[u8]) -> Vec<(u64, u64)> {
        let Some(dynamic) = sections(out)
            .into_iter()
            .find(|(_, s)| s.sh_type == SHT_DYNAMIC)
            .map(|(_, s)| s)
        else {
            return Vec::new();
        };
        let mut tags = Vec::new();
        for off in (0..dynamic.sh_size as usize).step_by(16) {
            let dy =
                crate::elf::Dyn::parse_at(ENC, out, dynamic.sh_offset as usize + off).unwrap();
            tags.push((dy.d_tag, dy.d_val));
        }
        tags
    }

    fn exec_options() -> LinkOptions {
        LinkOptions::builder().static_(true).build()
    }

    // ---- tests ----

    #[test]
    fn test_rejects_inputs_without_objects() {
        let opts = LinkOptions::builder().build();
        let err = link(opts, vec![]).unwrap_err();
        assert!(matches!(err, Error::UserError(_)));
    }

    #[test]
    fn test_rejects_linker_script_text() {
        let opts = LinkOptions::builder().machine(Machine::X86_64).build();
        let err = link(
            opts,
            vec![LinkInput::new("libc.so", b"GROUP(libc.so.6)\n".to_vec())],
        )
        .unwrap_err();
        assert!(matches!(err, Error::UserError(_)));
    }

    #[test]
    fn test_static_executable_with_merged_strings() {
        let rodata = TSec {
            name: ".rodata.str1.1",
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
            addralign: 1,
            entsize: 1,
            data: b"hi\0".to_vec(),
            rels: Vec::new(),
        };
        let mut text1 = TSec::text(vec![0xe8, 0, 0, 0, 0, 0xc3]);
        text1.rels = vec![(1, crate::arch::x86_64::R_X86_64_PLT32, 1, -4)];
        let obj1 = build_object(
            &[text1, rodata.clone()],
            &[TSym::func("_start", 1, 0), TSym::undef("puts")],
        );

        let obj2 = build_object(
            &[TSec::text(vec![0xc3]), rodata],
            &[TSym::func("puts", 1, 0)],
        );

        let out = link(
            exec_options(),
            vec![
                LinkInput::new("main.o", obj1),
                LinkInput::new("puts.o", obj2),
            ],
        )
        .unwrap();

        let (ehdr, _) = crate::elf::Ehdr::parse(&out).unwrap();
        assert_eq!(ehdr.e_type, ET_EXEC);
        assert_eq!(Some(ehdr.e_entry), sym_value(&out, "_start"));
        assert!(ehdr.e_entry != 0);

        // Both files contributed the same string; one copy survives.
        let merged = section(&out, ".rodata.str1.1").unwrap();
        assert_eq!(merged.sh_size, 3);

        assert!(section(&out, ".dynamic").is_none());

        // The call was resolved to the local puts, no PLT was made.
        assert!(section(&out, ".plt").is_none());
    }

    #[test]
    fn test_archive_member_extraction() {
        let mut text1 = TSec::text(vec![0xe8, 0, 0, 0, 0, 0xc3]);
        text1.rels = vec![(1, crate::arch::x86_64::R_X86_64_PLT32, 1, -4)];
        let obj1 = build_object(
            &[text1],
            &[TSym::func("_start", 1, 0), TSym::undef("helper")],
        );
        let member = build_object(&[TSec::text(vec![0xc3])], &[TSym::func("helper", 1, 0)]);
        let unused = build_object(&[TSec::text(vec![0xc3])], &[TSym::func("unused", 1, 0)]);

        // Pack both members into an archive.
        let mut ar = b"!<arch>\n".to_vec();
        for (name, data) in [("helper.o/", &member), ("unused.o/", &unused)] {
            let mut hdr = vec![b' '; 60];
            hdr[..name.len()].copy_from_slice(name.as_bytes());
            let size = data.len().to_string();
            hdr[48..48 + size.len()].copy_from_slice(size.as_bytes());
            hdr[58] = b'`';
            hdr[59] = b'\n';
            ar.extend(hdr);
            ar.extend(data.iter());
            if ar.len() % 2 == 1 {
                ar.push(b'\n');
            }
        }

        let out = link(
            exec_options(),
            vec![
                LinkInput::new("main.o", obj1),
                LinkInput::new("libhelper.a", ar),
            ],
        )
        .unwrap();
        assert!(sym_value(&out, "helper").unwrap() != 0);
        // The unused member must not be pulled in.
        assert!(sym_value(&out, "unused").is_none());
    }

    #[test]
    fn test_icf_folds_identical_functions() {
        let obj1 = build_object(
            &[
                TSec::text(vec![0xc3]),
                TSec {
                    name: ".text.f1",
                    sh_type: SHT_PROGBITS,
                    sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                    addralign: 1,
                    entsize: 0,
                    data: vec![0x31, 0xc0, 0xc3],
                    rels: Vec::new(),
                },
            ],
            &[TSym::func("_start", 1, 0), TSym::func("f1", 2, 0)],
        );
        let obj2 = build_object(
            &[TSec {
                name: ".text.f2",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                addralign: 1,
                entsize: 0,
                data: vec![0x31, 0xc0, 0xc3],
                rels: Vec::new(),
            }],
            &[TSym::func("f2", 1, 0)],
        );

        let opts = LinkOptions::builder()
            .static_(true)
            .icf(crate::options::IcfMode::All)
            .build();
        let out = link(
            opts,
            vec![LinkInput::new("a.o", obj1), LinkInput::new("b.o", obj2)],
        )
        .unwrap();
        let f1 = sym_value(&out, "f1").unwrap();
        let f2 = sym_value(&out, "f2").unwrap();
        assert_eq!(f1, f2);
        assert!(f1 != 0);
    }

    #[test]
    fn test_gc_sections_drops_unreferenced() {
        let mut text = TSec::text(vec![0xe8, 0, 0, 0, 0, 0xc3]);
        text.rels = vec![(1, crate::arch::x86_64::R_X86_64_PLT32, 1, -4)];
        let keep = TSec {
            name: ".keepsec",
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            addralign: 1,
            entsize: 0,
            data: vec![0xc3],
            rels: Vec::new(),
        };
        let dead = TSec {
            name: ".deadsec",
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            addralign: 1,
            entsize: 0,
            data: vec![0xc3],
            rels: Vec::new(),
        };
        let obj = build_object(
            &[text, keep, dead],
            &[
                TSym::func("_start", 1, 0),
                TSym::func("f_live", 2, 0),
                TSym::func("f_dead", 3, 0),
            ],
        );

        let opts = LinkOptions::builder()
            .static_(true)
            .gc_sections(true)
            .build();
        let out = link(opts, vec![LinkInput::new("main.o", obj)]).unwrap();
        assert!(section(&out, ".keepsec").is_some());
        assert!(section(&out, ".deadsec").is_none());
        assert!(sym_value(&out, "f_live").unwrap() != 0);
    }

    #[test]
    fn test_shared_object_with_packed_relr() {
        // 1000 function pointers, all needing base relocations.
        let mut data_rels = Vec::new();
        for i in 0..1000u64 {
            data_rels.push((i * 8, crate::arch::x86_64::R_X86_64_QUAD, 0, 0i64));
        }
        let data = TSec {
            name: ".data",
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_WRITE,
            addralign: 8,
            entsize: 0,
            data: vec![0; 8000],
            rels: data_rels,
        };
        let anchor = TSym {
            name: "anchor",
            bind: STB_GLOBAL,
            ty: STT_FUNC,
            other: STV_HIDDEN,
            shndx: 2,
            value: 0,
            size: 1,
        };
        let obj = build_object(&[data, TSec::text(vec![0xc3])], &[anchor]);

        let opts = LinkOptions::builder()
            .shared(true)
            .soname("libtest.so")
            .pack_dyn_relocs_relr(true)
            .z_now(true)
            .build();
        let out = link(opts, vec![LinkInput::new("ptrs.o", obj)]).unwrap();

        let (ehdr, _) = crate::elf::Ehdr::parse(&out).unwrap();
        assert_eq!(ehdr.e_type, ET_DYN);

        // 1000 word slots pack into one address word plus ceil(999/63)
        // bitmaps.
        let relr = section(&out, ".relr.dyn").unwrap();
        assert_eq!(relr.sh_size, (1 + 999u64.div_ceil(63)) * 8);
        assert!(section(&out, ".rela.dyn").is_none());

        let tags = dyn_tags(&out);
        assert!(tags.iter().any(|&(t, _)| t == DT_RELR));
        assert!(tags
            .iter()
            .any(|&(t, v)| t == DT_RELRSZ && v == relr.sh_size));
        assert!(tags.iter().any(|&(t, v)| t == DT_RELRENT && v == 8));
        assert!(tags
            .iter()
            .any(|&(t, v)| t == crate::elf::DT_FLAGS_1 && v & crate::elf::DF_1_NOW != 0));
    }

    fn build_test_dso(sym: TSym, sec: TSec) -> Vec<u8> {
        let obj = build_object(&[sec], &[sym]);
        let opts = LinkOptions::builder()
            .shared(true)
            .soname("libtest.so.1")
            .build();
        link(opts, vec![LinkInput::new("dso.o", obj)]).unwrap()
    }

    #[test]
    fn test_plt_for_imported_function() {
        let dso = build_test_dso(TSym::func("printf", 1, 0), TSec::text(vec![0xc3]));

        let mut text = TSec::text(vec![0xe8, 0, 0, 0, 0, 0xc3]);
        text.rels = vec![(1, crate::arch::x86_64::R_X86_64_PLT32, 1, -4)];
        let obj = build_object(
            &[text],
            &[TSym::func("_start", 1, 0), TSym::undef("printf")],
        );

        let opts = LinkOptions::builder()
            .pie(true)
            .dynamic_linker("/lib64/ld-linux-x86-64.so.2")
            .build();
        let out = link(
            opts,
            vec![
                LinkInput::new("main.o", obj),
                LinkInput::new("libtest.so.1", dso),
            ],
        )
        .unwrap();

        // One PLT entry, one lazy GOT slot, one jump-slot relocation.
        let plt = section(&out, ".plt").unwrap();
        assert_eq!(plt.sh_size, 32 + 16);
        let gotplt = section(&out, ".got.plt").unwrap();
        assert_eq!(gotplt.sh_size, 24 + 8);
        let relplt = section(&out, ".rela.plt").unwrap();
        assert_eq!(relplt.sh_size, 24);
        let rel = Rel::parse_at(ENC, true, &out, relplt.sh_offset as usize).unwrap();
        assert_eq!(rel.r_type, crate::arch::x86_64::R_X86_64_JUMP_SLOT);

        assert!(section(&out, ".interp").is_some());
        assert!(section(&out, ".copyrel").is_none());
        assert!(dyn_tags(&out).iter().any(|&(t, _)| t == DT_NEEDED));
    }

    #[test]
    fn test_copy_relocation_for_imported_data() {
        let dso = build_test_dso(
            TSym {
                name: "environ",
                bind: STB_GLOBAL,
                ty: STT_OBJECT,
                other: 0,
                shndx: 1,
                value: 0,
                size: 8,
            },
            TSec {
                name: ".data",
                sh_type: SHT_PROGBITS,
                sh_flags: SHF_ALLOC | SHF_WRITE,
                addralign: 8,
                entsize: 0,
                data: vec![0; 8],
                rels: Vec::new(),
            },
        );

        let mut text = TSec::text(vec![0x8b, 0x05, 0, 0, 0, 0, 0xc3]);
        text.rels = vec![(2, crate::arch::x86_64::R_X86_64_PC32, 1, -4)];
        let obj = build_object(
            &[text],
            &[TSym::func("_start", 1, 0), TSym::undef("environ")],
        );

        let opts = LinkOptions::builder()
            .dynamic_linker("/lib64/ld-linux-x86-64.so.2")
            .build();
        let out = link(
            opts,
            vec![
                LinkInput::new("main.o", obj),
                LinkInput::new("libtest.so.1", dso),
            ],
        )
        .unwrap();

        let copyrel = section(&out, ".copyrel").unwrap();
        assert_eq!(copyrel.sh_type, SHT_NOBITS);
        assert_eq!(copyrel.sh_size, 8);

        let reladyn = section(&out, ".rela.dyn").unwrap();
        let mut found_copy = false;
        for off in (0..reladyn.sh_size as usize).step_by(24) {
            let rel = Rel::parse_at(ENC, true, &out, reladyn.sh_offset as usize + off).unwrap();
            if rel.r_type == crate::arch::x86_64::R_X86_64_COPY {
                found_copy = true;
            }
        }
        assert!(found_copy);
    }

    #[test]
    fn test_tls_gd_relaxed_to_le_in_executable() {
        let tdata = TSec {
            name: ".tdata",
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_WRITE | SHF_TLS,
            addralign: 4,
            entsize: 0,
            data: vec![1, 0, 0, 0],
            rels: Vec::new(),
        };
        // lea foo@tlsgd(%rip), %rdi; call __tls_get_addr; ret
        let mut text = TSec::text(vec![
            0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, // lea
            0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0, // call
            0xc3,
        ]);
        text.rels = vec![
            (4, crate::arch::x86_64::R_X86_64_TLSGD, 1, -4),
            (12, crate::arch::x86_64::R_X86_64_PLT32, 2, -4),
        ];
        let obj = build_object(
            &[text, tdata],
            &[
                TSym::func("_start", 1, 0),
                TSym {
                    name: "x",
                    bind: STB_GLOBAL,
                    ty: STT_TLS,
                    other: 0,
                    shndx: 2,
                    value: 0,
                    size: 4,
                },
                TSym::func("__tls_get_addr", 1, 16),
            ],
        );

        let out = link(exec_options(), vec![LinkInput::new("tls.o", obj)]).unwrap();

        // The GD pair is rewritten to mov %fs:0, %rax; add $tpoff, %rax.
        let text = section(&out, ".text").unwrap();
        let code = &out[text.sh_offset as usize..text.sh_offset as usize + 16];
        assert_eq!(&code[0..5], &[0x64, 0x48, 0x8b, 0x04, 0x25]);
        assert_eq!(&code[9..12], &[0x48, 0x81, 0xc0]);

        // No dynamic relocations exist at all in the static output.
        assert!(section(&out, ".rela.dyn").is_none());
        // The TP offset of the first TLS variable is -4 (variant 2).
        let tpoff = i32::from_le_bytes(code[12..16].try_into().unwrap());
        assert_eq!(tpoff, -4);
    }

    #[test]
    fn test_relocatable_output() {
        let mut text = TSec::text(vec![0xe8, 0, 0, 0, 0, 0xc3]);
        text.rels = vec![(1, crate::arch::x86_64::R_X86_64_PLT32, 1, -4)];
        let obj1 = build_object(
            &[text],
            &[TSym::func("_start", 1, 0), TSym::undef("helper")],
        );
        let obj2 = build_object(&[TSec::text(vec![0xc3])], &[TSym::func("helper", 1, 0)]);

        let opts = LinkOptions::builder()
            .machine(Machine::X86_64)
            .relocatable(true)
            .build();
        let out = link(
            opts,
            vec![LinkInput::new("a.o", obj1), LinkInput::new("b.o", obj2)],
        )
        .unwrap();

        let (ehdr, _) = crate::elf::Ehdr::parse(&out).unwrap();
        assert_eq!(ehdr.e_type, ET_REL);
        assert_eq!(ehdr.e_phnum, 0);
        let rela = section(&out, ".rela.text").unwrap();
        assert_eq!(rela.sh_size, 24);
        assert!(section(&out, ".symtab").is_some());
    }

    #[test]
    fn test_relink_is_deterministic() {
        let obj = build_object(&[TSec::text(vec![0xc3])], &[TSym::func("_start", 1, 0)]);
        let out1 = link(
            exec_options(),
            vec![LinkInput::new("main.o", obj.clone())],
        )
        .unwrap();
        let out2 = link(exec_options(), vec![LinkInput::new("main.o", obj)]).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn test_layout_invariants_hold() {
        let obj = build_object(
            &[
                TSec::text(vec![0xc3; 100]),
                TSec {
                    name: ".data",
                    sh_type: SHT_PROGBITS,
                    sh_flags: SHF_ALLOC | SHF_WRITE,
                    addralign: 8,
                    entsize: 0,
                    data: vec![0; 64],
                    rels: Vec::new(),
                },
                TSec {
                    name: ".bss",
                    sh_type: SHT_NOBITS,
                    sh_flags: SHF_ALLOC | SHF_WRITE,
                    addralign: 16,
                    entsize: 0,
                    data: vec![0; 256],
                    rels: Vec::new(),
                },
            ],
            &[TSym::func("_start", 1, 0)],
        );
        let out = link(exec_options(), vec![LinkInput::new("main.o", obj)]).unwrap();

        // PT_LOAD congruence straight from the emitted program headers.
        let (ehdr, enc) = crate::elf::Ehdr::parse(&out).unwrap();
        for i in 0..ehdr.e_phnum as usize {
            let p = crate::elf::Phdr::parse_at(
                enc,
                &out,
                ehdr.e_phoff as usize + i * crate::elf::Phdr::size(Class::Elf64),
            )
            .unwrap();
            if p.p_type == crate::elf::PT_LOAD && p.p_align > 1 {
                assert_eq!(p.p_vaddr % p.p_align, p.p_offset % p.p_align);
            }
            if p.p_type == crate::elf::PT_GNU_RELRO {
                assert_eq!((p.p_vaddr + p.p_memsz) % 4096, 0);
            }
        }

        // The alive members got disjoint, aligned offsets.
        let text = section(&out, ".text").unwrap();
        assert_eq!(text.sh_size, 100);
        let bss = section(&out, ".bss").unwrap();
        assert_eq!(bss.sh_addr % 16, 0);
        assert_eq!(bss.sh_size, 256);
    }
}
