//! Relocatable object parsing
//!
//! One pass over the section header table classifies every section, decodes
//! the symbol and relocation tables, claims comdat-group records, splits
//! mergeable sections into pieces and `.eh_frame` into CIE/FDE records.

use std::sync::atomic::AtomicBool;

use crate::elf::{
    Ehdr, Encoding, Machine, Rel, Shdr, Sym, GRP_COMDAT, SHF_COMPRESSED, SHF_EXCLUDE, SHF_MERGE,
    SHF_STRINGS, SHN_LORESERVE, SHN_XINDEX, SHT_ARM_ATTRIBUTES, SHT_CREL, SHT_GROUP, SHT_NOBITS,
    SHT_NULL, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB, SHT_SYMTAB_SHNDX, STT_SECTION,
};
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::input::ehframe::{CieRecord, FdeRecord};
use crate::input::{crel, InputSection, MapKind, MappingSymbol, MergeableSection};
use crate::symbol::SymbolId;

#[derive(Debug, Clone)]
/// A comdat group found in this file; ownership is decided during resolution
pub struct ComdatGroupRef {
    pub signature: String,
    pub members: Vec<u32>,
}

/// A parsed relocatable object
#[derive(Debug)]
pub struct ObjectFile {
    pub name: String,
    pub data: Vec<u8>,
    pub enc: Encoding,
    /// Command-line position; lower wins resolution ties
    pub priority: u32,
    /// Extracted archive members start dead and are revived by the resolver
    pub is_alive: bool,
    pub in_archive: bool,

    pub ehdr: Ehdr,
    pub shdrs: Vec<Shdr>,
    pub sections: Vec<Option<InputSection>>,
    pub mergeable: Vec<Option<MergeableSection>>,
    pub elf_syms: Vec<Sym>,
    pub sym_names: Vec<String>,
    /// Version suffix parsed off each symbol name (`foo@VER` / `foo@@VER`)
    pub sym_vers: Vec<Option<(String, bool)>>,
    pub first_global: usize,
    /// Resolved symbol handles, parallel to `elf_syms`
    pub symbols: Vec<SymbolId>,
    /// All decoded relocations; sections hold ranges into this
    pub rels: Vec<Rel>,

    pub cies: Vec<CieRecord>,
    pub fdes: Vec<FdeRecord>,
    pub comdat_groups: Vec<ComdatGroupRef>,
    pub mapping_symbols: Vec<MappingSymbol>,
    /// `GNU_PROPERTY_X86_FEATURE_1_AND` bits, if the note is present
    pub feature_1_and: Option<u32>,

    // Output symbol table bookkeeping, filled during layout
    pub output_sym_indices: Vec<i32>,
    pub local_symtab_idx: usize,
    pub global_symtab_idx: usize,
    pub num_local_symtab: usize,
    pub num_global_symtab: usize,
    pub strtab_size: usize,
    pub strtab_offset: usize,

    // .eh_frame output bookkeeping
    pub fde_idx: usize,
    pub fde_offset: usize,
    pub fde_size: usize,
}

fn cstr_at(data: &[u8], offset: usize) -> Option<&str> {
    let rest = data.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

impl ObjectFile {
    pub fn section_bytes(&self, isec: &InputSection) -> &[u8] {
        &self.data[isec.contents.clone()]
    }

    pub fn section_rels(&self, isec: &InputSection) -> &[Rel] {
        &self.rels[isec.rels.start as usize..isec.rels.end as usize]
    }

    pub fn parse(
        name: String,
        data: Vec<u8>,
        priority: u32,
        in_archive: bool,
        machine: Machine,
    ) -> Result<ObjectFile> {
        let (ehdr, enc) = Ehdr::parse(&data)
            .ok_or_else(|| Error::malformed(&name, 0, "not a valid ELF relocatable object"))?;

        match Machine::from_e_machine(ehdr.e_machine) {
            Some(m) if m == machine => {}
            Some(m) => {
                return Err(Error::malformed(
                    &name,
                    18,
                    format!("incompatible machine type: expected {machine}, got {m}"),
                ))
            }
            None => {
                return Err(Error::UnsupportedMachine {
                    machine: format!("{:#x}", ehdr.e_machine),
                })
            }
        }

        let mut file = ObjectFile {
            name,
            data,
            enc,
            priority,
            is_alive: !in_archive,
            in_archive,
            ehdr,
            shdrs: Vec::new(),
            sections: Vec::new(),
            mergeable: Vec::new(),
            elf_syms: Vec::new(),
            sym_names: Vec::new(),
            sym_vers: Vec::new(),
            first_global: 0,
            symbols: Vec::new(),
            rels: Vec::new(),
            cies: Vec::new(),
            fdes: Vec::new(),
            comdat_groups: Vec::new(),
            mapping_symbols: Vec::new(),
            feature_1_and: None,
            output_sym_indices: Vec::new(),
            local_symtab_idx: 0,
            global_symtab_idx: 0,
            num_local_symtab: 0,
            num_global_symtab: 0,
            strtab_size: 0,
            strtab_offset: 0,
            fde_idx: 0,
            fde_offset: 0,
            fde_size: 0,
        };

        file.parse_shdrs()?;
        file.parse_symtab()?;
        file.parse_sections(machine)?;
        file.decode_relocations()?;
        file.parse_ehframe()?;
        if machine == Machine::Arm32 {
            file.collect_mapping_symbols();
        }
        Ok(file)
    }

    fn parse_shdrs(&mut self) -> Result<()> {
        let enc = self.enc;
        if self.ehdr.e_shoff == 0 {
            return Ok(());
        }
        let shoff = self.ehdr.e_shoff as usize;
        let first = Shdr::parse_at(enc, &self.data, shoff)
            .ok_or_else(|| Error::malformed(&self.name, shoff as u64, "truncated section headers"))?;

        // A file with 0xff00 or more sections stores the real counts in the
        // otherwise-unused fields of section header zero.
        let count = if self.ehdr.e_shnum == 0 {
            first.sh_size as usize
        } else {
            self.ehdr.e_shnum as usize
        };

        let mut shdrs = Vec::with_capacity(count);
        for i in 0..count {
            let off = shoff + i * Shdr::size(enc.class);
            let shdr = Shdr::parse_at(enc, &self.data, off).ok_or_else(|| {
                Error::malformed(&self.name, off as u64, "truncated section headers")
            })?;
            if shdr.sh_type != SHT_NOBITS
                && shdr.sh_type != SHT_NULL
                && shdr
                    .sh_offset
                    .checked_add(shdr.sh_size)
                    .map(|end| end > self.data.len() as u64)
                    .unwrap_or(true)
            {
                return Err(Error::malformed(
                    &self.name,
                    off as u64,
                    format!("section {i} extends past end of file"),
                ));
            }
            shdrs.push(shdr);
        }
        self.shdrs = shdrs;
        Ok(())
    }

    fn shstrtab(&self) -> Result<&[u8]> {
        let idx = if self.ehdr.e_shstrndx as u32 == SHN_XINDEX {
            self.shdrs.first().map(|s| s.sh_link).unwrap_or(0) as usize
        } else {
            self.ehdr.e_shstrndx as usize
        };
        let shdr = self
            .shdrs
            .get(idx)
            .ok_or_else(|| Error::malformed(&self.name, 0, "bad e_shstrndx"))?;
        Ok(&self.data[shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize])
    }

    fn section_name(&self, shdr: &Shdr) -> Result<String> {
        let strtab = self.shstrtab()?;
        cstr_at(strtab, shdr.sh_name as usize)
            .map(str::to_owned)
            .ok_or_else(|| {
                Error::malformed(&self.name, shdr.sh_name as u64, "bad section name offset")
            })
    }

    fn parse_symtab(&mut self) -> Result<()> {
        let enc = self.enc;
        let Some(symtab_idx) = self.shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB) else {
            return Ok(());
        };
        let symtab = self.shdrs[symtab_idx];
        let entsize = Sym::size(enc.class) as u64;
        if symtab.sh_size % entsize != 0 {
            return Err(Error::malformed(
                &self.name,
                symtab.sh_offset,
                "symbol table size is not a multiple of the entry size",
            ));
        }
        let count = (symtab.sh_size / entsize) as usize;
        self.first_global = (symtab.sh_info as usize).min(count);

        let strtab_shdr = self
            .shdrs
            .get(symtab.sh_link as usize)
            .filter(|s| s.sh_type == SHT_STRTAB)
            .ok_or_else(|| Error::malformed(&self.name, symtab.sh_offset, "bad symtab sh_link"))?;
        let strtab_range =
            strtab_shdr.sh_offset as usize..(strtab_shdr.sh_offset + strtab_shdr.sh_size) as usize;

        // SHT_SYMTAB_SHNDX holds the real section indices for symbols whose
        // st_shndx is SHN_XINDEX.
        let shndx_tab: Option<&Shdr> = self
            .shdrs
            .iter()
            .find(|s| s.sh_type == SHT_SYMTAB_SHNDX && s.sh_link as usize == symtab_idx);

        let mut syms = Vec::with_capacity(count);
        let mut names = Vec::with_capacity(count);
        let mut vers = Vec::with_capacity(count);
        for i in 0..count {
            let off = symtab.sh_offset as usize + i * entsize as usize;
            let mut sym = Sym::parse_at(enc, &self.data, off)
                .ok_or_else(|| Error::malformed(&self.name, off as u64, "truncated symbol table"))?;
            if sym.st_shndx == SHN_XINDEX {
                let tab = shndx_tab.ok_or_else(|| {
                    Error::malformed(&self.name, off as u64, "SHN_XINDEX without SHT_SYMTAB_SHNDX")
                })?;
                sym.st_shndx = enc
                    .u32_at(&self.data, tab.sh_offset as usize + i * 4)
                    .ok_or_else(|| {
                        Error::malformed(&self.name, tab.sh_offset, "truncated SHT_SYMTAB_SHNDX")
                    })?;
            }
            if sym.st_shndx < SHN_LORESERVE && sym.st_shndx as usize >= self.shdrs.len() {
                return Err(Error::malformed(
                    &self.name,
                    off as u64,
                    format!("symbol {i} has an out-of-range section index"),
                ));
            }

            let full_name = cstr_at(&self.data[strtab_range.clone()], sym.st_name as usize)
                .ok_or_else(|| Error::malformed(&self.name, off as u64, "bad symbol name offset"))?
                .to_owned();

            // Split a version suffix. "@@" marks the default version.
            let (base, ver) = match full_name.find('@') {
                Some(pos) if i >= self.first_global => {
                    let (n, rest) = full_name.split_at(pos);
                    let is_default = rest.starts_with("@@");
                    let v = rest.trim_start_matches('@').to_string();
                    (n.to_string(), Some((v, is_default)))
                }
                _ => (full_name, None),
            };

            syms.push(sym);
            names.push(base);
            vers.push(ver);
        }
        self.elf_syms = syms;
        self.sym_names = names;
        self.sym_vers = vers;
        self.output_sym_indices = vec![-1; count];
        Ok(())
    }

    fn parse_sections(&mut self, machine: Machine) -> Result<()> {
        let nsec = self.shdrs.len();
        let mut sections: Vec<Option<InputSection>> = Vec::with_capacity(nsec);
        let mut mergeable: Vec<Option<MergeableSection>> = Vec::with_capacity(nsec);
        let mut groups = Vec::new();

        for i in 0..nsec {
            let shdr = self.shdrs[i];
            sections.push(None);
            mergeable.push(None);

            match shdr.sh_type {
                SHT_NULL | SHT_SYMTAB | SHT_STRTAB | SHT_SYMTAB_SHNDX | SHT_REL | SHT_RELA
                | SHT_CREL => continue,
                SHT_GROUP => {
                    groups.push(self.parse_group(i)?);
                    continue;
                }
                SHT_ARM_ATTRIBUTES if matches!(machine, Machine::Arm32 | Machine::Riscv) => {
                    continue;
                }
                _ => {}
            }

            if shdr.sh_flags & SHF_EXCLUDE != 0 {
                continue;
            }
            if shdr.sh_flags & SHF_COMPRESSED != 0 {
                return Err(Error::unsupported(
                    &self.name,
                    "compressed input sections require an external decompressor",
                ));
            }

            let name = self.section_name(&shdr)?;
            if name == ".note.gnu.property" {
                self.parse_gnu_property(&shdr)?;
                continue;
            }

            let p2align = if shdr.sh_addralign <= 1 {
                0
            } else {
                if !shdr.sh_addralign.is_power_of_two() {
                    return Err(Error::malformed(
                        &self.name,
                        shdr.sh_offset,
                        format!("section {name} has a non-power-of-two alignment"),
                    ));
                }
                shdr.sh_addralign.trailing_zeros() as u8
            };

            let contents = if shdr.sh_type == SHT_NOBITS {
                0..0
            } else {
                shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize
            };

            sections[i] = Some(InputSection {
                shndx: i as u32,
                name,
                shdr,
                contents,
                rels: 0..0,
                fde_begin: 0,
                fde_end: 0,
                p2align,
                offset: 0,
                osec: None,
                is_alive: AtomicBool::new(true),
                is_visited: AtomicBool::new(false),
                address_taken: AtomicBool::new(false),
                leader: None,
                exidx: None,
            });
        }

        // Mergeable promotion. A section with SHF_MERGE and a usable element
        // size moves its contents into a MergedSection; the InputSection
        // itself drops out of layout.
        for i in 0..nsec {
            let Some(isec) = &sections[i] else { continue };
            let shdr = isec.shdr;
            if shdr.sh_flags & SHF_MERGE == 0 || shdr.sh_type == SHT_NOBITS || shdr.sh_size == 0 {
                continue;
            }
            let entsize = if shdr.sh_entsize != 0 {
                shdr.sh_entsize
            } else if shdr.sh_flags & SHF_STRINGS != 0 {
                1
            } else {
                shdr.sh_addralign
            };
            if entsize == 0 {
                continue;
            }
            let m = self.split_mergeable(&sections, i, entsize)?;
            mergeable[i] = Some(m);
            if let Some(isec) = &sections[i] {
                isec.kill();
            }
        }

        // ARM32: tie each .ARM.exidx to the text section it indexes.
        if machine == Machine::Arm32 {
            let mut pairs = Vec::new();
            for (i, sec) in sections.iter().enumerate() {
                if let Some(isec) = sec {
                    if isec.shdr.sh_type == crate::elf::SHT_ARM_EXIDX {
                        pairs.push((isec.shdr.sh_link as usize, i as u32));
                    }
                }
            }
            for (text, exidx) in pairs {
                if let Some(Some(isec)) = sections.get_mut(text) {
                    isec.exidx = Some(exidx);
                }
            }
        }

        self.sections = sections;
        self.mergeable = mergeable;
        self.comdat_groups = groups;
        Ok(())
    }

    fn parse_group(&self, shndx: usize) -> Result<ComdatGroupRef> {
        let enc = self.enc;
        let shdr = self.shdrs[shndx];
        let contents =
            &self.data[shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize];
        if contents.len() < 4 || contents.len() % 4 != 0 {
            return Err(Error::malformed(
                &self.name,
                shdr.sh_offset,
                "bad SHT_GROUP size",
            ));
        }
        let flags = enc
            .u32_at(contents, 0)
            .ok_or_else(|| Error::malformed(&self.name, shdr.sh_offset, "bad SHT_GROUP"))?;
        if flags & GRP_COMDAT == 0 {
            return Ok(ComdatGroupRef {
                signature: String::new(),
                members: Vec::new(),
            });
        }

        let sig_idx = shdr.sh_info as usize;
        let sig_sym = self
            .elf_syms
            .get(sig_idx)
            .ok_or_else(|| Error::malformed(&self.name, shdr.sh_offset, "bad group signature"))?;
        let signature = if sig_sym.ty() == STT_SECTION {
            let target = self
                .shdrs
                .get(sig_sym.st_shndx as usize)
                .copied()
                .ok_or_else(|| Error::malformed(&self.name, shdr.sh_offset, "bad group signature"))?;
            self.section_name(&target)?
        } else {
            self.sym_names[sig_idx].clone()
        };

        let mut members = Vec::new();
        for off in (4..contents.len()).step_by(4) {
            let idx = enc
                .u32_at(contents, off)
                .ok_or_else(|| Error::malformed(&self.name, shdr.sh_offset, "bad SHT_GROUP"))?;
            if idx as usize >= self.shdrs.len() {
                return Err(Error::malformed(
                    &self.name,
                    shdr.sh_offset,
                    "group member index out of range",
                ));
            }
            members.push(idx);
        }
        Ok(ComdatGroupRef { signature, members })
    }

    fn parse_gnu_property(&mut self, shdr: &Shdr) -> Result<()> {
        let enc = self.enc;
        let data =
            &self.data[shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize];
        let word = enc.word_size();
        let mut pos = 0usize;
        while pos + 12 <= data.len() {
            let namesz = enc.u32_at(data, pos).unwrap_or(0) as usize;
            let descsz = enc.u32_at(data, pos + 4).unwrap_or(0) as usize;
            let n_type = enc.u32_at(data, pos + 8).unwrap_or(0);
            let name_end = pos + 12 + namesz;
            let desc_start = (name_end + 3) & !3;
            let desc_end = desc_start + descsz;
            if desc_end > data.len() {
                break;
            }
            if n_type == crate::elf::NT_GNU_PROPERTY_TYPE_0
                && data.get(pos + 12..pos + 12 + 4) == Some(&b"GNU\0"[..])
            {
                let mut p = desc_start;
                while p + 8 <= desc_end {
                    let pr_type = enc.u32_at(data, p).unwrap_or(0);
                    let pr_datasz = enc.u32_at(data, p + 4).unwrap_or(0) as usize;
                    if pr_type == crate::elf::GNU_PROPERTY_X86_FEATURE_1_AND && pr_datasz >= 4 {
                        self.feature_1_and = enc.u32_at(data, p + 8);
                    }
                    p += 8 + ((pr_datasz + word - 1) & !(word - 1));
                }
            }
            pos = (desc_end + 3) & !3;
        }
        Ok(())
    }

    fn split_mergeable(
        &self,
        sections: &[Option<InputSection>],
        shndx: usize,
        entsize: u64,
    ) -> Result<MergeableSection> {
        let isec = sections[shndx]
            .as_ref()
            .ok_or_else(|| Error::internal("mergeable split on a skipped section"))?;
        let data = &self.data[isec.contents.clone()];
        let shdr = isec.shdr;
        let entsize = entsize as usize;
        if data.len() % entsize != 0 {
            return Err(Error::malformed(
                &self.name,
                shdr.sh_offset,
                format!(
                    "section {}: sh_size is not a multiple of sh_entsize",
                    isec.name
                ),
            ));
        }

        let mut offsets = Vec::new();
        let mut hashes = Vec::new();
        if shdr.sh_flags & SHF_STRINGS != 0 {
            // Null-terminated strings of `entsize`-wide characters.
            let mut start = 0usize;
            let mut pos = 0usize;
            while pos < data.len() {
                if data[pos..pos + entsize].iter().all(|&b| b == 0) {
                    let end = pos + entsize;
                    offsets.push(start as u32);
                    hashes.push(hash_bytes(&data[start..end]));
                    start = end;
                }
                pos += entsize;
            }
            if start != data.len() {
                return Err(Error::malformed(
                    &self.name,
                    shdr.sh_offset,
                    format!("section {}: string is not null-terminated", isec.name),
                ));
            }
        } else {
            for start in (0..data.len()).step_by(entsize) {
                offsets.push(start as u32);
                hashes.push(hash_bytes(&data[start..start + entsize]));
            }
        }

        Ok(MergeableSection {
            msec: u32::MAX,
            p2align: isec.p2align,
            contents: isec.contents.clone(),
            piece_offsets: offsets,
            piece_hashes: hashes,
            fragments: Vec::new(),
        })
    }

    fn decode_relocations(&mut self) -> Result<()> {
        let enc = self.enc;
        let mut all_rels: Vec<Rel> = Vec::new();

        for i in 0..self.shdrs.len() {
            let shdr = self.shdrs[i];
            let is_rela = shdr.sh_type == SHT_RELA;
            if shdr.sh_type != SHT_REL && shdr.sh_type != SHT_RELA && shdr.sh_type != SHT_CREL {
                continue;
            }
            let target = shdr.sh_info as usize;
            if target >= self.sections.len() || self.sections[target].is_none() {
                continue;
            }

            let start = all_rels.len() as u32;
            if shdr.sh_type == SHT_CREL {
                let data =
                    &self.data[shdr.sh_offset as usize..(shdr.sh_offset + shdr.sh_size) as usize];
                all_rels.extend(crel::decode(&self.name, data)?);
            } else {
                let entsize = Rel::entry_size(enc.class, is_rela);
                if shdr.sh_size as usize % entsize != 0 {
                    return Err(Error::malformed(
                        &self.name,
                        shdr.sh_offset,
                        "relocation section size is not a multiple of the entry size",
                    ));
                }
                for off in (0..shdr.sh_size as usize).step_by(entsize) {
                    let rel =
                        Rel::parse_at(enc, is_rela, &self.data, shdr.sh_offset as usize + off)
                            .ok_or_else(|| {
                                Error::malformed(
                                    &self.name,
                                    shdr.sh_offset,
                                    "truncated relocation section",
                                )
                            })?;
                    if rel.r_sym as usize >= self.elf_syms.len().max(1) {
                        return Err(Error::malformed(
                            &self.name,
                            shdr.sh_offset,
                            "relocation refers to an out-of-range symbol",
                        ));
                    }
                    all_rels.push(rel);
                }
            }
            let end = all_rels.len() as u32;
            if let Some(isec) = self.sections[target].as_mut() {
                isec.rels = start..end;
            }
        }
        self.rels = all_rels;
        Ok(())
    }

    fn parse_ehframe(&mut self) -> Result<()> {
        let Some(idx) = self
            .sections
            .iter()
            .position(|s| matches!(s, Some(isec) if isec.name == ".eh_frame"))
        else {
            return Ok(());
        };
        let (contents, rel_range) = {
            let isec = self.sections[idx].as_ref().ok_or_else(|| {
                Error::internal("eh_frame section disappeared during parsing")
            })?;
            (isec.contents.clone(), isec.rels.clone())
        };
        let rels = &self.rels[rel_range.start as usize..rel_range.end as usize];
        if rels.windows(2).any(|w| w[0].r_offset > w[1].r_offset) {
            return Err(Error::malformed(
                &self.name,
                0,
                ".eh_frame relocations are not sorted",
            ));
        }
        let (cies, mut fdes) = crate::input::ehframe::split(
            &self.name,
            self.enc,
            &self.data[contents],
            rels,
            rel_range.start,
        )?;

        // Group FDEs by the text section they cover so each InputSection can
        // carry its own FDE range.
        let covered: Vec<u32> = fdes
            .iter()
            .map(|fde| {
                fde.function_rel()
                    .and_then(|ri| self.rels.get(ri as usize))
                    .and_then(|rel| self.elf_syms.get(rel.r_sym as usize))
                    .map(|sym| sym.st_shndx)
                    .unwrap_or(0)
            })
            .collect();
        let mut keyed: Vec<(u32, FdeRecord)> = covered.into_iter().zip(fdes).collect();
        keyed.sort_by_key(|(shndx, fde)| (*shndx, fde.input_offset));
        fdes = Vec::with_capacity(keyed.len());

        let mut begin = 0usize;
        while begin < keyed.len() {
            let shndx = keyed[begin].0;
            let mut end = begin + 1;
            while end < keyed.len() && keyed[end].0 == shndx {
                end += 1;
            }
            if let Some(Some(isec)) = self.sections.get_mut(shndx as usize) {
                isec.fde_begin = begin as u32;
                isec.fde_end = end as u32;
            }
            begin = end;
        }
        fdes.extend(keyed.into_iter().map(|(_, fde)| fde));

        self.cies = cies;
        self.fdes = fdes;
        // The raw section drops out of layout; its records are rebuilt.
        if let Some(isec) = &self.sections[idx] {
            isec.kill();
        }
        Ok(())
    }

    fn collect_mapping_symbols(&mut self) {
        for i in 0..self.first_global.min(self.elf_syms.len()) {
            let name = &self.sym_names[i];
            let kind = if name == "$a" || name.starts_with("$a.") {
                MapKind::Arm
            } else if name == "$t" || name.starts_with("$t.") {
                MapKind::Thumb
            } else if name == "$d" || name.starts_with("$d.") {
                MapKind::Data
            } else {
                continue;
            };
            let sym = self.elf_syms[i];
            self.mapping_symbols.push(MappingSymbol {
                shndx: sym.st_shndx,
                offset: sym.st_value,
                kind,
            });
        }
        self.mapping_symbols
            .sort_by_key(|m| (m.shndx, m.offset));
    }
}
