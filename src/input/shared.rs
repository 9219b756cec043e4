//! Shared object parsing
//!
//! Only the dynamic symbol table and the version definitions matter to the
//! link; section contents of a DSO are never copied to the output.

use crate::elf::{
    Dyn, Ehdr, Encoding, Machine, Shdr, Sym, Verdaux, Verdef, DT_SONAME, SHT_DYNAMIC, SHT_DYNSYM,
    SHT_GNU_VERDEF, SHT_GNU_VERSYM, STB_LOCAL, VERSYM_HIDDEN, VER_NDX_GLOBAL,
};
use crate::error::{Error, Result};
use crate::symbol::SymbolId;

/// A parsed shared object
#[derive(Debug)]
pub struct SharedFile {
    pub name: String,
    pub soname: String,
    pub data: Vec<u8>,
    pub enc: Encoding,
    pub priority: u32,
    /// With `--as-needed`, a DSO earns its `DT_NEEDED` only if some live
    /// object resolves a symbol against it
    pub is_alive: bool,
    pub as_needed: bool,

    pub shdrs: Vec<Shdr>,
    /// Global dynamic symbols (the local prefix is dropped)
    pub elf_syms: Vec<Sym>,
    pub sym_names: Vec<String>,
    /// Version index per symbol, hidden bit stripped
    pub versyms: Vec<u16>,
    /// Version names indexed by version index
    pub version_strings: Vec<String>,
    pub symbols: Vec<SymbolId>,
    /// Symbol indices sorted by st_value, for copy-relocation aliasing
    sorted_by_value: Vec<u32>,
}

fn cstr_at(data: &[u8], offset: usize) -> Option<&str> {
    let rest = data.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&rest[..end]).ok()
}

impl SharedFile {
    pub fn parse(
        name: String,
        data: Vec<u8>,
        priority: u32,
        as_needed: bool,
        machine: Machine,
    ) -> Result<SharedFile> {
        let (ehdr, enc) = Ehdr::parse(&data)
            .ok_or_else(|| Error::malformed(&name, 0, "not a valid ELF shared object"))?;
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

        let mut shdrs = Vec::new();
        let shoff = ehdr.e_shoff as usize;
        let count = if ehdr.e_shnum == 0 && ehdr.e_shoff != 0 {
            Shdr::parse_at(enc, &data, shoff)
                .ok_or_else(|| Error::malformed(&name, shoff as u64, "truncated section headers"))?
                .sh_size as usize
        } else {
            ehdr.e_shnum as usize
        };
        for i in 0..count {
            let off = shoff + i * Shdr::size(enc.class);
            shdrs.push(Shdr::parse_at(enc, &data, off).ok_or_else(|| {
                Error::malformed(&name, off as u64, "truncated section headers")
            })?);
        }

        let dynsym_idx = shdrs.iter().position(|s| s.sh_type == SHT_DYNSYM);
        let mut elf_syms = Vec::new();
        let mut sym_names = Vec::new();
        let mut versyms = Vec::new();

        if let Some(di) = dynsym_idx {
            let dynsym = shdrs[di];
            let entsize = Sym::size(enc.class);
            let nsyms = dynsym.sh_size as usize / entsize;
            let first_global = dynsym.sh_info as usize;
            let strtab = shdrs
                .get(dynsym.sh_link as usize)
                .ok_or_else(|| Error::malformed(&name, dynsym.sh_offset, "bad dynsym sh_link"))?;
            let strtab_data = data
                .get(strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize)
                .ok_or_else(|| Error::malformed(&name, strtab.sh_offset, "truncated dynstr"))?;

            let versym_shdr = shdrs.iter().find(|s| s.sh_type == SHT_GNU_VERSYM);

            for i in first_global..nsyms {
                let off = dynsym.sh_offset as usize + i * entsize;
                let sym = Sym::parse_at(enc, &data, off).ok_or_else(|| {
                    Error::malformed(&name, off as u64, "truncated dynamic symbol table")
                })?;
                if sym.bind() == STB_LOCAL {
                    continue;
                }
                let sym_name = cstr_at(strtab_data, sym.st_name as usize)
                    .ok_or_else(|| Error::malformed(&name, off as u64, "bad symbol name offset"))?
                    .to_owned();
                let ver = match versym_shdr {
                    Some(vs) => enc
                        .u16_at(&data, vs.sh_offset as usize + i * 2)
                        .map(|v| v & !VERSYM_HIDDEN)
                        .unwrap_or(VER_NDX_GLOBAL),
                    None => VER_NDX_GLOBAL,
                };
                elf_syms.push(sym);
                sym_names.push(sym_name);
                versyms.push(ver);
            }
        }

        let version_strings = Self::parse_verdef(&name, enc, &data, &shdrs)?;
        let soname = Self::parse_soname(enc, &data, &shdrs)
            .unwrap_or_else(|| name.rsplit('/').next().unwrap_or(&name).to_string());

        let mut sorted_by_value: Vec<u32> = (0..elf_syms.len() as u32)
            .filter(|&i| !elf_syms[i as usize].is_undef())
            .collect();
        sorted_by_value.sort_by_key(|&i| elf_syms[i as usize].st_value);

        Ok(SharedFile {
            name,
            soname,
            data,
            enc,
            priority,
            is_alive: !as_needed,
            as_needed,
            shdrs,
            elf_syms,
            sym_names,
            versyms,
            version_strings,
            symbols: Vec::new(),
            sorted_by_value,
        })
    }

    fn parse_verdef(
        name: &str,
        enc: Encoding,
        data: &[u8],
        shdrs: &[Shdr],
    ) -> Result<Vec<String>> {
        let Some(verdef_shdr) = shdrs.iter().find(|s| s.sh_type == SHT_GNU_VERDEF) else {
            return Ok(Vec::new());
        };
        let strtab = shdrs
            .get(verdef_shdr.sh_link as usize)
            .ok_or_else(|| Error::malformed(name, verdef_shdr.sh_offset, "bad verdef sh_link"))?;
        let strtab_data = data
            .get(strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize)
            .ok_or_else(|| Error::malformed(name, strtab.sh_offset, "truncated dynstr"))?;

        let mut strings = vec![String::new(); 2];
        let base = verdef_shdr.sh_offset as usize;
        let mut pos = 0usize;
        for _ in 0..verdef_shdr.sh_info {
            let vd = Verdef::parse_at(enc, data, base + pos)
                .ok_or_else(|| Error::malformed(name, (base + pos) as u64, "truncated verdef"))?;
            let aux = Verdaux::parse_at(enc, data, base + pos + vd.vd_aux as usize)
                .ok_or_else(|| Error::malformed(name, (base + pos) as u64, "truncated verdaux"))?;
            let ver_name = cstr_at(strtab_data, aux.vda_name as usize)
                .ok_or_else(|| Error::malformed(name, (base + pos) as u64, "bad version name"))?;
            let idx = vd.vd_ndx as usize;
            if strings.len() <= idx {
                strings.resize(idx + 1, String::new());
            }
            strings[idx] = ver_name.to_owned();
            if vd.vd_next == 0 {
                break;
            }
            pos += vd.vd_next as usize;
        }
        Ok(strings)
    }

    fn parse_soname(enc: Encoding, data: &[u8], shdrs: &[Shdr]) -> Option<String> {
        let dynamic = shdrs.iter().find(|s| s.sh_type == SHT_DYNAMIC)?;
        let strtab = shdrs.get(dynamic.sh_link as usize)?;
        let strtab_data =
            data.get(strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize)?;
        let entsize = Dyn::size(enc.class);
        for off in (0..dynamic.sh_size as usize).step_by(entsize) {
            let dy = Dyn::parse_at(enc, data, dynamic.sh_offset as usize + off)?;
            if dy.d_tag == DT_SONAME {
                return cstr_at(strtab_data, dy.d_val as usize).map(str::to_owned);
            }
        }
        None
    }

    /// The version string a symbol of this DSO carries
    pub fn version_name(&self, ver_idx: u16) -> &str {
        self.version_strings
            .get(ver_idx as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Alignment the loader guarantees for one of our defined symbols; a
    /// copy-relocation reservation must honor it.
    pub fn symbol_alignment(&self, idx: usize) -> u64 {
        let sym = &self.elf_syms[idx];
        let mut align = self
            .shdrs
            .get(sym.st_shndx as usize)
            .map(|s| s.sh_addralign.max(1))
            .unwrap_or(1);
        if sym.st_value != 0 {
            align = align.min(1 << sym.st_value.trailing_zeros().min(63));
        }
        align
    }

    /// All defined symbols located at the same address as `idx` (aliases).
    /// When one of them gets a copy relocation the whole family must point
    /// at the copied bytes.
    pub fn symbols_at(&self, idx: usize) -> Vec<usize> {
        let value = self.elf_syms[idx].st_value;
        let start = self
            .sorted_by_value
            .partition_point(|&i| self.elf_syms[i as usize].st_value < value);
        self.sorted_by_value[start..]
            .iter()
            .take_while(|&&i| self.elf_syms[i as usize].st_value == value)
            .map(|&i| i as usize)
            .collect()
    }
}
