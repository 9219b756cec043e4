//! ELF object file records and their on-disk encodings
//!
//! Records are held in memory in a class-independent form with fields
//! widened to 64 bits. The [`Encoding`] carries the class and data encoding
//! of the file being read or written; every record knows how to decode and
//! encode itself for both classes and both byte orders.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

pub mod consts;

pub use consts::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The file class: 32-bit or 64-bit object
pub enum Class {
    Elf32,
    Elf64,
}

impl Class {
    /// Size in bytes of a natural word of this class
    pub fn word_size(self) -> usize {
        match self {
            Class::Elf32 => 4,
            Class::Elf64 => 8,
        }
    }

    pub fn ident_byte(self) -> u8 {
        match self {
            Class::Elf32 => ELFCLASS32,
            Class::Elf64 => ELFCLASS64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The data encoding: little- or big-endian
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn ident_byte(self) -> u8 {
        match self {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A (class, data encoding) pair describing how records are laid out in a
/// particular file
pub struct Encoding {
    pub class: Class,
    pub endian: Endian,
}

impl Encoding {
    pub fn new(class: Class, endian: Endian) -> Self {
        Encoding { class, endian }
    }

    pub fn word_size(&self) -> usize {
        self.class.word_size()
    }

    pub fn u16_at(&self, data: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
        Some(match self.endian {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn u32_at(&self, data: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self.endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn u64_at(&self, data: &[u8], offset: usize) -> Option<u64> {
        let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
        Some(match self.endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Read a natural word: 4 bytes for class 32, 8 bytes for class 64
    pub fn word_at(&self, data: &[u8], offset: usize) -> Option<u64> {
        match self.class {
            Class::Elf32 => self.u32_at(data, offset).map(u64::from),
            Class::Elf64 => self.u64_at(data, offset),
        }
    }

    pub fn put_u16(&self, data: &mut [u8], offset: usize, value: u16) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        data[offset..offset + 2].copy_from_slice(&bytes);
    }

    pub fn put_u32(&self, data: &mut [u8], offset: usize, value: u32) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        data[offset..offset + 4].copy_from_slice(&bytes);
    }

    pub fn put_u64(&self, data: &mut [u8], offset: usize, value: u64) {
        let bytes = match self.endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        data[offset..offset + 8].copy_from_slice(&bytes);
    }

    /// Write a natural word, truncating to 32 bits for class 32
    pub fn put_word(&self, data: &mut [u8], offset: usize, value: u64) {
        match self.class {
            Class::Elf32 => self.put_u32(data, offset, value as u32),
            Class::Elf64 => self.put_u64(data, offset, value),
        }
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
#[non_exhaustive]
/// Machine codes the linker recognizes in `e_machine`
pub enum Machine {
    None = EM_NONE,
    I386 = EM_386,
    M68k = EM_68K,
    Ppc = EM_PPC,
    Ppc64 = EM_PPC64,
    S390x = EM_S390X,
    Arm32 = EM_ARM,
    Sh4 = EM_SH,
    Sparc64 = EM_SPARC64,
    X86_64 = EM_X86_64,
    Arc = EM_ARC_COMPACT,
    Aarch64 = EM_AARCH64,
    Riscv = EM_RISCV,
    Loongarch = EM_LOONGARCH,
}

impl Machine {
    pub fn from_e_machine(value: u16) -> Option<Self> {
        Self::from_u16(value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Machine::None => "none",
            Machine::I386 => "i386",
            Machine::M68k => "m68k",
            Machine::Ppc => "ppc32",
            Machine::Ppc64 => "ppc64",
            Machine::S390x => "s390x",
            Machine::Arm32 => "arm32",
            Machine::Sh4 => "sh4",
            Machine::Sparc64 => "sparc64",
            Machine::X86_64 => "x86_64",
            Machine::Arc => "arc",
            Machine::Aarch64 => "arm64",
            Machine::Riscv => "riscv",
            Machine::Loongarch => "loongarch",
        }
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Section header flags (`sh_flags`)
    pub struct SecFlags: u64 {
        const WRITE = SHF_WRITE;
        const ALLOC = SHF_ALLOC;
        const EXECINSTR = SHF_EXECINSTR;
        const MERGE = SHF_MERGE;
        const STRINGS = SHF_STRINGS;
        const INFO_LINK = SHF_INFO_LINK;
        const LINK_ORDER = SHF_LINK_ORDER;
        const GROUP = SHF_GROUP;
        const TLS = SHF_TLS;
        const COMPRESSED = SHF_COMPRESSED;
        const GNU_RETAIN = SHF_GNU_RETAIN;
        const EXCLUDE = SHF_EXCLUDE;
        const _ = !0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// `DT_FLAGS` bits
    pub struct DynFlags: u64 {
        const ORIGIN = DF_ORIGIN;
        const SYMBOLIC = DF_SYMBOLIC;
        const TEXTREL = DF_TEXTREL;
        const BIND_NOW = DF_BIND_NOW;
        const STATIC_TLS = DF_STATIC_TLS;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    /// `DT_FLAGS_1` bits
    pub struct DynFlags1: u64 {
        const NOW = DF_1_NOW;
        const NODELETE = DF_1_NODELETE;
        const INITFIRST = DF_1_INITFIRST;
        const NOOPEN = DF_1_NOOPEN;
        const ORIGIN = DF_1_ORIGIN;
        const NODEFLIB = DF_1_NODEFLIB;
        const INTERPOSE = DF_1_INTERPOSE;
        const NODUMP = DF_1_NODUMP;
        const PIE = DF_1_PIE;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// The ELF file header, widened to the class-64 field sizes
pub struct Ehdr {
    pub class: u8,
    pub data: u8,
    pub osabi: u8,
    pub e_type: u16,
    pub e_machine: u16,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Ehdr {
    pub fn size(class: Class) -> usize {
        match class {
            Class::Elf32 => 52,
            Class::Elf64 => 64,
        }
    }

    /// Decode the identification bytes and the header proper. Returns
    /// `None` on a truncated buffer, a bad magic number, or an invalid
    /// class/encoding byte.
    pub fn parse(data: &[u8]) -> Option<(Ehdr, Encoding)> {
        if data.get(0..4)? != ELFMAG {
            return None;
        }
        let class = match *data.get(4)? {
            ELFCLASS32 => Class::Elf32,
            ELFCLASS64 => Class::Elf64,
            _ => return None,
        };
        let endian = match *data.get(5)? {
            ELFDATA2LSB => Endian::Little,
            ELFDATA2MSB => Endian::Big,
            _ => return None,
        };
        let enc = Encoding::new(class, endian);

        let (phoff, shoff, tail) = match class {
            Class::Elf32 => (
                enc.u32_at(data, 28)? as u64,
                enc.u32_at(data, 32)? as u64,
                36,
            ),
            Class::Elf64 => (enc.u64_at(data, 32)?, enc.u64_at(data, 40)?, 48),
        };

        let ehdr = Ehdr {
            class: class.ident_byte(),
            data: endian.ident_byte(),
            osabi: *data.get(7)?,
            e_type: enc.u16_at(data, 16)?,
            e_machine: enc.u16_at(data, 18)?,
            e_entry: enc.word_at(data, 24)?,
            e_phoff: phoff,
            e_shoff: shoff,
            e_flags: enc.u32_at(data, tail)?,
            e_phentsize: enc.u16_at(data, tail + 6)?,
            e_phnum: enc.u16_at(data, tail + 8)?,
            e_shentsize: enc.u16_at(data, tail + 10)?,
            e_shnum: enc.u16_at(data, tail + 12)?,
            e_shstrndx: enc.u16_at(data, tail + 14)?,
        };
        Some((ehdr, enc))
    }

    pub fn write(&self, enc: Encoding, out: &mut [u8]) {
        out[0..4].copy_from_slice(&ELFMAG);
        out[4] = self.class;
        out[5] = self.data;
        out[6] = 1; // EV_CURRENT
        out[7] = self.osabi;
        enc.put_u16(out, 16, self.e_type);
        enc.put_u16(out, 18, self.e_machine);
        enc.put_u32(out, 20, EV_CURRENT);
        enc.put_word(out, 24, self.e_entry);
        let tail = match enc.class {
            Class::Elf32 => {
                enc.put_u32(out, 28, self.e_phoff as u32);
                enc.put_u32(out, 32, self.e_shoff as u32);
                36
            }
            Class::Elf64 => {
                enc.put_u64(out, 32, self.e_phoff);
                enc.put_u64(out, 40, self.e_shoff);
                48
            }
        };
        enc.put_u32(out, tail, self.e_flags);
        enc.put_u16(out, tail + 4, Self::size(enc.class) as u16);
        enc.put_u16(out, tail + 6, self.e_phentsize);
        enc.put_u16(out, tail + 8, self.e_phnum);
        enc.put_u16(out, tail + 10, self.e_shentsize);
        enc.put_u16(out, tail + 12, self.e_shnum);
        enc.put_u16(out, tail + 14, self.e_shstrndx);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A section header, widened to the class-64 field sizes
pub struct Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Shdr {
    pub fn size(class: Class) -> usize {
        match class {
            Class::Elf32 => 40,
            Class::Elf64 => 64,
        }
    }

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Shdr> {
        let w = enc.word_size();
        Some(Shdr {
            sh_name: enc.u32_at(data, offset)?,
            sh_type: enc.u32_at(data, offset + 4)?,
            sh_flags: enc.word_at(data, offset + 8)?,
            sh_addr: enc.word_at(data, offset + 8 + w)?,
            sh_offset: enc.word_at(data, offset + 8 + 2 * w)?,
            sh_size: enc.word_at(data, offset + 8 + 3 * w)?,
            sh_link: enc.u32_at(data, offset + 8 + 4 * w)?,
            sh_info: enc.u32_at(data, offset + 12 + 4 * w)?,
            sh_addralign: enc.word_at(data, offset + 16 + 4 * w)?,
            sh_entsize: enc.word_at(data, offset + 16 + 5 * w)?,
        })
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        let w = enc.word_size();
        enc.put_u32(out, offset, self.sh_name);
        enc.put_u32(out, offset + 4, self.sh_type);
        enc.put_word(out, offset + 8, self.sh_flags);
        enc.put_word(out, offset + 8 + w, self.sh_addr);
        enc.put_word(out, offset + 8 + 2 * w, self.sh_offset);
        enc.put_word(out, offset + 8 + 3 * w, self.sh_size);
        enc.put_u32(out, offset + 8 + 4 * w, self.sh_link);
        enc.put_u32(out, offset + 12 + 4 * w, self.sh_info);
        enc.put_word(out, offset + 16 + 4 * w, self.sh_addralign);
        enc.put_word(out, offset + 16 + 5 * w, self.sh_entsize);
    }

    pub fn flags(&self) -> SecFlags {
        SecFlags::from_bits_retain(self.sh_flags)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A symbol table entry, widened to the class-64 field sizes. `st_shndx`
/// is stored pre-resolved: `SHN_XINDEX` entries are replaced by the real
/// index from the `SHT_SYMTAB_SHNDX` companion at parse time.
pub struct Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u32,
    pub st_value: u64,
    pub st_size: u64,
}

impl Sym {
    pub fn size(class: Class) -> usize {
        match class {
            Class::Elf32 => 16,
            Class::Elf64 => 24,
        }
    }

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Sym> {
        match enc.class {
            Class::Elf32 => Some(Sym {
                st_name: enc.u32_at(data, offset)?,
                st_value: enc.u32_at(data, offset + 4)? as u64,
                st_size: enc.u32_at(data, offset + 8)? as u64,
                st_info: *data.get(offset + 12)?,
                st_other: *data.get(offset + 13)?,
                st_shndx: enc.u16_at(data, offset + 14)? as u32,
            }),
            Class::Elf64 => Some(Sym {
                st_name: enc.u32_at(data, offset)?,
                st_info: *data.get(offset + 4)?,
                st_other: *data.get(offset + 5)?,
                st_shndx: enc.u16_at(data, offset + 6)? as u32,
                st_value: enc.u64_at(data, offset + 8)?,
                st_size: enc.u64_at(data, offset + 16)?,
            }),
        }
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        let shndx = if self.st_shndx >= SHN_LORESERVE && self.st_shndx < 0x1_0000 {
            self.st_shndx as u16
        } else if self.st_shndx >= SHN_LORESERVE {
            SHN_XINDEX as u16
        } else {
            self.st_shndx as u16
        };
        match enc.class {
            Class::Elf32 => {
                enc.put_u32(out, offset, self.st_name);
                enc.put_u32(out, offset + 4, self.st_value as u32);
                enc.put_u32(out, offset + 8, self.st_size as u32);
                out[offset + 12] = self.st_info;
                out[offset + 13] = self.st_other;
                enc.put_u16(out, offset + 14, shndx);
            }
            Class::Elf64 => {
                enc.put_u32(out, offset, self.st_name);
                out[offset + 4] = self.st_info;
                out[offset + 5] = self.st_other;
                enc.put_u16(out, offset + 6, shndx);
                enc.put_u64(out, offset + 8, self.st_value);
                enc.put_u64(out, offset + 16, self.st_size);
            }
        }
    }

    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn ty(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn visibility(&self) -> u8 {
        self.st_other & 3
    }

    pub fn is_undef(&self) -> bool {
        self.st_shndx == SHN_UNDEF
    }

    pub fn is_common(&self) -> bool {
        self.st_shndx == SHN_COMMON
    }

    pub fn is_abs(&self) -> bool {
        self.st_shndx == SHN_ABS
    }

    pub fn is_weak(&self) -> bool {
        self.bind() == STB_WEAK
    }

    pub fn is_undef_weak(&self) -> bool {
        self.is_undef() && self.is_weak()
    }

    pub fn info(bind: u8, ty: u8) -> u8 {
        (bind << 4) | (ty & 0xf)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A relocation record. REL, RELA and CREL entries all decode to this
/// shape; REL addends are read from the relocated field by the applier.
pub struct Rel {
    pub r_offset: u64,
    pub r_sym: u32,
    pub r_type: u32,
    pub r_addend: i64,
}

impl Rel {
    pub fn entry_size(class: Class, is_rela: bool) -> usize {
        match (class, is_rela) {
            (Class::Elf32, false) => 8,
            (Class::Elf32, true) => 12,
            (Class::Elf64, false) => 16,
            (Class::Elf64, true) => 24,
        }
    }

    pub fn parse_at(enc: Encoding, is_rela: bool, data: &[u8], offset: usize) -> Option<Rel> {
        match enc.class {
            Class::Elf32 => {
                let info = enc.u32_at(data, offset + 4)?;
                Some(Rel {
                    r_offset: enc.u32_at(data, offset)? as u64,
                    r_sym: info >> 8,
                    r_type: info & 0xff,
                    r_addend: if is_rela {
                        enc.u32_at(data, offset + 8)? as i32 as i64
                    } else {
                        0
                    },
                })
            }
            Class::Elf64 => {
                let info = enc.u64_at(data, offset + 8)?;
                Some(Rel {
                    r_offset: enc.u64_at(data, offset)?,
                    r_sym: (info >> 32) as u32,
                    r_type: info as u32,
                    r_addend: if is_rela {
                        enc.u64_at(data, offset + 16)? as i64
                    } else {
                        0
                    },
                })
            }
        }
    }

    pub fn write_at(&self, enc: Encoding, is_rela: bool, out: &mut [u8], offset: usize) {
        match enc.class {
            Class::Elf32 => {
                enc.put_u32(out, offset, self.r_offset as u32);
                enc.put_u32(out, offset + 4, (self.r_sym << 8) | (self.r_type & 0xff));
                if is_rela {
                    enc.put_u32(out, offset + 8, self.r_addend as u32);
                }
            }
            Class::Elf64 => {
                enc.put_u64(out, offset, self.r_offset);
                enc.put_u64(
                    out,
                    offset + 8,
                    ((self.r_sym as u64) << 32) | self.r_type as u64,
                );
                if is_rela {
                    enc.put_u64(out, offset + 16, self.r_addend as u64);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A program header, widened to the class-64 field sizes
pub struct Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Phdr {
    pub fn size(class: Class) -> usize {
        match class {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        }
    }

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Phdr> {
        match enc.class {
            Class::Elf32 => Some(Phdr {
                p_type: enc.u32_at(data, offset)?,
                p_offset: enc.u32_at(data, offset + 4)? as u64,
                p_vaddr: enc.u32_at(data, offset + 8)? as u64,
                p_paddr: enc.u32_at(data, offset + 12)? as u64,
                p_filesz: enc.u32_at(data, offset + 16)? as u64,
                p_memsz: enc.u32_at(data, offset + 20)? as u64,
                p_flags: enc.u32_at(data, offset + 24)?,
                p_align: enc.u32_at(data, offset + 28)? as u64,
            }),
            Class::Elf64 => Some(Phdr {
                p_type: enc.u32_at(data, offset)?,
                p_flags: enc.u32_at(data, offset + 4)?,
                p_offset: enc.u64_at(data, offset + 8)?,
                p_vaddr: enc.u64_at(data, offset + 16)?,
                p_paddr: enc.u64_at(data, offset + 24)?,
                p_filesz: enc.u64_at(data, offset + 32)?,
                p_memsz: enc.u64_at(data, offset + 40)?,
                p_align: enc.u64_at(data, offset + 48)?,
            }),
        }
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        match enc.class {
            Class::Elf32 => {
                enc.put_u32(out, offset, self.p_type);
                enc.put_u32(out, offset + 4, self.p_offset as u32);
                enc.put_u32(out, offset + 8, self.p_vaddr as u32);
                enc.put_u32(out, offset + 12, self.p_paddr as u32);
                enc.put_u32(out, offset + 16, self.p_filesz as u32);
                enc.put_u32(out, offset + 20, self.p_memsz as u32);
                enc.put_u32(out, offset + 24, self.p_flags);
                enc.put_u32(out, offset + 28, self.p_align as u32);
            }
            Class::Elf64 => {
                enc.put_u32(out, offset, self.p_type);
                enc.put_u32(out, offset + 4, self.p_flags);
                enc.put_u64(out, offset + 8, self.p_offset);
                enc.put_u64(out, offset + 16, self.p_vaddr);
                enc.put_u64(out, offset + 24, self.p_paddr);
                enc.put_u64(out, offset + 32, self.p_filesz);
                enc.put_u64(out, offset + 40, self.p_memsz);
                enc.put_u64(out, offset + 48, self.p_align);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A dynamic table entry
pub struct Dyn {
    pub d_tag: u64,
    pub d_val: u64,
}

impl Dyn {
    pub fn size(class: Class) -> usize {
        class.word_size() * 2
    }

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Dyn> {
        Some(Dyn {
            d_tag: enc.word_at(data, offset)?,
            d_val: enc.word_at(data, offset + enc.word_size())?,
        })
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        enc.put_word(out, offset, self.d_tag);
        enc.put_word(out, offset + enc.word_size(), self.d_val);
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// `.gnu.version_r` group header (Elf_Verneed, class-independent layout)
pub struct Verneed {
    pub vn_version: u16,
    pub vn_cnt: u16,
    pub vn_file: u32,
    pub vn_aux: u32,
    pub vn_next: u32,
}

impl Verneed {
    pub const SIZE: usize = 16;

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        enc.put_u16(out, offset, self.vn_version);
        enc.put_u16(out, offset + 2, self.vn_cnt);
        enc.put_u32(out, offset + 4, self.vn_file);
        enc.put_u32(out, offset + 8, self.vn_aux);
        enc.put_u32(out, offset + 12, self.vn_next);
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// `.gnu.version_r` member record (Elf_Vernaux)
pub struct Vernaux {
    pub vna_hash: u32,
    pub vna_flags: u16,
    pub vna_other: u16,
    pub vna_name: u32,
    pub vna_next: u32,
}

impl Vernaux {
    pub const SIZE: usize = 16;

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        enc.put_u32(out, offset, self.vna_hash);
        enc.put_u16(out, offset + 4, self.vna_flags);
        enc.put_u16(out, offset + 6, self.vna_other);
        enc.put_u32(out, offset + 8, self.vna_name);
        enc.put_u32(out, offset + 12, self.vna_next);
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// `.gnu.version_d` group header (Elf_Verdef)
pub struct Verdef {
    pub vd_version: u16,
    pub vd_flags: u16,
    pub vd_ndx: u16,
    pub vd_cnt: u16,
    pub vd_hash: u32,
    pub vd_aux: u32,
    pub vd_next: u32,
}

impl Verdef {
    pub const SIZE: usize = 20;

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Verdef> {
        Some(Verdef {
            vd_version: enc.u16_at(data, offset)?,
            vd_flags: enc.u16_at(data, offset + 2)?,
            vd_ndx: enc.u16_at(data, offset + 4)?,
            vd_cnt: enc.u16_at(data, offset + 6)?,
            vd_hash: enc.u32_at(data, offset + 8)?,
            vd_aux: enc.u32_at(data, offset + 12)?,
            vd_next: enc.u32_at(data, offset + 16)?,
        })
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        enc.put_u16(out, offset, self.vd_version);
        enc.put_u16(out, offset + 2, self.vd_flags);
        enc.put_u16(out, offset + 4, self.vd_ndx);
        enc.put_u16(out, offset + 6, self.vd_cnt);
        enc.put_u32(out, offset + 8, self.vd_hash);
        enc.put_u32(out, offset + 12, self.vd_aux);
        enc.put_u32(out, offset + 16, self.vd_next);
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// `.gnu.version_d` name record (Elf_Verdaux)
pub struct Verdaux {
    pub vda_name: u32,
    pub vda_next: u32,
}

impl Verdaux {
    pub const SIZE: usize = 8;

    pub fn parse_at(enc: Encoding, data: &[u8], offset: usize) -> Option<Verdaux> {
        Some(Verdaux {
            vda_name: enc.u32_at(data, offset)?,
            vda_next: enc.u32_at(data, offset + 4)?,
        })
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        enc.put_u32(out, offset, self.vda_name);
        enc.put_u32(out, offset + 4, self.vda_next);
    }
}

#[derive(Debug, Clone, Copy)]
/// A compressed-section header (Elf_Chdr)
pub struct Chdr {
    pub ch_type: u32,
    pub ch_size: u64,
    pub ch_addralign: u64,
}

impl Chdr {
    pub fn size(class: Class) -> usize {
        match class {
            Class::Elf32 => 12,
            Class::Elf64 => 24,
        }
    }

    pub fn write_at(&self, enc: Encoding, out: &mut [u8], offset: usize) {
        match enc.class {
            Class::Elf32 => {
                enc.put_u32(out, offset, self.ch_type);
                enc.put_u32(out, offset + 4, self.ch_size as u32);
                enc.put_u32(out, offset + 8, self.ch_addralign as u32);
            }
            Class::Elf64 => {
                enc.put_u32(out, offset, self.ch_type);
                enc.put_u32(out, offset + 4, 0);
                enc.put_u64(out, offset + 8, self.ch_size);
                enc.put_u64(out, offset + 16, self.ch_addralign);
            }
        }
    }
}

/// The classic System V symbol hash
pub fn elf_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &byte in name.as_bytes() {
        h = (h << 4).wrapping_add(byte as u32);
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The DJB hash used by `.gnu.hash`
pub fn djb_hash(name: &str) -> u32 {
    let mut h: u32 = 5381;
    for &byte in name.as_bytes() {
        h = h.wrapping_mul(33).wrapping_add(byte as u32);
    }
    h
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    const ENC64: Encoding = Encoding {
        class: Class::Elf64,
        endian: Endian::Little,
    };
    const ENC32BE: Encoding = Encoding {
        class: Class::Elf32,
        endian: Endian::Big,
    };

    #[test]
    fn test_ehdr_roundtrip_class64() {
        let ehdr = Ehdr {
            class: ELFCLASS64,
            data: ELFDATA2LSB,
            osabi: 0,
            e_type: ET_DYN,
            e_machine: EM_X86_64,
            e_entry: 0x201000,
            e_phoff: 64,
            e_shoff: 0x4000,
            e_flags: 0,
            e_phentsize: 56,
            e_phnum: 9,
            e_shentsize: 64,
            e_shnum: 20,
            e_shstrndx: 19,
        };
        let mut buf = vec![0u8; Ehdr::size(Class::Elf64)];
        ehdr.write(ENC64, &mut buf);
        let (parsed, enc) = Ehdr::parse(&buf).unwrap();
        assert_eq!(parsed, ehdr);
        assert_eq!(enc.class, Class::Elf64);
    }

    #[test]
    fn test_ehdr_rejects_bad_magic() {
        let buf = vec![0u8; 64];
        assert!(Ehdr::parse(&buf).is_none());
    }

    #[test]
    fn test_shdr_roundtrip_both_classes() {
        let shdr = Shdr {
            sh_name: 27,
            sh_type: SHT_PROGBITS,
            sh_flags: SHF_ALLOC | SHF_EXECINSTR,
            sh_addr: 0x1000,
            sh_offset: 0x1000,
            sh_size: 0x220,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 16,
            sh_entsize: 0,
        };
        for enc in [ENC64, ENC32BE] {
            let mut buf = vec![0u8; Shdr::size(enc.class)];
            shdr.write_at(enc, &mut buf, 0);
            assert_eq!(Shdr::parse_at(enc, &buf, 0).unwrap(), shdr);
        }
    }

    #[test]
    fn test_sym_info_split() {
        let sym = Sym {
            st_info: Sym::info(STB_WEAK, STT_FUNC),
            ..Sym::default()
        };
        assert_eq!(sym.bind(), STB_WEAK);
        assert_eq!(sym.ty(), STT_FUNC);
        assert!(sym.is_weak());
        assert!(sym.is_undef_weak());
    }

    #[test]
    fn test_rela_roundtrip_class64() {
        let rel = Rel {
            r_offset: 0x1234,
            r_sym: 7,
            r_type: 2,
            r_addend: -4,
        };
        let mut buf = vec![0u8; Rel::entry_size(Class::Elf64, true)];
        rel.write_at(ENC64, true, &mut buf, 0);
        assert_eq!(Rel::parse_at(ENC64, true, &buf, 0).unwrap(), rel);
    }

    #[test]
    fn test_rel_class32_packs_type_in_low_byte() {
        let rel = Rel {
            r_offset: 0x10,
            r_sym: 0x123,
            r_type: 0x2a,
            r_addend: 0,
        };
        let mut buf = vec![0u8; Rel::entry_size(Class::Elf32, false)];
        rel.write_at(ENC32BE, false, &mut buf, 0);
        let back = Rel::parse_at(ENC32BE, false, &buf, 0).unwrap();
        assert_eq!(back.r_sym, 0x123);
        assert_eq!(back.r_type, 0x2a);
    }

    #[test]
    fn test_hashes_match_known_values() {
        // Reference values from the System V gABI and glibc.
        assert_eq!(elf_hash(""), 0);
        assert_eq!(elf_hash("printf"), 0x077905a6);
        assert_eq!(djb_hash(""), 5381);
        assert_eq!(djb_hash("printf"), 0x156b2bb8);
    }
}
