//! `.eh_frame` record splitting
//!
//! The section is a sequence of length-prefixed CIE and FDE records. CIEs
//! are deduplicated across files at output time; an FDE lives and dies with
//! the text section its first relocation points at.

use std::ops::Range;

use crate::elf::{Encoding, Rel};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct CieRecord {
    /// Offset of the record within its `.eh_frame` input section
    pub input_offset: u32,
    /// Record size including the length field
    pub size: u32,
    /// Range into the owning file's relocation vector
    pub rels: Range<u32>,
    pub is_leader: bool,
    pub output_offset: u32,
}

#[derive(Debug)]
pub struct FdeRecord {
    pub input_offset: u32,
    pub size: u32,
    pub rels: Range<u32>,
    /// Index of the CIE this FDE refers to, within the owning file
    pub cie_idx: u32,
    pub is_alive: bool,
    /// Offset within the owning file's FDE block of the output section
    pub output_offset: u32,
}

impl FdeRecord {
    /// The relocation whose target is the function this FDE describes
    pub fn function_rel(&self) -> Option<u32> {
        if self.rels.is_empty() {
            None
        } else {
            Some(self.rels.start)
        }
    }
}

/// Split `.eh_frame` contents into CIE and FDE records. `rels` must be the
/// relocations applying to the section, sorted by offset; `rel_base` is the
/// index of the first of them in the file-wide relocation vector.
pub fn split(
    file: &str,
    enc: Encoding,
    contents: &[u8],
    rels: &[Rel],
    rel_base: u32,
) -> Result<(Vec<CieRecord>, Vec<FdeRecord>)> {
    let mut cies = Vec::new();
    let mut fdes = Vec::new();
    let mut rel_cursor = 0usize;
    let mut pos = 0usize;

    while pos < contents.len() {
        let len = enc
            .u32_at(contents, pos)
            .ok_or_else(|| Error::malformed(file, pos as u64, "truncated .eh_frame record"))?;
        if len == 0 {
            // Null terminator; anything after it is padding.
            break;
        }
        if len == u32::MAX {
            return Err(Error::unsupported(
                file,
                "64-bit .eh_frame records are not supported",
            ));
        }
        let size = len as usize + 4;
        if pos + size > contents.len() {
            return Err(Error::malformed(
                file,
                pos as u64,
                ".eh_frame record extends past end of section",
            ));
        }

        // Collect the relocations that land inside this record.
        let rel_start = rel_cursor;
        while rel_cursor < rels.len() && (rels[rel_cursor].r_offset as usize) < pos + size {
            if (rels[rel_cursor].r_offset as usize) < pos {
                return Err(Error::malformed(
                    file,
                    rels[rel_cursor].r_offset,
                    "relocation points into the middle of two .eh_frame records",
                ));
            }
            rel_cursor += 1;
        }
        let rel_range = rel_base + rel_start as u32..rel_base + rel_cursor as u32;

        let id = enc
            .u32_at(contents, pos + 4)
            .ok_or_else(|| Error::malformed(file, pos as u64, "truncated .eh_frame record"))?;
        if id == 0 {
            cies.push(CieRecord {
                input_offset: pos as u32,
                size: size as u32,
                rels: rel_range,
                is_leader: false,
                output_offset: 0,
            });
        } else {
            // The CIE pointer is relative to the field it is stored in.
            let cie_offset = (pos as u64 + 4).checked_sub(id as u64).ok_or_else(|| {
                Error::malformed(file, pos as u64, "FDE with out-of-range CIE pointer")
            })?;
            let cie_idx = cies
                .iter()
                .position(|c: &CieRecord| c.input_offset as u64 == cie_offset)
                .ok_or_else(|| {
                    Error::malformed(file, pos as u64, "FDE refers to a nonexistent CIE")
                })?;
            fdes.push(FdeRecord {
                input_offset: pos as u32,
                size: size as u32,
                rels: rel_range,
                cie_idx: cie_idx as u32,
                is_alive: true,
                output_offset: 0,
            });
        }
        pos += size;
    }
    Ok((cies, fdes))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::elf::{Class, Endian};

    const ENC: Encoding = Encoding {
        class: Class::Elf64,
        endian: Endian::Little,
    };

    fn record(len: u32, id: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend(len.to_le_bytes());
        v.extend(id.to_le_bytes());
        v.resize(len as usize + 4, 0);
        v
    }

    #[test]
    fn test_split_cie_and_two_fdes() {
        let mut sec = Vec::new();
        sec.extend(record(20, 0)); // CIE at 0, size 24
        sec.extend(record(20, 28)); // FDE at 24; 24+4-28 = 0
        sec.extend(record(20, 52)); // FDE at 48; 48+4-52 = 0
        sec.extend(0u32.to_le_bytes()); // terminator

        let rels = [
            Rel {
                r_offset: 32,
                r_sym: 1,
                r_type: 2,
                r_addend: 0,
            },
            Rel {
                r_offset: 56,
                r_sym: 2,
                r_type: 2,
                r_addend: 0,
            },
        ];
        let (cies, fdes) = split("a.o", ENC, &sec, &rels, 10).unwrap();
        assert_eq!(cies.len(), 1);
        assert_eq!(fdes.len(), 2);
        assert_eq!(fdes[0].cie_idx, 0);
        assert_eq!(fdes[0].rels, 10..11);
        assert_eq!(fdes[1].rels, 11..12);
        assert_eq!(fdes[1].function_rel(), Some(11));
    }

    #[test]
    fn test_dangling_cie_pointer_is_rejected() {
        let mut sec = Vec::new();
        sec.extend(record(20, 0));
        sec.extend(record(20, 4)); // 24+4-4 = 24, no CIE there
        assert!(split("a.o", ENC, &sec, &[], 0).is_err());
    }
}
