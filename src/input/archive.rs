//! System V archive reading
//!
//! Regular archives (`!<arch>\n`) store member bytes inline. Thin archives
//! (`!<thin>\n`) store only member paths; fetching those paths is file I/O
//! and therefore the driver's job, so thin members come back as paths.

use std::ops::Range;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberData {
    /// Byte range within the archive buffer
    Inline(Range<usize>),
    /// Path stored in a thin archive; the driver maps it to bytes
    External(String),
}

#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub name: String,
    pub data: MemberData,
}

fn trim_ar_field(field: &[u8]) -> &str {
    std::str::from_utf8(field)
        .unwrap_or("")
        .trim_end_matches([' ', '\0'])
}

/// Parse the member table of a regular or thin archive. The symbol index
/// member (`/`) is skipped: member extraction is driven by the resolver's
/// undefined-symbol fixpoint, not by the index.
pub fn read_archive_members(name: &str, data: &[u8]) -> Result<Vec<ArchiveMember>> {
    let is_thin = data.starts_with(b"!<thin>\n");
    if !is_thin && !data.starts_with(b"!<arch>\n") {
        return Err(Error::malformed(name, 0, "not an archive"));
    }

    let mut members = Vec::new();
    let mut long_names: &[u8] = &[];
    let mut pos = 8usize;

    while pos < data.len() {
        if pos + 60 > data.len() {
            if data[pos..].iter().all(|&b| b == b'\n' || b == b' ') {
                break;
            }
            return Err(Error::malformed(
                name,
                pos as u64,
                "truncated archive member header",
            ));
        }
        let hdr = &data[pos..pos + 60];
        if &hdr[58..60] != b"`\n" {
            return Err(Error::malformed(
                name,
                pos as u64,
                "bad archive member header terminator",
            ));
        }

        let size: usize = trim_ar_field(&hdr[48..58]).parse().map_err(|_| {
            Error::malformed(name, pos as u64 + 48, "bad archive member size field")
        })?;
        let body = pos + 60;

        let raw_name = trim_ar_field(&hdr[0..16]);
        // Thin archive members store no bytes inline except the name table.
        let stores_data = !is_thin || raw_name == "//";
        if stores_data && body + size > data.len() {
            return Err(Error::malformed(
                name,
                pos as u64,
                "archive member extends past end of file",
            ));
        }

        if raw_name == "/" || raw_name == "/SYM64/" {
            // Symbol index; ignored.
        } else if raw_name == "//" {
            long_names = &data[body..body + size];
        } else {
            let member_name = if let Some(off) = raw_name.strip_prefix('/') {
                let off: usize = off.parse().map_err(|_| {
                    Error::malformed(name, pos as u64, "bad long-name reference")
                })?;
                let rest = long_names.get(off..).ok_or_else(|| {
                    Error::malformed(name, pos as u64, "long-name reference out of range")
                })?;
                let end = rest
                    .iter()
                    .position(|&b| b == b'\n' || b == b'\0')
                    .unwrap_or(rest.len());
                String::from_utf8_lossy(&rest[..end])
                    .trim_end_matches('/')
                    .to_string()
            } else {
                raw_name.trim_end_matches('/').to_string()
            };

            if is_thin {
                members.push(ArchiveMember {
                    name: member_name.clone(),
                    data: MemberData::External(member_name),
                });
            } else {
                members.push(ArchiveMember {
                    name: member_name,
                    data: MemberData::Inline(body..body + size),
                });
            }
        }

        pos = if stores_data { body + size } else { body };
        if pos % 2 == 1 {
            pos += 1; // members are 2-byte aligned
        }
    }
    Ok(members)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;

    fn member_header(name: &str, size: usize) -> Vec<u8> {
        let mut hdr = vec![b' '; 60];
        hdr[..name.len()].copy_from_slice(name.as_bytes());
        let size_str = size.to_string();
        hdr[48..48 + size_str.len()].copy_from_slice(size_str.as_bytes());
        hdr[58] = b'`';
        hdr[59] = b'\n';
        hdr
    }

    #[test]
    fn test_plain_members() {
        let mut ar = b"!<arch>\n".to_vec();
        ar.extend(member_header("hello.o/", 3));
        ar.extend(b"abc");
        ar.push(b'\n'); // alignment padding
        ar.extend(member_header("b.o/", 2));
        ar.extend(b"xy");

        let members = read_archive_members("libfoo.a", &ar).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "hello.o");
        assert_eq!(members[0].data, MemberData::Inline(68..71));
        assert_eq!(members[1].name, "b.o");
    }

    #[test]
    fn test_long_names_and_symbol_index() {
        let long_names = b"averyveryverylongmembername.o/\n";
        let mut ar = b"!<arch>\n".to_vec();
        ar.extend(member_header("/", 4));
        ar.extend(b"\0\0\0\0");
        ar.extend(member_header("//", long_names.len()));
        ar.extend(long_names);
        ar.push(b'\n');
        ar.extend(member_header("/0", 1));
        ar.extend(b"z");

        let members = read_archive_members("libbar.a", &ar).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "averyveryverylongmembername.o");
    }

    #[test]
    fn test_thin_members_are_paths() {
        let long_names = b"dir/obj.o/\n";
        let mut ar = b"!<thin>\n".to_vec();
        ar.extend(member_header("//", long_names.len()));
        ar.extend(long_names);
        ar.push(b'\n');
        ar.extend(member_header("/0", 17));

        let members = read_archive_members("libthin.a", &ar).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].data, MemberData::External("dir/obj.o".into()));
    }

    #[test]
    fn test_truncated_member_rejected() {
        let mut ar = b"!<arch>\n".to_vec();
        ar.extend(member_header("a.o/", 100));
        ar.extend(b"short");
        assert!(read_archive_members("bad.a", &ar).is_err());
    }
}
