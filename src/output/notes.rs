//! Note chunks: build-id, GNU property, package metadata

use crate::context::Context;
use crate::elf::{
    GNU_PROPERTY_X86_FEATURE_1_AND, GNU_PROPERTY_X86_ISA_1_NEEDED, NT_FDO_PACKAGING_METADATA,
    NT_GNU_BUILD_ID, NT_GNU_PROPERTY_TYPE_0,
};
use crate::hash::SipHash13;
use crate::options::BuildIdKind;
use crate::output::ChunkKind;

pub fn update_note_sizes(cx: &mut Context) {
    if let Some(id) = cx.refs.note_buildid {
        let size = cx.options.build_id.size();
        cx.chunk_mut(id).shdr.sh_size = 16 + size as u64;
    }
    if let Some(id) = cx.refs.note_property {
        let word = cx.word_size();
        let mut num_props = 0u64;
        if let ChunkKind::NoteProperty { features, isa } = cx.chunk(id).kind {
            if features != 0 {
                num_props += 1;
            }
            if isa != 0 {
                num_props += 1;
            }
        }
        cx.chunk_mut(id).shdr.sh_size = if num_props == 0 {
            0
        } else {
            16 + num_props * (8 + word)
        };
    }
    if let Some(id) = cx.refs.note_package {
        let size = match &cx.options.package_metadata {
            // Header plus the string and its terminator, padded to 4.
            Some(s) => (16 + s.len() as u64 + 1 + 3) & !3,
            None => 0,
        };
        cx.chunk_mut(id).shdr.sh_size = size;
    }
}

pub fn copy_notes(cx: &Context, out: &mut [u8]) {
    let enc = cx.enc;

    if let Some(id) = cx.refs.note_buildid {
        let chunk = cx.chunk(id);
        if chunk.shdr.sh_size > 0 {
            let base = chunk.shdr.sh_offset as usize;
            let size = cx.options.build_id.size();
            enc.put_u32(out, base, 4);
            enc.put_u32(out, base + 4, size as u32);
            enc.put_u32(out, base + 8, NT_GNU_BUILD_ID);
            out[base + 12..base + 16].copy_from_slice(b"GNU\0");
            // The hash itself is filled in after the whole image exists.
        }
    }

    if let Some(id) = cx.refs.note_property {
        let chunk = cx.chunk(id);
        if chunk.shdr.sh_size > 0 {
            if let ChunkKind::NoteProperty { features, isa } = chunk.kind {
                let word = cx.word_size() as usize;
                let base = chunk.shdr.sh_offset as usize;
                enc.put_u32(out, base, 4);
                enc.put_u32(out, base + 4, (chunk.shdr.sh_size - 16) as u32);
                enc.put_u32(out, base + 8, NT_GNU_PROPERTY_TYPE_0);
                out[base + 12..base + 16].copy_from_slice(b"GNU\0");
                let mut pos = base + 16;
                if features != 0 {
                    enc.put_u32(out, pos, GNU_PROPERTY_X86_FEATURE_1_AND);
                    enc.put_u32(out, pos + 4, 4);
                    enc.put_u32(out, pos + 8, features);
                    pos += 8 + word;
                }
                if isa != 0 {
                    enc.put_u32(out, pos, GNU_PROPERTY_X86_ISA_1_NEEDED);
                    enc.put_u32(out, pos + 4, 4);
                    enc.put_u32(out, pos + 8, isa);
                }
            }
        }
    }

    if let Some(id) = cx.refs.note_package {
        let chunk = cx.chunk(id);
        if chunk.shdr.sh_size > 0 {
            if let Some(s) = &cx.options.package_metadata {
                let base = chunk.shdr.sh_offset as usize;
                enc.put_u32(out, base, 4);
                enc.put_u32(out, base + 4, s.len() as u32 + 1);
                enc.put_u32(out, base + 8, NT_FDO_PACKAGING_METADATA);
                out[base + 12..base + 16].copy_from_slice(b"FDO\0");
                out[base + 16..base + 16 + s.len()].copy_from_slice(s.as_bytes());
            }
        }
    }
}

/// Compute the build-id over the finished image and patch it in. Must be
/// the very last write to the buffer.
pub fn write_build_id(cx: &Context, out: &mut [u8]) {
    let Some(id) = cx.refs.note_buildid else { return };
    let chunk = cx.chunk(id);
    if chunk.shdr.sh_size == 0 {
        return;
    }
    let base = chunk.shdr.sh_offset as usize + 16;

    match &cx.options.build_id {
        BuildIdKind::None => {}
        BuildIdKind::Hex(bytes) => {
            out[base..base + bytes.len()].copy_from_slice(bytes);
        }
        BuildIdKind::Fast | BuildIdKind::Uuid => {
            let mut h1 = SipHash13::new(0x243f6a8885a308d3, 0x13198a2e03707344);
            h1.update(out);
            let a = h1.finish();
            let mut h2 = SipHash13::new(a, 0xa4093822299f31d0);
            h2.update(out);
            let b = h2.finish();
            let mut digest = [0u8; 16];
            digest[..8].copy_from_slice(&a.to_le_bytes());
            digest[8..].copy_from_slice(&b.to_le_bytes());
            if matches!(cx.options.build_id, BuildIdKind::Uuid) {
                // RFC 4122 version/variant bits, so tooling treats it as
                // a real UUID.
                digest[6] = (digest[6] & 0x0f) | 0x40;
                digest[8] = (digest[8] & 0x3f) | 0x80;
            }
            out[base..base + 16].copy_from_slice(&digest);
        }
    }
}
