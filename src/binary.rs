//! Binary patch machinery: base85 codec, zlib inflation, the
//! copy/insert delta applier, and whole-record binary application.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::errors::{ApplyError, ApplyErrorKind};
use crate::image::Image;
use crate::oid::ObjectId;
use crate::parse::{BinaryMethod, Patch};
use crate::store::{hash_object, ObjectKind, ObjectStore};

/// The base85 alphabet of the binary-patch encoding, in value order.
pub const BASE85_ALPHABET: &[u8; 85] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!#$%&()*+-;<=>?@^_`{|}~";

const fn build_decode_table() -> [i8; 256] {
    let mut table = [-1i8; 256];
    let mut i = 0;
    while i < 85 {
        table[BASE85_ALPHABET[i] as usize] = i as i8;
        i += 1;
    }
    table
}

static DECODE85: [i8; 256] = build_decode_table();

/// Decode `nbytes` of payload from base85 `src`. `src` must consist of
/// whole 5-character groups covering exactly `nbytes` (with up to 3
/// filler bytes in the final group). Any byte outside the alphabet or
/// an overflowing group is rejected.
pub fn decode_base85(src: &[u8], nbytes: usize) -> Result<Vec<u8>, String> {
    if src.len() != nbytes.div_ceil(4) * 5 {
        return Err(format!(
            "base85 group length {} does not cover {} bytes",
            src.len(),
            nbytes
        ));
    }
    let mut out = Vec::with_capacity(nbytes);
    let mut remaining = nbytes;
    for group in src.chunks_exact(5) {
        let mut acc: u64 = 0;
        for &c in group {
            let v = DECODE85[c as usize];
            if v < 0 {
                return Err(format!("invalid base85 byte {:#04x}", c));
            }
            acc = acc * 85 + v as u64;
        }
        if acc > u64::from(u32::MAX) {
            return Err("base85 group overflows 32 bits".to_string());
        }
        let word = (acc as u32).to_be_bytes();
        let take = remaining.min(4);
        out.extend_from_slice(&word[..take]);
        remaining -= take;
    }
    Ok(out)
}

/// Encode `data` as base85 (whole 5-character groups, zero filler).
pub fn encode_base85(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().div_ceil(4) * 5);
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let mut acc = u32::from_be_bytes(word);
        let mut group = [0u8; 5];
        for slot in group.iter_mut().rev() {
            *slot = BASE85_ALPHABET[(acc % 85) as usize];
            acc /= 85;
        }
        out.extend_from_slice(&group);
    }
    out
}

/// Inflate a zlib stream, insisting on exactly `expected` output bytes.
pub fn inflate(data: &[u8], expected: usize) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(expected);
    let mut decoder = ZlibDecoder::new(data);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| format!("inflate failed: {e}"))?;
    if out.len() != expected {
        return Err(format!(
            "inflated to {} bytes, expected {}",
            out.len(),
            expected
        ));
    }
    Ok(out)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<u64, String> {
    let mut size: u64 = 0;
    let mut shift = 0;
    loop {
        let &byte = delta.get(*pos).ok_or("truncated delta header")?;
        *pos += 1;
        size |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
        shift += 7;
        if shift > 63 {
            return Err("delta size varint too long".to_string());
        }
    }
}

/// Apply a delta stream to `base`: a pair of varint sizes followed by
/// copy (from base) and insert (from the delta itself) opcodes.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>, String> {
    let mut pos = 0;
    let src_size = read_delta_size(delta, &mut pos)?;
    if src_size != base.len() as u64 {
        return Err(format!(
            "delta expects a {src_size}-byte base, have {}",
            base.len()
        ));
    }
    let dst_size = read_delta_size(delta, &mut pos)?;
    let mut out = Vec::with_capacity(dst_size as usize);

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            let mut offset: usize = 0;
            let mut size: usize = 0;
            for bit in 0..4 {
                if cmd & (1 << bit) != 0 {
                    let &b = delta.get(pos).ok_or("truncated copy opcode")?;
                    pos += 1;
                    offset |= (b as usize) << (8 * bit);
                }
            }
            for bit in 0..3 {
                if cmd & (0x10 << bit) != 0 {
                    let &b = delta.get(pos).ok_or("truncated copy opcode")?;
                    pos += 1;
                    size |= (b as usize) << (8 * bit);
                }
            }
            if size == 0 {
                size = 0x10000;
            }
            let end = offset
                .checked_add(size)
                .filter(|&e| e <= base.len())
                .ok_or("copy opcode out of base bounds")?;
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let len = cmd as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= delta.len())
                .ok_or("truncated insert opcode")?;
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err("unexpected delta opcode 0".to_string());
        }
    }

    if out.len() as u64 != dst_size {
        return Err(format!(
            "delta produced {} bytes, expected {dst_size}",
            out.len()
        ));
    }
    Ok(out)
}

fn binary_error(patch: &Patch, kind: ApplyErrorKind, message: String) -> ApplyError {
    ApplyError::new(patch.best_name(), kind, message)
}

/// Replace `img` with the result of applying the binary change in
/// `patch`. Requires full (non-abbreviated) index-line hashes; verifies
/// the pre-image hash before and the post-image hash after.
pub fn apply_binary(
    patch: &Patch,
    img: &mut Image,
    store: &mut dyn ObjectStore,
    reverse: bool,
) -> Result<(), ApplyError> {
    let algo = store.algo();
    let hexsz = algo.hexsz();

    let full_index = patch.old_oid_hex.len() == hexsz
        && patch.new_oid_hex.len() == hexsz
        && ObjectId::from_hex(&patch.old_oid_hex, algo).is_ok()
        && ObjectId::from_hex(&patch.new_oid_hex, algo).is_ok();
    if !full_index {
        return Err(binary_error(
            patch,
            ApplyErrorKind::PreimageHashMismatch,
            "cannot apply binary patch without full index line".to_string(),
        ));
    }

    if patch.old_name.is_some() {
        let actual = hash_object(algo, ObjectKind::Blob, &img.bytes);
        if actual.to_hex() != patch.old_oid_hex {
            return Err(binary_error(
                patch,
                ApplyErrorKind::PreimageHashMismatch,
                format!(
                    "the patch applies to content hashed {actual}, which does not match the current contents"
                ),
            ));
        }
    } else if !img.is_empty() {
        return Err(binary_error(
            patch,
            ApplyErrorKind::DoesNotMatch,
            "the patch applies to an empty file but it is not empty".to_string(),
        ));
    }

    let new_oid = ObjectId::from_hex(&patch.new_oid_hex, algo).expect("validated above");
    if new_oid.is_null() {
        // Deletion patch.
        *img = Image::default();
        return Ok(());
    }

    if store.has(&new_oid) {
        // We already have the postimage.
        let (kind, bytes) = store.read(&new_oid).map_err(|e| {
            binary_error(
                patch,
                ApplyErrorKind::PostimageHashMismatch,
                format!("the necessary postimage {new_oid} cannot be read: {e}"),
            )
        })?;
        if kind != ObjectKind::Blob {
            return Err(binary_error(
                patch,
                ApplyErrorKind::TypeMismatch,
                format!("postimage {new_oid} is not a blob"),
            ));
        }
        *img = Image::new(bytes, false);
        return Ok(());
    }

    // A reversed application needs the optional second (reverse) hunk.
    let fragment = if reverse {
        patch.fragments.get(1).ok_or_else(|| {
            binary_error(
                patch,
                ApplyErrorKind::DoesNotMatch,
                "cannot reverse-apply a binary patch without the reverse hunk".to_string(),
            )
        })?
    } else {
        patch.fragments.first().ok_or_else(|| {
            binary_error(
                patch,
                ApplyErrorKind::DoesNotMatch,
                "missing binary patch data".to_string(),
            )
        })?
    };
    let hunk = fragment.binary.as_ref().ok_or_else(|| {
        binary_error(
            patch,
            ApplyErrorKind::DoesNotMatch,
            "missing binary patch data".to_string(),
        )
    })?;

    let result = match hunk.method {
        BinaryMethod::LiteralDeflated => hunk.data.clone(),
        BinaryMethod::DeltaDeflated => apply_delta(&img.bytes, &hunk.data).map_err(|e| {
            binary_error(
                patch,
                ApplyErrorKind::DoesNotMatch,
                format!("binary patch does not apply: {e}"),
            )
        })?,
    };

    let actual = hash_object(algo, ObjectKind::Blob, &result);
    if actual.to_hex() != patch.new_oid_hex {
        return Err(binary_error(
            patch,
            ApplyErrorKind::PostimageHashMismatch,
            format!(
                "binary patch creates incorrect result (expecting {}, got {actual})",
                patch.new_oid_hex
            ),
        ));
    }

    *img = Image::new(result, false);
    Ok(())
}
