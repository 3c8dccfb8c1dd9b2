//! UTF-8 encode/decode helpers.
//!
//! PocketLang strings are byte strings, but
//! source text is UTF-8 and the compiler still needs to decode one
//! codepoint at a time for identifiers/string-literal escapes, and to
//! encode a codepoint back into bytes for `\xNN`-style escapes and for the
//! host's `stdout_write`/`stderr_write` callbacks.

/// Decode one UTF-8 codepoint from the front of `bytes`.
///
/// Returns `(codepoint, byte_len)`, or `None` if `bytes` is empty or starts
/// with an invalid sequence. Invalid sequences decode nothing; the caller
/// should fall back to treating the byte as raw/Latin-1 (`bytes[0] as u32`)
/// the way a byte-string language typically does, rather than failing the
/// whole read.
pub fn decode_one(bytes: &[u8]) -> Option<(u32, usize)> {
    let first = *bytes.first()?;
    let len = utf8_len(first)?;
    if bytes.len() < len {
        return None;
    }
    let cp = match len {
        1 => first as u32,
        2 => ((first as u32 & 0x1F) << 6) | cont(bytes[1])?,
        3 => {
            ((first as u32 & 0x0F) << 12) | (cont(bytes[1])? << 6) | cont(bytes[2])?
        }
        4 => {
            ((first as u32 & 0x07) << 18)
                | (cont(bytes[1])? << 12)
                | (cont(bytes[2])? << 6)
                | cont(bytes[3])?
        }
        _ => return None,
    };
    Some((cp, len))
}

fn cont(byte: u8) -> Option<u32> {
    if byte & 0xC0 == 0x80 {
        Some((byte & 0x3F) as u32)
    } else {
        None
    }
}

fn utf8_len(first_byte: u8) -> Option<usize> {
    if first_byte & 0x80 == 0 {
        Some(1)
    } else if first_byte & 0xE0 == 0xC0 {
        Some(2)
    } else if first_byte & 0xF0 == 0xE0 {
        Some(3)
    } else if first_byte & 0xF8 == 0xF0 {
        Some(4)
    } else {
        None
    }
}

/// Encode a codepoint as UTF-8 bytes, appending to `out`.
///
/// Values outside the valid codepoint range (or in the surrogate range) are
/// replaced with `U+FFFD`, matching how the compiler handles a malformed
/// `\xNN`/`\u{..}` escape rather than producing invalid output bytes.
pub fn encode_one(codepoint: u32, out: &mut Vec<u8>) {
    let cp = match char::from_u32(codepoint) {
        Some(c) => c,
        None => char::REPLACEMENT_CHARACTER,
    };
    let mut buf = [0u8; 4];
    out.extend_from_slice(cp.encode_utf8(&mut buf).as_bytes());
}

/// Number of UTF-8 bytes a leading byte indicates, or `None` if it cannot
/// start a sequence (a stray continuation byte or invalid lead byte).
pub fn leading_byte_len(first_byte: u8) -> Option<usize> {
    utf8_len(first_byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ascii() {
        assert_eq!(decode_one(b"A"), Some((b'A' as u32, 1)));
    }

    #[test]
    fn decodes_multibyte() {
        let bytes = "é".as_bytes();
        assert_eq!(decode_one(bytes), Some(('é' as u32, 2)));
        let bytes = "€".as_bytes();
        assert_eq!(decode_one(bytes), Some(('€' as u32, 3)));
        let bytes = "🦀".as_bytes();
        assert_eq!(decode_one(bytes), Some(('🦀' as u32, 4)));
    }

    #[test]
    fn rejects_truncated_sequence() {
        let bytes = "é".as_bytes();
        assert_eq!(decode_one(&bytes[..1]), None);
    }

    #[test]
    fn roundtrips_through_encode() {
        let mut out = Vec::new();
        encode_one('🦀' as u32, &mut out);
        assert_eq!(decode_one(&out), Some(('🦀' as u32, 4)));
    }

    #[test]
    fn encode_replaces_invalid_codepoint() {
        let mut out = Vec::new();
        encode_one(0xD800, &mut out); // surrogate, invalid scalar value
        assert_eq!(out, char::REPLACEMENT_CHARACTER.to_string().into_bytes());
    }
}
