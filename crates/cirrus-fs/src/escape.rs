//! Name escaping between cloud and local encodings
//!
//! Cloud names may contain bytes the local filesystem forbids. Each forbidden
//! byte becomes `%` followed by two lowercase hex digits; the names `.` and
//! `..` are escaped whole. Unescaping reverses exactly the sequences that
//! would have been produced for the target filesystem, so the two functions
//! are mutual inverses on UTF-8 input for a fixed [`FsKind`].

use unicode_normalization::{is_nfc, UnicodeNormalization};

use crate::fskind::{is_name_byte_allowed, FsKind};

/// NFC-normalizes a name. Applied before comparison and before anything is
/// sent to the cloud.
#[must_use]
pub fn normalize_nfc(name: &str) -> String {
    if is_nfc(name) {
        name.to_string()
    } else {
        name.nfc().collect()
    }
}

/// Escapes a cloud name into a form valid on filesystem family `kind`.
#[must_use]
pub fn escape_name(name: &str, kind: FsKind) -> String {
    // "." and ".." are directory pseudo-entries everywhere; escape whole.
    if name == "." {
        return "%2e".to_string();
    }
    if name == ".." {
        return "%2e%2e".to_string();
    }

    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii() && !is_name_byte_allowed(ch as u8, kind) {
            out.push_str(&format!("%{:02x}", ch as u32));
        } else {
            out.push(ch);
        }
    }
    out
}

/// Reverses [`escape_name`] for the same filesystem family.
///
/// Only well-formed `%xx` sequences whose byte is actually forbidden on
/// `kind` are unescaped; everything else is literal text the user typed.
#[must_use]
pub fn unescape_name(name: &str, kind: FsKind) -> String {
    if name == "%2e" {
        return ".".to_string();
    }
    if name == "%2e%2e" {
        return "..".to_string();
    }

    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() && is_lhex(bytes[i + 1]) && is_lhex(bytes[i + 2])
        {
            let value = (hexval(bytes[i + 1]) << 4) | hexval(bytes[i + 2]);
            if !is_name_byte_allowed(value, kind) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    // Escapes only ever replace ASCII bytes, so the output is valid UTF-8.
    String::from_utf8(out).expect("unescape preserves UTF-8 validity")
}

fn is_lhex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

fn hexval(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        _ => b - b'a' + 10,
    }
}
