//! SQL text helpers for dynamically named tables

use sceneshard_common::naming::MAX_IDENTIFIER_LEN;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `<base>_<suffix>` kept within the identifier limit. When the plain form is
/// too long, the base is shortened and tagged with a hash of the full base so
/// that distinct bases still yield distinct names.
pub fn derived_identifier(base: &str, suffix: &str) -> String {
    let plain = format!("{}_{}", base, suffix);
    if plain.len() <= MAX_IDENTIFIER_LEN {
        return plain;
    }

    let keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len() + 10);
    let mut cut = keep.min(base.len());
    while !base.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = base[..cut].trim_end_matches('_');
    format!("{}_{:08x}_{}", head, fnv1a(base), suffix)
}

fn fnv1a(value: &str) -> u32 {
    value.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}
