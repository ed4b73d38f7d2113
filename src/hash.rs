//! Identifier hashing and integrity checksums.
//!
//! All functions in this module are pure, so they can be shared freely between compilations.

use crate::vm::VmRevision;

/// Seed of the 32-bit identifier hashes.
pub const HASH32_IV: u32 = 0x4B9ACE2F;
/// Multiplier of the case-insensitive 32-bit hash.
pub const HASH32_KEY: u32 = 0x1000193;

/// Standard FNV-1a 64-bit offset basis.
pub const FNV64_OFFSET: u64 = 14695981039346656037;
/// Standard FNV-1a 64-bit prime.
pub const FNV64_PRIME: u64 = 0x100000001b3;

const T7_HASH_PREFIXES: &[&str] = &["function_", "func_", "namespace_", "var_", "hash_"];
const T8_HASH_PREFIXES: &[&str] = &["func_", "function_", "namespace_", "var_", "event_", "hash_", "script_"];

/// The case-insensitive multiplicative hash used for in-namespace identifiers on the legacy VM.
pub fn hash32(input: &str) -> u32 {
    let mut hash = HASH32_IV;
    for c in input.bytes() {
        hash = (c.to_ascii_lowercase() as u32 ^ hash).wrapping_mul(HASH32_KEY);
    }
    hash.wrapping_mul(HASH32_KEY)
}

/// The 32-bit identifier hash used by the newer VM family.
pub fn t8_hash32(input: &str) -> u32 {
    let mut hash = HASH32_IV;
    for c in input.bytes() {
        let mut t = (c.to_ascii_lowercase() as u32).wrapping_add(hash);
        t ^= t << 10;
        hash = t.wrapping_add(t >> 6);
    }
    let nine = hash.wrapping_mul(9);
    0x8001u32.wrapping_mul(nine ^ (nine >> 11))
}

/// FNV-1a over raw bytes with a configurable offset basis and prime.
pub fn fnv1a64_with(bytes: &[u8], offset: u64, prime: u64) -> u64 {
    bytes.iter().fold(offset, |hash, &b| (hash ^ b as u64).wrapping_mul(prime))
}

/// FNV-1a over raw bytes with the standard constants.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a64_with(bytes, FNV64_OFFSET, FNV64_PRIME)
}

/// The 64-bit key used by the newer VM for script paths and canonical hashes.
pub fn t8_hash64(input: &str) -> u64 {
    0x7FFF_FFFF_FFFF_FFFF & fnv1a64(input.to_ascii_lowercase().as_bytes())
}

/// Parses identifiers like `func_1a2b3c4d` as an explicit hash value.
///
/// Returns [`None`] if `input` does not carry a known prefix, or if the suffix is not valid hex.
pub fn parse_hash_literal(input: &str, vm: VmRevision) -> Option<u64> {
    let prefixes = match vm { VmRevision::T7 => T7_HASH_PREFIXES, VmRevision::Vm36 => T8_HASH_PREFIXES };
    let lower = input.to_ascii_lowercase();
    for prefix in prefixes {
        if let Some(digits) = lower.strip_prefix(prefix) {
            if digits.is_empty() { continue }
            return u64::from_str_radix(digits, 16).ok();
        }
    }
    None
}

/// Standard CRC-32 (IEEE) of `bytes`, as stamped into export entries.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

#[test]
fn test_hash32() {
    for (input, expected) in [
        ("foo", 0xfd5febdb),
        ("main", 0xd290ebfa),
        ("isdefined", 0x74486ffc),
        ("ilcustom", 0x56656f33),
        ("", 0x33b293fd),
    ] {
        assert_eq!(hash32(input), expected, "{input:?}");
    }
    assert_eq!(hash32("Foo"), hash32("foo"));
    assert_eq!(hash32("ISDEFINED"), hash32("isDefined"));
}

#[test]
fn test_t8_hash32() {
    for (input, expected) in [
        ("foo", 0x6c39b394),
        ("main", 0xfb7d78f8),
        ("isdefined", 0x99e49f55),
        ("", 0xc1243180),
    ] {
        assert_eq!(t8_hash32(input), expected, "{input:?}");
    }
    assert_eq!(t8_hash32("MAIN"), t8_hash32("main"));
}

#[test]
fn test_fnv1a64_vectors() {
    assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
    assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
    assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    assert_eq!(fnv1a64_with(b"foobar", FNV64_OFFSET, FNV64_PRIME), fnv1a64(b"foobar"));
    assert_eq!(t8_hash64("FOOBAR"), 0x85944171f73967e8 & 0x7FFF_FFFF_FFFF_FFFF);
}

#[test]
fn test_hash_literals() {
    assert_eq!(parse_hash_literal("func_DEADBEEF", VmRevision::T7), Some(0xdeadbeef));
    assert_eq!(parse_hash_literal("hash_10", VmRevision::T7), Some(0x10));
    assert_eq!(parse_hash_literal("event_10", VmRevision::T7), None);
    assert_eq!(parse_hash_literal("event_10", VmRevision::Vm36), Some(0x10));
    assert_eq!(parse_hash_literal("func_", VmRevision::T7), None);
    assert_eq!(parse_hash_literal("func_xyz", VmRevision::T7), None);
    assert_eq!(parse_hash_literal("player", VmRevision::T7), None);
}

#[test]
fn test_crc32() {
    assert_eq!(crc32(b"123456789"), 0xcbf43926);
    assert_eq!(crc32(b""), 0);
}
