use std::io::{self, Write};

use crate::vm::Endian;

/// Number of bytes to display on each line of a hex dump
const BYTES_PER_LINE: usize = 16;

/// Rounds `value` up to the next multiple of `align` (which must be a power of two).
pub fn align(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[test]
fn test_align() {
    for (value, alignment, expected) in [
        (0, 16, 0), (1, 16, 16), (15, 16, 16), (16, 16, 16), (17, 16, 32),
        (0x51, 4, 0x54), (0x52, 2, 0x52), (0x53, 2, 0x54), (7, 8, 8), (9, 1, 9),
    ] {
        assert_eq!(align(value, alignment), expected, "align({value}, {alignment})");
    }
}

/// Padding needed after `raw` bytes so that a region starting at `base` ends on a 16 byte boundary.
pub fn section_padding(base: u32, raw: u32) -> u32 {
    align(base + raw, 0x10) - (base + raw)
}

/// An append-only byte buffer that writes multi-byte integers in a fixed endianness.
pub struct ByteWriter {
    pub bytes: Vec<u8>,
    endian: Endian,
}
impl ByteWriter {
    pub fn new(endian: Endian) -> Self {
        Self { bytes: Vec::with_capacity(64), endian }
    }
    pub fn with_bytes(bytes: Vec<u8>, endian: Endian) -> Self {
        Self { bytes, endian }
    }
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }
    pub fn u8(&mut self, v: u8) { self.bytes.push(v) }
    pub fn u16(&mut self, v: u16) { self.raw(&match self.endian { Endian::Little => v.to_le_bytes(), Endian::Big => v.to_be_bytes() }) }
    pub fn u32(&mut self, v: u32) { self.raw(&match self.endian { Endian::Little => v.to_le_bytes(), Endian::Big => v.to_be_bytes() }) }
    pub fn u64(&mut self, v: u64) { self.raw(&match self.endian { Endian::Little => v.to_le_bytes(), Endian::Big => v.to_be_bytes() }) }
    pub fn f32(&mut self, v: f32) { self.u32(v.to_bits()) }
    pub fn raw(&mut self, v: &[u8]) { self.bytes.extend_from_slice(v) }
    /// Appends `s` followed by a null terminator.
    pub fn cstr(&mut self, s: &str) {
        self.raw(s.as_bytes());
        self.u8(0);
    }
    /// Zero-fills until the buffer length reaches `len`.
    pub fn pad_to(&mut self, len: u32) {
        debug_assert!(len >= self.len());
        self.bytes.resize(len as usize, 0);
    }
    /// Overwrites bytes at `pos` with an encoded `u16`.
    pub fn patch_u16(&mut self, pos: u32, v: u16) {
        let encoded = match self.endian { Endian::Little => v.to_le_bytes(), Endian::Big => v.to_be_bytes() };
        self.bytes[pos as usize..pos as usize + 2].copy_from_slice(&encoded);
    }
    /// Overwrites bytes at `pos` with `v` (which must already be in file endianness).
    pub fn patch(&mut self, pos: u32, v: &[u8]) {
        self.bytes[pos as usize..pos as usize + v.len()].copy_from_slice(v);
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Decodes a `u16` from `bytes` at `pos` in the given endianness.
pub fn read_u16(bytes: &[u8], pos: usize, endian: Endian) -> u16 {
    let raw = [bytes[pos], bytes[pos + 1]];
    match endian { Endian::Little => u16::from_le_bytes(raw), Endian::Big => u16::from_be_bytes(raw) }
}
/// Decodes a `u32` from `bytes` at `pos` in the given endianness.
pub fn read_u32(bytes: &[u8], pos: usize, endian: Endian) -> u32 {
    let raw = [bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]];
    match endian { Endian::Little => u32::from_le_bytes(raw), Endian::Big => u32::from_be_bytes(raw) }
}

#[test]
fn test_writer_endian() {
    let mut le = ByteWriter::new(Endian::Little);
    le.u16(0x1234);
    le.u32(0xdeadbeef);
    assert_eq!(le.bytes, [0x34, 0x12, 0xef, 0xbe, 0xad, 0xde]);
    assert_eq!(read_u32(&le.bytes, 2, Endian::Little), 0xdeadbeef);

    let mut be = ByteWriter::new(Endian::Big);
    be.u16(0x1234);
    be.u32(0xdeadbeef);
    be.patch_u16(0, 0xfffe);
    assert_eq!(be.bytes, [0xff, 0xfe, 0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(read_u16(&be.bytes, 0, Endian::Big), 0xfffe);
}

/// Writes a hex dump of `bytes` to `f`, with addresses starting at `base`.
pub fn hex_dump(bytes: &[u8], base: u32, f: &mut dyn Write) -> io::Result<()> {
    for (i, line) in bytes.chunks(BYTES_PER_LINE).enumerate() {
        write!(f, "{:08x}   ", base as usize + i * BYTES_PER_LINE)?;
        for &b in line {
            write!(f, " {b:02x}")?;
        }
        for _ in line.len()..BYTES_PER_LINE {
            write!(f, "   ")?;
        }
        write!(f, "    ")?;
        for &b in line {
            write!(f, "{}", if (0x21..=0x7e).contains(&b) { b as char } else { '.' })?;
        }
        writeln!(f)?;
    }
    Ok(())
}
