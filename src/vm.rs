//! The closed set of VM revisions this backend can target, along with their layout constants.

use serde::{Serialize, Deserialize};

/// Byte order used for every multi-byte integer in an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

/// An on-disk script format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmRevision {
    /// The legacy VM (0x50 byte header, 20 byte exports).
    T7,
    /// The newer VM family at revision `0x36` (0x60 byte header, 24 byte exports).
    Vm36,
}

/// A fully resolved compilation target: VM revision plus the platform's endianness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub vm: VmRevision,
    pub endian: Endian,
}
impl Default for Target {
    fn default() -> Self {
        Self::t7_pc()
    }
}
impl Target {
    /// T7 on little-endian platforms (PC, PS4, XB1).
    pub fn t7_pc() -> Self { Self { vm: VmRevision::T7, endian: Endian::Little } }
    /// T7 on big-endian consoles (PS3, Xbox 360).
    pub fn t7_console() -> Self { Self { vm: VmRevision::T7, endian: Endian::Big } }
    /// T8 revision `0x36`, which is only ever little-endian.
    pub fn t8() -> Self { Self { vm: VmRevision::Vm36, endian: Endian::Little } }

    pub fn is_t7(&self) -> bool { self.vm == VmRevision::T7 }
    pub fn is_little(&self) -> bool { self.endian == Endian::Little }

    /// Width of an encoded opcode in bytes.
    pub fn op_width(&self) -> u32 {
        match self.endian { Endian::Little => 2, Endian::Big => 1 }
    }
    pub fn header_size(&self) -> u32 {
        match self.vm { VmRevision::T7 => 0x50, VmRevision::Vm36 => 0x60 }
    }
    pub fn export_entry_size(&self) -> u32 {
        match self.vm { VmRevision::T7 => 20, VmRevision::Vm36 => 24 }
    }
    pub fn magic(&self) -> u64 {
        match self.vm {
            VmRevision::T7 => 0x1C000A0D43534780,
            VmRevision::Vm36 => u64::from_le_bytes([0x80, 0x47, 0x53, 0x43, 0x0D, 0x0A, 0x00, 0x36]),
        }
    }
    pub fn default_checksum(&self) -> u32 {
        match self.vm {
            VmRevision::T7 => 0x4C492053,
            VmRevision::Vm36 => u32::from_le_bytes([0x38, 0x9D, 0x6E, 0x63]),
        }
    }
    /// Size of a single string fixup row header.
    pub fn string_row_header_size(&self) -> u32 {
        match (self.vm, self.endian) {
            (VmRevision::T7, Endian::Little) => 8,
            (VmRevision::T7, Endian::Big) => 4,
            (VmRevision::Vm36, _) => 8,
        }
    }
}

#[test]
fn test_target_constants() {
    let pc = Target::t7_pc();
    let console = Target::t7_console();
    let t8 = Target::t8();

    assert_eq!((pc.op_width(), console.op_width(), t8.op_width()), (2, 1, 2));
    assert_eq!((pc.header_size(), t8.header_size()), (0x50, 0x60));
    assert_eq!((pc.export_entry_size(), t8.export_entry_size()), (20, 24));
    assert_eq!(t8.magic().to_le_bytes(), [0x80, 0x47, 0x53, 0x43, 0x0D, 0x0A, 0x00, 0x36]);
    assert_eq!(pc.magic().to_le_bytes()[..4], [0x80, 0x47, 0x53, 0x43]);
    assert_eq!((pc.string_row_header_size(), console.string_row_header_size()), (8, 4));
}
