//! The sections of a script image and the header that indexes them.
//!
//! Sections are committed one after another into a single buffer, so the base address of a section is always the
//! sum of the sizes of every section before it. Each section is padded so that it ends on a 16 byte boundary.

use compact_str::CompactString;
use tracing::{debug, trace};

use crate::*;
use crate::arena::Chain;
use crate::function::{Function, FunctionKey, FunctionLayout};
use crate::table::{ScriptTables, TableEntry};
use crate::util::{section_padding, ByteWriter};
use crate::vm::{Target, VmRevision};

/// The largest value of a 16 bit count field.
const U16_LIMIT: usize = u16::MAX as usize;

const IMPORT_ROW_HEADER: u32 = 12;
const DEBUG_ROW_HEADER: u32 = 8;
const GLOBAL_ROW_HEADER: u32 = 8;

/// A region of the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    Header,
    /// The script name (legacy VM only).
    Name,
    Strings,
    Exports,
    Imports,
    Includes,
    /// String reference rows, which are stored apart from the strings on the legacy VM.
    StringFixups,
    DebugStrings,
    Globals,
}
impl SectionKind {
    /// The order sections are committed in on `vm`.
    pub fn order(vm: VmRevision) -> &'static [SectionKind] {
        match vm {
            VmRevision::T7 => &[Self::Header, Self::Name, Self::Strings, Self::Exports, Self::Imports, Self::Includes, Self::StringFixups, Self::DebugStrings],
            VmRevision::Vm36 => &[Self::Header, Self::Exports, Self::Imports, Self::Strings, Self::Includes, Self::Globals],
        }
    }
}

/// Where a section ended up in the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionRecord {
    pub kind: SectionKind,
    pub base: u32,
    /// Size including the trailing padding.
    pub size: u32,
}

/// The offset and count fields of the fixed image header.
/// Each section fills in its own fields as it is committed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptHeader {
    pub checksum: u32,
    /// 64-bit hash of the script name (newer VM only).
    pub name_hash: u64,
    pub name_offset: u32,
    pub include_offset: u32,
    pub include_count: u16,
    pub bytecode_offset: u32,
    pub bytecode_size: u32,
    pub string_offset: u32,
    pub string_count: u16,
    pub debug_string_offset: u32,
    pub debug_string_count: u16,
    pub export_offset: u32,
    pub export_count: u16,
    pub import_offset: u32,
    pub import_count: u16,
    pub global_offset: u32,
    pub global_count: u16,
}
impl ScriptHeader {
    /// Encodes the header, which is exactly [`Target::header_size`] bytes long.
    pub fn encode(&self, target: Target) -> Vec<u8> {
        let size = target.header_size();
        let mut w = ByteWriter::new(target.endian);
        w.u64(target.magic());
        w.u32(self.checksum);
        match target.vm {
            VmRevision::T7 => {
                w.u32(self.include_offset);
                w.u32(size);
                w.u32(self.bytecode_offset);
                w.u32(self.string_offset);
                w.u32(self.debug_string_offset);
                w.u32(self.export_offset);
                w.u32(self.import_offset);
                w.u32(size);
                w.u32(size);
                w.u32(self.bytecode_size);
                if target.is_little() { w.u32(self.name_offset) } else { w.u16(self.name_offset as u16) }
                w.u16(self.string_count);
                w.u16(self.export_count);
                w.u16(self.import_count);
                w.u16(0);
                w.u16(0);
                w.u16(self.debug_string_count);
                w.u8(self.include_count as u8);
                w.u8(0);
                w.u8(0);
            }
            VmRevision::Vm36 => {
                w.u32(0);
                w.u64(self.name_hash);
                w.u32(self.include_offset);
                w.u16(self.string_count);
                w.u16(self.export_count);
                w.u32(0);
                w.u32(self.string_offset);
                w.u16(self.import_count);
                w.u16(0);
                w.u32(0);
                w.u32(self.export_offset);
                w.u32(0);
                w.u32(self.import_offset);
                w.u16(self.global_count);
                w.u16(0);
                w.u32(size);
                w.u32(self.global_offset);
                for _ in 0..4 {
                    w.u32(size);
                }
                w.u16(self.include_count);
                w.u16(0);
                w.u32(0);
            }
        }
        debug_assert!(w.len() <= size);
        w.pad_to(size);
        w.into_inner()
    }
}

/// The inputs that decide the size of every section.
pub struct SectionContents<'a> {
    pub target: Target,
    pub script_name: &'a str,
    pub includes: &'a [CompactString],
    pub tables: &'a ScriptTables,
    /// Must already hold the export and bytecode fields, which the function layout pass fills in.
    pub header: &'a ScriptHeader,
}
impl SectionContents<'_> {
    /// Size of a section starting at `base`, including the padding up to the next 16 byte boundary.
    pub fn size(&self, kind: SectionKind, base: u32) -> u32 {
        let target = self.target;
        let strings = || self.tables.strings.entries().map(|x| x.value.len() as u32 + 1).sum::<u32>();
        let raw = match kind {
            SectionKind::Header => target.header_size(),
            SectionKind::Name => self.script_name.len() as u32 + 1,
            SectionKind::Strings => match target.vm {
                VmRevision::T7 => strings(),
                VmRevision::Vm36 => self.tables.strings.rows_size(target.string_row_header_size()) + strings(),
            },
            SectionKind::Exports => self.header.bytecode_offset + self.header.bytecode_size - self.header.export_offset,
            SectionKind::Imports => self.tables.imports.rows_size(IMPORT_ROW_HEADER),
            SectionKind::Includes => match target.vm {
                VmRevision::T7 => self.includes.iter().map(|x| 4 + x.len() as u32 + 1).sum(),
                VmRevision::Vm36 => self.includes.len() as u32 * 8,
            },
            SectionKind::StringFixups => self.tables.strings.rows_size(target.string_row_header_size()),
            SectionKind::DebugStrings => self.tables.debug.rows_size(DEBUG_ROW_HEADER),
            SectionKind::Globals => self.tables.globals.rows_size(GLOBAL_ROW_HEADER),
        };
        raw + section_padding(base, raw)
    }
}

/// Everything the sections are committed from.
pub(crate) struct SectionWriter<'a> {
    pub target: Target,
    pub script_name: &'a str,
    pub includes: &'a [CompactString],
    pub functions: &'a mut Chain<FunctionKey, Function>,
    pub tables: &'a mut ScriptTables,
    pub header: ScriptHeader,
    pub writer: ByteWriter,
    pub layouts: Vec<FunctionLayout>,
    pub records: Vec<SectionRecord>,
}
impl SectionWriter<'_> {
    fn contents(&self) -> SectionContents<'_> {
        SectionContents { target: self.target, script_name: self.script_name, includes: self.includes, tables: &*self.tables, header: &self.header }
    }

    /// Commits every section in order and then fills in the header.
    ///
    /// The size of each section is known before any of its bytes are written. The exports section is the exception
    /// only in that its functions have to be laid out first, since their bytecode is part of the section.
    pub fn commit(&mut self) -> Result<(), CompileError> {
        for &kind in SectionKind::order(self.target.vm) {
            let base: u32 = self.records.iter().map(|x| x.size).sum();
            debug_assert_eq!(base, self.writer.len());

            if kind == SectionKind::Exports { self.lay_out_functions(base)? }
            let expected = self.contents().size(kind, base);

            match kind {
                SectionKind::Header => self.writer.pad_to(base + self.target.header_size()),
                SectionKind::Name => self.commit_name(base),
                SectionKind::Strings => self.commit_strings(base)?,
                SectionKind::Exports => self.commit_exports(base),
                SectionKind::Imports => self.commit_imports(base)?,
                SectionKind::Includes => self.commit_includes(base)?,
                SectionKind::StringFixups => self.commit_string_fixups(base)?,
                SectionKind::DebugStrings => self.commit_debug_strings(base)?,
                SectionKind::Globals => self.commit_globals(base)?,
            }

            let written = self.writer.len() - base;
            debug_assert_eq!(written + section_padding(base, written), expected, "{kind:?} does not match its size");
            self.writer.pad_to(base + expected);
            let size = self.writer.len() - base;
            debug!(?kind, base, size, "committed section");
            self.records.push(SectionRecord { kind, base, size });
        }

        let header = self.header.encode(self.target);
        self.writer.patch(0, &header);
        Ok(())
    }

    fn commit_name(&mut self, base: u32) {
        self.header.name_offset = base;
        self.writer.cstr(self.script_name);
    }

    fn commit_strings(&mut self, base: u32) -> Result<(), CompileError> {
        match self.target.vm {
            VmRevision::T7 => {
                let little = self.target.is_little();
                for entry in self.tables.strings.entries_mut() {
                    let address = self.writer.len();
                    if !little && address > u16::MAX as u32 {
                        return Err(CompileError::CapacityExceeded { what: "string address", count: address as usize, limit: u16::MAX as usize });
                    }
                    entry.address = Some(address);
                    self.writer.cstr(&entry.value);
                }
            }
            VmRevision::Vm36 => {
                let rows = self.tables.strings.row_count();
                error::check_capacity("string rows", rows, U16_LIMIT)?;
                self.header.string_offset = base;
                self.header.string_count = rows as u16;

                let mut address = base + self.tables.strings.rows_size(self.target.string_row_header_size());
                for entry in self.tables.strings.entries_mut() {
                    entry.address = Some(address);
                    address += entry.value.len() as u32 + 1;
                }
                for entry in self.tables.strings.entries() {
                    let value = entry.address.unwrap_or_default();
                    write_rows(&mut self.writer, entry, |w, count| {
                        w.u32(value);
                        w.u8(count);
                        w.u8(0);
                        w.u16(0);
                    });
                }
                for entry in self.tables.strings.entries() {
                    debug_assert_eq!(entry.address, Some(self.writer.len()));
                    self.writer.cstr(&entry.value);
                }
            }
        }
        Ok(())
    }

    /// Reserves the export entries and lays out every function right after them.
    fn lay_out_functions(&mut self, base: u32) -> Result<(), CompileError> {
        let count = self.functions.len();
        error::check_capacity("exports", count, U16_LIMIT)?;
        self.header.export_offset = base;
        self.header.export_count = count as u16;

        let entries_end = base + count as u32 * self.target.export_entry_size();
        self.writer.pad_to(entries_end);

        let keys: Vec<FunctionKey> = self.functions.keys().collect();
        for key in keys {
            let Some(function) = self.functions.get_mut(key) else { continue };
            let layout = function.commit(&mut self.writer, self.tables)?;
            trace!(name = %layout.name, address = layout.address, size = layout.size, crc = layout.crc, "laid out function");
            self.layouts.push(layout);
        }

        self.header.bytecode_offset = self.layouts.first().map(|x| x.address).unwrap_or(entries_end);
        self.header.bytecode_size = self.writer.len() - self.header.bytecode_offset;
        Ok(())
    }

    fn commit_exports(&mut self, base: u32) {
        let entry_size = self.target.export_entry_size();
        for (i, layout) in self.layouts.iter().enumerate() {
            let mut entry = ByteWriter::new(self.target.endian);
            entry.u32(layout.crc);
            entry.u32(layout.address);
            entry.u32(layout.hash);
            entry.u32(layout.namespace);
            // the newer VM carries a second namespace, which is always the export's own
            if !self.target.is_t7() { entry.u32(layout.namespace) }
            entry.u8(layout.params);
            entry.u8(layout.flags);
            entry.u16(0);
            debug_assert_eq!(entry.len(), entry_size);
            self.writer.patch(base + i as u32 * entry_size, &entry.into_inner());
        }
    }

    fn commit_imports(&mut self, base: u32) -> Result<(), CompileError> {
        let rows = self.tables.imports.row_count();
        error::check_capacity("import rows", rows, U16_LIMIT)?;
        self.header.import_offset = base;
        self.header.import_count = rows as u16;

        for entry in self.tables.imports.entries() {
            let key = entry.value;
            write_rows(&mut self.writer, entry, |w, count| {
                w.u32(key.function);
                w.u32(key.namespace);
                w.u16(count as u16);
                w.u8(key.params);
                w.u8(key.flags);
            });
        }
        Ok(())
    }

    fn commit_includes(&mut self, base: u32) -> Result<(), CompileError> {
        self.header.include_offset = base;
        match self.target.vm {
            VmRevision::T7 => {
                error::check_capacity("includes", self.includes.len(), u8::MAX as usize)?;
                self.header.include_count = self.includes.len() as u16;
                let mut address = base + self.includes.len() as u32 * 4;
                for include in self.includes {
                    self.writer.u32(address);
                    address += include.len() as u32 + 1;
                }
                for include in self.includes {
                    self.writer.cstr(include);
                }
            }
            VmRevision::Vm36 => {
                error::check_capacity("includes", self.includes.len(), U16_LIMIT)?;
                self.header.include_count = self.includes.len() as u16;
                for include in self.includes {
                    self.writer.u64(hash::t8_hash64(include));
                }
            }
        }
        Ok(())
    }

    fn commit_string_fixups(&mut self, base: u32) -> Result<(), CompileError> {
        let rows = self.tables.strings.row_count();
        error::check_capacity("string rows", rows, U16_LIMIT)?;
        self.header.string_offset = base;
        self.header.string_count = rows as u16;

        let little = self.target.is_little();
        for entry in self.tables.strings.entries() {
            let address = entry.address.unwrap_or_default();
            write_rows(&mut self.writer, entry, |w, count| {
                if little { w.u32(address) } else { w.u16(address as u16) }
                w.u8(count);
                w.u8(0);
                if little { w.u16(0) }
            });
        }
        Ok(())
    }

    fn commit_debug_strings(&mut self, base: u32) -> Result<(), CompileError> {
        let rows = self.tables.debug.row_count();
        error::check_capacity("debug string rows", rows, U16_LIMIT)?;
        self.header.debug_string_offset = base;
        self.header.debug_string_count = rows as u16;

        for entry in self.tables.debug.entries() {
            let value = entry.value;
            write_rows(&mut self.writer, entry, |w, count| {
                w.u32(value);
                w.u8(count);
                w.u16(0);
                w.u8(0);
            });
        }
        Ok(())
    }

    fn commit_globals(&mut self, base: u32) -> Result<(), CompileError> {
        let rows = self.tables.globals.row_count();
        error::check_capacity("globals", rows, U16_LIMIT)?;
        self.header.global_offset = base;
        self.header.global_count = rows as u16;

        for entry in self.tables.globals.entries() {
            let value = entry.value;
            write_rows(&mut self.writer, entry, |w, count| {
                w.u32(value);
                w.u32(count as u32);
            });
        }
        Ok(())
    }
}

/// Writes one row per [`MAX_ROW_REFS`](crate::table::MAX_ROW_REFS) references of `entry`.
/// `header` writes the row header given the number of references in the row.
fn write_rows<V>(writer: &mut ByteWriter, entry: &TableEntry<V>, mut header: impl FnMut(&mut ByteWriter, u8)) {
    for row in entry.rows() {
        header(writer, row.len() as u8);
        for &address in row {
            writer.u32(address);
        }
    }
}

#[test]
fn test_section_order() {
    assert_eq!(SectionKind::order(VmRevision::T7).first(), Some(&SectionKind::Header));
    assert_eq!(SectionKind::order(VmRevision::Vm36).first(), Some(&SectionKind::Header));
    for vm in [VmRevision::T7, VmRevision::Vm36] {
        let order = SectionKind::order(vm);
        let exports = order.iter().position(|x| *x == SectionKind::Exports).unwrap();
        for kind in [SectionKind::Imports, SectionKind::StringFixups, SectionKind::DebugStrings, SectionKind::Globals] {
            if let Some(pos) = order.iter().position(|x| *x == kind) {
                assert!(pos > exports, "{kind:?} must come after the exports on {vm:?}");
            }
        }
    }
}

#[test]
fn test_header_encoding() {
    let header = ScriptHeader {
        checksum: 0x11223344, name_offset: 0x50, include_offset: 0x120, include_count: 2,
        bytecode_offset: 0x88, bytecode_size: 0x40, string_offset: 0x140, string_count: 3,
        export_offset: 0x70, export_count: 1, import_offset: 0x100, import_count: 4, ..Default::default()
    };

    let pc = header.encode(Target::t7_pc());
    assert_eq!(pc.len(), 0x50);
    assert_eq!(&pc[..8], Target::t7_pc().magic().to_le_bytes());
    assert_eq!(crate::util::read_u32(&pc, 8, crate::vm::Endian::Little), 0x11223344);
    assert_eq!(crate::util::read_u32(&pc, 12, crate::vm::Endian::Little), 0x120);
    assert_eq!(crate::util::read_u32(&pc, 16, crate::vm::Endian::Little), 0x50);
    assert_eq!(crate::util::read_u32(&pc, 52, crate::vm::Endian::Little), 0x50);
    assert_eq!(crate::util::read_u16(&pc, 58, crate::vm::Endian::Little), 1);
    assert_eq!(pc[68], 2);
    assert_eq!(pc[70], 0);

    let console = header.encode(Target::t7_console());
    assert_eq!(console.len(), 0x50);
    assert_eq!(crate::util::read_u16(&console, 52, crate::vm::Endian::Big), 0x50);
    assert_eq!(crate::util::read_u16(&console, 54, crate::vm::Endian::Big), 3);
    assert_eq!(console[66], 2);

    let t8 = ScriptHeader { name_hash: 0x0102030405060708, global_count: 5, ..header }.encode(Target::t8());
    assert_eq!(t8.len(), 0x60);
    assert_eq!(&t8[..8], [0x80, 0x47, 0x53, 0x43, 0x0D, 0x0A, 0x00, 0x36]);
    assert_eq!(&t8[16..24], 0x0102030405060708u64.to_le_bytes());
    assert_eq!(crate::util::read_u32(&t8, 24, crate::vm::Endian::Little), 0x120);
    assert_eq!(crate::util::read_u16(&t8, 28, crate::vm::Endian::Little), 3);
    assert_eq!(crate::util::read_u16(&t8, 30, crate::vm::Endian::Little), 1);
    assert_eq!(crate::util::read_u16(&t8, 40, crate::vm::Endian::Little), 4);
    assert_eq!(crate::util::read_u16(&t8, 60, crate::vm::Endian::Little), 5);
    assert_eq!(crate::util::read_u16(&t8, 88, crate::vm::Endian::Little), 2);
}
