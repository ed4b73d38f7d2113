//! Instruction nodes and their binary encodings.
//!
//! Instructions are encoded directly into the image buffer, so the length of the buffer is always the absolute
//! address of the next byte. Every alignment in the encodings below is relative to that absolute address.

use compact_str::CompactString;

use crate::*;
use crate::opcode::ScriptOpCode;
use crate::table::{EntryId, ImportKey, ScriptTables, TableKind, TableRef};
use crate::util::{align, ByteWriter};
use crate::vm::Target;

new_key! {
    /// A handle to an [`Instruction`] in a function's instruction chain.
    pub struct InsnKey;
}

/// A numeric constant, as pushed by the `Get*` family of operations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f32),
}
impl Numeric {
    /// The smallest encoding that can represent this value.
    pub fn op(self, target: Target) -> ScriptOpCode {
        match self {
            Numeric::Float(_) => ScriptOpCode::GetFloat,
            Numeric::Int(0) => ScriptOpCode::GetZero,
            Numeric::Int(v) if v.unsigned_abs() <= 0xff => if v > 0 { ScriptOpCode::GetByte } else { ScriptOpCode::GetNegByte },
            Numeric::Int(v) if v.unsigned_abs() <= 0xffff => if v > 0 { ScriptOpCode::GetUnsignedShort } else { ScriptOpCode::GetNegUnsignedShort },
            Numeric::Int(v) if v > 0 && !target.is_t7() => ScriptOpCode::GetUnsignedInteger,
            Numeric::Int(_) => ScriptOpCode::GetInteger,
        }
    }
    /// Checks that an integer fits in the 32 bits available to it.
    pub fn check(self) -> Result<Self, CompileError> {
        match self {
            Numeric::Int(v) if v < i32::MIN as i64 || v > u32::MAX as i64 => Err(CompileError::BadNumber { text: CompactString::from(v.to_string()) }),
            x => Ok(x),
        }
    }
}

/// The operation performed by an [`Instruction`] along with any operands it needs.
#[derive(Clone, Debug, PartialEq)]
pub enum InsnKind {
    /// An operation with no operands.
    Op { op: ScriptOpCode },
    /// The head of every function, which declares its local variables (or clears the parameters if there are none).
    Locals,
    /// A (possibly conditional) jump that lands right after the `target` instruction.
    /// The target is resolved when the function is laid out.
    Jump { op: ScriptOpCode, target: Option<InsnKey> },
    /// An operation on a cached local variable, which is encoded as the local's index.
    Local { op: ScriptOpCode, hash: u32 },
    /// Pushes a numeric constant.
    Number { value: Numeric },
    /// Pushes a (localized) string from the string table.
    String { op: ScriptOpCode, entry: EntryId<CompactString> },
    /// Pushes a developer string, which is stripped from release builds and replaced through the debug table.
    DebugString { entry: EntryId<u32> },
    /// Pushes a raw hash value.
    Hash { value: u64 },
    /// Accesses a field of the object on top of the stack.
    Field { op: ScriptOpCode, hash: u32 },
    /// Calls an imported function.
    Call { op: ScriptOpCode, import: EntryId<ImportKey> },
    /// Calls the function pointer on top of the stack.
    CallPtr { op: ScriptOpCode, params: u8 },
    /// Pushes a pointer to an imported function.
    FuncPtr { op: ScriptOpCode, import: EntryId<ImportKey> },
    /// Pushes a global object (newer VM only).
    Global { op: ScriptOpCode, global: EntryId<u32> },
    /// One of the event operations of the newer VM, which carry their parameter count.
    Notification { op: ScriptOpCode, params: u8 },
}

/// A single node of a function's instruction chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub kind: InsnKind,
    /// Absolute address of the first byte of this instruction (valid after layout).
    pub address: u32,
    /// Encoded size in bytes (valid after layout).
    pub size: u32,
}
impl Instruction {
    pub fn new(kind: InsnKind) -> Self {
        Self { kind, address: 0, size: 0 }
    }
    /// The operation this instruction is encoded with on `target`, given the number of declared locals.
    pub fn op(&self, target: Target, locals: usize) -> ScriptOpCode {
        match &self.kind {
            InsnKind::Op { op } | InsnKind::Jump { op, .. } | InsnKind::Local { op, .. } | InsnKind::String { op, .. } |
            InsnKind::Field { op, .. } | InsnKind::Call { op, .. } | InsnKind::CallPtr { op, .. } |
            InsnKind::FuncPtr { op, .. } | InsnKind::Global { op, .. } | InsnKind::Notification { op, .. } => *op,
            InsnKind::Locals => if locals == 0 { ScriptOpCode::CheckClearParams } else { ScriptOpCode::SafeCreateLocalVariables },
            InsnKind::Number { value } => value.op(target),
            InsnKind::DebugString { .. } => ScriptOpCode::GetString,
            InsnKind::Hash { .. } => ScriptOpCode::GetHash,
        }
    }
}

/// Writes instructions of a single function into the image.
pub(crate) struct Emitter<'a> {
    pub target: Target,
    pub writer: &'a mut ByteWriter,
    pub tables: &'a mut ScriptTables,
    /// Hashes of the function's locals, in declaration order.
    pub locals: &'a [u32],
    pub function: &'a str,
}
impl Emitter<'_> {
    fn op(&mut self, op: ScriptOpCode) {
        match self.target.op_width() {
            2 => self.writer.u16(op.value()),
            _ => self.writer.u8(op.value() as u8),
        }
    }
    fn align(&mut self, alignment: u32) {
        let len = self.writer.len();
        self.writer.pad_to(align(len, alignment));
    }
    fn local_index(&self, hash: u32) -> Result<u8, CompileError> {
        match self.locals.iter().position(|&x| x == hash) {
            Some(pos) => Ok((self.locals.len() - pos - 1) as u8),
            None => Err(CompileError::UnknownVariable { name: format!("{hash:#010x}").into(), function: self.function.into() }),
        }
    }

    /// Appends `insn` at the current end of the image and records its address and size.
    /// The table reference made by the instruction (if any) is recorded into its entry and returned.
    pub fn encode(&mut self, insn: &mut Instruction) -> Result<Option<TableRef>, CompileError> {
        let opw = self.target.op_width();
        let little = self.target.is_little();
        let addr = self.writer.len();
        let op = insn.op(self.target, self.locals.len());

        self.op(op);
        let mut reference = None;
        match &insn.kind {
            InsnKind::Op { .. } => (),
            InsnKind::Locals => if !self.locals.is_empty() {
                error::check_capacity("locals", self.locals.len(), u8::MAX as usize)?;
                let locals = self.locals;
                self.writer.u8(locals.len() as u8);
                for &hash in locals {
                    self.align(4);
                    self.writer.u32(hash);
                    self.writer.u8(0);
                }
                self.align(opw);
            }
            InsnKind::Jump { .. } => {
                self.align(2);
                self.writer.u16(0xffff);
            }
            InsnKind::Local { hash, .. } => {
                let index = self.local_index(*hash)?;
                self.writer.u8(index);
                self.writer.pad_to(addr + 2 * opw);
            }
            InsnKind::Number { value } => match (*value, op) {
                (_, ScriptOpCode::GetZero) => (),
                (Numeric::Float(v), _) => {
                    self.align(4);
                    self.writer.f32(v);
                }
                (Numeric::Int(v), ScriptOpCode::GetByte | ScriptOpCode::GetNegByte) => match (self.target.is_t7(), little) {
                    (true, false) => self.writer.u8(v.unsigned_abs() as u8),
                    (true, true) => {
                        self.align(2);
                        self.writer.u16(v.unsigned_abs() as u16);
                    }
                    (false, _) => self.writer.u16(v.unsigned_abs() as u16),
                }
                (Numeric::Int(v), ScriptOpCode::GetUnsignedShort | ScriptOpCode::GetNegUnsignedShort) => {
                    if self.target.is_t7() { self.align(2) }
                    self.writer.u16(v.unsigned_abs() as u16);
                }
                (Numeric::Int(v), _) => {
                    self.align(4);
                    self.writer.u32(v as u32);
                }
            }
            InsnKind::String { entry, .. } => {
                self.align(if little { 4 } else { 2 });
                self.tables.strings.add_ref(*entry, self.writer.len());
                reference = Some(TableRef { table: TableKind::Strings, entry: entry.index(), address: self.writer.len() });
                self.writer.raw(if little { &[0xff; 4] } else { &[0xff; 2] });
            }
            InsnKind::DebugString { entry } => {
                self.align(if little { 4 } else { 2 });
                self.tables.debug.add_ref(*entry, self.writer.len());
                reference = Some(TableRef { table: TableKind::Debug, entry: entry.index(), address: self.writer.len() });
                self.writer.raw(if little { &[0xff; 4] } else { &[0xff; 2] });
            }
            InsnKind::Hash { value } => match self.target.is_t7() {
                true => {
                    self.align(4);
                    self.writer.u32(*value as u32);
                }
                false => {
                    self.align(8);
                    self.writer.u64(*value);
                }
            }
            InsnKind::Field { hash, .. } => {
                self.align(4);
                self.writer.u32(*hash);
            }
            InsnKind::Call { import, .. } => {
                let key = match self.tables.imports.get(*import) {
                    Some(entry) => entry.value,
                    None => return Err(CompileError::UnknownFunction),
                };
                self.tables.imports.add_ref(*import, addr);
                reference = Some(TableRef { table: TableKind::Imports, entry: import.index(), address: addr });
                self.writer.u8(key.params);
                if little { self.writer.u8(key.flags) }
                let data = align(addr + 2 * opw, 4 * opw);
                self.writer.pad_to(data);
                self.writer.u32(key.function);
                self.writer.pad_to(data + 4 * opw);
            }
            InsnKind::CallPtr { params, .. } | InsnKind::Notification { params, .. } => {
                self.writer.u8(*params);
                self.writer.pad_to(addr + if little { opw + 2 } else { opw + 1 });
            }
            InsnKind::FuncPtr { import, .. } => {
                let key = match self.tables.imports.get(*import) {
                    Some(entry) => entry.value,
                    None => return Err(CompileError::UnknownFunction),
                };
                self.tables.imports.add_ref(*import, addr);
                reference = Some(TableRef { table: TableKind::Imports, entry: import.index(), address: addr });
                let width = if little { 8 } else { 4 };
                self.align(width);
                let data = self.writer.len();
                self.writer.u32(key.function);
                self.writer.pad_to(data + width);
            }
            InsnKind::Global { global, .. } => {
                self.tables.globals.add_ref(*global, self.writer.len());
                reference = Some(TableRef { table: TableKind::Globals, entry: global.index(), address: self.writer.len() });
                self.writer.pad_to(addr + opw + 2);
            }
        }

        insn.address = addr;
        insn.size = self.writer.len() - addr;
        Ok(reference)
    }
}

/// Patches the displacement of an encoded jump so that it lands right after `target`.
pub(crate) fn patch_jump(writer: &mut ByteWriter, target: Target, jump: &Instruction, landing: &Instruction, function: &str) -> Result<(), CompileError> {
    let to = landing.address as i64 + landing.size as i64;
    let from = jump.address as i64 + jump.size as i64;
    let displacement = to - from;
    if displacement < i16::MIN as i64 || displacement > i16::MAX as i64 {
        return Err(CompileError::JumpOutOfRange { function: function.into(), displacement });
    }
    writer.patch_u16(align(jump.address + target.op_width(), 2), displacement as i16 as u16);
    Ok(())
}

#[cfg(test)]
fn encode_one(target: Target, start: u32, kind: InsnKind, locals: &[u32], tables: &mut ScriptTables) -> (Instruction, Vec<u8>) {
    let mut writer = ByteWriter::with_bytes(vec![0xcc; start as usize], target.endian);
    let mut insn = Instruction::new(kind);
    Emitter { target, writer: &mut writer, tables, locals, function: "test" }.encode(&mut insn).unwrap();
    assert_eq!(insn.address, start);
    (insn, writer.into_inner()[start as usize..].to_vec())
}

#[test]
fn test_numeric_ops() {
    let (t7, t8) = (Target::t7_pc(), Target::t8());
    for (value, expected_t7, expected_t8) in [
        (0, ScriptOpCode::GetZero, ScriptOpCode::GetZero),
        (1, ScriptOpCode::GetByte, ScriptOpCode::GetByte),
        (255, ScriptOpCode::GetByte, ScriptOpCode::GetByte),
        (-255, ScriptOpCode::GetNegByte, ScriptOpCode::GetNegByte),
        (256, ScriptOpCode::GetUnsignedShort, ScriptOpCode::GetUnsignedShort),
        (-65535, ScriptOpCode::GetNegUnsignedShort, ScriptOpCode::GetNegUnsignedShort),
        (65536, ScriptOpCode::GetInteger, ScriptOpCode::GetUnsignedInteger),
        (-65536, ScriptOpCode::GetInteger, ScriptOpCode::GetInteger),
    ] {
        assert_eq!(Numeric::Int(value).op(t7), expected_t7, "{value}");
        assert_eq!(Numeric::Int(value).op(t8), expected_t8, "{value}");
    }
    assert_eq!(Numeric::Float(0.0).op(t7), ScriptOpCode::GetFloat);
    assert!(Numeric::Int(u32::MAX as i64).check().is_ok());
    assert!(Numeric::Int(i32::MIN as i64).check().is_ok());
    assert!(Numeric::Int(u32::MAX as i64 + 1).check().is_err());
    assert!(Numeric::Int(i32::MIN as i64 - 1).check().is_err());
}

#[test]
fn test_encode_sizes() {
    let mut tables = ScriptTables::default();
    let (pc, console, t8) = (Target::t7_pc(), Target::t7_console(), Target::t8());

    let (insn, bytes) = encode_one(pc, 0x41, InsnKind::Op { op: ScriptOpCode::End }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (2, vec![0, 0]));
    let (insn, bytes) = encode_one(console, 0x41, InsnKind::Op { op: ScriptOpCode::Return }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (1, vec![1]));

    let (insn, bytes) = encode_one(pc, 0x41, InsnKind::Jump { op: ScriptOpCode::Jump, target: None }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (5, vec![0x3f, 0, 0, 0xff, 0xff]));
    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Jump { op: ScriptOpCode::Jump, target: None }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x3f, 0, 0xff, 0xff]));
    let (insn, bytes) = encode_one(console, 0x40, InsnKind::Jump { op: ScriptOpCode::Jump, target: None }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x3f, 0, 0xff, 0xff]));

    let locals = [0x11111111, 0x22222222];
    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Local { op: ScriptOpCode::EvalLocalVariableCached, hash: 0x11111111 }, &locals, &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x19, 0, 1, 0]));
    let (insn, bytes) = encode_one(console, 0x40, InsnKind::Local { op: ScriptOpCode::EvalLocalVariableCached, hash: 0x22222222 }, &locals, &mut tables);
    assert_eq!((insn.size, bytes), (2, vec![0x19, 0]));

    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Locals, &[], &mut tables);
    assert_eq!((insn.size, bytes), (2, vec![0x26, 0]));
    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Locals, &locals, &mut tables);
    assert_eq!(insn.size, 18);
    assert_eq!(bytes, [0x17, 0, 2, 0, 0x11, 0x11, 0x11, 0x11, 0, 0, 0, 0, 0x22, 0x22, 0x22, 0x22, 0, 0]);
    let (insn, _) = encode_one(console, 0x40, InsnKind::Locals, &locals, &mut tables);
    assert_eq!(insn.size, 17);

    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Number { value: Numeric::Int(-7) }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x05, 0, 7, 0]));
    let (insn, bytes) = encode_one(console, 0x40, InsnKind::Number { value: Numeric::Int(7) }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (2, vec![0x04, 7]));
    let (insn, bytes) = encode_one(t8, 0x41, InsnKind::Number { value: Numeric::Int(0x1234) }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x06, 0, 0x34, 0x12]));
    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::Number { value: Numeric::Int(0x12345678) }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (8, vec![0x08, 0, 0, 0, 0x78, 0x56, 0x34, 0x12]));
    let (insn, _) = encode_one(pc, 0x40, InsnKind::Number { value: Numeric::Float(1.5) }, &[], &mut tables);
    assert_eq!(insn.size, 8);

    let entry = tables.strings.add("hello".into());
    let (insn, bytes) = encode_one(pc, 0x40, InsnKind::String { op: ScriptOpCode::GetString, entry }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (8, vec![0x0a, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]));
    let (insn, _) = encode_one(console, 0x41, InsnKind::String { op: ScriptOpCode::GetString, entry }, &[], &mut tables);
    assert_eq!(insn.size, 3);
    assert_eq!(tables.strings.get(entry).unwrap().refs, [0x44, 0x42]);

    let (insn, _) = encode_one(pc, 0x40, InsnKind::Hash { value: 0xdead }, &[], &mut tables);
    assert_eq!(insn.size, 8);
    let (insn, _) = encode_one(t8, 0x40, InsnKind::Hash { value: 0xdead }, &[], &mut tables);
    assert_eq!(insn.size, 16);
}

#[test]
fn test_encode_calls() {
    use crate::opcode::import_flags;

    let mut tables = ScriptTables::default();
    let import = tables.imports.add(ImportKey { function: 0xaabbccdd, namespace: 0x11223344, params: 3, flags: import_flags::IS_FUNCTION });

    let (insn, bytes) = encode_one(Target::t7_pc(), 0x40, InsnKind::Call { op: ScriptOpCode::ScriptFunctionCall, import }, &[], &mut tables);
    assert_eq!(insn.size, 16);
    assert_eq!(bytes, [0x2e, 0, 3, 2, 0, 0, 0, 0, 0xdd, 0xcc, 0xbb, 0xaa, 0, 0, 0, 0]);
    let (insn, _) = encode_one(Target::t7_pc(), 0x42, InsnKind::Call { op: ScriptOpCode::ScriptFunctionCall, import }, &[], &mut tables);
    assert_eq!(insn.size, 14);

    let (insn, bytes) = encode_one(Target::t7_console(), 0x41, InsnKind::Call { op: ScriptOpCode::ScriptFunctionCall, import }, &[], &mut tables);
    assert_eq!(insn.size, 7);
    assert_eq!(bytes, [0x2e, 3, 0, 0xaa, 0xbb, 0xcc, 0xdd]);
    assert_eq!(tables.imports.get(import).unwrap().refs, [0x40, 0x42, 0x41]);

    let (insn, bytes) = encode_one(Target::t7_pc(), 0x40, InsnKind::CallPtr { op: ScriptOpCode::ScriptFunctionCallPointer, params: 2 }, &[], &mut tables);
    assert_eq!((insn.size, bytes), (4, vec![0x2f, 0, 2, 0]));
    let (insn, _) = encode_one(Target::t7_console(), 0x40, InsnKind::CallPtr { op: ScriptOpCode::ScriptFunctionCallPointer, params: 2 }, &[], &mut tables);
    assert_eq!(insn.size, 2);

    let (insn, bytes) = encode_one(Target::t7_pc(), 0x42, InsnKind::FuncPtr { op: ScriptOpCode::GetFunction, import }, &[], &mut tables);
    assert_eq!(insn.size, 14);
    assert_eq!(&bytes[..6], [0x15, 0, 0, 0, 0, 0]);
    assert_eq!(&bytes[6..], [0xdd, 0xcc, 0xbb, 0xaa, 0, 0, 0, 0]);
    let (insn, _) = encode_one(Target::t7_console(), 0x40, InsnKind::FuncPtr { op: ScriptOpCode::GetFunction, import }, &[], &mut tables);
    assert_eq!(insn.size, 8);

    let global = tables.globals.add(0x1234);
    let (insn, bytes) = encode_one(Target::t8(), 0x40, InsnKind::Global { op: ScriptOpCode::GetGlobalObject, global }, &[], &mut tables);
    assert_eq!(insn.size, 4);
    assert_eq!(&bytes[2..], [0, 0]);
    assert_eq!(tables.globals.get(global).unwrap().refs, [0x42]);
}

#[test]
fn test_patch_jump() {
    let target = Target::t7_pc();
    let mut writer = ByteWriter::with_bytes(vec![0; 0x10], target.endian);
    let mut tables = ScriptTables::default();
    let mut emitter = Emitter { target, writer: &mut writer, tables: &mut tables, locals: &[], function: "test" };

    let mut back = Instruction::new(InsnKind::Op { op: ScriptOpCode::GetZero });
    let mut jump = Instruction::new(InsnKind::Jump { op: ScriptOpCode::JumpOnFalse, target: None });
    let mut body = Instruction::new(InsnKind::Op { op: ScriptOpCode::Return });
    emitter.encode(&mut back).unwrap();
    emitter.encode(&mut jump).unwrap();
    emitter.encode(&mut body).unwrap();
    assert_eq!((back.address, jump.address, body.address), (0x10, 0x12, 0x16));

    patch_jump(&mut writer, target, &jump, &body, "test").unwrap();
    assert_eq!(crate::util::read_u16(&writer.bytes, 0x14, target.endian), 2);
    patch_jump(&mut writer, target, &jump, &back, "test").unwrap();
    assert_eq!(crate::util::read_u16(&writer.bytes, 0x14, target.endian) as i16, -4);

    let far = Instruction { kind: InsnKind::Op { op: ScriptOpCode::End }, address: 0x10000, size: 2 };
    match patch_jump(&mut writer, target, &jump, &far, "test") {
        Err(CompileError::JumpOutOfRange { displacement, .. }) => assert_eq!(displacement, 0x10002 - 0x16),
        x => panic!("{x:?}"),
    }
}
