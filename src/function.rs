//! Script functions (exports) and the instruction emission API.

use compact_str::CompactString;

use crate::*;
use crate::arena::Chain;
use crate::instruction::{patch_jump, Emitter, InsnKey, InsnKind, Instruction, Numeric};
use crate::opcode::{Context, ScriptOpCode};
use crate::table::{ImportKey, ScriptTables, TableRef};
use crate::util::{align, ByteWriter};
use crate::vm::Target;

new_key! {
    /// A handle to a [`Function`] of a script.
    pub struct FunctionKey;
}

/// Gap between the 16 byte aligned end of the previous function and the start of the next one.
pub const FUNCTION_GAP: u32 = 8;

/// The kind of a pending loop control flow jump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopJump {
    Break,
    Continue,
}

/// The synthetic locals reserved for a single `foreach` loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForeachLocals {
    pub array: u32,
    pub iterator: u32,
    pub key: u32,
    pub next_key: u32,
}

/// A jump as it was patched during layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JumpRecord {
    pub op: ScriptOpCode,
    pub address: u32,
    /// Address of the first byte after the jump, from which the displacement is measured.
    pub from: u32,
    /// Address the jump lands on.
    pub to: u32,
}

/// An instruction as it was placed during layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstructionRecord {
    pub op: ScriptOpCode,
    pub address: u32,
    pub size: u32,
}

/// Where and how a function ended up in the image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionLayout {
    pub name: CompactString,
    pub hash: u32,
    pub namespace: u32,
    pub params: u8,
    pub flags: u8,
    /// Absolute address of the first instruction.
    pub address: u32,
    pub size: u32,
    /// CRC-32 of the bytes in `address..address + size`.
    pub crc: u32,
    pub instructions: Vec<InstructionRecord>,
    pub jumps: Vec<JumpRecord>,
    pub refs: Vec<TableRef>,
}

/// A single function of a script, which owns its instruction chain.
///
/// The chain always starts with a locals node that declares every local of the function.
/// Locals can be declared at any point before layout, since their indices are only resolved when encoding.
#[derive(Clone)]
pub struct Function {
    pub name: CompactString,
    pub hash: u32,
    pub namespace: u32,
    pub params: u8,
    pub flags: u8,

    target: Target,
    chain: Chain<InsnKey, Instruction>,
    locals_head: InsnKey,
    locals: Vec<u32>,
    /// Pending break/continue jumps per loop depth (the innermost loop is last).
    lcf: Vec<Vec<(LoopJump, InsnKey)>>,
    switch_keys: Vec<u32>,
    foreach_keys: Vec<ForeachLocals>,
}
impl Function {
    pub fn new(target: Target, name: CompactString, hash: u32, namespace: u32, params: u8, flags: u8) -> Self {
        let mut chain = Chain::new();
        let locals_head = chain.push_back(Instruction::new(InsnKind::Locals));
        Self {
            name, hash, namespace, params, flags, target,
            chain, locals_head, locals: vec![],
            lcf: vec![], switch_keys: vec![], foreach_keys: vec![],
        }
    }
    pub fn target(&self) -> Target {
        self.target
    }

    /// Declares a local variable. Declaring the same local twice has no effect.
    pub fn add_local(&mut self, hash: u32) {
        if !self.locals.contains(&hash) {
            self.locals.push(hash);
        }
    }
    pub fn has_local(&self, hash: u32) -> bool {
        self.locals.contains(&hash)
    }
    /// The declared locals, in declaration order.
    pub fn locals(&self) -> &[u32] {
        &self.locals
    }

    pub fn push_switch_key(&mut self, hash: u32) {
        self.switch_keys.push(hash);
    }
    pub fn pop_switch_key(&mut self) -> Result<u32, CompileError> {
        self.switch_keys.pop().ok_or(CompileError::UnbalancedSyntheticLocals { what: "switch" })
    }
    pub fn push_foreach_locals(&mut self, locals: ForeachLocals) {
        self.foreach_keys.push(locals);
    }
    pub fn pop_foreach_locals(&mut self) -> Result<ForeachLocals, CompileError> {
        self.foreach_keys.pop().ok_or(CompileError::UnbalancedSyntheticLocals { what: "foreach" })
    }

    /// Appends an instruction to the end of the chain.
    pub fn add(&mut self, kind: InsnKind) -> InsnKey {
        self.chain.push_back(Instruction::new(kind))
    }
    pub fn add_op(&mut self, op: ScriptOpCode) -> InsnKey {
        self.add(InsnKind::Op { op })
    }
    /// Appends a jump with no target yet (see [`Function::set_jump_target`]).
    pub fn add_jump(&mut self, op: ScriptOpCode) -> InsnKey {
        debug_assert!(op.is_jump());
        self.add(InsnKind::Jump { op, target: None })
    }
    /// Makes `jump` land right after the instruction `after`.
    pub fn set_jump_target(&mut self, jump: InsnKey, after: InsnKey) {
        if let Some(Instruction { kind: InsnKind::Jump { target, .. }, .. }) = self.chain.get_mut(jump) {
            *target = Some(after);
        }
    }
    /// The key of the last instruction in the chain.
    /// A jump targeting this lands on whatever is emitted next.
    pub fn end_of_chain(&self) -> InsnKey {
        self.chain.last().unwrap_or(self.locals_head)
    }
    pub fn add_number(&mut self, value: Numeric) -> Result<InsnKey, CompileError> {
        Ok(self.add(InsnKind::Number { value: value.check()? }))
    }
    /// Pushes the value (or a reference to) a declared local.
    pub fn add_eval_local(&mut self, hash: u32, context: Context) -> InsnKey {
        let op = if self.target.is_t7() && context.has(Context::WAITTILL) {
            ScriptOpCode::SetWaittillVariableFieldCached
        } else if context.has(Context::IS_REF) {
            ScriptOpCode::EvalLocalVariableRefCached
        } else {
            ScriptOpCode::EvalLocalVariableCached
        };
        self.add(InsnKind::Local { op, hash })
    }
    /// Pops the top of the stack into a declared local (newer VM only).
    pub fn add_assign_local(&mut self, hash: u32) -> InsnKey {
        self.add(InsnKind::Local { op: ScriptOpCode::SetLocalVariableCached, hash })
    }
    /// Pushes whether a declared local is defined (newer VM only).
    pub fn add_eval_local_defined(&mut self, hash: u32) -> InsnKey {
        self.add(InsnKind::Local { op: ScriptOpCode::EvalLocalVariableDefined, hash })
    }
    pub fn add_string(&mut self, tables: &mut ScriptTables, op: ScriptOpCode, text: CompactString) -> InsnKey {
        let entry = tables.strings.add(text);
        self.add(InsnKind::String { op, entry })
    }
    pub fn add_debug_string(&mut self, tables: &mut ScriptTables, hash: u32) -> InsnKey {
        let entry = tables.debug.add(hash);
        self.add(InsnKind::DebugString { entry })
    }
    pub fn add_hash(&mut self, value: u64) -> InsnKey {
        self.add(InsnKind::Hash { value })
    }
    pub fn add_field(&mut self, op: ScriptOpCode, hash: u32) -> InsnKey {
        self.add(InsnKind::Field { op, hash })
    }
    pub fn add_call(&mut self, tables: &mut ScriptTables, op: ScriptOpCode, key: ImportKey) -> InsnKey {
        let import = tables.imports.add(key);
        self.add(InsnKind::Call { op, import })
    }
    pub fn add_call_ptr(&mut self, op: ScriptOpCode, params: u8) -> InsnKey {
        self.add(InsnKind::CallPtr { op, params })
    }
    pub fn add_func_ptr(&mut self, tables: &mut ScriptTables, op: ScriptOpCode, key: ImportKey) -> InsnKey {
        let import = tables.imports.add(key);
        self.add(InsnKind::FuncPtr { op, import })
    }
    pub fn add_global(&mut self, tables: &mut ScriptTables, op: ScriptOpCode, hash: u32) -> InsnKey {
        let global = tables.globals.add(hash);
        self.add(InsnKind::Global { op, global })
    }
    pub fn add_notification(&mut self, op: ScriptOpCode, params: u8) -> InsnKey {
        self.add(InsnKind::Notification { op, params })
    }

    /// Inserts an instruction directly after `after`, which keeps every existing key (and jump target) valid.
    pub fn insert_instruction(&mut self, after: InsnKey, kind: InsnKind) -> Option<InsnKey> {
        self.chain.insert_after(after, Instruction::new(kind))
    }
    /// Unlinks an instruction from the chain.
    /// The locals head can never be removed, in which case [`None`] is returned.
    pub fn remove_instruction(&mut self, key: InsnKey) -> Option<Instruction> {
        if key == self.locals_head { return None }
        self.chain.remove(key)
    }
    pub fn instruction(&self, key: InsnKey) -> Option<&Instruction> {
        self.chain.get(key)
    }
    /// Iterates over the instructions in chain order, starting with the locals head.
    pub fn instructions(&self) -> impl Iterator<Item = (InsnKey, &Instruction)> + '_ {
        self.chain.iter()
    }
    pub fn instruction_count(&self) -> usize {
        self.chain.len()
    }

    /// Opens a new loop (or switch) scope for `break` and `continue`.
    pub fn enter_loop(&mut self) {
        self.lcf.push(vec![]);
    }
    /// Emits a `break` or `continue` jump that leaves `levels` enclosing loops (`0` and `1` both mean the innermost).
    pub fn push_lcf(&mut self, kind: LoopJump, levels: usize) -> Result<InsnKey, CompileError> {
        let offset = levels.max(1) - 1;
        if offset >= self.lcf.len() {
            return Err(CompileError::MalformedNode { kind: "jumpStatement".into(), reason: "break or continue outside of a loop" });
        }
        let depth = self.lcf.len() - 1 - offset;
        let jump = self.add_jump(ScriptOpCode::Jump);
        self.lcf[depth].push((kind, jump));
        Ok(jump)
    }
    /// Closes the innermost loop scope, resolving its pending jumps.
    /// `continue` lands after `header` and `break` lands after `footer`.
    /// Scopes without a header (like `switch`) forward their `continue` jumps to the enclosing loop.
    pub fn exit_loop(&mut self, header: Option<InsnKey>, footer: InsnKey) -> Result<(), CompileError> {
        let pending = self.lcf.pop().unwrap_or_default();
        for (kind, jump) in pending {
            match (kind, header) {
                (LoopJump::Break, _) => self.set_jump_target(jump, footer),
                (LoopJump::Continue, Some(header)) => self.set_jump_target(jump, header),
                (LoopJump::Continue, None) => match self.lcf.last_mut() {
                    Some(outer) => outer.push((kind, jump)),
                    None => return Err(CompileError::MalformedNode { kind: "jumpStatement".into(), reason: "continue outside of a loop" }),
                }
            }
        }
        Ok(())
    }

    /// Lays out the function at the end of `writer` and patches all of its jumps.
    pub(crate) fn commit(&mut self, writer: &mut ByteWriter, tables: &mut ScriptTables) -> Result<FunctionLayout, CompileError> {
        let start = align(writer.len(), 0x10) + FUNCTION_GAP;
        writer.pad_to(start);

        let mut refs = vec![];
        let keys: Vec<InsnKey> = self.chain.keys().collect();
        {
            let mut emitter = Emitter { target: self.target, writer: &mut *writer, tables, locals: &self.locals, function: &self.name };
            for &key in keys.iter() {
                if let Some(insn) = self.chain.get_mut(key) {
                    refs.extend(emitter.encode(insn)?);
                }
            }
        }

        let mut jumps = vec![];
        for &key in keys.iter() {
            let Some(jump) = self.chain.get(key) else { continue };
            let InsnKind::Jump { op, target } = jump.kind else { continue };
            let landing = match target.and_then(|x| self.chain.get(x)) {
                Some(x) => x,
                None => return Err(CompileError::UnresolvedJump { function: self.name.clone() }),
            };
            patch_jump(writer, self.target, jump, landing, &self.name)?;
            jumps.push(JumpRecord { op, address: jump.address, from: jump.address + jump.size, to: landing.address + landing.size });
        }

        let end = writer.len();
        let instructions = self.chain.iter().map(|(_, x)| InstructionRecord { op: x.op(self.target, self.locals.len()), address: x.address, size: x.size }).collect();
        Ok(FunctionLayout {
            name: self.name.clone(), hash: self.hash, namespace: self.namespace, params: self.params, flags: self.flags,
            address: start, size: end - start, crc: hash::crc32(&writer.bytes[start as usize..end as usize]),
            instructions, jumps, refs,
        })
    }
}

#[cfg(test)]
fn test_function(target: Target) -> Function {
    Function::new(target, "test".into(), 0x1234, 0x5678, 0, 0)
}

#[test]
fn test_emission_chain() {
    let mut f = test_function(Target::t7_pc());
    let head = f.end_of_chain();
    let a = f.add_op(ScriptOpCode::GetZero);
    let b = f.add_op(ScriptOpCode::End);
    assert_eq!(f.instruction_count(), 3);
    assert_eq!(f.end_of_chain(), b);
    assert!(f.remove_instruction(head).is_none());
    assert_eq!(f.remove_instruction(a).map(|x| x.kind), Some(InsnKind::Op { op: ScriptOpCode::GetZero }));
    assert!(f.remove_instruction(a).is_none());
    assert_eq!(f.instructions().map(|(k, _)| k).collect::<Vec<_>>(), [head, b]);
    assert!(f.insert_instruction(a, InsnKind::Op { op: ScriptOpCode::Nop }).is_none());
    let c = f.insert_instruction(head, InsnKind::Op { op: ScriptOpCode::GetUndefined }).unwrap();
    assert_eq!(f.instructions().map(|(k, _)| k).collect::<Vec<_>>(), [head, c, b]);
    assert_eq!(f.end_of_chain(), b);
    assert!(f.add_number(Numeric::Int(1 << 40)).is_err());

    f.add_local(7);
    f.add_local(9);
    f.add_local(7);
    assert_eq!(f.locals(), [7, 9]);
    assert!(f.has_local(9) && !f.has_local(8));
}

#[test]
fn test_eval_local_ops() {
    let mut t7 = test_function(Target::t7_pc());
    let mut t8 = test_function(Target::t8());
    for (f, expected) in [(&mut t7, ScriptOpCode::SetWaittillVariableFieldCached), (&mut t8, ScriptOpCode::EvalLocalVariableCached)] {
        let key = f.add_eval_local(1, Context::WAITTILL);
        assert_eq!(f.instruction(key).unwrap().kind, InsnKind::Local { op: expected, hash: 1 });
        let key = f.add_eval_local(1, Context::IS_REF);
        assert_eq!(f.instruction(key).unwrap().kind, InsnKind::Local { op: ScriptOpCode::EvalLocalVariableRefCached, hash: 1 });
        let key = f.add_eval_local(1, Context::NONE);
        assert_eq!(f.instruction(key).unwrap().kind, InsnKind::Local { op: ScriptOpCode::EvalLocalVariableCached, hash: 1 });
    }
}

#[test]
fn test_loop_control_flow() {
    let mut f = test_function(Target::t7_pc());
    assert!(f.push_lcf(LoopJump::Break, 1).is_err());

    f.enter_loop();
    let outer_header = f.add_op(ScriptOpCode::GetZero);
    f.enter_loop();
    let inner_header = f.add_op(ScriptOpCode::GetZero);
    let b1 = f.push_lcf(LoopJump::Break, 0).unwrap();
    let b2 = f.push_lcf(LoopJump::Break, 2).unwrap();
    let c1 = f.push_lcf(LoopJump::Continue, 1).unwrap();
    assert!(f.push_lcf(LoopJump::Break, 3).is_err());
    let inner_footer = f.add_jump(ScriptOpCode::Jump);
    f.exit_loop(Some(inner_header), inner_footer).unwrap();

    f.enter_loop();
    let c2 = f.push_lcf(LoopJump::Continue, 1).unwrap();
    let switch_footer = f.add_op(ScriptOpCode::Nop);
    f.exit_loop(None, switch_footer).unwrap();

    let outer_footer = f.add_jump(ScriptOpCode::Jump);
    f.exit_loop(Some(outer_header), outer_footer).unwrap();

    let target = |key| match f.instruction(key).unwrap().kind { InsnKind::Jump { target, .. } => target, _ => unreachable!() };
    assert_eq!(target(b1), Some(inner_footer));
    assert_eq!(target(b2), Some(outer_footer));
    assert_eq!(target(c1), Some(inner_header));
    assert_eq!(target(c2), Some(outer_header));

    let mut g = test_function(Target::t7_pc());
    g.enter_loop();
    g.push_lcf(LoopJump::Continue, 1).unwrap();
    let footer = g.add_op(ScriptOpCode::Nop);
    assert!(g.exit_loop(None, footer).is_err());
}

#[test]
fn test_commit_layout() {
    let target = Target::t7_pc();
    let mut tables = ScriptTables::default();
    let mut f = test_function(target);
    let hash = hash::hash32("x");
    f.add_local(hash);

    f.add_eval_local(hash, Context::NONE);
    let jump = f.add_jump(ScriptOpCode::JumpOnFalse);
    f.add_string(&mut tables, ScriptOpCode::GetString, "hi".into());
    f.add_op(ScriptOpCode::Return);
    let end = f.end_of_chain();
    f.set_jump_target(jump, end);
    f.add_op(ScriptOpCode::End);

    let mut writer = ByteWriter::with_bytes(vec![0; 0x51], target.endian);
    let layout = f.commit(&mut writer, &mut tables).unwrap();
    assert_eq!(layout.address, 0x68);
    assert_eq!(layout.address + layout.size, writer.len());
    assert_eq!(layout.crc, hash::crc32(&writer.bytes[0x68..]));
    assert_eq!(layout.instructions.len(), 6);
    assert_eq!(layout.instructions[0].op, ScriptOpCode::SafeCreateLocalVariables);

    let landing = layout.instructions[4];
    assert_eq!(layout.jumps, [JumpRecord { op: ScriptOpCode::JumpOnFalse, address: layout.instructions[2].address, from: layout.instructions[3].address, to: landing.address + landing.size }]);
    let encoded = crate::util::read_u16(&writer.bytes, (layout.jumps[0].address + 2) as usize, target.endian) as i16;
    assert_eq!(encoded as i64, layout.jumps[0].to as i64 - layout.jumps[0].from as i64);

    assert_eq!(layout.refs.len(), 1);
    assert_eq!(tables.strings.entries().next().unwrap().refs, [layout.refs[0].address]);

    let mut g = test_function(target);
    let dangling = g.add_jump(ScriptOpCode::Jump);
    let mut writer = ByteWriter::new(target.endian);
    assert!(matches!(g.commit(&mut writer, &mut tables), Err(CompileError::UnresolvedJump { .. })));
    let removed = g.add_op(ScriptOpCode::Nop);
    g.set_jump_target(dangling, removed);
    g.remove_instruction(removed);
    let mut writer = ByteWriter::new(target.endian);
    assert!(matches!(g.commit(&mut writer, &mut tables), Err(CompileError::UnresolvedJump { .. })));
}
