//! Lowers syntax trees into script functions.
//!
//! Lowering never recurses on the shape of the tree. Each node is turned into a list of tasks on an explicit stack,
//! and constructs that need to emit code between (or after) their children leave a continuation ([`Cont`]) behind
//! that picks up where they left off once the children are done.

use std::collections::{BTreeMap, BTreeSet};

use compact_str::{format_compact, CompactString};
use tracing::{debug, trace};

use crate::*;
use crate::ast::{Literal, Node};
use crate::function::{ForeachLocals, Function, LoopJump};
use crate::instruction::{InsnKey, InsnKind, Numeric};
use crate::opcode::{self, export_flags, import_flags, BuiltinObject, Context, ScriptOpCode};
use crate::script::{CompiledScript, ScriptObject};
use crate::table::ImportKey;
use crate::vm::VmRevision;

/// Most parameters a function or call can have.
pub const MAX_PARAMS: usize = u8::MAX as usize;

const DEFINED_TEMP: &str = "$defined";
const COALESCE_TEMP: &str = "$coalesce";

type Macros<'a> = BTreeMap<CompactString, &'a Node>;

/// Lowers and lays out a whole script tree in one go.
pub fn compile_tree(settings: CompileSettings, root: &Node) -> Result<CompiledScript, CompileError> {
    build_script(settings, root)?.compile()
}

/// Lowers a script tree into a [`ScriptObject`] without laying it out, so it can still be edited.
pub fn build_script(settings: CompileSettings, root: &Node) -> Result<ScriptObject, CompileError> {
    if !root.is("script") { return Err(root.malformed("expected a script node")) }
    let mut script = ScriptObject::new(settings);

    if let Some(namespace) = root.find_child("namespace") {
        script.set_namespace(namespace.text()?)?;
    }

    let mut macros = Macros::new();
    let mut functions = vec![];
    let mut names = BTreeSet::new();
    for item in root.children.iter() {
        match item.kind.as_str() {
            "namespace" => (),
            "includes" => { script.add_include(item.text()?); }
            "globals" => { macros.insert(lowercase(item.text()?), item.child(0)?); }
            "function" => {
                let name = lowercase(item.text()?);
                if !names.insert(name.clone()) { return Err(CompileError::DuplicateFunction { name }) }
                functions.push(item);
            }
            _ => return Err(CompileError::UnsupportedNode { kind: item.kind.clone() }),
        }
    }

    for node in functions {
        let function = lower_function(&mut script, &macros, node)?;
        script.add_function(function)?;
    }

    debug!(functions = script.functions().count(), includes = script.includes().len(), macros = macros.len(), "lowered script");
    Ok(script)
}

fn lowercase(name: &str) -> CompactString {
    name.to_ascii_lowercase().into()
}

fn lower_function<'a>(script: &mut ScriptObject, macros: &Macros<'a>, node: &'a Node) -> Result<Function, CompileError> {
    let name = lowercase(node.text()?);
    let params: &'a [Node] = node.find_child("parameters").map(|x| x.children.as_slice()).unwrap_or(&[]);
    let block = node.find_child("block").ok_or_else(|| node.malformed("missing function body"))?;
    error::check_capacity("parameters", params.len(), MAX_PARAMS)?;

    let mut flags = 0;
    if node.find_child("autoexec").is_some() { flags |= export_flags::AUTOEXEC }
    if node.find_child("private").is_some() { flags |= export_flags::PRIVATE }

    let hash = script.hash(&name)?;
    let function = Function::new(script.target(), name.clone(), hash, script.namespace(), params.len() as u8, flags);
    let mut lowering = Lowering { script, macros, function, tasks: vec![], expanding: vec![], synthetic: 0 };

    let mut defaults = vec![];
    for param in params {
        let hash = lowering.declare(param.text()?)?;
        if let Some(default) = param.children.first() {
            defaults.push(Task::Resume(Cont::OptionalParam { hash, default }));
        }
    }
    lowering.collect_locals(block)?;

    lowering.then(defaults.into_iter().chain([Task::Node(block, Context::NONE), Task::Resume(Cont::Op(ScriptOpCode::End))]));
    lowering.run()?;

    let Lowering { function, .. } = lowering;
    trace!(%name, instructions = function.instruction_count(), locals = function.locals().len(), "lowered function");
    Ok(function)
}

/// A unit of pending work on the lowering stack.
enum Task<'a> {
    /// Lowers a node in the given context.
    Node(&'a Node, Context),
    /// Continues a construct whose children were lowered.
    Resume(Cont<'a>),
}

/// The continuation of a partially lowered construct.
enum Cont<'a> {
    Op(ScriptOpCode),
    Number(i64),
    StoreLocal(u32),
    Field(ScriptOpCode, u32),
    /// Pushes an object, as the base of a field access or the target of a method.
    Object(&'a Node, Context),
    Call(ScriptOpCode, ImportKey),
    CallPtr(ScriptOpCode, u8),
    Notification(ScriptOpCode, u8),
    /// Makes a forward jump land on whatever is emitted next.
    Land(InsnKey),
    MacroEnd,

    Branch { then: &'a Node, otherwise: Option<&'a Node> },
    Else { jump: InsnKey, otherwise: &'a Node },
    ShortCircuit { op: ScriptOpCode, rhs: &'a Node },
    DefinedAccess { temp: u32, field: u32, ctx: Context },
    Coalesce { temp: u32, rhs: &'a Node },
    OptionalParam { hash: u32, default: &'a Node },

    WhileBody { header: InsnKey, body: &'a Node },
    ForHeader { cond: &'a Node, iter: &'a Node, body: &'a Node },
    ForBody { header: InsnKey, test: bool, iter: &'a Node, body: &'a Node },
    ForIterate { header: InsnKey, exit: Option<InsnKey>, iter: &'a Node },
    ForeachStart { locals: ForeachLocals, key: u32, value: u32, body: &'a Node },
    ForeachNext { locals: ForeachLocals, key: u32, header: InsnKey, exit: InsnKey },
    /// Jumps back to the loop header and closes the loop scope.
    CloseLoop { header: InsnKey, exit: Option<InsnKey>, continue_at: InsnKey },

    SwitchStore { key: u32, cases: Vec<&'a Node> },
    SwitchCase { key: u32, cases: Vec<&'a Node>, index: usize, pending: Vec<InsnKey> },
    SwitchTest { key: u32, cases: Vec<&'a Node>, index: usize, pending: Vec<InsnKey> },
    SwitchEnd,
}

struct Lowering<'a, 's> {
    script: &'s mut ScriptObject,
    macros: &'s Macros<'a>,
    function: Function,
    tasks: Vec<Task<'a>>,
    /// Macros currently being expanded, innermost last.
    expanding: Vec<CompactString>,
    synthetic: usize,
}
impl<'a> Lowering<'a, '_> {
    fn vm(&self) -> VmRevision {
        self.script.target().vm
    }
    fn is_t7(&self) -> bool {
        self.script.target().is_t7()
    }

    /// Schedules `tasks` to run next, in order.
    fn then<I>(&mut self, tasks: I) where I: IntoIterator<Item = Task<'a>>, I::IntoIter: DoubleEndedIterator {
        self.tasks.extend(tasks.into_iter().rev());
    }

    fn run(&mut self) -> Result<(), CompileError> {
        while let Some(task) = self.tasks.pop() {
            match task {
                Task::Node(node, ctx) => self.lower(node, ctx)?,
                Task::Resume(cont) => self.resume(cont)?,
            }
        }
        Ok(())
    }

    fn declare(&mut self, name: &str) -> Result<u32, CompileError> {
        let hash = self.script.hash(name)?;
        self.function.add_local(hash);
        Ok(hash)
    }
    fn synthetic_local(&mut self, what: &str, index: usize) -> Result<u32, CompileError> {
        self.declare(&format_compact!("${what}{index}"))
    }

    /// Declares every local assigned in `block` and reserves the synthetic locals of its loops and switches.
    fn collect_locals(&mut self, block: &'a Node) -> Result<(), CompileError> {
        let mut switches = vec![];
        let mut foreaches = vec![];

        // pre-order, so the synthetic locals come out in the same order lowering asks for them
        let mut stack = vec![block];
        while let Some(node) = stack.pop() {
            match node.kind.as_str() {
                "setVariableField" => {
                    if let Some(target) = node.children.first().filter(|x| x.is("identifier")) {
                        self.declare(target.text()?)?;
                    }
                }
                "foreachSingle" | "foreachDouble" => {
                    let index = self.synthetic;
                    self.synthetic += 1;
                    let array = self.synthetic_local("array", index)?;
                    let (iterator, key, next_key) = if self.is_t7() {
                        (0, self.synthetic_local("key", index)?, 0)
                    } else {
                        (self.synthetic_local("iterator", index)?, self.synthetic_local("key", index)?, self.synthetic_local("next", index)?)
                    };
                    foreaches.push(ForeachLocals { array, iterator, key, next_key });

                    let names = if node.is("foreachDouble") { 2 } else { 1 };
                    for name in node.children.iter().take(names).filter(|x| x.is("identifier")) {
                        self.declare(name.text()?)?;
                    }
                }
                "switchStatement" => {
                    let index = self.synthetic;
                    self.synthetic += 1;
                    switches.push(self.synthetic_local("switch", index)?);
                }
                "call" if node.text.as_deref().is_some_and(|x| x.eq_ignore_ascii_case("waittill")) => {
                    if let Some(args) = node.find_child("arguments") {
                        let mut vars: Vec<&Node> = args.children.iter().skip(1).collect();
                        while let Some(var) = vars.pop() {
                            if var.is("identifier") { self.declare(var.text()?)?; }
                            vars.extend(var.children.iter());
                        }
                    }
                }
                _ => (),
            }
            stack.extend(node.children.iter().rev());
        }

        for key in switches.into_iter().rev() {
            self.function.push_switch_key(key);
        }
        for locals in foreaches.into_iter().rev() {
            self.function.push_foreach_locals(locals);
        }
        Ok(())
    }

    fn lower(&mut self, node: &'a Node, ctx: Context) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        match node.kind.as_str() {
            "script" | "block" | "blockContent" | "statement" | "statementBlock" | "declaration" | "parenExpr" | "empty" => {
                self.then(node.children.iter().map(|x| N(x, ctx)));
            }

            "ifStatement" | "conditionalStatement" => {
                let otherwise = node.children.get(2);
                if node.is("conditionalStatement") && otherwise.is_none() {
                    return Err(node.malformed("missing else branch"));
                }
                self.then([N(node.child(0)?, Context::NONE), R(Cont::Branch { then: node.child(1)?, otherwise })]);
            }
            "whileStatement" => {
                let (cond, body) = (node.child(0)?, node.child(1)?);
                self.function.enter_loop();
                let header = self.function.end_of_chain();
                self.then([N(cond, Context::NONE), R(Cont::WhileBody { header, body })]);
            }
            "forStatement" => {
                let (init, cond, iter, body) = (node.child(0)?, node.child(1)?, node.child(2)?, node.child(3)?);
                self.function.enter_loop();
                self.then([N(init, Context::NONE), R(Cont::ForHeader { cond, iter, body })]);
            }
            "foreachSingle" | "foreachDouble" => {
                let locals = self.function.pop_foreach_locals()?;
                let offset = node.is("foreachDouble") as usize;
                let key = match offset {
                    0 => locals.key,
                    _ => self.local(node.child(0)?)?,
                };
                let value = self.local(node.child(offset)?)?;
                let (expr, body) = (node.child(offset + 1)?, node.child(offset + 2)?);
                self.then([N(expr, Context::NONE), R(Cont::ForeachStart { locals, key, value, body })]);
            }
            "switchStatement" => {
                let key = self.function.pop_switch_key()?;
                let scrutinee = node.child(0)?;
                let mut cases: Vec<&'a Node> = node.children[1..].iter().collect();
                if let Some(bad) = cases.iter().find(|x| !x.is("case") && !x.is("default")) {
                    return Err(CompileError::UnsupportedNode { kind: bad.kind.clone() });
                }
                if let Some(i) = cases.iter().position(|x| x.is("default")) {
                    let default = cases.remove(i);
                    cases.push(default);
                }
                self.function.enter_loop();
                self.then([N(scrutinee, Context::NONE), R(Cont::SwitchStore { key, cases })]);
            }
            "jumpStatement" => {
                let kind = match node.text()? {
                    "break" => LoopJump::Break,
                    "continue" => LoopJump::Continue,
                    _ => return Err(node.malformed("expected break or continue")),
                };
                let levels = match node.value {
                    None => 1,
                    Some(Literal::Int(x)) if x >= 0 => x as usize,
                    Some(_) => return Err(node.malformed("bad loop count")),
                };
                self.function.push_lcf(kind, levels)?;
            }
            "return" => match node.children.first() {
                Some(expr) => self.then([N(expr, Context::NONE), R(Cont::Op(Op::Return))]),
                None => { self.function.add_op(Op::End); }
            }
            "wait" => self.then([N(node.child(0)?, Context::NONE), R(Cont::Op(Op::Wait))]),
            "waitTillFrameEnd" => { self.function.add_op(Op::WaitTillFrameEnd); }
            "simpleCall" => self.then([N(node.child(0)?, Context::DEC_TOP)]),
            "call" => self.lower_call(node, ctx)?,

            "setVariableField" => self.lower_assignment(node)?,
            "shortHandArray" => return Err(node.malformed("array shorthand outside of an assignment")),

            "identifier" => self.lower_identifier(node, ctx)?,
            "directAccess" => {
                let object = node.child(0)?;
                let field = self.script.hash(node.text()?)?;
                let object_ctx = if self.is_t7() { ctx.with(Context::IS_REF) } else { ctx };
                let op = self.field_op(ctx);
                self.then([R(Cont::Object(object, object_ctx)), R(Cont::Field(op, field))]);
            }
            "definedAccess" => {
                let object = node.child(0)?;
                let field = self.script.hash(node.text()?)?;
                let temp = self.declare(DEFINED_TEMP)?;
                self.then([R(Cont::Object(object, ctx)), R(Cont::DefinedAccess { temp, field, ctx })]);
            }
            "array" => {
                let op = if ctx.has(Context::IS_REF) { Op::EvalArrayRef } else { Op::EvalArray };
                self.then([N(node.child(1)?, Context::NONE), N(node.child(0)?, ctx), R(Cont::Op(op))]);
            }

            "booleanExpression" => match node.children.len() {
                0 => (),
                1 => self.then([N(node.child(0)?, ctx)]),
                _ => {
                    let token = node.text()?;
                    let (defined, op) = match token.strip_prefix('?') {
                        Some(op) => (true, op),
                        None => (false, token),
                    };
                    let op = match op {
                        "&&" | "and" => Op::JumpOnFalseExpr,
                        "||" | "or" => Op::JumpOnTrueExpr,
                        _ => return Err(CompileError::UnknownOperator { op: token.into() }),
                    };
                    let mut seq = vec![N(node.child(0)?, Context::NONE)];
                    if defined { seq.push(R(Cont::Op(Op::IsDefined))) }
                    seq.push(R(Cont::ShortCircuit { op, rhs: node.child(1)? }));
                    self.then(seq);
                }
            }
            "boolNot" => self.then([N(node.child(0)?, Context::NONE), R(Cont::Op(Op::BoolNot))]),
            "size" => self.then([N(node.child(0)?, Context::NONE), R(Cont::Op(Op::SizeOf))]),
            "relationalExpression" | "expression" => {
                let token = node.text()?;
                let op = match node.is("expression") {
                    true => opcode::math_op(token),
                    false => opcode::compare_op(token),
                };
                let op = op.ok_or_else(|| CompileError::UnknownOperator { op: token.into() })?;
                self.then([N(node.child(0)?, Context::NONE), N(node.child(1)?, Context::NONE), R(Cont::Op(op))]);
            }
            "undefined_coalesce" => {
                let temp = self.declare(COALESCE_TEMP)?;
                self.then([N(node.child(0)?, Context::NONE), R(Cont::Coalesce { temp, rhs: node.child(1)? })]);
            }
            "typeComparison" | "typeComparisonInverted" => self.lower_type_test(node, node.is("typeComparisonInverted"))?,
            "castOp" => {
                let ty = lowercase(node.text()?);
                if !matches!(ty.as_str(), "int" | "float" | "istring") {
                    return Err(CompileError::UnknownOperator { op: format_compact!("as {ty}") });
                }
                let key = self.builtin_import(&ty)?;
                self.then([R(Cont::Op(Op::PreScriptCall)), N(node.child(0)?, Context::NONE), R(Cont::Call(Op::ScriptFunctionCall, key))]);
            }

            "stringLiteral" => { self.function.add_string(self.script.tables_mut(), Op::GetString, node.text()?.into()); }
            "iString" => { self.function.add_string(self.script.tables_mut(), Op::GetIString, node.text()?.into()); }
            "debugString" => match self.vm() {
                VmRevision::T7 => {
                    let hash = self.script.hash(node.text()?)?;
                    self.function.add_debug_string(self.script.tables_mut(), hash);
                }
                VmRevision::Vm36 => { self.function.add_string(self.script.tables_mut(), Op::GetString, node.text()?.into()); }
            }
            "hashedString" => {
                let value = parse_hashed(node.text()?, self.vm())?;
                self.function.add_hash(value);
            }
            "canonHashed" => {
                let value = self.script.hash64(node.text()?)?;
                self.function.add_hash(value);
            }
            "numberLiteral" => {
                let value = match (node.value, node.text.as_deref()) {
                    (Some(Literal::Int(x)), _) => Numeric::Int(x),
                    (Some(Literal::Float(x)), _) => match x as f32 {
                        narrowed if narrowed.is_finite() => Numeric::Float(narrowed),
                        _ => return Err(CompileError::BadNumber { text: format_compact!("{x}") }),
                    },
                    (None, Some(text)) => parse_number(text)?,
                    (None, None) => return Err(node.malformed("missing number value")),
                };
                self.function.add_number(value)?;
            }
            "vector" => {
                let (x, y, z) = (node.child(0)?, node.child(1)?, node.child(2)?);
                self.then([N(z, Context::NONE), N(y, Context::NONE), N(x, Context::NONE), R(Cont::Op(Op::Vector))]);
            }
            "newArray" => { self.function.add_op(Op::GetEmptyArray); }
            "getFunction" => {
                let function = self.script.hash(node.text()?)?;
                let namespace = match node.find_child("namespace") {
                    Some(ns) => self.script.hash(ns.text()?)?,
                    None => self.script.namespace(),
                };
                let mut flags = import_flags::IS_REF;
                if namespace == self.script.namespace() { flags |= import_flags::NEEDS_RESOLVER }
                let op = if self.is_t7() { Op::GetFunction } else { Op::GetAPIFunction };
                self.function.add_func_ptr(self.script.tables_mut(), op, ImportKey { function, namespace, params: 0, flags });
            }

            _ => return Err(CompileError::UnsupportedNode { kind: node.kind.clone() }),
        }
        Ok(())
    }

    fn resume(&mut self, cont: Cont<'a>) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        match cont {
            Cont::Op(op) => { self.function.add_op(op); }
            Cont::Number(value) => { self.function.add_number(Numeric::Int(value))?; }
            Cont::StoreLocal(hash) => self.store_local(hash),
            Cont::Field(op, hash) => { self.function.add_field(op, hash); }
            Cont::Object(node, ctx) => self.emit_object(node, ctx)?,
            Cont::Call(op, key) => { self.function.add_call(self.script.tables_mut(), op, key); }
            Cont::CallPtr(op, params) => { self.function.add_call_ptr(op, params); }
            Cont::Notification(op, params) => { self.function.add_notification(op, params); }
            Cont::Land(jump) => self.land(jump),
            Cont::MacroEnd => { self.expanding.pop(); }

            Cont::Branch { then, otherwise } => {
                let jump = self.function.add_jump(Op::JumpOnFalse);
                match otherwise {
                    Some(otherwise) => self.then([N(then, Context::NONE), R(Cont::Else { jump, otherwise })]),
                    None => self.then([N(then, Context::NONE), R(Cont::Land(jump))]),
                }
            }
            Cont::Else { jump, otherwise } => {
                let skip = self.function.add_jump(Op::Jump);
                self.function.set_jump_target(jump, skip);
                self.then([N(otherwise, Context::NONE), R(Cont::Land(skip))]);
            }
            Cont::ShortCircuit { op, rhs } => {
                let jump = self.function.add_jump(op);
                let mut seq = vec![N(rhs, Context::NONE)];
                if !self.is_t7() { seq.push(R(Cont::Op(Op::CastBool))) }
                seq.push(R(Cont::Land(jump)));
                self.then(seq);
            }
            Cont::DefinedAccess { temp, field, ctx } => {
                self.store_local(temp);
                self.function.add_eval_local(temp, Context::NONE);
                self.function.add_op(Op::IsDefined);
                let undefined = self.function.add_jump(Op::JumpOnFalse);
                self.function.add_eval_local(temp, Context::NONE);
                self.function.add_op(Op::CastFieldObject);
                let op = if ctx.has(Context::IS_REF) { Op::EvalFieldVariableRef } else { Op::EvalFieldVariable };
                self.function.add_field(op, field);
                let done = self.function.add_jump(Op::Jump);
                self.function.set_jump_target(undefined, done);
                self.function.add_op(Op::GetUndefined);
                self.land(done);
            }
            Cont::Coalesce { temp, rhs } => {
                self.store_local(temp);
                self.function.add_eval_local(temp, Context::NONE);
                self.function.add_op(Op::IsDefined);
                let undefined = self.function.add_jump(Op::JumpOnFalse);
                self.function.add_eval_local(temp, Context::NONE);
                let done = self.function.add_jump(Op::Jump);
                self.function.set_jump_target(undefined, done);
                self.then([N(rhs, Context::NONE), R(Cont::Land(done))]);
            }
            Cont::OptionalParam { hash, default } => {
                if self.is_t7() {
                    self.function.add_eval_local(hash, Context::NONE);
                    self.function.add_op(Op::IsDefined);
                } else {
                    self.function.add_eval_local_defined(hash);
                }
                let jump = self.function.add_jump(Op::JumpOnTrue);
                self.then([N(default, Context::NONE), R(Cont::StoreLocal(hash)), R(Cont::Land(jump))]);
            }

            Cont::WhileBody { header, body } => {
                let exit = self.function.add_jump(Op::JumpOnFalse);
                self.then([N(body, Context::NONE), R(Cont::CloseLoop { header, exit: Some(exit), continue_at: header })]);
            }
            Cont::ForHeader { cond, iter, body } => {
                let header = self.function.end_of_chain();
                match cond.is("empty") {
                    true => self.then([R(Cont::ForBody { header, test: false, iter, body })]),
                    false => self.then([N(cond, Context::NONE), R(Cont::ForBody { header, test: true, iter, body })]),
                }
            }
            Cont::ForBody { header, test, iter, body } => {
                let exit = test.then(|| self.function.add_jump(Op::JumpOnFalse));
                self.then([N(body, Context::NONE), R(Cont::ForIterate { header, exit, iter })]);
            }
            Cont::ForIterate { header, exit, iter } => {
                let continue_at = self.function.end_of_chain();
                self.then([N(iter, Context::NONE), R(Cont::CloseLoop { header, exit, continue_at })]);
            }
            Cont::ForeachStart { locals, key, value, body } => {
                let t7 = self.is_t7();
                self.store_local(locals.array);
                if t7 {
                    self.function.add_eval_local(locals.array, Context::NONE);
                    self.function.add_op(Op::FirstArrayKey);
                } else {
                    self.function.add(InsnKind::Local { op: Op::FirstArrayKeyCached, hash: locals.array });
                }
                self.store_local(key);

                self.function.enter_loop();
                let header = self.function.end_of_chain();
                if t7 {
                    self.function.add_eval_local(key, Context::NONE);
                    self.function.add_op(Op::IsDefined);
                } else {
                    self.function.add_eval_local_defined(key);
                }
                let exit = self.function.add_jump(Op::JumpOnFalse);

                self.function.add_eval_local(key, Context::NONE);
                self.function.add_eval_local(locals.array, Context::NONE);
                self.function.add_op(Op::EvalArray);
                self.store_local(value);
                if !t7 {
                    self.function.add_eval_local(key, Context::NONE);
                    self.function.add_eval_local(locals.array, Context::NONE);
                    self.function.add(InsnKind::Local { op: Op::SetNextArrayKeyCached, hash: locals.next_key });
                }
                self.then([N(body, Context::NONE), R(Cont::ForeachNext { locals, key, header, exit })]);
            }
            Cont::ForeachNext { locals, key, header, exit } => {
                let continue_at = self.function.end_of_chain();
                if self.is_t7() {
                    self.function.add_eval_local(key, Context::NONE);
                    self.function.add_eval_local(locals.array, Context::NONE);
                    self.function.add_op(Op::NextArrayKey);
                } else {
                    self.function.add_eval_local(locals.next_key, Context::NONE);
                }
                self.store_local(key);
                self.close_loop(header, Some(exit), continue_at)?;
            }
            Cont::CloseLoop { header, exit, continue_at } => self.close_loop(header, exit, continue_at)?,

            Cont::SwitchStore { key, cases } => {
                self.store_local(key);
                self.then([R(Cont::SwitchCase { key, cases, index: 0, pending: vec![] })]);
            }
            Cont::SwitchCase { key, cases, index, pending } => match cases.get(index).copied() {
                None => {
                    for jump in pending { self.land(jump) }
                    self.resume(Cont::SwitchEnd)?;
                }
                Some(case) if case.is("default") => {
                    for jump in pending { self.land(jump) }
                    self.then(case.children.iter().map(|x| N(x, Context::NONE)).chain([R(Cont::SwitchEnd)]));
                }
                Some(case) => self.then([N(case.child(0)?, Context::NONE), R(Cont::SwitchTest { key, cases, index, pending })]),
            }
            Cont::SwitchTest { key, cases, index, mut pending } => {
                let case = cases[index];
                self.function.add_eval_local(key, Context::NONE);
                self.function.add_op(Op::Equal);
                if case.children.len() > 1 {
                    let skip = self.function.add_jump(Op::JumpOnFalse);
                    for jump in pending { self.land(jump) }
                    self.then(case.children[1..].iter().map(|x| N(x, Context::NONE)).chain([
                        R(Cont::Land(skip)),
                        R(Cont::SwitchCase { key, cases, index: index + 1, pending: vec![] }),
                    ]));
                } else {
                    // an empty case falls through into the next one with a body
                    pending.push(self.function.add_jump(Op::JumpOnTrue));
                    self.then([R(Cont::SwitchCase { key, cases, index: index + 1, pending })]);
                }
            }
            Cont::SwitchEnd => {
                let footer = self.function.end_of_chain();
                self.function.exit_loop(None, footer)?;
            }
        }
        Ok(())
    }

    fn land(&mut self, jump: InsnKey) {
        let end = self.function.end_of_chain();
        self.function.set_jump_target(jump, end);
    }
    fn close_loop(&mut self, header: InsnKey, exit: Option<InsnKey>, continue_at: InsnKey) -> Result<(), CompileError> {
        let back = self.function.add_jump(ScriptOpCode::Jump);
        self.function.set_jump_target(back, header);
        if let Some(exit) = exit {
            self.function.set_jump_target(exit, back);
        }
        self.function.exit_loop(Some(continue_at), back)
    }

    /// Pops the top of the stack into a declared local.
    fn store_local(&mut self, hash: u32) {
        if self.is_t7() {
            self.function.add_eval_local(hash, Context::IS_REF);
            self.function.add_op(ScriptOpCode::SetVariableField);
        } else {
            self.function.add_assign_local(hash);
        }
    }
    /// Hash of a local that must already be declared.
    fn local(&mut self, node: &Node) -> Result<u32, CompileError> {
        let name = node.text()?;
        let hash = self.script.hash(name)?;
        match self.function.has_local(hash) {
            true => Ok(hash),
            false => Err(CompileError::UnknownVariable { name: name.into(), function: self.function.name.clone() }),
        }
    }
    fn field_op(&self, ctx: Context) -> ScriptOpCode {
        match (self.is_t7(), ctx.has(Context::IS_REF)) {
            (_, true) => ScriptOpCode::EvalFieldVariableRef,
            (true, false) => ScriptOpCode::EvalFieldVariable,
            (false, false) => ScriptOpCode::CastAndEvalFieldVariable,
        }
    }

    fn lower_identifier(&mut self, node: &'a Node, ctx: Context) -> Result<(), CompileError> {
        let name = node.text()?;
        let key = lowercase(name);
        if let Some(&expr) = self.macros.get(&key) {
            if self.expanding.contains(&key) {
                return Err(CompileError::MalformedNode { kind: "globals".into(), reason: "macro expands to itself" });
            }
            self.expanding.push(key);
            self.then([Task::Node(expr, ctx), Task::Resume(Cont::MacroEnd)]);
            return Ok(());
        }

        let is_ref = ctx.has(Context::IS_REF);
        if let Some(object) = opcode::builtin_object(self.vm(), name, is_ref) {
            return self.emit_builtin(name, object, is_ref);
        }
        let hash = self.local(node)?;
        self.function.add_eval_local(hash, ctx);
        Ok(())
    }
    fn emit_builtin(&mut self, name: &str, object: BuiltinObject, is_ref: bool) -> Result<(), CompileError> {
        match object {
            BuiltinObject::Op(op) => { self.function.add_op(op); }
            BuiltinObject::True => { self.function.add_number(Numeric::Int(1))?; }
            BuiltinObject::Global => {
                let op = if is_ref { ScriptOpCode::GetGlobalObjectRef } else { ScriptOpCode::GetGlobalObject };
                let hash = self.script.hash(name)?;
                self.function.add_global(self.script.tables_mut(), op, hash);
            }
        }
        Ok(())
    }
    fn emit_object(&mut self, node: &'a Node, ctx: Context) -> Result<(), CompileError> {
        let is_ref = ctx.has(Context::IS_REF);
        if node.is("identifier") {
            let name = node.text()?;
            if let Some(object) = opcode::builtin_object(self.vm(), name, is_ref) {
                return self.emit_builtin(name, object, is_ref);
            }
        }
        let mut seq = vec![Task::Node(node, Context::NONE)];
        if is_ref { seq.push(Task::Resume(Cont::Op(ScriptOpCode::CastFieldObject))) }
        self.then(seq);
        Ok(())
    }

    fn lower_assignment(&mut self, node: &'a Node) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        let token = node.text()?;
        let target = node.child(0)?;
        match token {
            "++" | "--" => {
                let op = if token == "++" { Op::Inc } else { Op::Dec };
                self.then([N(target, Context::IS_REF), R(Cont::Op(op))]);
            }
            "=" => {
                let value = node.child(1)?;
                if value.is("shortHandArray") {
                    let mut seq = vec![R(Cont::Op(Op::GetEmptyArray)), N(target, Context::IS_REF), R(Cont::Op(Op::SetVariableField))];
                    for (i, element) in value.children.iter().enumerate() {
                        seq.extend([
                            N(element, Context::NONE), R(Cont::Number(i as i64)),
                            N(target, Context::IS_REF), R(Cont::Op(Op::EvalArrayRef)), R(Cont::Op(Op::SetVariableField)),
                        ]);
                    }
                    self.then(seq);
                } else {
                    self.then([N(value, Context::NONE), N(target, Context::IS_REF), R(Cont::Op(Op::SetVariableField))]);
                }
            }
            "??=" => {
                let temp = self.declare(COALESCE_TEMP)?;
                self.then([
                    N(target, Context::NONE), R(Cont::Coalesce { temp, rhs: node.child(1)? }),
                    N(target, Context::IS_REF), R(Cont::Op(Op::SetVariableField)),
                ]);
            }
            _ => {
                let op = token.strip_suffix('=').and_then(opcode::math_op).ok_or_else(|| CompileError::UnknownOperator { op: token.into() })?;
                self.then([
                    N(target, Context::NONE), N(node.child(1)?, Context::NONE), R(Cont::Op(op)),
                    N(target, Context::IS_REF), R(Cont::Op(Op::SetVariableField)),
                ]);
            }
        }
        Ok(())
    }

    fn lower_type_test(&mut self, node: &'a Node, inverted: bool) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        let expr = node.child(0)?;
        let ty = lowercase(node.text()?);
        let mut seq = match ty.as_str() {
            "true" | "false" => vec![N(expr, Context::NONE), R(Cont::Number((ty == "true") as i64)), R(Cont::Op(Op::SuperEqual))],
            "defined" => vec![N(expr, Context::NONE), R(Cont::Op(Op::IsDefined))],
            "undefined" => vec![N(expr, Context::NONE), R(Cont::Op(Op::IsDefined)), R(Cont::Op(Op::BoolNot))],
            "float" | "functionptr" | "string" | "array" | "vec" | "int" => {
                let key = self.builtin_import(&format_compact!("is{ty}"))?;
                vec![R(Cont::Op(Op::PreScriptCall)), N(expr, Context::NONE), R(Cont::Call(Op::ScriptFunctionCall, key))]
            }
            _ => return Err(CompileError::UnknownOperator { op: format_compact!("is {ty}") }),
        };
        if inverted { seq.push(R(Cont::Op(Op::BoolNot))) }
        self.then(seq);
        Ok(())
    }
    /// The import of a single-argument engine function in the script's own namespace.
    fn builtin_import(&mut self, name: &str) -> Result<ImportKey, CompileError> {
        let function = self.script.hash(name)?;
        let namespace = self.script.namespace();
        Ok(ImportKey { function, namespace, params: 1, flags: self.call_flags(name, namespace, Context::NONE) })
    }

    fn lower_call(&mut self, node: &'a Node, ctx: Context) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        let args: &'a [Node] = node.find_child("arguments").map(|x| x.children.as_slice()).unwrap_or(&[]);
        let caller = node.find_child("caller").map(|x| x.child(0)).transpose()?;
        let pointer = node.find_child("pointer").map(|x| x.child(0)).transpose()?;
        let namespace = node.find_child("namespace").map(|x| x.text()).transpose()?;
        error::check_capacity("call parameters", args.len(), MAX_PARAMS)?;
        let params = args.len() as u8;

        let mut ctx = ctx;
        if caller.is_some() { ctx = ctx.with(Context::HAS_CALLER) }
        if node.find_child("thread").is_some() { ctx = ctx.with(Context::THREADED) }
        if pointer.is_some() { ctx = ctx.with(Context::IS_POINTER) }

        let name = match pointer {
            Some(_) => None,
            None => Some(lowercase(node.text()?)),
        };
        if let (Some(name), None, false) = (&name, namespace, ctx.has(Context::THREADED)) {
            let vm = self.vm();
            if opcode::builtin_call(vm, name).is_some() || opcode::notifier(vm, name).is_some() {
                return self.lower_builtin_call(name, args, caller, ctx);
            }
        }

        let mut seq = vec![R(Cont::Op(Op::PreScriptCall))];
        seq.extend(args.iter().rev().map(|x| N(x, Context::NONE)));
        if let Some(caller) = caller { seq.push(N(caller, Context::NONE)) }
        match (pointer, name) {
            (Some(pointer), _) => {
                seq.push(N(pointer, Context::NONE));
                seq.push(R(Cont::CallPtr(call_op(ctx), params)));
            }
            (None, Some(name)) => {
                let namespace = match namespace {
                    Some(ns) => self.script.hash(ns)?,
                    None => self.script.namespace(),
                };
                let function = self.script.hash(&name)?;
                let flags = self.call_flags(&name, namespace, ctx);
                seq.push(R(Cont::Call(call_op(ctx), ImportKey { function, namespace, params, flags })));
            }
            (None, None) => return Err(node.malformed("missing function name")),
        }
        if ctx.has(Context::DEC_TOP) { seq.push(R(Cont::Op(Op::DecTop))) }
        self.then(seq);
        Ok(())
    }
    fn lower_builtin_call(&mut self, name: &str, args: &'a [Node], caller: Option<&'a Node>, ctx: Context) -> Result<(), CompileError> {
        use ScriptOpCode as Op;
        use Task::{Node as N, Resume as R};

        let vm = self.vm();
        let reversed = move || args.iter().rev().map(|x| N(x, Context::NONE));
        let unknown = || CompileError::UnknownBuiltin { name: name.into() };

        let Some(caller) = caller else {
            let op = opcode::builtin_call(vm, name).ok_or_else(unknown)?;
            self.then(reversed().chain([R(Cont::Op(op))]));
            return Ok(());
        };
        let op = opcode::notifier(vm, name).ok_or_else(unknown)?;

        let mut seq = vec![];
        match (vm, op) {
            (VmRevision::T7, Op::WaitTill) => {
                let (event, vars) = args.split_first().ok_or(CompileError::MalformedNode { kind: "call".into(), reason: "waittill without an event" })?;
                seq.extend([N(event, Context::NONE), R(Cont::Object(caller, Context::NONE)), R(Cont::Op(op))]);
                seq.extend(vars.iter().map(|x| N(x, Context::WAITTILL)));
                seq.push(R(Cont::Op(Op::ClearParams)));
            }
            (_, Op::Notify) => {
                seq.push(R(Cont::Op(Op::PreScriptCall)));
                seq.extend(reversed());
                seq.extend([R(Cont::Object(caller, Context::NONE)), R(Cont::Op(op))]);
            }
            (VmRevision::T7, _) => {
                seq.extend(reversed());
                seq.extend([R(Cont::Object(caller, Context::NONE)), R(Cont::Op(op))]);
            }
            (VmRevision::Vm36, _) => {
                seq.extend(reversed());
                seq.extend([R(Cont::Object(caller, Context::NONE)), R(Cont::Notification(op, args.len() as u8))]);
                if matches!(op, Op::WaitTill | Op::WaitTillMatch | Op::WaittillTimeout) && ctx.has(Context::DEC_TOP) {
                    seq.push(R(Cont::Op(Op::DecTop)));
                }
            }
        }
        self.then(seq);
        Ok(())
    }

    fn call_flags(&self, name: &str, namespace: u32, ctx: Context) -> u8 {
        let local = namespace == self.script.namespace();
        let (method, threaded) = (ctx.has(Context::HAS_CALLER), ctx.has(Context::THREADED));
        let mut flags = match self.vm() {
            VmRevision::T7 => {
                let mut flags = if method { import_flags::IS_METHOD } else { import_flags::IS_FUNCTION };
                if threaded { flags |= import_flags::IS_REF }
                if local && self.script.settings().flag_dev_calls && opcode::is_dev_function(name) { flags |= import_flags::IS_DEBUG }
                flags
            }
            VmRevision::Vm36 => match (method, threaded) {
                (true, true) => import_flags::T8_METHOD_THREAD,
                (true, false) => import_flags::T8_METHOD,
                (false, true) => import_flags::T8_FUNCTION_THREAD,
                (false, false) => import_flags::T8_FUNCTION,
            }
        };
        if local { flags |= import_flags::NEEDS_RESOLVER }
        flags
    }
}

fn call_op(ctx: Context) -> ScriptOpCode {
    use ScriptOpCode as Op;
    match (ctx.has(Context::HAS_CALLER), ctx.has(Context::THREADED), ctx.has(Context::IS_POINTER)) {
        (true, true, false) => Op::ScriptMethodThreadCall,
        (true, false, false) => Op::ScriptMethodCall,
        (false, true, false) => Op::ScriptThreadCall,
        (false, false, false) => Op::ScriptFunctionCall,
        (true, true, true) => Op::ScriptMethodThreadCallPointer,
        (true, false, true) => Op::ScriptMethodCallPointer,
        (false, true, true) => Op::ScriptThreadCallPointer,
        (false, false, true) => Op::ScriptFunctionCallPointer,
    }
}

fn parse_hashed(text: &str, vm: VmRevision) -> Result<u64, CompileError> {
    let lower = text.to_ascii_lowercase();
    let digits = lower.strip_prefix("hash_").unwrap_or(&lower);
    u64::from_str_radix(digits, 16).ok()
        .filter(|&x| vm == VmRevision::Vm36 || x <= u32::MAX as u64)
        .ok_or_else(|| CompileError::BadHash { text: text.into() })
}

fn parse_number(text: &str) -> Result<Numeric, CompileError> {
    if let Ok(x) = text.parse::<i64>() { return Ok(Numeric::Int(x)) }
    match text.parse::<f32>() {
        Ok(x) if x.is_finite() => Ok(Numeric::Float(x)),
        _ => Err(CompileError::BadNumber { text: text.into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Target;

    fn id(name: &str) -> Node { Node::token("identifier", name) }
    fn num(value: i64) -> Node { Node::new("numberLiteral", vec![]).with_value(Literal::Int(value)) }
    fn block(stmts: Vec<Node>) -> Node { Node::new("block", stmts) }
    fn ret(expr: Node) -> Node { Node::new("return", vec![expr]) }
    fn assign(target: Node, value: Node) -> Node { Node::new("setVariableField", vec![target, value]).with_text("=") }
    fn call(name: &str, args: Vec<Node>) -> Node { Node::new("call", vec![Node::new("arguments", args)]).with_text(name) }
    fn function(name: &str, params: &[&str], body: Vec<Node>) -> Node {
        let params = params.iter().map(|x| Node::token("parameter", x)).collect();
        Node::new("function", vec![Node::new("parameters", params), block(body)]).with_text(name)
    }
    fn script(items: Vec<Node>) -> Node { Node::new("script", items) }

    fn ops(script: &ScriptObject, name: &str) -> Vec<ScriptOpCode> {
        let (_, f) = script.functions().find(|(_, f)| f.name == name).unwrap();
        f.instructions().map(|(_, x)| x.op(script.target(), f.locals().len())).collect()
    }

    #[test]
    fn test_if_else_jumps() {
        use ScriptOpCode::*;
        let tree = script(vec![function("main", &["a"], vec![
            Node::new("ifStatement", vec![id("a"), ret(num(1)), ret(num(2))]),
        ])]);
        let built = build_script(CompileSettings::default(), &tree).unwrap();
        assert_eq!(ops(&built, "main"), [SafeCreateLocalVariables, EvalLocalVariableCached, JumpOnFalse, GetByte, Return, Jump, GetByte, Return, End]);

        let compiled = built.compile().unwrap();
        let layout = compiled.function("main").unwrap();
        let at = |op: ScriptOpCode, nth: usize| layout.instructions.iter().filter(|x| x.op == op).nth(nth).unwrap().address;
        assert_eq!(layout.jumps.len(), 2);
        assert_eq!(layout.jumps[0].op, JumpOnFalse);
        assert_eq!(layout.jumps[0].to, at(GetByte, 1));
        assert_eq!(layout.jumps[1].op, Jump);
        assert_eq!(layout.jumps[1].to, at(End, 0));
    }

    #[test]
    fn test_switch_default_only() {
        use ScriptOpCode::*;
        let tree = script(vec![function("main", &["a"], vec![
            Node::new("switchStatement", vec![
                id("a"),
                Node::new("default", vec![assign(id("b"), num(1)), Node::token("jumpStatement", "break")]),
            ]),
        ])]);
        let built = build_script(CompileSettings::default(), &tree).unwrap();
        assert_eq!(ops(&built, "main"), [
            SafeCreateLocalVariables, EvalLocalVariableCached, EvalLocalVariableRefCached, SetVariableField,
            GetByte, EvalLocalVariableRefCached, SetVariableField, Jump, End,
        ]);
        let compiled = built.compile().unwrap();
        let layout = compiled.function("main").unwrap();
        let end = layout.instructions.last().unwrap();
        assert_eq!(end.op, End);
        assert_eq!(layout.jumps[0].to, end.address);
    }

    #[test]
    fn test_switch_fallthrough() {
        use ScriptOpCode::*;
        let tree = script(vec![function("main", &["a"], vec![
            Node::new("switchStatement", vec![
                id("a"),
                Node::new("case", vec![num(1)]),
                Node::new("case", vec![num(2), Node::new("wait", vec![num(1)])]),
            ]),
        ])]);
        let compiled = compile_tree(CompileSettings::default(), &tree).unwrap();
        let layout = compiled.function("main").unwrap();
        let ops: Vec<_> = layout.instructions.iter().map(|x| x.op).collect();
        assert_eq!(ops, [
            SafeCreateLocalVariables, EvalLocalVariableCached, EvalLocalVariableRefCached, SetVariableField,
            GetByte, EvalLocalVariableCached, Equal, JumpOnTrue,
            GetByte, EvalLocalVariableCached, Equal, JumpOnFalse, GetByte, Wait, End,
        ]);
        let wait = &layout.instructions[12];
        assert_eq!(layout.jumps[0].op, JumpOnTrue);
        assert_eq!(layout.jumps[0].to, wait.address);
        assert_eq!(layout.jumps[1].to, layout.instructions[14].address);
    }

    #[test]
    fn test_import_dedup() {
        let threaded = Node::new("call", vec![Node::new("arguments", vec![]), Node::new("thread", vec![])]).with_text("foo");
        let tree = script(vec![function("main", &[], vec![
            Node::new("simpleCall", vec![call("foo", vec![])]),
            Node::new("simpleCall", vec![call("FOO", vec![])]),
            Node::new("simpleCall", vec![threaded]),
        ])]);
        let compiled = compile_tree(CompileSettings::default(), &tree).unwrap();
        let imports: Vec<_> = compiled.tables.imports.entries().collect();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].value.flags, import_flags::IS_FUNCTION | import_flags::NEEDS_RESOLVER);
        assert_eq!(imports[0].refs.len(), 2);
        assert_eq!(imports[1].value.flags, import_flags::IS_FUNCTION | import_flags::IS_REF | import_flags::NEEDS_RESOLVER);
        assert_eq!(imports[1].refs.len(), 1);
        assert_eq!(imports[0].value.function, hash::hash32("foo"));
    }

    #[test]
    fn test_method_call_flags() {
        let tree = script(vec![function("main", &[], vec![
            Node::new("simpleCall", vec![Node::new("call", vec![
                Node::new("arguments", vec![num(1)]),
                Node::new("caller", vec![id("self")]),
                Node::new("thread", vec![]),
            ]).with_text("foo")]),
        ])]);
        let settings = CompileSettings { target: Target::t8(), ..Default::default() };
        let built = build_script(settings, &tree).unwrap();
        assert_eq!(ops(&built, "main"), [
            ScriptOpCode::CheckClearParams, ScriptOpCode::PreScriptCall, ScriptOpCode::GetByte, ScriptOpCode::GetSelf,
            ScriptOpCode::ScriptMethodThreadCall, ScriptOpCode::DecTop, ScriptOpCode::End,
        ]);
        let import = built.tables().imports.entries().next().unwrap();
        assert_eq!(import.value.flags, import_flags::T8_METHOD_THREAD | import_flags::NEEDS_RESOLVER);
        assert_eq!(import.value.params, 1);
    }

    #[test]
    fn test_t8_foreach() {
        use ScriptOpCode::*;
        let tree = script(vec![function("main", &["a"], vec![
            Node::new("foreachSingle", vec![id("v"), id("a"), block(vec![])]),
        ])]);
        let settings = CompileSettings { target: Target::t8(), ..Default::default() };
        let built = build_script(settings, &tree).unwrap();
        assert_eq!(ops(&built, "main"), [
            SafeCreateLocalVariables,
            EvalLocalVariableCached, SetLocalVariableCached, FirstArrayKeyCached, SetLocalVariableCached,
            EvalLocalVariableDefined, JumpOnFalse,
            EvalLocalVariableCached, EvalLocalVariableCached, EvalArray, SetLocalVariableCached,
            EvalLocalVariableCached, EvalLocalVariableCached, SetNextArrayKeyCached,
            EvalLocalVariableCached, SetLocalVariableCached, Jump, End,
        ]);
        let (_, main) = built.functions().next().unwrap();
        assert_eq!(main.locals().len(), 6);
        assert!(built.compile().is_ok());
    }

    #[test]
    fn test_unknown_variable() {
        let tree = script(vec![function("main", &[], vec![ret(id("x"))])]);
        match build_script(CompileSettings::default(), &tree) {
            Err(CompileError::UnknownVariable { name, function }) => {
                assert_eq!(name, "x");
                assert_eq!(function, "main");
            }
            x => panic!("{:?}", x.err()),
        }
    }

    #[test]
    fn test_unknown_builtin() {
        let tree = script(vec![function("main", &[], vec![Node::new("simpleCall", vec![call("waittill", vec![])])])]);
        assert!(matches!(build_script(CompileSettings::default(), &tree), Err(CompileError::UnknownBuiltin { .. })));
    }

    #[test]
    fn test_macros() {
        use ScriptOpCode::*;
        let tree = script(vec![
            Node::new("globals", vec![num(5)]).with_text("FIVE"),
            function("main", &[], vec![ret(id("five"))]),
        ]);
        let built = build_script(CompileSettings::default(), &tree).unwrap();
        assert_eq!(ops(&built, "main"), [CheckClearParams, GetByte, Return, End]);

        let tree = script(vec![
            Node::new("globals", vec![id("b")]).with_text("a"),
            Node::new("globals", vec![id("a")]).with_text("b"),
            function("main", &[], vec![ret(id("a"))]),
        ]);
        assert!(matches!(build_script(CompileSettings::default(), &tree), Err(CompileError::MalformedNode { reason: "macro expands to itself", .. })));
    }

    #[test]
    fn test_duplicate_function() {
        let tree = script(vec![function("main", &[], vec![]), function("MAIN", &[], vec![])]);
        assert!(matches!(build_script(CompileSettings::default(), &tree), Err(CompileError::DuplicateFunction { .. })));
    }

    #[test]
    fn test_hashed_literals() {
        assert_eq!(parse_hashed("hash_DEADBEEF", VmRevision::T7).unwrap(), 0xdeadbeef);
        assert_eq!(parse_hashed("1234", VmRevision::T7).unwrap(), 0x1234);
        assert_eq!(parse_hashed("hash_123456789a", VmRevision::Vm36).unwrap(), 0x123456789a);
        assert!(matches!(parse_hashed("hash_123456789a", VmRevision::T7), Err(CompileError::BadHash { .. })));
        assert!(matches!(parse_hashed("hash_", VmRevision::T7), Err(CompileError::BadHash { .. })));
        assert_eq!(parse_number("12").unwrap(), Numeric::Int(12));
        assert_eq!(parse_number("1.5").unwrap(), Numeric::Float(1.5));
        assert!(matches!(parse_number("abc"), Err(CompileError::BadNumber { .. })));
    }

    #[test]
    fn test_deep_nesting() {
        let mut expr = num(1);
        for _ in 0..10000 {
            expr = Node::new("parenExpr", vec![expr]);
        }
        let tree = script(vec![function("main", &[], vec![ret(expr)])]);
        assert!(compile_tree(CompileSettings::default(), &tree).is_ok());

        let mut body = Node::new("wait", vec![num(1)]);
        for _ in 0..10000 {
            body = Node::new("ifStatement", vec![id("a"), block(vec![body])]);
        }
        let tree = script(vec![function("main", &["a"], vec![body])]);
        let built = build_script(CompileSettings::default(), &tree).unwrap();
        let (_, main) = built.functions().next().unwrap();
        assert_eq!(main.instruction_count(), 1 + 2 * 10000 + 2 + 1);
    }

    #[test]
    fn test_deep_json_tree() {
        let depth = 1000;
        let mut json = String::from(r#"{"kind":"script","children":[{"kind":"function","text":"main","children":[{"kind":"parameters","children":[{"kind":"parameter","text":"a"}]},{"kind":"block","children":["#);
        for _ in 0..depth {
            json.push_str(r#"{"kind":"ifStatement","children":[{"kind":"identifier","text":"a"},{"kind":"wait","children":[{"kind":"numberLiteral","value":1}]},"#);
        }
        json.push_str(r#"{"kind":"return","children":[{"kind":"parenExpr","children":[{"kind":"numberLiteral","value":2}]}]}"#);
        json.push_str(&"]}".repeat(depth));
        json.push_str("]}]}]}");

        let tree = Node::from_json(&json).unwrap();
        let built = build_script(CompileSettings::default(), &tree).unwrap();
        let (_, main) = built.functions().next().unwrap();
        assert_eq!(main.instruction_count(), 1 + 5 * depth + 2 + 1);
        let compiled = built.compile().unwrap();
        assert_eq!(compiled.function("main").unwrap().jumps.len(), 2 * depth);
    }

    #[test]
    fn test_out_of_range_literals() {
        let float = |x: f64| script(vec![function("main", &[], vec![ret(Node::new("numberLiteral", vec![]).with_value(Literal::Float(x)))])]);
        assert!(compile_tree(CompileSettings::default(), &float(1.5e38)).is_ok());
        assert!(matches!(compile_tree(CompileSettings::default(), &float(1e300)), Err(CompileError::BadNumber { .. })));
        assert!(matches!(compile_tree(CompileSettings::default(), &float(-1e39)), Err(CompileError::BadNumber { .. })));

        let named = script(vec![function("func_123456789a", &[], vec![])]);
        assert!(matches!(build_script(CompileSettings::default(), &named), Err(CompileError::BadHash { .. })));
        let named = script(vec![function("func_3456789a", &[], vec![])]);
        let built = build_script(CompileSettings::default(), &named).unwrap();
        assert_eq!(built.functions().next().unwrap().1.hash, 0x3456789a);

        let calls = script(vec![function("main", &[], vec![Node::new("simpleCall", vec![call("func_123456789a", vec![])])])]);
        for target in [Target::t7_pc(), Target::t8()] {
            let settings = CompileSettings { target, ..Default::default() };
            assert!(matches!(build_script(settings, &calls), Err(CompileError::BadHash { .. })));
        }
    }
}
