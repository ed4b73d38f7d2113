//! Operation codes and the static lookup tables that map source-level names onto them.

use num_derive::FromPrimitive;
use unicase::UniCase;

use crate::vm::VmRevision;

/// An operation understood by one of the script VMs.
///
/// The legacy VM defines the first block (up to [`ScriptOpCode::NotifyBreakpoint`]) with fixed values,
/// later operations are numbered sequentially after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ScriptOpCode {
    End = 0x00, Return,
    GetUndefined, GetZero, GetByte, GetNegByte, GetUnsignedShort, GetNegUnsignedShort, GetInteger, GetFloat,
    GetString, GetIString, GetVector,

    GetLevelObject, GetAnimObject, GetSelf, GetLevel, GetGame, GetAnim, GetAnimation, GetGameRef, GetFunction,

    CreateLocalVariable, SafeCreateLocalVariables, RemoveLocalVariables, EvalLocalVariableCached,
    EvalArray, EvalLocalArrayRefCached, EvalArrayRef, ClearArray, GetEmptyArray, GetSelfObject,

    EvalFieldVariable, EvalFieldVariableRef, ClearFieldVariable, SafeSetVariableFieldCached,
    SetWaittillVariableFieldCached, ClearParams, CheckClearParams, EvalLocalVariableRefCached, SetVariableField,

    CallBuiltin, CallBuiltinMethod, Wait, WaitTillFrameEnd, PreScriptCall,
    ScriptFunctionCall, ScriptFunctionCallPointer, ScriptMethodCall, ScriptMethodCallPointer,
    ScriptThreadCall, ScriptThreadCallPointer, ScriptMethodThreadCall, ScriptMethodThreadCallPointer,

    DecTop, CastFieldObject, CastBool, BoolNot, BoolComplement,

    JumpOnFalse = 0x3B, JumpOnTrue, JumpOnFalseExpr, JumpOnTrueExpr, Jump, JumpBack,

    Inc, Dec, Bit_Or, Bit_Xor, Bit_And,
    Equal = 0x46, NotEqual, LessThan, GreaterThan, LessThanOrEqualTo, GreaterThanOrEqualTo,
    ShiftLeft, ShiftRight, Plus, Minus, Multiply, Divide, Modulus, SizeOf,

    WaitTillMatch, WaitTill, Notify, EndOn, VoidCodePos, Switch, EndSwitch, Vector,
    GetHash = 0x5C, RealWait, VectorConstant, IsDefined, VectorScale,

    AnglesToUp, AnglesToRight, AnglesToForward, AngleClamp180, VectorToAngles, Abs, GetTime,
    GetDvar, GetDvarInt, GetDvarFloat, GetDvarVector, GetDvarColorRed, GetDvarColorGreen, GetDvarColorBlue, GetDvarColorAlpha,

    FirstArrayKey = 0x70, NextArrayKey,
    ProfileStart, ProfileStop, SafeDecTop, Nop, Abort, Obj, ThreadObject, EvalLocalVariable, EvalLocalVariableRef,
    DevblockBegin, DevblockEnd, Breakpoint, AutoBreakpoint, ErrorBreakpoint, WatchBreakpoint,
    NotifyBreakpoint = 0x81,

    GetObjectType, WaitRealTime, GetWorldObject, GetClassesObject, ClassFunctionCall, Bit_Not, GetWorld,
    EvalLevelFieldVariable, EvalLevelFieldVariableRef, EvalSelfFieldVariable, EvalSelfFieldVariableRef,
    SuperEqual, SuperNotEqual,

    GetUnsignedInteger, GetGlobalObject, GetGlobalObjectRef,
    EvalLocalVariableRefCached2, EvalLocalVariableDefined, FirstArrayKeyCached, SetNextArrayKeyCached, SetLocalVariableCached,
    EvalFieldVariableOnStack, EvalFieldVariableOnStackRef, CastVariableName, CastAndEvalFieldVariable,
    GetAPIFunction, EndOnCallback, WaittillTimeout,
}
impl ScriptOpCode {
    /// The value written into the image for this operation.
    pub fn value(self) -> u16 {
        self as u8 as u16
    }
    /// Checks if this operation is one of the (conditional or unconditional) forward jumps.
    pub fn is_jump(self) -> bool {
        matches!(self, Self::Jump | Self::JumpOnFalse | Self::JumpOnTrue | Self::JumpOnFalseExpr | Self::JumpOnTrueExpr)
    }
}

#[test]
fn test_opcode_values() {
    use num_traits::FromPrimitive;

    assert_eq!(ScriptOpCode::End.value(), 0x00);
    assert_eq!(ScriptOpCode::GetFunction.value(), 0x15);
    assert_eq!(ScriptOpCode::SafeCreateLocalVariables.value(), 0x17);
    assert_eq!(ScriptOpCode::CheckClearParams.value(), 0x26);
    assert_eq!(ScriptOpCode::DecTop.value(), 0x36);
    assert_eq!(ScriptOpCode::BoolComplement.value(), 0x3A);
    assert_eq!(ScriptOpCode::Jump.value(), 0x3F);
    assert_eq!(ScriptOpCode::Bit_And.value(), 0x45);
    assert_eq!(ScriptOpCode::Plus.value(), 0x4E);
    assert_eq!(ScriptOpCode::SizeOf.value(), 0x53);
    assert_eq!(ScriptOpCode::Vector.value(), 0x5B);
    assert_eq!(ScriptOpCode::IsDefined.value(), 0x5F);
    assert_eq!(ScriptOpCode::GetDvarColorAlpha.value(), 0x6F);
    assert_eq!(ScriptOpCode::WatchBreakpoint.value(), 0x80);
    assert_eq!(ScriptOpCode::GetObjectType.value(), 0x82);
    assert_eq!(ScriptOpCode::SuperNotEqual.value(), 0x8E);

    for op in [ScriptOpCode::End, ScriptOpCode::NotifyBreakpoint, ScriptOpCode::WaittillTimeout] {
        assert_eq!(ScriptOpCode::from_u8(op as u8), Some(op));
    }
    assert_eq!(ScriptOpCode::from_u8(0xff), None);
}

/// Flags stored on an import entry.
pub mod import_flags {
    pub const IS_REF: u8 = 1;
    pub const IS_FUNCTION: u8 = 2;
    pub const IS_METHOD: u8 = 4;
    pub const IS_DEBUG: u8 = 16;
    pub const NEEDS_RESOLVER: u8 = 32;

    /// Newer VM call kinds, stored in the low bits in place of the legacy flag bits.
    pub const T8_FUNCTION: u8 = 2;
    pub const T8_FUNCTION_THREAD: u8 = 3;
    pub const T8_METHOD: u8 = 5;
    pub const T8_METHOD_THREAD: u8 = 6;
}

/// Flags stored on an export entry.
pub mod export_flags {
    pub const AUTOEXEC: u8 = 2;
    pub const PRIVATE: u8 = 4;
}

/// The evaluation context an expression is lowered in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Context(pub u8);
impl Context {
    pub const NONE: Self = Self(0);
    /// The expression is the target of an assignment, so a reference is wanted.
    pub const IS_REF: Self = Self(1);
    /// Identifiers are waittill parameters and must be bound from the notify payload.
    pub const WAITTILL: Self = Self(2);
    pub const THREADED: Self = Self(4);
    pub const HAS_CALLER: Self = Self(8);
    /// The result is discarded after evaluation.
    pub const DEC_TOP: Self = Self(16);
    pub const IS_POINTER: Self = Self(32);

    pub fn has(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

fn lookup<T: Copy>(table: &[(&'static str, T)], name: &str) -> Option<T> {
    let name = UniCase::new(name);
    table.iter().find(|(key, _)| UniCase::new(*key) == name).map(|(_, value)| *value)
}

/// How a builtin object name is pushed onto the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinObject {
    Op(ScriptOpCode),
    /// Pushed as the integer constant `1`.
    True,
    /// Resolved through the global objects table (newer VM only).
    Global,
}

const T7_OBJECTS: &[(&str, BuiltinObject)] = &[
    ("undefined_obj", BuiltinObject::Op(ScriptOpCode::GetUndefined)),
    ("true_obj", BuiltinObject::True),
    ("false_obj", BuiltinObject::Op(ScriptOpCode::GetZero)),
    ("self_obj", BuiltinObject::Op(ScriptOpCode::GetSelf)),
    ("self_ref", BuiltinObject::Op(ScriptOpCode::GetSelfObject)),
    ("level_obj", BuiltinObject::Op(ScriptOpCode::GetLevel)),
    ("level_ref", BuiltinObject::Op(ScriptOpCode::GetLevelObject)),
    ("game_obj", BuiltinObject::Op(ScriptOpCode::GetGame)),
    ("game_ref", BuiltinObject::Op(ScriptOpCode::GetGameRef)),
    ("anim_ref", BuiltinObject::Op(ScriptOpCode::GetAnimObject)),
    ("world_ref", BuiltinObject::Op(ScriptOpCode::GetWorldObject)),
];
const T8_OBJECTS: &[(&str, BuiltinObject)] = &[
    ("undefined_obj", BuiltinObject::Op(ScriptOpCode::GetUndefined)),
    ("true_obj", BuiltinObject::True),
    ("false_obj", BuiltinObject::Op(ScriptOpCode::GetZero)),
    ("self_obj", BuiltinObject::Op(ScriptOpCode::GetSelf)),
    ("self_ref", BuiltinObject::Op(ScriptOpCode::GetSelfObject)),
];
const T8_GLOBAL_OBJECTS: &[&str] = &["world", "mission", "level", "game", "anim", "classes", "structs"];

/// Resolves a builtin object name such as `self` or `level`.
///
/// `is_ref` selects the reference form used as the base of a field access.
/// Objects that only have one form (like `anim`, which is only ever a field base) resolve to [`None`] in the other.
pub fn builtin_object(vm: VmRevision, name: &str, is_ref: bool) -> Option<BuiltinObject> {
    let table = match vm { VmRevision::T7 => T7_OBJECTS, VmRevision::Vm36 => T8_OBJECTS };
    let tagged = format!("{name}{}", if is_ref { "_ref" } else { "_obj" });
    lookup(table, &tagged).or_else(|| match vm {
        VmRevision::Vm36 if T8_GLOBAL_OBJECTS.iter().any(|x| UniCase::new(*x) == UniCase::new(name)) => Some(BuiltinObject::Global),
        _ => None,
    })
}

const T7_CALLS: &[(&str, ScriptOpCode)] = &[
    ("realwait", ScriptOpCode::RealWait),
    ("isdefined", ScriptOpCode::IsDefined),
    ("vectorscale", ScriptOpCode::VectorScale),
    ("gettime", ScriptOpCode::GetTime),
    ("firstarraykey", ScriptOpCode::FirstArrayKey),
    ("nextarraykey", ScriptOpCode::NextArrayKey),
    ("getfirstarraykey", ScriptOpCode::FirstArrayKey),
    ("getnextarraykey", ScriptOpCode::NextArrayKey),
    ("waitrealtime", ScriptOpCode::WaitRealTime),
];
const T8_CALLS: &[(&str, ScriptOpCode)] = &[
    ("realwait", ScriptOpCode::RealWait),
    ("isdefined", ScriptOpCode::IsDefined),
    ("vectorscale", ScriptOpCode::VectorScale),
    ("gettime", ScriptOpCode::GetTime),
    ("waitframe", ScriptOpCode::WaitRealTime),
    ("waittillframeend", ScriptOpCode::WaitTillFrameEnd),
];

/// Looks up a function that the VM implements as a dedicated operation rather than an import.
pub fn builtin_call(vm: VmRevision, name: &str) -> Option<ScriptOpCode> {
    lookup(match vm { VmRevision::T7 => T7_CALLS, VmRevision::Vm36 => T8_CALLS }, name)
}

const T7_NOTIFIERS: &[(&str, ScriptOpCode)] = &[
    ("notify", ScriptOpCode::Notify),
    ("endon", ScriptOpCode::EndOn),
    ("waittillmatch", ScriptOpCode::WaitTill),
    ("waittill", ScriptOpCode::WaitTill),
];
const T8_NOTIFIERS: &[(&str, ScriptOpCode)] = &[
    ("notify", ScriptOpCode::Notify),
    ("endon", ScriptOpCode::EndOn),
    ("waittill_match", ScriptOpCode::WaitTillMatch),
    ("waittill", ScriptOpCode::WaitTill),
    ("endon_callback", ScriptOpCode::EndOnCallback),
    ("waittill_timeout", ScriptOpCode::WaittillTimeout),
];

/// Looks up one of the event methods (`notify`, `endon`, `waittill`, ...).
pub fn notifier(vm: VmRevision, name: &str) -> Option<ScriptOpCode> {
    lookup(match vm { VmRevision::T7 => T7_NOTIFIERS, VmRevision::Vm36 => T8_NOTIFIERS }, name)
}

const MATH_TOKENS: &[(&str, ScriptOpCode)] = &[
    ("+", ScriptOpCode::Plus),
    ("-", ScriptOpCode::Minus),
    ("*", ScriptOpCode::Multiply),
    ("/", ScriptOpCode::Divide),
    ("%", ScriptOpCode::Modulus),
    ("&", ScriptOpCode::Bit_And),
    ("|", ScriptOpCode::Bit_Or),
    ("^", ScriptOpCode::Bit_Xor),
    ("<<", ScriptOpCode::ShiftLeft),
    (">>", ScriptOpCode::ShiftRight),
];
const COMPARE_TOKENS: &[(&str, ScriptOpCode)] = &[
    (">", ScriptOpCode::GreaterThan),
    (">=", ScriptOpCode::GreaterThanOrEqualTo),
    ("<", ScriptOpCode::LessThan),
    ("<=", ScriptOpCode::LessThanOrEqualTo),
    ("==", ScriptOpCode::Equal),
    ("!=", ScriptOpCode::NotEqual),
    ("===", ScriptOpCode::SuperEqual),
    ("!==", ScriptOpCode::SuperNotEqual),
    ("!===", ScriptOpCode::SuperNotEqual),
];

/// Maps an arithmetic or bitwise operator token onto its operation.
pub fn math_op(token: &str) -> Option<ScriptOpCode> {
    lookup(MATH_TOKENS, token)
}
/// Maps a relational operator token onto its operation.
pub fn compare_op(token: &str) -> Option<ScriptOpCode> {
    lookup(COMPARE_TOKENS, token)
}

const DEV_FUNCTIONS: &[&str] = &[
    "print", "print3d", "line", "debugstar", "sphere", "box", "circle", "assert", "assertmsg", "play",
    "printtoprightln", "record3dtext", "sphericalcone", "errormsg", "recordline", "adddebugcommand", "debug",
    "execdevgui", "println", "fprintln", "createprintchannel", "getdebugeye", "setprintchannel", "logprint", "recordsphere",
];

/// Checks if `name` is a developer-only engine function.
pub fn is_dev_function(name: &str) -> bool {
    DEV_FUNCTIONS.iter().any(|x| UniCase::new(*x) == UniCase::new(name))
}

#[test]
fn test_builtin_lookup() {
    assert_eq!(builtin_object(VmRevision::T7, "SELF", false), Some(BuiltinObject::Op(ScriptOpCode::GetSelf)));
    assert_eq!(builtin_object(VmRevision::T7, "self", true), Some(BuiltinObject::Op(ScriptOpCode::GetSelfObject)));
    assert_eq!(builtin_object(VmRevision::T7, "anim", true), Some(BuiltinObject::Op(ScriptOpCode::GetAnimObject)));
    assert_eq!(builtin_object(VmRevision::T7, "anim", false), None);
    assert_eq!(builtin_object(VmRevision::T7, "true", false), Some(BuiltinObject::True));
    assert_eq!(builtin_object(VmRevision::T7, "true", true), None);
    assert_eq!(builtin_object(VmRevision::T7, "mission", false), None);
    assert_eq!(builtin_object(VmRevision::Vm36, "level", true), Some(BuiltinObject::Global));
    assert_eq!(builtin_object(VmRevision::Vm36, "mission", false), Some(BuiltinObject::Global));
    assert_eq!(builtin_object(VmRevision::Vm36, "player", false), None);

    assert_eq!(builtin_call(VmRevision::T7, "IsDefined"), Some(ScriptOpCode::IsDefined));
    assert_eq!(builtin_call(VmRevision::T7, "waitframe"), None);
    assert_eq!(builtin_call(VmRevision::Vm36, "waitframe"), Some(ScriptOpCode::WaitRealTime));
    assert_eq!(notifier(VmRevision::T7, "waittill_match"), None);
    assert_eq!(notifier(VmRevision::Vm36, "waittill_match"), Some(ScriptOpCode::WaitTillMatch));

    assert_eq!(math_op("<<"), Some(ScriptOpCode::ShiftLeft));
    assert_eq!(math_op("&&"), None);
    assert_eq!(compare_op("!=="), Some(ScriptOpCode::SuperNotEqual));
    assert!(is_dev_function("PrintLn"));
    assert!(!is_dev_function("spawn"));
}

#[test]
fn test_context_flags() {
    let ctx = Context::HAS_CALLER.with(Context::THREADED);
    assert!(ctx.has(Context::HAS_CALLER));
    assert!(ctx.has(Context::THREADED));
    assert!(!ctx.has(Context::IS_REF));
    assert!(!ctx.without(Context::THREADED).has(Context::THREADED));
    assert!(ctx.has(Context::NONE));
}
