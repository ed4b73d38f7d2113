use std::fmt;

use compact_str::CompactString;

/// An error produced while lowering a syntax tree or committing a script image.
///
/// A failed compilation never produces partial output.
#[derive(Debug)]
pub enum CompileError {
    /// The node kind is not handled by the lowering engine.
    UnsupportedNode { kind: CompactString },
    /// An operator token that has no corresponding operation.
    UnknownOperator { op: CompactString },
    /// A local variable was referenced but never declared in the enclosing function.
    UnknownVariable { name: CompactString, function: CompactString },
    /// A dedicated builtin operation was requested for an unknown name.
    UnknownBuiltin { name: CompactString },
    /// Two functions with the same name were added to a script.
    DuplicateFunction { name: CompactString },
    /// The function key does not refer to a function of this script.
    UnknownFunction,
    /// A jump was still missing its target when the function was laid out.
    UnresolvedJump { function: CompactString },
    /// A synthetic loop or switch variable was requested but none was collected for it.
    UnbalancedSyntheticLocals { what: &'static str },
    /// A node had the right kind but the wrong shape.
    MalformedNode { kind: CompactString, reason: &'static str },
    /// A hash literal did not contain a valid hex value.
    BadHash { text: CompactString },
    /// A number literal could not be represented.
    BadNumber { text: CompactString },
    /// A count exceeded what the image format can encode.
    CapacityExceeded { what: &'static str, count: usize, limit: usize },
    /// A jump displacement does not fit in 16 bits.
    JumpOutOfRange { function: CompactString, displacement: i64 },
    /// The syntax tree could not be read.
    BadTree { error: serde_json::Error },
}
impl From<serde_json::Error> for CompileError { fn from(error: serde_json::Error) -> Self { Self::BadTree { error } } }

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnsupportedNode { kind } => write!(f, "unsupported node kind '{kind}'"),
            Self::UnknownOperator { op } => write!(f, "unknown operator '{op}'"),
            Self::UnknownVariable { name, function } => write!(f, "unknown variable '{name}' in function '{function}'"),
            Self::UnknownBuiltin { name } => write!(f, "'{name}' is not a builtin"),
            Self::DuplicateFunction { name } => write!(f, "function '{name}' is defined more than once"),
            Self::UnknownFunction => write!(f, "function does not belong to this script"),
            Self::UnresolvedJump { function } => write!(f, "unresolved jump target in function '{function}'"),
            Self::UnbalancedSyntheticLocals { what } => write!(f, "no synthetic {what} variable is available"),
            Self::MalformedNode { kind, reason } => write!(f, "malformed '{kind}' node: {reason}"),
            Self::BadHash { text } => write!(f, "'{text}' is not a hash value"),
            Self::BadNumber { text } => write!(f, "'{text}' is not a valid number"),
            Self::CapacityExceeded { what, count, limit } => write!(f, "too many {what}: {count} (the limit is {limit})"),
            Self::JumpOutOfRange { function, displacement } => write!(f, "jump of {displacement} bytes in function '{function}' does not fit in 16 bits"),
            Self::BadTree { error } => write!(f, "failed to read syntax tree: {error}"),
        }
    }
}
impl std::error::Error for CompileError {}

/// Fails with [`CompileError::CapacityExceeded`] if `count` is larger than `limit`.
pub fn check_capacity(what: &'static str, count: usize, limit: usize) -> Result<(), CompileError> {
    if count > limit { return Err(CompileError::CapacityExceeded { what, count, limit }) }
    Ok(())
}

#[test]
fn test_error_messages() {
    let err = CompileError::UnknownVariable { name: "x".into(), function: "main".into() };
    assert_eq!(err.to_string(), "unknown variable 'x' in function 'main'");
    assert!(check_capacity("locals", 255, 255).is_ok());
    match check_capacity("locals", 256, 255) {
        Err(CompileError::CapacityExceeded { what: "locals", count: 256, limit: 255 }) => (),
        x => panic!("{x:?}"),
    }
}
