//! A bytecode assembly backend for GSC scripts.
//!
//! Syntax trees produced by an external parser ([`ast::Node`]) are lowered into per-function instruction chains
//! ([`lower`]), which are then laid out together with the script's cross-reference tables into a single binary
//! image ([`script::ScriptObject::compile`]).

#![forbid(unsafe_code)]

#[macro_use] pub mod arena;

pub mod vm;
pub mod util;
pub mod hash;
pub mod opcode;
pub mod error;
pub mod table;
pub mod instruction;
pub mod function;
pub mod section;
pub mod script;
pub mod ast;
pub mod lower;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod test;

mod meta {
    include!(concat!(env!("OUT_DIR"), "/meta.rs"));
}

pub use error::CompileError;

use compact_str::CompactString;

use crate::vm::Target;

/// Settings for compiling a single script.
#[derive(Debug, Clone)]
pub struct CompileSettings {
    /// The VM and byte order of the produced image.
    pub target: Target,
    /// The script path stored in the image, such as `scripts/shared/util.gsc`.
    pub script_name: CompactString,
    /// Checksum of the source text. If absent, the well-known checksum of the target is used.
    pub source_checksum: Option<u32>,
    /// Marks calls to developer-only engine functions as debug imports (legacy VM only).
    pub flag_dev_calls: bool,
}
impl Default for CompileSettings {
    fn default() -> Self {
        Self {
            target: Target::t7_pc(),
            script_name: "scripts/custom/main.gsc".into(),
            source_checksum: None,
            flag_dev_calls: false,
        }
    }
}
