//! The script object that owns one compilation unit, and the image it commits to.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use compact_str::CompactString;
use monostate::MustBeU128;
use serde::Serialize;
use tracing::debug;

use crate::*;
use crate::meta::*;
use crate::arena::Chain;
use crate::function::{Function, FunctionKey, FunctionLayout};
use crate::section::{ScriptHeader, SectionContents, SectionKind, SectionRecord, SectionWriter};
use crate::table::ScriptTables;
use crate::util::ByteWriter;
use crate::vm::{Target, VmRevision};

/// The namespace of scripts that do not declare one.
pub const DEFAULT_NAMESPACE: &str = "ilcustom";

/// A single compilation unit: its functions, includes and cross-reference tables.
///
/// Functions are built with the [`Function`] emission API and then added with [`ScriptObject::add_function`].
/// Once everything is added, [`ScriptObject::compile`] lays out and serializes the image.
pub struct ScriptObject {
    settings: CompileSettings,
    namespace: u32,
    functions: Chain<FunctionKey, Function>,
    includes: Vec<CompactString>,
    tables: ScriptTables,
    hashes: BTreeMap<u64, CompactString>,
}
impl ScriptObject {
    pub fn new(settings: CompileSettings) -> Self {
        let mut res = Self {
            settings, namespace: 0,
            functions: Chain::new(),
            includes: vec![],
            tables: Default::default(),
            hashes: Default::default(),
        };
        res.namespace = res.hash_name(DEFAULT_NAMESPACE);
        res
    }
    pub fn settings(&self) -> &CompileSettings {
        &self.settings
    }
    pub fn target(&self) -> Target {
        self.settings.target
    }

    /// Hashes an identifier with the 32-bit hash of the target VM and remembers its text.
    /// Identifiers like `func_1234abcd` are taken as the literal hash they spell out, which must fit in 32 bits.
    pub fn hash(&mut self, name: &str) -> Result<u32, CompileError> {
        match hash::parse_hash_literal(name, self.settings.target.vm) {
            Some(value) => u32::try_from(value).map_err(|_| CompileError::BadHash { text: name.into() }),
            None => Ok(self.hash_name(name)),
        }
    }
    /// Hashes an identifier with the 64-bit hash of the newer VM (the legacy VM zero-extends its 32-bit hash).
    pub fn hash64(&mut self, name: &str) -> Result<u64, CompileError> {
        let vm = self.settings.target.vm;
        if let Some(value) = hash::parse_hash_literal(name, vm) {
            if vm == VmRevision::T7 && value > u32::MAX as u64 {
                return Err(CompileError::BadHash { text: name.into() });
            }
            return Ok(value);
        }
        Ok(match vm {
            VmRevision::T7 => self.hash_name(name) as u64,
            VmRevision::Vm36 => {
                let value = hash::t8_hash64(name);
                self.hashes.entry(value).or_insert_with(|| name.to_ascii_lowercase().into());
                value
            }
        })
    }
    fn hash_name(&mut self, name: &str) -> u32 {
        let value = match self.settings.target.vm {
            VmRevision::T7 => hash::hash32(name),
            VmRevision::Vm36 => hash::t8_hash32(name),
        };
        self.hashes.entry(value as u64).or_insert_with(|| name.to_ascii_lowercase().into());
        value
    }
    /// Every identifier hashed so far, keyed by its hash.
    pub fn hashes(&self) -> &BTreeMap<u64, CompactString> {
        &self.hashes
    }

    pub fn namespace(&self) -> u32 {
        self.namespace
    }
    pub fn set_namespace(&mut self, name: &str) -> Result<(), CompileError> {
        self.namespace = self.hash(name)?;
        Ok(())
    }

    /// Adds an include path (normalized to lowercase with forward slashes).
    /// Returns `false` if the script already included it.
    pub fn add_include(&mut self, path: &str) -> bool {
        let path = normalize_include(path);
        if self.includes.contains(&path) { return false }
        self.includes.push(path);
        true
    }
    /// Removes an include path. Returns `false` if it was not included.
    pub fn remove_include(&mut self, path: &str) -> bool {
        let path = normalize_include(path);
        let len = self.includes.len();
        self.includes.retain(|x| *x != path);
        self.includes.len() != len
    }
    pub fn includes(&self) -> &[CompactString] {
        &self.includes
    }

    /// Adds a finished function to the export chain.
    /// Fails if a function with the same name and namespace was already added.
    pub fn add_function(&mut self, function: Function) -> Result<FunctionKey, CompileError> {
        if self.find_function(function.hash, function.namespace).is_some() {
            return Err(CompileError::DuplicateFunction { name: function.name });
        }
        Ok(self.functions.push_back(function))
    }
    /// Unlinks a function from the export chain.
    /// Table entries it referenced stay in the tables, but entries that end up without references emit no rows.
    pub fn remove_function(&mut self, key: FunctionKey) -> Result<Function, CompileError> {
        self.functions.remove(key).ok_or(CompileError::UnknownFunction)
    }
    pub fn find_function(&self, hash: u32, namespace: u32) -> Option<FunctionKey> {
        self.functions.iter().find(|(_, f)| f.hash == hash && f.namespace == namespace).map(|(k, _)| k)
    }
    pub fn function(&self, key: FunctionKey) -> Option<&Function> {
        self.functions.get(key)
    }
    pub fn function_mut(&mut self, key: FunctionKey) -> Option<&mut Function> {
        self.functions.get_mut(key)
    }
    /// Iterates over the functions in export order.
    pub fn functions(&self) -> impl Iterator<Item = (FunctionKey, &Function)> + '_ {
        self.functions.iter()
    }

    pub fn tables(&self) -> &ScriptTables {
        &self.tables
    }
    pub fn tables_mut(&mut self) -> &mut ScriptTables {
        &mut self.tables
    }

    /// Lays out and serializes the whole image.
    ///
    /// The script is consumed, so a failed compilation can never be committed again or produce partial output.
    pub fn compile(mut self) -> Result<CompiledScript, CompileError> {
        let start = Instant::now();
        let target = self.settings.target;
        self.tables.clear_refs();

        let script_name = self.settings.script_name.clone();
        let name_hash = self.hash64(&script_name)?;
        let header = ScriptHeader {
            checksum: self.settings.source_checksum.unwrap_or(target.default_checksum()),
            name_hash,
            ..Default::default()
        };
        let mut sections = SectionWriter {
            target,
            script_name: &self.settings.script_name,
            includes: &self.includes,
            functions: &mut self.functions,
            tables: &mut self.tables,
            header,
            writer: ByteWriter::new(target.endian),
            layouts: vec![],
            records: vec![],
        };
        sections.commit()?;
        let SectionWriter { header, writer, layouts, records, .. } = sections;

        debug!(
            functions = layouts.len(),
            strings = self.tables.strings.len(),
            imports = self.tables.imports.len(),
            globals = self.tables.globals.len(),
            size = writer.len(),
            "compiled script"
        );

        Ok(CompiledScript {
            target, header, layouts, records,
            script_name,
            includes: self.includes,
            image: writer.into_inner(),
            tables: self.tables,
            hashes: self.hashes,
            commit_time: start.elapsed(),
        })
    }
}

fn normalize_include(path: &str) -> CompactString {
    path.to_ascii_lowercase().replace('\\', "/").into()
}

/// The output of [`ScriptObject::compile`]: the image plus everything needed to inspect it.
pub struct CompiledScript {
    pub target: Target,
    pub script_name: CompactString,
    pub includes: Vec<CompactString>,
    pub image: Vec<u8>,
    pub header: ScriptHeader,
    /// Where each function ended up, in export order.
    pub layouts: Vec<FunctionLayout>,
    /// Where each section ended up, in commit order.
    pub records: Vec<SectionRecord>,
    /// The tables with every reference recorded during layout.
    pub tables: ScriptTables,
    pub hashes: BTreeMap<u64, CompactString>,
    /// Time spent laying out and serializing the image.
    pub commit_time: Duration,
}
impl CompiledScript {
    pub fn section(&self, kind: SectionKind) -> Option<&SectionRecord> {
        self.records.iter().find(|x| x.kind == kind)
    }
    /// Recomputes the size of a committed section from the tables and header alone.
    pub fn section_size(&self, kind: SectionKind) -> Option<u32> {
        let record = self.section(kind)?;
        let contents = SectionContents { target: self.target, script_name: &self.script_name, includes: &self.includes, tables: &self.tables, header: &self.header };
        Some(contents.size(kind, record.base))
    }
    pub fn function(&self, name: &str) -> Option<&FunctionLayout> {
        self.layouts.iter().find(|x| x.name.eq_ignore_ascii_case(name))
    }
    /// The hash map sidecar, which maps every hash in the image back to the identifier it came from.
    pub fn hash_map(&self) -> HashMapFile {
        HashMapFile {
            tag: Default::default(),
            hashes: self.hashes.iter().map(|(k, v)| (format!("{k:x}").into(), v.clone())).collect(),
        }
    }
}

/// The serialized form of [`CompiledScript::hash_map`], tagged with the build that produced it.
#[derive(Debug, Serialize)]
pub struct HashMapFile {
    #[allow(dead_code)] tag: MustBeU128<FINGERPRINT>,

    pub hashes: BTreeMap<CompactString, CompactString>,
}

#[test]
fn test_script_functions() {
    let mut script = ScriptObject::new(CompileSettings::default());
    assert_eq!(script.namespace(), hash::hash32("ilcustom"));
    let ns = script.namespace();

    let main = script.hash("main").unwrap();
    let key = script.add_function(Function::new(script.target(), "main".into(), main, ns, 0, 0)).unwrap();
    match script.add_function(Function::new(script.target(), "MAIN".into(), main, ns, 0, 0)) {
        Err(CompileError::DuplicateFunction { name }) => assert_eq!(name, "MAIN"),
        x => panic!("{:?}", x.err()),
    }
    assert!(script.add_function(Function::new(script.target(), "main".into(), main, ns + 1, 0, 0)).is_ok());
    assert_eq!(script.find_function(main, ns), Some(key));
    assert_eq!(script.remove_function(key).unwrap().name, "main");
    assert!(matches!(script.remove_function(key), Err(CompileError::UnknownFunction)));
    assert_eq!(script.functions().count(), 1);

    assert!(script.add_include("Scripts\\Shared\\Util"));
    assert!(!script.add_include("scripts/shared/util"));
    assert_eq!(script.includes(), ["scripts/shared/util"]);
    assert!(script.remove_include("SCRIPTS/shared/util"));
    assert!(!script.remove_include("scripts/shared/util"));
}

#[test]
fn test_script_hashes() {
    let mut script = ScriptObject::new(CompileSettings::default());
    assert_eq!(script.hash("Foo").unwrap(), hash::hash32("foo"));
    assert_eq!(script.hash("func_deadbeef").unwrap(), 0xdeadbeef);
    assert!(matches!(script.hash("func_123456789a"), Err(CompileError::BadHash { text }) if text == "func_123456789a"));
    assert!(matches!(script.hash64("hash_123456789a"), Err(CompileError::BadHash { .. })));
    assert!(matches!(script.set_namespace("namespace_1deadbeef"), Err(CompileError::BadHash { .. })));
    assert_eq!(script.namespace(), hash::hash32("ilcustom"));
    assert_eq!(script.hashes().get(&(hash::hash32("foo") as u64)).map(|x| x.as_str()), Some("foo"));
    assert!(!script.hashes().contains_key(&0xdeadbeef));

    let mut script = ScriptObject::new(CompileSettings { target: Target::t8(), ..Default::default() });
    assert_eq!(script.hash("foo").unwrap(), hash::t8_hash32("foo"));
    assert_eq!(script.hash64("scripts/a.gsc").unwrap(), hash::t8_hash64("scripts/a.gsc"));
    assert_eq!(script.hash64("script_1234").unwrap(), 0x1234);
    assert_eq!(script.hash64("hash_123456789a").unwrap(), 0x123456789a);
    assert!(matches!(script.hash("func_123456789a"), Err(CompileError::BadHash { .. })));
}

#[test]
fn test_hash_map_sidecar() {
    let mut script = ScriptObject::new(CompileSettings::default());
    script.hash("player").unwrap();
    let compiled = script.compile().unwrap();
    let sidecar = compiled.hash_map();
    assert_eq!(sidecar.hashes.get(&CompactString::from(format!("{:x}", hash::hash32("player")))).map(|x| x.as_str()), Some("player"));

    let json = serde_json::to_string(&sidecar).unwrap();
    assert!(json.starts_with(&format!("{{\"tag\":{FINGERPRINT},")));
    assert!(json.contains(&format!("\"{:x}\":\"player\"", hash::hash32("player"))));
}
