use crate::*;
use crate::ast::{Literal, Node};
use crate::lower::compile_tree;
use crate::opcode::ScriptOpCode;
use crate::script::CompiledScript;
use crate::function::FunctionLayout;
use crate::table::TableKind;
use crate::vm::Target;

mod lowering;
mod image;

fn id(name: &str) -> Node {
    Node::token("identifier", name)
}
fn num(value: i64) -> Node {
    Node::new("numberLiteral", vec![]).with_value(Literal::Int(value))
}
fn string(text: &str) -> Node {
    Node::token("stringLiteral", text)
}
fn block(stmts: Vec<Node>) -> Node {
    Node::new("block", stmts)
}
fn ret(expr: Node) -> Node {
    Node::new("return", vec![expr])
}
fn wait(expr: Node) -> Node {
    Node::new("wait", vec![expr])
}
fn assign(target: Node, value: Node) -> Node {
    Node::new("setVariableField", vec![target, value]).with_text("=")
}
fn call(name: &str, args: Vec<Node>) -> Node {
    Node::new("call", vec![Node::new("arguments", args)]).with_text(name)
}
fn stmt_call(name: &str, args: Vec<Node>) -> Node {
    Node::new("simpleCall", vec![call(name, args)])
}
fn function(name: &str, params: &[&str], body: Vec<Node>) -> Node {
    let params = params.iter().map(|x| Node::token("parameter", x)).collect();
    Node::new("function", vec![Node::new("parameters", params), block(body)]).with_text(name)
}
fn script(items: Vec<Node>) -> Node {
    Node::new("script", items)
}

fn compile(target: Target, tree: &Node) -> CompiledScript {
    compile_tree(CompileSettings { target, ..Default::default() }, tree).unwrap()
}
fn ops(layout: &FunctionLayout) -> Vec<ScriptOpCode> {
    layout.instructions.iter().map(|x| x.op).collect()
}

/// Checks that every section starts where the previous one ended and ends on a 16 byte boundary.
fn assert_sections_aligned(compiled: &CompiledScript) {
    let mut pos = 0;
    for record in compiled.records.iter() {
        assert_eq!(record.base, pos, "{:?} does not follow the previous section", record.kind);
        assert_eq!((record.base + record.size) % 16, 0, "{:?} is not padded", record.kind);
        pos += record.size;
    }
    assert_eq!(pos as usize, compiled.image.len());
}

/// Checks that every section has exactly the size its contents call for.
fn assert_section_sizes(compiled: &CompiledScript) {
    for record in compiled.records.iter() {
        assert_eq!(compiled.section_size(record.kind), Some(record.size), "{:?} size on {:?}", record.kind, compiled.target);
    }
}

/// Checks that the displacement bytes of every jump decode to the recorded landing address.
fn assert_jumps_resolved(compiled: &CompiledScript) {
    let target = compiled.target;
    for layout in compiled.layouts.iter() {
        for jump in layout.jumps.iter() {
            let data = util::align(jump.address + target.op_width(), 2);
            let displacement = util::read_u16(&compiled.image, data as usize, target.endian) as i16;
            assert_eq!(jump.from as i64 + displacement as i64, jump.to as i64, "jump at {:#x} in {}", jump.address, layout.name);
            assert!(jump.to >= layout.address && jump.to <= layout.address + layout.size);
            assert!(jump.to == layout.address + layout.size || layout.instructions.iter().any(|x| x.address == jump.to));
        }
    }
}

/// Checks that every operand reference made by a function was recorded exactly once in its table entry.
fn assert_refs_complete(compiled: &CompiledScript) {
    let tables = &compiled.tables;
    for layout in compiled.layouts.iter() {
        for r in layout.refs.iter() {
            let refs = match r.table {
                TableKind::Strings => &tables.strings.entries().nth(r.entry).unwrap().refs,
                TableKind::Imports => &tables.imports.entries().nth(r.entry).unwrap().refs,
                TableKind::Globals => &tables.globals.entries().nth(r.entry).unwrap().refs,
                TableKind::Debug => &tables.debug.entries().nth(r.entry).unwrap().refs,
            };
            assert_eq!(refs.iter().filter(|&&x| x == r.address).count(), 1, "{r:?}");
        }
    }
    let total = tables.strings.ref_count() + tables.imports.ref_count() + tables.globals.ref_count() + tables.debug.ref_count();
    assert_eq!(total, compiled.layouts.iter().map(|x| x.refs.len()).sum::<usize>());
}

/// Checks the stamped CRC of every export against a recomputation over its committed bytes.
fn assert_crcs(compiled: &CompiledScript) {
    let target = compiled.target;
    for (i, layout) in compiled.layouts.iter().enumerate() {
        let range = layout.address as usize..(layout.address + layout.size) as usize;
        assert_eq!(hash::crc32(&compiled.image[range]), layout.crc);
        let entry = compiled.header.export_offset + i as u32 * target.export_entry_size();
        assert_eq!(util::read_u32(&compiled.image, entry as usize, target.endian), layout.crc);
        assert_eq!(util::read_u32(&compiled.image, entry as usize + 4, target.endian), layout.address);
    }
}

fn assert_image_consistent(compiled: &CompiledScript) {
    assert_sections_aligned(compiled);
    assert_section_sizes(compiled);
    assert_jumps_resolved(compiled);
    assert_refs_complete(compiled);
    assert_crcs(compiled);
}
