use crate::lower::build_script;
use crate::opcode::{export_flags, import_flags};

use super::*;

#[test]
fn test_isdefined_scenario() {
    use ScriptOpCode::*;

    let tree = Node::from_json(include_str!("trees/isdefined.json")).unwrap();
    let compiled = compile(Target::t7_pc(), &tree);
    assert_eq!(compiled.header.export_count, 1);
    assert_eq!(compiled.layouts.len(), 1);

    let f = compiled.function("f").unwrap();
    assert_eq!(ops(f), [SafeCreateLocalVariables, EvalLocalVariableCached, IsDefined, JumpOnFalse, EvalLocalVariableCached, Return, GetZero, Return, End]);
    assert_eq!(f.jumps.len(), 1);
    assert_eq!(f.jumps[0].to, f.instructions[6].address);
    assert_eq!(f.hash, hash::hash32("f"));
    assert_eq!(f.params, 1);
    assert_image_consistent(&compiled);

    let tree = script(vec![function("f", &["a"], vec![
        Node::new("ifStatement", vec![call("isdefined", vec![id("a")]), ret(id("a")), ret(num(0))]),
    ])]);
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        let compiled = compile(target, &tree);
        let f = compiled.function("f").unwrap();
        assert_eq!(f.jumps.len(), 2);
        assert_image_consistent(&compiled);
    }
}

#[test]
fn test_mixed_script() {
    let tree = Node::from_json(include_str!("trees/mixed.json")).unwrap();
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        let compiled = compile(target, &tree);
        assert_image_consistent(&compiled);
        assert_eq!(compiled.header.export_count, 2);
        assert_eq!(compiled.header.include_count, 1);

        let helper = compiled.function("helper").unwrap();
        assert_eq!(helper.flags, export_flags::AUTOEXEC);
        assert_eq!(helper.params, 2);

        let hello = compiled.tables.strings.entries().find(|x| x.value == "hello").unwrap();
        assert_eq!(hello.refs.len(), 2);
        assert_eq!(compiled.tables.strings.len(), 2);
        assert_eq!(compiled.tables.imports.len(), 3);

        let main = compiled.function("main").unwrap();
        let waits = main.instructions.iter().filter(|x| x.op == ScriptOpCode::GetFloat).count();
        assert_eq!(waits, 1);
        assert!(main.instructions.iter().any(|x| x.op == ScriptOpCode::GetUnsignedShort));
        assert!(main.instructions.iter().any(|x| x.op == ScriptOpCode::ScriptMethodCall));
        assert!(main.instructions.iter().any(|x| x.op == ScriptOpCode::Notify));

        match target.is_t7() {
            true => assert!(compiled.tables.globals.is_empty()),
            false => {
                let level = compiled.tables.globals.entries().next().unwrap();
                assert_eq!(level.value, hash::t8_hash32("level"));
                assert_eq!(level.refs.len(), 2);
                assert_eq!(compiled.header.global_count, 1);
            }
        }
    }
}

#[test]
fn test_namespaced_imports() {
    let tree = Node::from_json(include_str!("trees/mixed.json")).unwrap();
    let compiled = compile(Target::t7_pc(), &tree);
    let sys = hash::hash32("sys");

    let imports: Vec<_> = compiled.tables.imports.entries().map(|x| x.value).collect();
    let helper = imports.iter().find(|x| x.function == hash::hash32("helper")).unwrap();
    assert_eq!(helper.namespace, sys);
    assert_eq!(helper.params, 2);
    assert_eq!(helper.flags, import_flags::IS_METHOD | import_flags::NEEDS_RESOLVER);

    let println = imports.iter().find(|x| x.function == hash::hash32("println")).unwrap();
    assert_eq!(println.flags, import_flags::IS_FUNCTION | import_flags::NEEDS_RESOLVER);

    let main = imports.iter().find(|x| x.function == hash::hash32("main")).unwrap();
    assert_eq!(main.params, 0);
    assert_eq!(main.flags, import_flags::IS_REF | import_flags::NEEDS_RESOLVER);

    let tree = script(vec![function("main", &[], vec![
        Node::new("simpleCall", vec![Node::new("call", vec![Node::new("arguments", vec![]), Node::token("namespace", "other")]).with_text("foo")]),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let foo = compiled.tables.imports.entries().next().unwrap().value;
    assert_eq!(foo.namespace, hash::hash32("other"));
    assert_eq!(foo.flags, import_flags::IS_FUNCTION);
}

#[test]
fn test_dev_calls() {
    let tree = script(vec![function("main", &[], vec![stmt_call("println", vec![string("x")])])]);
    let settings = CompileSettings { flag_dev_calls: true, ..Default::default() };
    let compiled = compile_tree(settings, &tree).unwrap();
    let println = compiled.tables.imports.entries().next().unwrap().value;
    assert_eq!(println.flags, import_flags::IS_FUNCTION | import_flags::NEEDS_RESOLVER | import_flags::IS_DEBUG);

    let compiled = compile(Target::t7_pc(), &tree);
    let println = compiled.tables.imports.entries().next().unwrap().value;
    assert_eq!(println.flags & import_flags::IS_DEBUG, 0);
}

#[test]
fn test_optional_params() {
    use ScriptOpCode::*;

    let param = Node::new("parameter", vec![num(5)]).with_text("a");
    let tree = script(vec![Node::new("function", vec![Node::new("parameters", vec![param]), block(vec![])]).with_text("f")]);

    let compiled = compile(Target::t7_pc(), &tree);
    let f = compiled.function("f").unwrap();
    assert_eq!(ops(f), [SafeCreateLocalVariables, EvalLocalVariableCached, IsDefined, JumpOnTrue, GetByte, EvalLocalVariableRefCached, SetVariableField, End]);
    assert_eq!(f.jumps[0].to, f.instructions[7].address);

    let compiled = compile(Target::t8(), &tree);
    let f = compiled.function("f").unwrap();
    assert_eq!(ops(f), [SafeCreateLocalVariables, EvalLocalVariableDefined, JumpOnTrue, GetByte, SetLocalVariableCached, End]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_while_continue() {
    use ScriptOpCode::*;

    let tree = script(vec![function("main", &["a"], vec![
        Node::new("whileStatement", vec![id("a"), block(vec![Node::token("jumpStatement", "continue")])]),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [SafeCreateLocalVariables, EvalLocalVariableCached, JumpOnFalse, Jump, Jump, End]);

    let (cond, end) = (main.instructions[1].address, main.instructions[5].address);
    let targets: Vec<_> = main.jumps.iter().map(|x| x.to).collect();
    assert_eq!(targets, [end, cond, cond]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_nested_break() {
    let inner = Node::new("whileStatement", vec![id("a"), block(vec![Node::token("jumpStatement", "break").with_value(Literal::Int(2))])]);
    let tree = script(vec![function("main", &["a"], vec![
        Node::new("whileStatement", vec![id("a"), block(vec![inner])]),
        wait(num(1)),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    let wait = main.instructions.iter().find(|x| x.op == ScriptOpCode::GetByte).unwrap();
    assert_eq!(main.jumps.iter().filter(|x| x.to == wait.address).count(), 2);

    let tree = script(vec![function("main", &[], vec![Node::token("jumpStatement", "break")])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::MalformedNode { .. })));
}

#[test]
fn test_for_loop() {
    use ScriptOpCode::*;

    let init = assign(id("i"), num(0));
    let cond = Node::new("relationalExpression", vec![id("i"), num(10)]).with_text("<");
    let iter = Node::new("setVariableField", vec![id("i")]).with_text("++");
    let tree = script(vec![function("main", &[], vec![
        Node::new("forStatement", vec![init, cond, iter, block(vec![Node::token("jumpStatement", "continue")])]),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, GetZero, EvalLocalVariableRefCached, SetVariableField,
        EvalLocalVariableCached, GetByte, LessThan, JumpOnFalse,
        Jump, EvalLocalVariableRefCached, Inc, Jump, End,
    ]);
    let targets: Vec<_> = main.jumps.iter().map(|x| x.to).collect();
    assert_eq!(targets, [main.instructions[12].address, main.instructions[9].address, main.instructions[4].address]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_t7_foreach_double() {
    use ScriptOpCode::*;

    let tree = script(vec![function("main", &["arr"], vec![
        Node::new("foreachDouble", vec![id("k"), id("v"), id("arr"), block(vec![])]),
    ])]);
    let built = build_script(CompileSettings::default(), &tree).unwrap();
    let (_, main) = built.functions().next().unwrap();
    assert_eq!(main.locals().len(), 5);
    assert!(main.has_local(hash::hash32("k")));
    assert!(main.has_local(hash::hash32("v")));

    let compiled = built.compile().unwrap();
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables,
        EvalLocalVariableCached, EvalLocalVariableRefCached, SetVariableField,
        EvalLocalVariableCached, FirstArrayKey, EvalLocalVariableRefCached, SetVariableField,
        EvalLocalVariableCached, IsDefined, JumpOnFalse,
        EvalLocalVariableCached, EvalLocalVariableCached, EvalArray, EvalLocalVariableRefCached, SetVariableField,
        EvalLocalVariableCached, EvalLocalVariableCached, NextArrayKey, EvalLocalVariableRefCached, SetVariableField,
        Jump, End,
    ]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_nested_foreach_and_switch() {
    let inner = Node::new("foreachSingle", vec![id("y"), id("x"), block(vec![
        Node::new("switchStatement", vec![id("y"), Node::new("case", vec![num(1), Node::token("jumpStatement", "continue")])]),
    ])]);
    let outer = Node::new("foreachSingle", vec![id("x"), id("arr"), block(vec![inner])]);
    let tree = script(vec![function("main", &["arr"], vec![outer])]);
    for target in [Target::t7_pc(), Target::t8()] {
        let compiled = compile(target, &tree);
        assert_image_consistent(&compiled);
    }
}

#[test]
fn test_switch_without_comparisons() {
    let tree = script(vec![function("main", &["a"], vec![
        Node::new("switchStatement", vec![id("a"), Node::new("default", vec![wait(num(1))])]),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert!(!main.instructions.iter().any(|x| matches!(x.op, ScriptOpCode::Equal | ScriptOpCode::JumpOnFalse | ScriptOpCode::JumpOnTrue)));
    assert!(main.jumps.is_empty());
}

#[test]
fn test_switch_default_first() {
    use ScriptOpCode::*;

    let tree = script(vec![function("main", &["a"], vec![
        Node::new("switchStatement", vec![
            id("a"),
            Node::new("default", vec![wait(num(2))]),
            Node::new("case", vec![num(1), wait(num(1)), Node::token("jumpStatement", "break")]),
        ]),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, EvalLocalVariableCached, EvalLocalVariableRefCached, SetVariableField,
        GetByte, EvalLocalVariableCached, Equal, JumpOnFalse, GetByte, Wait, Jump,
        GetByte, Wait, End,
    ]);
    let targets: Vec<_> = main.jumps.iter().map(|x| x.to).collect();
    assert_eq!(targets, [main.instructions[11].address, main.instructions[13].address]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_waittill_locals() {
    use ScriptOpCode::*;

    let waittill = Node::new("call", vec![
        Node::new("arguments", vec![string("event"), id("a"), id("b")]),
        Node::new("caller", vec![id("self")]),
    ]).with_text("waittill");
    let tree = script(vec![function("main", &[], vec![Node::new("simpleCall", vec![waittill]), ret(id("a"))])]);

    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, GetString, GetSelf, WaitTill, SetWaittillVariableFieldCached, SetWaittillVariableFieldCached,
        ClearParams, EvalLocalVariableCached, Return, End,
    ]);
    assert_image_consistent(&compiled);

    let compiled = compile(Target::t8(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, EvalLocalVariableCached, EvalLocalVariableCached, GetString, GetSelf, WaitTill, DecTop,
        EvalLocalVariableCached, Return, End,
    ]);
}

#[test]
fn test_builtin_calls() {
    use ScriptOpCode::*;

    let tree = script(vec![function("main", &["a"], vec![
        ret(call("vectorscale", vec![id("a"), num(2)])),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [SafeCreateLocalVariables, GetByte, EvalLocalVariableCached, VectorScale, Return, End]);
    assert!(compiled.tables.imports.is_empty());

    let endon = Node::new("call", vec![Node::new("arguments", vec![string("death")]), Node::new("caller", vec![id("self")])]).with_text("endon");
    let tree = script(vec![function("main", &[], vec![Node::new("simpleCall", vec![endon])])]);
    let compiled = compile(Target::t8(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [CheckClearParams, GetString, GetSelf, EndOn, End]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_field_access() {
    use ScriptOpCode::*;

    let field = |obj: Node, name: &str| Node::new("directAccess", vec![obj]).with_text(name);
    let tree = script(vec![function("main", &["a"], vec![
        assign(field(id("a"), "x"), field(id("self"), "y")),
    ])]);

    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, GetSelfObject, EvalFieldVariable,
        EvalLocalVariableCached, CastFieldObject, EvalFieldVariableRef, SetVariableField, End,
    ]);

    let compiled = compile(Target::t8(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables, GetSelf, CastAndEvalFieldVariable,
        EvalLocalVariableCached, CastFieldObject, EvalFieldVariableRef, SetVariableField, End,
    ]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_defined_access_and_coalesce() {
    let access = Node::new("definedAccess", vec![id("a")]).with_text("b");
    let tree = script(vec![function("main", &["a"], vec![
        ret(Node::new("undefined_coalesce", vec![access, num(0)])),
    ])]);
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        let built = build_script(CompileSettings { target, ..Default::default() }, &tree).unwrap();
        let (_, main) = built.functions().next().unwrap();
        assert_eq!(main.locals().len(), 3);
        let compiled = built.compile().unwrap();
        let main = compiled.function("main").unwrap();
        assert_eq!(main.jumps.len(), 4);
        assert_image_consistent(&compiled);
    }
}

#[test]
fn test_assignment_forms() {
    use ScriptOpCode::*;

    let shorthand = Node::new("shortHandArray", vec![num(1), num(2)]);
    let add = Node::new("setVariableField", vec![id("x"), num(3)]).with_text("+=");
    let tree = script(vec![function("main", &[], vec![assign(id("x"), shorthand), add])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables,
        GetEmptyArray, EvalLocalVariableRefCached, SetVariableField,
        GetByte, GetZero, EvalLocalVariableRefCached, EvalArrayRef, SetVariableField,
        GetByte, GetByte, EvalLocalVariableRefCached, EvalArrayRef, SetVariableField,
        EvalLocalVariableCached, GetByte, Plus, EvalLocalVariableRefCached, SetVariableField,
        End,
    ]);

    let bad = Node::new("setVariableField", vec![id("x"), num(3)]).with_text("@=");
    let tree = script(vec![function("main", &[], vec![bad])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::UnknownOperator { .. })));

    let tree = script(vec![function("main", &[], vec![ret(Node::new("shortHandArray", vec![]))])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::MalformedNode { .. })));
}

#[test]
fn test_type_tests() {
    use ScriptOpCode::*;

    let test = |kind: &str, ty: &str| Node::new(kind, vec![id("a")]).with_text(ty);
    let tree = script(vec![function("main", &["a"], vec![
        ret(test("typeComparison", "undefined")),
        ret(test("typeComparisonInverted", "true")),
        ret(test("typeComparison", "int")),
        ret(test("castOp", "float")),
    ])]);
    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        SafeCreateLocalVariables,
        EvalLocalVariableCached, IsDefined, BoolNot, Return,
        EvalLocalVariableCached, GetByte, SuperEqual, BoolNot, Return,
        PreScriptCall, EvalLocalVariableCached, ScriptFunctionCall, Return,
        PreScriptCall, EvalLocalVariableCached, ScriptFunctionCall, Return,
        End,
    ]);
    let names: Vec<_> = compiled.tables.imports.entries().map(|x| x.value.function).collect();
    assert_eq!(names, [hash::hash32("isint"), hash::hash32("float")]);
    assert!(compiled.tables.imports.entries().all(|x| x.value.params == 1 && x.value.flags == 34));

    let tree = script(vec![function("main", &["a"], vec![ret(test("typeComparison", "banana"))])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::UnknownOperator { .. })));
}

#[test]
fn test_boolean_expressions() {
    use ScriptOpCode::*;

    let and = Node::new("booleanExpression", vec![id("a"), id("b")]).with_text("&&");
    let tree = script(vec![function("main", &["a", "b"], vec![ret(and)])]);

    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [SafeCreateLocalVariables, EvalLocalVariableCached, JumpOnFalseExpr, EvalLocalVariableCached, Return, End]);
    assert_eq!(main.jumps[0].to, main.instructions[4].address);

    let compiled = compile(Target::t8(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [SafeCreateLocalVariables, EvalLocalVariableCached, JumpOnFalseExpr, EvalLocalVariableCached, CastBool, Return, End]);
    assert_image_consistent(&compiled);
}

#[test]
fn test_literals() {
    use ScriptOpCode::*;

    let tree = script(vec![function("main", &[], vec![
        ret(Node::token("hashedString", "hash_1234abcd")),
        ret(Node::token("canonHashed", "scripts/a.gsc")),
        ret(Node::token("debugString", "dev text")),
        ret(Node::token("iString", "MENU_TITLE")),
        ret(Node::new("vector", vec![num(1), num(2), num(3)])),
        ret(Node::new("newArray", vec![])),
        ret(Node::token("numberLiteral", "-70000")),
    ])]);

    let compiled = compile(Target::t7_pc(), &tree);
    let main = compiled.function("main").unwrap();
    assert_eq!(ops(main), [
        CheckClearParams,
        GetHash, Return, GetHash, Return, GetString, Return, GetIString, Return,
        GetByte, GetByte, GetByte, Vector, Return, GetEmptyArray, Return, GetInteger, Return, End,
    ]);
    assert_eq!(compiled.tables.debug.len(), 1);
    assert_eq!(compiled.tables.strings.len(), 1);
    assert_image_consistent(&compiled);

    let compiled = compile(Target::t8(), &tree);
    assert_eq!(compiled.tables.debug.len(), 0);
    assert_eq!(compiled.tables.strings.len(), 2);
    assert_image_consistent(&compiled);

    let tree = script(vec![function("main", &[], vec![ret(Node::token("hashedString", "hash_xyz"))])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::BadHash { .. })));
}

#[test]
fn test_function_pointers() {
    use ScriptOpCode::*;

    let pointer_call = Node::new("call", vec![
        Node::new("arguments", vec![num(1)]),
        Node::new("pointer", vec![id("fn")]),
        Node::new("thread", vec![]),
    ]);
    let tree = script(vec![function("main", &[], vec![
        assign(id("fn"), Node::token("getFunction", "main")),
        Node::new("simpleCall", vec![pointer_call]),
    ])]);
    for (target, get) in [(Target::t7_pc(), GetFunction), (Target::t8(), GetAPIFunction)] {
        let compiled = compile(target, &tree);
        let main = compiled.function("main").unwrap();
        assert_eq!(ops(main)[1], get);
        assert!(ops(main).contains(&ScriptThreadCallPointer));
        assert_eq!(compiled.tables.imports.len(), 1);
        assert_image_consistent(&compiled);
    }
}

#[test]
fn test_includes_and_unknown_nodes() {
    let tree = script(vec![
        Node::token("includes", "Scripts\\Shared\\Util"),
        Node::token("includes", "scripts/shared/util"),
        function("main", &[], vec![]),
    ]);
    let built = build_script(CompileSettings::default(), &tree).unwrap();
    assert_eq!(built.includes(), ["scripts/shared/util"]);

    let tree = script(vec![function("main", &[], vec![Node::new("gotoStatement", vec![])])]);
    match compile_tree(CompileSettings::default(), &tree) {
        Err(CompileError::UnsupportedNode { kind }) => assert_eq!(kind, "gotoStatement"),
        x => panic!("{:?}", x.err()),
    }
}
