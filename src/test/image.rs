use crate::lower::build_script;
use crate::section::SectionKind;
use crate::table::MAX_ROW_REFS;

use super::*;

fn mixed() -> Node {
    Node::from_json(include_str!("trees/mixed.json")).unwrap()
}

#[test]
fn test_image_magic() {
    let tree = mixed();

    let compiled = compile(Target::t7_pc(), &tree);
    assert_eq!(&compiled.image[..8], Target::t7_pc().magic().to_le_bytes());
    let compiled = compile(Target::t7_console(), &tree);
    assert_eq!(&compiled.image[..8], Target::t7_console().magic().to_be_bytes());
    assert_eq!(util::read_u32(&compiled.image, 8, compiled.target.endian), Target::t7_console().default_checksum());

    let compiled = compile(Target::t8(), &tree);
    assert_eq!(&compiled.image[..8], [0x80, 0x47, 0x53, 0x43, 0x0D, 0x0A, 0x00, 0x36]);
    assert_eq!(compiled.header.name_hash, hash::t8_hash64("scripts/custom/main.gsc"));
    assert!(compiled.section(SectionKind::Name).is_none());
    assert!(compiled.section(SectionKind::Globals).is_some());

    let settings = CompileSettings { target: Target::t7_console(), source_checksum: Some(0x12345678), ..Default::default() };
    let compiled = compile_tree(settings, &tree).unwrap();
    assert_eq!(util::read_u32(&compiled.image, 8, compiled.target.endian), 0x12345678);
}

#[test]
fn test_name_and_includes() {
    let tree = mixed();

    for target in [Target::t7_pc(), Target::t7_console()] {
        let compiled = compile(target, &tree);
        let name = compiled.header.name_offset as usize;
        assert!(compiled.image[name..].starts_with(b"scripts/custom/main.gsc\0"));
        assert_eq!(compiled.section(SectionKind::Name).unwrap().base as usize, name);

        let include = util::read_u32(&compiled.image, compiled.header.include_offset as usize, target.endian) as usize;
        assert!(compiled.image[include..].starts_with(b"scripts/shared/util_shared\0"));
    }

    let compiled = compile(Target::t8(), &tree);
    let include = &compiled.image[compiled.header.include_offset as usize..][..8];
    assert_eq!(include, hash::t8_hash64("scripts/shared/util_shared").to_le_bytes());
}

#[test]
fn test_export_entries() {
    let tree = mixed();
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        let compiled = compile(target, &tree);
        let size = target.export_entry_size() as usize;
        let (params, flags) = match target.is_t7() { true => (16, 17), false => (20, 21) };
        for (i, layout) in compiled.layouts.iter().enumerate() {
            let entry = compiled.header.export_offset as usize + i * size;
            assert_eq!(util::read_u32(&compiled.image, entry + 8, target.endian), layout.hash);
            assert_eq!(util::read_u32(&compiled.image, entry + 12, target.endian), layout.namespace);
            if !target.is_t7() {
                assert_eq!(util::read_u32(&compiled.image, entry + 16, target.endian), layout.namespace);
            }
            assert_eq!(compiled.image[entry + params], layout.params);
            assert_eq!(compiled.image[entry + flags], layout.flags);
        }

        let (first, last) = (&compiled.layouts[0], compiled.layouts.last().unwrap());
        assert_eq!(compiled.header.bytecode_offset, first.address);
        assert_eq!(compiled.header.bytecode_offset + compiled.header.bytecode_size, last.address + last.size);
        assert_eq!(compiled.section(SectionKind::Exports).unwrap().base, compiled.header.export_offset);
    }
}

#[test]
fn test_import_rows() {
    let compiled = compile(Target::t7_pc(), &mixed());
    let endian = compiled.target.endian;
    assert_eq!(compiled.header.import_count, 3);

    let helper = compiled.tables.imports.entries().next().unwrap();
    let row = compiled.header.import_offset as usize;
    assert_eq!(util::read_u32(&compiled.image, row, endian), helper.value.function);
    assert_eq!(util::read_u32(&compiled.image, row + 4, endian), helper.value.namespace);
    assert_eq!(util::read_u16(&compiled.image, row + 8, endian), 1);
    assert_eq!(compiled.image[row + 10], helper.value.params);
    assert_eq!(compiled.image[row + 11], helper.value.flags);

    let call = util::read_u32(&compiled.image, row + 12, endian);
    assert_eq!(helper.refs, [call]);
    assert_eq!(util::read_u16(&compiled.image, call as usize, endian), ScriptOpCode::ScriptMethodCall.value());
}

#[test]
fn test_string_row_split() {
    let body = (0..600).map(|_| assign(id("s"), string("same"))).collect();
    let tree = script(vec![function("main", &[], body)]);

    for target in [Target::t7_pc(), Target::t8()] {
        let compiled = compile(target, &tree);
        let entry = compiled.tables.strings.entries().next().unwrap();
        assert_eq!(entry.rows().map(|x| x.len()).collect::<Vec<_>>(), [MAX_ROW_REFS, MAX_ROW_REFS, 100]);
        assert_eq!(compiled.header.string_count, 3);

        let mut row = compiled.header.string_offset as usize;
        for count in [250, 250, 100] {
            assert_eq!(util::read_u32(&compiled.image, row, target.endian), entry.address.unwrap());
            assert_eq!(compiled.image[row + 4], count);
            row += 8 + count as usize * 4;
        }
        assert_image_consistent(&compiled);
    }
}

#[test]
fn test_section_sizes() {
    let tree = mixed();
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        let compiled = compile(target, &tree);
        assert_eq!(compiled.records.len(), SectionKind::order(target.vm).len());
        assert_section_sizes(&compiled);
        assert_sections_aligned(&compiled);
        assert_eq!(compiled.section_size(SectionKind::Header), Some(target.header_size()));
    }

    let body = (0..600).map(|_| assign(id("s"), string("same"))).collect();
    let tree = script(vec![function("main", &[], body)]);
    for (target, kind, rows_size) in [
        (Target::t7_pc(), SectionKind::StringFixups, 3 * 8 + 600 * 4),
        (Target::t7_console(), SectionKind::StringFixups, 3 * 4 + 600 * 4),
        (Target::t8(), SectionKind::Strings, 3 * 8 + 600 * 4 + 5),
    ] {
        let compiled = compile(target, &tree);
        assert_eq!(compiled.tables.strings.len(), 1);
        assert_section_sizes(&compiled);
        let record = compiled.section(kind).unwrap();
        assert_eq!(record.size, util::align(rows_size, 16), "{target:?}");
    }
    let compiled = compile(Target::t7_pc(), &tree);
    assert_eq!(compiled.section(SectionKind::Strings).unwrap().size, 16);
}

#[test]
fn test_removed_function_rows() {
    let mut built = build_script(CompileSettings::default(), &mixed()).unwrap();
    let (helper, _) = built.functions().find(|(_, f)| f.name == "helper").unwrap();
    built.remove_function(helper).unwrap();

    let compiled = built.compile().unwrap();
    assert_eq!(compiled.header.export_count, 1);
    assert_eq!(compiled.tables.imports.len(), 3);
    assert_eq!(compiled.header.import_count, 1);
    assert_image_consistent(&compiled);
}

#[test]
fn test_deterministic_images() {
    let tree = mixed();
    for target in [Target::t7_pc(), Target::t7_console(), Target::t8()] {
        assert_eq!(compile(target, &tree).image, compile(target, &tree).image);
    }
}

#[test]
fn test_jump_out_of_range() {
    let body = (0..6000).map(|_| wait(num(1))).collect();
    let tree = script(vec![function("main", &["a"], vec![
        Node::new("whileStatement", vec![id("a"), block(body)]),
    ])]);
    match compile_tree(CompileSettings::default(), &tree) {
        Err(CompileError::JumpOutOfRange { function, .. }) => assert_eq!(function, "main"),
        x => panic!("{:?}", x.err()),
    }

    let body = (0..1000).map(|_| wait(num(1))).collect();
    let tree = script(vec![function("main", &["a"], vec![
        Node::new("whileStatement", vec![id("a"), block(body)]),
    ])]);
    assert_image_consistent(&compile(Target::t7_pc(), &tree));
}

#[test]
fn test_capacity_limits() {
    let args = (0..256).map(|_| num(0)).collect();
    let tree = script(vec![function("main", &[], vec![stmt_call("foo", args)])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::CapacityExceeded { what: "call parameters", .. })));

    let names: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let tree = script(vec![function("main", &names, vec![])]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::CapacityExceeded { what: "parameters", .. })));

    let body = (0..256).map(|i| assign(id(&format!("v{i}")), num(0))).collect();
    let tree = script(vec![function("main", &[], body)]);
    assert!(matches!(compile_tree(CompileSettings::default(), &tree), Err(CompileError::CapacityExceeded { what: "locals", .. })));

    let body = (0..255).map(|i| assign(id(&format!("v{i}")), num(0))).collect();
    let tree = script(vec![function("main", &[], body)]);
    assert_image_consistent(&compile(Target::t7_pc(), &tree));
}
