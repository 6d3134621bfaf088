use sbc_vm::consts::{HEADER_SIZE, SECTION_ENTRY_SIZE};
use sbc_vm::error::LoadError;
use sbc_vm::prelude::*;

use sbc_vm::prelude::{Instruction as I, TypeKind as K};

/// A module exercising every section: types, fields, methods,
/// signatures, const pool, globals, two functions, imports, exports and
/// debug records.
fn rich_builder() -> ModuleBuilder {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let t_ref = builder.add_type(K::Ref);
    let (point, field) = builder.object_type("Point", &[("x", t_i32), ("next", t_ref)]);
    let greeting = builder.str_const("hello");
    // Pool-only entries, kept for encoder coverage.
    builder.i128_const(-(1 << 80));
    builder.f64_const(0.5);
    let small = builder.i128_const(40);
    let table = builder.jmp_table_const(&[0, 6]);
    builder.add_global(t_i32, Some(small));
    builder.add_global(t_ref, Some(greeting));
    builder.function(
        "helper",
        &[t_i32],
        t_i32,
        1,
        &[I::Enter(1), I::LoadLocal(0), I::Ret],
    );
    builder.function(
        "main",
        &[],
        t_i32,
        1,
        &[
            I::Enter(1),
            I::NewObject(point),
            I::StoreLocal(0),
            I::LoadLocal(0),
            I::ConstI32(5),
            I::StoreField(field),
            I::ConstF64(0.5),
            I::Pop,
            I::ConstI32(0),
            I::JmpTable { table_const: table, default_rel: 12 },
            I::ConstI32(1),
            I::Ret,
            I::ConstI32(2),
            I::Ret,
            I::ConstI32(3),
            I::Ret,
        ],
    );
    builder.export("app", "main", 1);
    builder.debug_record(0, 4, 1, 1);
    builder.entry(1)
}

#[test]
fn rich_module_round_trips_byte_identical() {
    let bytes = rich_builder().build();
    let module = load_module(&bytes).expect("load");
    let reemitted = emit_module(&module);
    assert_eq!(reemitted, bytes);

    // And again through a second load, for fixpoint.
    let module2 = load_module(&reemitted).expect("reload");
    assert_eq!(emit_module(&module2), reemitted);
}

#[test]
fn rich_module_executes() {
    let status = run_module(&rich_builder().build(), VmConfig::default());
    match status {
        VmStatus::Halted { exit_code } => assert_eq!(exit_code, 1),
        other => panic!("unexpected status {other:?}"),
    }
}

#[test]
fn section_overlap_is_rejected() {
    let mut bytes = rich_builder().build();
    // Point the second section table entry at the first one's payload.
    let first_offset = {
        let entry = HEADER_SIZE + 4;
        u32::from_le_bytes(bytes[entry..entry + 4].try_into().unwrap())
    };
    let second = HEADER_SIZE + SECTION_ENTRY_SIZE + 4;
    bytes[second..second + 4].copy_from_slice(&first_offset.to_le_bytes());

    match load_module(&bytes) {
        Err(LoadError::SectionOverlap(..)) => {}
        other => panic!("expected a section overlap, got {other:?}"),
    }
    let status = run_module(&bytes, VmConfig::default());
    match status {
        VmStatus::Invalid(diag) => assert!(diag.contains("section overlap"), "{diag}"),
        other => panic!("unexpected status {other:?}"),
    }
}

#[test]
fn bad_magic_version_and_endian_reject() {
    let good = rich_builder().build();

    let mut bytes = good.clone();
    bytes[0] = b'Z';
    assert!(matches!(load_module(&bytes), Err(LoadError::BadMagic(_))));

    let mut bytes = good.clone();
    bytes[4] = 9;
    assert!(matches!(load_module(&bytes), Err(LoadError::BadVersion(9))));

    let mut bytes = good.clone();
    bytes[6] = 0x80;
    assert!(matches!(load_module(&bytes), Err(LoadError::BadFlags(0x80))));

    let mut bytes = good;
    bytes[7] = 0;
    assert!(matches!(load_module(&bytes), Err(LoadError::BadEndian(0))));
}

#[test]
fn unknown_and_duplicate_section_ids_reject() {
    let good = rich_builder().build();

    let mut bytes = good.clone();
    bytes[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&99u32.to_le_bytes());
    assert!(matches!(load_module(&bytes), Err(LoadError::UnknownSection(99))));

    let mut bytes = good;
    let first_id = u32::from_le_bytes(bytes[HEADER_SIZE..HEADER_SIZE + 4].try_into().unwrap());
    let second = HEADER_SIZE + SECTION_ENTRY_SIZE;
    bytes[second..second + 4].copy_from_slice(&first_id.to_le_bytes());
    assert!(matches!(load_module(&bytes), Err(LoadError::DuplicateSection(_))));
}

#[test]
fn truncated_module_rejects() {
    let bytes = rich_builder().build();
    for len in [0, 8, 31] {
        assert!(matches!(
            load_module(&bytes[..len]),
            Err(LoadError::Truncated { .. })
        ));
    }
    // Cut into the last section's payload.
    assert!(load_module(&bytes[..bytes.len() - 8]).is_err());
}

#[test]
fn bad_const_tag_rejects() {
    let bytes = rich_builder().build();
    let module = load_module(&bytes).expect("load");
    let pool = module
        .sections
        .iter()
        .find(|s| s.id == sbc_asm::SectionId::ConstPool)
        .expect("const pool present");

    // Payload: blob_len, blob (padded), const_count, then the first tag.
    let blob_len = module.string_blob.len();
    let padded = (blob_len + 3) / 4 * 4;
    let first_tag = pool.offset as usize + 4 + padded + 4;

    let mut bytes = bytes;
    bytes[first_tag..first_tag + 4].copy_from_slice(&42u32.to_le_bytes());
    assert!(matches!(
        load_module(&bytes),
        Err(LoadError::BadConstTag { id: 0, tag: 42 })
    ));
}

#[test]
fn missing_entry_method_rejects() {
    let builder = ModuleBuilder::new()
        .simple_entry(&[I::Enter(0), I::Halt])
        .entry(7);
    assert!(matches!(load_module(&builder.build()), Err(LoadError::BadEntry(7))));
}

#[test]
fn duplicate_imports_reject() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(0), I::Ret]);
    builder.import("core.os", "args_count", &[], t_i32);
    builder.import("core.os", "args_count", &[], t_i32);
    match load_module(&builder.build()) {
        Err(LoadError::DuplicateImport { module, symbol }) => {
            assert_eq!((module.as_str(), symbol.as_str()), ("core.os", "args_count"));
        }
        other => panic!("expected duplicate import, got {other:?}"),
    }
}

#[test]
fn debug_record_outside_code_rejects() {
    let mut builder = ModuleBuilder::new();
    builder.debug_record(0, 4096, 1, 1);
    let builder = builder.simple_entry(&[I::Enter(0), I::Halt]);
    assert!(matches!(
        load_module(&builder.build()),
        Err(LoadError::BadRecord { table: "debug", .. })
    ));
}

#[test]
fn debug_positions_resolve_for_loaded_modules() {
    let mut builder = ModuleBuilder::new();
    builder.debug_record(0, 4, 3, 9);
    let module = load_module(
        &builder.simple_entry(&[I::Enter(0), I::Halt]).build(),
    )
    .expect("load");
    assert_eq!(module.debug_pos(1), Some((3, 9)));
    assert_eq!(module.debug_pos(100), None);
}

#[test]
fn exports_resolve_by_name() {
    let module = load_module(&rich_builder().build()).expect("load");
    assert_eq!(module.export("app", "main"), Some(1));
    assert_eq!(module.export("app", "missing"), None);
}

#[test]
fn function_overlap_rejects() {
    // Hand-patch the second function's code range onto the first's.
    let bytes = rich_builder().build();
    let module = load_module(&bytes).expect("load");
    let functions = module
        .sections
        .iter()
        .find(|s| s.id == sbc_asm::SectionId::Functions)
        .expect("functions present");
    // Record 1 starts 16 bytes in; code_offset is its third word.
    let record1_code_offset = functions.offset as usize + 16 + 8;
    let first_offset = module.functions[0].code_offset;

    let mut bytes = bytes;
    bytes[record1_code_offset..record1_code_offset + 4]
        .copy_from_slice(&first_offset.to_le_bytes());
    // The method table still holds the old offset, so either the
    // consistency check or the overlap check fires; both are loads
    // failures.
    assert!(load_module(&bytes).is_err());
}

#[test]
fn stack_max_header_default_applies() {
    let bytes = ModuleBuilder::new().simple_entry(&[I::Enter(0), I::Halt]).build();
    let module = load_module(&bytes).expect("load");
    assert_eq!(module.header.stack_max, sbc_vm::consts::DEFAULT_STACK_MAX);

    let bytes = ModuleBuilder::new()
        .simple_entry(&[I::Enter(0), I::Halt])
        .stack_max(64)
        .build();
    assert_eq!(load_module(&bytes).expect("load").header.stack_max, 64);
}
