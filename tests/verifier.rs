use sbc_vm::prelude::*;

use sbc_vm::prelude::{ElemKind as E, Instruction as I, TypeKind as K};

fn verify_err(builder: ModuleBuilder) -> VerifyError {
    let module = load_module(&builder.build()).expect("load");
    verify_module(&module).expect_err("verification must fail")
}

fn verify_ok(builder: ModuleBuilder) -> VerifyResult {
    let module = load_module(&builder.build()).expect("load");
    verify_module(&module).expect("verification must pass")
}

fn exit_code(builder: ModuleBuilder) -> i32 {
    match run_module(&builder.build(), VmConfig::default()) {
        VmStatus::Halted { exit_code } => exit_code,
        other => panic!("expected a halt, got {other:?}"),
    }
}

#[test]
fn load_field_on_non_ref_is_rejected() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let (_, field) = builder.object_type("Point", &[("x", t_i32)]);
    let err = verify_err(builder.simple_entry(&[
        I::Enter(0),
        I::ConstI32(3),
        I::LoadField(field),
        I::Pop,
        I::Halt,
    ]));
    assert!(err.message.contains("expects an object"), "{err}");
}

#[test]
fn field_access_requires_the_owning_type() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let (_, point_field) = builder.object_type("Point", &[("x", t_i32)]);
    let (size, _) = builder.object_type("Size", &[("w", t_i32)]);
    let err = verify_err(builder.simple_entry(&[
        I::Enter(0),
        I::NewObject(size),
        I::LoadField(point_field),
        I::Pop,
        I::Halt,
    ]));
    assert!(err.message.contains("owning type"), "{err}");
}

#[test]
fn char_widens_into_i32_element_writes_but_bool_does_not() {
    // The coercion table: Char is accepted into an I32 array slot.
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let code = [
        I::Enter(0),
        I::NewArray { elem: E::I32, type_id: t_i32, length: 1 },
        I::Dup,
        I::ConstI32(0),
        I::ConstChar(65),
        I::ArraySet(E::I32),
        I::ConstI32(0),
        I::ArrayGet(E::I32),
        I::Halt,
    ];
    assert_eq!(exit_code(builder.simple_entry(&code)), 65);

    // Bool is not.
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let err = verify_err(builder.simple_entry(&[
        I::Enter(0),
        I::NewArray { elem: E::I32, type_id: t_i32, length: 1 },
        I::ConstI32(0),
        I::ConstBool(true),
        I::ArraySet(E::I32),
        I::Halt,
    ]));
    assert!(err.message.contains("I32 element"), "{err}");
}

#[test]
fn join_height_and_type_must_agree() {
    // Taken branch pushes an extra value; heights disagree at the join.
    let err = verify_err(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstBool(true),
        I::JmpTrue(5),       // over the next ConstI32
        I::ConstI32(1),
        I::ConstI32(2),      // join target
        I::Halt,
    ]));
    assert!(err.message.contains("height mismatch"), "{err}");

    // Same height, different types.
    let err = verify_err(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstBool(true),
        I::JmpFalse(10),     // to the ConstF64 push
        I::ConstI32(1),
        I::Jmp(9),           // over it, to the join
        I::ConstF64(1.0),
        I::Pop,              // join
        I::Halt,
    ]));
    assert!(err.message.contains("type mismatch"), "{err}");
}

#[test]
fn ref_bitness_never_merges_with_scalars() {
    let err = verify_err(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstBool(true),
        I::JmpFalse(6),
        I::ConstNull,
        I::Jmp(5),
        I::ConstI32(0),
        I::Pop,
        I::Halt,
    ]));
    assert!(err.message.contains("type mismatch"), "{err}");
}

#[test]
fn widened_narrow_value_does_not_satisfy_an_i32_parameter() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("takes_i32", &[t_i32], t_i32, 1, &[
        I::Enter(1),
        I::LoadLocal(0),
        I::Ret,
    ]);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::ConstI8(5),
        I::Call { func_id: 0, argc: 1 },
        I::Ret,
    ]);
    let err = verify_err(builder.entry(1));
    assert!(err.message.contains("does not match declared type"), "{err}");
}

#[test]
fn call_arity_must_match_the_signature() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("takes_i32", &[t_i32], t_i32, 1, &[
        I::Enter(1),
        I::LoadLocal(0),
        I::Ret,
    ]);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::Call { func_id: 0, argc: 0 },
        I::Ret,
    ]);
    let err = verify_err(builder.entry(1));
    assert!(err.message.contains("arity"), "{err}");
}

#[test]
fn stack_max_bound_is_enforced() {
    let err = verify_err(
        ModuleBuilder::new()
            .simple_entry(&[
                I::Enter(0),
                I::ConstI32(1),
                I::ConstI32(2),
                I::ConstI32(3),
                I::Halt,
            ])
            .stack_max(2),
    );
    assert!(err.message.contains("exceeds module stack_max"), "{err}");
}

#[test]
fn verified_stack_max_is_canonical() {
    let result = verify_ok(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::ConstI32(2),
        I::Add(K::I32),
        I::ConstI32(3),
        I::Pop,
        I::Pop,
        I::Halt,
    ]));
    assert_eq!(result.functions[0].stack_max, 2);
}

#[test]
fn jmp_table_const_must_be_a_table() {
    let mut builder = ModuleBuilder::new();
    let not_a_table = builder.str_const("nope");
    let err = verify_err(builder.simple_entry(&[
        I::Enter(0),
        I::ConstI32(0),
        I::JmpTable { table_const: not_a_table, default_rel: 0 },
        I::Halt,
    ]));
    assert!(err.message.contains("not a jump table"), "{err}");
}

#[test]
fn tail_call_with_residual_stack_is_rejected() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("callee", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(1), I::Ret]);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::ConstI32(9),
        I::TailCall { func_id: 0, argc: 0 },
    ]);
    let err = verify_err(builder.entry(1));
    assert!(err.message.contains("residual stack"), "{err}");
}

#[test]
fn code_after_leave_is_restricted() {
    let err = verify_err(ModuleBuilder::new().entry_with_locals(1, &[
        I::Enter(1),
        I::Leave,
        I::ConstI32(1),
        I::Halt,
    ]));
    assert!(err.message.contains("Leave"), "{err}");
}

#[test]
fn new_closure_capture_count_must_match_declaration() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let desc = builder.upval_desc_const(&[K::I32]);
    builder.closure_function("tick", &[], t_i32, 0, desc, &[
        I::Enter(0),
        I::LoadUpvalue(0),
        I::Ret,
    ]);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::NewClosure { func_id: 0, upvalue_count: 0 },
        I::TypeOf,
        I::Ret,
    ]);
    let err = verify_err(builder.entry(1));
    assert!(err.message.contains("declares"), "{err}");
}

#[test]
fn upvalue_ops_need_a_declaration() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::LoadUpvalue(0),
        I::Ret,
    ]);
    let err = verify_err(builder);
    assert!(err.message.contains("not declared"), "{err}");
}

#[test]
fn call_check_must_precede_a_call() {
    let err = verify_err(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::CallCheck(4),
        I::ConstI32(1),
        I::Halt,
    ]));
    assert!(err.message.contains("CallCheck"), "{err}");
}

#[test]
fn conditional_predicate_must_be_bool() {
    let err = verify_err(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::JmpTrue(0),
        I::Halt,
    ]));
    assert!(err.message.contains("expects Bool"), "{err}");
}

#[test]
fn entry_function_must_take_no_parameters() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[t_i32], t_i32, 1, &[
        I::Enter(1),
        I::LoadLocal(0),
        I::Ret,
    ]);
    let err = verify_err(builder);
    assert!(err.message.contains("no parameters"), "{err}");
}

#[test]
fn unverified_modules_require_the_explicit_opt_in() {
    let builder = ModuleBuilder::new().simple_entry(&[I::Enter(0), I::Halt]);
    let config = VmConfig { verify: false, ..VmConfig::default() };
    match run_module(&builder.build(), config) {
        VmStatus::Invalid(diag) => assert!(diag.contains("unverified"), "{diag}"),
        other => panic!("unexpected status {other:?}"),
    }
}

#[test]
fn interpreter_stack_height_matches_the_prediction() {
    // No control flow: the stack after the straight-line prefix must be
    // exactly what the verifier computed for the Halt site.
    let builder = ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::ConstI32(2),
        I::Add(K::I32),
        I::ConstI32(5),
        I::Halt,
    ]);
    let module = load_module(&builder.build()).expect("load");
    let verified = verify_module(&module).expect("verify");
    // Heights at the two alloc-free safepoints: entry 0, and the running
    // max is 2.
    assert_eq!(verified.functions[0].stack_maps[&0].height(), 0);
    assert_eq!(verified.functions[0].stack_max, 2);

    let mut vm = Interpreter::new(module, VmConfig::default()).expect("construct");
    match vm.execute() {
        ProgramState::Halted { exit_code } => assert_eq!(exit_code, 5),
        other => panic!("unexpected state {other:?}"),
    }
    // Halt popped the exit value; the Add result is still parked below.
    assert_eq!(vm.stack_height(), 1);
}

#[test]
fn safepoint_maps_carry_ref_bits() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let text = builder.str_const("rooted");
    let builder = builder.simple_entry(&[
        I::Enter(0),
        I::ConstString(text),
        I::NewArray { elem: E::I32, type_id: t_i32, length: 1 },
        I::Pop,
        I::Pop,
        I::Halt,
    ]);
    let module = load_module(&builder.build()).expect("load");
    let verified = verify_module(&module).expect("verify");
    // At the NewArray safepoint the string handle sits on the stack.
    let map = verified.functions[0].map_at(8).expect("alloc safepoint");
    let refs: Vec<bool> = map.stack_refs().collect();
    assert_eq!(refs, vec![true]);
}
