use sbc_asm::TrapReason;
use sbc_vm::host::{HostError, HostOutcome};
use sbc_vm::prelude::*;

use sbc_vm::prelude::{Instruction as I, TypeKind as K};

fn run(builder: ModuleBuilder) -> VmStatus {
    run_module(&builder.build(), VmConfig::default())
}

fn exit_code(status: VmStatus) -> i32 {
    match status {
        VmStatus::Halted { exit_code } => exit_code,
        other => panic!("expected a halt, got {other:?}"),
    }
}

fn trap(status: VmStatus) -> TrapInfo {
    match status {
        VmStatus::Trapped(info) => info,
        other => panic!("expected a trap, got {other:?}"),
    }
}

#[test]
fn iterative_fib_counts_to_55() {
    // locals: 0 = n, 1 = a, 2 = b, 3 = i
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(4),
        I::ConstI32(10),
        I::StoreLocal(0),
        I::ConstI32(0),
        I::StoreLocal(1),
        I::ConstI32(1),
        I::StoreLocal(2),
        I::ConstI32(0),
        I::StoreLocal(3),
        // loop head at 43
        I::LoadLocal(3),
        I::LoadLocal(0),
        I::CmpLt(K::I32),
        I::JmpFalse(44),
        I::LoadLocal(1),
        I::LoadLocal(2),
        I::Add(K::I32),
        I::LoadLocal(2),
        I::StoreLocal(1),
        I::StoreLocal(2),
        I::LoadLocal(3),
        I::Inc(K::I32),
        I::StoreLocal(3),
        I::Jmp(-61),
        // exit at 104
        I::LoadLocal(1),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 55);
}

#[test]
fn recursive_fib_through_call() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    // func 0: fib(n)
    builder.function(
        "fib",
        &[t_i32],
        t_i32,
        1,
        &[
            I::Enter(1),
            I::LoadLocal(0),
            I::ConstI32(2),
            I::CmpLt(K::I32),
            I::JmpFalse(6),
            I::LoadLocal(0),
            I::Ret,
            // else at 26
            I::LoadLocal(0),
            I::ConstI32(1),
            I::Sub(K::I32),
            I::Call { func_id: 0, argc: 1 },
            I::LoadLocal(0),
            I::ConstI32(2),
            I::Sub(K::I32),
            I::Call { func_id: 0, argc: 1 },
            I::Add(K::I32),
            I::Ret,
        ],
    );
    builder.function(
        "main",
        &[],
        t_i32,
        0,
        &[I::Enter(0), I::ConstI32(5), I::Call { func_id: 0, argc: 1 }, I::Ret],
    );
    let status = run(builder.entry(1));
    assert_eq!(exit_code(status), 5);
}

#[test]
fn jmp_table_selects_cases_and_default() {
    for (key, expected) in [(0, 1), (1, 2), (7, 3)] {
        let mut builder = ModuleBuilder::new();
        // Targets relative to the byte after the JmpTable operands.
        let table = builder.jmp_table_const(&[0, 6]);
        let status = run(builder.simple_entry(&[
            I::Enter(0),
            I::ConstI32(key),
            I::JmpTable { table_const: table, default_rel: 12 },
            I::ConstI32(1), // case 0 at +0
            I::Halt,
            I::ConstI32(2), // case 1 at +6
            I::Halt,
            I::ConstI32(3), // default at +12
            I::Halt,
        ]));
        assert_eq!(exit_code(status), expected, "key {key}");
    }
}

#[test]
fn tail_call_collapses_frames() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    // Deeper than MAX_CALL_DEPTH; only possible with frame collapse.
    builder.function(
        "countdown",
        &[t_i32],
        t_i32,
        1,
        &[
            I::Enter(1),
            I::LoadLocal(0),
            I::ConstI32(0),
            I::CmpEq(K::I32),
            I::JmpFalse(6),
            I::ConstI32(0),
            I::Ret,
            // else at 26
            I::LoadLocal(0),
            I::ConstI32(1),
            I::Sub(K::I32),
            I::TailCall { func_id: 0, argc: 1 },
        ],
    );
    builder.function(
        "main",
        &[],
        t_i32,
        0,
        &[I::Enter(0), I::ConstI32(5000), I::Call { func_id: 0, argc: 1 }, I::Ret],
    );
    let status = run(builder.entry(1));
    assert_eq!(exit_code(status), 0);
}

#[test]
fn closure_upvalue_mutation_persists_across_calls() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let desc = builder.upval_desc_const(&[K::I32]);
    // func 0: tick() -> i32, captures one counter slot.
    builder.closure_function(
        "tick",
        &[],
        t_i32,
        0,
        desc,
        &[
            I::Enter(0),
            I::LoadUpvalue(0),
            I::ConstI32(1),
            I::Add(K::I32),
            I::Dup,
            I::StoreUpvalue(0),
            I::Ret,
        ],
    );
    let tick_sig = builder.sig_id_of(0);
    builder.function(
        "main",
        &[],
        t_i32,
        1,
        &[
            I::Enter(1),
            I::ConstI32(41),
            I::NewClosure { func_id: 0, upvalue_count: 1 },
            I::StoreLocal(0),
            I::LoadLocal(0),
            I::CallIndirect { sig_id: tick_sig, argc: 0 },
            I::Pop,
            I::LoadLocal(0),
            I::CallIndirect { sig_id: tick_sig, argc: 0 },
            I::Ret,
        ],
    );
    let status = run(builder.entry(1));
    assert_eq!(exit_code(status), 43);
}

#[test]
fn call_indirect_signature_mismatch_traps() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    let desc = builder.upval_desc_const(&[]);
    builder.closure_function("noop", &[], t_i32, 0, desc, &[
        I::Enter(0),
        I::ConstI32(0),
        I::Ret,
    ]);
    let other_sig = builder.add_sig(&[], t_i32);
    builder.function(
        "main",
        &[],
        t_i32,
        0,
        &[
            I::Enter(0),
            I::NewClosure { func_id: 0, upvalue_count: 0 },
            I::CallIndirect { sig_id: other_sig, argc: 0 },
            I::Ret,
        ],
    );
    // The verifier would reject the mismatch statically; run unverified
    // to observe the runtime defense.
    let config = VmConfig { verify: false, allow_unverified: true, ..VmConfig::default() };
    let status = run_module(&builder.entry(1).build(), config);
    assert_eq!(trap(status).reason, TrapReason::SignatureMismatch);
}

#[test]
fn bottom_frame_return_value_is_the_exit_code() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(9), I::Ret]);
    assert_eq!(exit_code(run(builder)), 9);
}

#[test]
fn leave_before_tail_call_is_allowed() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("forty", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(40), I::Ret]);
    builder.function(
        "main",
        &[],
        t_i32,
        2,
        &[
            I::Enter(2),
            I::ConstI32(1),
            I::StoreLocal(0),
            I::Leave,
            I::TailCall { func_id: 0, argc: 0 },
        ],
    );
    assert_eq!(exit_code(run(builder.entry(1))), 40);
}

#[test]
fn trap_diagnostics_carry_line_markers() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::Line { line: 10, column: 20 },
        I::ConstI32(1),
        I::ConstI32(0),
        I::Div(K::I32),
        I::Halt,
    ]));
    let rendered = trap(status).to_string();
    assert!(rendered.contains("line 10:20"), "{rendered}");
    assert!(rendered.contains("last_op 0x33 Div"), "{rendered}");
}

#[test]
fn unverified_jump_trap_names_the_opcode() {
    let builder = ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::Jmp(100),
        I::Halt,
    ]);
    let config = VmConfig { verify: false, allow_unverified: true, ..VmConfig::default() };
    let status = run_module(&builder.build(), config);
    let rendered = trap(status).to_string();
    assert!(rendered.contains("last_op 0x04 Jmp"), "{rendered}");
    assert!(rendered.contains("rel=100"), "{rendered}");
}

#[test]
fn breakpoint_traps_only_when_enabled() {
    let builder = || {
        ModuleBuilder::new().simple_entry(&[
            I::Enter(0),
            I::Breakpoint,
            I::ConstI32(5),
            I::Halt,
        ])
    };
    assert_eq!(exit_code(run(builder())), 5);

    let config = VmConfig { break_on_breakpoint: true, ..VmConfig::default() };
    let status = run_module(&builder().build(), config);
    assert_eq!(trap(status).reason, TrapReason::Breakpoint);
}

#[test]
fn call_check_probe_fails_on_tiny_stack() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("callee", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(1), I::Ret]);
    builder.function(
        "main",
        &[],
        t_i32,
        0,
        &[
            I::Enter(0),
            I::CallCheck(64),
            I::Call { func_id: 0, argc: 0 },
            I::Ret,
        ],
    );
    let status = run(builder.entry(1).stack_max(4));
    assert_eq!(trap(status).reason, TrapReason::StackProbeFailed);
}

#[test]
fn explicit_trap_reports_itself() {
    let status = run(ModuleBuilder::new().simple_entry(&[I::Enter(0), I::Trap]));
    let info = trap(status);
    assert_eq!(info.reason, TrapReason::ExplicitTrap);
    assert_eq!(info.func, 0);
}

#[test]
fn core_os_args_resolve_through_builtin_resolver() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::Call { func_id: 1, argc: 0 },
        I::Ret,
    ]);
    let import_id = builder.import("core.os", "args_count", &[], t_i32);
    assert_eq!(import_id, 1);

    let config = VmConfig {
        argv: vec!["vm".into(), "a".into(), "b".into()],
        ..VmConfig::default()
    };
    let status = run_module(&builder.build(), config);
    assert_eq!(exit_code(status), 3);
}

#[test]
fn host_resolver_serves_unknown_modules() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::Call { func_id: 1, argc: 0 },
        I::Ret,
    ]);
    builder.import("game", "answer", &[], t_i32);

    let module = load_module(&builder.build()).expect("load");
    let mut vm = Interpreter::new(module, VmConfig::default())
        .expect("construct")
        .with_host(Box::new(
            |module: &str, symbol: &str, _args: &[Slot], _ctx: &mut HostContext<'_>| {
                if module == "game" && symbol == "answer" {
                    Ok(HostOutcome::Return(42))
                } else {
                    Ok(HostOutcome::Unknown)
                }
            },
        ));
    match vm.execute() {
        ProgramState::Halted { exit_code } => assert_eq!(exit_code, 42),
        other => panic!("unexpected state {other:?}"),
    }
}

#[test]
fn missing_import_traps_with_both_names() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::Call { func_id: 1, argc: 0 },
        I::Ret,
    ]);
    builder.import("nowhere", "nothing", &[], t_i32);

    let info = trap(run(builder));
    assert_eq!(info.reason, TrapReason::MissingImport);
    assert!(info.to_string().contains("nowhere.nothing"));
}

#[test]
fn host_error_surfaces_as_trap_message() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("main", &[], t_i32, 0, &[
        I::Enter(0),
        I::Call { func_id: 1, argc: 0 },
        I::Ret,
    ]);
    builder.import("game", "broken", &[], t_i32);

    let module = load_module(&builder.build()).expect("load");
    let mut vm = Interpreter::new(module, VmConfig::default())
        .expect("construct")
        .with_host(Box::new(
            |_: &str, _: &str, _: &[Slot], _: &mut HostContext<'_>| {
                Err(HostError("backend exploded".into()))
            },
        ));
    match vm.execute() {
        ProgramState::Trapped(info) => {
            assert_eq!(info.reason, TrapReason::HostError);
            assert!(info.to_string().contains("backend exploded"));
        }
        other => panic!("unexpected state {other:?}"),
    }
}

#[test]
fn jit_counters_mark_hot_functions() {
    let mut builder = ModuleBuilder::new();
    let t_i32 = builder.add_type(K::I32);
    builder.function("leaf", &[], t_i32, 0, &[I::Enter(0), I::ConstI32(0), I::Ret]);
    // Call the leaf 1200 times.
    builder.function(
        "main",
        &[],
        t_i32,
        1,
        &[
            I::Enter(1),
            I::ConstI32(0),
            I::StoreLocal(0),
            // loop head at 13
            I::LoadLocal(0),
            I::ConstI32(1200),
            I::CmpLt(K::I32),
            I::JmpFalse(24),
            I::Call { func_id: 0, argc: 0 },
            I::Pop,
            I::LoadLocal(0),
            I::Inc(K::I32),
            I::StoreLocal(0),
            I::Jmp(-41),
            // exit at 54
            I::ConstI32(0),
            I::Ret,
        ],
    );
    let module = load_module(&builder.entry(1).build()).expect("load");
    let mut vm = Interpreter::new(module, VmConfig { enable_jit: true, ..VmConfig::default() })
        .expect("construct");
    assert!(matches!(vm.execute(), ProgramState::Halted { exit_code: 0 }));
    assert!(vm.profiler().is_hot(0), "leaf crossed the hot threshold");
    assert_eq!(vm.profiler().call_count(0), 1200);
    assert!(!vm.profiler().is_hot(1));
}

#[test]
fn profile_spans_count_entries() {
    let builder = ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ProfileStart(7),
        I::ProfileEnd(7),
        I::ProfileStart(7),
        I::ProfileEnd(7),
        I::Halt,
    ]);
    let module = load_module(&builder.build()).expect("load");
    let mut vm = Interpreter::new(module, VmConfig::default()).expect("construct");
    vm.execute();
    assert_eq!(vm.profiler().span_count(7), 2);
}
