use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sbc_asm::TrapReason;
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
fn add_two_constants() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(40),
        I::ConstI32(2),
        I::Add(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 42);
}

#[test]
fn signed_division_by_zero_traps() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::ConstI32(0),
        I::Div(K::I32),
        I::Halt,
    ]));
    let info = trap(status);
    assert_eq!(info.reason, TrapReason::DivisionByZero);
    assert!(info.to_string().contains("division by zero"));
}

#[test]
fn int_min_over_minus_one_traps() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(i32::MIN),
        I::ConstI32(-1),
        I::Div(K::I32),
        I::Halt,
    ]));
    assert_eq!(trap(status).reason, TrapReason::ArithmeticOverflow);
}

#[test]
fn unsigned_division_by_zero_wraps_to_zero() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstU32(77),
        I::ConstU32(0),
        I::Div(K::U32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 0);

    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstU64(77),
        I::ConstU64(0),
        I::Rem(K::U64),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 0);
}

#[test]
fn narrow_signed_increment_wraps_at_declared_width() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI8(127),
        I::Inc(K::I8),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), -128);
}

#[test]
fn narrow_unsigned_arithmetic_masks() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstU8(250),
        I::ConstU8(10),
        I::Add(K::U8),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 4);
}

#[test]
fn i64_multiplication_truncates_into_exit_code() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI64(6),
        I::ConstI64(7),
        I::Mul(K::I64),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 42);
}

#[test]
fn shift_amount_is_masked_to_width() {
    // 1 << 33 on I32 behaves as 1 << 1.
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::ConstI32(33),
        I::Shl(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 2);
}

#[test]
fn arithmetic_shift_right_keeps_sign() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(-8),
        I::ConstI32(1),
        I::Shr(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), -4);
}

#[test]
fn logical_shift_right_on_unsigned() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstU32(0x8000_0000),
        I::ConstU32(31),
        I::Shr(K::U32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn bitwise_ops_compose() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(0b1100),
        I::ConstI32(0b1010),
        I::BitAnd(K::I32),
        I::ConstI32(0b0001),
        I::BitOr(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 0b1001);
}

#[test]
fn float_comparison_produces_bool() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstF64(2.5),
        I::ConstF64(2.0),
        I::Mul(K::F64),
        I::ConstF64(5.0),
        I::CmpEq(K::F64),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn float_division_by_zero_follows_ieee() {
    // inf > 1e300 is true; no trap anywhere.
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstF64(1.0),
        I::ConstF64(0.0),
        I::Div(K::F64),
        I::ConstF64(1e300),
        I::CmpGt(K::F64),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn wide_arithmetic_over_slot_pairs() {
    let mut builder = ModuleBuilder::new();
    let big = builder.i128_const(1 << 100);
    let one = builder.i128_const(1);
    let expected = builder.i128_const((1i128 << 100) + 1);
    let status = run(builder.simple_entry(&[
        I::Enter(0),
        I::ConstI128(big),
        I::ConstI128(one),
        I::Add(K::I128),
        I::ConstI128(expected),
        I::CmpEq(K::I128),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn char_widens_into_i32_comparison() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstChar(65),
        I::ConstI32(65),
        I::CmpEq(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn neg_and_abs_intrinsic_agree() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(-41),
        I::Neg(K::I32),
        I::ConstI32(-41),
        I::Intrinsic(0x00), // abs i32
        I::CmpEq(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);
}

#[test]
fn min_max_intrinsics() {
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(3),
        I::ConstI32(9),
        I::Intrinsic(0x10), // min i32
        I::ConstI32(3),
        I::Intrinsic(0x20), // max i32
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 3);
}

#[test]
fn randomized_wrapping_addition_matches_host() {
    let rng = &mut StdRng::seed_from_u64(2322u64);
    for _ in 0..32 {
        let a: i32 = rng.gen_range(-1000..1000);
        let b: i32 = rng.gen_range(-1000..1000);
        let status = run(ModuleBuilder::new().simple_entry(&[
            I::Enter(0),
            I::ConstI32(a),
            I::ConstI32(b),
            I::Add(K::I32),
            I::Halt,
        ]));
        assert_eq!(exit_code(status), a.wrapping_add(b));
    }
}

#[test]
fn stack_shape_ops() {
    // Rot brings the third slot to the top: [1, 2, 3] -> [2, 3, 1].
    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(1),
        I::ConstI32(2),
        I::ConstI32(3),
        I::Rot,
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 1);

    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(5),
        I::ConstI32(9),
        I::Swap,
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 5);

    let status = run(ModuleBuilder::new().simple_entry(&[
        I::Enter(0),
        I::ConstI32(20),
        I::Dup,
        I::Add(K::I32),
        I::Halt,
    ]));
    assert_eq!(exit_code(status), 40);
}
