//! The fixed intrinsic set: ids, signatures, and evaluation.
//!
//! Ids are stable wire values. The verifier types intrinsic calls from
//! [`signature`]; the engine evaluates them here. Narrow integer kinds
//! reach abs/min/max through their widened 32-bit form.

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sbc_asm::{Slot, TrapReason, TypeKind};

use crate::heap::{Heap, ObjectData};

/// Intrinsic id words.
pub mod ids {
    /// `abs` on I32.
    pub const ABS_I32: u32 = 0x00;
    /// `abs` on I64.
    pub const ABS_I64: u32 = 0x01;
    /// `abs` on F32.
    pub const ABS_F32: u32 = 0x02;
    /// `abs` on F64.
    pub const ABS_F64: u32 = 0x03;
    /// `min` family base; add the kind offset.
    pub const MIN_I32: u32 = 0x10;
    /// `min` on I64.
    pub const MIN_I64: u32 = 0x11;
    /// `min` on U32.
    pub const MIN_U32: u32 = 0x12;
    /// `min` on U64.
    pub const MIN_U64: u32 = 0x13;
    /// `min` on F32.
    pub const MIN_F32: u32 = 0x14;
    /// `min` on F64.
    pub const MIN_F64: u32 = 0x15;
    /// `max` family base; add the kind offset.
    pub const MAX_I32: u32 = 0x20;
    /// `max` on I64.
    pub const MAX_I64: u32 = 0x21;
    /// `max` on U32.
    pub const MAX_U32: u32 = 0x22;
    /// `max` on U64.
    pub const MAX_U64: u32 = 0x23;
    /// `max` on F32.
    pub const MAX_F32: u32 = 0x24;
    /// `max` on F64.
    pub const MAX_F64: u32 = 0x25;
    /// Monotonic clock, nanoseconds.
    pub const TIME_MONO_NS: u32 = 0x30;
    /// Wall clock, nanoseconds since the epoch.
    pub const TIME_WALL_NS: u32 = 0x31;
    /// Uniform random u32.
    pub const RAND_U32: u32 = 0x40;
    /// Uniform random u64.
    pub const RAND_U64: u32 = 0x41;
    /// Write a string to stdout, returning bytes written.
    pub const WRITE_STDOUT: u32 = 0x50;
}

/// Declared signature of an intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrinsicSig {
    /// Parameter kinds in declaration order.
    pub params: &'static [TypeKind],
    /// Return kind, `None` for void.
    pub ret: Option<TypeKind>,
}

/// Signature of a known intrinsic id, `None` for unknown ids.
pub fn signature(id: u32) -> Option<IntrinsicSig> {
    use ids::*;
    use TypeKind as K;

    let sig = |params, ret| IntrinsicSig { params, ret };
    Some(match id {
        ABS_I32 => sig(&[K::I32], Some(K::I32)),
        ABS_I64 => sig(&[K::I64], Some(K::I64)),
        ABS_F32 => sig(&[K::F32], Some(K::F32)),
        ABS_F64 => sig(&[K::F64], Some(K::F64)),
        MIN_I32 | MAX_I32 => sig(&[K::I32, K::I32], Some(K::I32)),
        MIN_I64 | MAX_I64 => sig(&[K::I64, K::I64], Some(K::I64)),
        MIN_U32 | MAX_U32 => sig(&[K::U32, K::U32], Some(K::U32)),
        MIN_U64 | MAX_U64 => sig(&[K::U64, K::U64], Some(K::U64)),
        MIN_F32 | MAX_F32 => sig(&[K::F32, K::F32], Some(K::F32)),
        MIN_F64 | MAX_F64 => sig(&[K::F64, K::F64], Some(K::F64)),
        TIME_MONO_NS | TIME_WALL_NS => sig(&[], Some(K::U64)),
        RAND_U32 => sig(&[], Some(K::U32)),
        RAND_U64 => sig(&[], Some(K::U64)),
        WRITE_STDOUT => sig(&[K::Ref], Some(K::I32)),
        _ => return None,
    })
}

/// Evaluate an intrinsic over already-popped argument slots.
pub fn eval(
    id: u32,
    args: &[Slot],
    heap: &Heap,
    rng: &mut dyn RngCore,
    mono_start: std::time::Instant,
) -> Result<Option<Slot>, (TrapReason, String)> {
    use ids::*;

    let i32_of = |slot: Slot| slot as u32 as i32;
    let f32_of = |slot: Slot| f32::from_bits(slot as u32);
    let f64_of = |slot: Slot| f64::from_bits(slot);

    let value = match id {
        ABS_I32 => i32_of(args[0]).wrapping_abs() as u32 as Slot,
        ABS_I64 => (args[0] as i64).wrapping_abs() as Slot,
        ABS_F32 => f32_of(args[0]).abs().to_bits() as Slot,
        ABS_F64 => f64_of(args[0]).abs().to_bits(),
        MIN_I32 => i32_of(args[0]).min(i32_of(args[1])) as u32 as Slot,
        MIN_I64 => (args[0] as i64).min(args[1] as i64) as Slot,
        MIN_U32 => (args[0] as u32).min(args[1] as u32) as Slot,
        MIN_U64 => args[0].min(args[1]),
        MIN_F32 => f32_of(args[0]).min(f32_of(args[1])).to_bits() as Slot,
        MIN_F64 => f64_of(args[0]).min(f64_of(args[1])).to_bits(),
        MAX_I32 => i32_of(args[0]).max(i32_of(args[1])) as u32 as Slot,
        MAX_I64 => (args[0] as i64).max(args[1] as i64) as Slot,
        MAX_U32 => (args[0] as u32).max(args[1] as u32) as Slot,
        MAX_U64 => args[0].max(args[1]),
        MAX_F32 => f32_of(args[0]).max(f32_of(args[1])).to_bits() as Slot,
        MAX_F64 => f64_of(args[0]).max(f64_of(args[1])).to_bits(),
        TIME_MONO_NS => mono_start.elapsed().as_nanos() as Slot,
        TIME_WALL_NS => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as Slot)
            .unwrap_or(0),
        RAND_U32 => rng.next_u32() as Slot,
        RAND_U64 => rng.next_u64(),
        WRITE_STDOUT => {
            let handle = args[0] as u32;
            let object = heap
                .get(handle)
                .ok_or((TrapReason::NullAccess, "write_stdout of null".to_owned()))?;
            let ObjectData::Str(text) = &object.data else {
                return Err((TrapReason::TypeMismatch, "write_stdout expects a string".into()));
            };
            let mut stdout = std::io::stdout().lock();
            let written = stdout.write(text.as_bytes()).unwrap_or(0);
            let _ = stdout.flush();
            written as u32 as Slot
        }
        _ => {
            return Err((TrapReason::UnreachableExecuted, format!("unknown intrinsic {id}")));
        }
    };

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::time::Instant;

    fn run(id: u32, args: &[Slot]) -> Slot {
        let heap = Heap::new();
        let mut rng = StepRng::new(7, 1);
        eval(id, args, &heap, &mut rng, Instant::now())
            .expect("eval")
            .expect("value")
    }

    #[test]
    fn abs_and_min_max() {
        assert_eq!(run(ids::ABS_I32, &[(-5i32) as u32 as Slot]) as u32 as i32, 5);
        assert_eq!(run(ids::MIN_I32, &[(-2i32) as u32 as Slot, 3]) as u32 as i32, -2);
        assert_eq!(run(ids::MAX_U64, &[9, 4]), 9);
        assert_eq!(
            f64::from_bits(run(ids::MIN_F64, &[2.5f64.to_bits(), 1.5f64.to_bits()])),
            1.5
        );
    }

    #[test]
    fn unknown_id_has_no_signature() {
        assert!(signature(0x99).is_none());
        assert!(signature(ids::RAND_U64).is_some());
    }
}
