//! The per-opcode execution match. Numeric work lives in `alu`, frame
//! flow in `flow`, heap objects in `heap_ops`; this file is the routing
//! plus the handful of opcodes small enough to execute inline. The hot
//! path allocates nothing: decode yields a by-value instruction and
//! every helper works on existing buffers.

use sbc_asm::{Handle, Instruction, Slot, TrapReason};

use crate::interpreter::alu::{ArithOp, BitOp, CmpOp, UnaryOp};
use crate::interpreter::internal::{RunResult, RuntimeTrap};
use crate::interpreter::{intrinsics, Interpreter};
use crate::module::ConstEntry;
use crate::state::ExecuteState;

impl Interpreter {
    pub(crate) fn instruction(
        &mut self,
        insn: &Instruction,
        pc: u32,
        next_pc: u32,
    ) -> RunResult<ExecuteState> {
        use Instruction as I;

        match *insn {
            I::Halt => {
                let exit_code = self.stack.pop().map(|v| v as u32 as i32).unwrap_or(0);
                return Ok(ExecuteState::Halted(exit_code));
            }
            I::Trap => {
                return Err(RuntimeTrap::new(TrapReason::ExplicitTrap, "explicit trap"));
            }
            I::Line { line, column } => {
                self.frame_mut()?.line = Some((line, column));
            }
            I::Breakpoint => {
                if self.config.break_on_breakpoint {
                    return Err(RuntimeTrap::new(TrapReason::Breakpoint, "breakpoint"));
                }
            }

            I::Jmp(rel) => self.jump(next_pc, rel)?,
            I::JmpTrue(rel) => {
                let taken = self.pop()? != 0;
                if taken {
                    self.jump(next_pc, rel)?;
                } else {
                    self.frame_mut()?.line = None;
                }
            }
            I::JmpFalse(rel) => {
                let taken = self.pop()? == 0;
                if taken {
                    self.jump(next_pc, rel)?;
                } else {
                    self.frame_mut()?.line = None;
                }
            }
            I::JmpTable { table_const, default_rel } => {
                let key = self.pop()? as u32 as i32;
                let rel = match self.module.consts.get(table_const as usize) {
                    Some(ConstEntry::JmpTable(cases)) => usize::try_from(key)
                        .ok()
                        .and_then(|k| cases.get(k).copied())
                        .unwrap_or(default_rel),
                    _ => {
                        return Err(RuntimeTrap::new(
                            TrapReason::UnreachableExecuted,
                            format!("const {table_const} is not a jump table"),
                        ))
                    }
                };
                self.jump(next_pc, rel)?;
            }
            I::Ret => return self.ret(),
            I::ProfileStart(id) => self.profiler.span_start(id),
            I::ProfileEnd(id) => self.profiler.span_end(id),

            I::Pop => {
                self.pop()?;
            }
            I::Dup => {
                let top = self.peek(0)?;
                self.push(top)?;
            }
            I::Dup2 => {
                let top = self.peek(0)?;
                let below = self.peek(1)?;
                self.push(below)?;
                self.push(top)?;
            }
            I::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a)?;
                self.push(b)?;
            }
            I::Rot => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                self.push(b)?;
                self.push(a)?;
                self.push(c)?;
            }

            // Narrow immediates land widened, matching the slot model.
            I::ConstI8(v) => self.push(v as i32 as u32 as Slot)?,
            I::ConstI16(v) => self.push(v as i32 as u32 as Slot)?,
            I::ConstI32(v) => self.push(v as u32 as Slot)?,
            I::ConstI64(v) => self.push(v as Slot)?,
            I::ConstU8(v) => self.push(v as Slot)?,
            I::ConstU16(v) => self.push(v as Slot)?,
            I::ConstU32(v) => self.push(v as Slot)?,
            I::ConstU64(v) => self.push(v)?,
            I::ConstF32(v) => self.push(v.to_bits() as Slot)?,
            I::ConstF64(v) => self.push(v.to_bits())?,
            I::ConstChar(v) => self.push(v as Slot)?,
            I::ConstBool(v) => self.push(v as Slot)?,
            I::ConstNull => self.push(0)?,
            I::ConstString(id) => {
                self.maybe_collect();
                let handle = self.intern_string(id)?;
                self.push(handle as Slot)?;
            }
            I::ConstI128(id) => match self.module.consts.get(id as usize) {
                Some(ConstEntry::I128(v)) => self.push_wide(*v as u128)?,
                _ => {
                    return Err(RuntimeTrap::new(
                        TrapReason::UnreachableExecuted,
                        "ConstI128 of non-i128 const",
                    ))
                }
            },
            I::ConstU128(id) => match self.module.consts.get(id as usize) {
                Some(ConstEntry::U128(v)) => self.push_wide(*v)?,
                _ => {
                    return Err(RuntimeTrap::new(
                        TrapReason::UnreachableExecuted,
                        "ConstU128 of non-u128 const",
                    ))
                }
            },

            I::LoadLocal(index) => {
                let value = self.local(index)?;
                self.push(value)?;
            }
            I::StoreLocal(index) => {
                let value = self.pop()?;
                self.set_local(index, value)?;
            }
            I::Enter(_) => {
                // The window was sized and zeroed when the frame pushed.
            }
            I::Leave => {
                let base = self.frame()?.locals_base;
                self.locals.truncate(base);
                self.frame_mut()?.locals_count = 0;
            }
            I::LoadGlobal(index) => {
                let (base, slots) = self.global_slots(index)?;
                for offset in 0..slots {
                    let value = self.globals[base + offset];
                    self.push(value)?;
                }
            }
            I::StoreGlobal(index) => {
                let (base, slots) = self.global_slots(index)?;
                for offset in (0..slots).rev() {
                    let value = self.pop()?;
                    self.globals[base + offset] = value;
                }
            }
            I::LoadUpvalue(index) => self.load_upvalue(index)?,
            I::StoreUpvalue(index) => self.store_upvalue(index)?,

            I::Add(kind) => self.arith(kind, ArithOp::Add)?,
            I::Sub(kind) => self.arith(kind, ArithOp::Sub)?,
            I::Mul(kind) => self.arith(kind, ArithOp::Mul)?,
            I::Div(kind) => self.arith(kind, ArithOp::Div)?,
            I::Rem(kind) => self.arith(kind, ArithOp::Rem)?,
            I::Neg(kind) => self.unary(kind, UnaryOp::Neg)?,
            I::Inc(kind) => self.unary(kind, UnaryOp::Inc)?,
            I::Dec(kind) => self.unary(kind, UnaryOp::Dec)?,
            I::BitAnd(kind) => self.bitop(kind, BitOp::And)?,
            I::BitOr(kind) => self.bitop(kind, BitOp::Or)?,
            I::BitXor(kind) => self.bitop(kind, BitOp::Xor)?,
            I::BitNot(kind) => self.unary(kind, UnaryOp::BitNot)?,
            I::Shl(kind) => self.bitop(kind, BitOp::Shl)?,
            I::Shr(kind) => self.bitop(kind, BitOp::Shr)?,

            I::CmpEq(kind) => self.compare(kind, CmpOp::Eq)?,
            I::CmpNe(kind) => self.compare(kind, CmpOp::Ne)?,
            I::CmpLt(kind) => self.compare(kind, CmpOp::Lt)?,
            I::CmpLe(kind) => self.compare(kind, CmpOp::Le)?,
            I::CmpGt(kind) => self.compare(kind, CmpOp::Gt)?,
            I::CmpGe(kind) => self.compare(kind, CmpOp::Ge)?,

            I::IsNull => {
                let handle = self.pop()?;
                self.push((handle == 0) as Slot)?;
            }
            I::RefEq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push((a as Handle == b as Handle) as Slot)?;
            }
            I::RefNe => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push((a as Handle != b as Handle) as Slot)?;
            }
            I::TypeOf => self.type_of()?,
            I::NewObject(type_id) => self.new_object(type_id)?,
            I::LoadField(field_id) => self.load_field(field_id)?,
            I::StoreField(field_id) => self.store_field(field_id)?,

            I::NewArray { elem, type_id, length } => self.new_array(elem, type_id, length)?,
            I::ArrayLen => self.array_len()?,
            I::ArrayGet(elem) => self.array_get(elem)?,
            I::ArraySet(elem) => self.array_set(elem)?,

            I::NewList { elem, type_id, capacity } => self.new_list(elem, type_id, capacity)?,
            I::ListLen => self.list_len()?,
            I::ListPush(elem) => self.list_push(elem)?,
            I::ListPop(elem) => self.list_pop(elem)?,
            I::ListGet(elem) => self.list_get(elem)?,
            I::ListSet(elem) => self.list_set(elem)?,
            I::ListInsert(elem) => self.list_insert(elem)?,
            I::ListRemove(elem) => self.list_remove(elem)?,
            I::ListClear => self.list_clear()?,

            I::StringLen => self.string_len()?,
            I::StringConcat => self.string_concat()?,
            I::StringGetChar => self.string_get_char()?,
            I::StringSlice => self.string_slice()?,

            I::Call { func_id, argc } => {
                self.frame_mut()?.line = None;
                return self.call_or_import(func_id, argc, pc, false);
            }
            I::CallIndirect { sig_id, argc } => {
                self.frame_mut()?.line = None;
                return self.call_indirect(sig_id, argc, pc);
            }
            I::TailCall { func_id, argc } => {
                return self.call_or_import(func_id, argc, pc, true);
            }
            I::CallCheck(headroom) => {
                if self.stack.len() + headroom as usize > self.module.header.stack_max as usize {
                    return Err(RuntimeTrap::new(
                        TrapReason::StackProbeFailed,
                        format!("{} slots of headroom unavailable", headroom),
                    ));
                }
            }
            I::Intrinsic(id) => self.intrinsic(id)?,
            I::SysCall => {
                return Err(RuntimeTrap::new(TrapReason::ReservedOpcode, "SysCall is reserved"));
            }
            I::NewClosure { func_id, upvalue_count } => self.new_closure(func_id, upvalue_count)?,
        }

        Ok(ExecuteState::Proceed)
    }

    /// Relative jump from the byte after the operand. Validity was
    /// proven by the verifier; the checks stay for the unverified mode.
    fn jump(&mut self, base: u32, rel: i32) -> RunResult<()> {
        let target = base as i64 + rel as i64;
        let func_id = self.frame()?.func_id;
        let code_len = self.module.func_code(func_id).len() as i64;
        if target < 0 || target >= code_len || !self.module.is_insn_start(func_id, target as u32) {
            return Err(RuntimeTrap::new(
                TrapReason::UnreachableExecuted,
                format!("jump to invalid target {target}"),
            ));
        }
        let frame = self.frame_mut()?;
        frame.pc = target as u32;
        frame.line = None;
        Ok(())
    }

    fn global_slots(&self, index: u32) -> RunResult<(usize, usize)> {
        let base = self
            .globals_layout
            .offsets
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("global {index}"))
            })?;
        let global = self.module.globals[index as usize];
        let slots = self.module.types[global.type_id as usize].kind.slot_count();
        Ok((base as usize, slots))
    }

    fn intrinsic(&mut self, id: u32) -> RunResult<()> {
        let sig = intrinsics::signature(id).ok_or_else(|| {
            RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("unknown intrinsic {id}"))
        })?;
        let mut args = vec![0 as Slot; sig.params.len()];
        for slot in (0..args.len()).rev() {
            args[slot] = self.pop()?;
        }
        let result = intrinsics::eval(id, &args, &self.heap, &mut self.rng, self.mono_start)
            .map_err(|(reason, message)| RuntimeTrap::new(reason, message))?;
        match (result, sig.ret) {
            (Some(value), Some(_)) => self.push(value),
            _ => Ok(()),
        }
    }
}
