//! Per-instruction transfer function of the abstract interpreter.

use sbc_asm::{ElemKind, Instruction, TypeKind};

use super::state::{decl_accepts, decl_types, AbsTy, AbstractState, RefTy};
use crate::consts::VOID_TYPE;
use crate::error::VerifyError;
use crate::interpreter::intrinsics;
use crate::module::{ConstEntry, Module};

/// Immutable per-function context shared by every transfer step.
pub(super) struct FuncCtx<'m> {
    pub module: &'m Module,
    pub func_id: u32,
    pub locals: u32,
    pub ret_type_id: u32,
    pub upvals: &'m [TypeKind],
    pub code_len: u32,
    pub insn_starts: &'m [u32],
}

impl FuncCtx<'_> {
    fn err(&self, pc: u32, message: impl Into<String>) -> VerifyError {
        VerifyError::new(self.func_id, pc, message)
    }

    /// Resolve a relative branch to an absolute in-function pc that is an
    /// instruction start.
    pub fn branch_target(&self, pc: u32, base: u32, rel: i32) -> Result<u32, VerifyError> {
        let target = base as i64 + rel as i64;
        if target < 0 || target >= self.code_len as i64 {
            return Err(self.err(pc, format!("branch target {target} outside function")));
        }
        let target = target as u32;
        if self.insn_starts.binary_search(&target).is_err() {
            return Err(self.err(pc, format!("branch into mid-instruction at {target}")));
        }
        Ok(target)
    }
}

/// Control-flow effect of one instruction.
pub(super) enum Flow {
    /// Execution continues at the next instruction.
    FallThrough,
    /// Unconditional jump.
    Jump(u32),
    /// Conditional: both fall-through and the target are successors.
    Branch(u32),
    /// Jump table: every case plus the default are successors.
    Table(Vec<u32>),
    /// The path ends here; produced exactly for the
    /// [`sbc_asm::Opcode::is_terminator`] opcodes.
    Stop,
}

struct Ops<'a, 'm> {
    ctx: &'a FuncCtx<'m>,
    st: &'a mut AbstractState,
    pc: u32,
}

impl Ops<'_, '_> {
    fn err(&self, message: impl Into<String>) -> VerifyError {
        self.ctx.err(self.pc, message)
    }

    fn push(&mut self, ty: AbsTy) {
        self.st.stack.push(ty);
    }

    fn push_all(&mut self, tys: &[AbsTy]) {
        self.st.stack.extend_from_slice(tys);
    }

    fn pop(&mut self) -> Result<AbsTy, VerifyError> {
        self.st.stack.pop().ok_or_else(|| self.err("stack underflow"))
    }

    /// Pop one single-slot value; 128-bit halves may not be torn off.
    fn pop_single(&mut self) -> Result<AbsTy, VerifyError> {
        let ty = self.pop()?;
        if ty.is_wide_half() {
            return Err(self.err("operation would tear a 128-bit pair"));
        }
        Ok(ty)
    }

    fn pop_exact(&mut self, want: AbsTy, what: &str) -> Result<(), VerifyError> {
        let got = self.pop()?;
        if got != want {
            return Err(self.err(format!("{what} expects {want}, found {got}")));
        }
        Ok(())
    }

    fn pop_ref(&mut self, what: &str) -> Result<RefTy, VerifyError> {
        match self.pop()? {
            AbsTy::Ref(r) => Ok(r),
            other => Err(self.err(format!("{what} expects a reference, found {other}"))),
        }
    }

    /// Pop a full value of a declared numeric kind: a Hi/Lo pair for the
    /// wide kinds, one exact slot otherwise.
    fn pop_kind(&mut self, kind: TypeKind, what: &str) -> Result<(), VerifyError> {
        match kind {
            TypeKind::I128 => {
                self.pop_exact(AbsTy::I128Lo, what)?;
                self.pop_exact(AbsTy::I128Hi, what)
            }
            TypeKind::U128 => {
                self.pop_exact(AbsTy::U128Lo, what)?;
                self.pop_exact(AbsTy::U128Hi, what)
            }
            TypeKind::Ref => {
                self.pop_ref(what)?;
                Ok(())
            }
            other => {
                let want = AbsTy::scalar(other)
                    .ok_or_else(|| self.err(format!("{what}: invalid kind {other}")))?;
                self.pop_exact(want, what)
            }
        }
    }

    /// Pop a comparison operand, applying the narrow-widening rules.
    fn pop_cmp_operand(&mut self, kind: TypeKind, what: &str) -> Result<(), VerifyError> {
        match kind {
            TypeKind::I32 => {
                let got = self.pop()?;
                if !matches!(got, AbsTy::I32 | AbsTy::I8 | AbsTy::I16 | AbsTy::Char) {
                    return Err(self.err(format!("{what} expects an I32-widenable value, found {got}")));
                }
                Ok(())
            }
            TypeKind::U32 => {
                let got = self.pop()?;
                if !matches!(got, AbsTy::U32 | AbsTy::U8 | AbsTy::U16) {
                    return Err(self.err(format!("{what} expects a U32-widenable value, found {got}")));
                }
                Ok(())
            }
            other => self.pop_kind(other, what),
        }
    }

    /// Pop an element value being written into an array or list.
    fn pop_elem_write(&mut self, elem: ElemKind, what: &str) -> Result<(), VerifyError> {
        match elem {
            ElemKind::I32 => {
                let got = self.pop()?;
                // Narrow kinds arrive widened; Bool is explicitly rejected.
                let ok = matches!(
                    got,
                    AbsTy::I32 | AbsTy::I8 | AbsTy::I16 | AbsTy::U8 | AbsTy::U16 | AbsTy::Char
                );
                if !ok {
                    return Err(self.err(format!("{what} expects an I32 element, found {got}")));
                }
                Ok(())
            }
            ElemKind::I64 => self.pop_exact(AbsTy::I64, what),
            ElemKind::F32 => self.pop_exact(AbsTy::F32, what),
            ElemKind::F64 => self.pop_exact(AbsTy::F64, what),
            ElemKind::Ref => {
                self.pop_ref(what)?;
                Ok(())
            }
        }
    }

    fn pop_array(&mut self, elem: ElemKind, what: &str) -> Result<(), VerifyError> {
        match self.pop_ref(what)? {
            RefTy::Array(e) if e == elem => Ok(()),
            RefTy::Null | RefTy::Any => Ok(()),
            other => Err(self.err(format!("{what} expects an {elem} array, found {other:?}"))),
        }
    }

    fn pop_list(&mut self, elem: ElemKind, what: &str) -> Result<(), VerifyError> {
        match self.pop_ref(what)? {
            RefTy::List(e) if e == elem => Ok(()),
            RefTy::Null | RefTy::Any => Ok(()),
            other => Err(self.err(format!("{what} expects an {elem} list, found {other:?}"))),
        }
    }

    fn pop_string(&mut self, what: &str) -> Result<(), VerifyError> {
        match self.pop_ref(what)? {
            RefTy::Str | RefTy::Null | RefTy::Any => Ok(()),
            other => Err(self.err(format!("{what} expects a string, found {other:?}"))),
        }
    }

    /// Pop one value matching a declared type id, including the strict
    /// object typing and wide pairs.
    fn pop_decl(&mut self, type_id: u32, what: &str) -> Result<(), VerifyError> {
        let decl = &self.ctx.module.types[type_id as usize];
        match decl.kind {
            TypeKind::I128 if !decl.is_object() => {
                self.pop_exact(AbsTy::I128Lo, what)?;
                self.pop_exact(AbsTy::I128Hi, what)
            }
            TypeKind::U128 if !decl.is_object() => {
                self.pop_exact(AbsTy::U128Lo, what)?;
                self.pop_exact(AbsTy::U128Hi, what)
            }
            _ => {
                let got = self.pop()?;
                if !decl_accepts(self.ctx.module, type_id, got) {
                    return Err(self.err(format!("{what}: {got} does not match declared type")));
                }
                Ok(())
            }
        }
    }

    /// Pop call arguments in reverse declaration order.
    fn pop_args(&mut self, param_type_ids: &[u32], what: &str) -> Result<(), VerifyError> {
        for type_id in param_type_ids.iter().rev() {
            self.pop_decl(*type_id, what)?;
        }
        Ok(())
    }

    fn push_ret(&mut self, ret_type_id: u32) {
        if ret_type_id != VOID_TYPE {
            let types = decl_types(self.ctx.module, ret_type_id);
            self.push_all(&types);
        }
    }

    fn const_entry(&self, id: u32, what: &str) -> Result<&ConstEntry, VerifyError> {
        self.ctx
            .module
            .consts
            .get(id as usize)
            .ok_or_else(|| self.err(format!("{what}: const {id} out of range")))
    }

    fn local_decl(&self, index: u32) -> Result<usize, VerifyError> {
        let slot = index as usize;
        if slot >= self.ctx.locals as usize {
            return Err(self.err(format!("local {index} outside window of {}", self.ctx.locals)));
        }
        Ok(slot)
    }
}

/// Whether two declared return types agree for tail calls.
fn ret_compatible(module: &Module, a: u32, b: u32) -> bool {
    if a == b {
        return true;
    }
    if a == VOID_TYPE || b == VOID_TYPE {
        return false;
    }
    let (ta, tb) = (&module.types[a as usize], &module.types[b as usize]);
    // Distinct object types never agree; scalar records agree by kind.
    !ta.is_object() && !tb.is_object() && ta.kind == tb.kind
}

/// Apply `insn` at `pc` to `state`, returning its control-flow effect.
pub(super) fn transfer(
    ctx: &FuncCtx<'_>,
    state: &mut AbstractState,
    pc: u32,
    next_pc: u32,
    insn: &Instruction,
) -> Result<Flow, VerifyError> {
    use Instruction as I;

    // After Leave only path terminators may run: the locals window is
    // gone, so nothing that could fall through is allowed.
    if state.window_dropped && !insn.opcode().is_terminator() {
        return Err(ctx.err(pc, "only frame exits may follow Leave"));
    }

    let mut ops = Ops { ctx, st: state, pc };

    let flow = match *insn {
        I::Halt | I::Trap => Flow::Stop,
        I::Line { .. } | I::Breakpoint | I::ProfileStart(_) | I::ProfileEnd(_) => Flow::FallThrough,

        I::Jmp(rel) => Flow::Jump(ctx.branch_target(pc, next_pc, rel)?),
        I::JmpTrue(rel) | I::JmpFalse(rel) => {
            ops.pop_exact(AbsTy::Bool, "conditional jump")?;
            Flow::Branch(ctx.branch_target(pc, next_pc, rel)?)
        }
        I::JmpTable { table_const, default_rel } => {
            ops.pop_exact(AbsTy::I32, "JmpTable key")?;
            let cases = match ops.const_entry(table_const, "JmpTable")? {
                ConstEntry::JmpTable(cases) => cases.clone(),
                _ => return Err(ctx.err(pc, "JmpTable const is not a jump table")),
            };
            let mut targets = Vec::with_capacity(cases.len() + 1);
            for rel in cases {
                targets.push(ctx.branch_target(pc, next_pc, rel)?);
            }
            targets.push(ctx.branch_target(pc, next_pc, default_rel)?);
            Flow::Table(targets)
        }
        I::Ret => {
            if ctx.ret_type_id != VOID_TYPE {
                ops.pop_decl(ctx.ret_type_id, "return value")?;
            }
            if !ops.st.stack.is_empty() {
                let what = if ctx.ret_type_id == VOID_TYPE {
                    "void return with a non-empty stack"
                } else {
                    "return with residual stack values"
                };
                return Err(ctx.err(pc, what));
            }
            Flow::Stop
        }

        I::Pop => {
            ops.pop_single()?;
            Flow::FallThrough
        }
        I::Dup => {
            let top = *ops
                .st
                .stack
                .last()
                .ok_or_else(|| ops.err("stack underflow"))?;
            if top.is_wide_half() {
                return Err(ops.err("Dup would tear a 128-bit pair"));
            }
            ops.push(top);
            Flow::FallThrough
        }
        I::Dup2 => {
            let len = ops.st.stack.len();
            if len < 2 {
                return Err(ops.err("stack underflow"));
            }
            let (below, top) = (ops.st.stack[len - 2], ops.st.stack[len - 1]);
            let pair_ok = matches!(
                (below, top),
                (AbsTy::I128Hi, AbsTy::I128Lo) | (AbsTy::U128Hi, AbsTy::U128Lo)
            );
            if !pair_ok && (below.is_wide_half() || top.is_wide_half()) {
                return Err(ops.err("Dup2 would tear a 128-bit pair"));
            }
            ops.push(below);
            ops.push(top);
            Flow::FallThrough
        }
        I::Swap => {
            let a = ops.pop_single()?;
            let b = ops.pop_single()?;
            ops.push(a);
            ops.push(b);
            Flow::FallThrough
        }
        I::Rot => {
            let a = ops.pop_single()?;
            let b = ops.pop_single()?;
            let c = ops.pop_single()?;
            ops.push(b);
            ops.push(a);
            ops.push(c);
            Flow::FallThrough
        }

        I::ConstI8(_) => {
            ops.push(AbsTy::I8);
            Flow::FallThrough
        }
        I::ConstI16(_) => {
            ops.push(AbsTy::I16);
            Flow::FallThrough
        }
        I::ConstI32(_) => {
            ops.push(AbsTy::I32);
            Flow::FallThrough
        }
        I::ConstI64(_) => {
            ops.push(AbsTy::I64);
            Flow::FallThrough
        }
        I::ConstU8(_) => {
            ops.push(AbsTy::U8);
            Flow::FallThrough
        }
        I::ConstU16(_) => {
            ops.push(AbsTy::U16);
            Flow::FallThrough
        }
        I::ConstU32(_) => {
            ops.push(AbsTy::U32);
            Flow::FallThrough
        }
        I::ConstU64(_) => {
            ops.push(AbsTy::U64);
            Flow::FallThrough
        }
        I::ConstF32(_) => {
            ops.push(AbsTy::F32);
            Flow::FallThrough
        }
        I::ConstF64(_) => {
            ops.push(AbsTy::F64);
            Flow::FallThrough
        }
        I::ConstChar(_) => {
            ops.push(AbsTy::Char);
            Flow::FallThrough
        }
        I::ConstBool(_) => {
            ops.push(AbsTy::Bool);
            Flow::FallThrough
        }
        I::ConstNull => {
            ops.push(AbsTy::Ref(RefTy::Null));
            Flow::FallThrough
        }
        I::ConstString(id) => {
            match ops.const_entry(id, "ConstString")? {
                ConstEntry::Str(_) => {}
                _ => return Err(ctx.err(pc, "ConstString const is not a string")),
            }
            ops.push(AbsTy::Ref(RefTy::Str));
            Flow::FallThrough
        }
        I::ConstI128(id) => {
            match ops.const_entry(id, "ConstI128")? {
                ConstEntry::I128(_) => {}
                _ => return Err(ctx.err(pc, "ConstI128 const is not an i128")),
            }
            ops.push(AbsTy::I128Hi);
            ops.push(AbsTy::I128Lo);
            Flow::FallThrough
        }
        I::ConstU128(id) => {
            match ops.const_entry(id, "ConstU128")? {
                ConstEntry::U128(_) => {}
                _ => return Err(ctx.err(pc, "ConstU128 const is not a u128")),
            }
            ops.push(AbsTy::U128Hi);
            ops.push(AbsTy::U128Lo);
            Flow::FallThrough
        }

        // Locals are slot-addressed: a 128-bit value lives in two
        // adjacent slots and moves through two loads or stores. Torn
        // pairs are caught by whichever op consumes the halves.
        I::LoadLocal(index) => {
            let slot = ops.local_decl(index)?;
            let ty = ops.st.locals[slot]
                .ok_or_else(|| ctx.err(pc, format!("load of uninitialized local {index}")))?;
            ops.push(ty);
            Flow::FallThrough
        }
        I::StoreLocal(index) => {
            let slot = ops.local_decl(index)?;
            let value = ops.pop()?;
            store_local(ops.st, ctx, pc, slot, value)?;
            Flow::FallThrough
        }
        I::Enter(_) => {
            // Validity and placement are enforced by the driver; the
            // prologue itself has no stack effect.
            Flow::FallThrough
        }
        I::Leave => {
            ops.st.window_dropped = true;
            Flow::FallThrough
        }
        I::LoadGlobal(index) => {
            let global = ctx
                .module
                .globals
                .get(index as usize)
                .ok_or_else(|| ctx.err(pc, format!("global {index} out of range")))?;
            let types = decl_types(ctx.module, global.type_id);
            ops.push_all(&types);
            Flow::FallThrough
        }
        I::StoreGlobal(index) => {
            let global = ctx
                .module
                .globals
                .get(index as usize)
                .ok_or_else(|| ctx.err(pc, format!("global {index} out of range")))?;
            let decl = &ctx.module.types[global.type_id as usize];
            if decl.is_object() {
                let got = ops.pop()?;
                if !decl_accepts(ctx.module, global.type_id, got) {
                    return Err(ctx.err(pc, format!("StoreGlobal type mismatch: {got}")));
                }
            } else {
                ops.pop_kind(decl.kind, "StoreGlobal")?;
            }
            Flow::FallThrough
        }
        I::LoadUpvalue(index) => {
            let kind = *ctx
                .upvals
                .get(index as usize)
                .ok_or_else(|| ctx.err(pc, format!("upvalue {index} not declared")))?;
            let types = kind_types(kind);
            ops.push_all(&types);
            Flow::FallThrough
        }
        I::StoreUpvalue(index) => {
            let kind = *ctx
                .upvals
                .get(index as usize)
                .ok_or_else(|| ctx.err(pc, format!("upvalue {index} not declared")))?;
            ops.pop_kind(kind, "StoreUpvalue")?;
            Flow::FallThrough
        }

        I::Add(kind) | I::Sub(kind) | I::Mul(kind) | I::Div(kind) | I::Rem(kind) => {
            if !kind.is_numeric() {
                return Err(ctx.err(pc, format!("arithmetic on non-numeric kind {kind}")));
            }
            ops.pop_kind(kind, "arithmetic operand")?;
            ops.pop_kind(kind, "arithmetic operand")?;
            ops.push_all(&kind_types(kind));
            Flow::FallThrough
        }
        I::Neg(kind) => {
            if !kind.is_numeric() || (kind.is_integer() && !kind.is_signed()) {
                return Err(ctx.err(pc, format!("Neg on kind {kind}")));
            }
            ops.pop_kind(kind, "Neg operand")?;
            ops.push_all(&kind_types(kind));
            Flow::FallThrough
        }
        I::Inc(kind) | I::Dec(kind) => {
            if !kind.is_integer() {
                return Err(ctx.err(pc, format!("Inc/Dec on kind {kind}")));
            }
            ops.pop_kind(kind, "Inc/Dec operand")?;
            ops.push_all(&kind_types(kind));
            Flow::FallThrough
        }
        I::BitAnd(kind) | I::BitOr(kind) | I::BitXor(kind) | I::Shl(kind) | I::Shr(kind) => {
            if !kind.is_integer() {
                return Err(ctx.err(pc, format!("bitwise op on kind {kind}")));
            }
            ops.pop_kind(kind, "bitwise operand")?;
            ops.pop_kind(kind, "bitwise operand")?;
            ops.push_all(&kind_types(kind));
            Flow::FallThrough
        }
        I::BitNot(kind) => {
            if !kind.is_integer() {
                return Err(ctx.err(pc, format!("BitNot on kind {kind}")));
            }
            ops.pop_kind(kind, "BitNot operand")?;
            ops.push_all(&kind_types(kind));
            Flow::FallThrough
        }

        I::CmpEq(kind) | I::CmpNe(kind) => {
            if kind == TypeKind::Ref {
                return Err(ctx.err(pc, "use RefEq/RefNe for reference identity"));
            }
            ops.pop_cmp_operand(kind, "comparison operand")?;
            ops.pop_cmp_operand(kind, "comparison operand")?;
            ops.push(AbsTy::Bool);
            Flow::FallThrough
        }
        I::CmpLt(kind) | I::CmpLe(kind) | I::CmpGt(kind) | I::CmpGe(kind) => {
            if !kind.is_numeric() && kind != TypeKind::Char {
                return Err(ctx.err(pc, format!("ordered comparison on kind {kind}")));
            }
            ops.pop_cmp_operand(kind, "comparison operand")?;
            ops.pop_cmp_operand(kind, "comparison operand")?;
            ops.push(AbsTy::Bool);
            Flow::FallThrough
        }

        I::IsNull => {
            ops.pop_ref("IsNull")?;
            ops.push(AbsTy::Bool);
            Flow::FallThrough
        }
        I::RefEq | I::RefNe => {
            ops.pop_ref("reference comparison")?;
            ops.pop_ref("reference comparison")?;
            ops.push(AbsTy::Bool);
            Flow::FallThrough
        }
        I::TypeOf => {
            ops.pop_ref("TypeOf")?;
            ops.push(AbsTy::U32);
            Flow::FallThrough
        }
        I::NewObject(type_id) => {
            let ty = ctx
                .module
                .types
                .get(type_id as usize)
                .ok_or_else(|| ctx.err(pc, format!("NewObject type {type_id} out of range")))?;
            if !ty.is_object() {
                return Err(ctx.err(pc, format!("NewObject of non-object type {type_id}")));
            }
            ops.push(AbsTy::Ref(RefTy::Object(type_id)));
            Flow::FallThrough
        }
        I::LoadField(field_id) => {
            let field = ctx
                .module
                .fields
                .get(field_id as usize)
                .ok_or_else(|| ctx.err(pc, format!("field {field_id} out of range")))?;
            match ops.pop()? {
                AbsTy::Ref(RefTy::Object(id)) if id == field.owner => {}
                AbsTy::Ref(RefTy::Null) => {}
                other => {
                    return Err(ctx.err(
                        pc,
                        format!("LoadField expects an object of the owning type, found {other}"),
                    ))
                }
            }
            let types = decl_types(ctx.module, field.type_id);
            ops.push_all(&types);
            Flow::FallThrough
        }
        I::StoreField(field_id) => {
            let field = ctx
                .module
                .fields
                .get(field_id as usize)
                .ok_or_else(|| ctx.err(pc, format!("field {field_id} out of range")))?;
            let decl = &ctx.module.types[field.type_id as usize];
            if decl.is_object() {
                let got = ops.pop()?;
                if !decl_accepts(ctx.module, field.type_id, got) {
                    return Err(ctx.err(pc, format!("StoreField value type mismatch: {got}")));
                }
            } else {
                ops.pop_kind(decl.kind, "StoreField value")?;
            }
            match ops.pop()? {
                AbsTy::Ref(RefTy::Object(id)) if id == field.owner => {}
                AbsTy::Ref(RefTy::Null) => {}
                other => {
                    return Err(ctx.err(
                        pc,
                        format!("StoreField expects an object of the owning type, found {other}"),
                    ))
                }
            }
            Flow::FallThrough
        }

        I::NewArray { elem, type_id, .. } | I::NewList { elem, type_id, .. } => {
            check_elem_type(ctx, pc, elem, type_id)?;
            let is_array = matches!(insn, I::NewArray { .. });
            ops.push(AbsTy::Ref(if is_array { RefTy::Array(elem) } else { RefTy::List(elem) }));
            Flow::FallThrough
        }
        I::ArrayLen => {
            match ops.pop_ref("ArrayLen")? {
                RefTy::Array(_) | RefTy::Null | RefTy::Any => {}
                other => return Err(ctx.err(pc, format!("ArrayLen expects an array, found {other:?}"))),
            }
            ops.push(AbsTy::I32);
            Flow::FallThrough
        }
        I::ArrayGet(elem) => {
            ops.pop_exact(AbsTy::I32, "array index")?;
            ops.pop_array(elem, "ArrayGet")?;
            ops.push(AbsTy::of_elem(elem));
            Flow::FallThrough
        }
        I::ArraySet(elem) => {
            ops.pop_elem_write(elem, "ArraySet")?;
            ops.pop_exact(AbsTy::I32, "array index")?;
            ops.pop_array(elem, "ArraySet")?;
            Flow::FallThrough
        }

        I::ListLen => {
            match ops.pop_ref("ListLen")? {
                RefTy::List(_) | RefTy::Null | RefTy::Any => {}
                other => return Err(ctx.err(pc, format!("ListLen expects a list, found {other:?}"))),
            }
            ops.push(AbsTy::I32);
            Flow::FallThrough
        }
        I::ListPush(elem) => {
            ops.pop_elem_write(elem, "ListPush")?;
            ops.pop_list(elem, "ListPush")?;
            Flow::FallThrough
        }
        I::ListPop(elem) => {
            ops.pop_list(elem, "ListPop")?;
            ops.push(AbsTy::of_elem(elem));
            Flow::FallThrough
        }
        I::ListGet(elem) => {
            ops.pop_exact(AbsTy::I32, "list index")?;
            ops.pop_list(elem, "ListGet")?;
            ops.push(AbsTy::of_elem(elem));
            Flow::FallThrough
        }
        I::ListSet(elem) => {
            ops.pop_elem_write(elem, "ListSet")?;
            ops.pop_exact(AbsTy::I32, "list index")?;
            ops.pop_list(elem, "ListSet")?;
            Flow::FallThrough
        }
        I::ListInsert(elem) => {
            ops.pop_elem_write(elem, "ListInsert")?;
            ops.pop_exact(AbsTy::I32, "list index")?;
            ops.pop_list(elem, "ListInsert")?;
            Flow::FallThrough
        }
        I::ListRemove(elem) => {
            ops.pop_exact(AbsTy::I32, "list index")?;
            ops.pop_list(elem, "ListRemove")?;
            ops.push(AbsTy::of_elem(elem));
            Flow::FallThrough
        }
        I::ListClear => {
            match ops.pop_ref("ListClear")? {
                RefTy::List(_) | RefTy::Null | RefTy::Any => {}
                other => return Err(ctx.err(pc, format!("ListClear expects a list, found {other:?}"))),
            }
            Flow::FallThrough
        }

        I::StringLen => {
            ops.pop_string("StringLen")?;
            ops.push(AbsTy::I32);
            Flow::FallThrough
        }
        I::StringConcat => {
            ops.pop_string("StringConcat")?;
            ops.pop_string("StringConcat")?;
            ops.push(AbsTy::Ref(RefTy::Str));
            Flow::FallThrough
        }
        I::StringGetChar => {
            ops.pop_exact(AbsTy::I32, "string index")?;
            ops.pop_string("StringGetChar")?;
            ops.push(AbsTy::Char);
            Flow::FallThrough
        }
        I::StringSlice => {
            ops.pop_exact(AbsTy::I32, "slice length")?;
            ops.pop_exact(AbsTy::I32, "slice start")?;
            ops.pop_string("StringSlice")?;
            ops.push(AbsTy::Ref(RefTy::Str));
            Flow::FallThrough
        }

        I::Call { func_id, argc } => {
            let sig = ctx
                .module
                .callable_sig(func_id)
                .ok_or_else(|| ctx.err(pc, format!("call target {func_id} out of range")))?;
            if sig.params.len() != argc as usize {
                return Err(ctx.err(
                    pc,
                    format!("Call arity {argc} does not match signature {}", sig.params.len()),
                ));
            }
            let (params, ret) = (sig.params.clone(), sig.ret_type_id);
            ops.pop_args(&params, "Call")?;
            ops.push_ret(ret);
            Flow::FallThrough
        }
        I::CallIndirect { sig_id, argc } => {
            let sig = ctx
                .module
                .sigs
                .get(sig_id as usize)
                .ok_or_else(|| ctx.err(pc, format!("signature {sig_id} out of range")))?;
            if sig.params.len() != argc as usize {
                return Err(ctx.err(pc, "CallIndirect arity does not match signature"));
            }
            match ops.pop_ref("CallIndirect callee")? {
                RefTy::Closure(f) => {
                    let callee_sig_id = ctx
                        .module
                        .method_of(f)
                        .map(|m| m.sig_id)
                        .ok_or_else(|| ctx.err(pc, format!("closure body {f} out of range")))?;
                    if callee_sig_id != sig_id {
                        return Err(ctx.err(
                            pc,
                            format!("closure signature {callee_sig_id} does not match {sig_id}"),
                        ));
                    }
                }
                RefTy::Null | RefTy::Any => {}
                other => {
                    return Err(ctx.err(pc, format!("CallIndirect expects a closure, found {other:?}")))
                }
            }
            let (params, ret) = (sig.params.clone(), sig.ret_type_id);
            ops.pop_args(&params, "CallIndirect")?;
            ops.push_ret(ret);
            Flow::FallThrough
        }
        I::TailCall { func_id, argc } => {
            let sig = ctx
                .module
                .callable_sig(func_id)
                .ok_or_else(|| ctx.err(pc, format!("tail-call target {func_id} out of range")))?;
            if sig.params.len() != argc as usize {
                return Err(ctx.err(pc, "TailCall arity does not match signature"));
            }
            if !ret_compatible(ctx.module, sig.ret_type_id, ctx.ret_type_id) {
                return Err(ctx.err(pc, "TailCall return type differs from caller"));
            }
            let params = sig.params.clone();
            ops.pop_args(&params, "TailCall")?;
            if !ops.st.stack.is_empty() {
                return Err(ctx.err(pc, "TailCall with residual stack values"));
            }
            Flow::Stop
        }
        I::CallCheck(_) => Flow::FallThrough,
        I::Intrinsic(id) => {
            let sig = intrinsics::signature(id)
                .ok_or_else(|| ctx.err(pc, format!("unknown intrinsic {id}")))?;
            for kind in sig.params.iter().rev() {
                ops.pop_kind(*kind, "intrinsic argument")?;
            }
            if let Some(ret) = sig.ret {
                ops.push_all(&kind_types(ret));
            }
            Flow::FallThrough
        }
        I::SysCall => Flow::Stop,
        I::NewClosure { func_id, upvalue_count } => {
            if ctx.module.functions.get(func_id as usize).is_none() {
                return Err(ctx.err(pc, format!("NewClosure body {func_id} out of range")));
            }
            let kinds: Vec<TypeKind> = ctx.module.upval_kinds(func_id).to_vec();
            if kinds.len() != upvalue_count as usize {
                return Err(ctx.err(
                    pc,
                    format!(
                        "NewClosure captures {} but function declares {}",
                        upvalue_count,
                        kinds.len()
                    ),
                ));
            }
            if kinds.iter().any(|k| k.slot_count() == 2) {
                return Err(ctx.err(pc, "128-bit upvalues are not supported"));
            }
            // Captured values are consumed in reverse declaration order.
            for kind in kinds.iter().rev() {
                ops.pop_kind(*kind, "captured upvalue")?;
            }
            ops.push(AbsTy::Ref(RefTy::Closure(func_id)));
            Flow::FallThrough
        }
    };

    Ok(flow)
}

fn store_local(
    state: &mut AbstractState,
    ctx: &FuncCtx<'_>,
    pc: u32,
    slot: usize,
    value: AbsTy,
) -> Result<(), VerifyError> {
    match state.locals[slot] {
        // First store fixes the slot type.
        None => {
            state.locals[slot] = Some(value);
            Ok(())
        }
        Some(existing) => match existing.merge(value) {
            Some(merged) => {
                state.locals[slot] = Some(merged);
                Ok(())
            }
            None => Err(ctx.err(
                pc,
                format!("store of {value} into local {slot} typed {existing}"),
            )),
        },
    }
}

fn kind_types(kind: TypeKind) -> Vec<AbsTy> {
    AbsTy::of_kind(kind)
}

fn check_elem_type(
    ctx: &FuncCtx<'_>,
    pc: u32,
    elem: ElemKind,
    type_id: u32,
) -> Result<(), VerifyError> {
    let ty = ctx
        .module
        .types
        .get(type_id as usize)
        .ok_or_else(|| ctx.err(pc, format!("element type {type_id} out of range")))?;
    let matches = match elem {
        ElemKind::I32 => ty.kind == TypeKind::I32,
        ElemKind::I64 => ty.kind == TypeKind::I64,
        ElemKind::F32 => ty.kind == TypeKind::F32,
        ElemKind::F64 => ty.kind == TypeKind::F64,
        ElemKind::Ref => ty.kind == TypeKind::Ref,
    };
    if !matches {
        return Err(ctx.err(pc, format!("element kind {elem} disagrees with type {type_id}")));
    }
    Ok(())
}
