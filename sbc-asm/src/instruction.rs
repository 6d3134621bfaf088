use core::fmt;

use crate::{ElemKind, Opcode, TypeKind};

/// A fully decoded instruction: opcode plus typed operands.
///
/// The loader walks every function's code through [`Instruction::decode`]
/// once to reject unknown opcodes and truncated operands; the verifier and
/// the interpreter then decode on the fly, which never allocates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    /// See [`Opcode::Halt`].
    Halt,
    /// See [`Opcode::Trap`].
    Trap,
    /// See [`Opcode::Line`].
    Line {
        /// 1-based source line.
        line: u32,
        /// 1-based source column.
        column: u32,
    },
    /// See [`Opcode::Breakpoint`].
    Breakpoint,
    /// See [`Opcode::Jmp`].
    Jmp(i32),
    /// See [`Opcode::JmpTrue`].
    JmpTrue(i32),
    /// See [`Opcode::JmpFalse`].
    JmpFalse(i32),
    /// See [`Opcode::JmpTable`].
    JmpTable {
        /// Const-pool id of the [`crate::ConstTag::JmpTable`] blob.
        table_const: u32,
        /// Default branch, relative to the byte after this operand.
        default_rel: i32,
    },
    /// See [`Opcode::Ret`].
    Ret,
    /// See [`Opcode::ProfileStart`].
    ProfileStart(u32),
    /// See [`Opcode::ProfileEnd`].
    ProfileEnd(u32),

    /// See [`Opcode::Pop`].
    Pop,
    /// See [`Opcode::Dup`].
    Dup,
    /// See [`Opcode::Dup2`].
    Dup2,
    /// See [`Opcode::Swap`].
    Swap,
    /// See [`Opcode::Rot`].
    Rot,

    /// See [`Opcode::ConstI8`].
    ConstI8(i8),
    /// See [`Opcode::ConstI16`].
    ConstI16(i16),
    /// See [`Opcode::ConstI32`].
    ConstI32(i32),
    /// See [`Opcode::ConstI64`].
    ConstI64(i64),
    /// See [`Opcode::ConstU8`].
    ConstU8(u8),
    /// See [`Opcode::ConstU16`].
    ConstU16(u16),
    /// See [`Opcode::ConstU32`].
    ConstU32(u32),
    /// See [`Opcode::ConstU64`].
    ConstU64(u64),
    /// See [`Opcode::ConstF32`].
    ConstF32(f32),
    /// See [`Opcode::ConstF64`].
    ConstF64(f64),
    /// See [`Opcode::ConstChar`].
    ConstChar(u16),
    /// See [`Opcode::ConstBool`].
    ConstBool(bool),
    /// See [`Opcode::ConstNull`].
    ConstNull,
    /// See [`Opcode::ConstString`].
    ConstString(u32),
    /// See [`Opcode::ConstI128`].
    ConstI128(u32),
    /// See [`Opcode::ConstU128`].
    ConstU128(u32),

    /// See [`Opcode::LoadLocal`].
    LoadLocal(u32),
    /// See [`Opcode::StoreLocal`].
    StoreLocal(u32),
    /// See [`Opcode::Enter`].
    Enter(u16),
    /// See [`Opcode::Leave`].
    Leave,
    /// See [`Opcode::LoadGlobal`].
    LoadGlobal(u32),
    /// See [`Opcode::StoreGlobal`].
    StoreGlobal(u32),
    /// See [`Opcode::LoadUpvalue`].
    LoadUpvalue(u32),
    /// See [`Opcode::StoreUpvalue`].
    StoreUpvalue(u32),

    /// See [`Opcode::Add`].
    Add(TypeKind),
    /// See [`Opcode::Sub`].
    Sub(TypeKind),
    /// See [`Opcode::Mul`].
    Mul(TypeKind),
    /// See [`Opcode::Div`].
    Div(TypeKind),
    /// See [`Opcode::Rem`].
    Rem(TypeKind),
    /// See [`Opcode::Neg`].
    Neg(TypeKind),
    /// See [`Opcode::Inc`].
    Inc(TypeKind),
    /// See [`Opcode::Dec`].
    Dec(TypeKind),
    /// See [`Opcode::BitAnd`].
    BitAnd(TypeKind),
    /// See [`Opcode::BitOr`].
    BitOr(TypeKind),
    /// See [`Opcode::BitXor`].
    BitXor(TypeKind),
    /// See [`Opcode::BitNot`].
    BitNot(TypeKind),
    /// See [`Opcode::Shl`].
    Shl(TypeKind),
    /// See [`Opcode::Shr`].
    Shr(TypeKind),

    /// See [`Opcode::CmpEq`].
    CmpEq(TypeKind),
    /// See [`Opcode::CmpNe`].
    CmpNe(TypeKind),
    /// See [`Opcode::CmpLt`].
    CmpLt(TypeKind),
    /// See [`Opcode::CmpLe`].
    CmpLe(TypeKind),
    /// See [`Opcode::CmpGt`].
    CmpGt(TypeKind),
    /// See [`Opcode::CmpGe`].
    CmpGe(TypeKind),

    /// See [`Opcode::IsNull`].
    IsNull,
    /// See [`Opcode::RefEq`].
    RefEq,
    /// See [`Opcode::RefNe`].
    RefNe,
    /// See [`Opcode::TypeOf`].
    TypeOf,
    /// See [`Opcode::NewObject`].
    NewObject(u32),
    /// See [`Opcode::LoadField`].
    LoadField(u32),
    /// See [`Opcode::StoreField`].
    StoreField(u32),

    /// See [`Opcode::NewArray`].
    NewArray {
        /// Element kind of the payload.
        elem: ElemKind,
        /// Element type id recorded in the object header.
        type_id: u32,
        /// Fixed length.
        length: u32,
    },
    /// See [`Opcode::ArrayLen`].
    ArrayLen,
    /// See [`Opcode::ArrayGet`].
    ArrayGet(ElemKind),
    /// See [`Opcode::ArraySet`].
    ArraySet(ElemKind),

    /// See [`Opcode::NewList`].
    NewList {
        /// Element kind of the payload.
        elem: ElemKind,
        /// Element type id recorded in the object header.
        type_id: u32,
        /// Initial capacity.
        capacity: u32,
    },
    /// See [`Opcode::ListLen`].
    ListLen,
    /// See [`Opcode::ListPush`].
    ListPush(ElemKind),
    /// See [`Opcode::ListPop`].
    ListPop(ElemKind),
    /// See [`Opcode::ListGet`].
    ListGet(ElemKind),
    /// See [`Opcode::ListSet`].
    ListSet(ElemKind),
    /// See [`Opcode::ListInsert`].
    ListInsert(ElemKind),
    /// See [`Opcode::ListRemove`].
    ListRemove(ElemKind),
    /// See [`Opcode::ListClear`].
    ListClear,

    /// See [`Opcode::StringLen`].
    StringLen,
    /// See [`Opcode::StringConcat`].
    StringConcat,
    /// See [`Opcode::StringGetChar`].
    StringGetChar,
    /// See [`Opcode::StringSlice`].
    StringSlice,

    /// See [`Opcode::Call`].
    Call {
        /// Target function id; ids past the function table are imports.
        func_id: u32,
        /// Argument count.
        argc: u8,
    },
    /// See [`Opcode::CallIndirect`].
    CallIndirect {
        /// Expected signature id of the callee.
        sig_id: u32,
        /// Argument count.
        argc: u8,
    },
    /// See [`Opcode::TailCall`].
    TailCall {
        /// Target function id.
        func_id: u32,
        /// Argument count.
        argc: u8,
    },
    /// See [`Opcode::CallCheck`].
    CallCheck(u16),
    /// See [`Opcode::Intrinsic`].
    Intrinsic(u32),
    /// See [`Opcode::SysCall`].
    SysCall,
    /// See [`Opcode::NewClosure`].
    NewClosure {
        /// Closure body function id.
        func_id: u32,
        /// Values captured from the stack, in reverse order.
        upvalue_count: u8,
    },
}

/// Decode failure inside a code stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidInstruction {
    /// The opcode byte maps to no known opcode.
    UnknownOpcode {
        /// Offending byte.
        byte: u8,
        /// Offset of the byte within the decoded slice.
        at: usize,
    },
    /// The operand bytes run past the end of the code range.
    TruncatedOperand {
        /// Opcode whose operands are cut short.
        opcode: Opcode,
        /// Offset of the opcode byte.
        at: usize,
    },
    /// A type- or elem-kind operand byte is not a valid kind.
    BadKind {
        /// Opcode carrying the kind operand.
        opcode: Opcode,
        /// Offending kind byte.
        byte: u8,
        /// Offset of the opcode byte.
        at: usize,
    },
}

impl fmt::Display for InvalidInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { byte, at } => {
                write!(f, "unknown opcode 0x{byte:02x} at offset {at}")
            }
            Self::TruncatedOperand { opcode, at } => {
                write!(f, "truncated operands for {opcode} at offset {at}")
            }
            Self::BadKind { opcode, byte, at } => {
                write!(f, "invalid kind byte 0x{byte:02x} for {opcode} at offset {at}")
            }
        }
    }
}

impl std::error::Error for InvalidInstruction {}

macro_rules! le {
    ($code:expr, $at:expr, $op:expr, $ty:ty) => {{
        const N: usize = core::mem::size_of::<$ty>();
        let end = $at + N;
        if end > $code.len() {
            return Err(InvalidInstruction::TruncatedOperand { opcode: $op, at: $at });
        }
        let mut buf = [0u8; N];
        buf.copy_from_slice(&$code[$at..end]);
        #[allow(unused_assignments)]
        {
            $at = end;
        }
        <$ty>::from_le_bytes(buf)
    }};
}

impl Instruction {
    /// Decode one instruction at `offset`. Returns the instruction and the
    /// offset of the next one.
    pub fn decode(code: &[u8], offset: usize) -> Result<(Self, usize), InvalidInstruction> {
        use Instruction as I;
        use Opcode as Op;

        let byte = *code
            .get(offset)
            .ok_or(InvalidInstruction::TruncatedOperand { opcode: Op::Halt, at: offset })?;
        let op = Op::from_u8(byte).ok_or(InvalidInstruction::UnknownOpcode { byte, at: offset })?;
        let mut at = offset + 1;

        let type_kind = |at: usize, b: u8| {
            TypeKind::from_u8(b).ok_or(InvalidInstruction::BadKind { opcode: op, byte: b, at })
        };
        let elem_kind = |at: usize, b: u8| {
            ElemKind::from_u8(b).ok_or(InvalidInstruction::BadKind { opcode: op, byte: b, at })
        };

        let insn = match op {
            Op::Halt => I::Halt,
            Op::Trap => I::Trap,
            Op::Line => I::Line {
                line: le!(code, at, op, u32),
                column: le!(code, at, op, u32),
            },
            Op::Breakpoint => I::Breakpoint,
            Op::Jmp => I::Jmp(le!(code, at, op, i32)),
            Op::JmpTrue => I::JmpTrue(le!(code, at, op, i32)),
            Op::JmpFalse => I::JmpFalse(le!(code, at, op, i32)),
            Op::JmpTable => I::JmpTable {
                table_const: le!(code, at, op, u32),
                default_rel: le!(code, at, op, i32),
            },
            Op::Ret => I::Ret,
            Op::ProfileStart => I::ProfileStart(le!(code, at, op, u32)),
            Op::ProfileEnd => I::ProfileEnd(le!(code, at, op, u32)),

            Op::Pop => I::Pop,
            Op::Dup => I::Dup,
            Op::Dup2 => I::Dup2,
            Op::Swap => I::Swap,
            Op::Rot => I::Rot,

            Op::ConstI8 => I::ConstI8(le!(code, at, op, i8)),
            Op::ConstI16 => I::ConstI16(le!(code, at, op, i16)),
            Op::ConstI32 => I::ConstI32(le!(code, at, op, i32)),
            Op::ConstI64 => I::ConstI64(le!(code, at, op, i64)),
            Op::ConstU8 => I::ConstU8(le!(code, at, op, u8)),
            Op::ConstU16 => I::ConstU16(le!(code, at, op, u16)),
            Op::ConstU32 => I::ConstU32(le!(code, at, op, u32)),
            Op::ConstU64 => I::ConstU64(le!(code, at, op, u64)),
            Op::ConstF32 => I::ConstF32(f32::from_bits(le!(code, at, op, u32))),
            Op::ConstF64 => I::ConstF64(f64::from_bits(le!(code, at, op, u64))),
            Op::ConstChar => I::ConstChar(le!(code, at, op, u16)),
            Op::ConstBool => I::ConstBool(le!(code, at, op, u8) != 0),
            Op::ConstNull => I::ConstNull,
            Op::ConstString => I::ConstString(le!(code, at, op, u32)),
            Op::ConstI128 => I::ConstI128(le!(code, at, op, u32)),
            Op::ConstU128 => I::ConstU128(le!(code, at, op, u32)),

            Op::LoadLocal => I::LoadLocal(le!(code, at, op, u32)),
            Op::StoreLocal => I::StoreLocal(le!(code, at, op, u32)),
            Op::Enter => I::Enter(le!(code, at, op, u16)),
            Op::Leave => I::Leave,
            Op::LoadGlobal => I::LoadGlobal(le!(code, at, op, u32)),
            Op::StoreGlobal => I::StoreGlobal(le!(code, at, op, u32)),
            Op::LoadUpvalue => I::LoadUpvalue(le!(code, at, op, u32)),
            Op::StoreUpvalue => I::StoreUpvalue(le!(code, at, op, u32)),

            Op::Add => I::Add(type_kind(at, le!(code, at, op, u8))?),
            Op::Sub => I::Sub(type_kind(at, le!(code, at, op, u8))?),
            Op::Mul => I::Mul(type_kind(at, le!(code, at, op, u8))?),
            Op::Div => I::Div(type_kind(at, le!(code, at, op, u8))?),
            Op::Rem => I::Rem(type_kind(at, le!(code, at, op, u8))?),
            Op::Neg => I::Neg(type_kind(at, le!(code, at, op, u8))?),
            Op::Inc => I::Inc(type_kind(at, le!(code, at, op, u8))?),
            Op::Dec => I::Dec(type_kind(at, le!(code, at, op, u8))?),
            Op::BitAnd => I::BitAnd(type_kind(at, le!(code, at, op, u8))?),
            Op::BitOr => I::BitOr(type_kind(at, le!(code, at, op, u8))?),
            Op::BitXor => I::BitXor(type_kind(at, le!(code, at, op, u8))?),
            Op::BitNot => I::BitNot(type_kind(at, le!(code, at, op, u8))?),
            Op::Shl => I::Shl(type_kind(at, le!(code, at, op, u8))?),
            Op::Shr => I::Shr(type_kind(at, le!(code, at, op, u8))?),

            Op::CmpEq => I::CmpEq(type_kind(at, le!(code, at, op, u8))?),
            Op::CmpNe => I::CmpNe(type_kind(at, le!(code, at, op, u8))?),
            Op::CmpLt => I::CmpLt(type_kind(at, le!(code, at, op, u8))?),
            Op::CmpLe => I::CmpLe(type_kind(at, le!(code, at, op, u8))?),
            Op::CmpGt => I::CmpGt(type_kind(at, le!(code, at, op, u8))?),
            Op::CmpGe => I::CmpGe(type_kind(at, le!(code, at, op, u8))?),

            Op::IsNull => I::IsNull,
            Op::RefEq => I::RefEq,
            Op::RefNe => I::RefNe,
            Op::TypeOf => I::TypeOf,
            Op::NewObject => I::NewObject(le!(code, at, op, u32)),
            Op::LoadField => I::LoadField(le!(code, at, op, u32)),
            Op::StoreField => I::StoreField(le!(code, at, op, u32)),

            Op::NewArray => I::NewArray {
                elem: elem_kind(at, le!(code, at, op, u8))?,
                type_id: le!(code, at, op, u32),
                length: le!(code, at, op, u32),
            },
            Op::ArrayLen => I::ArrayLen,
            Op::ArrayGet => I::ArrayGet(elem_kind(at, le!(code, at, op, u8))?),
            Op::ArraySet => I::ArraySet(elem_kind(at, le!(code, at, op, u8))?),

            Op::NewList => I::NewList {
                elem: elem_kind(at, le!(code, at, op, u8))?,
                type_id: le!(code, at, op, u32),
                capacity: le!(code, at, op, u32),
            },
            Op::ListLen => I::ListLen,
            Op::ListPush => I::ListPush(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListPop => I::ListPop(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListGet => I::ListGet(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListSet => I::ListSet(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListInsert => I::ListInsert(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListRemove => I::ListRemove(elem_kind(at, le!(code, at, op, u8))?),
            Op::ListClear => I::ListClear,

            Op::StringLen => I::StringLen,
            Op::StringConcat => I::StringConcat,
            Op::StringGetChar => I::StringGetChar,
            Op::StringSlice => I::StringSlice,

            Op::Call => I::Call {
                func_id: le!(code, at, op, u32),
                argc: le!(code, at, op, u8),
            },
            Op::CallIndirect => I::CallIndirect {
                sig_id: le!(code, at, op, u32),
                argc: le!(code, at, op, u8),
            },
            Op::TailCall => I::TailCall {
                func_id: le!(code, at, op, u32),
                argc: le!(code, at, op, u8),
            },
            Op::CallCheck => I::CallCheck(le!(code, at, op, u16)),
            Op::Intrinsic => I::Intrinsic(le!(code, at, op, u32)),
            Op::SysCall => I::SysCall,
            Op::NewClosure => I::NewClosure {
                func_id: le!(code, at, op, u32),
                upvalue_count: le!(code, at, op, u8),
            },
        };

        Ok((insn, at))
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        use Instruction as I;

        out.push(self.opcode() as u8);
        match *self {
            I::Line { line, column } => {
                out.extend_from_slice(&line.to_le_bytes());
                out.extend_from_slice(&column.to_le_bytes());
            }
            I::Jmp(rel) | I::JmpTrue(rel) | I::JmpFalse(rel) => {
                out.extend_from_slice(&rel.to_le_bytes());
            }
            I::JmpTable { table_const, default_rel } => {
                out.extend_from_slice(&table_const.to_le_bytes());
                out.extend_from_slice(&default_rel.to_le_bytes());
            }
            I::ProfileStart(id) | I::ProfileEnd(id) => out.extend_from_slice(&id.to_le_bytes()),
            I::ConstI8(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstI16(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstI32(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstI64(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstU8(v) => out.push(v),
            I::ConstU16(v) | I::ConstChar(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstU32(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstU64(v) => out.extend_from_slice(&v.to_le_bytes()),
            I::ConstF32(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            I::ConstF64(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            I::ConstBool(v) => out.push(v as u8),
            I::ConstString(id) | I::ConstI128(id) | I::ConstU128(id) => {
                out.extend_from_slice(&id.to_le_bytes())
            }
            I::LoadLocal(i) | I::StoreLocal(i) | I::LoadGlobal(i) | I::StoreGlobal(i)
            | I::LoadUpvalue(i) | I::StoreUpvalue(i) => out.extend_from_slice(&i.to_le_bytes()),
            I::Enter(n) => out.extend_from_slice(&n.to_le_bytes()),
            I::Add(k) | I::Sub(k) | I::Mul(k) | I::Div(k) | I::Rem(k) | I::Neg(k) | I::Inc(k)
            | I::Dec(k) | I::BitAnd(k) | I::BitOr(k) | I::BitXor(k) | I::BitNot(k) | I::Shl(k)
            | I::Shr(k) | I::CmpEq(k) | I::CmpNe(k) | I::CmpLt(k) | I::CmpLe(k) | I::CmpGt(k)
            | I::CmpGe(k) => out.push(k as u8),
            I::NewObject(id) | I::LoadField(id) | I::StoreField(id) => {
                out.extend_from_slice(&id.to_le_bytes())
            }
            I::NewArray { elem, type_id, length } => {
                out.push(elem as u8);
                out.extend_from_slice(&type_id.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
            }
            I::NewList { elem, type_id, capacity } => {
                out.push(elem as u8);
                out.extend_from_slice(&type_id.to_le_bytes());
                out.extend_from_slice(&capacity.to_le_bytes());
            }
            I::ArrayGet(k) | I::ArraySet(k) | I::ListPush(k) | I::ListPop(k) | I::ListGet(k)
            | I::ListSet(k) | I::ListInsert(k) | I::ListRemove(k) => out.push(k as u8),
            I::Call { func_id, argc } | I::TailCall { func_id, argc } => {
                out.extend_from_slice(&func_id.to_le_bytes());
                out.push(argc);
            }
            I::CallIndirect { sig_id, argc } => {
                out.extend_from_slice(&sig_id.to_le_bytes());
                out.push(argc);
            }
            I::CallCheck(n) => out.extend_from_slice(&n.to_le_bytes()),
            I::Intrinsic(id) => out.extend_from_slice(&id.to_le_bytes()),
            I::NewClosure { func_id, upvalue_count } => {
                out.extend_from_slice(&func_id.to_le_bytes());
                out.push(upvalue_count);
            }
            _ => {}
        }
    }

    /// The bare opcode of this instruction.
    pub const fn opcode(&self) -> Opcode {
        use Instruction as I;
        use Opcode as Op;
        match self {
            I::Halt => Op::Halt,
            I::Trap => Op::Trap,
            I::Line { .. } => Op::Line,
            I::Breakpoint => Op::Breakpoint,
            I::Jmp(_) => Op::Jmp,
            I::JmpTrue(_) => Op::JmpTrue,
            I::JmpFalse(_) => Op::JmpFalse,
            I::JmpTable { .. } => Op::JmpTable,
            I::Ret => Op::Ret,
            I::ProfileStart(_) => Op::ProfileStart,
            I::ProfileEnd(_) => Op::ProfileEnd,
            I::Pop => Op::Pop,
            I::Dup => Op::Dup,
            I::Dup2 => Op::Dup2,
            I::Swap => Op::Swap,
            I::Rot => Op::Rot,
            I::ConstI8(_) => Op::ConstI8,
            I::ConstI16(_) => Op::ConstI16,
            I::ConstI32(_) => Op::ConstI32,
            I::ConstI64(_) => Op::ConstI64,
            I::ConstU8(_) => Op::ConstU8,
            I::ConstU16(_) => Op::ConstU16,
            I::ConstU32(_) => Op::ConstU32,
            I::ConstU64(_) => Op::ConstU64,
            I::ConstF32(_) => Op::ConstF32,
            I::ConstF64(_) => Op::ConstF64,
            I::ConstChar(_) => Op::ConstChar,
            I::ConstBool(_) => Op::ConstBool,
            I::ConstNull => Op::ConstNull,
            I::ConstString(_) => Op::ConstString,
            I::ConstI128(_) => Op::ConstI128,
            I::ConstU128(_) => Op::ConstU128,
            I::LoadLocal(_) => Op::LoadLocal,
            I::StoreLocal(_) => Op::StoreLocal,
            I::Enter(_) => Op::Enter,
            I::Leave => Op::Leave,
            I::LoadGlobal(_) => Op::LoadGlobal,
            I::StoreGlobal(_) => Op::StoreGlobal,
            I::LoadUpvalue(_) => Op::LoadUpvalue,
            I::StoreUpvalue(_) => Op::StoreUpvalue,
            I::Add(_) => Op::Add,
            I::Sub(_) => Op::Sub,
            I::Mul(_) => Op::Mul,
            I::Div(_) => Op::Div,
            I::Rem(_) => Op::Rem,
            I::Neg(_) => Op::Neg,
            I::Inc(_) => Op::Inc,
            I::Dec(_) => Op::Dec,
            I::BitAnd(_) => Op::BitAnd,
            I::BitOr(_) => Op::BitOr,
            I::BitXor(_) => Op::BitXor,
            I::BitNot(_) => Op::BitNot,
            I::Shl(_) => Op::Shl,
            I::Shr(_) => Op::Shr,
            I::CmpEq(_) => Op::CmpEq,
            I::CmpNe(_) => Op::CmpNe,
            I::CmpLt(_) => Op::CmpLt,
            I::CmpLe(_) => Op::CmpLe,
            I::CmpGt(_) => Op::CmpGt,
            I::CmpGe(_) => Op::CmpGe,
            I::IsNull => Op::IsNull,
            I::RefEq => Op::RefEq,
            I::RefNe => Op::RefNe,
            I::TypeOf => Op::TypeOf,
            I::NewObject(_) => Op::NewObject,
            I::LoadField(_) => Op::LoadField,
            I::StoreField(_) => Op::StoreField,
            I::NewArray { .. } => Op::NewArray,
            I::ArrayLen => Op::ArrayLen,
            I::ArrayGet(_) => Op::ArrayGet,
            I::ArraySet(_) => Op::ArraySet,
            I::NewList { .. } => Op::NewList,
            I::ListLen => Op::ListLen,
            I::ListPush(_) => Op::ListPush,
            I::ListPop(_) => Op::ListPop,
            I::ListGet(_) => Op::ListGet,
            I::ListSet(_) => Op::ListSet,
            I::ListInsert(_) => Op::ListInsert,
            I::ListRemove(_) => Op::ListRemove,
            I::ListClear => Op::ListClear,
            I::StringLen => Op::StringLen,
            I::StringConcat => Op::StringConcat,
            I::StringGetChar => Op::StringGetChar,
            I::StringSlice => Op::StringSlice,
            I::Call { .. } => Op::Call,
            I::CallIndirect { .. } => Op::CallIndirect,
            I::TailCall { .. } => Op::TailCall,
            I::CallCheck(_) => Op::CallCheck,
            I::Intrinsic(_) => Op::Intrinsic,
            I::SysCall => Op::SysCall,
            I::NewClosure { .. } => Op::NewClosure,
        }
    }

    /// Encoded length including the opcode byte. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        1 + self.opcode().operand_len()
    }

    /// Operand summary used by trap diagnostics, e.g. `rel=-12` or
    /// `func_id=3 argc=2`. Empty for operand-less opcodes.
    pub fn operand_summary(&self) -> String {
        use Instruction as I;
        match *self {
            I::Line { line, column } => format!("line={line} col={column}"),
            I::Jmp(rel) | I::JmpTrue(rel) | I::JmpFalse(rel) => format!("rel={rel}"),
            I::JmpTable { table_const, default_rel } => {
                format!("table_const={table_const} default_rel={default_rel}")
            }
            I::ProfileStart(id) | I::ProfileEnd(id) => format!("id={id}"),
            I::ConstI8(v) => format!("value={v}"),
            I::ConstI16(v) => format!("value={v}"),
            I::ConstI32(v) => format!("value={v}"),
            I::ConstI64(v) => format!("value={v}"),
            I::ConstU8(v) => format!("value={v}"),
            I::ConstU16(v) | I::ConstChar(v) => format!("value={v}"),
            I::ConstU32(v) => format!("value={v}"),
            I::ConstU64(v) => format!("value={v}"),
            I::ConstF32(v) => format!("value={v}"),
            I::ConstF64(v) => format!("value={v}"),
            I::ConstBool(v) => format!("value={v}"),
            I::ConstString(id) | I::ConstI128(id) | I::ConstU128(id) => format!("const_id={id}"),
            I::LoadLocal(i) | I::StoreLocal(i) => format!("local={i}"),
            I::Enter(n) => format!("locals={n}"),
            I::LoadGlobal(i) | I::StoreGlobal(i) => format!("global={i}"),
            I::LoadUpvalue(i) | I::StoreUpvalue(i) => format!("upvalue={i}"),
            I::Add(k) | I::Sub(k) | I::Mul(k) | I::Div(k) | I::Rem(k) | I::Neg(k) | I::Inc(k)
            | I::Dec(k) | I::BitAnd(k) | I::BitOr(k) | I::BitXor(k) | I::BitNot(k) | I::Shl(k)
            | I::Shr(k) | I::CmpEq(k) | I::CmpNe(k) | I::CmpLt(k) | I::CmpLe(k) | I::CmpGt(k)
            | I::CmpGe(k) => format!("kind={k}"),
            I::NewObject(id) => format!("type_id={id}"),
            I::LoadField(id) | I::StoreField(id) => format!("field_id={id}"),
            I::NewArray { elem, type_id, length } => {
                format!("elem={elem} type_id={type_id} length={length}")
            }
            I::ArrayGet(k) | I::ArraySet(k) => format!("elem={k}"),
            I::NewList { elem, type_id, capacity } => {
                format!("elem={elem} type_id={type_id} capacity={capacity}")
            }
            I::ListPush(k) | I::ListPop(k) | I::ListGet(k) | I::ListSet(k) | I::ListInsert(k)
            | I::ListRemove(k) => format!("elem={k}"),
            I::Call { func_id, argc } | I::TailCall { func_id, argc } => {
                format!("func_id={func_id} argc={argc}")
            }
            I::CallIndirect { sig_id, argc } => format!("sig_id={sig_id} argc={argc}"),
            I::CallCheck(n) => format!("headroom={n}"),
            I::Intrinsic(id) => format!("id={id}"),
            I::NewClosure { func_id, upvalue_count } => {
                format!("func_id={func_id} upvalues={upvalue_count}")
            }
            _ => String::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.operand_summary();
        if summary.is_empty() {
            write!(f, "{}", self.opcode())
        } else {
            write!(f, "{} {summary}", self.opcode())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(insn: Instruction) {
        let mut bytes = Vec::new();
        insn.encode(&mut bytes);
        assert_eq!(bytes.len(), insn.len(), "{insn}");
        let (decoded, next) = Instruction::decode(&bytes, 0).expect("decode");
        assert_eq!(decoded, insn);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn encode_decode_representative_sample() {
        round_trip(Instruction::Halt);
        round_trip(Instruction::Jmp(-12));
        round_trip(Instruction::JmpTable { table_const: 3, default_rel: 44 });
        round_trip(Instruction::ConstI32(-40));
        round_trip(Instruction::ConstI64(i64::MIN));
        round_trip(Instruction::ConstF64(6.25));
        round_trip(Instruction::ConstBool(true));
        round_trip(Instruction::Add(TypeKind::I32));
        round_trip(Instruction::CmpLe(TypeKind::U64));
        round_trip(Instruction::NewArray { elem: ElemKind::F64, type_id: 2, length: 16 });
        round_trip(Instruction::Call { func_id: 7, argc: 3 });
        round_trip(Instruction::NewClosure { func_id: 1, upvalue_count: 2 });
        round_trip(Instruction::Line { line: 10, column: 20 });
    }

    #[test]
    fn truncated_operand_rejects() {
        let mut bytes = Vec::new();
        Instruction::ConstI32(7).encode(&mut bytes);
        bytes.truncate(3);
        assert!(matches!(
            Instruction::decode(&bytes, 0),
            Err(InvalidInstruction::TruncatedOperand { opcode: Opcode::ConstI32, .. })
        ));
    }

    #[test]
    fn unknown_opcode_rejects() {
        assert!(matches!(
            Instruction::decode(&[0xffu8], 0),
            Err(InvalidInstruction::UnknownOpcode { byte: 0xff, at: 0 })
        ));
    }

    #[test]
    fn bad_kind_byte_rejects() {
        // Add with kind byte 0x0f, one past Ref.
        assert!(matches!(
            Instruction::decode(&[0x30, 0x0f], 0),
            Err(InvalidInstruction::BadKind { opcode: Opcode::Add, byte: 0x0f, .. })
        ));
    }

    #[test]
    fn operand_summary_matches_diagnostic_format() {
        assert_eq!(Instruction::Jmp(5).operand_summary(), "rel=5");
        assert_eq!(
            Instruction::Call { func_id: 2, argc: 0 }.operand_summary(),
            "func_id=2 argc=0"
        );
        assert_eq!(
            Instruction::JmpTable { table_const: 1, default_rel: -8 }.operand_summary(),
            "table_const=1 default_rel=-8"
        );
    }
}
