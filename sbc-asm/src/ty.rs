use core::fmt;

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
/// Scalar and reference type kinds of the SBC type system.
///
/// The discriminant is the wire encoding used both in the module's type
/// table and as the one-byte operand of the scalar-parameterized opcodes.
pub enum TypeKind {
    /// 8-bit signed integer. Widened to 32 bits on the stack.
    I8 = 0x00,
    /// 16-bit signed integer. Widened to 32 bits on the stack.
    I16 = 0x01,
    /// 32-bit signed integer.
    I32 = 0x02,
    /// 64-bit signed integer.
    I64 = 0x03,
    /// 8-bit unsigned integer. Widened to 32 bits on the stack.
    U8 = 0x04,
    /// 16-bit unsigned integer. Widened to 32 bits on the stack.
    U16 = 0x05,
    /// 32-bit unsigned integer.
    U32 = 0x06,
    /// 64-bit unsigned integer.
    U64 = 0x07,
    /// IEEE-754 single precision float, stored in the low slot bits.
    F32 = 0x08,
    /// IEEE-754 double precision float.
    F64 = 0x09,
    /// 128-bit signed integer. Occupies two adjacent slots, high then low.
    I128 = 0x0a,
    /// 128-bit unsigned integer. Occupies two adjacent slots, high then low.
    U128 = 0x0b,
    /// Boolean, `0` or `1` in a slot.
    Bool = 0x0c,
    /// UTF-16 code unit, `u16` in a slot.
    Char = 0x0d,
    /// Heap reference; a `u32` handle, `0` for null.
    Ref = 0x0e,
}

impl TypeKind {
    /// Decode a wire byte.
    pub const fn from_u8(b: u8) -> Option<Self> {
        use TypeKind::*;
        Some(match b {
            0x00 => I8,
            0x01 => I16,
            0x02 => I32,
            0x03 => I64,
            0x04 => U8,
            0x05 => U16,
            0x06 => U32,
            0x07 => U64,
            0x08 => F32,
            0x09 => F64,
            0x0a => I128,
            0x0b => U128,
            0x0c => Bool,
            0x0d => Char,
            0x0e => Ref,
            _ => return None,
        })
    }

    /// Declared size of the kind as it must appear in the module's type
    /// table. `Ref` declares size 0.
    pub const fn size(&self) -> u32 {
        use TypeKind::*;
        match self {
            I8 | U8 | Bool => 1,
            I16 | U16 | Char => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
            I128 | U128 => 16,
            Ref => 0,
        }
    }

    /// Bytes a value of this kind occupies inside an object payload. Ref
    /// fields store a 4-byte handle.
    pub const fn storage_size(&self) -> u32 {
        match self {
            TypeKind::Ref => 4,
            other => other.size(),
        }
    }

    /// Number of value-stack slots a value of this kind occupies.
    pub const fn slot_count(&self) -> usize {
        match self {
            TypeKind::I128 | TypeKind::U128 => 2,
            _ => 1,
        }
    }

    /// Whether the kind is one of the twelve numeric kinds.
    pub const fn is_numeric(&self) -> bool {
        !matches!(self, TypeKind::Bool | TypeKind::Char | TypeKind::Ref)
    }

    /// Whether the kind is an integer (signed or unsigned, any width).
    pub const fn is_integer(&self) -> bool {
        self.is_numeric() && !self.is_float()
    }

    /// Whether the kind is a signed integer.
    pub const fn is_signed(&self) -> bool {
        use TypeKind::*;
        matches!(self, I8 | I16 | I32 | I64 | I128)
    }

    /// Whether the kind is a float.
    pub const fn is_float(&self) -> bool {
        matches!(self, TypeKind::F32 | TypeKind::F64)
    }

    /// Whether the kind is narrower than a stack slot's 32-bit lane and is
    /// therefore widened on push.
    pub const fn is_narrow(&self) -> bool {
        use TypeKind::*;
        matches!(self, I8 | I16 | U8 | U16 | Char)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
/// Element kinds of array and list objects, the one-byte operand of the
/// array/list opcode family.
pub enum ElemKind {
    /// 32-bit signed integer elements.
    I32 = 0x00,
    /// 64-bit signed integer elements.
    I64 = 0x01,
    /// Single precision float elements.
    F32 = 0x02,
    /// Double precision float elements.
    F64 = 0x03,
    /// Handle elements, `0` for null.
    Ref = 0x04,
}

impl ElemKind {
    /// Decode a wire byte.
    pub const fn from_u8(b: u8) -> Option<Self> {
        use ElemKind::*;
        Some(match b {
            0x00 => I32,
            0x01 => I64,
            0x02 => F32,
            0x03 => F64,
            0x04 => Ref,
            _ => return None,
        })
    }

    /// Byte size of one element in the object payload.
    pub const fn size(&self) -> usize {
        match self {
            ElemKind::I32 | ElemKind::F32 | ElemKind::Ref => 4,
            ElemKind::I64 | ElemKind::F64 => 8,
        }
    }

    /// Whether elements of this kind hold heap handles.
    pub const fn is_ref(&self) -> bool {
        matches!(self, ElemKind::Ref)
    }
}

impl fmt::Display for ElemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
/// Constant pool entry tags.
pub enum ConstTag {
    /// Interned UTF-8 string; payload is an offset into the string blob.
    String = 0,
    /// 16-byte little-endian signed payload.
    I128 = 1,
    /// 16-byte little-endian unsigned payload.
    U128 = 2,
    /// Four-byte IEEE-754 payload, kept for uniform pool access.
    F32 = 3,
    /// Eight-byte IEEE-754 payload.
    F64 = 4,
    /// Upvalue descriptor blob: `u32` count then `count` type-kind bytes.
    UpvalDesc = 5,
    /// Jump table blob: `u32` case count then `count` relative `i32` offsets.
    JmpTable = 6,
}

impl ConstTag {
    /// Decode a wire tag.
    pub const fn from_u32(v: u32) -> Option<Self> {
        use ConstTag::*;
        Some(match v {
            0 => String,
            1 => I128,
            2 => U128,
            3 => F32,
            4 => F64,
            5 => UpvalDesc,
            6 => JmpTable,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
/// Fixed section identifiers of the SBC container.
pub enum SectionId {
    /// Type table.
    Types = 1,
    /// Field table.
    Fields = 2,
    /// Method table.
    Methods = 3,
    /// Signature table.
    Signatures = 4,
    /// Constant pool (string blob + tagged entries).
    ConstPool = 5,
    /// Global variable table.
    Globals = 6,
    /// Function table.
    Functions = 7,
    /// Raw code bytes.
    Code = 8,
    /// Optional pc-to-line mapping.
    Debug = 9,
    /// Optional import table.
    Imports = 10,
    /// Optional export table.
    Exports = 11,
}

impl SectionId {
    /// Decode a wire id; unknown ids are a load failure.
    pub const fn from_u32(v: u32) -> Option<Self> {
        use SectionId::*;
        Some(match v {
            1 => Types,
            2 => Fields,
            3 => Methods,
            4 => Signatures,
            5 => ConstPool,
            6 => Globals,
            7 => Functions,
            8 => Code,
            9 => Debug,
            10 => Imports,
            11 => Exports,
            _ => return None,
        })
    }
}

bitflags! {
    /// Flag word of import and export records. Only the lowest bit is
    /// defined; the loader rejects anything else.
    pub struct ImportFlags: u32 {
        /// Resolution failure of this symbol is not a load error; calling
        /// it still traps.
        const WEAK = 0x0001;
    }
}

bitflags! {
    /// Flag word of method records.
    pub struct MethodFlags: u32 {
        /// Method is the body of a closure and declares an upvalue
        /// descriptor through its function record.
        const CLOSURE_BODY = 0x0001;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn type_kind_wire_round_trip() {
        for kind in TypeKind::iter() {
            assert_eq!(TypeKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(TypeKind::from_u8(0x0f), None);
    }

    #[test]
    fn elem_kind_wire_round_trip() {
        for kind in ElemKind::iter() {
            assert_eq!(ElemKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(ElemKind::from_u8(5), None);
    }

    #[test]
    fn wide_kinds_take_two_slots() {
        assert_eq!(TypeKind::I128.slot_count(), 2);
        assert_eq!(TypeKind::U128.slot_count(), 2);
        assert_eq!(TypeKind::I64.slot_count(), 1);
    }

    #[test]
    fn ref_declares_zero_size_but_stores_a_handle() {
        assert_eq!(TypeKind::Ref.size(), 0);
        assert_eq!(TypeKind::Ref.storage_size(), 4);
        assert!(!TypeKind::Ref.is_numeric());
    }
}
