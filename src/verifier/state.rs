//! Abstract value types and per-pc machine state of the verifier.

use core::fmt;

use sbc_asm::{ElemKind, TypeKind};

use crate::module::Module;

/// Static reference type of a stack or local slot holding a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTy {
    /// The null literal; compatible with every reference type.
    Null,
    /// String object.
    Str,
    /// Structured object of the given type id.
    Object(u32),
    /// Fixed array with the given element kind.
    Array(ElemKind),
    /// Growable list with the given element kind.
    List(ElemKind),
    /// Closure over the given function id.
    Closure(u32),
    /// A reference whose precise shape was lost at a merge. Still a
    /// handle for the GC bitmap, but typed heap operations reject it.
    Any,
}

/// Abstract slot type. Narrow kinds keep their identity even though
/// they live widened on the runtime stack; 128-bit values are tracked
/// as an adjacent Hi/Lo pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsTy {
    /// Widened 8-bit signed.
    I8,
    /// Widened 16-bit signed.
    I16,
    /// 32-bit signed.
    I32,
    /// 64-bit signed.
    I64,
    /// Widened 8-bit unsigned.
    U8,
    /// Widened 16-bit unsigned.
    U16,
    /// 32-bit unsigned.
    U32,
    /// 64-bit unsigned.
    U64,
    /// Single float.
    F32,
    /// Double float.
    F64,
    /// High half of a 128-bit signed pair.
    I128Hi,
    /// Low half of a 128-bit signed pair; always directly above its Hi.
    I128Lo,
    /// High half of a 128-bit unsigned pair.
    U128Hi,
    /// Low half of a 128-bit unsigned pair.
    U128Lo,
    /// Boolean.
    Bool,
    /// UTF-16 code unit.
    Char,
    /// Heap reference.
    Ref(RefTy),
}

impl fmt::Display for AbsTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref(RefTy::Null) => write!(f, "null"),
            Self::Ref(r) => write!(f, "ref:{r:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl AbsTy {
    /// Whether this slot holds a heap handle.
    pub const fn is_ref(&self) -> bool {
        matches!(self, Self::Ref(_))
    }

    /// Whether this slot is half of a 128-bit pair.
    pub const fn is_wide_half(&self) -> bool {
        matches!(self, Self::I128Hi | Self::I128Lo | Self::U128Hi | Self::U128Lo)
    }

    /// Single-slot abstract type of a scalar kind. Wide kinds have no
    /// single-slot form and return `None`.
    pub const fn scalar(kind: TypeKind) -> Option<Self> {
        use TypeKind as K;
        Some(match kind {
            K::I8 => Self::I8,
            K::I16 => Self::I16,
            K::I32 => Self::I32,
            K::I64 => Self::I64,
            K::U8 => Self::U8,
            K::U16 => Self::U16,
            K::U32 => Self::U32,
            K::U64 => Self::U64,
            K::F32 => Self::F32,
            K::F64 => Self::F64,
            K::Bool => Self::Bool,
            K::Char => Self::Char,
            K::I128 | K::U128 | K::Ref => return None,
        })
    }

    /// Stack slots a declared kind pushes, bottom first.
    pub fn of_kind(kind: TypeKind) -> Vec<Self> {
        match kind {
            TypeKind::I128 => vec![Self::I128Hi, Self::I128Lo],
            TypeKind::U128 => vec![Self::U128Hi, Self::U128Lo],
            TypeKind::Ref => vec![Self::Ref(RefTy::Any)],
            other => vec![Self::scalar(other).unwrap_or(Self::I32)],
        }
    }

    /// Element type an array/list read produces.
    pub const fn of_elem(elem: ElemKind) -> Self {
        match elem {
            ElemKind::I32 => Self::I32,
            ElemKind::I64 => Self::I64,
            ElemKind::F32 => Self::F32,
            ElemKind::F64 => Self::F64,
            ElemKind::Ref => Self::Ref(RefTy::Any),
        }
    }

    /// Join of two slot types at a control-flow merge. `None` when the
    /// edges disagree irreconcilably.
    pub fn merge(self, other: Self) -> Option<Self> {
        if self == other {
            return Some(self);
        }
        match (self, other) {
            (Self::Ref(a), Self::Ref(b)) => Some(Self::Ref(merge_ref(a, b))),
            _ => None,
        }
    }
}

fn merge_ref(a: RefTy, b: RefTy) -> RefTy {
    match (a, b) {
        (RefTy::Null, other) | (other, RefTy::Null) => other,
        (a, b) if a == b => a,
        _ => RefTy::Any,
    }
}

/// Abstract machine state at one pc: stack types bottom-to-top, locals
/// with their initialization typestate, and the post-`Leave` flag.
#[derive(Debug, Clone, PartialEq)]
pub struct AbstractState {
    /// Stack types, bottom first.
    pub stack: Vec<AbsTy>,
    /// Locals; `None` while uninitialized. Parameters start typed.
    pub locals: Vec<Option<AbsTy>>,
    /// Set after `Leave`; only frame exits may follow.
    pub window_dropped: bool,
}

impl AbstractState {
    /// Entry state of a function: parameters typed, the rest of the
    /// window uninitialized.
    pub fn function_entry(module: &Module, param_type_ids: &[u32], locals: u32) -> Self {
        let mut state = Self {
            stack: Vec::new(),
            locals: vec![None; locals as usize],
            window_dropped: false,
        };
        let mut slot = 0usize;
        for type_id in param_type_ids {
            for ty in decl_types(module, *type_id) {
                state.locals[slot] = Some(ty);
                slot += 1;
            }
        }
        state
    }

    /// Merge `incoming` into this state. `Ok(true)` when something
    /// changed, `Err` with a message when the edges disagree.
    pub fn merge_from(&mut self, incoming: &Self) -> Result<bool, String> {
        if self.stack.len() != incoming.stack.len() {
            return Err(format!(
                "stack height mismatch at join: {} vs {}",
                self.stack.len(),
                incoming.stack.len()
            ));
        }
        if self.window_dropped != incoming.window_dropped {
            return Err("locals window state differs at join".into());
        }

        let mut changed = false;
        for (slot, (mine, theirs)) in self.stack.iter_mut().zip(&incoming.stack).enumerate() {
            let merged = mine.merge(*theirs).ok_or_else(|| {
                format!("stack slot {slot} type mismatch at join: {mine} vs {theirs}")
            })?;
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }
        for (slot, (mine, theirs)) in self.locals.iter_mut().zip(&incoming.locals).enumerate() {
            let merged = match (*mine, *theirs) {
                (Some(a), Some(b)) => Some(a.merge(b).ok_or_else(|| {
                    format!("local {slot} type mismatch at join: {a} vs {b}")
                })?),
                // Uninitialized on any edge means uninitialized after it.
                _ => None,
            };
            if merged != *mine {
                *mine = merged;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Stack slots a declared type id pushes, bottom first.
pub fn decl_types(module: &Module, type_id: u32) -> Vec<AbsTy> {
    let Some(ty) = module.types.get(type_id as usize) else {
        return vec![AbsTy::Ref(RefTy::Any)];
    };
    if ty.is_object() {
        return vec![AbsTy::Ref(RefTy::Object(type_id))];
    }
    AbsTy::of_kind(ty.kind)
}

/// Whether a value of abstract type `ty` satisfies the declared type id
/// under invariant parameter passing. Wide declarations are handled by
/// the caller slot-pair-wise.
pub fn decl_accepts(module: &Module, type_id: u32, ty: AbsTy) -> bool {
    let Some(decl) = module.types.get(type_id as usize) else {
        return false;
    };
    if decl.is_object() {
        return matches!(ty, AbsTy::Ref(RefTy::Object(id)) if id == type_id)
            || matches!(ty, AbsTy::Ref(RefTy::Null));
    }
    match decl.kind {
        TypeKind::Ref => ty.is_ref(),
        kind => AbsTy::scalar(kind).map(|decl| decl == ty).unwrap_or(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_merges_with_typed_refs() {
        let a = AbsTy::Ref(RefTy::Null);
        let b = AbsTy::Ref(RefTy::Str);
        assert_eq!(a.merge(b), Some(AbsTy::Ref(RefTy::Str)));
    }

    #[test]
    fn distinct_object_types_decay_to_any() {
        let a = AbsTy::Ref(RefTy::Object(1));
        let b = AbsTy::Ref(RefTy::Object(2));
        assert_eq!(a.merge(b), Some(AbsTy::Ref(RefTy::Any)));
    }

    #[test]
    fn scalar_mismatch_does_not_merge() {
        assert_eq!(AbsTy::I32.merge(AbsTy::U32), None);
        assert_eq!(AbsTy::I8.merge(AbsTy::I32), None);
    }

    #[test]
    fn height_mismatch_is_reported() {
        let mut a = AbstractState { stack: vec![AbsTy::I32], locals: vec![], window_dropped: false };
        let b = AbstractState { stack: vec![], locals: vec![], window_dropped: false };
        assert!(a.merge_from(&b).unwrap_err().contains("height"));
    }

    #[test]
    fn uninitialized_edge_clears_local() {
        let mut a = AbstractState {
            stack: vec![],
            locals: vec![Some(AbsTy::I32)],
            window_dropped: false,
        };
        let b = AbstractState { stack: vec![], locals: vec![None], window_dropped: false };
        assert!(a.merge_from(&b).unwrap());
        assert_eq!(a.locals[0], None);
    }
}
