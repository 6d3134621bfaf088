//! Heap-facing opcodes: arrays, lists, strings, objects, fields,
//! closures, upvalues. Allocating ops collect (if due) before touching
//! the stack, so every live handle is still covered by the entry-state
//! stack map.

use sbc_asm::{ElemKind, Handle, Slot, TrapReason, TypeKind};

use super::alu::i32_slot;
use super::internal::{RunResult, RuntimeTrap};
use super::Interpreter;
use crate::consts::LIST_MIN_CAPACITY;
use crate::heap::ObjectData;

fn oob(what: &str, index: i32, len: u32) -> RuntimeTrap {
    RuntimeTrap::new(
        TrapReason::IndexOutOfBounds,
        format!("{what} index {index} out of bounds for length {len}"),
    )
}

fn checked_index(what: &str, index: i32, len: u32) -> RunResult<usize> {
    if index < 0 || index as u32 >= len {
        return Err(oob(what, index, len));
    }
    Ok(index as usize)
}

fn read_scalar(elem: ElemKind, bytes: &[u8], index: usize) -> Slot {
    let size = elem.size();
    let at = index * size;
    if size == 4 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(buf) as Slot
    } else {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(buf)
    }
}

fn write_scalar(elem: ElemKind, bytes: &mut [u8], index: usize, value: Slot) {
    let size = elem.size();
    let at = index * size;
    if size == 4 {
        bytes[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
    } else {
        bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Interpreter {
    fn obj_data(&self, handle: Handle, what: &str) -> RunResult<&ObjectData> {
        self.heap
            .get(handle)
            .map(|o| &o.data)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, format!("{what} of null")))
    }

    /* ARRAYS */

    pub(crate) fn new_array(&mut self, elem: ElemKind, type_id: u32, length: u32) -> RunResult<()> {
        self.maybe_collect();
        let data = match elem {
            ElemKind::Ref => ObjectData::RefArray(vec![0; length as usize]),
            scalar => ObjectData::ScalarArray {
                elem: scalar,
                bytes: vec![0; length as usize * scalar.size()],
            },
        };
        let handle = self.heap.alloc(type_id, data);
        self.push(handle as Slot)
    }

    pub(crate) fn array_len(&mut self) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let length = match self.obj_data(handle, "ArrayLen")? {
            ObjectData::ScalarArray { elem, bytes } => (bytes.len() / elem.size()) as i32,
            ObjectData::RefArray(handles) => handles.len() as i32,
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ArrayLen of non-array")),
        };
        self.push(i32_slot(length))
    }

    pub(crate) fn array_get(&mut self, elem: ElemKind) -> RunResult<()> {
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let value = match (elem, self.obj_data(handle, "ArrayGet")?) {
            (ElemKind::Ref, ObjectData::RefArray(handles)) => {
                handles[checked_index("array", index, handles.len() as u32)?] as Slot
            }
            (want, ObjectData::ScalarArray { elem, bytes }) if *elem == want => {
                let length = (bytes.len() / elem.size()) as u32;
                read_scalar(want, bytes, checked_index("array", index, length)?)
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ArrayGet element kind")),
        };
        self.push(value)
    }

    pub(crate) fn array_set(&mut self, elem: ElemKind) -> RunResult<()> {
        let value = self.pop()?;
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ArraySet of null"))?;
        match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefArray(handles)) => {
                let at = checked_index("array", index, handles.len() as u32)?;
                handles[at] = value as Handle;
            }
            (want, ObjectData::ScalarArray { elem, bytes }) if *elem == want => {
                let length = (bytes.len() / elem.size()) as u32;
                let at = checked_index("array", index, length)?;
                write_scalar(want, bytes, at, value);
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ArraySet element kind")),
        }
        Ok(())
    }

    /* LISTS */

    pub(crate) fn new_list(&mut self, elem: ElemKind, type_id: u32, capacity: u32) -> RunResult<()> {
        self.maybe_collect();
        let data = match elem {
            ElemKind::Ref => ObjectData::RefList { len: 0, slots: vec![0; capacity as usize] },
            scalar => ObjectData::ScalarList {
                elem: scalar,
                len: 0,
                bytes: vec![0; capacity as usize * scalar.size()],
            },
        };
        let handle = self.heap.alloc(type_id, data);
        self.push(handle as Slot)
    }

    pub(crate) fn list_len(&mut self) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let length = match self.obj_data(handle, "ListLen")? {
            ObjectData::ScalarList { len, .. } | ObjectData::RefList { len, .. } => *len as i32,
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListLen of non-list")),
        };
        self.push(i32_slot(length))
    }

    pub(crate) fn list_push(&mut self, elem: ElemKind) -> RunResult<()> {
        self.maybe_collect();
        let value = self.pop()?;
        let handle = self.pop()? as Handle;
        let mut grown = 0usize;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListPush of null"))?;
        match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                if (*len as usize) == slots.len() {
                    let target = (slots.len() * 2).max(LIST_MIN_CAPACITY as usize);
                    grown = (target - slots.len()) * 4;
                    slots.resize(target, 0);
                }
                slots[*len as usize] = value as Handle;
                *len += 1;
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                let size = want.size();
                if (*len as usize) * size == bytes.len() {
                    let target = (bytes.len() * 2).max(LIST_MIN_CAPACITY as usize * size);
                    grown = target - bytes.len();
                    bytes.resize(target, 0);
                }
                write_scalar(want, bytes, *len as usize, value);
                *len += 1;
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListPush element kind")),
        }
        if grown > 0 {
            self.heap.note_growth(grown);
        }
        Ok(())
    }

    pub(crate) fn list_pop(&mut self, elem: ElemKind) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListPop of null"))?;
        let value = match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                if *len == 0 {
                    return Err(RuntimeTrap::new(TrapReason::ListEmpty, "pop from empty list"));
                }
                *len -= 1;
                slots[*len as usize] as Slot
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                if *len == 0 {
                    return Err(RuntimeTrap::new(TrapReason::ListEmpty, "pop from empty list"));
                }
                *len -= 1;
                read_scalar(want, bytes, *len as usize)
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListPop element kind")),
        };
        self.push(value)
    }

    pub(crate) fn list_get(&mut self, elem: ElemKind) -> RunResult<()> {
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let value = match (elem, self.obj_data(handle, "ListGet")?) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                slots[checked_index("list", index, *len)?] as Slot
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                read_scalar(want, bytes, checked_index("list", index, *len)?)
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListGet element kind")),
        };
        self.push(value)
    }

    pub(crate) fn list_set(&mut self, elem: ElemKind) -> RunResult<()> {
        let value = self.pop()?;
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListSet of null"))?;
        match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                let at = checked_index("list", index, *len)?;
                slots[at] = value as Handle;
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                let at = checked_index("list", index, *len)?;
                write_scalar(want, bytes, at, value);
            }
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListSet element kind")),
        }
        Ok(())
    }

    pub(crate) fn list_insert(&mut self, elem: ElemKind) -> RunResult<()> {
        self.maybe_collect();
        let value = self.pop()?;
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let mut grown = 0usize;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListInsert of null"))?;
        match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                // Insertion at len appends.
                if index < 0 || index as u32 > *len {
                    return Err(oob("list", index, *len));
                }
                if (*len as usize) == slots.len() {
                    let target = (slots.len() * 2).max(LIST_MIN_CAPACITY as usize);
                    grown = (target - slots.len()) * 4;
                    slots.resize(target, 0);
                }
                slots.copy_within(index as usize..*len as usize, index as usize + 1);
                slots[index as usize] = value as Handle;
                *len += 1;
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                if index < 0 || index as u32 > *len {
                    return Err(oob("list", index, *len));
                }
                let size = want.size();
                if (*len as usize) * size == bytes.len() {
                    let target = (bytes.len() * 2).max(LIST_MIN_CAPACITY as usize * size);
                    grown = target - bytes.len();
                    bytes.resize(target, 0);
                }
                let start = index as usize * size;
                let end = *len as usize * size;
                bytes.copy_within(start..end, start + size);
                write_scalar(want, bytes, index as usize, value);
                *len += 1;
            }
            _ => {
                return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListInsert element kind"))
            }
        }
        if grown > 0 {
            self.heap.note_growth(grown);
        }
        Ok(())
    }

    pub(crate) fn list_remove(&mut self, elem: ElemKind) -> RunResult<()> {
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListRemove of null"))?;
        let value = match (elem, &mut object.data) {
            (ElemKind::Ref, ObjectData::RefList { len, slots }) => {
                let at = checked_index("list", index, *len)?;
                let removed = slots[at] as Slot;
                slots.copy_within(at + 1..*len as usize, at);
                *len -= 1;
                removed
            }
            (want, ObjectData::ScalarList { elem, len, bytes }) if *elem == want => {
                let at = checked_index("list", index, *len)?;
                let removed = read_scalar(want, bytes, at);
                let size = want.size();
                bytes.copy_within((at + 1) * size..*len as usize * size, at * size);
                *len -= 1;
                removed
            }
            _ => {
                return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListRemove element kind"))
            }
        };
        self.push(value)
    }

    pub(crate) fn list_clear(&mut self) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "ListClear of null"))?;
        match &mut object.data {
            ObjectData::ScalarList { len, .. } | ObjectData::RefList { len, .. } => *len = 0,
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "ListClear of non-list")),
        }
        Ok(())
    }

    /* STRINGS */

    fn read_str(&self, handle: Handle, what: &str) -> RunResult<&str> {
        match self.obj_data(handle, what)? {
            ObjectData::Str(s) => Ok(s),
            _ => Err(RuntimeTrap::new(TrapReason::TypeMismatch, format!("{what} of non-string"))),
        }
    }

    pub(crate) fn string_len(&mut self) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let length = self.read_str(handle, "StringLen")?.chars().count() as i32;
        self.push(i32_slot(length))
    }

    pub(crate) fn string_concat(&mut self) -> RunResult<()> {
        self.maybe_collect();
        let right = self.peek(0)? as Handle;
        let left = self.peek(1)? as Handle;
        let mut text = self.read_str(left, "StringConcat")?.to_owned();
        text.push_str(self.read_str(right, "StringConcat")?);
        let handle = self.heap.alloc(u32::MAX, ObjectData::Str(text));
        self.pop()?;
        self.pop()?;
        self.push(handle as Slot)
    }

    pub(crate) fn string_get_char(&mut self) -> RunResult<()> {
        let index = self.pop()? as u32 as i32;
        let handle = self.pop()? as Handle;
        let text = self.read_str(handle, "StringGetChar")?;
        if index < 0 {
            return Err(RuntimeTrap::new(
                TrapReason::StringOutOfBounds,
                format!("string index {index} out of bounds"),
            ));
        }
        let ch = text.chars().nth(index as usize).ok_or_else(|| {
            RuntimeTrap::new(
                TrapReason::StringOutOfBounds,
                format!("string index {index} out of bounds for length {}", text.chars().count()),
            )
        })?;
        let code = ch as u32;
        if code > u16::MAX as u32 {
            return Err(RuntimeTrap::new(
                TrapReason::CharOutOfRange,
                format!("scalar U+{code:04X} does not fit a char"),
            ));
        }
        self.push(code as Slot)
    }

    pub(crate) fn string_slice(&mut self) -> RunResult<()> {
        self.maybe_collect();
        let length = self.peek(0)? as u32 as i32;
        let start = self.peek(1)? as u32 as i32;
        let handle = self.peek(2)? as Handle;
        let text = self.read_str(handle, "StringSlice")?;
        let total = text.chars().count() as i32;
        if start < 0 || length < 0 || start.checked_add(length).map_or(true, |end| end > total) {
            return Err(RuntimeTrap::new(
                TrapReason::StringOutOfBounds,
                format!("slice {start}+{length} out of bounds for length {total}"),
            ));
        }
        let sliced: String = text.chars().skip(start as usize).take(length as usize).collect();
        let handle = self.heap.alloc(u32::MAX, ObjectData::Str(sliced));
        self.pop()?;
        self.pop()?;
        self.pop()?;
        self.push(handle as Slot)
    }

    /* OBJECTS */

    pub(crate) fn new_object(&mut self, type_id: u32) -> RunResult<()> {
        self.maybe_collect();
        let size = self
            .module
            .types
            .get(type_id as usize)
            .map(|t| t.size as usize)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::UnreachableExecuted, "bad object type"))?;
        let handle = self.heap.alloc(type_id, ObjectData::Object(vec![0; size]));
        self.push(handle as Slot)
    }

    fn field_def(&self, field_id: u32) -> RunResult<crate::module::FieldDef> {
        self.module
            .fields
            .get(field_id as usize)
            .copied()
            .ok_or_else(|| {
                RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("field {field_id}"))
            })
    }

    pub(crate) fn load_field(&mut self, field_id: u32) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let field = self.field_def(field_id)?;
        let kind = self.module.types[field.type_id as usize].kind;
        let bytes = match self.obj_data(handle, "LoadField")? {
            ObjectData::Object(bytes) => bytes,
            _ => return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "LoadField of non-object")),
        };
        let at = field.offset as usize;
        let mut wide = None;
        let value = match kind {
            TypeKind::I8 => i32_slot(bytes[at] as i8 as i32),
            TypeKind::U8 | TypeKind::Bool => bytes[at] as Slot,
            TypeKind::I16 => i32_slot(i16::from_le_bytes([bytes[at], bytes[at + 1]]) as i32),
            TypeKind::U16 | TypeKind::Char => {
                u16::from_le_bytes([bytes[at], bytes[at + 1]]) as Slot
            }
            TypeKind::I32 | TypeKind::U32 | TypeKind::F32 | TypeKind::Ref => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[at..at + 4]);
                u32::from_le_bytes(buf) as Slot
            }
            TypeKind::I64 | TypeKind::U64 | TypeKind::F64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[at..at + 8]);
                u64::from_le_bytes(buf)
            }
            TypeKind::I128 | TypeKind::U128 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(&bytes[at..at + 16]);
                wide = Some(u128::from_le_bytes(buf));
                0
            }
        };
        match wide {
            Some(pair) => self.push_wide(pair),
            None => self.push(value),
        }
    }

    pub(crate) fn store_field(&mut self, field_id: u32) -> RunResult<()> {
        let field = self.field_def(field_id)?;
        let kind = self.module.types[field.type_id as usize].kind;
        let wide = kind.slot_count() == 2;
        let value = if wide { self.pop_wide()? } else { self.pop()? as u128 };
        let handle = self.pop()? as Handle;
        let object = self
            .heap
            .get_mut(handle)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "StoreField of null"))?;
        let ObjectData::Object(bytes) = &mut object.data else {
            return Err(RuntimeTrap::new(TrapReason::TypeMismatch, "StoreField of non-object"));
        };
        let at = field.offset as usize;
        let size = kind.storage_size() as usize;
        bytes[at..at + size].copy_from_slice(&value.to_le_bytes()[..size]);
        Ok(())
    }

    pub(crate) fn type_of(&mut self) -> RunResult<()> {
        let handle = self.pop()? as Handle;
        let type_id = self
            .heap
            .get(handle)
            .map(|o| o.type_id)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "TypeOf of null"))?;
        self.push(type_id as Slot)
    }

    /* CLOSURES */

    pub(crate) fn new_closure(&mut self, func_id: u32, upvalue_count: u8) -> RunResult<()> {
        self.maybe_collect();
        let kinds = self.module.upval_kinds(func_id);
        if kinds.len() != upvalue_count as usize {
            return Err(RuntimeTrap::new(
                TrapReason::ArityMismatch,
                "NewClosure capture count disagrees with the declaration",
            ));
        }
        let ref_mask: Vec<bool> = kinds.iter().map(|k| *k == TypeKind::Ref).collect();
        let handle = self.heap.alloc(
            u32::MAX,
            ObjectData::Closure {
                func_id,
                upvalues: vec![0; upvalue_count as usize],
                ref_mask,
            },
        );
        // Captured values leave the stack in reverse declaration order.
        for index in (0..upvalue_count as usize).rev() {
            let value = self.pop()?;
            let Some(object) = self.heap.get_mut(handle) else {
                return Err(RuntimeTrap::new(TrapReason::InvalidHandle, "closure vanished"));
            };
            if let ObjectData::Closure { upvalues, .. } = &mut object.data {
                upvalues[index] = value;
            }
        }
        self.push(handle as Slot)
    }

    pub(crate) fn load_upvalue(&mut self, index: u32) -> RunResult<()> {
        let closure = self.frame()?.upvalues;
        match self.obj_data(closure, "LoadUpvalue")? {
            ObjectData::Closure { upvalues, .. } => {
                let value = *upvalues.get(index as usize).ok_or_else(|| {
                    RuntimeTrap::new(TrapReason::UnreachableExecuted, "upvalue out of range")
                })?;
                self.push(value)
            }
            _ => Err(RuntimeTrap::new(TrapReason::TypeMismatch, "frame has no upvalues")),
        }
    }

    pub(crate) fn store_upvalue(&mut self, index: u32) -> RunResult<()> {
        let value = self.pop()?;
        let closure = self.frame()?.upvalues;
        let object = self
            .heap
            .get_mut(closure)
            .ok_or_else(|| RuntimeTrap::new(TrapReason::NullAccess, "StoreUpvalue of null"))?;
        match &mut object.data {
            ObjectData::Closure { upvalues, .. } => {
                let slot = upvalues.get_mut(index as usize).ok_or_else(|| {
                    RuntimeTrap::new(TrapReason::UnreachableExecuted, "upvalue out of range")
                })?;
                *slot = value;
                Ok(())
            }
            _ => Err(RuntimeTrap::new(TrapReason::TypeMismatch, "frame has no upvalues")),
        }
    }

    /* POOL CONSTANTS */

    pub(crate) fn intern_string(&mut self, const_id: u32) -> RunResult<Handle> {
        let cached = *self.string_cache.get(const_id as usize).ok_or_else(|| {
            RuntimeTrap::new(TrapReason::UnreachableExecuted, format!("const {const_id}"))
        })?;
        if cached != 0 {
            return Ok(cached);
        }
        let offset = match self.module.consts.get(const_id as usize) {
            Some(crate::module::ConstEntry::Str(offset)) => *offset,
            _ => {
                return Err(RuntimeTrap::new(
                    TrapReason::UnreachableExecuted,
                    "ConstString of non-string const",
                ))
            }
        };
        let text = self.module.str_at(offset).to_owned();
        let handle = self.heap.alloc(u32::MAX, ObjectData::Str(text));
        self.string_cache[const_id as usize] = handle;
        Ok(handle)
    }
}
