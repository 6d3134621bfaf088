//! Handle-indexed object heap with stop-the-world mark-sweep collection.
//!
//! A handle is a non-zero `u32`; slot 0 is a permanently occupied
//! sentinel so "null" and "invalid" coincide at the value level. The
//! freelist reuses slots LIFO, which keeps handle assignment
//! deterministic for tests; within a GC epoch handles are unique.

use sbc_asm::{ElemKind, Handle, Slot, TypeKind};
use tracing::debug;

use crate::consts::GC_INITIAL_THRESHOLD;
use crate::module::Module;

/// Discriminant of a heap object's payload layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Immutable UTF-8 string.
    String,
    /// Fixed array of scalar elements.
    ArrayScalar,
    /// Fixed array of handles.
    ArrayRef,
    /// Growable list of scalar elements.
    ListScalar,
    /// Growable list of handles.
    ListRef,
    /// Struct with typed fields at declared offsets.
    Object,
    /// Function pointer plus captured upvalue slots.
    Closure,
}

/// Payload of a heap object. The GC visitor matches on this tag; there
/// is no inheritance anywhere near the heap.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectData {
    /// UTF-8 bytes.
    Str(String),
    /// Contiguous scalar elements of `elem` width.
    ScalarArray {
        /// Element kind.
        elem: ElemKind,
        /// `length * elem.size()` bytes.
        bytes: Vec<u8>,
    },
    /// Contiguous handles.
    RefArray(Vec<Handle>),
    /// Growable scalar storage; `bytes` holds the full capacity.
    ScalarList {
        /// Element kind.
        elem: ElemKind,
        /// Live element count.
        len: u32,
        /// `capacity * elem.size()` bytes.
        bytes: Vec<u8>,
    },
    /// Growable handle storage; `slots` holds the full capacity.
    RefList {
        /// Live element count.
        len: u32,
        /// Capacity-sized backing.
        slots: Vec<Handle>,
    },
    /// Field bytes of size `type.size`.
    Object(Vec<u8>),
    /// Captured function.
    Closure {
        /// Body function id.
        func_id: u32,
        /// Captured slots, one per declared upvalue.
        upvalues: Vec<Slot>,
        /// Which upvalue slots hold handles, from the UpvalDesc.
        ref_mask: Vec<bool>,
    },
}

impl ObjectData {
    /// Payload discriminant.
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Str(_) => ObjectKind::String,
            Self::ScalarArray { .. } => ObjectKind::ArrayScalar,
            Self::RefArray(_) => ObjectKind::ArrayRef,
            Self::ScalarList { .. } => ObjectKind::ListScalar,
            Self::RefList { .. } => ObjectKind::ListRef,
            Self::Object(_) => ObjectKind::Object,
            Self::Closure { .. } => ObjectKind::Closure,
        }
    }

    /// User-visible element or byte length.
    pub fn length(&self) -> u32 {
        match self {
            Self::Str(s) => s.len() as u32,
            Self::ScalarArray { elem, bytes } => (bytes.len() / elem.size()) as u32,
            Self::RefArray(handles) => handles.len() as u32,
            Self::ScalarList { len, .. } | Self::RefList { len, .. } => *len,
            Self::Object(bytes) => bytes.len() as u32,
            Self::Closure { upvalues, .. } => upvalues.len() as u32,
        }
    }

    fn payload_bytes(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::ScalarArray { bytes, .. } | Self::ScalarList { bytes, .. } | Self::Object(bytes) => {
                bytes.len()
            }
            Self::RefArray(handles) => handles.len() * 4,
            Self::RefList { slots, .. } => slots.len() * 4,
            Self::Closure { upvalues, .. } => upvalues.len() * 8,
        }
    }
}

/// One live heap object: header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Type id recorded at allocation (element type for arrays/lists).
    pub type_id: u32,
    /// Mark bit of the current GC cycle.
    pub marked: bool,
    /// Payload.
    pub data: ObjectData,
}

impl HeapObject {
    /// Header + payload accounting size used against the GC threshold.
    fn size(&self) -> usize {
        16 + self.data.payload_bytes()
    }
}

/// The object arena. Owns every object exclusively; user code only ever
/// holds handles.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    freelist: Vec<Handle>,
    live_bytes: usize,
    threshold: usize,
    collections: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Empty heap with the sentinel slot occupied.
    pub fn new() -> Self {
        Self {
            // Slot 0 is the null sentinel and never allocated.
            slots: vec![None],
            freelist: Vec::new(),
            live_bytes: 0,
            threshold: GC_INITIAL_THRESHOLD,
            collections: 0,
        }
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Bytes currently accounted against the collection threshold.
    pub const fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Completed GC cycles.
    pub const fn collections(&self) -> u64 {
        self.collections
    }

    /// Whether the next allocation should collect first.
    pub const fn wants_collect(&self) -> bool {
        self.live_bytes >= self.threshold
    }

    /// Allocate, reusing the most recently freed slot when available.
    pub fn alloc(&mut self, type_id: u32, data: ObjectData) -> Handle {
        let object = HeapObject { type_id, marked: false, data };
        self.live_bytes += object.size();
        match self.freelist.pop() {
            Some(handle) => {
                self.slots[handle as usize] = Some(object);
                handle
            }
            None => {
                self.slots.push(Some(object));
                (self.slots.len() - 1) as Handle
            }
        }
    }

    /// Shared access; `None` for null, freed, and out-of-range handles.
    pub fn get(&self, handle: Handle) -> Option<&HeapObject> {
        if handle == 0 {
            return None;
        }
        self.slots.get(handle as usize)?.as_ref()
    }

    /// Mutable access; `None` for null, freed, and out-of-range handles.
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut HeapObject> {
        if handle == 0 {
            return None;
        }
        self.slots.get_mut(handle as usize)?.as_mut()
    }

    /// Record payload growth (list doubling) against the threshold.
    pub fn note_growth(&mut self, bytes: usize) {
        self.live_bytes += bytes;
    }

    /// Stop-the-world mark-sweep over the given root set.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Handle>, module: &Module) {
        let mut stack: Vec<Handle> = roots.into_iter().filter(|h| *h != 0).collect();

        while let Some(handle) = stack.pop() {
            match self.get_mut(handle) {
                Some(object) if !object.marked => object.marked = true,
                _ => continue,
            }
            if let Some(object) = self.get(handle) {
                self.trace_children(object, module, &mut stack);
            }
        }

        self.sweep();
    }

    fn trace_children(&self, object: &HeapObject, module: &Module, stack: &mut Vec<Handle>) {
        match &object.data {
            ObjectData::Str(_) | ObjectData::ScalarArray { .. } | ObjectData::ScalarList { .. } => {}
            ObjectData::RefArray(handles) => stack.extend(handles.iter().copied()),
            ObjectData::RefList { len, slots } => {
                stack.extend(slots[..*len as usize].iter().copied())
            }
            ObjectData::Object(bytes) => {
                let Some(ty) = module.types.get(object.type_id as usize) else {
                    return;
                };
                for field_id in ty.field_start..ty.field_start + ty.field_count {
                    let field = &module.fields[field_id as usize];
                    if module.types[field.type_id as usize].kind != TypeKind::Ref {
                        continue;
                    }
                    let at = field.offset as usize;
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(&bytes[at..at + 4]);
                    stack.push(Handle::from_le_bytes(buf));
                }
            }
            ObjectData::Closure { upvalues, ref_mask, .. } => {
                for (slot, is_ref) in upvalues.iter().zip(ref_mask) {
                    if *is_ref {
                        stack.push(*slot as Handle);
                    }
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut freed = 0usize;
        for index in 1..self.slots.len() {
            let slot = &mut self.slots[index];
            match slot {
                Some(object) if object.marked => object.marked = false,
                Some(object) => {
                    self.live_bytes -= object.size();
                    freed += 1;
                    *slot = None;
                    self.freelist.push(index as Handle);
                }
                None => {}
            }
        }
        self.collections += 1;
        self.threshold = (self.live_bytes * 2).max(GC_INITIAL_THRESHOLD);
        debug!(
            freed,
            live_bytes = self.live_bytes,
            threshold = self.threshold,
            cycle = self.collections,
            "gc cycle complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ModuleBuilder;
    use sbc_asm::Instruction;

    fn empty_module() -> Module {
        let bytes = ModuleBuilder::new()
            .simple_entry(&[Instruction::Enter(0), Instruction::Halt])
            .build();
        crate::loader::load_module(&bytes).expect("load")
    }

    #[test]
    fn null_handle_never_resolves() {
        let heap = Heap::new();
        assert!(heap.get(0).is_none());
    }

    #[test]
    fn unrooted_objects_are_swept_and_slots_reused_lifo() {
        let module = empty_module();
        let mut heap = Heap::new();
        let a = heap.alloc(0, ObjectData::Str("a".into()));
        let b = heap.alloc(0, ObjectData::Str("b".into()));
        assert_eq!((a, b), (1, 2));

        heap.collect([a], &module);
        assert!(heap.get(a).is_some());
        assert!(heap.get(b).is_none());

        // LIFO freelist: the freed slot is the next one handed out.
        let c = heap.alloc(0, ObjectData::Str("c".into()));
        assert_eq!(c, b);
    }

    #[test]
    fn ref_array_children_survive() {
        let module = empty_module();
        let mut heap = Heap::new();
        let child = heap.alloc(0, ObjectData::Str("child".into()));
        let array = heap.alloc(0, ObjectData::RefArray(vec![child, 0]));
        heap.collect([array], &module);
        assert!(heap.get(child).is_some());
    }

    #[test]
    fn cycles_are_collected_when_unrooted() {
        let module = empty_module();
        let mut heap = Heap::new();
        let a = heap.alloc(0, ObjectData::RefArray(vec![0]));
        let b = heap.alloc(0, ObjectData::RefArray(vec![a]));
        if let Some(obj) = heap.get_mut(a) {
            if let ObjectData::RefArray(handles) = &mut obj.data {
                handles[0] = b;
            }
        }
        heap.collect([], &module);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn closure_upvalues_traced_through_mask() {
        let module = empty_module();
        let mut heap = Heap::new();
        let captured = heap.alloc(0, ObjectData::Str("captured".into()));
        let closure = heap.alloc(
            0,
            ObjectData::Closure {
                func_id: 1,
                upvalues: vec![captured as Slot, 7],
                ref_mask: vec![true, false],
            },
        );
        heap.collect([closure], &module);
        assert!(heap.get(captured).is_some());
    }

    #[test]
    fn live_bytes_shrink_after_sweep() {
        let module = empty_module();
        let mut heap = Heap::new();
        let before = heap.live_bytes();
        heap.alloc(0, ObjectData::Str("x".repeat(100)));
        assert!(heap.live_bytes() > before);
        heap.collect([], &module);
        assert_eq!(heap.live_bytes(), before);
    }
}
