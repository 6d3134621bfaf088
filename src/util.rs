//! Canonical module builders used by the test suite and by embedders
//! producing fixtures. [`ModuleBuilder::build`] and [`emit_module`] share
//! one encoder, so loading a built module and re-emitting it reproduces
//! the bytes exactly.

use std::collections::HashMap;

use sbc_asm::{ConstTag, ImportFlags, Instruction, MethodFlags, SectionId, TypeKind};

use crate::codec::ByteWriter;
use crate::consts::{
    HEADER_SIZE, MODULE_MAGIC, MODULE_VERSION, NO_INIT, NO_UPVAL_DESC, SECTION_ENTRY_SIZE,
    VOID_TYPE,
};
use crate::module::{
    ConstEntry, DebugRecord, ExportDef, FieldDef, FunctionDef, GlobalDef, ImportDef, MethodDef,
    Module, Signature, TypeDef,
};

/// Incremental builder for binary SBC modules.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    sigs: Vec<Signature>,
    string_blob: Vec<u8>,
    string_offsets: HashMap<String, u32>,
    consts: Vec<ConstEntry>,
    globals: Vec<GlobalDef>,
    functions: Vec<FunctionDef>,
    code: Vec<u8>,
    imports: Vec<ImportDef>,
    exports: Vec<ExportDef>,
    debug: Vec<DebugRecord>,
    entry_method: u32,
    stack_max: u32,
}

impl ModuleBuilder {
    /// Empty builder; entry defaults to the first function, stack_max to
    /// the header default (encoded as 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a NUL-terminated string in the pool's string region.
    pub fn intern(&mut self, text: &str) -> u32 {
        if let Some(offset) = self.string_offsets.get(text) {
            return *offset;
        }
        let offset = self.string_blob.len() as u32;
        self.string_blob.extend_from_slice(text.as_bytes());
        self.string_blob.push(0);
        self.string_offsets.insert(text.to_owned(), offset);
        offset
    }

    /// Add a primitive (or bare-Ref) type record; returns its type id.
    pub fn add_type(&mut self, kind: TypeKind) -> u32 {
        self.types.push(TypeDef { kind, size: kind.size(), field_count: 0, field_start: 0 });
        (self.types.len() - 1) as u32
    }

    /// Chainable [`Self::add_type`] for the common I32 case.
    pub fn with_i32_type(mut self) -> Self {
        self.add_type(TypeKind::I32);
        self
    }

    /// Add an object type with the given (name, field type id) list.
    /// Offsets are assigned in declaration order with natural alignment;
    /// returns (type id, first field id).
    pub fn object_type(&mut self, name_hint: &str, fields: &[(&str, u32)]) -> (u32, u32) {
        let _ = self.intern(name_hint);
        let field_start = self.fields.len() as u32;
        let mut cursor = 0u32;
        let owner = self.types.len() as u32;
        for (name, type_id) in fields {
            let storage = self.types[*type_id as usize].kind.storage_size();
            let align = storage.min(8).max(1);
            cursor = (cursor + align - 1) / align * align;
            let name_str = self.intern(name);
            self.fields.push(FieldDef {
                name_str,
                type_id: *type_id,
                offset: cursor,
                flags: 0,
                owner,
            });
            cursor += storage;
        }
        let size = (cursor.max(1) + 3) / 4 * 4;
        self.types.push(TypeDef {
            kind: TypeKind::Ref,
            size,
            field_count: fields.len() as u32,
            field_start,
        });
        (owner, field_start)
    }

    /// Add a string constant; returns its const id.
    pub fn str_const(&mut self, text: &str) -> u32 {
        let offset = self.intern(text);
        self.consts.push(ConstEntry::Str(offset));
        (self.consts.len() - 1) as u32
    }

    /// Add an i128 constant.
    pub fn i128_const(&mut self, value: i128) -> u32 {
        self.consts.push(ConstEntry::I128(value));
        (self.consts.len() - 1) as u32
    }

    /// Add a u128 constant.
    pub fn u128_const(&mut self, value: u128) -> u32 {
        self.consts.push(ConstEntry::U128(value));
        (self.consts.len() - 1) as u32
    }

    /// Add an f32 constant.
    pub fn f32_const(&mut self, value: f32) -> u32 {
        self.consts.push(ConstEntry::F32(value));
        (self.consts.len() - 1) as u32
    }

    /// Add an f64 constant.
    pub fn f64_const(&mut self, value: f64) -> u32 {
        self.consts.push(ConstEntry::F64(value));
        (self.consts.len() - 1) as u32
    }

    /// Add a jump-table blob constant.
    pub fn jmp_table_const(&mut self, cases: &[i32]) -> u32 {
        self.consts.push(ConstEntry::JmpTable(cases.to_vec()));
        (self.consts.len() - 1) as u32
    }

    /// Add an upvalue descriptor constant. Const id 0 is the function
    /// record's no-descriptor sentinel, so the pool gets a pad entry
    /// first when empty.
    pub fn upval_desc_const(&mut self, kinds: &[TypeKind]) -> u32 {
        if self.consts.is_empty() {
            let offset = self.intern("");
            self.consts.push(ConstEntry::Str(offset));
        }
        self.consts.push(ConstEntry::UpvalDesc(kinds.to_vec()));
        (self.consts.len() - 1) as u32
    }

    /// Add a global; returns its global id.
    pub fn add_global(&mut self, type_id: u32, init_const: Option<u32>) -> u32 {
        self.globals.push(GlobalDef { type_id, init_const: init_const.unwrap_or(NO_INIT) });
        (self.globals.len() - 1) as u32
    }

    /// Add a signature; returns its sig id.
    pub fn add_sig(&mut self, params: &[u32], ret: u32) -> u32 {
        self.sigs.push(Signature { ret_type_id: ret, params: params.to_vec() });
        (self.sigs.len() - 1) as u32
    }

    /// Add a function (one method per function); returns its func id.
    /// `locals` is widened to cover the parameter slots.
    pub fn function(
        &mut self,
        name: &str,
        params: &[u32],
        ret: u32,
        locals: u32,
        insns: &[Instruction],
    ) -> u32 {
        self.function_inner(name, params, ret, locals, NO_UPVAL_DESC, insns)
    }

    /// Add a closure body declaring upvalue kinds via a descriptor const.
    pub fn closure_function(
        &mut self,
        name: &str,
        params: &[u32],
        ret: u32,
        locals: u32,
        upval_desc: u32,
        insns: &[Instruction],
    ) -> u32 {
        self.function_inner(name, params, ret, locals, upval_desc, insns)
    }

    fn function_inner(
        &mut self,
        name: &str,
        params: &[u32],
        ret: u32,
        locals: u32,
        upval_desc: u32,
        insns: &[Instruction],
    ) -> u32 {
        let mut body = Vec::new();
        for insn in insns {
            insn.encode(&mut body);
        }
        self.raw_function(name, params, ret, locals, upval_desc, &body)
    }

    /// Add a function from raw code bytes (broken-fixture tests).
    pub fn raw_function(
        &mut self,
        name: &str,
        params: &[u32],
        ret: u32,
        locals: u32,
        upval_desc: u32,
        body: &[u8],
    ) -> u32 {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
        let code_offset = self.code.len() as u32;
        self.code.extend_from_slice(body);

        let param_slots: u32 = params
            .iter()
            .map(|p| self.types[*p as usize].kind.slot_count() as u32)
            .sum();
        let name_str = self.intern(name);
        let sig_id = self.add_sig(params, ret);
        let flags = if upval_desc == NO_UPVAL_DESC {
            MethodFlags::empty()
        } else {
            MethodFlags::CLOSURE_BODY
        };
        self.methods.push(MethodDef {
            name_str,
            sig_id,
            code_offset,
            locals: locals.max(param_slots),
            flags,
        });
        self.functions.push(FunctionDef {
            method_id: (self.methods.len() - 1) as u32,
            upval_desc,
            code_offset,
            code_size: body.len() as u32,
        });
        (self.functions.len() - 1) as u32
    }

    /// Signature id of a built function.
    pub fn sig_id_of(&self, func_id: u32) -> u32 {
        self.methods[self.functions[func_id as usize].method_id as usize].sig_id
    }

    /// Add an import; returns its callable id. Add imports after the
    /// last function, the callable space puts them behind the table.
    pub fn import(&mut self, module: &str, symbol: &str, params: &[u32], ret: u32) -> u32 {
        let module_str = self.intern(module);
        let symbol_str = self.intern(symbol);
        let sig_id = self.add_sig(params, ret);
        self.imports.push(ImportDef { module_str, symbol_str, sig_id, flags: ImportFlags::empty() });
        (self.functions.len() + self.imports.len() - 1) as u32
    }

    /// Export a function under (module, symbol).
    pub fn export(&mut self, module: &str, symbol: &str, func_id: u32) {
        let module_str = self.intern(module);
        let symbol_str = self.intern(symbol);
        self.exports.push(ExportDef { module_str, symbol_str, func_id, flags: 0 });
    }

    /// Attach a debug record covering `[pc_start, pc_end)` in code-section
    /// offsets.
    pub fn debug_record(&mut self, pc_start: u32, pc_end: u32, line: u32, column: u32) {
        self.debug.push(DebugRecord { pc_start, pc_end, line, column });
    }

    /// Select the entry method.
    pub fn entry(mut self, method_id: u32) -> Self {
        self.entry_method = method_id;
        self
    }

    /// Override the module stack_max (0 = header default).
    pub fn stack_max(mut self, stack_max: u32) -> Self {
        self.stack_max = stack_max;
        self
    }

    /// Entry function `main` with no parameters; locals are taken from
    /// the leading `Enter`.
    pub fn simple_entry(mut self, insns: &[Instruction]) -> Self {
        let locals = match insns.first() {
            Some(Instruction::Enter(count)) => *count as u32,
            _ => 0,
        };
        self.function("main", &[], VOID_TYPE, locals, insns);
        self
    }

    /// Entry function with an explicit locals window.
    pub fn entry_with_locals(mut self, locals: u32, insns: &[Instruction]) -> Self {
        self.function("main", &[], VOID_TYPE, locals, insns);
        self
    }

    /// Entry function from raw code bytes.
    pub fn raw_entry(mut self, body: &[u8]) -> Self {
        self.raw_function("main", &[], VOID_TYPE, 0, NO_UPVAL_DESC, body);
        self
    }

    /// Encode the module.
    pub fn build(&self) -> Vec<u8> {
        let tables = Tables {
            entry_method: self.entry_method,
            stack_max: self.stack_max,
            types: &self.types,
            fields: &self.fields,
            methods: &self.methods,
            sigs: &self.sigs,
            string_blob: &self.string_blob,
            consts: &self.consts,
            globals: &self.globals,
            functions: &self.functions,
            code: &self.code,
            imports: &self.imports,
            exports: &self.exports,
            debug: &self.debug,
        };
        encode(&tables)
    }
}

/// Re-encode a loaded module in the canonical layout. Loading a
/// [`ModuleBuilder`] image and re-emitting it is byte-identical.
pub fn emit_module(module: &Module) -> Vec<u8> {
    let stack_max =
        if module.header.stack_max == crate::consts::DEFAULT_STACK_MAX { 0 } else { module.header.stack_max };
    let tables = Tables {
        entry_method: module.header.entry_method_id,
        stack_max,
        types: &module.types,
        fields: &module.fields,
        methods: &module.methods,
        sigs: &module.sigs,
        string_blob: &module.string_blob,
        consts: &module.consts,
        globals: &module.globals,
        functions: &module.functions,
        code: &module.code,
        imports: &module.imports,
        exports: &module.exports,
        debug: &module.debug,
    };
    encode(&tables)
}

struct Tables<'a> {
    entry_method: u32,
    stack_max: u32,
    types: &'a [TypeDef],
    fields: &'a [FieldDef],
    methods: &'a [MethodDef],
    sigs: &'a [Signature],
    string_blob: &'a [u8],
    consts: &'a [ConstEntry],
    globals: &'a [GlobalDef],
    functions: &'a [FunctionDef],
    code: &'a [u8],
    imports: &'a [ImportDef],
    exports: &'a [ExportDef],
    debug: &'a [DebugRecord],
}

fn encode(tables: &Tables<'_>) -> Vec<u8> {
    // Payload bytes per present section, in id order.
    let mut sections: Vec<(SectionId, Vec<u8>, u32)> = Vec::new();

    if !tables.types.is_empty() {
        let mut w = ByteWriter::new();
        for ty in tables.types {
            w.u32(ty.kind as u8 as u32);
            w.u32(ty.size);
            w.u32(ty.field_count);
            w.u32(ty.field_start);
        }
        sections.push((SectionId::Types, w.into_bytes(), tables.types.len() as u32));
    }
    if !tables.fields.is_empty() {
        let mut w = ByteWriter::new();
        for field in tables.fields {
            w.u32(field.name_str);
            w.u32(field.type_id);
            w.u32(field.offset);
            w.u32(field.flags);
        }
        sections.push((SectionId::Fields, w.into_bytes(), tables.fields.len() as u32));
    }
    if !tables.methods.is_empty() {
        let mut w = ByteWriter::new();
        for method in tables.methods {
            w.u32(method.name_str);
            w.u32(method.sig_id);
            w.u32(method.code_offset);
            w.u32(method.locals);
            w.u32(method.flags.bits());
        }
        sections.push((SectionId::Methods, w.into_bytes(), tables.methods.len() as u32));
    }
    if !tables.sigs.is_empty() {
        let mut w = ByteWriter::new();
        for sig in tables.sigs {
            w.u32(sig.ret_type_id);
            w.u32(sig.params.len() as u32);
            for param in &sig.params {
                w.u32(*param);
            }
        }
        sections.push((SectionId::Signatures, w.into_bytes(), tables.sigs.len() as u32));
    }
    if !tables.string_blob.is_empty() || !tables.consts.is_empty() {
        let mut w = ByteWriter::new();
        w.u32(tables.string_blob.len() as u32);
        w.bytes(tables.string_blob);
        w.pad4();
        w.u32(tables.consts.len() as u32);
        for entry in tables.consts {
            match entry {
                ConstEntry::Str(offset) => {
                    w.u32(ConstTag::String as u32);
                    w.u32(*offset);
                }
                ConstEntry::I128(v) => {
                    w.u32(ConstTag::I128 as u32);
                    w.i128(*v);
                }
                ConstEntry::U128(v) => {
                    w.u32(ConstTag::U128 as u32);
                    w.u128(*v);
                }
                ConstEntry::F32(v) => {
                    w.u32(ConstTag::F32 as u32);
                    w.u32(v.to_bits());
                }
                ConstEntry::F64(v) => {
                    w.u32(ConstTag::F64 as u32);
                    w.u64(v.to_bits());
                }
                ConstEntry::UpvalDesc(kinds) => {
                    w.u32(ConstTag::UpvalDesc as u32);
                    w.u32(kinds.len() as u32);
                    for kind in kinds {
                        w.u8(*kind as u8);
                    }
                    w.pad4();
                }
                ConstEntry::JmpTable(cases) => {
                    w.u32(ConstTag::JmpTable as u32);
                    w.u32(cases.len() as u32);
                    for case in cases {
                        w.i32(*case);
                    }
                }
            }
        }
        sections.push((SectionId::ConstPool, w.into_bytes(), tables.consts.len() as u32));
    }
    if !tables.globals.is_empty() {
        let mut w = ByteWriter::new();
        for global in tables.globals {
            w.u32(global.type_id);
            w.u32(global.init_const);
        }
        sections.push((SectionId::Globals, w.into_bytes(), tables.globals.len() as u32));
    }
    {
        let mut w = ByteWriter::new();
        for func in tables.functions {
            w.u32(func.method_id);
            w.u32(func.upval_desc);
            w.u32(func.code_offset);
            w.u32(func.code_size);
        }
        sections.push((SectionId::Functions, w.into_bytes(), tables.functions.len() as u32));
    }
    {
        let mut w = ByteWriter::new();
        w.bytes(tables.code);
        w.pad4();
        sections.push((SectionId::Code, w.into_bytes(), 0));
    }
    if !tables.debug.is_empty() {
        let mut w = ByteWriter::new();
        for record in tables.debug {
            w.u32(record.pc_start);
            w.u32(record.pc_end);
            w.u32(record.line);
            w.u32(record.column);
        }
        sections.push((SectionId::Debug, w.into_bytes(), tables.debug.len() as u32));
    }
    if !tables.imports.is_empty() {
        let mut w = ByteWriter::new();
        for import in tables.imports {
            w.u32(import.module_str);
            w.u32(import.symbol_str);
            w.u32(import.sig_id);
            w.u32(import.flags.bits());
        }
        sections.push((SectionId::Imports, w.into_bytes(), tables.imports.len() as u32));
    }
    if !tables.exports.is_empty() {
        let mut w = ByteWriter::new();
        for export in tables.exports {
            w.u32(export.module_str);
            w.u32(export.symbol_str);
            w.u32(export.func_id);
            w.u32(export.flags);
        }
        sections.push((SectionId::Exports, w.into_bytes(), tables.exports.len() as u32));
    }

    let mut out = ByteWriter::new();
    out.u32(MODULE_MAGIC);
    out.u16(MODULE_VERSION);
    out.u8(0); // flags
    out.u8(1); // little-endian
    out.u32(sections.len() as u32);
    out.u32(HEADER_SIZE as u32); // section table follows the header
    out.u32(tables.entry_method);
    out.u32(tables.stack_max);
    out.u32(0);
    out.u32(0);

    let payload_base = HEADER_SIZE + sections.len() * SECTION_ENTRY_SIZE;
    let mut offset = payload_base as u32;
    for (id, payload, element_count) in &sections {
        let padded = (payload.len() as u32 + 3) / 4 * 4;
        out.u32(*id as u32);
        out.u32(offset);
        out.u32(padded);
        out.u32(*element_count);
        offset += padded;
    }
    for (_, payload, _) in &sections {
        out.bytes(payload);
        out.pad4();
    }

    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_module;

    #[test]
    fn build_load_emit_is_byte_identical() {
        let mut builder = ModuleBuilder::new();
        let t_i32 = builder.add_type(TypeKind::I32);
        let hello = builder.str_const("hello");
        builder.add_global(t_i32, None);
        let builder = builder.simple_entry(&[
            Instruction::Enter(0),
            Instruction::ConstString(hello),
            Instruction::Pop,
            Instruction::Halt,
        ]);
        let bytes = builder.build();
        let module = load_module(&bytes).expect("load");
        assert_eq!(emit_module(&module), bytes);
    }
}
