//! Binary module loader: header, section table, typed sections, and the
//! per-function code scan. Returns the first failure as a [`LoadError`];
//! a module that loads is structurally sound, though only the verifier
//! proves its code safe.

use itertools::Itertools;
use sbc_asm::{ConstTag, ImportFlags, Instruction, MethodFlags, SectionId, TypeKind};
use tracing::debug;

use crate::codec::ByteReader;
use crate::consts::{
    DEFAULT_STACK_MAX, HEADER_SIZE, MODULE_MAGIC, MODULE_VERSION, NO_INIT, NO_UPVAL_DESC,
    SECTION_ENTRY_SIZE, VOID_TYPE,
};
use crate::error::LoadError;
use crate::module::{
    ConstEntry, DebugRecord, ExportDef, FieldDef, FunctionDef, GlobalDef, ImportDef, MethodDef,
    Module, ModuleHeader, SectionEntry, Signature, TypeDef,
};

/// Parse and validate a binary SBC module.
pub fn load_module(bytes: &[u8]) -> Result<Module, LoadError> {
    let header = read_header(bytes)?;
    let sections = read_section_table(bytes, &header)?;

    let section = |id: SectionId| sections.iter().find(|s| s.id == id);
    let payload = |s: &SectionEntry| &bytes[s.offset as usize..(s.offset + s.byte_size) as usize];

    let code_section = section(SectionId::Code).ok_or(LoadError::MissingSection(SectionId::Code))?;
    let functions_section =
        section(SectionId::Functions).ok_or(LoadError::MissingSection(SectionId::Functions))?;

    let (string_blob, consts) = match section(SectionId::ConstPool) {
        Some(s) => read_const_pool(payload(s))?,
        None => (Vec::new(), Vec::new()),
    };

    let str_check = |offset: u32| -> Result<(), LoadError> {
        let rest = string_blob
            .get(offset as usize..)
            .ok_or(LoadError::BadString(offset))?;
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(LoadError::BadString(offset))?;
        core::str::from_utf8(&rest[..end]).map_err(|_| LoadError::BadString(offset))?;
        Ok(())
    };

    let types = match section(SectionId::Types) {
        Some(s) => read_types(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let mut fields = match section(SectionId::Fields) {
        Some(s) => read_fields(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let sigs = match section(SectionId::Signatures) {
        Some(s) => read_signatures(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let methods = match section(SectionId::Methods) {
        Some(s) => read_methods(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let globals = match section(SectionId::Globals) {
        Some(s) => read_globals(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let functions = read_functions(payload(functions_section), functions_section.element_count)?;
    let code = payload(code_section).to_vec();
    let imports = match section(SectionId::Imports) {
        Some(s) => read_imports(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let exports = match section(SectionId::Exports) {
        Some(s) => read_exports(payload(s), s.element_count)?,
        None => Vec::new(),
    };
    let debug = match section(SectionId::Debug) {
        Some(s) => read_debug(payload(s), s.element_count)?,
        None => Vec::new(),
    };

    check_types(&types, &fields)?;
    resolve_field_owners(&types, &mut fields)?;
    check_fields(&types, &fields, |off| str_check(off))?;
    check_signatures(&sigs, &types)?;
    check_methods(&methods, &sigs, &types, code.len(), |off| str_check(off))?;
    check_consts(&string_blob, &consts)?;
    check_globals(&globals, &types, &consts)?;
    check_functions(&functions, &methods, &consts, code.len())?;
    check_imports(&imports, &sigs, &string_blob, |off| str_check(off))?;
    check_exports(&exports, &functions, |off| str_check(off))?;
    check_debug(&debug, &functions)?;

    let insn_starts = scan_code(&functions, &code)?;

    let module = Module {
        header,
        sections,
        types,
        fields,
        methods,
        sigs,
        string_blob,
        consts,
        globals,
        functions,
        code,
        imports,
        exports,
        debug,
        insn_starts,
    };

    if module.entry_function().is_none() {
        return Err(LoadError::BadEntry(module.header.entry_method_id));
    }

    debug!(
        functions = module.functions.len(),
        imports = module.imports.len(),
        consts = module.consts.len(),
        stack_max = module.header.stack_max,
        "module loaded"
    );

    Ok(module)
}

fn read_header(bytes: &[u8]) -> Result<ModuleHeader, LoadError> {
    let mut r = ByteReader::new(bytes);
    if bytes.len() < HEADER_SIZE {
        return Err(LoadError::Truncated { what: "header", offset: bytes.len() });
    }

    let magic = r.read_u32("magic")?;
    if magic != MODULE_MAGIC {
        return Err(LoadError::BadMagic(magic));
    }
    let version = r.read_u16("version")?;
    if version != MODULE_VERSION {
        return Err(LoadError::BadVersion(version));
    }
    let flags = r.read_u8("flags")?;
    if flags != 0 {
        return Err(LoadError::BadFlags(flags));
    }
    let endian = r.read_u8("endian")?;
    if endian != 1 {
        return Err(LoadError::BadEndian(endian));
    }
    let section_count = r.read_u32("section_count")?;
    if section_count == 0 {
        return Err(LoadError::BadRecord {
            table: "header",
            id: 0,
            what: "section_count must be at least 1",
        });
    }
    let section_table_offset = r.read_u32("section_table_offset")?;
    let entry_method_id = r.read_u32("entry_method_id")?;
    let mut stack_max = r.read_u32("stack_max")?;
    if stack_max == 0 {
        stack_max = DEFAULT_STACK_MAX;
    }
    for what in ["reserved0", "reserved1"] {
        if r.read_u32(what)? != 0 {
            return Err(LoadError::BadRecord { table: "header", id: 0, what: "reserved word" });
        }
    }

    Ok(ModuleHeader {
        magic,
        version,
        flags,
        endian,
        section_count,
        section_table_offset,
        entry_method_id,
        stack_max,
    })
}

fn read_section_table(bytes: &[u8], header: &ModuleHeader) -> Result<Vec<SectionEntry>, LoadError> {
    let table_offset = header.section_table_offset as usize;
    if table_offset % 4 != 0 {
        return Err(LoadError::Misaligned { what: "section table", offset: table_offset });
    }
    let table_size = header.section_count as usize * SECTION_ENTRY_SIZE;
    if table_offset.checked_add(table_size).filter(|end| *end <= bytes.len()).is_none() {
        return Err(LoadError::Truncated { what: "section table", offset: table_offset });
    }

    let mut r = ByteReader::at(bytes, table_offset, "section table")?;
    let mut sections = Vec::with_capacity(header.section_count as usize);
    for _ in 0..header.section_count {
        let raw_id = r.read_u32("section id")?;
        let id = SectionId::from_u32(raw_id).ok_or(LoadError::UnknownSection(raw_id))?;
        let offset = r.read_u32("section offset")?;
        let byte_size = r.read_u32("section size")?;
        let element_count = r.read_u32("section count")?;

        if offset % 4 != 0 || byte_size % 4 != 0 {
            return Err(LoadError::Misaligned { what: "section payload", offset: offset as usize });
        }
        if (offset as usize)
            .checked_add(byte_size as usize)
            .filter(|end| *end <= bytes.len())
            .is_none()
        {
            return Err(LoadError::Truncated { what: "section payload", offset: offset as usize });
        }
        sections.push(SectionEntry { id, offset, byte_size, element_count });
    }

    if let Some(dup) = sections.iter().map(|s| s.id).duplicates().next() {
        return Err(LoadError::DuplicateSection(dup));
    }

    // Overlap check over non-empty payloads, sorted by offset.
    let sorted: Vec<_> = sections
        .iter()
        .filter(|s| s.byte_size > 0)
        .sorted_by_key(|s| s.offset)
        .collect();
    for (a, b) in sorted.iter().tuple_windows() {
        if a.offset + a.byte_size > b.offset {
            return Err(LoadError::SectionOverlap(a.id, b.id));
        }
    }

    Ok(sections)
}

fn read_const_pool(payload: &[u8]) -> Result<(Vec<u8>, Vec<ConstEntry>), LoadError> {
    let mut r = ByteReader::new(payload);
    let blob_len = r.read_u32("string blob length")? as usize;
    let blob = r.take(blob_len, "string blob")?.to_vec();
    // Blob is padded so the entry stream stays aligned.
    let pad = (4 - blob_len % 4) % 4;
    r.take(pad, "string blob padding")?;

    let count = r.read_u32("const count")?;
    let mut consts = Vec::with_capacity(count as usize);
    for id in 0..count {
        let tag_word = r.read_u32("const tag")?;
        let tag = ConstTag::from_u32(tag_word).ok_or(LoadError::BadConstTag { id, tag: tag_word })?;
        let entry = match tag {
            ConstTag::String => ConstEntry::Str(r.read_u32("string const")?),
            ConstTag::I128 => ConstEntry::I128(r.read_i128("i128 const")?),
            ConstTag::U128 => ConstEntry::U128(r.read_u128("u128 const")?),
            ConstTag::F32 => ConstEntry::F32(r.read_f32("f32 const")?),
            ConstTag::F64 => ConstEntry::F64(r.read_f64("f64 const")?),
            ConstTag::UpvalDesc => {
                let n = r.read_u32("upval count")?;
                let kind_bytes = r.take(n as usize, "upval kinds")?;
                let kinds = kind_bytes
                    .iter()
                    .map(|b| {
                        TypeKind::from_u8(*b)
                            .ok_or(LoadError::BadConst { id, what: "invalid upvalue kind" })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let pad = (4 - n as usize % 4) % 4;
                r.take(pad, "upval padding")?;
                ConstEntry::UpvalDesc(kinds)
            }
            ConstTag::JmpTable => {
                let n = r.read_u32("jump table count")?;
                let mut cases = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    cases.push(r.read_i32("jump table case")?);
                }
                ConstEntry::JmpTable(cases)
            }
        };
        consts.push(entry);
    }

    Ok((blob, consts))
}

fn check_consts(blob: &[u8], consts: &[ConstEntry]) -> Result<(), LoadError> {
    for (id, entry) in consts.iter().enumerate() {
        if let ConstEntry::Str(offset) = entry {
            let rest = blob
                .get(*offset as usize..)
                .ok_or(LoadError::BadString(*offset))?;
            let end = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or(LoadError::BadString(*offset))?;
            if core::str::from_utf8(&rest[..end]).is_err() {
                return Err(LoadError::BadString(*offset));
            }
        }
        if let ConstEntry::UpvalDesc(kinds) = entry {
            if kinds.len() > u8::MAX as usize {
                return Err(LoadError::BadConst { id: id as u32, what: "too many upvalues" });
            }
        }
    }
    Ok(())
}

fn read_types(payload: &[u8], count: u32) -> Result<Vec<TypeDef>, LoadError> {
    expect_table_size(payload, count, 16, "types")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|id| {
            let kind_word = r.read_u32("type kind")?;
            let kind = u8::try_from(kind_word)
                .ok()
                .and_then(TypeKind::from_u8)
                .ok_or(LoadError::BadRecord { table: "types", id, what: "unknown kind" })?;
            Ok(TypeDef {
                kind,
                size: r.read_u32("type size")?,
                field_count: r.read_u32("type field_count")?,
                field_start: r.read_u32("type field_start")?,
            })
        })
        .collect()
}

fn check_types(types: &[TypeDef], fields: &[FieldDef]) -> Result<(), LoadError> {
    for (id, ty) in types.iter().enumerate() {
        let id = id as u32;
        if ty.is_object() {
            // Structured object type: referenced by handle, sized payload.
            if ty.kind != TypeKind::Ref {
                return Err(LoadError::BadRecord {
                    table: "types",
                    id,
                    what: "object types must have Ref kind",
                });
            }
            if ty.size == 0 {
                return Err(LoadError::BadRecord { table: "types", id, what: "object size zero" });
            }
            let end = ty.field_start.checked_add(ty.field_count);
            if end.filter(|end| *end as usize <= fields.len()).is_none() {
                return Err(LoadError::BadIndex {
                    table: "types",
                    id,
                    field: "field_start",
                    value: ty.field_start,
                });
            }
        } else {
            if ty.size != ty.kind.size() {
                return Err(LoadError::BadRecord {
                    table: "types",
                    id,
                    what: "primitive size differs from natural size",
                });
            }
            if ty.field_start != 0 {
                return Err(LoadError::BadRecord {
                    table: "types",
                    id,
                    what: "primitive field_start must be zero",
                });
            }
        }
    }
    Ok(())
}

fn resolve_field_owners(types: &[TypeDef], fields: &mut [FieldDef]) -> Result<(), LoadError> {
    let mut owner = vec![u32::MAX; fields.len()];
    for (type_id, ty) in types.iter().enumerate() {
        for field_id in ty.field_start..ty.field_start + ty.field_count {
            let slot = &mut owner[field_id as usize];
            if *slot != u32::MAX {
                return Err(LoadError::BadRecord {
                    table: "fields",
                    id: field_id,
                    what: "field owned by two types",
                });
            }
            *slot = type_id as u32;
        }
    }
    for (field_id, owner) in owner.into_iter().enumerate() {
        if owner == u32::MAX {
            return Err(LoadError::BadRecord {
                table: "fields",
                id: field_id as u32,
                what: "field not owned by any type",
            });
        }
        fields[field_id].owner = owner;
    }
    Ok(())
}

fn read_fields(payload: &[u8], count: u32) -> Result<Vec<FieldDef>, LoadError> {
    expect_table_size(payload, count, 16, "fields")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|_| {
            Ok(FieldDef {
                name_str: r.read_u32("field name")?,
                type_id: r.read_u32("field type")?,
                offset: r.read_u32("field offset")?,
                flags: r.read_u32("field flags")?,
                owner: u32::MAX,
            })
        })
        .collect()
}

fn check_fields(
    types: &[TypeDef],
    fields: &[FieldDef],
    str_check: impl Fn(u32) -> Result<(), LoadError>,
) -> Result<(), LoadError> {
    for (id, field) in fields.iter().enumerate() {
        let id = id as u32;
        str_check(field.name_str)?;
        if field.flags != 0 {
            return Err(LoadError::BadRecord { table: "fields", id, what: "nonzero flags" });
        }
        let ty = types.get(field.type_id as usize).ok_or(LoadError::BadIndex {
            table: "fields",
            id,
            field: "type_id",
            value: field.type_id,
        })?;
        let storage = ty.kind.storage_size();
        let align = storage.min(8);
        if field.offset % align != 0 {
            return Err(LoadError::BadRecord { table: "fields", id, what: "misaligned offset" });
        }
        let parent = &types[field.owner as usize];
        if field.offset.checked_add(storage).filter(|end| *end <= parent.size).is_none() {
            return Err(LoadError::BadRecord {
                table: "fields",
                id,
                what: "field extends past parent size",
            });
        }
    }
    Ok(())
}

fn read_signatures(payload: &[u8], count: u32) -> Result<Vec<Signature>, LoadError> {
    let mut r = ByteReader::new(payload);
    let sigs = (0..count)
        .map(|_| {
            let ret_type_id = r.read_u32("signature return type")?;
            let param_count = r.read_u32("signature param count")?;
            let params = (0..param_count)
                .map(|_| r.read_u32("signature param type"))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Signature { ret_type_id, params })
        })
        .collect::<Result<Vec<_>, LoadError>>()?;
    if r.remaining() != 0 {
        return Err(LoadError::BadRecord {
            table: "signatures",
            id: count,
            what: "trailing bytes after last record",
        });
    }
    Ok(sigs)
}

fn check_signatures(sigs: &[Signature], types: &[TypeDef]) -> Result<(), LoadError> {
    for (id, sig) in sigs.iter().enumerate() {
        let id = id as u32;
        if sig.ret_type_id != VOID_TYPE && types.get(sig.ret_type_id as usize).is_none() {
            return Err(LoadError::BadIndex {
                table: "signatures",
                id,
                field: "ret_type_id",
                value: sig.ret_type_id,
            });
        }
        for param in &sig.params {
            if types.get(*param as usize).is_none() {
                return Err(LoadError::BadIndex {
                    table: "signatures",
                    id,
                    field: "param_type",
                    value: *param,
                });
            }
        }
    }
    Ok(())
}

fn read_methods(payload: &[u8], count: u32) -> Result<Vec<MethodDef>, LoadError> {
    expect_table_size(payload, count, 20, "methods")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|id| {
            let name_str = r.read_u32("method name")?;
            let sig_id = r.read_u32("method signature")?;
            let code_offset = r.read_u32("method code offset")?;
            let locals = r.read_u32("method locals")?;
            let flags_word = r.read_u32("method flags")?;
            let flags = MethodFlags::from_bits(flags_word).ok_or(LoadError::BadRecord {
                table: "methods",
                id,
                what: "unknown flag bits",
            })?;
            Ok(MethodDef { name_str, sig_id, code_offset, locals, flags })
        })
        .collect()
}

fn check_methods(
    methods: &[MethodDef],
    sigs: &[Signature],
    types: &[TypeDef],
    code_len: usize,
    str_check: impl Fn(u32) -> Result<(), LoadError>,
) -> Result<(), LoadError> {
    for (id, method) in methods.iter().enumerate() {
        let id = id as u32;
        str_check(method.name_str)?;
        let sig = sigs.get(method.sig_id as usize).ok_or(LoadError::BadIndex {
            table: "methods",
            id,
            field: "sig_id",
            value: method.sig_id,
        })?;
        if (method.code_offset as usize) >= code_len {
            return Err(LoadError::BadIndex {
                table: "methods",
                id,
                field: "code_offset",
                value: method.code_offset,
            });
        }
        let param_slots: u32 = sig
            .params
            .iter()
            .map(|p| types[*p as usize].kind.slot_count() as u32)
            .sum();
        if method.locals < param_slots {
            return Err(LoadError::BadRecord {
                table: "methods",
                id,
                what: "locals window smaller than parameters",
            });
        }
    }
    Ok(())
}

fn read_globals(payload: &[u8], count: u32) -> Result<Vec<GlobalDef>, LoadError> {
    expect_table_size(payload, count, 8, "globals")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|_| {
            Ok(GlobalDef {
                type_id: r.read_u32("global type")?,
                init_const: r.read_u32("global init")?,
            })
        })
        .collect()
}

fn check_globals(
    globals: &[GlobalDef],
    types: &[TypeDef],
    consts: &[ConstEntry],
) -> Result<(), LoadError> {
    for (id, global) in globals.iter().enumerate() {
        let id = id as u32;
        let ty = types.get(global.type_id as usize).ok_or(LoadError::BadIndex {
            table: "globals",
            id,
            field: "type_id",
            value: global.type_id,
        })?;
        if global.init_const == NO_INIT {
            continue;
        }
        let entry = consts.get(global.init_const as usize).ok_or(LoadError::BadIndex {
            table: "globals",
            id,
            field: "init_const",
            value: global.init_const,
        })?;
        let compatible = match (ty.kind, entry) {
            (TypeKind::F32, ConstEntry::F32(_)) => true,
            (TypeKind::F64, ConstEntry::F64(_)) => true,
            (TypeKind::I128, ConstEntry::I128(_)) => true,
            (TypeKind::U128, ConstEntry::U128(_)) => true,
            (TypeKind::Ref, ConstEntry::Str(_)) => true,
            (kind, ConstEntry::I128(v)) if kind.is_integer() || kind == TypeKind::Bool || kind == TypeKind::Char => {
                int_fits(kind, *v)
            }
            (kind, ConstEntry::U128(v)) if kind.is_integer() || kind == TypeKind::Bool || kind == TypeKind::Char => {
                i128::try_from(*v).map(|v| int_fits(kind, v)).unwrap_or(false)
            }
            _ => false,
        };
        if !compatible {
            return Err(LoadError::BadRecord {
                table: "globals",
                id,
                what: "init constant incompatible with declared type",
            });
        }
    }
    Ok(())
}

fn int_fits(kind: TypeKind, v: i128) -> bool {
    use TypeKind::*;
    match kind {
        I8 => i8::try_from(v).is_ok(),
        I16 => i16::try_from(v).is_ok(),
        I32 => i32::try_from(v).is_ok(),
        I64 => i64::try_from(v).is_ok(),
        U8 => u8::try_from(v).is_ok(),
        U16 | Char => u16::try_from(v).is_ok(),
        U32 => u32::try_from(v).is_ok(),
        U64 => u64::try_from(v).is_ok(),
        Bool => v == 0 || v == 1,
        I128 => true,
        _ => false,
    }
}

fn read_functions(payload: &[u8], count: u32) -> Result<Vec<FunctionDef>, LoadError> {
    expect_table_size(payload, count, 16, "functions")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|_| {
            Ok(FunctionDef {
                method_id: r.read_u32("function method")?,
                upval_desc: r.read_u32("function upval desc")?,
                code_offset: r.read_u32("function code offset")?,
                code_size: r.read_u32("function code size")?,
            })
        })
        .collect()
}

fn check_functions(
    functions: &[FunctionDef],
    methods: &[MethodDef],
    consts: &[ConstEntry],
    code_len: usize,
) -> Result<(), LoadError> {
    for (id, func) in functions.iter().enumerate() {
        let id = id as u32;
        let method = methods.get(func.method_id as usize).ok_or(LoadError::BadIndex {
            table: "functions",
            id,
            field: "method_id",
            value: func.method_id,
        })?;
        if func.code_size == 0 {
            return Err(LoadError::BadRecord { table: "functions", id, what: "empty code range" });
        }
        if func.code_offset % 4 != 0 {
            return Err(LoadError::Misaligned {
                what: "function code",
                offset: func.code_offset as usize,
            });
        }
        if (func.code_offset as usize)
            .checked_add(func.code_size as usize)
            .filter(|end| *end <= code_len)
            .is_none()
        {
            return Err(LoadError::BadIndex {
                table: "functions",
                id,
                field: "code_size",
                value: func.code_size,
            });
        }
        if method.code_offset != func.code_offset {
            return Err(LoadError::BadRecord {
                table: "functions",
                id,
                what: "method and function disagree on code offset",
            });
        }
        if func.upval_desc != NO_UPVAL_DESC {
            match consts.get(func.upval_desc as usize) {
                Some(ConstEntry::UpvalDesc(_)) => {}
                Some(_) => {
                    return Err(LoadError::BadRecord {
                        table: "functions",
                        id,
                        what: "upval_desc const is not an UpvalDesc",
                    })
                }
                None => {
                    return Err(LoadError::BadIndex {
                        table: "functions",
                        id,
                        field: "upval_desc",
                        value: func.upval_desc,
                    })
                }
            }
        }
    }

    // Ranges must be pairwise disjoint.
    let sorted: Vec<(u32, &FunctionDef)> = functions
        .iter()
        .enumerate()
        .map(|(id, f)| (id as u32, f))
        .sorted_by_key(|(_, f)| f.code_offset)
        .collect();
    for ((a_id, a), (b_id, b)) in sorted.iter().tuple_windows() {
        if a.code_offset + a.code_size > b.code_offset {
            return Err(LoadError::FunctionOverlap(*a_id, *b_id));
        }
    }

    Ok(())
}

fn read_imports(payload: &[u8], count: u32) -> Result<Vec<ImportDef>, LoadError> {
    expect_table_size(payload, count, 16, "imports")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|id| {
            let module_str = r.read_u32("import module")?;
            let symbol_str = r.read_u32("import symbol")?;
            let sig_id = r.read_u32("import signature")?;
            let flags_word = r.read_u32("import flags")?;
            let flags = ImportFlags::from_bits(flags_word).ok_or(LoadError::BadRecord {
                table: "imports",
                id,
                what: "unknown flag bits",
            })?;
            Ok(ImportDef { module_str, symbol_str, sig_id, flags })
        })
        .collect()
}

fn check_imports(
    imports: &[ImportDef],
    sigs: &[Signature],
    blob: &[u8],
    str_check: impl Fn(u32) -> Result<(), LoadError>,
) -> Result<(), LoadError> {
    let str_at = |offset: u32| {
        let rest = &blob[offset as usize..];
        let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
        core::str::from_utf8(&rest[..end]).unwrap_or("")
    };
    for (id, import) in imports.iter().enumerate() {
        let id = id as u32;
        str_check(import.module_str)?;
        str_check(import.symbol_str)?;
        if sigs.get(import.sig_id as usize).is_none() {
            return Err(LoadError::BadIndex {
                table: "imports",
                id,
                field: "sig_id",
                value: import.sig_id,
            });
        }
    }
    if let Some(dup) = imports
        .iter()
        .map(|i| (str_at(i.module_str), str_at(i.symbol_str)))
        .duplicates()
        .next()
    {
        return Err(LoadError::DuplicateImport {
            module: dup.0.to_owned(),
            symbol: dup.1.to_owned(),
        });
    }
    Ok(())
}

fn read_exports(payload: &[u8], count: u32) -> Result<Vec<ExportDef>, LoadError> {
    expect_table_size(payload, count, 16, "exports")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|_| {
            Ok(ExportDef {
                module_str: r.read_u32("export module")?,
                symbol_str: r.read_u32("export symbol")?,
                func_id: r.read_u32("export function")?,
                flags: r.read_u32("export flags")?,
            })
        })
        .collect()
}

fn check_exports(
    exports: &[ExportDef],
    functions: &[FunctionDef],
    str_check: impl Fn(u32) -> Result<(), LoadError>,
) -> Result<(), LoadError> {
    for (id, export) in exports.iter().enumerate() {
        let id = id as u32;
        str_check(export.module_str)?;
        str_check(export.symbol_str)?;
        if export.flags & !1 != 0 {
            return Err(LoadError::BadRecord { table: "exports", id, what: "unknown flag bits" });
        }
        if functions.get(export.func_id as usize).is_none() {
            return Err(LoadError::BadIndex {
                table: "exports",
                id,
                field: "func_id",
                value: export.func_id,
            });
        }
    }
    Ok(())
}

fn read_debug(payload: &[u8], count: u32) -> Result<Vec<DebugRecord>, LoadError> {
    expect_table_size(payload, count, 16, "debug")?;
    let mut r = ByteReader::new(payload);
    (0..count)
        .map(|_| {
            Ok(DebugRecord {
                pc_start: r.read_u32("debug pc_start")?,
                pc_end: r.read_u32("debug pc_end")?,
                line: r.read_u32("debug line")?,
                column: r.read_u32("debug column")?,
            })
        })
        .collect()
}

fn check_debug(debug: &[DebugRecord], functions: &[FunctionDef]) -> Result<(), LoadError> {
    for (id, record) in debug.iter().enumerate() {
        let id = id as u32;
        if record.pc_start >= record.pc_end {
            return Err(LoadError::BadRecord { table: "debug", id, what: "empty pc range" });
        }
        let covered = functions.iter().any(|f| {
            record.pc_start >= f.code_offset
                && record.pc_end <= f.code_offset + f.code_size
        });
        if !covered {
            return Err(LoadError::BadRecord {
                table: "debug",
                id,
                what: "pc range outside every function",
            });
        }
    }
    Ok(())
}

/// Decode every function body once, rejecting unknown opcodes and operands
/// that spill past the function. Returns per-function instruction starts.
fn scan_code(functions: &[FunctionDef], code: &[u8]) -> Result<Vec<Vec<u32>>, LoadError> {
    functions
        .iter()
        .enumerate()
        .map(|(func, f)| {
            let body =
                &code[f.code_offset as usize..(f.code_offset + f.code_size) as usize];
            let mut starts = Vec::new();
            let mut pc = 0usize;
            while pc < body.len() {
                starts.push(pc as u32);
                let (_, next) = Instruction::decode(body, pc)
                    .map_err(|source| LoadError::Code { func: func as u32, source })?;
                pc = next;
            }
            Ok(starts)
        })
        .collect()
}

fn expect_table_size(
    payload: &[u8],
    count: u32,
    record_size: usize,
    table: &'static str,
) -> Result<(), LoadError> {
    let expected = count as usize * record_size;
    if payload.len() != expected {
        return Err(LoadError::BadRecord {
            table,
            id: count,
            what: "section size disagrees with element count",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ModuleBuilder;

    #[test]
    fn minimal_module_loads() {
        let bytes = ModuleBuilder::new()
            .simple_entry(&[Instruction::Enter(0), Instruction::Halt])
            .build();
        let module = load_module(&bytes).expect("load");
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.entry_function(), Some(0));
        assert_eq!(module.insn_starts[0], vec![0, 3]);
    }

    #[test]
    fn truncated_header_rejects() {
        assert!(matches!(
            load_module(&[0x53, 0x42, 0x43]),
            Err(LoadError::Truncated { what: "header", .. })
        ));
    }

    #[test]
    fn bad_magic_rejects() {
        let mut bytes = ModuleBuilder::new()
            .simple_entry(&[Instruction::Enter(0), Instruction::Halt])
            .build();
        bytes[0] = b'X';
        assert!(matches!(load_module(&bytes), Err(LoadError::BadMagic(_))));
    }

    #[test]
    fn unknown_opcode_fails_scan() {
        let bytes = ModuleBuilder::new().raw_entry(&[0xff, 0, 0, 0]).build();
        match load_module(&bytes) {
            Err(LoadError::Code { func: 0, source }) => {
                assert!(source.to_string().contains("unknown opcode"))
            }
            other => panic!("expected code scan failure, got {other:?}"),
        }
    }
}
