//! Reflection calls into exported C functions through libffi.
//!
//! The call signature comes from the function record: the receiver handle
//! first for instance functions, scalars and structs by value, strings as
//! `const char*`, out and in-out parameters as pointers to their storage.

use super::NativeReflection;
use crate::error::HostError;
use crate::library::NativeLibrary;
use crate::marshal::{Frame, read_value, write_value};
use crate::value::Value;
use libffi::middle::{Arg, Builder, Cif, CodePtr, Type, arg};
use sharpbind_core::FunctionId;
use sharpbind_core::layout::{NativeCategory, NativeRepr, native_repr};
use sharpbind_core::model::{FunctionRecord, ParamDirection, TypeDefinitionDocument, TypeRef};
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::Arc;
use tracing::trace;

pub struct SymbolReflection {
    document: Arc<TypeDefinitionDocument>,
    library: Option<NativeLibrary>,
    symbols: HashMap<FunctionId, String>,
}

enum Param {
    ByValue(NativeRepr),
    CString,
    Pointer(NativeRepr),
}

enum Return {
    Void,
    Scalar(NativeRepr),
    CString,
}

fn ffi_type(repr: &NativeRepr) -> Type {
    match &repr.category {
        NativeCategory::Bool => Type::u8(),
        NativeCategory::Integer { signed } | NativeCategory::Enum { signed, .. } => {
            match (repr.size, *signed) {
                (1, true) => Type::i8(),
                (2, true) => Type::i16(),
                (4, true) => Type::i32(),
                (8, true) => Type::i64(),
                (1, false) => Type::u8(),
                (2, false) => Type::u16(),
                (4, false) => Type::u32(),
                _ => Type::u64(),
            }
        }
        NativeCategory::Float if repr.size == 4 => Type::f32(),
        NativeCategory::Float => Type::f64(),
        NativeCategory::ObjectHandle => Type::pointer(),
        NativeCategory::Name => Type::structure(vec![Type::u32(), Type::u32()]),
        NativeCategory::Aggregate { fields, .. } => {
            Type::structure(fields.iter().map(|f| ffi_type(&f.repr)).collect::<Vec<_>>())
        }
    }
}

fn pointer_frame(address: usize) -> Frame {
    let mut frame = Frame::new(size_of::<usize>());
    frame.bytes_mut().copy_from_slice(&address.to_ne_bytes());
    frame
}

impl SymbolReflection {
    /// Resolve symbols among those already loaded into the process.
    pub fn process(document: Arc<TypeDefinitionDocument>) -> Self {
        Self {
            document,
            library: None,
            symbols: HashMap::new(),
        }
    }

    pub fn with_library(document: Arc<TypeDefinitionDocument>, library: NativeLibrary) -> Self {
        Self {
            library: Some(library),
            ..Self::process(document)
        }
    }

    /// Export `id` under `symbol` instead of `<NativeType>_<Function>`.
    pub fn bind(&mut self, id: FunctionId, symbol: impl Into<String>) -> &mut Self {
        self.symbols.insert(id, symbol.into());
        self
    }

    fn function(&self, id: &FunctionId) -> Option<(String, &FunctionRecord)> {
        let owner = self.document.find_type(&id.type_name)?;
        let function = owner.function(&id.function_name)?;
        let symbol = self
            .symbols
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("{}_{}", owner.native_name(), function.name));
        Some((symbol, function))
    }

    fn address(&self, symbol: &str) -> Option<*const c_void> {
        if let Some(library) = &self.library {
            return library.address(symbol);
        }
        #[cfg(unix)]
        {
            let name = CString::new(symbol).ok()?;
            // SAFETY: dlsym only reads the NUL-terminated name.
            let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
            (!ptr.is_null()).then_some(ptr as *const c_void)
        }
        #[cfg(windows)]
        {
            NativeLibrary::this_process().ok()?.address(symbol)
        }
    }

    fn signature(&self, id: &FunctionId, function: &FunctionRecord) -> Result<(Vec<Param>, Return), HostError> {
        let unsupported = |what: String| {
            HostError::marshal(format!("{id}: {what} cannot cross a symbol reflection call"))
        };
        let mut params = Vec::with_capacity(function.params.len() + 1);
        if !function.is_static() {
            params.push(Param::ByValue(handle_repr()));
        }
        for param in &function.params {
            let by_ref = param.direction.writes_back();
            let text = matches!(param.ty, TypeRef::String | TypeRef::Text);
            params.push(match (text, by_ref) {
                (true, false) => Param::CString,
                (true, true) => return Err(unsupported(format!("out string '{}'", param.name))),
                (false, _) => {
                    let repr = native_repr(&param.ty, &self.document)
                        .map_err(|e| unsupported(format!("'{}' ({e})", param.name)))?;
                    if by_ref { Param::Pointer(repr) } else { Param::ByValue(repr) }
                }
            });
        }
        let ret = match &function.return_type {
            None => Return::Void,
            Some(TypeRef::String | TypeRef::Text) => Return::CString,
            Some(ty) => {
                let repr = native_repr(ty, &self.document).map_err(|e| unsupported(format!("return ({e})")))?;
                if matches!(repr.category, NativeCategory::Name | NativeCategory::Aggregate { .. }) {
                    return Err(unsupported(format!("struct return {}", repr.native_type)));
                }
                Return::Scalar(repr)
            }
        };
        Ok((params, ret))
    }
}

fn handle_repr() -> NativeRepr {
    NativeRepr {
        category: NativeCategory::ObjectHandle,
        size: size_of::<usize>(),
        align: size_of::<usize>(),
        native_type: "void*".into(),
    }
}

impl NativeReflection for SymbolReflection {
    fn contains(&self, id: &FunctionId) -> bool {
        self.function(id)
            .is_some_and(|(symbol, _)| self.address(&symbol).is_some())
    }

    fn call(&self, id: &FunctionId, args: &mut [Value]) -> Result<Value, HostError> {
        let (symbol, function) = self
            .function(id)
            .ok_or_else(|| HostError::UnknownFunction(id.to_string()))?;
        let (params, ret) = self.signature(id, function)?;
        let address = self
            .address(&symbol)
            .ok_or_else(|| HostError::UnknownFunction(format!("{id} (symbol {symbol})")))?;
        if args.len() != params.len() {
            return Err(HostError::marshal(format!(
                "{id} expects {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }

        // Storage stays alive and in place until the call returns.
        let mut storage: Vec<Frame> = Vec::with_capacity(params.len());
        let mut outputs: Vec<(usize, Frame)> = Vec::new();
        let mut strings: Vec<CString> = Vec::new();
        let mut types = Vec::with_capacity(params.len());

        for (i, (param, value)) in params.iter().zip(args.iter()).enumerate() {
            match param {
                Param::ByValue(repr) => {
                    let mut frame = Frame::new(repr.size);
                    write_value(frame.bytes_mut(), 0, repr, value)?;
                    storage.push(frame);
                    types.push(ffi_type(repr));
                }
                Param::CString => {
                    let text = value
                        .as_str()
                        .ok_or_else(|| HostError::marshal(format!("argument {i} must be a string")))?;
                    let c = CString::new(text).map_err(|_| HostError::marshal("string contains a NUL byte"))?;
                    storage.push(pointer_frame(c.as_ptr() as usize));
                    strings.push(c);
                    types.push(Type::pointer());
                }
                Param::Pointer(repr) => {
                    let mut out = Frame::new(repr.size);
                    if !matches!(value, Value::Void) {
                        write_value(out.bytes_mut(), 0, repr, value)?;
                    }
                    storage.push(pointer_frame(out.as_mut_ptr() as usize));
                    outputs.push((i, out));
                    types.push(Type::pointer());
                }
            }
        }

        let result_type = match &ret {
            Return::Void => Type::void(),
            Return::Scalar(repr) => ffi_type(repr),
            Return::CString => Type::pointer(),
        };
        let cif = Builder::new().args(types).res(result_type).into_cif();
        let code = CodePtr::from_ptr(address);
        let ffi_args: Vec<Arg> = storage.iter().map(|frame| arg(&frame.bytes()[0])).collect();

        trace!(function = %id, %symbol, "symbol reflection call");
        // SAFETY: the CIF was built from the function record the symbol was
        // exported for, and every argument points at live storage.
        let result = unsafe { call(&cif, code, &ffi_args, &ret) }?;
        drop(ffi_args);

        for (i, out) in outputs {
            let Param::Pointer(repr) = &params[i] else { continue };
            args[i] = read_value(out.bytes(), 0, repr)?;
        }
        Ok(result)
    }
}

unsafe fn call(cif: &Cif, code: CodePtr, args: &[Arg], ret: &Return) -> Result<Value, HostError> {
    let repr = match ret {
        Return::Void => {
            let _: () = unsafe { cif.call(code, args) };
            return Ok(Value::Void);
        }
        Return::CString => {
            let ptr: *const c_char = unsafe { cif.call(code, args) };
            if ptr.is_null() {
                return Ok(Value::String(String::new()));
            }
            let text = unsafe { CStr::from_ptr(ptr) };
            return Ok(Value::String(text.to_string_lossy().into_owned()));
        }
        Return::Scalar(repr) => repr,
    };
    let value = match &repr.category {
        NativeCategory::Bool => Value::Bool(unsafe { cif.call::<u8>(code, args) } != 0),
        NativeCategory::Float if repr.size == 4 => Value::F32(unsafe { cif.call(code, args) }),
        NativeCategory::Float => Value::F64(unsafe { cif.call(code, args) }),
        NativeCategory::ObjectHandle => {
            let ptr: *const c_void = unsafe { cif.call(code, args) };
            Value::Handle(ptr as usize)
        }
        NativeCategory::Integer { signed } | NativeCategory::Enum { signed, .. } => {
            let raw = match (repr.size, *signed) {
                (1, true) => Value::I8(unsafe { cif.call(code, args) }),
                (2, true) => Value::I16(unsafe { cif.call(code, args) }),
                (4, true) => Value::I32(unsafe { cif.call(code, args) }),
                (8, true) => Value::I64(unsafe { cif.call(code, args) }),
                (1, false) => Value::U8(unsafe { cif.call(code, args) }),
                (2, false) => Value::U16(unsafe { cif.call(code, args) }),
                (4, false) => Value::U32(unsafe { cif.call(code, args) }),
                _ => Value::U64(unsafe { cif.call(code, args) }),
            };
            if matches!(repr.category, NativeCategory::Enum { .. }) {
                Value::Enum(raw.as_integer().unwrap_or_default() as i64)
            } else {
                raw
            }
        }
        NativeCategory::Name | NativeCategory::Aggregate { .. } => {
            return Err(HostError::marshal("struct returns are not supported"));
        }
    };
    Ok(value)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use sharpbind_core::model::{DocumentAttributes, FunctionFlags, ParamRecord, TypeKind, TypeRecord};

    fn param(name: &str, ty: TypeRef, direction: ParamDirection) -> ParamRecord {
        ParamRecord {
            name: name.into(),
            ty,
            direction,
        }
    }

    fn function(name: &str, params: Vec<ParamRecord>, ret: TypeRef) -> FunctionRecord {
        FunctionRecord {
            name: name.into(),
            params,
            return_type: Some(ret),
            flags: FunctionFlags::NATIVE_CALLABLE | FunctionFlags::STATIC,
        }
    }

    fn libc_reflection() -> SymbolReflection {
        let mut ty = TypeRecord::new("CRuntime", "Libc", TypeKind::Class);
        ty.functions = vec![
            function("abs", vec![param("Value", TypeRef::Int32, ParamDirection::In)], TypeRef::Int32),
            function("strlen", vec![param("Text", TypeRef::String, ParamDirection::In)], TypeRef::UInt64),
            function(
                "strtol",
                vec![
                    param("Text", TypeRef::String, ParamDirection::In),
                    param("End", TypeRef::object("CRuntime"), ParamDirection::Out),
                    param("Base", TypeRef::Int32, ParamDirection::In),
                ],
                TypeRef::Int64,
            ),
            function("tally", vec![param("Items", TypeRef::array(TypeRef::Int32), ParamDirection::In)], TypeRef::Int32),
        ];
        let doc = TypeDefinitionDocument::new("5.4", DocumentAttributes::empty(), vec![ty]);
        let mut reflection = SymbolReflection::process(Arc::new(doc));
        for name in ["abs", "strlen", "strtol", "tally"] {
            reflection.bind(FunctionId::new("CRuntime", name), name);
        }
        reflection
    }

    #[test]
    fn test_scalar_call() {
        let reflection = libc_reflection();
        let id = FunctionId::new("CRuntime", "abs");
        assert!(reflection.contains(&id));
        assert_eq!(reflection.call(&id, &mut [Value::I32(-42)]), Ok(Value::I32(42)));
    }

    #[test]
    fn test_string_argument() {
        let reflection = libc_reflection();
        let id = FunctionId::new("CRuntime", "strlen");
        assert_eq!(reflection.call(&id, &mut [Value::from("sharpbind")]), Ok(Value::U64(9)));
        assert!(reflection.call(&id, &mut [Value::I32(1)]).is_err());
    }

    #[test]
    fn test_out_parameter() {
        let reflection = libc_reflection();
        let id = FunctionId::new("CRuntime", "strtol");
        let mut args = [Value::from("42abc"), Value::Void, Value::I32(10)];
        assert_eq!(reflection.call(&id, &mut args), Ok(Value::I64(42)));
        assert!(matches!(args[1], Value::Handle(end) if end != 0));
    }

    #[test]
    fn test_unsupported_parameter() {
        let reflection = libc_reflection();
        let id = FunctionId::new("CRuntime", "tally");
        assert!(matches!(reflection.call(&id, &mut [Value::Array(vec![])]), Err(HostError::Marshal(_))));
        assert!(!reflection.contains(&FunctionId::new("CRuntime", "missing")));
    }
}
