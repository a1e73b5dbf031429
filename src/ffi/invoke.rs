//! Native call execution through libffi
//!
//! Call interfaces are built from the declared types and cached per thread,
//! keyed by the native slot kinds of the parameters and return value.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::{c_char, c_uint, c_void, CStr};

use libffi::middle::{Arg, Cif, CodePtr, Type};
use libffi::raw::{self, ffi_arg};

use super::marshal::{Marshalled, NativeArg};
use super::registry::{FfiError, FfiResult};
use super::types::{FfiType, FfiValue};

/// Native slot kind, the unit libffi types are built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SlotKind {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
}

impl SlotKind {
    fn of_type(ty: &FfiType) -> Self {
        match ty {
            FfiType::Void => SlotKind::Void,
            FfiType::I8 => SlotKind::I8,
            FfiType::I16 => SlotKind::I16,
            FfiType::I32 => SlotKind::I32,
            FfiType::I64 => SlotKind::I64,
            FfiType::U8 => SlotKind::U8,
            FfiType::U16 => SlotKind::U16,
            FfiType::U32 => SlotKind::U32,
            FfiType::U64 => SlotKind::U64,
            FfiType::F32 => SlotKind::F32,
            FfiType::F64 => SlotKind::F64,
            FfiType::Ptr | FfiType::CStr | FfiType::Buffer(_) | FfiType::OutRef(_) => {
                SlotKind::Pointer
            }
        }
    }

    fn of_arg(arg: &NativeArg) -> Self {
        match arg {
            NativeArg::I8(_) => SlotKind::I8,
            NativeArg::I16(_) => SlotKind::I16,
            NativeArg::I32(_) => SlotKind::I32,
            NativeArg::I64(_) => SlotKind::I64,
            NativeArg::U8(_) => SlotKind::U8,
            NativeArg::U16(_) => SlotKind::U16,
            NativeArg::U32(_) => SlotKind::U32,
            NativeArg::U64(_) => SlotKind::U64,
            NativeArg::F32(_) => SlotKind::F32,
            NativeArg::F64(_) => SlotKind::F64,
            NativeArg::Pointer(_) => SlotKind::Pointer,
        }
    }

    fn ffi_type(self) -> Type {
        match self {
            SlotKind::Void => Type::void(),
            SlotKind::I8 => Type::i8(),
            SlotKind::I16 => Type::i16(),
            SlotKind::I32 => Type::i32(),
            SlotKind::I64 => Type::i64(),
            SlotKind::U8 => Type::u8(),
            SlotKind::U16 => Type::u16(),
            SlotKind::U32 => Type::u32(),
            SlotKind::U64 => Type::u64(),
            SlotKind::F32 => Type::f32(),
            SlotKind::F64 => Type::f64(),
            SlotKind::Pointer => Type::pointer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CifKey {
    params: Vec<SlotKind>,
    ret: SlotKind,
    /// Declared parameter count of a variadic callee
    fixed_args: Option<usize>,
}

thread_local! {
    static CIF_CACHE: RefCell<HashMap<CifKey, Cif>> = RefCell::new(HashMap::new());
}

fn build_cif(key: &CifKey) -> FfiResult<Cif> {
    let cif = Cif::new(
        key.params.iter().map(|kind| kind.ffi_type()),
        key.ret.ffi_type(),
    );
    let Some(fixed) = key.fixed_args else {
        return Ok(cif);
    };

    // Apple arm64 and Win64 pass variadic extras differently from declared
    // parameters, so libffi has to be told where the split is
    let raw_cif = cif.as_raw_ptr();
    let status = unsafe {
        raw::ffi_prep_cif_var(
            raw_cif,
            raw::ffi_abi_FFI_DEFAULT_ABI,
            fixed as c_uint,
            key.params.len() as c_uint,
            (*raw_cif).rtype,
            (*raw_cif).arg_types,
        )
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(FfiError::InvalidSignature(format!(
            "libffi cannot prepare a variadic call with {} fixed and {} total arguments",
            fixed,
            key.params.len()
        )));
    }
    Ok(cif)
}

fn with_cif<R>(key: CifKey, use_cif: impl FnOnce(&Cif) -> R) -> FfiResult<R> {
    CIF_CACHE.with(|cache| {
        let mut map = cache.borrow_mut();
        let cif = match map.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let cif = build_cif(entry.key())?;
                entry.insert(cif)
            }
        };
        Ok(use_cif(cif))
    })
}

/// Call the native function at `addr` with already-marshalled arguments.
///
/// Blocks the calling thread until the callee returns. Fails only when
/// libffi cannot describe the call, before any native code runs.
///
/// # Safety
///
/// `addr` must point to a function whose real C signature takes exactly the
/// marshalled argument kinds and returns `ret`. Any pointer argument must be
/// valid for whatever the callee does with it. Nothing here can verify
/// either; a mismatch is undefined behaviour.
pub(crate) unsafe fn invoke(
    addr: usize,
    ret: &FfiType,
    marshalled: &Marshalled,
) -> FfiResult<FfiValue> {
    let key = CifKey {
        params: marshalled.args.iter().map(SlotKind::of_arg).collect(),
        ret: SlotKind::of_type(ret),
        fixed_args: marshalled.fixed_args,
    };

    let args: Vec<Arg> = marshalled.args.iter().map(arg_ref).collect();
    let code = CodePtr(addr as *mut c_void);

    with_cif(key, |cif| {
        // Integer returns narrower than a register come back in a full
        // ffi_arg slot, so read them at that width and narrow afterwards
        match SlotKind::of_type(ret) {
            SlotKind::Void => {
                cif.call::<()>(code, &args);
                FfiValue::Void
            }
            SlotKind::I8 => FfiValue::Int(cif.call::<ffi_arg>(code, &args) as i8 as i64),
            SlotKind::I16 => FfiValue::Int(cif.call::<ffi_arg>(code, &args) as i16 as i64),
            SlotKind::I32 => FfiValue::Int(cif.call::<ffi_arg>(code, &args) as i32 as i64),
            SlotKind::I64 => FfiValue::Int(cif.call::<i64>(code, &args)),
            SlotKind::U8 => FfiValue::UInt(cif.call::<ffi_arg>(code, &args) as u8 as u64),
            SlotKind::U16 => FfiValue::UInt(cif.call::<ffi_arg>(code, &args) as u16 as u64),
            SlotKind::U32 => FfiValue::UInt(cif.call::<ffi_arg>(code, &args) as u32 as u64),
            SlotKind::U64 => FfiValue::UInt(cif.call::<u64>(code, &args)),
            SlotKind::F32 => FfiValue::Float(cif.call::<f32>(code, &args) as f64),
            SlotKind::F64 => FfiValue::Float(cif.call::<f64>(code, &args)),
            SlotKind::Pointer => {
                let p = cif.call::<*mut c_void>(code, &args);
                pointer_result(ret, p)
            }
        }
    })
}

fn arg_ref(arg: &NativeArg) -> Arg {
    match arg {
        NativeArg::I8(v) => Arg::new(v),
        NativeArg::I16(v) => Arg::new(v),
        NativeArg::I32(v) => Arg::new(v),
        NativeArg::I64(v) => Arg::new(v),
        NativeArg::U8(v) => Arg::new(v),
        NativeArg::U16(v) => Arg::new(v),
        NativeArg::U32(v) => Arg::new(v),
        NativeArg::U64(v) => Arg::new(v),
        NativeArg::F32(v) => Arg::new(v),
        NativeArg::F64(v) => Arg::new(v),
        NativeArg::Pointer(v) => Arg::new(v),
    }
}

/// Convert a returned pointer according to its declared type.
///
/// A returned C string is copied into an owned `String`; the native side
/// keeps ownership of the original bytes.
unsafe fn pointer_result(ret: &FfiType, p: *mut c_void) -> FfiValue {
    if p.is_null() {
        return FfiValue::Null;
    }
    match ret {
        FfiType::CStr => {
            let text = CStr::from_ptr(p as *const c_char);
            FfiValue::Str(text.to_string_lossy().into_owned())
        }
        _ => FfiValue::Pointer(p as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::array::HostArray;
    use crate::ffi::marshal::marshal;
    use crate::ffi::types::{BufferSpec, FfiSignature, ScalarType};
    use ndarray::Array1;

    extern "C" fn add_i32(a: i32, b: i32) -> i32 {
        a.wrapping_add(b)
    }

    extern "C" fn mixed(a: i8, b: f64, c: u16, d: f32) -> f64 {
        a as f64 + b + c as f64 + d as f64
    }

    extern "C" fn negate_u8(v: u8) -> u8 {
        !v
    }

    extern "C" fn sum_f64(data: *const f64, n: usize) -> f64 {
        let slice = unsafe { std::slice::from_raw_parts(data, n) };
        slice.iter().sum()
    }

    extern "C" fn greeting() -> *const c_char {
        b"hello\0".as_ptr() as *const c_char
    }

    extern "C" fn store(out: *mut i64, v: i64) {
        unsafe { *out = v };
    }

    fn call(sig: &FfiSignature, addr: usize, args: &mut [FfiValue]) -> FfiValue {
        let m = marshal(sig, args, false).unwrap();
        let result = unsafe { invoke(addr, &sig.return_type, &m) }.unwrap();
        m.write_back(args);
        result
    }

    #[test]
    fn test_invoke_scalars() {
        let sig = FfiSignature::new("add_i32", vec![FfiType::I32, FfiType::I32], FfiType::I32);
        let out = call(&sig, add_i32 as usize, &mut [FfiValue::Int(40), FfiValue::Int(2)]);
        assert_eq!(out, FfiValue::Int(42));

        let sig = FfiSignature::new(
            "mixed",
            vec![FfiType::I8, FfiType::F64, FfiType::U16, FfiType::F32],
            FfiType::F64,
        );
        let out = call(
            &sig,
            mixed as usize,
            &mut [
                FfiValue::Int(-3),
                FfiValue::Float(0.5),
                FfiValue::UInt(1000),
                FfiValue::Float(0.25),
            ],
        );
        assert_eq!(out, FfiValue::Float(997.75));
    }

    #[test]
    fn test_invoke_narrow_return() {
        let sig = FfiSignature::new("negate_u8", vec![FfiType::U8], FfiType::U8);
        let out = call(&sig, negate_u8 as usize, &mut [FfiValue::UInt(0x0f)]);
        assert_eq!(out, FfiValue::UInt(0xf0));
    }

    #[test]
    fn test_invoke_buffer() {
        let sig = FfiSignature::new(
            "sum_f64",
            vec![FfiType::Buffer(BufferSpec::new(ScalarType::F64)), FfiType::U64],
            FfiType::F64,
        );
        let data = Array1::from_vec(vec![1.0f64, 2.0, 3.5]);
        let out = call(&sig, sum_f64 as usize, &mut [FfiValue::from(data), FfiValue::UInt(3)]);
        assert_eq!(out, FfiValue::Float(6.5));
    }

    #[test]
    fn test_invoke_cstr_return() {
        let sig = FfiSignature::new("greeting", vec![], FfiType::CStr);
        let out = call(&sig, greeting as usize, &mut []);
        assert_eq!(out, FfiValue::from("hello"));
    }

    #[test]
    fn test_invoke_out_ref() {
        let sig = FfiSignature::new(
            "store",
            vec![FfiType::OutRef(ScalarType::I64), FfiType::I64],
            FfiType::Void,
        );
        let mut args = [FfiValue::out(FfiValue::Null), FfiValue::Int(-77)];
        let out = call(&sig, store as usize, &mut args);
        assert!(out.is_void());
        assert_eq!(args[0], FfiValue::out(-77i64));
    }

    #[cfg(unix)]
    #[test]
    fn test_invoke_variadic_snprintf() {
        let sig = FfiSignature::variadic(
            "snprintf",
            vec![
                FfiType::Buffer(BufferSpec::new(ScalarType::U8).writable()),
                FfiType::from_scalar(ScalarType::usize()),
                FfiType::CStr,
            ],
            FfiType::I32,
        );
        let mut args = [
            FfiValue::from(HostArray::zeros(ScalarType::U8, &[32])),
            FfiValue::from(32usize),
            FfiValue::from("%lld/%.2f/%s"),
            FfiValue::Int(-12),
            FfiValue::Float(2.5),
            FfiValue::from("ok"),
        ];
        let written = call(&sig, libc::snprintf as usize, &mut args);
        assert_eq!(written, FfiValue::Int(11));

        let bytes: Vec<u8> = args[0]
            .as_array()
            .unwrap()
            .to_f64_vec()
            .into_iter()
            .take(11)
            .map(|b| b as u8)
            .collect();
        assert_eq!(bytes, b"-12/2.50/ok");
    }
}
