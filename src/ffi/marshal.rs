//! Argument marshalling
//!
//! Converts host [`FfiValue`]s into fixed-width native slots according to
//! the declared [`FfiType`] of each parameter, and reads by-reference output
//! slots back after the call.
//!
//! Everything a native call borrows lives in [`Marshalled`]: C strings,
//! output slots, and raw pointers into the caller's arrays. It must outlive
//! the call and must not be kept past it.

use std::ffi::{c_void, CString};
use std::ptr;

use super::registry::FfiError;
use super::types::{FfiSignature, FfiType, FfiValue, ScalarType};

/// One marshalled argument in its native width
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum NativeArg {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl NativeArg {
    /// Convert back to a host value
    pub(crate) fn to_value(self) -> FfiValue {
        match self {
            NativeArg::I8(v) => FfiValue::Int(v as i64),
            NativeArg::I16(v) => FfiValue::Int(v as i64),
            NativeArg::I32(v) => FfiValue::Int(v as i64),
            NativeArg::I64(v) => FfiValue::Int(v),
            NativeArg::U8(v) => FfiValue::UInt(v as u64),
            NativeArg::U16(v) => FfiValue::UInt(v as u64),
            NativeArg::U32(v) => FfiValue::UInt(v as u64),
            NativeArg::U64(v) => FfiValue::UInt(v),
            NativeArg::F32(v) => FfiValue::Float(v as f64),
            NativeArg::F64(v) => FfiValue::Float(v),
            NativeArg::Pointer(p) if p.is_null() => FfiValue::Null,
            NativeArg::Pointer(p) => FfiValue::Pointer(p as usize),
        }
    }

    /// Address of the stored value, for passing the slot by reference
    fn slot_ptr(&mut self) -> *mut c_void {
        match self {
            NativeArg::I8(v) => v as *mut i8 as *mut c_void,
            NativeArg::I16(v) => v as *mut i16 as *mut c_void,
            NativeArg::I32(v) => v as *mut i32 as *mut c_void,
            NativeArg::I64(v) => v as *mut i64 as *mut c_void,
            NativeArg::U8(v) => v as *mut u8 as *mut c_void,
            NativeArg::U16(v) => v as *mut u16 as *mut c_void,
            NativeArg::U32(v) => v as *mut u32 as *mut c_void,
            NativeArg::U64(v) => v as *mut u64 as *mut c_void,
            NativeArg::F32(v) => v as *mut f32 as *mut c_void,
            NativeArg::F64(v) => v as *mut f64 as *mut c_void,
            NativeArg::Pointer(v) => v as *mut *mut c_void as *mut c_void,
        }
    }
}

/// A by-reference output slot and the argument it writes back to
#[derive(Debug)]
struct OutSlot {
    index: usize,
    // Boxed so the address handed to native code stays put
    value: Box<NativeArg>,
}

/// Arguments of one call in native form
#[derive(Debug)]
pub(crate) struct Marshalled {
    pub(crate) args: Vec<NativeArg>,
    /// Number of declared parameters when the callee is variadic
    pub(crate) fixed_args: Option<usize>,
    strings: Vec<CString>,
    out_slots: Vec<OutSlot>,
}

impl Marshalled {
    /// Copy every output slot back into its `FfiValue::Ref` argument
    pub(crate) fn write_back(self, args: &mut [FfiValue]) {
        for slot in self.out_slots {
            if let Some(FfiValue::Ref(inner)) = args.get_mut(slot.index) {
                **inner = slot.value.to_value();
            }
        }
    }

    /// Number of C strings kept alive for the call
    #[cfg(test)]
    pub(crate) fn string_count(&self) -> usize {
        self.strings.len()
    }
}

/// Marshal `args` against `signature`.
///
/// With `strict_scalars` set, integer arguments outside the declared width
/// are rejected instead of being truncated.
pub(crate) fn marshal(
    signature: &FfiSignature,
    args: &mut [FfiValue],
    strict_scalars: bool,
) -> Result<Marshalled, FfiError> {
    let mut ctx = Context {
        function: &signature.name,
        strict_scalars,
        out: Marshalled {
            args: Vec::with_capacity(args.len()),
            fixed_args: signature.variadic.then_some(signature.params.len()),
            strings: Vec::new(),
            out_slots: Vec::new(),
        },
    };

    for (index, value) in args.iter_mut().enumerate() {
        let ty = match signature.params.get(index) {
            Some(ty) => ty.clone(),
            None => variadic_type(value),
        };
        let arg = ctx.marshal_one(index, &ty, value)?;
        ctx.out.args.push(arg);
    }

    Ok(ctx.out)
}

/// Native type for an extra argument of a variadic call.
///
/// Follows C default argument promotion: integers travel as 64-bit words
/// and floats as doubles.
pub(crate) fn variadic_type(value: &FfiValue) -> FfiType {
    match value {
        FfiValue::Int(_) => FfiType::I64,
        FfiValue::UInt(_) => FfiType::U64,
        FfiValue::Float(_) => FfiType::F64,
        FfiValue::Str(_) => FfiType::CStr,
        FfiValue::Array(a) => FfiType::Buffer(super::types::BufferSpec::new(a.elem())),
        FfiValue::Ref(inner) => match inner.as_ref() {
            FfiValue::Float(_) => FfiType::OutRef(ScalarType::F64),
            FfiValue::UInt(_) => FfiType::OutRef(ScalarType::U64),
            _ => FfiType::OutRef(ScalarType::I64),
        },
        FfiValue::Void | FfiValue::Null | FfiValue::Pointer(_) => FfiType::Ptr,
    }
}

struct Context<'a> {
    function: &'a str,
    strict_scalars: bool,
    out: Marshalled,
}

impl Context<'_> {
    fn type_error(&self, index: usize, expected: impl ToString, actual: impl ToString) -> FfiError {
        FfiError::TypeError {
            function: self.function.to_string(),
            index,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    fn marshal_one(
        &mut self,
        index: usize,
        ty: &FfiType,
        value: &mut FfiValue,
    ) -> Result<NativeArg, FfiError> {
        if let Some(scalar) = ty.scalar() {
            return self.scalar(index, scalar, value);
        }

        match (ty, value) {
            (FfiType::Void, value) => Err(self.type_error(index, "a non-void parameter", value.kind())),

            (_, FfiValue::Null) => Ok(NativeArg::Pointer(ptr::null_mut())),

            (FfiType::Ptr, FfiValue::Pointer(p)) => Ok(NativeArg::Pointer(*p as *mut c_void)),
            (FfiType::Ptr, FfiValue::Array(a)) => {
                a.make_contiguous();
                Ok(NativeArg::Pointer(a.as_mut_ptr()))
            }

            (FfiType::CStr, FfiValue::Str(s)) => {
                if !s.is_ascii() {
                    return Err(self.type_error(index, "ASCII text", "non-ASCII text"));
                }
                let c_string = CString::new(s.as_str())
                    .map_err(|_| self.type_error(index, "text without NUL bytes", "text with an interior NUL"))?;
                // The CString's heap buffer does not move when the Vec grows
                let p = c_string.as_ptr() as *mut c_void;
                self.out.strings.push(c_string);
                Ok(NativeArg::Pointer(p))
            }

            (FfiType::Buffer(spec), FfiValue::Array(array)) => {
                spec.check(array).map_err(|actual| FfiError::ShapeError {
                    function: self.function.to_string(),
                    index,
                    expected: spec.to_string(),
                    actual,
                })?;
                // Unconstrained strided arrays are re-laid out in place, so
                // the callee's writes still land in the caller's array
                array.make_contiguous();
                let p = if spec.writable {
                    array.as_mut_ptr()
                } else {
                    array.as_ptr() as *mut c_void
                };
                Ok(NativeArg::Pointer(p))
            }

            (FfiType::OutRef(scalar), FfiValue::Ref(inner)) => {
                let initial = match inner.as_ref() {
                    // An empty slot starts zeroed
                    FfiValue::Null | FfiValue::Void => zero(*scalar),
                    other => self.scalar(index, *scalar, other)?,
                };
                let mut slot = OutSlot {
                    index,
                    value: Box::new(initial),
                };
                let p = slot.value.slot_ptr();
                self.out.out_slots.push(slot);
                Ok(NativeArg::Pointer(p))
            }

            (ty, value) => Err(self.type_error(index, ty, value.kind())),
        }
    }

    fn scalar(
        &self,
        index: usize,
        scalar: ScalarType,
        value: &FfiValue,
    ) -> Result<NativeArg, FfiError> {
        if scalar.is_float() {
            let v = match value {
                FfiValue::Float(v) => *v,
                FfiValue::Int(v) => *v as f64,
                FfiValue::UInt(v) => *v as f64,
                other => return Err(self.type_error(index, scalar, other.kind())),
            };
            if self.strict_scalars
                && scalar == ScalarType::F32
                && v.is_finite()
                && (v as f32).is_infinite()
            {
                return Err(self.type_error(index, scalar, format!("{} (out of range)", v)));
            }
            return Ok(match scalar {
                ScalarType::F32 => NativeArg::F32(v as f32),
                _ => NativeArg::F64(v),
            });
        }

        let wide: i128 = match value {
            FfiValue::Int(v) => *v as i128,
            FfiValue::UInt(v) => *v as i128,
            other => return Err(self.type_error(index, scalar, other.kind())),
        };

        if self.strict_scalars {
            if let Some((min, max)) = scalar.int_range() {
                if wide < min || wide > max {
                    return Err(self.type_error(index, scalar, format!("{} (out of range)", wide)));
                }
            }
        }

        // Without strict checking a value wider than the slot is truncated,
        // exactly as a C cast would
        Ok(match scalar {
            ScalarType::I8 => NativeArg::I8(wide as i8),
            ScalarType::I16 => NativeArg::I16(wide as i16),
            ScalarType::I32 => NativeArg::I32(wide as i32),
            ScalarType::I64 => NativeArg::I64(wide as i64),
            ScalarType::U8 => NativeArg::U8(wide as u8),
            ScalarType::U16 => NativeArg::U16(wide as u16),
            ScalarType::U32 => NativeArg::U32(wide as u32),
            ScalarType::U64 => NativeArg::U64(wide as u64),
            ScalarType::F32 => NativeArg::F32(wide as f32),
            ScalarType::F64 => NativeArg::F64(wide as f64),
        })
    }
}

fn zero(scalar: ScalarType) -> NativeArg {
    match scalar {
        ScalarType::I8 => NativeArg::I8(0),
        ScalarType::I16 => NativeArg::I16(0),
        ScalarType::I32 => NativeArg::I32(0),
        ScalarType::I64 => NativeArg::I64(0),
        ScalarType::U8 => NativeArg::U8(0),
        ScalarType::U16 => NativeArg::U16(0),
        ScalarType::U32 => NativeArg::U32(0),
        ScalarType::U64 => NativeArg::U64(0),
        ScalarType::F32 => NativeArg::F32(0.0),
        ScalarType::F64 => NativeArg::F64(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::array::HostArray;
    use crate::ffi::types::BufferSpec;
    use ndarray::{arr2, Array1};

    fn sig(params: Vec<FfiType>) -> FfiSignature {
        FfiSignature::new("f", params, FfiType::Void)
    }

    #[test]
    fn test_scalar_truncates_like_c() {
        let mut args = [FfiValue::Int(300), FfiValue::Int(-1)];
        let m = marshal(&sig(vec![FfiType::U8, FfiType::U32]), &mut args, false).unwrap();
        assert_eq!(m.args[0], NativeArg::U8(44));
        assert_eq!(m.args[1], NativeArg::U32(u32::MAX));
    }

    #[test]
    fn test_strict_scalar_rejects_out_of_range() {
        let mut args = [FfiValue::Int(300)];
        let err = marshal(&sig(vec![FfiType::U8]), &mut args, true).unwrap_err();
        match err {
            FfiError::TypeError { index, expected, .. } => {
                assert_eq!(index, 0);
                assert_eq!(expected, "u8");
            }
            other => panic!("expected TypeError, got {:?}", other),
        }
    }

    #[test]
    fn test_int_widens_into_float_slot() {
        let mut args = [FfiValue::Int(3)];
        let m = marshal(&sig(vec![FfiType::F64]), &mut args, false).unwrap();
        assert_eq!(m.args[0], NativeArg::F64(3.0));
    }

    #[test]
    fn test_text_into_int_slot_is_type_error() {
        let mut args = [FfiValue::from("12")];
        let err = marshal(&sig(vec![FfiType::I32]), &mut args, false).unwrap_err();
        assert!(matches!(err, FfiError::TypeError { .. }));
    }

    #[test]
    fn test_null_for_every_pointer_type() {
        let params = vec![
            FfiType::Ptr,
            FfiType::CStr,
            FfiType::Buffer(BufferSpec::new(ScalarType::F64)),
            FfiType::OutRef(ScalarType::I32),
        ];
        let mut args = [FfiValue::Null, FfiValue::Null, FfiValue::Null, FfiValue::Null];
        let m = marshal(&sig(params), &mut args, false).unwrap();
        for arg in &m.args {
            assert_eq!(*arg, NativeArg::Pointer(ptr::null_mut()));
        }
    }

    #[test]
    fn test_cstr_rejects_non_ascii_and_nul() {
        let mut args = [FfiValue::from("héllo")];
        assert!(matches!(
            marshal(&sig(vec![FfiType::CStr]), &mut args, false),
            Err(FfiError::TypeError { .. })
        ));

        let mut args = [FfiValue::from("a\0b")];
        assert!(matches!(
            marshal(&sig(vec![FfiType::CStr]), &mut args, false),
            Err(FfiError::TypeError { .. })
        ));
    }

    #[test]
    fn test_cstr_is_kept_alive() {
        let mut args = [FfiValue::from("hello")];
        let m = marshal(&sig(vec![FfiType::CStr]), &mut args, false).unwrap();
        assert_eq!(m.string_count(), 1);
        let NativeArg::Pointer(p) = m.args[0] else {
            panic!("expected pointer");
        };
        let s = unsafe { std::ffi::CStr::from_ptr(p as *const std::ffi::c_char) };
        assert_eq!(s.to_str().unwrap(), "hello");
    }

    #[test]
    fn test_buffer_points_at_first_element() {
        let mut args = [FfiValue::from(Array1::from_vec(vec![1.5f64, 2.5]))];
        let m = marshal(
            &sig(vec![FfiType::Buffer(BufferSpec::new(ScalarType::F64))]),
            &mut args,
            false,
        )
        .unwrap();
        let NativeArg::Pointer(p) = m.args[0] else {
            panic!("expected pointer");
        };
        assert_eq!(unsafe { *(p as *const f64) }, 1.5);
    }

    #[test]
    fn test_buffer_shape_errors() {
        let spec = BufferSpec::new(ScalarType::F64).ndim(1).contiguous();
        let params = vec![FfiType::Buffer(spec)];

        let mut wrong_dtype = [FfiValue::from(Array1::from_vec(vec![1i32, 2]))];
        let err = marshal(&sig(params.clone()), &mut wrong_dtype, false).unwrap_err();
        assert!(matches!(err, FfiError::ShapeError { index: 0, .. }));
        assert!(err.to_string().contains("element type i32"));

        let mut wrong_ndim = [FfiValue::from(arr2(&[[1.0f64, 2.0], [3.0, 4.0]]))];
        let err = marshal(&sig(params.clone()), &mut wrong_ndim, false).unwrap_err();
        assert!(err.to_string().contains("2-dimensional"));
    }

    #[test]
    fn test_buffer_contiguity() {
        let spec = BufferSpec::new(ScalarType::F64).contiguous();
        let transposed = arr2(&[[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]]).reversed_axes();
        let mut args = [FfiValue::Array(HostArray::from(transposed))];
        let err = marshal(&sig(vec![FfiType::Buffer(spec)]), &mut args, false).unwrap_err();
        assert!(err.to_string().contains("non-contiguous"));
    }

    #[test]
    fn test_strided_buffer_is_made_contiguous() {
        let transposed = arr2(&[[1.0f64, 2.0, 3.0], [4.0, 5.0, 6.0]]).reversed_axes();
        let mut args = [FfiValue::Array(HostArray::from(transposed))];
        let m = marshal(
            &sig(vec![FfiType::Buffer(BufferSpec::new(ScalarType::F64))]),
            &mut args,
            false,
        )
        .unwrap();
        let NativeArg::Pointer(p) = m.args[0] else {
            panic!("expected pointer");
        };
        let seen: Vec<f64> = (0..6).map(|i| unsafe { *(p as *const f64).add(i) }).collect();
        assert_eq!(seen, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(args[0].as_array().unwrap().is_contiguous());
    }

    #[test]
    fn test_out_slot_write_back() {
        let mut args = [FfiValue::out(7i32)];
        let m = marshal(&sig(vec![FfiType::OutRef(ScalarType::I32)]), &mut args, false).unwrap();

        // Simulate the callee writing through the pointer
        let NativeArg::Pointer(p) = m.args[0] else {
            panic!("expected pointer");
        };
        assert_eq!(unsafe { *(p as *const i32) }, 7);
        unsafe { *(p as *mut i32) = 99 };
        m.write_back(&mut args);

        assert_eq!(args[0], FfiValue::out(99i64));
    }

    #[test]
    fn test_variadic_extras_are_promoted() {
        let signature = FfiSignature::variadic("v", vec![FfiType::I32], FfiType::Void);
        let mut args = [FfiValue::Int(2), FfiValue::Float(1.5), FfiValue::from("x")];
        let m = marshal(&signature, &mut args, false).unwrap();
        assert_eq!(m.args[0], NativeArg::I32(2));
        assert_eq!(m.args[1], NativeArg::F64(1.5));
        assert!(matches!(m.args[2], NativeArg::Pointer(_)));
        assert_eq!(m.fixed_args, Some(1));

        let fixed = FfiSignature::new("f", vec![FfiType::I32], FfiType::Void);
        let m = marshal(&fixed, &mut [FfiValue::Int(2)], false).unwrap();
        assert_eq!(m.fixed_args, None);
    }

    #[test]
    fn test_rejections_report_the_argument() {
        let signature = sig(vec![FfiType::I32, FfiType::Buffer(BufferSpec::new(ScalarType::F64))]);
        let mut args = [FfiValue::Int(1), FfiValue::out(0.0f64)];
        let err = marshal(&signature, &mut args, false).unwrap_err();
        assert!(matches!(err, FfiError::TypeError { index: 1, .. }), "{:?}", err);
    }
}
