//! Host-owned contiguous buffers
//!
//! A [`HostArray`] wraps an `ndarray` array of one of the supported element
//! types. Native code only ever borrows its storage for the duration of a
//! call; ownership never crosses the boundary.

use std::ffi::c_void;
use std::fmt;

use ndarray::{Array1, ArrayD, IxDyn};

use super::types::ScalarType;

/// Numeric array owned by the host, passed to native code by pointer
#[derive(Debug, Clone, PartialEq)]
pub enum HostArray {
    I8(ArrayD<i8>),
    I16(ArrayD<i16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    U32(ArrayD<u32>),
    U64(ArrayD<u64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! dispatch {
    ($self:expr, $a:ident => $body:expr) => {
        match $self {
            HostArray::I8($a) => $body,
            HostArray::I16($a) => $body,
            HostArray::I32($a) => $body,
            HostArray::I64($a) => $body,
            HostArray::U8($a) => $body,
            HostArray::U16($a) => $body,
            HostArray::U32($a) => $body,
            HostArray::U64($a) => $body,
            HostArray::F32($a) => $body,
            HostArray::F64($a) => $body,
        }
    };
}

macro_rules! collect_as {
    ($elem:expr, $values:expr) => {{
        macro_rules! build {
            ($variant:ident, $t:ty) => {
                HostArray::$variant(
                    Array1::from_iter($values.iter().map(|v| *v as $t)).into_dyn(),
                )
            };
        }
        match $elem {
            ScalarType::I8 => build!(I8, i8),
            ScalarType::I16 => build!(I16, i16),
            ScalarType::I32 => build!(I32, i32),
            ScalarType::I64 => build!(I64, i64),
            ScalarType::U8 => build!(U8, u8),
            ScalarType::U16 => build!(U16, u16),
            ScalarType::U32 => build!(U32, u32),
            ScalarType::U64 => build!(U64, u64),
            ScalarType::F32 => build!(F32, f32),
            ScalarType::F64 => build!(F64, f64),
        }
    }};
}

impl HostArray {
    /// Element type of the array
    pub fn elem(&self) -> ScalarType {
        match self {
            HostArray::I8(_) => ScalarType::I8,
            HostArray::I16(_) => ScalarType::I16,
            HostArray::I32(_) => ScalarType::I32,
            HostArray::I64(_) => ScalarType::I64,
            HostArray::U8(_) => ScalarType::U8,
            HostArray::U16(_) => ScalarType::U16,
            HostArray::U32(_) => ScalarType::U32,
            HostArray::U64(_) => ScalarType::U64,
            HostArray::F32(_) => ScalarType::F32,
            HostArray::F64(_) => ScalarType::F64,
        }
    }

    pub fn ndim(&self) -> usize {
        dispatch!(self, a => a.ndim())
    }

    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        dispatch!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the elements are laid out in C (row-major) order with no gaps
    pub fn is_contiguous(&self) -> bool {
        dispatch!(self, a => a.is_standard_layout())
    }

    /// Re-lay the elements out in C order, copying only when needed
    pub fn make_contiguous(&mut self) {
        if !self.is_contiguous() {
            dispatch!(self, a => *a = a.as_standard_layout().into_owned())
        }
    }

    /// Pointer to the first element, for read-only callees
    pub fn as_ptr(&self) -> *const c_void {
        dispatch!(self, a => a.as_ptr() as *const c_void)
    }

    /// Pointer to the first element, for callees that write through it
    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        dispatch!(self, a => a.as_mut_ptr() as *mut c_void)
    }

    /// Element `index` in logical (row-major) order, widened to f64
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        dispatch!(self, a => a.iter().nth(index).map(|v| *v as f64))
    }

    /// Build a one-dimensional array of `elem` from f64 values.
    ///
    /// Values are cast to the element type the way `as` does.
    pub fn from_f64s(elem: ScalarType, values: &[f64]) -> Self {
        collect_as!(elem, values)
    }

    /// Build a one-dimensional array of `elem` from integer values.
    ///
    /// Values wider than the element type keep their low bits, as a C cast
    /// would; 64-bit elements are exact over their whole range.
    pub fn from_ints(elem: ScalarType, values: &[i128]) -> Self {
        collect_as!(elem, values)
    }

    /// The same elements, in row-major order, under a new shape
    pub fn reshape(self, shape: &[usize]) -> Option<Self> {
        macro_rules! reshape {
            ($($variant:ident),*) => {
                match self {
                    $(HostArray::$variant(a) => a
                        .into_shape_with_order(IxDyn(shape))
                        .ok()
                        .map(HostArray::$variant),)*
                }
            };
        }
        reshape!(I8, I16, I32, I64, U8, U16, U32, U64, F32, F64)
    }

    /// All elements in row-major order, widened to f64
    pub fn to_f64_vec(&self) -> Vec<f64> {
        dispatch!(self, a => a.iter().map(|v| *v as f64).collect())
    }

    /// Zero-filled array of `elem` with the given shape
    pub fn zeros(elem: ScalarType, shape: &[usize]) -> Self {
        let dim = IxDyn(shape);
        match elem {
            ScalarType::I8 => HostArray::I8(ArrayD::zeros(dim)),
            ScalarType::I16 => HostArray::I16(ArrayD::zeros(dim)),
            ScalarType::I32 => HostArray::I32(ArrayD::zeros(dim)),
            ScalarType::I64 => HostArray::I64(ArrayD::zeros(dim)),
            ScalarType::U8 => HostArray::U8(ArrayD::zeros(dim)),
            ScalarType::U16 => HostArray::U16(ArrayD::zeros(dim)),
            ScalarType::U32 => HostArray::U32(ArrayD::zeros(dim)),
            ScalarType::U64 => HostArray::U64(ArrayD::zeros(dim)),
            ScalarType::F32 => HostArray::F32(ArrayD::zeros(dim)),
            ScalarType::F64 => HostArray::F64(ArrayD::zeros(dim)),
        }
    }
}

impl fmt::Display for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, a => write!(f, "{}", a))
    }
}

macro_rules! impl_from_array {
    ($($variant:ident: $t:ty),*) => {
        $(
            impl<D: ndarray::Dimension> From<ndarray::Array<$t, D>> for HostArray {
                fn from(a: ndarray::Array<$t, D>) -> Self {
                    HostArray::$variant(a.into_dyn())
                }
            }

            impl From<Vec<$t>> for HostArray {
                fn from(v: Vec<$t>) -> Self {
                    HostArray::$variant(Array1::from_vec(v).into_dyn())
                }
            }

            impl<D: ndarray::Dimension> From<ndarray::Array<$t, D>> for super::FfiValue {
                fn from(a: ndarray::Array<$t, D>) -> Self {
                    super::FfiValue::Array(a.into())
                }
            }
        )*
    };
}

impl_from_array!(
    I8: i8,
    I16: i16,
    I32: i32,
    I64: i64,
    U8: u8,
    U16: u16,
    U32: u32,
    U64: u64,
    F32: f32,
    F64: f64
);
