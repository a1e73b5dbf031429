//! FFI Type System
//!
//! Representation tags for native arguments and return values, the host-side
//! values that get marshalled into them, and function signatures.

use std::fmt;

use super::array::HostArray;

/// Fixed-width scalar element types.
///
/// Used as the element type of contiguous buffers and as the slot type of
/// by-reference parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
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
}

impl ScalarType {
    /// Size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ScalarType::F32 | ScalarType::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64
        )
    }

    /// Parse from a string representation (Rust or C spelling)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "i8" | "int8" | "int8_t" | "char" | "signed char" => Some(ScalarType::I8),
            "i16" | "int16" | "int16_t" | "short" => Some(ScalarType::I16),
            "i32" | "int32" | "int32_t" | "int" => Some(ScalarType::I32),
            "i64" | "int64" | "int64_t" | "long" | "long long" => Some(ScalarType::I64),
            "u8" | "uint8" | "uint8_t" | "byte" | "unsigned char" => Some(ScalarType::U8),
            "u16" | "uint16" | "uint16_t" | "unsigned short" => Some(ScalarType::U16),
            "u32" | "uint32" | "uint32_t" | "unsigned" | "unsigned int" => Some(ScalarType::U32),
            "u64" | "uint64" | "uint64_t" | "ulong" | "unsigned long"
            | "unsigned long long" => Some(ScalarType::U64),
            "usize" | "size_t" => Some(Self::usize()),
            "isize" | "ssize_t" | "ptrdiff_t" => Some(Self::isize()),
            "f32" | "float" => Some(ScalarType::F32),
            "f64" | "double" => Some(ScalarType::F64),
            _ => None,
        }
    }

    /// The unsigned type matching the platform pointer width
    pub fn usize() -> Self {
        #[cfg(target_pointer_width = "64")]
        {
            ScalarType::U64
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            ScalarType::U32
        }
    }

    /// The signed type matching the platform pointer width
    pub fn isize() -> Self {
        #[cfg(target_pointer_width = "64")]
        {
            ScalarType::I64
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            ScalarType::I32
        }
    }

    /// Inclusive integer range representable in this type.
    ///
    /// Returns `None` for floating point types.
    pub fn int_range(&self) -> Option<(i128, i128)> {
        match self {
            ScalarType::I8 => Some((i8::MIN as i128, i8::MAX as i128)),
            ScalarType::I16 => Some((i16::MIN as i128, i16::MAX as i128)),
            ScalarType::I32 => Some((i32::MIN as i128, i32::MAX as i128)),
            ScalarType::I64 => Some((i64::MIN as i128, i64::MAX as i128)),
            ScalarType::U8 => Some((0, u8::MAX as i128)),
            ScalarType::U16 => Some((0, u16::MAX as i128)),
            ScalarType::U32 => Some((0, u32::MAX as i128)),
            ScalarType::U64 => Some((0, u64::MAX as i128)),
            ScalarType::F32 | ScalarType::F64 => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Declared constraint on a contiguous buffer argument.
///
/// Checked against the host array before the native call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSpec {
    /// Element type
    pub elem: ScalarType,
    /// Required number of dimensions
    pub ndim: Option<usize>,
    /// Required exact shape
    pub shape: Option<Vec<usize>>,
    /// Require C (row-major) contiguous layout
    pub contiguous: bool,
    /// The callee writes through the pointer
    pub writable: bool,
}

impl BufferSpec {
    /// Unconstrained read-only buffer of `elem`
    pub fn new(elem: ScalarType) -> Self {
        Self {
            elem,
            ndim: None,
            shape: None,
            contiguous: false,
            writable: false,
        }
    }

    pub fn ndim(mut self, ndim: usize) -> Self {
        self.ndim = Some(ndim);
        self
    }

    pub fn shape(mut self, shape: Vec<usize>) -> Self {
        self.ndim = Some(shape.len());
        self.shape = Some(shape);
        self
    }

    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    /// Check a host array against this constraint.
    ///
    /// Returns a description of the first violation.
    pub fn check(&self, array: &HostArray) -> Result<(), String> {
        if array.elem() != self.elem {
            return Err(format!("element type {}", array.elem()));
        }
        if let Some(ndim) = self.ndim {
            if array.ndim() != ndim {
                return Err(format!("{}-dimensional array", array.ndim()));
            }
        }
        if let Some(ref shape) = self.shape {
            if array.shape() != shape.as_slice() {
                return Err(format!("shape {}", format_shape(array.shape())));
            }
        }
        if self.contiguous && !array.is_contiguous() {
            return Err("non-contiguous array".to_string());
        }
        Ok(())
    }

    fn parse(inner: &str, writable: bool) -> Option<Self> {
        let mut parts = split_top_level(inner).into_iter();
        let elem = ScalarType::from_str(parts.next()?)?;
        let mut spec = BufferSpec::new(elem);
        spec.writable = writable;

        for part in parts {
            let part = part.trim();
            if let Some(n) = part.strip_prefix("ndim=") {
                spec.ndim = Some(n.trim().parse().ok()?);
            } else if let Some(s) = part.strip_prefix("shape=") {
                let dims = s
                    .split('x')
                    .map(|d| d.trim().parse::<usize>())
                    .collect::<Result<Vec<_>, _>>()
                    .ok()?;
                spec = spec.shape(dims);
            } else if matches!(part, "contiguous" | "c_contiguous" | "contig") {
                spec.contiguous = true;
            } else {
                return None;
            }
        }
        Some(spec)
    }
}

impl fmt::Display for BufferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.writable { "buffer_mut" } else { "buffer" };
        write!(f, "{}<{}", kind, self.elem)?;
        match self.shape {
            Some(ref shape) => write!(f, ", shape={}", format_shape(shape))?,
            None => {
                if let Some(ndim) = self.ndim {
                    write!(f, ", ndim={}", ndim)?;
                }
            }
        }
        if self.contiguous {
            write!(f, ", contiguous")?;
        }
        write!(f, ">")
    }
}

fn format_shape(shape: &[usize]) -> String {
    if shape.is_empty() {
        return "()".to_string();
    }
    shape
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// FFI value types supported for function parameters and return values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfiType {
    /// Void (no value)
    Void,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Opaque pointer (void*)
    Ptr,
    /// Null-terminated narrow C string (const char*)
    CStr,
    /// Pointer to the first element of a contiguous buffer
    Buffer(BufferSpec),
    /// Pointer to a mutable scalar slot (output parameter)
    OutRef(ScalarType),
}

impl FfiType {
    /// Get the size in bytes of the native slot for this type
    pub fn size(&self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::U8 | FfiType::I8 => 1,
            FfiType::U16 | FfiType::I16 => 2,
            FfiType::U32 | FfiType::I32 | FfiType::F32 => 4,
            FfiType::U64 | FfiType::I64 | FfiType::F64 => 8,
            FfiType::Ptr | FfiType::CStr | FfiType::Buffer(_) | FfiType::OutRef(_) => {
                std::mem::size_of::<usize>()
            }
        }
    }

    /// Check if this type is an integer type
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            FfiType::U8
                | FfiType::U16
                | FfiType::U32
                | FfiType::U64
                | FfiType::I8
                | FfiType::I16
                | FfiType::I32
                | FfiType::I64
        )
    }

    /// Check if this type is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, FfiType::F32 | FfiType::F64)
    }

    /// Check if this type is passed as a pointer
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            FfiType::Ptr | FfiType::CStr | FfiType::Buffer(_) | FfiType::OutRef(_)
        )
    }

    /// Whether this type may appear as a function's return type
    pub fn is_valid_return(&self) -> bool {
        !matches!(self, FfiType::Buffer(_) | FfiType::OutRef(_))
    }

    /// The scalar this type copies by value, if any
    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            FfiType::U8 => Some(ScalarType::U8),
            FfiType::U16 => Some(ScalarType::U16),
            FfiType::U32 => Some(ScalarType::U32),
            FfiType::U64 => Some(ScalarType::U64),
            FfiType::I8 => Some(ScalarType::I8),
            FfiType::I16 => Some(ScalarType::I16),
            FfiType::I32 => Some(ScalarType::I32),
            FfiType::I64 => Some(ScalarType::I64),
            FfiType::F32 => Some(ScalarType::F32),
            FfiType::F64 => Some(ScalarType::F64),
            _ => None,
        }
    }

    pub fn from_scalar(scalar: ScalarType) -> Self {
        match scalar {
            ScalarType::U8 => FfiType::U8,
            ScalarType::U16 => FfiType::U16,
            ScalarType::U32 => FfiType::U32,
            ScalarType::U64 => FfiType::U64,
            ScalarType::I8 => FfiType::I8,
            ScalarType::I16 => FfiType::I16,
            ScalarType::I32 => FfiType::I32,
            ScalarType::I64 => FfiType::I64,
            ScalarType::F32 => FfiType::F32,
            ScalarType::F64 => FfiType::F64,
        }
    }

    /// Parse from a string representation
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        let lower = s.to_lowercase();

        if let Some(inner) = generic_arg(&lower, "buffer_mut") {
            return BufferSpec::parse(inner, true).map(FfiType::Buffer);
        }
        if let Some(inner) = generic_arg(&lower, "buffer") {
            return BufferSpec::parse(inner, false).map(FfiType::Buffer);
        }
        if let Some(inner) = generic_arg(&lower, "out").or_else(|| generic_arg(&lower, "ref")) {
            return ScalarType::from_str(inner).map(FfiType::OutRef);
        }

        let lower = lower.replace(" *", "*");
        match lower.as_str() {
            "void" => Some(FfiType::Void),
            "ptr" | "pointer" | "void*" | "const void*" => Some(FfiType::Ptr),
            "cstr" | "string" | "char*" | "const char*" => Some(FfiType::CStr),
            other => match other.strip_suffix('*') {
                // C pointer spellings: `const T*` reads a buffer, `T*` writes one.
                // A bare `T*` may point at many elements, so it is never a
                // single out slot; `out<T>` must be asked for by name.
                Some(pointee) => match pointee.strip_prefix("const ") {
                    Some(elem) => ScalarType::from_str(elem)
                        .map(|s| FfiType::Buffer(BufferSpec::new(s))),
                    None => ScalarType::from_str(pointee)
                        .map(|s| FfiType::Buffer(BufferSpec::new(s).writable())),
                },
                None => ScalarType::from_str(other).map(FfiType::from_scalar),
            },
        }
    }
}

/// Extract `inner` from `name<inner>`
fn generic_arg<'a>(s: &'a str, name: &str) -> Option<&'a str> {
    let rest = s.strip_prefix(name)?.trim_start();
    let rest = rest.strip_prefix('<')?;
    rest.strip_suffix('>')
}

impl fmt::Display for FfiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiType::Void => write!(f, "void"),
            FfiType::Ptr => write!(f, "ptr"),
            FfiType::CStr => write!(f, "cstr"),
            FfiType::Buffer(spec) => write!(f, "{}", spec),
            FfiType::OutRef(scalar) => write!(f, "out<{}>", scalar),
            other => match other.scalar() {
                Some(scalar) => write!(f, "{}", scalar),
                None => Ok(()),
            },
        }
    }
}

/// A host-side value that can be passed to or returned from FFI functions
#[derive(Debug, Clone)]
pub enum FfiValue {
    /// No value (void return)
    Void,
    /// Absent value; marshals as a null pointer
    Null,
    /// Signed integer (covers all signed widths)
    Int(i64),
    /// Unsigned integer (covers all unsigned widths)
    UInt(u64),
    /// Floating point (covers f32 and f64)
    Float(f64),
    /// Raw pointer value
    Pointer(usize),
    /// Owned text (for CStr)
    Str(String),
    /// Host-owned contiguous numeric buffer
    Array(HostArray),
    /// Mutable scalar slot for by-reference output parameters
    Ref(Box<FfiValue>),
}

impl FfiValue {
    /// Create a by-reference slot holding `initial`
    pub fn out(initial: impl Into<FfiValue>) -> Self {
        FfiValue::Ref(Box::new(initial.into()))
    }

    /// Short kind name used in error messages
    pub fn kind(&self) -> String {
        match self {
            FfiValue::Void => "void".to_string(),
            FfiValue::Null => "null".to_string(),
            FfiValue::Int(_) => "int".to_string(),
            FfiValue::UInt(_) => "uint".to_string(),
            FfiValue::Float(_) => "float".to_string(),
            FfiValue::Pointer(_) => "pointer".to_string(),
            FfiValue::Str(_) => "text".to_string(),
            FfiValue::Array(a) => format!(
                "buffer<{}, shape={}>",
                a.elem(),
                format_shape(a.shape())
            ),
            FfiValue::Ref(inner) => format!("ref<{}>", inner.kind()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FfiValue::Int(v) => Some(*v),
            FfiValue::UInt(v) => Some(*v as i64),
            FfiValue::Ref(inner) => inner.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FfiValue::UInt(v) => Some(*v),
            FfiValue::Int(v) => Some(*v as u64),
            FfiValue::Ref(inner) => inner.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FfiValue::Float(v) => Some(*v),
            FfiValue::Int(v) => Some(*v as f64),
            FfiValue::UInt(v) => Some(*v as f64),
            FfiValue::Ref(inner) => inner.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FfiValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&HostArray> {
        match self {
            FfiValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Check if this is a void value
    pub fn is_void(&self) -> bool {
        matches!(self, FfiValue::Void)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FfiValue::Null)
    }
}

impl PartialEq for FfiValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FfiValue::Void, FfiValue::Void) | (FfiValue::Null, FfiValue::Null) => true,
            (FfiValue::Int(a), FfiValue::Int(b)) => a == b,
            (FfiValue::UInt(a), FfiValue::UInt(b)) => a == b,
            (FfiValue::Float(a), FfiValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FfiValue::Pointer(a), FfiValue::Pointer(b)) => a == b,
            (FfiValue::Str(a), FfiValue::Str(b)) => a == b,
            (FfiValue::Array(a), FfiValue::Array(b)) => a == b,
            (FfiValue::Ref(a), FfiValue::Ref(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from_scalar {
    ($variant:ident as $target:ty: $($t:ty),*) => {
        $(
            impl From<$t> for FfiValue {
                fn from(v: $t) -> Self {
                    FfiValue::$variant(v as $target)
                }
            }
        )*
    };
}

impl_from_scalar!(Int as i64: i8, i16, i32, i64, isize);
impl_from_scalar!(UInt as u64: u8, u16, u32, u64, usize);
impl_from_scalar!(Float as f64: f32, f64);

impl From<&str> for FfiValue {
    fn from(s: &str) -> Self {
        FfiValue::Str(s.to_string())
    }
}

impl From<String> for FfiValue {
    fn from(s: String) -> Self {
        FfiValue::Str(s)
    }
}

impl From<HostArray> for FfiValue {
    fn from(a: HostArray) -> Self {
        FfiValue::Array(a)
    }
}

impl<T: Into<FfiValue>> From<Option<T>> for FfiValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => FfiValue::Null,
        }
    }
}

impl fmt::Display for FfiValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FfiValue::Void => write!(f, "void"),
            FfiValue::Null => write!(f, "null"),
            FfiValue::Int(v) => write!(f, "{}", v),
            FfiValue::UInt(v) => write!(f, "{}", v),
            FfiValue::Float(v) => write!(f, "{}", v),
            FfiValue::Pointer(p) => write!(f, "{:#x}", p),
            FfiValue::Str(s) => write!(f, "{:?}", s),
            FfiValue::Array(a) => write!(f, "{}", a),
            FfiValue::Ref(inner) => write!(f, "&{}", inner),
        }
    }
}

/// Function signature for FFI calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiSignature {
    /// Exported symbol name
    pub name: String,
    /// Parameter types
    pub params: Vec<FfiType>,
    /// Return type
    pub return_type: FfiType,
    /// Whether this function is variadic
    pub variadic: bool,
}

impl FfiSignature {
    /// Create a new function signature
    pub fn new(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            variadic: false,
        }
    }

    /// Create a variadic function signature
    pub fn variadic(name: impl Into<String>, params: Vec<FfiType>, return_type: FfiType) -> Self {
        Self {
            name: name.into(),
            params,
            return_type,
            variadic: true,
        }
    }

    /// Validate argument count
    pub fn validate_args(&self, arg_count: usize) -> bool {
        if self.variadic {
            arg_count >= self.params.len()
        } else {
            arg_count == self.params.len()
        }
    }

    /// Parse from a C-style signature string
    /// Format: "return_type function_name(param1_type, param2_type, ...)"
    pub fn parse(signature: &str) -> Option<Self> {
        let signature = signature.trim().trim_end_matches(';');

        let paren_pos = signature.find('(')?;
        let before_paren = signature[..paren_pos].trim();
        let after_paren = signature[paren_pos + 1..].trim_end().strip_suffix(')')?;

        // Return type may itself contain spaces ("unsigned int", "const char*")
        let name_start = before_paren
            .rfind(|c: char| c.is_whitespace() || c == '*' || c == '>')
            .map(|i| i + 1)?;
        let name = before_paren[name_start..].trim();
        let return_type = FfiType::from_str(&before_paren[..name_start])?;
        if name.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut variadic = false;

        for param in split_top_level(after_paren) {
            let param = param.trim();
            if param.is_empty() || param == "void" {
                continue;
            }
            if param == "..." {
                variadic = true;
                continue;
            }
            params.push(parse_param(param)?);
        }

        Some(Self {
            name: name.to_string(),
            params,
            return_type,
            variadic,
        })
    }
}

/// Parse one parameter, with or without a trailing parameter name
fn parse_param(param: &str) -> Option<FfiType> {
    if let Some(ty) = FfiType::from_str(param) {
        return Some(ty);
    }
    // Drop the trailing identifier ("double x", "buffer<f64> arr")
    let cut = param.rfind(|c: char| c.is_whitespace() || c == '*' || c == '>')?;
    FfiType::from_str(&param[..=cut])
}

/// Split on commas that are not nested inside `<...>`
pub(crate) fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '<' | '(' => depth += 1,
            '>' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl fmt::Display for FfiSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.return_type, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param)?;
        }
        if self.variadic {
            if !self.params.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "...")?;
        }
        write!(f, ")")
    }
}
