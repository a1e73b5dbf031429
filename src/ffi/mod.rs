//! FFI Module
//!
//! Calls C-ABI functions in shared libraries using signatures declared at
//! runtime.
//!
//! # Architecture
//!
//! ```text
//! Library::open("libdemo.so")          Loader     (libloading)
//!       │
//!       ▼
//! unsafe { lib.bind(signature) }       Binder     (declared, unchecked)
//!       │
//!       ▼
//! lib.call("sum_array", &mut args)
//!       │
//!       ├── marshal                    Marshaller (type/shape checks)
//!       │
//!       ▼
//! invoke                               Invoker    (libffi)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nativecall::ffi::{FfiSignature, FfiValue, Library};
//! use ndarray::Array1;
//!
//! let lib = Library::open("./build/libsum_array.so")?;
//! let sig = FfiSignature::parse("f64 sum_array(buffer<f64, ndim=1>, usize)").unwrap();
//! // Safety: matches `double sum_array(const double *arr, size_t n)`
//! unsafe { lib.bind(sig)? };
//!
//! let data = Array1::linspace(0.0, 1.0, 100_000);
//! let n = data.len();
//! let total = lib.call("sum_array", &mut [FfiValue::from(data), FfiValue::from(n)])?;
//! assert!((total.as_f64().unwrap() - 50_000.0).abs() < 1e-6);
//! # Ok::<(), nativecall::ffi::FfiError>(())
//! ```

mod array;
pub mod header;
mod invoke;
mod library;
mod loader;
mod marshal;
pub mod registry;
pub mod sigfile;
mod types;

pub use array::HostArray;
pub use header::HeaderParser;
pub use library::{CallOptions, Library};
pub use loader::{library_filename, DynamicLibrary, LibraryLoader};
pub use registry::{FfiError, FfiRegistry, FfiResult};
pub use sigfile::SignatureFile;
pub use types::{BufferSpec, FfiSignature, FfiType, FfiValue, ScalarType};
