//! nativecall - Calling compiled C from Rust through declared signatures
//!
//! Loads a C-ABI shared library at runtime, binds exported functions to
//! signatures declared as data, and calls them with dynamically typed
//! values. Scalars, contiguous `ndarray` buffers, NUL-terminated text,
//! by-reference output slots and null pointers are marshalled according to
//! the declared types; buffer shape and element type violations are caught
//! before any native code runs.
//!
//! # Features
//!
//! - **Runtime binding**: signatures from strings, `.ffi` files or C headers
//! - **Checked buffers**: element type, ndim, shape and contiguity constraints
//! - **Heterogeneous calls**: any mix of integer, float and pointer arguments via libffi
//! - **Extension builds**: compile C sources described in `nativecall.toml` with the host toolchain
//!
//! # Example
//!
//! ```no_run
//! use nativecall::{build, FfiSignature, FfiValue, Library};
//!
//! // Artifact names depend on the platform; find it instead of hardcoding it
//! let artifact = build::discover_artifact("build", "demo")?;
//! let lib = Library::open(&artifact.path)?;
//!
//! let sig = FfiSignature::parse("i32 divmod(i32, i32, out<i32>)").unwrap();
//! unsafe { lib.bind(sig)? };
//!
//! let mut args = [FfiValue::from(17), FfiValue::from(5), FfiValue::out(0i32)];
//! let quotient = lib.call("divmod", &mut args)?;
//! assert_eq!(quotient.as_i64(), Some(3));
//! assert_eq!(args[2].as_i64(), Some(2));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  nativecall.toml │  [[extension]] sources, flags, signatures
//! └────────┬─────────┘
//!          │ build::ExtensionBuilder (cc)
//!          ▼
//! ┌──────────────────┐
//! │  lib<name>.nc…so │  found by build::discover_artifact
//! └────────┬─────────┘
//!          │ ffi::Library::open / bind / call
//!          ▼
//! ┌──────────────────┐
//! │   Native Code    │  libffi call with marshalled arguments
//! └──────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod build;
pub mod config;
pub mod ffi;

pub use build::{discover_artifact, Artifact, BuildError, ExtensionBuilder};
pub use config::{ConfigError, ProjectConfig};
pub use ffi::{
    BufferSpec, CallOptions, DynamicLibrary, FfiError, FfiRegistry, FfiResult, FfiSignature,
    FfiType, FfiValue, HeaderParser, HostArray, Library, LibraryLoader, ScalarType,
    SignatureFile,
};

/// Version of nativecall
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
