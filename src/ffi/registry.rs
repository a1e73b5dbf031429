//! FFI Registry
//!
//! Process-scoped table of named libraries. Libraries enter the registry on
//! `load_library` and leave it on `unload` or `shutdown`; nothing is loaded
//! implicitly.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::library::{CallOptions, Library};
use super::loader::LibraryLoader;
use super::types::{FfiSignature, FfiValue};

/// Error type for FFI operations
#[derive(Debug, Clone, Error)]
pub enum FfiError {
    /// Failed to load a library
    #[error("Load error: {0}")]
    LoadError(String),

    /// Symbol not found in library
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// Invalid symbol name
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    /// Library not registered
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    /// Function was never bound
    #[error("Function not bound: {0}")]
    FunctionNotFound(String),

    /// Invalid argument count
    #[error("Invalid argument count for '{function}': expected {expected}, got {got}")]
    InvalidArgCount {
        function: String,
        expected: usize,
        got: usize,
    },

    /// A buffer argument violates its declared element type, ndim, shape or layout
    #[error("Shape error in '{function}' argument {index}: expected {expected}, got {actual}")]
    ShapeError {
        function: String,
        index: usize,
        expected: String,
        actual: String,
    },

    /// An argument has the wrong kind, encoding or range for its declared type
    #[error("Type error in '{function}' argument {index}: expected {expected}, got {actual}")]
    TypeError {
        function: String,
        index: usize,
        expected: String,
        actual: String,
    },

    /// Malformed or unsupported signature declaration
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Signature file or header parse error
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Result type for FFI operations.
pub type FfiResult<T> = Result<T, FfiError>;

/// FFI Registry - named libraries shared across the process
pub struct FfiRegistry {
    /// Library loader
    loader: LibraryLoader,
    /// Options applied to newly loaded libraries
    options: CallOptions,
    /// Loaded libraries by registry name
    libraries: HashMap<String, Arc<Library>>,
}

impl FfiRegistry {
    /// Create a new FFI registry
    pub fn new() -> Self {
        Self {
            loader: LibraryLoader::new(),
            options: CallOptions::default(),
            libraries: HashMap::new(),
        }
    }

    /// Create a registry whose libraries use `options`
    pub fn with_options(options: CallOptions) -> Self {
        Self {
            options,
            ..Self::new()
        }
    }

    /// Add a search path for libraries
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.loader.add_search_path(path);
    }

    /// Load a library from a path or search for it by name.
    ///
    /// Loading a name that is already registered returns the existing handle.
    pub fn load_library(&mut self, name: &str, path: Option<&str>) -> FfiResult<Arc<Library>> {
        if let Some(lib) = self.libraries.get(name) {
            return Ok(Arc::clone(lib));
        }

        let handle = self.loader.load(path.unwrap_or(name))?;
        let library = Arc::new(Library::from_handle(name, handle, self.options.clone()));
        self.libraries.insert(name.to_string(), Arc::clone(&library));
        debug!(library = name, "registered library");
        Ok(library)
    }

    /// Get a loaded library
    pub fn get(&self, name: &str) -> Option<Arc<Library>> {
        self.libraries.get(name).cloned()
    }

    /// Declare a function's signature in a registered library.
    ///
    /// # Safety
    ///
    /// Same contract as [`Library::bind`]: the declaration must match the
    /// compiled native function.
    pub unsafe fn bind(&self, library: &str, signature: FfiSignature) -> FfiResult<()> {
        let lib = self
            .get(library)
            .ok_or_else(|| FfiError::LibraryNotFound(library.to_string()))?;
        lib.bind(signature)
    }

    /// Call a function by qualified name (library:function)
    pub fn call(&self, qualified_name: &str, args: &mut [FfiValue]) -> FfiResult<FfiValue> {
        let (library_name, function_name) = qualified_name
            .split_once(':')
            .ok_or_else(|| FfiError::FunctionNotFound(qualified_name.to_string()))?;

        let library = self
            .get(library_name)
            .ok_or_else(|| FfiError::LibraryNotFound(library_name.to_string()))?;
        library.call(function_name, args)
    }

    /// Drop the registry's handle on a library.
    ///
    /// The image is unmapped once the last outstanding `Arc<Library>` is
    /// dropped.
    pub fn unload(&mut self, name: &str) -> bool {
        let removed = self.libraries.remove(name).is_some();
        if removed {
            debug!(library = name, "unregistered library");
        }
        removed
    }

    /// Unregister every library
    pub fn shutdown(&mut self) {
        self.libraries.clear();
    }

    /// List qualified names of all bound functions
    pub fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .libraries
            .iter()
            .flat_map(|(lib_name, lib)| {
                lib.bound_functions()
                    .into_iter()
                    .map(move |sig| format!("{}:{}", lib_name, sig.name))
            })
            .collect();
        names.sort();
        names
    }

    /// List all loaded libraries
    pub fn list_libraries(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.libraries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for FfiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: Lazy<RwLock<FfiRegistry>> =
    Lazy::new(|| RwLock::new(FfiRegistry::new()));

/// The process-wide registry, created on first access.
///
/// Loading and unloading take the write lock. Calls only need `read()`, so
/// native calls from different threads run side by side; a caller that
/// wants no lock at all during the call can clone the `Arc<Library>` from
/// [`FfiRegistry::get`] and call through that.
pub fn global() -> &'static RwLock<FfiRegistry> {
    &GLOBAL_REGISTRY
}
