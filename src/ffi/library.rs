//! Loaded library with declared function signatures
//!
//! A [`Library`] moves through `open` → `bind`* → `call`* → `close`. Binding
//! is the one unchecked step: the declared signature is trusted to match the
//! compiled function, and nothing at runtime can confirm it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::invoke::invoke;
use super::loader::DynamicLibrary;
use super::marshal::marshal;
use super::registry::{FfiError, FfiResult};
use super::types::{FfiSignature, FfiValue};

/// Per-library call behaviour
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Reject integer arguments that do not fit the declared width instead
    /// of truncating them
    pub strict_scalars: bool,
}

impl Default for CallOptions {
    /// Truncating calls, unless the crate is built with `strict-scalars`
    fn default() -> Self {
        Self {
            strict_scalars: cfg!(feature = "strict-scalars"),
        }
    }
}

impl CallOptions {
    /// Options that never truncate
    pub fn strict() -> Self {
        Self {
            strict_scalars: true,
        }
    }
}

/// A bound native function
#[derive(Debug)]
struct BoundFunction {
    signature: FfiSignature,
    addr: usize,
    calls: AtomicU64,
}

/// A loaded shared library and the signatures declared for it
pub struct Library {
    name: String,
    handle: DynamicLibrary,
    options: CallOptions,
    functions: RwLock<HashMap<String, Arc<BoundFunction>>>,
}

impl Library {
    /// Open the shared library at `path`
    pub fn open(path: impl AsRef<Path>) -> FfiResult<Self> {
        Self::open_with(path, CallOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: CallOptions) -> FfiResult<Self> {
        let path = path.as_ref();
        let handle = DynamicLibrary::load(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_handle(name, handle, options))
    }

    pub(crate) fn from_handle(
        name: impl Into<String>,
        handle: DynamicLibrary,
        options: CallOptions,
    ) -> Self {
        Self {
            name: name.into(),
            handle,
            options,
            functions: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.handle.path()
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Declare the signature of an exported function.
    ///
    /// Resolves the symbol and checks that the declaration is well formed.
    /// Binding a name again replaces its previous declaration.
    ///
    /// # Safety
    ///
    /// `signature` must describe the compiled function exactly: parameter
    /// count, order, widths and signedness, and the return type. This cannot
    /// be checked. A wrong declaration makes every later [`Library::call`]
    /// of that function undefined behaviour, typically memory corruption or
    /// a crash.
    pub unsafe fn bind(&self, signature: FfiSignature) -> FfiResult<()> {
        if !signature.return_type.is_valid_return() {
            return Err(FfiError::InvalidSignature(format!(
                "{}: {} cannot be returned by value",
                signature.name, signature.return_type
            )));
        }
        if let Some(void_param) = signature
            .params
            .iter()
            .position(|p| *p == super::types::FfiType::Void)
        {
            return Err(FfiError::InvalidSignature(format!(
                "{}: parameter {} is declared void",
                signature.name, void_param
            )));
        }

        let addr = self.handle.symbol(&signature.name)?;
        debug!(library = %self.name, %signature, "bound function");

        let bound = BoundFunction {
            signature,
            addr,
            calls: AtomicU64::new(0),
        };
        self.functions
            .write()
            .insert(bound.signature.name.clone(), Arc::new(bound));
        Ok(())
    }

    /// Bind every signature in `signatures`, stopping at the first failure.
    ///
    /// Returns the number of functions bound.
    ///
    /// # Safety
    ///
    /// Same contract as [`Library::bind`] for each signature.
    pub unsafe fn bind_all(
        &self,
        signatures: impl IntoIterator<Item = FfiSignature>,
    ) -> FfiResult<usize> {
        let mut count = 0;
        for signature in signatures {
            self.bind(signature)?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether `name` has a declared signature
    pub fn is_bound(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// The declared signature of `name`
    pub fn signature(&self, name: &str) -> Option<FfiSignature> {
        self.functions.read().get(name).map(|f| f.signature.clone())
    }

    /// All declared signatures, sorted by name
    pub fn bound_functions(&self) -> Vec<FfiSignature> {
        let mut sigs: Vec<FfiSignature> = self
            .functions
            .read()
            .values()
            .map(|f| f.signature.clone())
            .collect();
        sigs.sort_by(|a, b| a.name.cmp(&b.name));
        sigs
    }

    /// Number of native calls made through `name`.
    ///
    /// Calls rejected during marshalling are not counted.
    pub fn call_count(&self, name: &str) -> Option<u64> {
        self.functions
            .read()
            .get(name)
            .map(|f| f.calls.load(Ordering::Relaxed))
    }

    /// Call a bound function.
    ///
    /// Arguments are marshalled against the declared signature first; a
    /// count, type or shape violation is returned before any native code
    /// runs. `FfiValue::Ref` arguments hold the callee's output afterwards.
    /// The slice stays mutably borrowed for the whole call, so no buffer in
    /// it can move or change underneath the callee.
    pub fn call(&self, name: &str, args: &mut [FfiValue]) -> FfiResult<FfiValue> {
        let function = self
            .functions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| FfiError::FunctionNotFound(format!("{}:{}", self.name, name)))?;

        let signature = &function.signature;
        if !signature.validate_args(args.len()) {
            return Err(FfiError::InvalidArgCount {
                function: signature.name.clone(),
                expected: signature.params.len(),
                got: args.len(),
            });
        }

        let marshalled = marshal(signature, args, self.options.strict_scalars)?;
        trace!(function = name, args = args.len(), "calling native function");

        // Safety: the signature was vouched for by the caller of `bind`, and
        // every pointer in `marshalled` borrows from `args` or from
        // `marshalled` itself, both of which outlive the call.
        let result = unsafe { invoke(function.addr, &signature.return_type, &marshalled) }?;
        function.calls.fetch_add(1, Ordering::Relaxed);

        marshalled.write_back(args);
        Ok(result)
    }

    /// Release the library.
    ///
    /// Consumes the handle, so nothing resolved from it can be called
    /// afterwards.
    pub fn close(self) -> FfiResult<()> {
        debug!(library = %self.name, "closing library");
        drop(self.functions);
        self.handle.close()
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library")
            .field("name", &self.name)
            .field("path", &self.handle.path())
            .field("bound", &self.functions.read().len())
            .finish()
    }
}
