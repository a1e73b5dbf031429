//! Dynamic Library Loader
//!
//! Safe wrapper around libloading for opening shared libraries and resolving
//! unmangled symbols.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::debug;

use super::FfiError;

/// A dynamically loaded library
pub struct DynamicLibrary {
    /// Path to the library
    path: PathBuf,
    /// The loaded library handle
    library: Library,
}

impl DynamicLibrary {
    /// Load a library from the given path
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FfiError> {
        let path = path.as_ref().to_path_buf();

        // dlopen would fall back to the system search path for bare names;
        // an explicit path that does not exist is always a load failure.
        if path.components().count() > 1 && !path.exists() {
            return Err(FfiError::LoadError(format!(
                "Failed to load library '{}': no such file",
                path.display()
            )));
        }

        // Safety: loading runs the library's static initializers. We trust
        // the caller to hand us a library they intend to execute.
        let library = unsafe {
            Library::new(&path).map_err(|e| {
                FfiError::LoadError(format!(
                    "Failed to load library '{}': {}",
                    path.display(),
                    e
                ))
            })?
        };

        debug!(path = %path.display(), "loaded shared library");
        Ok(Self { path, library })
    }

    /// Get the path to this library
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the address of an exported symbol by its plain (unmangled) name
    pub fn symbol(&self, name: &str) -> Result<usize, FfiError> {
        let c_name = CString::new(name)
            .map_err(|_| FfiError::InvalidSymbol(format!("Invalid symbol name: {:?}", name)))?;

        // Safety: only the address is read out; the caller decides how the
        // code behind it is typed.
        let symbol: Symbol<*const ()> = unsafe {
            self.library.get(c_name.as_bytes_with_nul()).map_err(|e| {
                FfiError::SymbolNotFound(format!(
                    "Symbol '{}' not found in '{}': {}",
                    name,
                    self.path.display(),
                    e
                ))
            })?
        };

        let addr = *symbol as usize;
        if addr == 0 {
            return Err(FfiError::SymbolNotFound(format!(
                "Symbol '{}' in '{}' resolves to null",
                name,
                self.path.display()
            )));
        }
        Ok(addr)
    }

    /// Unmap the library
    pub fn close(self) -> Result<(), FfiError> {
        let path = self.path;
        self.library.close().map_err(|e| {
            FfiError::LoadError(format!(
                "Failed to unload library '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

impl std::fmt::Debug for DynamicLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// Library loader with search paths
#[derive(Debug, Clone)]
pub struct LibraryLoader {
    /// Search paths for libraries
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    /// Create a new library loader
    pub fn new() -> Self {
        Self {
            search_paths: default_search_paths(),
        }
    }

    /// Add a search path (searched before the defaults)
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.search_paths.insert(0, path.as_ref().to_path_buf());
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find a library by path or name
    pub fn find_library(&self, name: &str) -> Option<PathBuf> {
        // If it's already a path, check if it exists
        let path = Path::new(name);
        if path.exists() {
            return Some(path.to_path_buf());
        }

        let lib_name = library_filename(name);
        self.search_paths
            .iter()
            .map(|dir| dir.join(&lib_name))
            .find(|candidate| candidate.exists())
    }

    /// Locate and open a library
    pub fn load(&self, name: &str) -> Result<DynamicLibrary, FfiError> {
        match self.find_library(name) {
            Some(path) => DynamicLibrary::load(path),
            // Anything that looks like a path is reported as-is
            None if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') => {
                DynamicLibrary::load(name)
            }
            // Last resort: the system linker's own search (ld.so.cache etc.)
            None => DynamicLibrary::load(library_filename(name)).map_err(|_| {
                FfiError::LoadError(format!(
                    "Library '{}' not found (looked for '{}' in {} search paths)",
                    name,
                    library_filename(name),
                    self.search_paths.len()
                ))
            }),
        }
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Get the default library search paths for this platform
fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(ld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(dyld_path.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));
        paths.push(PathBuf::from("/usr/lib"));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(path) = std::env::var("PATH") {
            paths.extend(path.split(';').filter(|p| !p.is_empty()).map(PathBuf::from));
        }
        paths.push(PathBuf::from("C:\\Windows\\System32"));
    }

    paths
}

/// Construct the platform-specific library filename
pub fn library_filename(name: &str) -> String {
    #[cfg(target_os = "linux")]
    {
        if name.starts_with("lib") && name.contains(".so") {
            name.to_string()
        } else {
            format!("lib{}.so", name)
        }
    }

    #[cfg(target_os = "macos")]
    {
        if name.starts_with("lib") && name.ends_with(".dylib") {
            name.to_string()
        } else {
            format!("lib{}.dylib", name)
        }
    }

    #[cfg(target_os = "windows")]
    {
        if name.ends_with(".dll") {
            name.to_string()
        } else {
            format!("{}.dll", name)
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        name.to_string()
    }
}
