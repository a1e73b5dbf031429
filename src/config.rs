//! Project Configuration
//!
//! Handles parsing and management of nativecall.toml manifests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ffi::{CallOptions, FfiError, FfiSignature, HeaderParser, SignatureFile};

/// Manifest file name searched for by [`ProjectConfig::find_and_load`].
pub const MANIFEST_NAME: &str = "nativecall.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid extension '{name}': {reason}")]
    InvalidExtension { name: String, reason: String },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching nativecall.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    /// Package metadata
    #[serde(default)]
    pub package: PackageConfig,

    /// Build configuration
    #[serde(default)]
    pub build: BuildConfig,

    /// Native extensions, one shared library each
    #[serde(default, rename = "extension")]
    pub extensions: Vec<ExtensionConfig>,

    /// Loading and calling behaviour
    #[serde(default)]
    pub ffi: FfiConfig,

    /// Directory holding the manifest; relative paths resolve against it
    #[serde(skip)]
    pub root: PathBuf,
}

impl ProjectConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: ProjectConfig = toml::from_str(&content)?;
        config.root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(MANIFEST_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Err(ConfigError::NotFound(format!(
                    "{} in {} or any parent directory",
                    MANIFEST_NAME,
                    start_dir.display()
                )));
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve a manifest-relative path.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Absolute output directory for built artifacts.
    pub fn out_dir(&self) -> PathBuf {
        self.resolve(&self.build.out_dir)
    }

    /// Look up an extension by name.
    pub fn extension(&self, name: &str) -> Option<&ExtensionConfig> {
        self.extensions.iter().find(|e| e.name == name)
    }

    /// Call options for libraries loaded under this configuration.
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            strict_scalars: self.ffi.strict_scalars || cfg!(feature = "strict-scalars"),
        }
    }

    /// Header parser that strips the configured export macros.
    pub fn header_parser(&self) -> HeaderParser {
        self.ffi
            .export_macros
            .iter()
            .fold(HeaderParser::new(), |parser, name| parser.with_export_macro(name))
    }

    /// Signatures declared for an extension, from its `.ffi` file or header.
    ///
    /// A signature file takes precedence over a header when both are given.
    pub fn signatures(&self, ext: &ExtensionConfig) -> Result<Vec<FfiSignature>, FfiError> {
        if let Some(file) = &ext.signatures {
            return Ok(SignatureFile::parse_file(self.resolve(file))?
                .into_iter()
                .collect());
        }
        if let Some(header) = &ext.header {
            return self.header_parser().parse_file(self.resolve(header));
        }
        Ok(Vec::new())
    }

    fn validate(&self) -> ConfigResult<()> {
        let mut seen = BTreeMap::new();
        for ext in &self.extensions {
            if ext.name.is_empty()
                || !ext
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(ConfigError::InvalidExtension {
                    name: ext.name.clone(),
                    reason: "names may only contain letters, digits and '_'".to_string(),
                });
            }
            if seen.insert(ext.name.as_str(), ()).is_some() {
                return Err(ConfigError::InvalidExtension {
                    name: ext.name.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Package metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageConfig {
    /// Package name
    #[serde(default = "default_package_name")]
    pub name: String,

    /// Package version
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_package_name() -> String {
    "nativecall-project".to_string()
}

fn default_version() -> String {
    "0.1.0".to_string()
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            name: default_package_name(),
            version: default_version(),
        }
    }
}

/// Build configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Output directory for built artifacts
    #[serde(default = "default_out_dir")]
    pub out_dir: String,

    /// Optimization level passed to the C compiler (0-3)
    #[serde(default = "default_opt_level")]
    pub opt_level: u8,

    /// Compiler executable overriding the toolchain default
    #[serde(default)]
    pub compiler: Option<String>,
}

fn default_out_dir() -> String {
    "build".to_string()
}

fn default_opt_level() -> u8 {
    2
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            opt_level: default_opt_level(),
            compiler: None,
        }
    }
}

/// One native extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Extension name; the artifact is `lib<name>.nc…`
    pub name: String,

    /// C source files
    #[serde(default)]
    pub sources: Vec<String>,

    /// Extra include directories
    #[serde(default)]
    pub include_dirs: Vec<String>,

    /// Preprocessor definitions (`NAME` or `NAME=VALUE`)
    #[serde(default)]
    pub defines: Vec<String>,

    /// Additional compiler flags
    #[serde(default)]
    pub cflags: Vec<String>,

    /// C header declaring the exported functions
    #[serde(default)]
    pub header: Option<String>,

    /// `.ffi` signature file
    #[serde(default)]
    pub signatures: Option<String>,
}

/// FFI settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfiConfig {
    /// Extra directories searched when loading by name
    #[serde(default)]
    pub search_paths: Vec<String>,

    /// Reject out-of-range scalars instead of truncating
    #[serde(default)]
    pub strict_scalars: bool,

    /// Export macros stripped when parsing headers
    #[serde(default)]
    pub export_macros: Vec<String>,
}
