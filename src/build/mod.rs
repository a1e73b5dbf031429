//! Extension builds
//!
//! Compiles the C sources of each `[[extension]]` in nativecall.toml into one
//! shared library using the host toolchain found by the `cc` crate.
//!
//! Artifact names carry the nativecall version and the target triple:
//!
//! ```text
//! lib<name>.nc<major><minor>-<target>.so       Linux and other ELF targets
//! lib<name>.nc<major><minor>-<target>.dylib    Apple targets
//! <name>.nc<major><minor>-<target>.dll         Windows
//! ```
//!
//! so loaders should locate them with [`discover_artifact`] rather than
//! building the name themselves.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ExtensionConfig, ProjectConfig};

/// Target triple this crate was compiled for
pub const TARGET: &str = env!("NC_TARGET");

/// Host triple this crate was compiled on
pub const HOST: &str = env!("NC_HOST");

/// Build errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No usable C compiler: {0}")]
    Compiler(String),

    #[error("Compiling extension '{extension}' failed ({status}):\n{stderr}")]
    CompileFailed {
        extension: String,
        status: String,
        stderr: String,
    },

    #[error("Extension '{0}' declares no sources")]
    NoSources(String),

    #[error("Source file for extension '{extension}' not found: {path}")]
    MissingSource { extension: String, path: PathBuf },

    #[error("No artifact for '{name}' in {dir}")]
    ArtifactNotFound { name: String, dir: PathBuf },

    #[error("Several artifacts match '{name}': {}", candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
}

/// Result type for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// A compiled shared library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Extension name
    pub name: String,
    /// Path to the shared library
    pub path: PathBuf,
}

/// Compiles extensions into shared libraries
#[derive(Debug, Clone)]
pub struct ExtensionBuilder {
    out_dir: PathBuf,
    opt_level: u8,
    compiler: Option<PathBuf>,
    target: String,
}

impl ExtensionBuilder {
    /// Builder writing artifacts to `out_dir`
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            opt_level: 2,
            compiler: None,
            target: TARGET.to_string(),
        }
    }

    /// Builder configured from a project's `[build]` section
    pub fn from_config(config: &ProjectConfig) -> Self {
        let builder = Self::new(config.out_dir()).opt_level(config.build.opt_level);
        match &config.build.compiler {
            Some(cc) => builder.compiler(cc),
            None => builder,
        }
    }

    pub fn opt_level(mut self, level: u8) -> Self {
        self.opt_level = level.min(3);
        self
    }

    /// Use `path` instead of the toolchain's default C compiler
    pub fn compiler(mut self, path: impl Into<PathBuf>) -> Self {
        self.compiler = Some(path.into());
        self
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// File name the artifact of extension `name` is written to
    pub fn artifact_filename(&self, name: &str) -> String {
        artifact_filename(name, &self.target)
    }

    /// Compile every extension declared in `config`
    pub fn build_all(&self, config: &ProjectConfig) -> BuildResult<Vec<Artifact>> {
        config
            .extensions
            .iter()
            .map(|ext| self.build(ext, &config.root))
            .collect()
    }

    /// Compile one extension; relative paths resolve against `root`
    pub fn build(&self, ext: &ExtensionConfig, root: &Path) -> BuildResult<Artifact> {
        if ext.sources.is_empty() {
            return Err(BuildError::NoSources(ext.name.clone()));
        }
        let resolve = |p: &str| {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            }
        };

        let sources: Vec<PathBuf> = ext.sources.iter().map(|s| resolve(s)).collect();
        if let Some(missing) = sources.iter().find(|s| !s.is_file()) {
            return Err(BuildError::MissingSource {
                extension: ext.name.clone(),
                path: missing.clone(),
            });
        }

        std::fs::create_dir_all(&self.out_dir)?;
        let output = self.out_dir.join(self.artifact_filename(&ext.name));
        let tool = self.tool()?;

        let mut cmd = tool.to_command();
        for dir in &ext.include_dirs {
            cmd.arg(format!("-I{}", resolve(dir).display()));
        }
        for define in &ext.defines {
            cmd.arg(format!("-D{}", define));
        }
        cmd.args(&ext.cflags);

        if tool.is_like_msvc() {
            cmd.arg("/LD")
                .arg(format!("/Fo{}\\", self.out_dir.display()))
                .arg(format!("/Fe{}", output.display()));
            cmd.args(&sources);
        } else {
            cmd.args(["-shared", "-fPIC"]);
            cmd.args(&sources);
            cmd.arg("-o").arg(&output);
        }

        info!(extension = %ext.name, output = %output.display(), "compiling extension");
        debug!(command = ?cmd, "compiler invocation");
        run(&mut cmd, &ext.name)?;

        Ok(Artifact {
            name: ext.name.clone(),
            path: output,
        })
    }

    fn tool(&self) -> BuildResult<cc::Tool> {
        let mut build = cc::Build::new();
        build
            .target(&self.target)
            .host(HOST)
            .opt_level(u32::from(self.opt_level))
            .debug(false)
            .cargo_metadata(false)
            .warnings(false);
        if let Some(compiler) = &self.compiler {
            build.compiler(compiler);
        }
        build
            .try_get_compiler()
            .map_err(|e| BuildError::Compiler(e.to_string()))
    }
}

fn run(cmd: &mut Command, extension: &str) -> BuildResult<()> {
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(());
    }
    Err(BuildError::CompileFailed {
        extension: extension.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Artifact file name of extension `name` built for `target`
pub fn artifact_filename(name: &str, target: &str) -> String {
    let tag = format!(
        "nc{}{}-{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        target
    );
    if target.contains("windows") {
        format!("{}.{}.dll", name, tag)
    } else if target.contains("apple") {
        format!("lib{}.{}.dylib", name, tag)
    } else {
        format!("lib{}.{}.so", name, tag)
    }
}

/// Find the single artifact for `name` in `dir`
pub fn discover_artifact(dir: impl AsRef<Path>, name: &str) -> BuildResult<Artifact> {
    discover_artifact_with(dir, name, false)
}

/// Find the artifact for `name` in `dir`.
///
/// Matches `lib<name>.<anything>.so` (and the dylib/dll forms) as well as
/// the bare `lib<name>.so`. Several matches are an error unless
/// `prefer_newest` is set, in which case the most recently modified wins.
pub fn discover_artifact_with(
    dir: impl AsRef<Path>,
    name: &str,
    prefer_newest: bool,
) -> BuildResult<Artifact> {
    let dir = dir.as_ref();
    let pattern = Regex::new(&format!(
        r"^(?:lib)?{}(?:\.[A-Za-z0-9_.-]+)?\.(?:so|dylib|dll)$",
        regex::escape(name)
    ))
    .map_err(|e| BuildError::ArtifactNotFound {
        name: format!("{} ({})", name, e),
        dir: dir.to_path_buf(),
    })?;

    let not_found = || BuildError::ArtifactNotFound {
        name: name.to_string(),
        dir: dir.to_path_buf(),
    };
    if !dir.is_dir() {
        return Err(not_found());
    }

    let mut matches: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !pattern.is_match(file_name) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            matches.push((entry.path(), modified));
        }
    }

    let path = match matches.len() {
        0 => return Err(not_found()),
        1 => matches.remove(0).0,
        _ if prefer_newest => {
            matches.sort_by_key(|(_, modified)| *modified);
            matches.pop().map(|(p, _)| p).ok_or_else(not_found)?
        }
        _ => {
            let mut candidates: Vec<String> = matches
                .iter()
                .filter_map(|(p, _)| p.file_name().map(|f| f.to_string_lossy().into_owned()))
                .collect();
            candidates.sort();
            return Err(BuildError::Ambiguous {
                name: name.to_string(),
                candidates,
            });
        }
    };

    debug!(name, path = %path.display(), "discovered artifact");
    Ok(Artifact {
        name: name.to_string(),
        path,
    })
}
