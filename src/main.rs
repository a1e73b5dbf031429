//! nativecall - Call compiled C functions from the command line
//!
//! Main CLI entry point for building extensions, inspecting signatures and
//! calling exported functions.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use nativecall::build::{discover_artifact_with, ExtensionBuilder};
use nativecall::config::ProjectConfig;
use nativecall::ffi::{
    library_filename, BufferSpec, CallOptions, FfiSignature, FfiType, FfiValue, HeaderParser,
    HostArray, Library, LibraryLoader, SignatureFile,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nc")]
#[command(version)]
#[command(about = "Build C extensions and call them through declared signatures", long_about = None)]
struct Cli {
    /// Path to nativecall.toml (default: search upward from the current directory)
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); overrides NC_LOG
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the extensions declared in nativecall.toml
    Build {
        /// Only build these extensions
        #[arg(short, long = "ext")]
        extensions: Vec<String>,

        /// Output directory (overrides [build] out_dir)
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },

    /// Load a library, bind one function and call it
    Call {
        /// Library path, extension name, or system library name
        library: String,

        /// Full signature ("f64 add(f64, f64)") or a function name looked up
        /// in --signatures / --header
        function: String,

        /// Arguments; buffers as "1,2,3" (or "[-1,2,3]" when the first
        /// element is negative), null pointers as "null"
        #[arg(allow_negative_numbers = true)]
        args: Vec<String>,

        /// `.ffi` file declaring the function
        #[arg(long)]
        signatures: Option<PathBuf>,

        /// C header declaring the function
        #[arg(long)]
        header: Option<PathBuf>,

        /// Export macro to strip from --header (repeatable)
        #[arg(long = "export-macro")]
        export_macros: Vec<String>,

        /// Reject out-of-range integers instead of truncating
        #[arg(long)]
        strict: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Report call time
        #[arg(long)]
        time: bool,
    },

    /// Print the signatures declared in a .ffi file or C header
    Inspect {
        /// `.ffi` file or C header
        input: PathBuf,

        /// Export macro to strip from headers (repeatable)
        #[arg(long = "export-macro")]
        export_macros: Vec<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Locate the built artifact of an extension
    Find {
        /// Extension name
        name: String,

        /// Directory to search (default: the manifest's out_dir, or ./build)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Pick the newest match instead of failing on several
        #[arg(long)]
        newest: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Build {
            extensions,
            out_dir,
        } => cmd_build(cli.manifest.as_deref(), &extensions, out_dir),
        Commands::Call {
            library,
            function,
            args,
            signatures,
            header,
            export_macros,
            strict,
            json,
            time,
        } => cmd_call(
            cli.manifest.as_deref(),
            CallRequest {
                library: &library,
                function: &function,
                args: &args,
                signatures: signatures.as_deref(),
                header: header.as_deref(),
                export_macros: &export_macros,
                strict,
                json,
                time,
            },
        ),
        Commands::Inspect {
            input,
            export_macros,
            json,
        } => cmd_inspect(&input, &export_macros, json),
        Commands::Find { name, dir, newest } => {
            cmd_find(cli.manifest.as_deref(), &name, dir, newest)
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("NC_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load the manifest named on the command line, or search for one.
///
/// Returns `None` when no manifest was requested and none exists.
fn load_manifest(path: Option<&Path>) -> Result<Option<ProjectConfig>> {
    match path {
        Some(path) => ProjectConfig::load(path)
            .map(Some)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            match ProjectConfig::find_and_load(&cwd) {
                Ok(config) => Ok(Some(config)),
                Err(nativecall::ConfigError::NotFound(_)) => Ok(None),
                Err(e) => Err(e).context("Failed to load nativecall.toml"),
            }
        }
    }
}

fn cmd_build(manifest: Option<&Path>, only: &[String], out_dir: Option<PathBuf>) -> Result<()> {
    let config = load_manifest(manifest)?
        .ok_or_else(|| anyhow!("No nativecall.toml found in this directory or its parents"))?;

    let mut builder = ExtensionBuilder::from_config(&config);
    if let Some(dir) = out_dir {
        builder = ExtensionBuilder::new(dir).opt_level(config.build.opt_level);
        if let Some(cc) = &config.build.compiler {
            builder = builder.compiler(cc);
        }
    }

    for name in only {
        if config.extension(name).is_none() {
            bail!("Extension '{}' is not declared in the manifest", name);
        }
    }

    let start = Instant::now();
    let mut built = 0;
    for ext in &config.extensions {
        if !only.is_empty() && !only.contains(&ext.name) {
            continue;
        }
        let artifact = builder
            .build(ext, &config.root)
            .with_context(|| format!("Failed to build extension '{}'", ext.name))?;
        println!("Built {} -> {}", artifact.name, artifact.path.display());
        built += 1;
    }

    println!(
        "{} extension(s) built for {} in {:.2?}",
        built,
        builder.target(),
        start.elapsed()
    );
    Ok(())
}

struct CallRequest<'a> {
    library: &'a str,
    function: &'a str,
    args: &'a [String],
    signatures: Option<&'a Path>,
    header: Option<&'a Path>,
    export_macros: &'a [String],
    strict: bool,
    json: bool,
    time: bool,
}

fn cmd_call(manifest: Option<&Path>, req: CallRequest<'_>) -> Result<()> {
    let config = load_manifest(manifest)?;

    let mut options = config
        .as_ref()
        .map(ProjectConfig::call_options)
        .unwrap_or_default();
    if req.strict {
        options = CallOptions::strict();
    }

    let path = resolve_library(config.as_ref(), req.library)?;
    let lib = Library::open_with(&path, options)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let signature = resolve_signature(config.as_ref(), &req)?;
    let name = signature.name.clone();
    let params = signature.params.clone();

    // Safety: the declaration is the user's claim about the native function.
    unsafe { lib.bind(signature) }.with_context(|| format!("Failed to bind '{}'", name))?;

    if req.args.len() < params.len() {
        bail!(
            "'{}' takes {} argument(s), {} given",
            name,
            params.len(),
            req.args.len()
        );
    }
    let mut args = req
        .args
        .iter()
        .enumerate()
        .map(|(i, text)| match params.get(i) {
            Some(ty) => parse_arg(text, ty).with_context(|| format!("Argument {}", i)),
            None => Ok(guess_arg(text)),
        })
        .collect::<Result<Vec<_>>>()?;

    let start = Instant::now();
    let result = lib
        .call(&name, &mut args)
        .with_context(|| format!("Call to '{}' failed", name))?;
    let elapsed = start.elapsed();

    // By-reference outputs and writable buffers hold results after the call
    let outputs: Vec<(usize, &FfiValue)> = args
        .iter()
        .enumerate()
        .filter(|(i, _)| {
            matches!(
                params.get(*i),
                Some(FfiType::OutRef(_)) | Some(FfiType::Buffer(BufferSpec { writable: true, .. }))
            )
        })
        .collect();

    if req.json {
        let report = serde_json::json!({
            "function": name,
            "result": to_json(&result),
            "outputs": outputs
                .iter()
                .map(|(i, v)| serde_json::json!({ "index": i, "value": to_json(v) }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", result);
        for (i, value) in &outputs {
            println!("arg[{}] = {}", i, value);
        }
    }
    if req.time {
        eprintln!("call took {:.2?}", elapsed);
    }

    lib.close().context("Failed to unload library")?;
    Ok(())
}

/// Path of a library given as a path, an extension name, or a system name
fn resolve_library(config: Option<&ProjectConfig>, library: &str) -> Result<PathBuf> {
    let as_path = Path::new(library);
    if as_path.exists() {
        return Ok(as_path.to_path_buf());
    }

    if let Some(config) = config {
        if config.extension(library).is_some() {
            let artifact = discover_artifact_with(config.out_dir(), library, true)
                .with_context(|| format!("Extension '{}' has not been built", library))?;
            return Ok(artifact.path);
        }
    }

    let mut loader = LibraryLoader::new();
    if let Some(config) = config {
        for dir in &config.ffi.search_paths {
            loader.add_search_path(config.resolve(dir));
        }
    }
    // Unresolved names go to the system linker's own search
    Ok(loader
        .find_library(library)
        .unwrap_or_else(|| PathBuf::from(library_filename(library))))
}

fn resolve_signature(config: Option<&ProjectConfig>, req: &CallRequest<'_>) -> Result<FfiSignature> {
    if req.function.contains('(') {
        return FfiSignature::parse(req.function)
            .ok_or_else(|| anyhow!("Could not parse signature '{}'", req.function));
    }

    let mut candidates: Vec<FfiSignature> = Vec::new();
    if let Some(path) = req.signatures {
        candidates.extend(
            SignatureFile::parse_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        );
    }
    if let Some(path) = req.header {
        let parser = req.export_macros.iter().fold(
            config.map(ProjectConfig::header_parser).unwrap_or_default(),
            |parser, name| parser.with_export_macro(name),
        );
        candidates.extend(
            parser
                .parse_file(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
        );
    }
    if req.signatures.is_none() && req.header.is_none() {
        if let Some(config) = config {
            if let Some(ext) = config.extension(req.library) {
                candidates.extend(config.signatures(ext)?);
            }
        }
    }

    candidates
        .into_iter()
        .find(|sig| sig.name == req.function)
        .ok_or_else(|| {
            anyhow!(
                "No signature declared for '{}'; pass a full signature or --signatures/--header",
                req.function
            )
        })
}

/// Convert command-line text into a value for a parameter of type `ty`
fn parse_arg(text: &str, ty: &FfiType) -> Result<FfiValue> {
    let text = text.trim();
    if text == "null" && ty.is_pointer() {
        return Ok(FfiValue::Null);
    }

    Ok(match ty {
        FfiType::Void => bail!("void parameters cannot take a value"),
        FfiType::F32 | FfiType::F64 => FfiValue::Float(parse_float(text)?),
        FfiType::CStr => FfiValue::Str(text.to_string()),
        FfiType::Ptr => match text.strip_prefix("0x") {
            Some(hex) => FfiValue::Pointer(
                usize::from_str_radix(hex, 16).with_context(|| format!("Bad pointer '{}'", text))?,
            ),
            None => bail!("Pointers must be 'null' or hexadecimal, got '{}'", text),
        },
        FfiType::Buffer(spec) => {
            // Integer elements never pass through f64, so 64-bit values stay exact
            let array = if spec.elem.is_float() {
                HostArray::from_f64s(spec.elem, &parse_list(text, parse_float)?)
            } else {
                HostArray::from_ints(spec.elem, &parse_list(text, parse_int_word)?)
            };
            let array = match &spec.shape {
                Some(shape) => {
                    let len = array.len();
                    array.reshape(shape).ok_or_else(|| {
                        anyhow!("{} values do not fill shape {:?}", len, shape)
                    })?
                }
                None => array,
            };
            FfiValue::Array(array)
        }
        FfiType::OutRef(scalar) => {
            let initial = if text.is_empty() || text == "_" {
                "0"
            } else {
                text
            };
            FfiValue::out(parse_arg(initial, &FfiType::from_scalar(*scalar))?)
        }
        _ => parse_int(text)?,
    })
}

/// Values for variadic arguments carry no declared type
fn guess_arg(text: &str) -> FfiValue {
    if let Ok(v) = parse_int(text) {
        return v;
    }
    match text.parse::<f64>() {
        Ok(v) => FfiValue::Float(v),
        Err(_) if text == "null" => FfiValue::Null,
        Err(_) => FfiValue::Str(text.to_string()),
    }
}

fn parse_int(text: &str) -> Result<FfiValue> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(FfiValue::Int(v));
    }
    if let Ok(v) = text.parse::<u64>() {
        return Ok(FfiValue::UInt(v));
    }
    if let Some(hex) = text.strip_prefix("0x") {
        if let Ok(v) = u64::from_str_radix(hex, 16) {
            return Ok(FfiValue::UInt(v));
        }
    }
    bail!("Expected an integer, got '{}'", text)
}

/// An integer of any C width, signed or unsigned
fn parse_int_word(text: &str) -> Result<i128> {
    match parse_int(text)? {
        FfiValue::Int(v) => Ok(i128::from(v)),
        FfiValue::UInt(v) => Ok(i128::from(v)),
        _ => bail!("Expected an integer, got '{}'", text),
    }
}

fn parse_float(text: &str) -> Result<f64> {
    text.parse::<f64>()
        .with_context(|| format!("Expected a number, got '{}'", text))
}

/// "1,2,3" or "[1, 2, 3]"
fn parse_list<T>(text: &str, parse: impl Fn(&str) -> Result<T>) -> Result<Vec<T>> {
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(text);
    inner
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse)
        .collect()
}

fn to_json(value: &FfiValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        FfiValue::Void | FfiValue::Null => Value::Null,
        FfiValue::Int(v) => Value::from(*v),
        FfiValue::UInt(v) => Value::from(*v),
        FfiValue::Float(v) => Value::from(*v),
        FfiValue::Pointer(p) => Value::from(format!("{:#x}", p)),
        FfiValue::Str(s) => Value::from(s.as_str()),
        FfiValue::Array(a) => serde_json::json!({
            "dtype": a.elem().to_string(),
            "shape": a.shape(),
            "data": a.to_f64_vec(),
        }),
        FfiValue::Ref(inner) => to_json(inner),
    }
}

fn cmd_inspect(input: &Path, export_macros: &[String], json: bool) -> Result<()> {
    let is_ffi = input.extension().and_then(|e| e.to_str()) == Some("ffi");
    let signatures: Vec<FfiSignature> = if is_ffi {
        SignatureFile::parse_file(input)
            .with_context(|| format!("Failed to parse {}", input.display()))?
            .into_iter()
            .collect()
    } else {
        export_macros
            .iter()
            .fold(HeaderParser::new(), |p, m| p.with_export_macro(m))
            .parse_file(input)
            .with_context(|| format!("Failed to parse {}", input.display()))?
    };

    if json {
        let list: Vec<serde_json::Value> = signatures
            .iter()
            .map(|sig| {
                serde_json::json!({
                    "name": sig.name,
                    "params": sig.params.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                    "returns": sig.return_type.to_string(),
                    "variadic": sig.variadic,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        for sig in &signatures {
            println!("{}", sig);
        }
        eprintln!("{} signature(s)", signatures.len());
    }
    Ok(())
}

fn cmd_find(manifest: Option<&Path>, name: &str, dir: Option<PathBuf>, newest: bool) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => load_manifest(manifest)?
            .map(|c| c.out_dir())
            .unwrap_or_else(|| PathBuf::from("build")),
    };
    let artifact = discover_artifact_with(&dir, name, newest)
        .with_context(|| format!("Failed to find '{}'", name))?;
    println!("{}", artifact.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nativecall::ffi::ScalarType;

    #[test]
    fn test_parse_scalar_args() {
        assert_eq!(parse_arg("-7", &FfiType::I32).unwrap(), FfiValue::Int(-7));
        assert_eq!(
            parse_arg("18446744073709551615", &FfiType::U64).unwrap(),
            FfiValue::UInt(u64::MAX)
        );
        assert_eq!(parse_arg("2.5", &FfiType::F64).unwrap(), FfiValue::Float(2.5));
        assert!(parse_arg("abc", &FfiType::I32).is_err());
    }

    #[test]
    fn test_parse_pointer_args() {
        assert_eq!(parse_arg("null", &FfiType::Ptr).unwrap(), FfiValue::Null);
        assert_eq!(parse_arg("null", &FfiType::CStr).unwrap(), FfiValue::Null);
        assert_eq!(
            parse_arg("0x10", &FfiType::Ptr).unwrap(),
            FfiValue::Pointer(16)
        );
        assert_eq!(
            parse_arg("_", &FfiType::OutRef(ScalarType::I32)).unwrap(),
            FfiValue::out(0i64)
        );
    }

    #[test]
    fn test_parse_buffer_args() {
        let ty = FfiType::Buffer(BufferSpec::new(ScalarType::I32).shape(vec![2, 2]));
        let value = parse_arg("[1, 2, 3, 4]", &ty).unwrap();
        let array = value.as_array().unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.elem(), ScalarType::I32);
        assert!(parse_arg("1,2,3", &ty).is_err());
    }

    #[test]
    fn test_parse_integer_buffers_exactly() {
        let ty = FfiType::Buffer(BufferSpec::new(ScalarType::U64));
        let value = parse_arg("9007199254740993,18446744073709551615", &ty).unwrap();
        assert_eq!(
            value,
            FfiValue::from(HostArray::from(vec![9_007_199_254_740_993u64, u64::MAX]))
        );

        // Narrow elements keep the low bits, like a C cast
        let ty = FfiType::Buffer(BufferSpec::new(ScalarType::I8));
        let value = parse_arg("[300, -1, 0x7f]", &ty).unwrap();
        assert_eq!(value, FfiValue::from(HostArray::from(vec![44i8, -1, 127])));

        assert!(parse_arg("1.5,2", &ty).is_err());
    }

    #[test]
    fn test_guess_variadic_args() {
        assert_eq!(guess_arg("3"), FfiValue::Int(3));
        assert_eq!(guess_arg("1.5"), FfiValue::Float(1.5));
        assert_eq!(guess_arg("text"), FfiValue::Str("text".to_string()));
    }
}
