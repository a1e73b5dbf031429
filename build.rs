//! Build script for nativecall
//!
//! Records the target and host triples used to name extension artifacts, and
//! compiles the native test fixture (`native/fixture.c`) into a shared
//! library with the host C compiler. The fixture path is exported as
//! `NC_FIXTURE_LIB`; it is empty when no compiler was available, and the
//! tests that need it skip themselves.

use std::env;
use std::path::{Path, PathBuf};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let target = env::var("TARGET").unwrap_or_else(|_| "x86_64-unknown-linux-gnu".to_string());
    let host = env::var("HOST").unwrap_or_else(|_| target.clone());

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=native/fixture.c");
    println!("cargo:rerun-if-changed=native/fixture.h");
    println!("cargo:rustc-env=NC_TARGET={}", target);
    println!("cargo:rustc-env=NC_HOST={}", host);

    let fixture = match build_fixture(&out_dir, &target) {
        Ok(path) => path.display().to_string(),
        Err(reason) => {
            println!(
                "cargo:warning=native fixture not built ({}); FFI integration tests will be skipped",
                reason
            );
            String::new()
        }
    };
    println!("cargo:rustc-env=NC_FIXTURE_LIB={}", fixture);
}

/// Compile native/fixture.c into a shared library inside `out_dir`
fn build_fixture(out_dir: &Path, target: &str) -> Result<PathBuf, String> {
    let source = Path::new("native").join("fixture.c");
    if !source.exists() {
        return Err(format!("{} missing", source.display()));
    }

    let file_name = if target.contains("windows") {
        "fixture.dll"
    } else if target.contains("apple") {
        "libfixture.dylib"
    } else {
        "libfixture.so"
    };
    let output = out_dir.join(file_name);

    let tool = cc::Build::new()
        .opt_level(2)
        .cargo_metadata(false)
        .warnings(false)
        .try_get_compiler()
        .map_err(|e| e.to_string())?;

    let mut cmd = tool.to_command();
    cmd.arg("-Inative");
    if tool.is_like_msvc() {
        cmd.arg("/LD")
            .arg(format!("/Fo{}\\", out_dir.display()))
            .arg(format!("/Fe{}", output.display()))
            .arg(&source);
    } else {
        cmd.args(["-shared", "-fPIC"])
            .arg(&source)
            .arg("-o")
            .arg(&output);
    }

    let result = cmd
        .output()
        .map_err(|e| format!("failed to run compiler: {}", e))?;
    if !result.status.success() {
        return Err(format!(
            "compiler exited with {}: {}",
            result.status,
            String::from_utf8_lossy(&result.stderr).trim()
        ));
    }
    Ok(output)
}
