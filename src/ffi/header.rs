//! Signatures from C headers
//!
//! Reads the function prototypes of a plain C header so declarations come
//! from the same text the native library was compiled against. Only simple
//! prototypes are understood; anything else (function pointers, structs by
//! value, macros that expand to types) is skipped with a warning.
//!
//! Pointer parameters follow one convention: `const T*` is an input buffer,
//! non-const `T*` is a writable buffer, `char*` is text and `void*` is an
//! opaque pointer. A header cannot say how many elements a pointer covers,
//! so scalar out slots (`out<T>`) only come from `.ffi` files or signature
//! strings.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::registry::FfiError;
use super::types::FfiSignature;

static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"//[^\n]*").unwrap());
static EXTERN_C: Lazy<Regex> = Lazy::new(|| Regex::new(r#"extern\s+"C"\s*\{?"#).unwrap());
static ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__attribute__\s*\(\(.*?\)\)|__declspec\s*\(\s*\w+\s*\)").unwrap());

/// Extracts function signatures from C header text
#[derive(Debug, Clone)]
pub struct HeaderParser {
    /// Export/visibility macros stripped before parsing (e.g. `MYLIB_API`)
    export_macros: Vec<String>,
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            export_macros: vec!["EXPORT".to_string(), "DLLEXPORT".to_string()],
        }
    }

    /// Also strip `name` wherever it appears as a whole word
    pub fn with_export_macro(mut self, name: impl Into<String>) -> Self {
        self.export_macros.push(name.into());
        self
    }

    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Vec<FfiSignature>, FfiError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| FfiError::Parse {
            line: 0,
            message: format!("failed to read '{}': {}", path.as_ref().display(), e),
        })?;
        Ok(self.parse(&text))
    }

    /// Parse every prototype in `text`, in declaration order
    pub fn parse(&self, text: &str) -> Vec<FfiSignature> {
        let text = self.preprocess(text);

        text.split(';')
            .map(|decl| decl.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|decl| !decl.is_empty() && decl.contains('('))
            .filter(|decl| !decl.starts_with("typedef") && !decl.starts_with("struct "))
            .filter_map(|decl| {
                let decl = strip_storage(&decl);
                let parsed = FfiSignature::parse(decl);
                if parsed.is_none() {
                    warn!(declaration = decl, "skipping unsupported prototype");
                }
                parsed
            })
            .collect()
    }

    fn preprocess(&self, text: &str) -> String {
        let text = BLOCK_COMMENT.replace_all(text, " ");
        let text = LINE_COMMENT.replace_all(&text, "");

        // Preprocessor lines, including continuations
        let mut kept = String::with_capacity(text.len());
        let mut continuing = false;
        for line in text.lines() {
            let trimmed = line.trim_start();
            if continuing || trimmed.starts_with('#') {
                continuing = trimmed.ends_with('\\');
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }

        let text = EXTERN_C.replace_all(&kept, " ");
        let mut text = ATTRIBUTE.replace_all(&text, " ").into_owned();
        for name in &self.export_macros {
            if let Ok(re) = Regex::new(&format!(r"\b{}\b", regex::escape(name))) {
                text = re.replace_all(&text, " ").into_owned();
            }
        }

        drop_bodies(&text)
    }
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `{ ... }` blocks together with the declaration they belong to.
///
/// Inline definitions and struct bodies are not exported prototypes. A
/// stray `}` (the end of an `extern "C"` block) is dropped.
fn drop_bodies(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '{' => {
                if depth == 0 {
                    let keep = out.rfind(';').map(|i| i + 1).unwrap_or(0);
                    out.truncate(keep);
                }
                depth += 1;
            }
            '}' => {
                if depth == 1 {
                    out.push(';');
                }
                depth = depth.saturating_sub(1);
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn strip_storage(decl: &str) -> &str {
    let mut decl = decl.trim();
    for prefix in ["extern ", "static ", "inline "] {
        if let Some(rest) = decl.strip_prefix(prefix) {
            decl = rest.trim_start();
        }
    }
    decl
}
