//! `.ffi` signature files
//!
//! One declaration per line:
//!
//! ```text
//! # comments start with '#'
//! add: (f64, f64) -> f64
//! sum_array: (buffer<f64, ndim=1, contiguous>, usize) -> f64
//! divmod: (i32, i32, out<i32>) -> i32
//! log_values: (cstr, ...) -> void
//! ```
//!
//! A missing `-> type` means `void`.

use std::collections::BTreeMap;
use std::path::Path;

use super::registry::FfiError;
use super::types::{split_top_level, FfiSignature, FfiType};

/// Function signatures declared for one library
#[derive(Debug, Clone, Default)]
pub struct SignatureFile {
    signatures: BTreeMap<String, FfiSignature>,
}

impl SignatureFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `.ffi` file from a path
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, FfiError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| FfiError::Parse {
            line: 0,
            message: format!("failed to read '{}': {}", path.as_ref().display(), e),
        })?;
        Self::parse(&content)
    }

    /// Parse `.ffi` content from a string
    pub fn parse(content: &str) -> Result<Self, FfiError> {
        let mut file = Self::new();

        for (idx, line) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let sig = parse_line(line).map_err(|message| FfiError::Parse {
                line: line_num,
                message,
            })?;
            if file.signatures.contains_key(&sig.name) {
                return Err(FfiError::Parse {
                    line: line_num,
                    message: format!("duplicate declaration of '{}'", sig.name),
                });
            }
            file.insert(sig);
        }

        Ok(file)
    }

    pub fn insert(&mut self, signature: FfiSignature) {
        self.signatures.insert(signature.name.clone(), signature);
    }

    pub fn get(&self, name: &str) -> Option<&FfiSignature> {
        self.signatures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.signatures.contains_key(name)
    }

    /// Signatures in name order
    pub fn iter(&self) -> impl Iterator<Item = &FfiSignature> {
        self.signatures.values()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Render back to `.ffi` text
    pub fn to_text(&self) -> String {
        self.iter().map(|sig| format!("{}\n", format_line(sig))).collect()
    }
}

impl IntoIterator for SignatureFile {
    type Item = FfiSignature;
    type IntoIter = std::collections::btree_map::IntoValues<String, FfiSignature>;

    fn into_iter(self) -> Self::IntoIter {
        self.signatures.into_values()
    }
}

/// Parse `name: (types) -> ret`
fn parse_line(line: &str) -> Result<FfiSignature, String> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| "expected ':' after function name".to_string())?;
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid function name '{}'", name));
    }

    let rest = rest.trim();
    let inner_start = rest
        .strip_prefix('(')
        .ok_or_else(|| "expected '(' to start the parameter list".to_string())?;
    let close = matching_paren(inner_start)
        .ok_or_else(|| "unclosed parameter list".to_string())?;
    let params_text = &inner_start[..close];
    let after = inner_start[close + 1..].trim();

    let return_type = if after.is_empty() {
        FfiType::Void
    } else {
        let ret = after
            .strip_prefix("->")
            .ok_or_else(|| format!("expected '->' before return type, found '{}'", after))?
            .trim();
        FfiType::from_str(ret).ok_or_else(|| format!("unknown return type '{}'", ret))?
    };

    let mut params = Vec::new();
    let mut variadic = false;
    for param in split_top_level(params_text) {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        if variadic {
            return Err("'...' must be the last parameter".to_string());
        }
        if param == "..." {
            variadic = true;
            continue;
        }
        let ty = FfiType::from_str(param).ok_or_else(|| format!("unknown type '{}'", param))?;
        params.push(ty);
    }

    Ok(FfiSignature {
        name: name.to_string(),
        params,
        return_type,
        variadic,
    })
}

/// Index of the ')' closing an already-opened '('
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn format_line(sig: &FfiSignature) -> String {
    let mut params: Vec<String> = sig.params.iter().map(|p| p.to_string()).collect();
    if sig.variadic {
        params.push("...".to_string());
    }
    format!("{}: ({}) -> {}", sig.name, params.join(", "), sig.return_type)
}
