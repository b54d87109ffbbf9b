use std::{collections::BTreeMap, path::Path};

use snafu::Snafu;

use crate::util::io::{self, FileError};

#[derive(Debug, Snafu)]
pub enum FileIdError {
    #[snafu(transparent)]
    File { source: FileError },
    #[snafu(display("file-id symbol '{symbol}' is not a valid identifier"))]
    InvalidSymbol { symbol: String },
    #[snafu(display("file-id '{symbol}' refers to '{path}', which does not exist under the filesystem root"))]
    MissingFile { symbol: String, path: String },
}

fn is_valid_identifier(symbol: &str) -> bool {
    let mut chars = symbol.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves the NitroFS file ID for every `file-id.<symbol>` entry, looking
/// it up by position in `fat_entries` (the file table the out-of-scope
/// NitroFS layer is expected to supply, in on-disk path order).
pub fn resolve_file_ids(
    entries: &BTreeMap<String, std::path::PathBuf>,
    filesystem_root: &Path,
    lookup: impl Fn(&Path) -> Option<u16>,
) -> Result<BTreeMap<String, u16>, FileIdError> {
    let mut resolved = BTreeMap::new();
    for (symbol, relative_path) in entries {
        if !is_valid_identifier(symbol) {
            return InvalidSymbolSnafu { symbol }.fail();
        }
        let full_path = filesystem_root.join(relative_path);
        let id = lookup(&full_path).ok_or_else(|| MissingFileSnafu { symbol, path: full_path.to_string_lossy() }.build())?;
        resolved.insert(symbol.clone(), id);
    }
    Ok(resolved)
}

/// Renders the `fid.h` forced-include header: `namespace FID` of `u16`
/// constants, guarded against assembly sources.
pub fn render_fid_header(ids: &BTreeMap<String, u16>) -> String {
    let mut out = String::new();
    out.push_str("#pragma once\n\n");
    out.push_str("#if !defined(__FFC_LANG_ASM)\n");
    out.push_str("namespace FID {\n");
    for (symbol, id) in ids {
        out.push_str(&format!("constexpr unsigned short {symbol} = {id};\n"));
    }
    out.push_str("}\n");
    out.push_str("#endif\n");
    out
}

/// Writes `fid.h` only if needed; returns whether a write happened.
pub fn write_fid_header_if_changed(toolchain_dir: &Path, ids: &BTreeMap<String, u16>, config_changed: bool) -> Result<bool, FileIdError> {
    if !config_changed {
        return Ok(false);
    }
    let path = toolchain_dir.join("internal/fid.h");
    io::write_file(&path, render_fid_header(ids))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifier() {
        assert!(is_valid_identifier("SOME_FILE"));
        assert!(is_valid_identifier("_leading"));
        assert!(!is_valid_identifier("1bad"));
        assert!(!is_valid_identifier("has-dash"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_resolve_rejects_invalid_symbol() {
        let mut entries = BTreeMap::new();
        entries.insert("1bad".to_string(), std::path::PathBuf::from("a.bin"));
        let result = resolve_file_ids(&entries, Path::new("fs/root"), |_| Some(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_render_fid_header() {
        let mut ids = BTreeMap::new();
        ids.insert("SOME_FILE".to_string(), 7u16);
        let header = render_fid_header(&ids);
        assert!(header.contains("constexpr unsigned short SOME_FILE = 7;"));
        assert!(header.contains("__FFC_LANG_ASM"));
    }
}
