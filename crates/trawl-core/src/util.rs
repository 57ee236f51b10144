use std::path::Path;

/// Normalize free text for identity comparison.
///
/// Lower-cases, drops punctuation and collapses all whitespace, so
/// `"ACME  Inc."` and `"acme inc"` compare equal.
pub fn normalize_key(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Derive a source name from a definition file path.
///
/// Extracts the file stem (name without extension).
/// Example: `"sources/remote_board.json"` → `"remote_board"`
pub fn derive_source_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source")
        .to_string()
}
