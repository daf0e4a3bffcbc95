//! Final result extraction.
//!
//! A worker's last stdout line must be a single JSON document, but log lines
//! may be interleaved before it and the document itself may span lines. The
//! scan walks line starts from the end and accepts the first suffix that
//! parses as a balanced JSON object or array.

use serde_json::Value;

/// Extract the trailing JSON document from captured stdout.
pub fn extract_trailing_json(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim_end();
    if trimmed.is_empty() {
        return None;
    }

    let mut offsets: Vec<usize> = vec![0];
    offsets.extend(trimmed.char_indices().filter(|(_, c)| *c == '\n').map(|(i, _)| i + 1));

    for offset in offsets.into_iter().rev() {
        let candidate = trimmed[offset..].trim();
        if !(candidate.starts_with('{') || candidate.starts_with('[')) {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Some(value);
        }
    }
    None
}
