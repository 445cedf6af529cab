//! Tolerant extraction of JSON from model output
//!
//! Models wrap JSON in prose or code fences. These helpers find the first
//! balanced object or array, honouring string literals and escapes.

use serde::de::DeserializeOwned;

/// First balanced `{...}` in `raw`
pub fn extract_json_object(raw: &str) -> Option<&str> {
    extract_balanced(raw, '{', '}')
}

/// First balanced `[...]` in `raw`
pub fn extract_json_array(raw: &str) -> Option<&str> {
    extract_balanced(raw, '[', ']')
}

/// Parse the first JSON object in `raw` into `T`
pub fn parse_first_object<T: DeserializeOwned>(raw: &str) -> Option<T> {
    extract_json_object(raw).and_then(|json| serde_json::from_str(json).ok())
}

/// Parse the first JSON array in `raw` into `T`
pub fn parse_first_array<T: DeserializeOwned>(raw: &str) -> Option<T> {
    extract_json_array(raw).and_then(|json| serde_json::from_str(json).ok())
}

fn extract_balanced(raw: &str, open: char, close: char) -> Option<&str> {
    let start = raw.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&raw[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}
