//! Link extraction from subscription payloads
//!
//! Feeds arrive as plain link-per-line text, as a JSON document with links
//! somewhere inside it, or as either of those wrapped in base64. All three
//! scans run and their results are merged in first-seen order.

use std::collections::HashSet;
use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Padding optional and non-zero trailing bits tolerated, as feed encoders
/// are not always canonical.
const LENIENT: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_decode_allow_trailing_bits(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

static SCHEME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://").expect("valid scheme pattern"));

/// Extract every connection string from a raw feed payload
///
/// Returns an empty list when nothing matches; whether that is fatal is
/// up to the caller.
pub fn extract_links(payload: &[u8]) -> Vec<String> {
    let mut links = extract_from_json(payload);
    links.extend(extract_from_plain_text(&String::from_utf8_lossy(payload)));
    links.extend(extract_from_base64(payload));

    let links = unique_non_empty(links);
    debug!("Extracted {} unique links", links.len());
    links
}

/// Check whether a string starts with a `scheme://` prefix
pub fn has_scheme_prefix(s: &str) -> bool {
    SCHEME_PATTERN.is_match(s)
}

fn extract_from_plain_text(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| has_scheme_prefix(line))
        .map(str::to_string)
        .collect()
}

fn extract_from_json(payload: &[u8]) -> Vec<String> {
    let Ok(tree) = serde_json::from_slice::<Value>(payload) else {
        return Vec::new();
    };

    let mut links = Vec::new();
    collect_string_leaves(&tree, &mut links);
    links
}

fn collect_string_leaves(node: &Value, out: &mut Vec<String>) {
    match node {
        Value::String(s) => {
            let value = s.trim();
            if has_scheme_prefix(value) {
                out.push(value.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_string_leaves(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_string_leaves(item, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn extract_from_base64(payload: &[u8]) -> Vec<String> {
    let normalized: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !matches!(b, b'\n' | b'\r' | b'\t' | b' '))
        .collect();
    if normalized.is_empty() || contains_scheme_separator(&normalized) {
        return Vec::new();
    }

    let Some(decoded) = decode_base64(&normalized) else {
        return Vec::new();
    };
    if decoded.is_empty() {
        return Vec::new();
    }

    let mut links = extract_from_json(&decoded);
    links.extend(extract_from_plain_text(&String::from_utf8_lossy(&decoded)));
    links
}

fn contains_scheme_separator(bytes: &[u8]) -> bool {
    bytes.windows(3).any(|w| w == b"://")
}

/// Try the standard alphabet, then the URL-safe one; the first successful
/// decode wins.
fn decode_base64(normalized: &[u8]) -> Option<Vec<u8>> {
    let end = normalized
        .iter()
        .rposition(|&b| b != b'=')
        .map_or(0, |i| i + 1);
    let mut input = normalized[..end].to_vec();
    while input.len() % 4 != 0 {
        input.push(b'=');
    }

    STANDARD_LENIENT
        .decode(&input)
        .or_else(|_| URL_SAFE_LENIENT.decode(&input))
        .ok()
}

fn unique_non_empty(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
