use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension of scenario files named in the catalog.
const SCENARIO_EXTENSION: &str = ".xosc";

/// Current epoch time in milliseconds for artifact names and timestamps.
pub fn now_epoch_ms() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("compute timestamp")?
        .as_millis())
}

/// File-name-safe stem for a scenario id: extension dropped, anything outside
/// `[A-Za-z0-9_.-]` replaced by `_`.
///
/// Ids that do not survive that mapping intact (directories, other extensions,
/// replaced characters) get a short digest of the full id appended, so two
/// distinct ids never share a stem.
pub fn sanitized_stem(scenario_id: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let stem = Path::new(scenario_id)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| scenario_id.to_string());
    let unsafe_chars = UNSAFE.get_or_init(|| {
        Regex::new(r"[^a-zA-Z0-9_.\-]").unwrap_or_else(|_| unreachable!("static pattern"))
    });
    let safe = unsafe_chars.replace_all(&stem, "_").into_owned();
    if format!("{safe}{SCENARIO_EXTENSION}") == scenario_id {
        return safe;
    }
    let digest = sha256_hex(scenario_id.as_bytes());
    format!("{safe}-{}", &digest[..8])
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Keep at most `max_lines` lines and `max_bytes` bytes of the end of `text`,
/// marking the cut.
pub fn bounded_snippet(text: &str, max_lines: usize, max_bytes: usize) -> String {
    const MARKER: &str = "[... output truncated ...]\n";
    if max_lines == 0 || max_bytes == 0 {
        return String::new();
    }

    // Keep the tail: interpreter failures print the traceback last.
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let start = lines.len().saturating_sub(max_lines);
    let tail = lines[start..].concat();
    if start == 0 && tail.len() <= max_bytes {
        return tail;
    }
    if max_bytes <= MARKER.len() {
        return truncate_utf8(MARKER, max_bytes).to_string();
    }
    format!("{MARKER}{}", tail_utf8(&tail, max_bytes - MARKER.len()))
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Last `max_bytes` bytes of `text`, starting on a char boundary.
pub fn tail_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
