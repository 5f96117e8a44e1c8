//! Extraction of structured JSON from free-form agent output.
//!
//! CLI agents wrap their JSON in prose, markdown fences, or noise
//! characters, and sometimes emit a plain-text error instead. Extraction
//! walks a fixed ladder of strategies and reports failure through
//! [`ExtractError`]; it never panics on malformed input.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

// ── Compiled patterns ────────────────────────────────────────────────────────

/// Leading error text from the executor, e.g. `Error: model unavailable`.
static RE_ERROR_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:execution\s+)?error\b").unwrap());

/// Markdown code fence with optional `json` language tag.
static RE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

/// JSON object with at most one level of nesting.
static RE_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").unwrap());

// ── Errors ───────────────────────────────────────────────────────────────────

/// Why no structured response could be recovered from agent output.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The output was a plain-text error report, not a response.
    #[error("executor reported an error: {0}")]
    ExecutorReported(String),

    /// No strategy produced parseable JSON.
    #[error("no parseable JSON found in agent output: {0}")]
    NoJsonFound(String),

    /// JSON parsed but did not fit the expected response shape.
    #[error("response JSON did not match the expected shape: {reason} (excerpt: {excerpt})")]
    SchemaMismatch {
        /// Deserializer message describing the mismatch.
        reason: String,
        /// Leading slice of the offending output.
        excerpt: String,
    },
}

// ── Extraction ───────────────────────────────────────────────────────────────

/// Recover a JSON value from raw agent output.
///
/// Strategies are tried in order: executor error text, fenced code block,
/// shallow object regex anchored at the first brace, and a depth-tracking
/// scan from the first brace. Each parse gets a single attempt before the
/// ladder moves on.
pub fn extract_json(raw: &str) -> Result<serde_json::Value, ExtractError> {
    if RE_ERROR_PREFIX.is_match(raw) {
        return Err(ExtractError::ExecutorReported(excerpt(raw, 200)));
    }

    let clean = sanitize(raw);

    if let Some(caps) = RE_FENCE.captures(&clean) {
        if let Some(body) = caps.get(1) {
            if let Ok(value) = serde_json::from_str(body.as_str().trim()) {
                return Ok(value);
            }
        }
    }

    if let Some(first_brace) = clean.find('{') {
        if let Some(m) = RE_OBJECT.find(&clean) {
            // A match further in would be an inner fragment of a deeper
            // object; leave those to the scan below.
            if m.start() == first_brace {
                if let Ok(value) = serde_json::from_str(m.as_str()) {
                    return Ok(value);
                }
            }
        }
    }

    if let Some(slice) = scan_object(&clean) {
        if let Ok(value) = serde_json::from_str(slice) {
            return Ok(value);
        }
    }

    Err(ExtractError::NoJsonFound(excerpt(raw, 200)))
}

/// Extract and deserialize into a typed response.
pub fn extract_as<T: DeserializeOwned>(raw: &str) -> Result<T, ExtractError> {
    let value = extract_json(raw)?;
    serde_json::from_value(value).map_err(|err| ExtractError::SchemaMismatch {
        reason: err.to_string(),
        excerpt: excerpt(raw, 160),
    })
}

/// Drop BOM and zero-width characters that commonly pollute CLI output.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}'))
        .collect()
}

/// Find a balanced object starting at the first `{`, honouring strings
/// and escapes. Returns the matched slice without attempting to parse it.
fn scan_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Char-boundary-safe leading slice for log and history messages.
pub(crate) fn excerpt(raw: &str, max_chars: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
