//! Normalisation of error messages and stack frames
//!
//! Variable data (quoted literals, UUIDs, hex addresses, numbers, line
//! numbers) is replaced by fixed placeholders so that two occurrences of the
//! same fault collapse to one template.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Messages longer than this are cut before normalisation
pub const MAX_MESSAGE_CHARS: usize = 2048;

struct MessagePatterns {
    /// `"..."`, `'...'` and backtick literals
    quoted: Regex,
    /// `550e8400-e29b-41d4-a716-446655440000`
    uuids: Regex,
    /// `0x7fff5fbfe000`
    hex_literals: Regex,
    /// Integers and decimals, including digits glued to identifiers
    numbers: Regex,
}

struct FramePatterns {
    /// `:123` or `:123:45` at the end of a location
    line_suffix: Regex,
    /// Digits inside function names (`lambda$12`, `<anonymous>_3`)
    digits: Regex,
}

fn build_message_patterns() -> Option<MessagePatterns> {
    Some(MessagePatterns {
        quoted: Regex::new(r#""(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*'|`[^`]*`"#).ok()?,
        uuids: Regex::new(
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        )
        .ok()?,
        hex_literals: Regex::new(r"0x[0-9a-fA-F]+").ok()?,
        numbers: Regex::new(r"\d+(?:\.\d+)?").ok()?,
    })
}

fn build_frame_patterns() -> Option<FramePatterns> {
    Some(FramePatterns {
        line_suffix: Regex::new(r"(:\d+)+$").ok()?,
        digits: Regex::new(r"\d+").ok()?,
    })
}

static MESSAGE_PATTERNS: LazyLock<Option<MessagePatterns>> =
    LazyLock::new(build_message_patterns);
static FRAME_PATTERNS: LazyLock<Option<FramePatterns>> = LazyLock::new(build_frame_patterns);

/// Normalise an error message into its template
///
/// Quoted literals become `<str>`, UUIDs `<uuid>`, hex literals `<hex>` and
/// remaining numeric literals `<num>`. Whitespace is collapsed.
#[must_use]
pub fn normalise_message(message: &str) -> String {
    let truncated: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
    let Some(patterns) = MESSAGE_PATTERNS.as_ref() else {
        return normalise_whitespace(&truncated);
    };

    // Quoted literals first: they may contain UUIDs and numbers themselves.
    let result = patterns.quoted.replace_all(&truncated, "<str>");
    let result = patterns.uuids.replace_all(&result, "<uuid>");
    let result = patterns.hex_literals.replace_all(&result, "<hex>");
    let result = patterns.numbers.replace_all(&result, "<num>");

    normalise_whitespace(&result)
}

/// Reduce a stack frame to `component:functionShapeHash`
///
/// Understands `at fn (path/file.ts:12:5)`, `fn@path/file.js:12:5` and bare
/// `path/file.ts:12` frames. Line and column numbers never take part.
#[must_use]
pub fn frame_shape(frame: &str) -> String {
    let frame = frame.trim();
    let frame = frame.strip_prefix("at ").unwrap_or(frame).trim();

    let (function, location) = if let (Some(open), true) = (frame.rfind(" ("), frame.ends_with(')'))
    {
        (&frame[..open], &frame[open + 2..frame.len() - 1])
    } else if let Some(at) = frame.find('@') {
        (&frame[..at], &frame[at + 1..])
    } else if frame.contains('/') || frame.contains('\\') || frame.contains(':') {
        ("", frame)
    } else {
        (frame, "")
    };

    format!(
        "{}:{}",
        frame_component(location),
        function_shape_hash(function)
    )
}

/// File stem of a frame location, without line numbers or query strings
fn frame_component(location: &str) -> String {
    let location = location.trim();
    if location.is_empty() {
        return "unknown".to_string();
    }
    let without_lines = match FRAME_PATTERNS.as_ref() {
        Some(patterns) => patterns.line_suffix.replace(location, "").to_string(),
        None => location.to_string(),
    };
    let without_query = without_lines.split(['?', '#']).next().unwrap_or_default();
    let file = without_query
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(without_query);
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    };
    if stem.is_empty() {
        "unknown".to_string()
    } else {
        stem.to_string()
    }
}

/// Eight hex characters identifying the function name with digits removed
fn function_shape_hash(function: &str) -> String {
    let function = function.trim();
    let shape = match FRAME_PATTERNS.as_ref() {
        Some(patterns) => patterns.digits.replace_all(function, "").to_string(),
        None => function.to_string(),
    };
    let digest = Sha256::digest(shape.as_bytes());
    hex::encode(&digest[..4])
}

/// Normalise whitespace (collapse multiple spaces/newlines).
fn normalise_whitespace(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut prev_whitespace = false;

    for c in s.chars() {
        if c.is_whitespace() {
            if !prev_whitespace {
                result.push(' ');
            }
            prev_whitespace = true;
        } else {
            result.push(c);
            prev_whitespace = false;
        }
    }

    result.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_numbers() {
        assert_eq!(
            normalise_message("Timeout after 3000ms on attempt 2"),
            "Timeout after <num>ms on attempt <num>"
        );
    }

    #[test]
    fn test_normalise_uuids() {
        let result = normalise_message("Order 550e8400-e29b-41d4-a716-446655440000 not found");
        assert_eq!(result, "Order <uuid> not found");
    }

    #[test]
    fn test_normalise_quoted_literals() {
        let result = normalise_message(r#"Unknown field "email" in 'user-42' payload"#);
        assert_eq!(result, "Unknown field <str> in <str> payload");
    }

    #[test]
    fn test_normalise_hex_before_numbers() {
        assert_eq!(
            normalise_message("segfault at 0x7fff5fbfe000"),
            "segfault at <hex>"
        );
    }

    #[test]
    fn test_normalise_collapses_whitespace() {
        assert_eq!(normalise_message("  a \n\t b  "), "a b");
    }

    #[test]
    fn test_frame_shape_ignores_line_numbers() {
        let a = frame_shape("at fetchUser (src/api/users.ts:120:14)");
        let b = frame_shape("    at fetchUser (src/api/users.ts:98:3)");
        assert_eq!(a, b);
        assert!(a.starts_with("users:"));
    }

    #[test]
    fn test_frame_shape_distinguishes_functions() {
        let a = frame_shape("at fetchUser (src/api/users.ts:120:14)");
        let b = frame_shape("at saveUser (src/api/users.ts:120:14)");
        assert_ne!(a, b);
    }

    #[test]
    fn test_frame_shape_firefox_style() {
        let a = frame_shape("render@https://app.example.com/static/main.js?v=3:10:2");
        assert!(a.starts_with("main:"));
    }

    #[test]
    fn test_frame_shape_bare_location() {
        let a = frame_shape("src/worker.rs:42");
        assert!(a.starts_with("worker:"));
    }
}
