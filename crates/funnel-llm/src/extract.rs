//! JSON extraction from model output.
//!
//! Models asked for strict JSON still wrap it in prose or code fences often
//! enough that the tolerant mode earns its keep. Enum values inside the
//! parsed document are still untrusted — callers run them through the
//! normalizer.

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonMode {
    /// Top-level parse or error.
    Strict,
    /// Top-level parse, else first balanced `{…}` block, else fenced
    /// ```json block, else error.
    Tolerant,
}

pub fn extract_json(content: &str, mode: JsonMode) -> Result<serde_json::Value, TransportError> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Ok(v);
    }
    if mode == JsonMode::Strict {
        return Err(TransportError::Parse(
            "response is not a JSON document".to_string(),
        ));
    }

    if let Some(block) = first_balanced_object(trimmed) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(block) {
            return Ok(v);
        }
    }

    if let Some(fenced) = fenced_json_block(trimmed) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(fenced) {
            return Ok(v);
        }
    }

    Err(TransportError::Parse(
        "no parseable JSON object in response".to_string(),
    ))
}

/// Scan for the first `{` and return the slice up to its matching `}`,
/// tracking string literals and escapes so braces inside strings don't
/// unbalance the count.
fn first_balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Contents of the first ```json … ``` fence (or a bare ``` fence).
fn fenced_json_block(s: &str) -> Option<&str> {
    let open = s.find("```")?;
    let after = &s[open + 3..];
    let body_start = if let Some(rest) = after.strip_prefix("json") {
        rest
    } else {
        after
    };
    let close = body_start.find("```")?;
    Some(body_start[..close].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_accepts_clean_json() {
        let v = extract_json(r#"{"action": "send_now"}"#, JsonMode::Strict).unwrap();
        assert_eq!(v["action"], "send_now");
    }

    #[test]
    fn strict_rejects_prose_wrapping() {
        assert!(extract_json(r#"Sure! {"a": 1}"#, JsonMode::Strict).is_err());
    }

    #[test]
    fn tolerant_finds_embedded_object() {
        let v = extract_json(
            r#"Here is my decision: {"action": "wait_schedule", "confidence": 0.7} hope that helps"#,
            JsonMode::Tolerant,
        )
        .unwrap();
        assert_eq!(v["action"], "wait_schedule");
    }

    #[test]
    fn tolerant_ignores_braces_inside_strings() {
        let v = extract_json(
            r#"prefix {"message_text": "use {curly} braces", "n": 2} suffix"#,
            JsonMode::Tolerant,
        )
        .unwrap();
        assert_eq!(v["n"], 2);
    }

    #[test]
    fn tolerant_handles_nested_objects() {
        let v = extract_json(
            r#"note {"risk_flags": {"spam": "low", "policy": "low"}} end"#,
            JsonMode::Tolerant,
        )
        .unwrap();
        assert_eq!(v["risk_flags"]["spam"], "low");
    }

    #[test]
    fn tolerant_falls_back_to_fenced_block() {
        // The balanced-brace pass fails here (unclosed stray brace first),
        // so the fence is the last resort.
        let text = "broken { oops\n```json\n{\"ok\": true}\n```";
        let v = extract_json(text, JsonMode::Tolerant).unwrap();
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn tolerant_errors_when_nothing_parses() {
        assert!(extract_json("no json anywhere", JsonMode::Tolerant).is_err());
    }
}
