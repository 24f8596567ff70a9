//! Reply repair for malformed tool-argument JSON.
//!
//! Models truncate, double-encode, and mangle the argument payloads of
//! tool calls in recurring ways. The repair pipeline is a declared,
//! ordered list of strategies; parsing stops at the first one that yields
//! a JSON object. New rules are added to the table, not to the engine.

use regex::Regex;
use serde_json::Value;

use crate::error::AgentError;

/// A single repair rule. `apply` returns `Some` only when it produced a
/// JSON object.
pub struct RepairStrategy {
    pub name: &'static str,
    apply: fn(&str) -> Option<Value>,
}

fn strict(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(map)) => Some(Value::Object(map)),
        _ => None,
    }
}

fn strip_trailing_comma(s: &str) -> String {
    s.trim().trim_end_matches(',').to_string()
}

fn s_strict(s: &str) -> Option<Value> {
    strict(s)
}

fn s_close_one(s: &str) -> Option<Value> {
    strict(&format!("{s}}}"))
}

fn s_close_two(s: &str) -> Option<Value> {
    strict(&format!("{s}}}}}"))
}

fn s_close_quote_two(s: &str) -> Option<Value> {
    strict(&format!("{s}\"}}}}"))
}

fn s_strip_comma_close_one(s: &str) -> Option<Value> {
    strict(&format!("{}}}", strip_trailing_comma(s)))
}

fn s_strip_comma_close_two(s: &str) -> Option<Value> {
    strict(&format!("{}}}}}", strip_trailing_comma(s)))
}

fn s_strip_comma_close_quote_two(s: &str) -> Option<Value> {
    strict(&format!("{}\"}}}}", strip_trailing_comma(s)))
}

/// Escape raw line feeds that were emitted inside string literals.
fn escape_newlines_in_strings(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;

    for ch in s.chars() {
        if ch == '"' && !escape {
            in_string = !in_string;
        }
        if ch == '\\' && !escape {
            escape = true;
        } else {
            escape = false;
        }
        if ch == '\n' && in_string {
            out.push_str("\\n");
        } else {
            out.push(ch);
        }
    }
    out
}

fn s_escape_newlines(s: &str) -> Option<Value> {
    strict(&escape_newlines_in_strings(s))
}

/// Consolidate a broken `"message":` field that ran past its closing
/// quote: everything up to the next structural `}` becomes the string.
fn repair_broken_message_field(s: &str) -> String {
    let mut in_message = false;
    let mut in_string = false;
    let mut escape = false;
    let mut message_content = String::new();
    let mut out = String::with_capacity(s.len());

    for ch in s.chars() {
        if ch == '"' && !escape {
            in_string = !in_string;
            if !in_message {
                out.push(ch);
            }
        } else if ch == '\\' && !escape {
            escape = true;
            out.push(ch);
        } else {
            if escape {
                escape = false;
            }
            if in_message {
                if ch == '}' {
                    out.push('"');
                    out.push_str(&message_content.replace('\n', " "));
                    out.push('"');
                    out.push(ch);
                    in_message = false;
                } else if in_string
                    || ch.is_alphanumeric()
                    || ch.is_whitespace()
                    || ".',;:!".contains(ch)
                {
                    message_content.push(ch);
                }
            } else {
                out.push(ch);
                if out.ends_with("\"message\":") {
                    in_message = true;
                    message_content.clear();
                }
            }
        }
    }
    out
}

fn s_repair_message_field(s: &str) -> Option<Value> {
    strict(&repair_broken_message_field(s))
}

/// Depth-counted extraction of the first balanced `{…}` object. Handles
/// two JSON objects back-to-back and trailing garbage.
fn extract_first_json(s: &str) -> Option<Value> {
    let mut depth = 0usize;
    let mut start_index = None;

    for (i, ch) in s.char_indices() {
        match ch {
            '{' => {
                if depth == 0 {
                    start_index = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = start_index {
                        return strict(&s[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn s_extract_first_closed(s: &str) -> Option<Value> {
    extract_first_json(&format!("{s}}}}}"))
}

/// Last-ditch extraction assuming the common `send_message` shape, after
/// stripping non-ASCII noise.
fn s_extract_send_message(s: &str) -> Option<Value> {
    let ascii: String = s.chars().filter(char::is_ascii).collect();
    let function_re = Regex::new(r#""function":\s*"send_message""#).ok()?;
    let thoughts_re = Regex::new(r#""inner_thoughts":\s*"([^"]+)""#).ok()?;
    let message_re = Regex::new(r#""message":\s*"([^"]+)""#).ok()?;

    if !function_re.is_match(&ascii) {
        return None;
    }
    let inner_thoughts = thoughts_re.captures(&ascii)?.get(1)?.as_str().to_string();
    let message = message_re.captures(&ascii)?.get(1)?.as_str().to_string();

    Some(serde_json::json!({
        "function": "send_message",
        "params": {
            "inner_thoughts": inner_thoughts,
            "message": message,
        }
    }))
}

fn replace_escaped_underscores(s: &str) -> String {
    s.replace("\\_", "_")
}

fn s_replace_underscores(s: &str) -> Option<Value> {
    strict(&replace_escaped_underscores(s))
}

fn s_replace_underscores_extract(s: &str) -> Option<Value> {
    extract_first_json(&format!("{}}}}}", replace_escaped_underscores(s)))
}

/// The declared repair order. Earlier rules are cheaper and safer.
pub const REPAIR_STRATEGIES: &[RepairStrategy] = &[
    RepairStrategy { name: "strict", apply: s_strict },
    RepairStrategy { name: "close_one_brace", apply: s_close_one },
    RepairStrategy { name: "close_two_braces", apply: s_close_two },
    RepairStrategy { name: "close_quote_and_braces", apply: s_close_quote_two },
    RepairStrategy { name: "strip_comma_close_one", apply: s_strip_comma_close_one },
    RepairStrategy { name: "strip_comma_close_two", apply: s_strip_comma_close_two },
    RepairStrategy { name: "strip_comma_close_quote", apply: s_strip_comma_close_quote_two },
    RepairStrategy { name: "escape_newlines", apply: s_escape_newlines },
    RepairStrategy { name: "repair_message_field", apply: s_repair_message_field },
    RepairStrategy { name: "extract_first_object", apply: s_extract_first_closed },
    RepairStrategy { name: "extract_send_message", apply: s_extract_send_message },
    RepairStrategy { name: "replace_escaped_underscores", apply: s_replace_underscores },
    RepairStrategy { name: "replace_underscores_extract", apply: s_replace_underscores_extract },
];

/// Run the repair pipeline over raw LLM output, stopping at the first
/// strategy that yields an object.
pub fn clean_json(raw_llm_output: &str) -> Result<Value, AgentError> {
    for strategy in REPAIR_STRATEGIES {
        if let Some(value) = (strategy.apply)(raw_llm_output) {
            if strategy.name != "strict" {
                tracing::debug!(strategy = strategy.name, "repaired malformed JSON");
            }
            return Ok(value);
        }
        tracing::trace!(strategy = strategy.name, "repair strategy failed");
    }
    Err(AgentError::Parse(raw_llm_output.to_string()))
}

/// Lenient decode of a raw tool-argument string: strict parse first, the
/// repair pipeline as the permissive fallback.
pub fn parse_json_lenient(raw: &str) -> Result<Value, AgentError> {
    if let Some(value) = strict(raw) {
        return Ok(value);
    }
    clean_json(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_passthrough() {
        let value = clean_json(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn closes_missing_braces() {
        let value = clean_json(r#"{"message": "hi""#).unwrap();
        assert_eq!(value["message"], "hi");

        let value = clean_json(r#"{"params": {"message": "hi""#).unwrap();
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn closes_missing_quote_and_braces() {
        let value = clean_json(r#"{"params": {"message": "hi"#).unwrap();
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn strips_trailing_comma() {
        let value = clean_json(r#"{"message": "hi","#).unwrap();
        assert_eq!(value["message"], "hi");
    }

    #[test]
    fn escapes_raw_newlines_inside_strings() {
        let value = clean_json("{\"message\": \"line one\nline two\"}").unwrap();
        assert_eq!(value["message"], "line one\nline two");
    }

    #[test]
    fn extracts_first_of_two_objects() {
        let value = clean_json(r#"{"message": "first"}{"message": "second"}"#).unwrap();
        assert_eq!(value["message"], "first");
    }

    #[test]
    fn recovers_send_message_shape() {
        let raw = r#"garbage "function": "send_message" noise "inner_thoughts": "thinking" more "message": "hello there" {{{"#;
        let value = clean_json(raw).unwrap();
        assert_eq!(value["function"], "send_message");
        assert_eq!(value["params"]["message"], "hello there");
    }

    #[test]
    fn replaces_escaped_underscores() {
        let raw = r#"{"function":"send\_message","params":{"inner\_thoughts":"t","message":"m"}}"#;
        let value = clean_json(raw).unwrap();
        assert_eq!(value["function"], "send_message");
    }

    #[test]
    fn exhaustion_is_a_parse_error() {
        let err = clean_json("not json at all").unwrap_err();
        assert!(matches!(err, AgentError::Parse(_)));
    }

    #[test]
    fn lenient_parse_accepts_valid_and_repairable() {
        assert!(parse_json_lenient(r#"{"a": 1}"#).is_ok());
        assert!(parse_json_lenient(r#"{"a": 1"#).is_ok());
        assert!(parse_json_lenient("[1, 2]").is_err());
    }
}
