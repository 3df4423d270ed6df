//! Robust JSON salvage for LLM replies.
//!
//! Models wrap JSON in prose, code fences and BOMs, leave trailing commas,
//! and emit Python literals. The salvage pipeline: strip BOM and fences,
//! try a direct parse, locate the first balanced object or array, apply
//! soft repairs, and parse again. A root-level array is wrapped as
//! `{"list": ...}` so callers always receive an object.

use serde_json::Value;

/// Attempt to recover a JSON object from a raw LLM reply.
pub fn salvage_json(raw: &str) -> Option<Value> {
    let cleaned = clean(raw);
    if cleaned.is_empty() {
        return None;
    }
    if let Some(parsed) = try_parse(&cleaned) {
        return Some(parsed);
    }
    let candidate = extract_balanced(&cleaned)?;
    if let Some(parsed) = try_parse(candidate) {
        return Some(parsed);
    }
    try_parse(&soft_repair(candidate))
}

/// Strip a UTF-8 BOM, surrounding whitespace and Markdown fences.
fn clean(raw: &str) -> String {
    let mut s = raw.trim_start_matches('\u{feff}').trim();
    for prefix in ["```json", "```", "~~~"] {
        if let Some(stripped) = s.strip_prefix(prefix) {
            s = stripped;
            break;
        }
    }
    for suffix in ["```", "~~~"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped;
            break;
        }
    }
    s.trim().to_string()
}

fn try_parse(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(Value::Array(items)) => Some(serde_json::json!({"list": items})),
        Ok(obj @ Value::Object(_)) => Some(obj),
        _ => None,
    }
}

/// Slice out the first balanced `{...}` or `[...]` region, respecting
/// string literals and escapes.
fn extract_balanced(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    // Unbalanced: fall back to the widest slice ending at the last closer.
    let end = bytes.iter().rposition(|&b| b == close)?;
    if end > start {
        Some(&s[start..=end])
    } else {
        None
    }
}

/// Soft repairs: Python literals, trailing commas, all-single-quote text.
fn soft_repair(s: &str) -> String {
    let mut fixed = s
        .replace(": None", ": null")
        .replace(" None", " null")
        .replace(": True", ": true")
        .replace(" True", " true")
        .replace(": False", ": false")
        .replace(" False", " false");
    fixed = strip_trailing_commas(&fixed);
    if !fixed.contains('"') && fixed.matches('\'').count() >= 2 {
        fixed = fixed.replace('\'', "\"");
    }
    fixed
}

/// Remove commas that directly precede a closing brace or bracket.
fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let c = chars[index];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            index += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            index += 1;
            continue;
        }
        if c == ',' {
            // Look ahead past whitespace for a closer.
            let mut ahead = index + 1;
            while ahead < chars.len() && chars[ahead].is_whitespace() {
                ahead += 1;
            }
            if ahead < chars.len() && (chars[ahead] == '}' || chars[ahead] == ']') {
                index += 1;
                continue;
            }
        }
        out.push(c);
        index += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_object() {
        assert_eq!(salvage_json(r#"{"a": 1}"#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_bom_and_fences() {
        let raw = "\u{feff}```json\n{\"a\": 1}\n```";
        assert_eq!(salvage_json(raw), Some(json!({"a": 1})));
    }

    #[test]
    fn test_prose_wrapped_object() {
        let raw = "Sure! Here is the plan:\n{\"graph_operations\": []}\nLet me know.";
        assert_eq!(salvage_json(raw), Some(json!({"graph_operations": []})));
    }

    #[test]
    fn test_array_root_wrapped_as_list() {
        assert_eq!(salvage_json("[1, 2, 3]"), Some(json!({"list": [1, 2, 3]})));
    }

    #[test]
    fn test_trailing_comma_repaired() {
        assert_eq!(salvage_json(r#"{"a": 1, "b": [1, 2,],}"#), Some(json!({"a": 1, "b": [1, 2]})));
    }

    #[test]
    fn test_python_literals_repaired() {
        assert_eq!(
            salvage_json(r#"{"done": True, "error": None, "retry": False}"#),
            Some(json!({"done": true, "error": null, "retry": false}))
        );
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let raw = r#"noise {"payload": "a } tricky { string"} trailing"#;
        assert_eq!(
            salvage_json(raw),
            Some(json!({"payload": "a } tricky { string"}))
        );
    }

    #[test]
    fn test_hopeless_input_is_none() {
        assert_eq!(salvage_json("no json here at all"), None);
        assert_eq!(salvage_json(""), None);
    }
}
