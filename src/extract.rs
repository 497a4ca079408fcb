use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use thiserror::Error;

use crate::redact::redact_secrets;
use crate::repair::repair_json;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```(?:json)?\s*").expect("code fence pattern is valid"));

/// Returned when no stage could turn a completion into JSON. Carries the
/// label and the last stage tried; the underlying failure is only logged.
#[derive(Debug, Error)]
#[error("{label} completion could not be parsed (last stage: {stage})")]
pub struct ParseError {
    pub label: String,
    pub stage: &'static str,
}

type Attempt = fn(&str) -> Result<Value, String>;

/// Ordered fallback chain; the first stage that yields JSON wins.
const STAGES: [(&str, Attempt); 4] = [
    ("direct", parse_direct),
    ("unfenced", parse_unfenced),
    ("extracted", parse_extracted),
    ("repaired", parse_repaired),
];

pub fn parse_completion(raw: &str, label: &str) -> Result<Value, ParseError> {
    let mut last_failure = String::new();
    for (stage, attempt) in STAGES {
        match attempt(raw) {
            Ok(value) => {
                if stage != "direct" {
                    tracing::debug!(label = %label, stage = stage, "completion parsed after fallback");
                }
                return Ok(value);
            }
            Err(err) => last_failure = err,
        }
    }

    tracing::error!(
        label = %label,
        error = %redact_secrets(&last_failure),
        "completion JSON repair failed"
    );
    Err(ParseError {
        label: label.to_string(),
        stage: STAGES[STAGES.len() - 1].0,
    })
}

/// Removes Markdown code fences, with or without a `json` tag.
pub fn strip_code_fences(raw: &str) -> String {
    CODE_FENCE.replace_all(raw, "").into_owned()
}

/// Returns the first balanced `{...}` object in `raw`, skipping braces that
/// sit inside string literals.
pub fn extract_first_json_object(raw: &str) -> Option<&str> {
    let s = raw.trim();
    let start = s.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in s[start..].char_indices() {
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
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return Some(&s[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

fn parse_direct(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn parse_unfenced(raw: &str) -> Result<Value, String> {
    parse_direct(&strip_code_fences(raw))
}

fn extraction_input(raw: &str) -> String {
    let unfenced = strip_code_fences(raw);
    match extract_first_json_object(&unfenced) {
        Some(object) => object.to_string(),
        None => unfenced,
    }
}

fn parse_extracted(raw: &str) -> Result<Value, String> {
    parse_direct(&extraction_input(raw))
}

fn parse_repaired(raw: &str) -> Result<Value, String> {
    let repaired = repair_json(&extraction_input(raw)).map_err(|e| e.to_string())?;
    parse_direct(&repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_a_simple_object() {
        assert_eq!(
            extract_first_json_object(r#"{"key": "value"}"#),
            Some(r#"{"key": "value"}"#)
        );
    }

    #[test]
    fn extracts_object_from_surrounding_text() {
        let input = r#"Here is the result: {"word": "hello"} and trailing text"#;
        assert_eq!(extract_first_json_object(input), Some(r#"{"word": "hello"}"#));
    }

    #[test]
    fn extracts_nested_objects() {
        let input = r#"{"outer": {"inner": 1}} {"second": 2}"#;
        assert_eq!(
            extract_first_json_object(input),
            Some(r#"{"outer": {"inner": 1}}"#)
        );
    }

    #[test]
    fn braces_inside_strings_do_not_move_depth() {
        let input = r#"{"text": "a { b } c"}"#;
        assert_eq!(extract_first_json_object(input), Some(input));
    }

    #[test]
    fn escaped_quotes_stay_inside_strings() {
        let input = r#"{"text": "say \"hello\" }"}"#;
        assert_eq!(extract_first_json_object(input), Some(input));
    }

    #[test]
    fn no_object_or_unbalanced_object_yields_none() {
        assert_eq!(extract_first_json_object("no json here"), None);
        assert_eq!(extract_first_json_object(""), None);
        assert_eq!(extract_first_json_object(r#"{"open": {"#), None);
    }

    #[test]
    fn strips_tagged_and_plain_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}\n");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}\n");
        assert_eq!(strip_code_fences("```JSON\n{\"a\":1}\n```"), "{\"a\":1}\n");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn clean_json_parses_like_serde() {
        let raw = r#"{"word":"test"}"#;
        let expected: Value = serde_json::from_str(raw).expect("json");
        assert_eq!(parse_completion(raw, "Test").expect("parsed"), expected);
    }

    #[test]
    fn fenced_json_parses() {
        assert_eq!(
            parse_completion("```json\n{\"a\":1}\n```", "Test").expect("parsed"),
            json!({"a": 1})
        );
    }

    #[test]
    fn reasoning_preamble_and_trailer_are_discarded() {
        let raw = "Thinking about it...\n{\"word\": \"hello\", \"items\": []}\nHope this helps {not json}";
        assert_eq!(
            parse_completion(raw, "Test").expect("parsed"),
            json!({"word": "hello", "items": []})
        );
    }

    #[test]
    fn unterminated_string_is_repaired() {
        assert_eq!(
            parse_completion(r#"{"word": "test}"#, "Test").expect("parsed"),
            json!({"word": "test"})
        );
    }

    #[test]
    fn trailing_comma_inside_fence_is_repaired() {
        let raw = "```json\n{\"word\": \"swift\", \"items\": [],}\n```";
        assert_eq!(
            parse_completion(raw, "Test").expect("parsed"),
            json!({"word": "swift", "items": []})
        );
    }

    #[test]
    fn hopeless_input_fails_with_generic_error() {
        let err = parse_completion("   ", "Lookup").expect_err("should fail");
        assert_eq!(err.label, "Lookup");
        assert_eq!(err.stage, "repaired");
        assert!(!err.to_string().contains("unexpected end"));
    }
}
