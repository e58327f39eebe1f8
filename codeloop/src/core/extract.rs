//! Recovery of a candidate program from free-form model output.
//!
//! The model is asked for a JSON object `{"program": "...", "dependencies": [...]}`
//! but may wrap it in code fences or prose. Extraction never fails loudly: when
//! nothing usable is found it returns an empty [`GeneratedProgram`].

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::types::GeneratedProgram;

static LEADING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\A\s*```[a-z0-9_+-]*[ \t]*(?:\r?\n|\z)").unwrap());
static TRAILING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\r?\n|\A)[ \t]*```[ \t]*\s*\z").unwrap());

/// Extract a program and its declared dependencies from raw model output.
pub fn extract_program(raw: &str) -> GeneratedProgram {
    let unfenced = strip_fences(raw);
    let Some(object) = find_json_object(unfenced) else {
        return GeneratedProgram::default();
    };

    let source = match object.get("program") {
        Some(Value::String(text)) => clean_source(text),
        _ => String::new(),
    };
    if source.is_empty() {
        return GeneratedProgram::default();
    }

    let dependencies = match object.get("dependencies") {
        Some(Value::Array(items)) => normalize_dependencies(items),
        _ => Vec::new(),
    };

    GeneratedProgram {
        source,
        dependencies,
    }
}

/// Remove a single leading and trailing code fence, if present.
fn strip_fences(text: &str) -> &str {
    let start = LEADING_FENCE.find(text).map(|m| m.end()).unwrap_or(0);
    let rest = &text[start..];
    let end = TRAILING_FENCE
        .find(rest)
        .map(|m| m.start())
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Find the first balanced `{...}` span that decodes to a JSON object.
///
/// Spans that fail to decode are skipped and the search resumes after them.
fn find_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut search_from = 0usize;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        match balanced_object_end(text.as_bytes(), start) {
            Some(end) => {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..end]) {
                    return Some(map);
                }
                search_from = end;
            }
            None => search_from = start + 1,
        }
    }
    None
}

/// Byte offset one past the brace closing the object opened at `start`.
///
/// Braces inside JSON string literals do not count.
fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate().skip(start) {
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
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn clean_source(text: &str) -> String {
    let text = strip_fences(text).replace("\r\n", "\n");
    // Dedent before trimming so the first line keeps its share of the common indent.
    dedent(&text).trim_start_matches('\n').trim_end().to_string()
}

/// Remove the whitespace prefix shared by every non-blank line.
///
/// Whitespace-only lines are emptied and do not affect the common prefix.
fn dedent(text: &str) -> String {
    let mut common: Option<&str> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
        let indent = &line[..indent_len];
        common = Some(match common {
            None => indent,
            Some(prev) => common_prefix(prev, indent),
        });
    }
    let prefix = common.unwrap_or("");

    let mut out = String::with_capacity(text.len());
    for (index, line) in text.split('\n').enumerate() {
        if index > 0 {
            out.push('\n');
        }
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line.strip_prefix(prefix).unwrap_or(line));
    }
    out
}

fn common_prefix<'a>(left: &'a str, right: &str) -> &'a str {
    let len = left
        .bytes()
        .zip(right.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    &left[..len]
}

fn normalize_dependencies(items: &[Value]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in items.iter().filter_map(Value::as_str).map(str::trim) {
        if name.is_empty() || out.iter().any(|existing| existing == name) {
            continue;
        }
        out.push(name.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = "```json\n{\"program\": \"answer = 2+2\\nprint('FINAL_OUTPUT_START')\\nprint(4)\\nprint('FINAL_OUTPUT_END')\", \"dependencies\": []}\n```";

    #[test]
    fn extracts_fenced_scenario_response() {
        let program = extract_program(SCENARIO);
        assert_eq!(
            program.source,
            "answer = 2+2\nprint('FINAL_OUTPUT_START')\nprint(4)\nprint('FINAL_OUTPUT_END')"
        );
        assert!(program.dependencies.is_empty());
    }

    #[test]
    fn rewrapping_in_fences_or_prose_is_idempotent() {
        let bare = r#"{"program": "import requests\nanswer = 1", "dependencies": ["requests"]}"#;
        let expected = extract_program(bare);
        assert_eq!(expected.dependencies, vec!["requests"]);

        for wrapped in [
            format!("```json\n{bare}\n```"),
            format!("```JSON\n{bare}\n```\n"),
            format!("```\n{bare}\n```"),
            format!("Here is the program you asked for:\n\n{bare}\n\nLet me know!"),
            format!("Sure.\n```json\n{bare}\n```\nDone."),
        ] {
            assert_eq!(extract_program(&wrapped), expected, "wrapped: {wrapped}");
        }
    }

    #[test]
    fn braces_inside_code_do_not_confuse_matching() {
        let raw = r#"{"program": "d = {'a': {'b': 1}}\nprint(\"}\")\nanswer = d", "dependencies": []}"#;
        let program = extract_program(raw);
        assert_eq!(
            program.source,
            "d = {'a': {'b': 1}}\nprint(\"}\")\nanswer = d"
        );
    }

    #[test]
    fn stray_braces_in_prose_are_skipped() {
        let raw = r#"Use a set {like this} if needed. {"program": "answer = 3", "dependencies": ["numpy"]}"#;
        let program = extract_program(raw);
        assert_eq!(program.source, "answer = 3");
        assert_eq!(program.dependencies, vec!["numpy"]);
    }

    #[test]
    fn no_json_object_yields_empty_program() {
        assert!(extract_program("I cannot help with that.").is_empty());
        assert!(extract_program("").is_empty());
        assert!(extract_program("{not json at all}").is_empty());
        assert!(extract_program(r#"{"program": "x = 1""#).is_empty());
    }

    #[test]
    fn missing_or_non_string_program_yields_empty_program() {
        let program = extract_program(r#"{"dependencies": ["pandas"]}"#);
        assert_eq!(program, GeneratedProgram::default());
        assert!(extract_program(r#"{"program": 42, "dependencies": []}"#).is_empty());
        assert!(extract_program(r#"{"program": "   ", "dependencies": []}"#).is_empty());
    }

    #[test]
    fn non_array_dependencies_degrade_to_empty() {
        let program = extract_program(r#"{"program": "answer = 1", "dependencies": "pandas"}"#);
        assert_eq!(program.source, "answer = 1");
        assert!(program.dependencies.is_empty());

        let program = extract_program(r#"{"program": "answer = 1"}"#);
        assert!(program.dependencies.is_empty());
    }

    #[test]
    fn dependencies_are_trimmed_deduplicated_and_filtered() {
        let raw = r#"{"program": "answer = 1", "dependencies": [" pandas ", "", 3, "pandas", "requests"]}"#;
        assert_eq!(extract_program(raw).dependencies, vec!["pandas", "requests"]);
    }

    #[test]
    fn program_is_normalized() {
        let raw = r#"{"program": "```python\r\n\r\n    import json\r\n    if True:\r\n        answer = 1\r\n\r\n    print(answer)\r\n```", "dependencies": []}"#;
        let program = extract_program(raw);
        assert_eq!(
            program.source,
            "import json\nif True:\n    answer = 1\n\nprint(answer)"
        );
    }

    #[test]
    fn uniformly_indented_program_is_dedented() {
        let raw = r#"{"program": "    import json\n    answer = 4\n    print(answer)", "dependencies": []}"#;
        assert_eq!(
            extract_program(raw).source,
            "import json\nanswer = 4\nprint(answer)"
        );

        let raw = r#"{"program": "\n\n    if True:\n        answer = 1\n    print(answer)\n   \n", "dependencies": []}"#;
        assert_eq!(
            extract_program(raw).source,
            "if True:\n    answer = 1\nprint(answer)"
        );
    }

    #[test]
    fn dedent_keeps_relative_indentation() {
        assert_eq!(dedent("  a\n    b\n  c"), "a\n  b\nc");
        assert_eq!(dedent("\ta\n\t\tb"), "a\n\tb");
        assert_eq!(dedent("a\n  b"), "a\n  b");
        assert_eq!(dedent("  a\n   \n  b"), "a\n\nb");
    }

    #[test]
    fn balanced_end_handles_escapes() {
        let text = r#"{"a": "quote \" and brace }"}tail"#;
        let end = balanced_object_end(text.as_bytes(), 0).expect("balanced");
        assert_eq!(&text[end..], "tail");
        assert_eq!(balanced_object_end(b"{\"a\": {", 0), None);
    }
}
