//! Recovery parsing of annotation payloads from model responses.
//!
//! Model output rarely arrives as a bare JSON array. This module tries a
//! fixed sequence of extraction strategies against the raw response text and
//! returns the first candidate that both parses as JSON and passes structural
//! validation:
//!
//! 1. JSON inside a fenced code block (```json ... ``` or ``` ... ```)
//! 2. First balanced array anywhere in the content
//! 3. A JSON object wrapping the array under a known key
//! 4. Adjacent top-level objects aggregated into an array
//! 5. Tolerant cleanup of near-JSON text, then strategies 1-4 again
//!
//! Each strategy failure is recorded; if nothing succeeds the error carries
//! the per-strategy detail so the log shows why every attempt was rejected.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// One annotated sub-unit of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationUnit {
    /// Sub-unit identifier, e.g. `"S3"` for the third unit.
    pub id: String,
    /// Primary label assigned to the unit.
    pub primary: String,
    /// Secondary labels, possibly empty.
    pub secondary: Vec<String>,
}

/// Parsing failure after every strategy was exhausted, or rejection by a
/// caller-supplied validator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no parsing strategy produced a valid annotation list: {detail}")]
    AllStrategiesFailed { detail: String },
    #[error("annotations rejected by custom validation: {0}")]
    CustomValidation(String),
}

/// Domain-specific second validation pass, applied after structural
/// validation succeeds.
pub trait CustomValidator: Send + Sync {
    /// Returns a rejection reason if the units fail the check.
    fn validate(&self, units: &[AnnotationUnit]) -> Result<(), String>;
}

/// Parses `content` into annotation units using every recovery strategy.
pub fn parse_annotations(content: &str) -> Result<Vec<AnnotationUnit>, ParseError> {
    parse_annotations_with(content, None)
}

/// Like [`parse_annotations`], with an optional custom validation pass.
///
/// The validator runs only on structurally valid output, so its rejection is
/// reported as [`ParseError::CustomValidation`] rather than folded into the
/// strategy failures.
pub fn parse_annotations_with(
    content: &str,
    validator: Option<&dyn CustomValidator>,
) -> Result<Vec<AnnotationUnit>, ParseError> {
    let trimmed = content.trim();
    let mut failures: Vec<String> = Vec::new();

    let units = run_strategies(trimmed, &mut failures).ok_or_else(|| {
        ParseError::AllStrategiesFailed {
            detail: failures.join("; "),
        }
    })?;

    if let Some(validator) = validator {
        validator
            .validate(&units)
            .map_err(ParseError::CustomValidation)?;
    }
    Ok(units)
}

fn run_strategies(content: &str, failures: &mut Vec<String>) -> Option<Vec<AnnotationUnit>> {
    let strategies: [(&str, fn(&str) -> Option<String>); 4] = [
        ("code-fence", extract_from_code_fence),
        ("balanced-array", extract_balanced_array),
        ("wrapper-object", extract_from_wrapper_object),
        ("adjacent-objects", extract_adjacent_objects),
    ];

    for (name, strategy) in strategies {
        match try_strategy(name, strategy, content) {
            Ok(units) => return Some(units),
            Err(reason) => failures.push(reason),
        }
    }

    // Last resort: repair common near-JSON defects and retry everything.
    let cleaned = tolerant_cleanup(content);
    if cleaned != content {
        for (name, strategy) in strategies {
            match try_strategy(name, strategy, &cleaned) {
                Ok(units) => {
                    debug!(strategy = name, "Parsed annotations after tolerant cleanup");
                    return Some(units);
                }
                Err(reason) => failures.push(format!("cleaned/{reason}")),
            }
        }
    } else {
        failures.push("tolerant-cleanup: no repairs applied".to_string());
    }

    None
}

fn try_strategy(
    name: &str,
    strategy: fn(&str) -> Option<String>,
    content: &str,
) -> Result<Vec<AnnotationUnit>, String> {
    let candidate = strategy(content).ok_or_else(|| format!("{name}: no candidate found"))?;
    let value: Value = serde_json::from_str(&candidate)
        .map_err(|e| format!("{name}: candidate is not valid JSON ({e})"))?;
    let units = validate_structure(&value).map_err(|e| format!("{name}: {e}"))?;
    debug!(strategy = name, units = units.len(), "Annotation list recovered");
    Ok(units)
}

/// Checks the decoded value against the required annotation shape.
///
/// The value must be a non-empty array; every element must be an object with
/// a non-empty string `id`, a non-empty string `primary`, and a `secondary`
/// array of strings. A missing or null `secondary` invalidates the element.
fn validate_structure(value: &Value) -> Result<Vec<AnnotationUnit>, String> {
    let items = value.as_array().ok_or("top-level value is not an array")?;
    if items.is_empty() {
        return Err("annotation list is empty".to_string());
    }

    let mut units = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| format!("element {i} is not an object"))?;

        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| format!("element {i} lacks a non-empty string 'id'"))?;
        let primary = obj
            .get("primary")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| format!("element {i} lacks a non-empty string 'primary'"))?;

        let secondary = match obj.get("secondary") {
            Some(Value::Array(values)) => {
                let mut labels = Vec::with_capacity(values.len());
                for v in values {
                    let label = v.as_str().ok_or_else(|| {
                        format!("element {i} has a non-string entry in 'secondary'")
                    })?;
                    labels.push(label.to_string());
                }
                labels
            }
            Some(_) => return Err(format!("element {i} has a non-array 'secondary'")),
            None => return Err(format!("element {i} lacks a 'secondary' list")),
        };

        units.push(AnnotationUnit {
            id: id.to_string(),
            primary: primary.to_string(),
            secondary,
        });
    }
    Ok(units)
}

/// Strategy 1: JSON inside a markdown code fence, with or without a language
/// tag.
fn extract_from_code_fence(content: &str) -> Option<String> {
    let re = Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").ok()?;
    for caps in re.captures_iter(content) {
        let block = caps.get(1)?.as_str().trim();
        if let Some(candidate) = extract_balanced_array(block) {
            return Some(candidate);
        }
        // A fenced wrapper object also counts; later validation unwraps it
        // via the wrapper-object strategy, so hand back the object itself.
        if block.starts_with('{') {
            if let Some(end) = find_matching_brace(block) {
                if let Some(inner) = unwrap_annotation_array(&block[..=end]) {
                    return Some(inner);
                }
            }
        }
    }
    None
}

/// Strategy 2: first balanced `[...]` anywhere in the content.
fn extract_balanced_array(content: &str) -> Option<String> {
    let start = content.find('[')?;
    let end = find_matching_bracket(&content[start..])?;
    Some(content[start..=start + end].to_string())
}

/// Strategy 3: a JSON object whose annotation list hides under a wrapper key.
fn extract_from_wrapper_object(content: &str) -> Option<String> {
    let start = content.find('{')?;
    let end = find_matching_brace(&content[start..])?;
    unwrap_annotation_array(&content[start..=start + end])
}

/// Wrapper keys checked in order; if none match, the first field holding an
/// array is taken.
const WRAPPER_KEYS: [&str; 4] = ["annotations", "result", "data", "choices"];

fn unwrap_annotation_array(candidate: &str) -> Option<String> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;

    for key in WRAPPER_KEYS {
        if let Some(inner @ Value::Array(_)) = obj.get(key) {
            return serde_json::to_string(inner).ok();
        }
    }
    for inner in obj.values() {
        if inner.is_array() {
            return serde_json::to_string(inner).ok();
        }
    }
    None
}

/// Strategy 4: a run of top-level objects with no enclosing array, emitted
/// one per unit. Collects every balanced object and aggregates them.
fn extract_adjacent_objects(content: &str) -> Option<String> {
    let mut objects: Vec<String> = Vec::new();
    let mut rest = content;
    let mut offset = 0;

    while let Some(start) = rest.find('{') {
        let substr = &rest[start..];
        match find_matching_brace(substr) {
            Some(end) => {
                let candidate = &substr[..=end];
                if serde_json::from_str::<Value>(candidate).is_ok() {
                    objects.push(candidate.to_string());
                }
                offset = start + end + 1;
            }
            None => break,
        }
        rest = &rest[offset..];
        offset = 0;
    }

    if objects.len() < 2 {
        return None;
    }
    Some(format!("[{}]", objects.join(",")))
}

/// Repairs common near-JSON defects emitted by models:
/// smart quotes, line and block comments, Python literals, trailing commas,
/// and back-to-back objects missing a separating comma.
fn tolerant_cleanup(content: &str) -> String {
    let mut text = content
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    text = strip_comments(&text);
    text = replace_python_literals(&text);

    // Trailing commas before a closing brace or bracket.
    let trailing = Regex::new(r",\s*([}\]])").map(|re| re.replace_all(&text, "$1").into_owned());
    if let Ok(repaired) = trailing {
        text = repaired;
    }
    // Objects butted together without the separating comma.
    let butted = Regex::new(r"\}\s*\{").map(|re| re.replace_all(&text, "},{").into_owned());
    if let Ok(repaired) = butted {
        text = repaired;
    }
    text
}

/// Removes `//` line comments and `/* */` block comments outside strings.
fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '/' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Replaces bare Python literals (`True`, `False`, `None`) outside strings.
fn replace_python_literals(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut in_string = false;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        let rest = &s[i..];
        let replaced = [("True", "true"), ("False", "false"), ("None", "null")]
            .iter()
            .find(|(lit, _)| {
                rest.starts_with(lit)
                    && !rest[lit.len()..]
                        .chars()
                        .next()
                        .is_some_and(|n| n.is_alphanumeric() || n == '_')
            })
            .map(|(lit, sub)| (lit.len(), *sub));
        match replaced {
            Some((len, sub)) => {
                out.push_str(sub);
                i += len;
            }
            None => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Finds the matching `}` for a string starting with `{`, skipping braces
/// inside string literals and escape sequences.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Finds the matching `]` for a string starting with `[`, skipping brackets
/// inside string literals and escape sequences.
pub fn find_matching_bracket(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
