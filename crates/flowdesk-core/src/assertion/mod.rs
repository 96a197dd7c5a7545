//! Assertion engine - evaluates declarative checks against JSON outputs.
//!
//! An assertion picks a source value (a step's output when `stepId` is set,
//! otherwise the run's final output), resolves `path` inside it and compares
//! the result with `expectedValue` using the named assertion type.
//!
//! Paths accept `.`-separated keys and `[index]` / `["key"]` brackets, with
//! an optional leading `$` or `$.`. `length` on an array or string yields its
//! length. A missing value resolves to `None` ("undefined") instead of
//! failing.
//!
//! Evaluation never propagates an error: invalid patterns, unknown types and
//! panicking custom predicates all become failed results.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::assertion::{AssertionResult, AssertionType, TestAssertion};

/// User-supplied check over `(actual, expected)`.
pub type Predicate =
    Arc<dyn Fn(Option<&Value>, Option<&Value>) -> Result<bool, String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionSummary {
    pub results: Vec<AssertionResult>,
    pub passed: u32,
    pub failed: u32,
    pub total: u32,
}

// ─── Path resolution ──────────────────────────────────────────────────────

/// Resolve `path` inside `value`. An empty path or bare `$` is the root.
pub fn resolve_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    let mut length: Option<usize> = None;

    for key in parse_path(path) {
        if length.is_some() {
            // Nothing lives under a length.
            return None;
        }
        match current {
            Value::Object(map) => current = map.get(&key)?,
            Value::Array(items) => {
                if key == "length" {
                    length = Some(items.len());
                } else {
                    current = items.get(key.parse::<usize>().ok()?)?;
                }
            }
            Value::String(s) if key == "length" => length = Some(s.chars().count()),
            _ => return None,
        }
    }

    match length {
        Some(n) => Some(Value::from(n)),
        None => Some(current.clone()),
    }
}

fn parse_path(path: &str) -> Vec<String> {
    let trimmed = path.trim();
    let rest = if let Some(r) = trimmed.strip_prefix("$.") {
        r
    } else if let Some(r) = trimmed.strip_prefix('$') {
        r
    } else {
        trimmed
    };

    let mut keys = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;

    for c in rest.chars() {
        match c {
            '.' if !in_bracket => {
                if !current.is_empty() {
                    keys.push(std::mem::take(&mut current));
                }
            }
            '[' if !in_bracket => {
                if !current.is_empty() {
                    keys.push(std::mem::take(&mut current));
                }
                in_bracket = true;
            }
            ']' if in_bracket => {
                keys.push(unquote(current.trim()).to_string());
                current.clear();
                in_bracket = false;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        keys.push(current);
    }
    keys
}

fn unquote(s: &str) -> &str {
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

// ─── Structural equality ──────────────────────────────────────────────────

/// Structural equality. Numbers compare by value (`1 == 1.0`); `null` only
/// equals `null`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| deep_equal(v, w)))
        }
        _ => false,
    }
}

fn optional_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => deep_equal(a, b),
        (None, None) => true,
        _ => false,
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct AssertionEngine {
    predicates: HashMap<String, Predicate>,
}

impl AssertionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate for `custom` assertions naming it in
    /// `options.predicate`.
    pub fn register_predicate<F>(&mut self, name: &str, predicate: F)
    where
        F: Fn(Option<&Value>, Option<&Value>) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.predicates.insert(name.to_string(), Arc::new(predicate));
    }

    pub fn evaluate(
        &self,
        assertion: &TestAssertion,
        final_output: &Value,
        step_outputs: &HashMap<String, Value>,
    ) -> AssertionResult {
        let source = match &assertion.step_id {
            Some(step_id) => step_outputs.get(step_id),
            None => Some(final_output),
        };
        let actual = source.and_then(|s| resolve_path(s, &assertion.path));
        let expected = assertion.expected_value.as_ref();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.check(assertion, actual.as_ref(), expected)
        }));

        let (passed, message) = match outcome {
            Ok(Ok((passed, description))) => {
                let verdict = if passed { "Passed" } else { "Failed" };
                (passed, format!("{}: {}", verdict, description))
            }
            Ok(Err(error)) => (false, format!("Error: {}", error)),
            Err(panic) => (false, format!("Error: {}", panic_message(panic.as_ref()))),
        };

        AssertionResult {
            assertion_id: assertion.id.clone(),
            name: assertion.name.clone(),
            passed,
            actual_value: actual,
            expected_value: assertion.expected_value.clone(),
            message,
        }
    }

    /// Evaluate every assertion; an early failure never stops later ones.
    pub fn evaluate_all(
        &self,
        assertions: &[TestAssertion],
        final_output: &Value,
        step_outputs: &HashMap<String, Value>,
    ) -> AssertionSummary {
        let results: Vec<AssertionResult> = assertions
            .iter()
            .map(|a| self.evaluate(a, final_output, step_outputs))
            .collect();
        let passed = results.iter().filter(|r| r.passed).count() as u32;
        let total = results.len() as u32;
        AssertionSummary {
            results,
            passed,
            failed: total - passed,
            total,
        }
    }

    /// Returns `(passed, description)`, or an evaluation error.
    fn check(
        &self,
        assertion: &TestAssertion,
        actual: Option<&Value>,
        expected: Option<&Value>,
    ) -> Result<(bool, String), String> {
        let a = display(actual);
        let e = display(expected);
        let case_sensitive = assertion.options.case_sensitive.unwrap_or(true);

        let result = match assertion.assertion_type {
            AssertionType::Equals => (
                optional_equal(actual, expected),
                format!("expected {} to equal {}", a, e),
            ),
            AssertionType::NotEquals => (
                !optional_equal(actual, expected),
                format!("expected {} not to equal {}", a, e),
            ),
            AssertionType::Contains => (
                contains(actual, expected, case_sensitive)?,
                format!("expected {} to contain {}", a, e),
            ),
            AssertionType::NotContains => (
                !contains(actual, expected, case_sensitive)?,
                format!("expected {} not to contain {}", a, e),
            ),
            AssertionType::GreaterThan => {
                let (x, y) = numeric_pair(actual, expected)?;
                (x > y, format!("expected {} > {}", x, y))
            }
            AssertionType::LessThan => {
                let (x, y) = numeric_pair(actual, expected)?;
                (x < y, format!("expected {} < {}", x, y))
            }
            AssertionType::GreaterOrEqual => {
                let (x, y) = numeric_pair(actual, expected)?;
                (x >= y, format!("expected {} >= {}", x, y))
            }
            AssertionType::LessOrEqual => {
                let (x, y) = numeric_pair(actual, expected)?;
                (x <= y, format!("expected {} <= {}", x, y))
            }
            AssertionType::IsTrue => (is_true(actual), format!("expected {} to be true", a)),
            AssertionType::IsFalse => (is_false(actual), format!("expected {} to be false", a)),
            AssertionType::IsNull => (is_null(actual), format!("expected {} to be null", a)),
            AssertionType::IsNotNull => {
                (!is_null(actual), format!("expected {} not to be null", a))
            }
            AssertionType::IsEmpty => (is_empty(actual), format!("expected {} to be empty", a)),
            AssertionType::IsNotEmpty => {
                (!is_empty(actual), format!("expected {} not to be empty", a))
            }
            AssertionType::Matches => {
                let regex = build_regex(assertion, expected)?;
                let passed = matches!(actual, Some(Value::String(s)) if regex.is_match(s));
                (passed, format!("expected {} to match /{}/", a, regex.as_str()))
            }
            AssertionType::HasProperty => (
                has_property(actual, expected)?,
                format!("expected {} to have property {}", a, e),
            ),
            AssertionType::HasLength => {
                let want = to_number(expected)
                    .ok_or_else(|| format!("hasLength needs a numeric expected value, got {}", e))?;
                let len = length_of(actual).ok_or_else(|| format!("{} has no length", a))?;
                (
                    len as f64 == want,
                    format!("expected length {} to be {}", len, want),
                )
            }
            AssertionType::Custom => {
                let name = assertion
                    .options
                    .predicate
                    .as_deref()
                    .ok_or_else(|| "custom assertion needs options.predicate".to_string())?;
                let predicate = self
                    .predicates
                    .get(name)
                    .ok_or_else(|| format!("no predicate registered as '{}'", name))?;
                (
                    predicate(actual, expected)?,
                    format!("expected {} to satisfy {}", a, name),
                )
            }
            AssertionType::Unknown => return Err("unknown assertion type".to_string()),
        };
        Ok(result)
    }
}

// ─── Comparison helpers ───────────────────────────────────────────────────

fn display(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(v) => v.to_string(),
    }
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

/// Numeric coercion: numbers, numeric strings and booleans.
fn to_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn numeric_pair(actual: Option<&Value>, expected: Option<&Value>) -> Result<(f64, f64), String> {
    let x = to_number(actual).ok_or_else(|| format!("{} is not numeric", display(actual)))?;
    let y = to_number(expected).ok_or_else(|| format!("{} is not numeric", display(expected)))?;
    Ok((x, y))
}

fn contains(
    actual: Option<&Value>,
    expected: Option<&Value>,
    case_sensitive: bool,
) -> Result<bool, String> {
    let expected = expected.ok_or_else(|| "contains needs an expected value".to_string())?;
    match actual {
        Some(Value::String(haystack)) => {
            let needle = match expected {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if case_sensitive {
                Ok(haystack.contains(&needle))
            } else {
                Ok(haystack.to_lowercase().contains(&needle.to_lowercase()))
            }
        }
        Some(Value::Array(items)) => Ok(items.iter().any(|item| match (item, expected) {
            (Value::String(x), Value::String(y)) if !case_sensitive => {
                x.to_lowercase() == y.to_lowercase()
            }
            _ => deep_equal(item, expected),
        })),
        other => Err(format!(
            "contains needs a string or array, got {}",
            type_name(other)
        )),
    }
}

fn is_true(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn is_false(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => !*b,
        Some(Value::String(s)) => s == "false",
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Bool(b)) => !*b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
    }
}

fn length_of(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn has_property(actual: Option<&Value>, expected: Option<&Value>) -> Result<bool, String> {
    let key = match expected {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        other => return Err(format!("hasProperty needs a property name, got {}", type_name(other))),
    };
    let Some(target) = actual else {
        return Ok(false);
    };
    Ok(match target {
        Value::Object(map) if map.contains_key(&key) => true,
        Value::Object(_) | Value::Array(_) => resolve_path(target, &key).is_some(),
        _ => false,
    })
}

/// Pattern from `options.pattern`, else the expected value. A `/body/flags`
/// literal is accepted as well.
fn build_regex(assertion: &TestAssertion, expected: Option<&Value>) -> Result<regex::Regex, String> {
    let raw = match (&assertion.options.pattern, expected) {
        (Some(p), _) => p.clone(),
        (None, Some(Value::String(s))) => s.clone(),
        _ => return Err("matches needs a pattern".to_string()),
    };
    let mut flags = assertion.options.flags.clone().unwrap_or_default();
    let mut body = raw.as_str();
    if raw.len() >= 2 && raw.starts_with('/') {
        if let Some(end) = raw.rfind('/').filter(|&i| i > 0) {
            body = &raw[1..end];
            flags.push_str(&raw[end + 1..]);
        }
    }

    regex::RegexBuilder::new(body)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|e| format!("invalid pattern: {}", e))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "assertion panicked".to_string()
    }
}
