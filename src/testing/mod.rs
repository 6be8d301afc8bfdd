//! # Assertions
//!
//! Checks evaluated by `test` script steps against the response of the
//! current item.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http::client::CookieRecord;
use crate::http::response::ResponseRecord;

/// Target of an assertion within the HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "camelCase")]
pub enum AssertionTarget {
    StatusCode,
    Header { name: String },
    JsonPath { path: String },
    Body,
    ResponseTime,
    Cookie { name: String },
}

/// Comparison operator for an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    Matches,
}

/// A single assertion that can be evaluated against a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    #[serde(flatten)]
    pub target: AssertionTarget,
    pub operator: AssertionOperator,
    #[serde(default)]
    pub expected: String,
}

/// Result of evaluating a named assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Assertion {
    /// Evaluate against the response. `Err` means the assertion itself is
    /// broken (bad regex, bad JSON path, body that is not JSON) and is
    /// raised as a script exception rather than a failed test.
    pub fn evaluate(
        &self,
        name: &str,
        response: Option<&ResponseRecord>,
        cookies: &[CookieRecord],
    ) -> Result<AssertionResult, String> {
        let Some(response) = response else {
            return Ok(AssertionResult {
                name: name.to_string(),
                passed: false,
                actual: None,
                message: Some("No response available".into()),
            });
        };

        let actual = self.actual_value(response, cookies)?;
        let (passed, message) = self.compare(actual.as_deref())?;

        Ok(AssertionResult {
            name: name.to_string(),
            passed,
            actual,
            message: if passed { None } else { Some(message) },
        })
    }

    fn actual_value(
        &self,
        response: &ResponseRecord,
        cookies: &[CookieRecord],
    ) -> Result<Option<String>, String> {
        Ok(match &self.target {
            AssertionTarget::StatusCode => Some(response.status.to_string()),
            AssertionTarget::Header { name } => response.header(name).map(str::to_string),
            AssertionTarget::Body => Some(response.body.clone()),
            AssertionTarget::ResponseTime => Some(response.time.to_string()),
            AssertionTarget::Cookie { name } => cookies
                .iter()
                .find(|c| &c.name == name)
                .map(|c| c.value.clone())
                .or_else(|| response.set_cookie(name)),
            AssertionTarget::JsonPath { path } => {
                let json = response.json()?;
                select_json(&json, path)?
            }
        })
    }

    fn compare(&self, actual: Option<&str>) -> Result<(bool, String), String> {
        let expected = self.expected.as_str();
        let describe = || match actual {
            Some(value) => format!("`{value}`"),
            None => "nothing".to_string(),
        };

        let outcome = match self.operator {
            AssertionOperator::Exists => (actual.is_some(), "Expected a value, found nothing".to_string()),
            AssertionOperator::NotExists => (
                actual.is_none(),
                format!("Expected nothing, found {}", describe()),
            ),
            AssertionOperator::Equals => (
                actual == Some(expected),
                format!("Expected `{expected}`, got {}", describe()),
            ),
            AssertionOperator::NotEquals => (
                actual.is_some() && actual != Some(expected),
                format!("Expected a value other than `{expected}`, got {}", describe()),
            ),
            AssertionOperator::Contains => (
                actual.is_some_and(|a| a.contains(expected)),
                format!("Expected {} to contain `{expected}`", describe()),
            ),
            AssertionOperator::GreaterThan | AssertionOperator::LessThan => {
                let greater = self.operator == AssertionOperator::GreaterThan;
                let ordered = match (actual.and_then(parse_number), parse_number(expected)) {
                    (Some(a), Some(e)) => {
                        if greater {
                            a > e
                        } else {
                            a < e
                        }
                    }
                    _ => false,
                };
                let relation = if greater { "greater" } else { "less" };
                (
                    ordered,
                    format!("Expected {} to be {relation} than `{expected}`", describe()),
                )
            }
            AssertionOperator::Matches => {
                let pattern =
                    Regex::new(expected).map_err(|err| format!("Invalid regex `{expected}`: {err}"))?;
                (
                    actual.is_some_and(|a| pattern.is_match(a)),
                    format!("Expected {} to match `{expected}`", describe()),
                )
            }
        };
        Ok(outcome)
    }
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// First match of `path` in `json`, rendered as text. Strings are returned
/// without quotes.
pub fn select_json(json: &Value, path: &str) -> Result<Option<String>, String> {
    let path = if path.starts_with('$') {
        path.to_string()
    } else {
        format!("$.{path}")
    };
    let selected =
        jsonpath_lib::select(json, &path).map_err(|err| format!("Invalid JSON path `{path}`: {err:?}"))?;
    Ok(selected.first().map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::KeyValue;

    fn response() -> ResponseRecord {
        ResponseRecord {
            status: 200,
            status_text: "OK".into(),
            headers: vec![
                KeyValue::new("Content-Type", "application/json"),
                KeyValue::new("Set-Cookie", "sid=xyz; Path=/"),
            ],
            body: r#"{"user":{"name":"ada","age":36},"tags":["a","b"]}"#.into(),
            time: 42,
            size: 48,
            content_type: "application/json".into(),
        }
    }

    fn assertion(target: AssertionTarget, operator: AssertionOperator, expected: &str) -> Assertion {
        Assertion {
            target,
            operator,
            expected: expected.into(),
        }
    }

    fn run(a: &Assertion) -> AssertionResult {
        a.evaluate("t", Some(&response()), &[]).unwrap()
    }

    #[test]
    fn status_equals() {
        let a = assertion(AssertionTarget::StatusCode, AssertionOperator::Equals, "200");
        assert!(run(&a).passed);
        let a = assertion(AssertionTarget::StatusCode, AssertionOperator::Equals, "201");
        let result = run(&a);
        assert!(!result.passed);
        assert_eq!(result.message.as_deref(), Some("Expected `201`, got `200`"));
    }

    #[test]
    fn json_path_values() {
        let name = AssertionTarget::JsonPath {
            path: "user.name".into(),
        };
        assert!(run(&assertion(name.clone(), AssertionOperator::Equals, "ada")).passed);

        let age = AssertionTarget::JsonPath {
            path: "$.user.age".into(),
        };
        assert!(run(&assertion(age.clone(), AssertionOperator::GreaterThan, "30")).passed);
        assert!(!run(&assertion(age, AssertionOperator::LessThan, "30")).passed);

        let missing = AssertionTarget::JsonPath {
            path: "user.email".into(),
        };
        assert!(run(&assertion(missing, AssertionOperator::NotExists, "")).passed);
    }

    #[test]
    fn header_and_cookie_targets() {
        let ct = AssertionTarget::Header {
            name: "content-type".into(),
        };
        assert!(run(&assertion(ct, AssertionOperator::Contains, "json")).passed);

        let cookie = AssertionTarget::Cookie { name: "sid".into() };
        assert!(run(&assertion(cookie.clone(), AssertionOperator::Equals, "xyz")).passed);

        let jar = [CookieRecord {
            name: "sid".into(),
            value: "from-jar".into(),
        }];
        let result = assertion(cookie, AssertionOperator::Equals, "from-jar")
            .evaluate("t", Some(&response()), &jar)
            .unwrap();
        assert!(result.passed);
    }

    #[test]
    fn body_matches_regex() {
        let a = assertion(AssertionTarget::Body, AssertionOperator::Matches, r#""age":\d+"#);
        assert!(run(&a).passed);
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let a = assertion(AssertionTarget::Body, AssertionOperator::Matches, "(");
        assert!(a.evaluate("t", Some(&response()), &[]).is_err());
    }

    #[test]
    fn non_json_body_is_an_error() {
        let mut r = response();
        r.body = "<html/>".into();
        let a = assertion(
            AssertionTarget::JsonPath { path: "a".into() },
            AssertionOperator::Exists,
            "",
        );
        assert!(a.evaluate("t", Some(&r), &[]).is_err());
    }

    #[test]
    fn missing_response_fails_without_error() {
        let a = assertion(AssertionTarget::StatusCode, AssertionOperator::Exists, "");
        let result = a.evaluate("t", None, &[]).unwrap();
        assert!(!result.passed);
        assert_eq!(result.message.as_deref(), Some("No response available"));
    }

    #[test]
    fn deserializes_flattened_target() {
        let a: Assertion = serde_json::from_str(
            r#"{"target":"header","name":"X-Id","operator":"exists"}"#,
        )
        .unwrap();
        assert_eq!(
            a.target,
            AssertionTarget::Header {
                name: "X-Id".into()
            }
        );
        assert_eq!(a.operator, AssertionOperator::Exists);
        assert!(a.expected.is_empty());
    }
}
