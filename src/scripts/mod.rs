//! # Event Scripts
//!
//! Pre-request and test scripts are declarative step lists run in a
//! restricted sandbox: a step can read the current response, read and write
//! variable scopes, record assertions and steer the run. Nothing else is
//! reachable from a script.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::environment::{VariableScope, VariableScopes};
use crate::http::client::CookieRecord;
use crate::http::request::ResolvedRequest;
use crate::http::response::ResponseRecord;
use crate::testing::{select_json, Assertion, AssertionResult};

/// Lifecycle event at which a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptEvent {
    Prerequest,
    Test,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsoleLevel {
    #[default]
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// Where an `extract` step reads its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ExtractSource {
    StatusCode,
    Header {
        name: String,
    },
    JsonPath {
        path: String,
    },
    BodyRegex {
        pattern: String,
        #[serde(default = "default_group")]
        group: usize,
    },
    Cookie {
        name: String,
    },
    Body,
}

fn default_group() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ScriptStep {
    Set {
        scope: VariableScope,
        key: String,
        #[serde(default)]
        value: String,
    },
    Unset {
        scope: VariableScope,
        key: String,
    },
    Extract {
        scope: VariableScope,
        key: String,
        from: ExtractSource,
    },
    Test {
        name: String,
        assert: Assertion,
    },
    SetHeader {
        key: String,
        #[serde(default)]
        value: String,
    },
    RemoveHeader {
        key: String,
    },
    SkipRequest,
    SetNextRequest {
        #[serde(default)]
        target: Option<String>,
    },
    Log {
        #[serde(default)]
        level: ConsoleLevel,
        message: String,
    },
    Fail {
        message: String,
    },
}

/// A script attached to a collection, folder or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScript {
    pub listen: ScriptEvent,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub script: Vec<ScriptStep>,
}

/// Exception raised by a script. Stops the rest of that script.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{source_name}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct ScriptError {
    /// Which script raised it, e.g. `collection` or `folder "Users"`.
    pub source_name: String,
    pub message: String,
}

/// Request header change queued by a pre-request script. Applied once the
/// request has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOp {
    Set(String, String),
    Remove(String),
}

impl HeaderOp {
    pub fn apply(&self, request: &mut ResolvedRequest) {
        match self {
            HeaderOp::Set(key, value) => request.set_header(key, value.clone()),
            HeaderOp::Remove(key) => request.remove_header(key),
        }
    }
}

/// Where the run goes after the current item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextRequest {
    Item(String),
    EndIteration,
}

/// Something a script reported while it ran, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSignal {
    Console { level: ConsoleLevel, message: String },
    Assertion(AssertionResult),
    Exception(ScriptError),
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    pub signals: Vec<ScriptSignal>,
    pub assertions: Vec<AssertionResult>,
    pub error: Option<ScriptError>,
    pub skip_request: bool,
    pub next_request: Option<NextRequest>,
    pub header_ops: Vec<HeaderOp>,
    pub scripts_run: usize,
}

impl ScriptOutcome {
    pub fn failed_assertions(&self) -> usize {
        self.assertions.iter().filter(|a| !a.passed).count()
    }
}

/// Everything a script may touch.
pub struct ScriptContext<'a> {
    pub event: ScriptEvent,
    pub scopes: &'a mut VariableScopes,
    pub response: Option<&'a ResponseRecord>,
    pub cookies: &'a [CookieRecord],
}

/// Run `scripts` in order. An exception ends the script that raised it;
/// the following scripts still run.
pub fn run_scripts(scripts: &[(String, EventScript)], ctx: &mut ScriptContext<'_>) -> ScriptOutcome {
    let mut outcome = ScriptOutcome::default();

    for (source_name, script) in scripts {
        if script.disabled || script.listen != ctx.event {
            continue;
        }
        outcome.scripts_run += 1;

        for step in &script.script {
            if let Err(message) = run_step(step, ctx, &mut outcome) {
                let error = ScriptError {
                    source_name: source_name.clone(),
                    message,
                };
                outcome.signals.push(ScriptSignal::Exception(error.clone()));
                if outcome.error.is_none() {
                    outcome.error = Some(error);
                }
                break;
            }
        }
    }

    outcome
}

fn run_step(step: &ScriptStep, ctx: &mut ScriptContext<'_>, outcome: &mut ScriptOutcome) -> Result<(), String> {
    match step {
        ScriptStep::Set { scope, key, value } => {
            let value = ctx.scopes.interpolate(value);
            writable(ctx, *scope)?.set(key.clone(), value);
        }
        ScriptStep::Unset { scope, key } => {
            writable(ctx, *scope)?.unset(key);
        }
        ScriptStep::Extract { scope, key, from } => {
            let value = extract(from, ctx)?
                .ok_or_else(|| format!("Nothing to extract into `{key}`"))?;
            writable(ctx, *scope)?.set(key.clone(), value);
        }
        ScriptStep::Test { name, assert } => {
            let name = ctx.scopes.interpolate(name);
            let result = assert.evaluate(&name, ctx.response, ctx.cookies)?;
            outcome.signals.push(ScriptSignal::Assertion(result.clone()));
            outcome.assertions.push(result);
        }
        ScriptStep::SetHeader { key, value } => {
            prerequest_only(ctx, "setHeader")?;
            let value = ctx.scopes.interpolate(value);
            outcome.header_ops.push(HeaderOp::Set(key.clone(), value));
        }
        ScriptStep::RemoveHeader { key } => {
            prerequest_only(ctx, "removeHeader")?;
            outcome.header_ops.push(HeaderOp::Remove(key.clone()));
        }
        ScriptStep::SkipRequest => {
            prerequest_only(ctx, "skipRequest")?;
            outcome.skip_request = true;
        }
        ScriptStep::SetNextRequest { target } => {
            outcome.next_request = Some(match target {
                Some(target) => NextRequest::Item(ctx.scopes.interpolate(target)),
                None => NextRequest::EndIteration,
            });
        }
        ScriptStep::Log { level, message } => {
            outcome.signals.push(ScriptSignal::Console {
                level: *level,
                message: ctx.scopes.interpolate(message),
            });
        }
        ScriptStep::Fail { message } => return Err(ctx.scopes.interpolate(message)),
    }
    Ok(())
}

fn writable<'s>(
    ctx: &'s mut ScriptContext<'_>,
    scope: VariableScope,
) -> Result<&'s mut crate::environment::VariableList, String> {
    if scope == VariableScope::Data {
        return Err("Iteration data is read-only".into());
    }
    Ok(ctx.scopes.scope_mut(scope))
}

fn prerequest_only(ctx: &ScriptContext<'_>, op: &str) -> Result<(), String> {
    if ctx.event == ScriptEvent::Prerequest {
        Ok(())
    } else {
        Err(format!("`{op}` is only available in pre-request scripts"))
    }
}

fn extract(source: &ExtractSource, ctx: &ScriptContext<'_>) -> Result<Option<String>, String> {
    let response = ctx
        .response
        .ok_or_else(|| "No response available to extract from".to_string())?;

    Ok(match source {
        ExtractSource::StatusCode => Some(response.status.to_string()),
        ExtractSource::Header { name } => response.header(name).map(str::to_string),
        ExtractSource::Body => Some(response.body.clone()),
        ExtractSource::JsonPath { path } => select_json(&response.json()?, path)?,
        ExtractSource::BodyRegex { pattern, group } => {
            let regex = Regex::new(pattern).map_err(|err| format!("Invalid regex `{pattern}`: {err}"))?;
            regex
                .captures(&response.body)
                .and_then(|caps| caps.get(*group))
                .map(|m| m.as_str().to_string())
        }
        ExtractSource::Cookie { name } => ctx
            .cookies
            .iter()
            .find(|c| &c.name == name)
            .map(|c| c.value.clone())
            .or_else(|| response.set_cookie(name)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::KeyValue;
    use crate::testing::{AssertionOperator, AssertionTarget};

    fn response() -> ResponseRecord {
        ResponseRecord {
            status: 201,
            status_text: "Created".into(),
            headers: vec![KeyValue::new("Location", "/users/9")],
            body: r#"{"id":9,"token":"t-123"}"#.into(),
            time: 5,
            size: 24,
            content_type: "application/json".into(),
        }
    }

    fn script(listen: ScriptEvent, steps: Vec<ScriptStep>) -> EventScript {
        EventScript {
            listen,
            disabled: false,
            script: steps,
        }
    }

    fn status_is(expected: &str) -> ScriptStep {
        ScriptStep::Test {
            name: format!("status is {expected}"),
            assert: Assertion {
                target: AssertionTarget::StatusCode,
                operator: AssertionOperator::Equals,
                expected: expected.into(),
            },
        }
    }

    #[test]
    fn extract_and_set_variables() {
        let mut scopes = VariableScopes::default();
        let response = response();
        let test = script(
            ScriptEvent::Test,
            vec![
                ScriptStep::Extract {
                    scope: VariableScope::Environment,
                    key: "token".into(),
                    from: ExtractSource::JsonPath { path: "token".into() },
                },
                ScriptStep::Extract {
                    scope: VariableScope::Collection,
                    key: "user".into(),
                    from: ExtractSource::BodyRegex {
                        pattern: r#""id":(\d+)"#.into(),
                        group: 1,
                    },
                },
                ScriptStep::Set {
                    scope: VariableScope::Globals,
                    key: "auth".into(),
                    value: "Bearer {{token}}".into(),
                },
            ],
        );
        let mut ctx = ScriptContext {
            event: ScriptEvent::Test,
            scopes: &mut scopes,
            response: Some(&response),
            cookies: &[],
        };
        let outcome = run_scripts(&[("item".into(), test)], &mut ctx);

        assert!(outcome.error.is_none());
        assert_eq!(scopes.environment.get("token"), Some("t-123"));
        assert_eq!(scopes.collection.get("user"), Some("9"));
        assert_eq!(scopes.globals.get("auth"), Some("Bearer t-123"));
    }

    #[test]
    fn exception_stops_script_but_not_the_next_one() {
        let mut scopes = VariableScopes::default();
        let response = response();
        let first = script(
            ScriptEvent::Test,
            vec![
                ScriptStep::Fail {
                    message: "boom".into(),
                },
                status_is("201"),
            ],
        );
        let second = script(ScriptEvent::Test, vec![status_is("200")]);
        let mut ctx = ScriptContext {
            event: ScriptEvent::Test,
            scopes: &mut scopes,
            response: Some(&response),
            cookies: &[],
        };
        let outcome = run_scripts(
            &[("collection".into(), first), ("item".into(), second)],
            &mut ctx,
        );

        let error = outcome.error.as_ref().unwrap();
        assert_eq!(error.to_string(), "collection: boom");
        assert_eq!(outcome.assertions.len(), 1);
        assert_eq!(outcome.failed_assertions(), 1);
        assert_eq!(outcome.scripts_run, 2);
        assert!(matches!(outcome.signals[0], ScriptSignal::Exception(_)));
        assert!(matches!(outcome.signals[1], ScriptSignal::Assertion(_)));
    }

    #[test]
    fn skip_request_is_prerequest_only() {
        let mut scopes = VariableScopes::default();
        let test = script(ScriptEvent::Test, vec![ScriptStep::SkipRequest]);
        let mut ctx = ScriptContext {
            event: ScriptEvent::Test,
            scopes: &mut scopes,
            response: None,
            cookies: &[],
        };
        let outcome = run_scripts(&[("item".into(), test)], &mut ctx);
        assert!(!outcome.skip_request);
        assert!(outcome.error.unwrap().message.contains("skipRequest"));
    }

    #[test]
    fn prerequest_steps_are_queued() {
        let mut scopes = VariableScopes::default();
        scopes.environment.set("id", "42");
        let pre = script(
            ScriptEvent::Prerequest,
            vec![
                ScriptStep::SetHeader {
                    key: "X-Id".into(),
                    value: "{{id}}".into(),
                },
                ScriptStep::Log {
                    level: ConsoleLevel::Info,
                    message: "id={{id}}".into(),
                },
                ScriptStep::SetNextRequest { target: None },
                ScriptStep::SkipRequest,
            ],
        );
        let ignored = script(ScriptEvent::Test, vec![ScriptStep::Fail { message: "x".into() }]);
        let mut ctx = ScriptContext {
            event: ScriptEvent::Prerequest,
            scopes: &mut scopes,
            response: None,
            cookies: &[],
        };
        let outcome = run_scripts(&[("item".into(), pre), ("item".into(), ignored)], &mut ctx);

        assert!(outcome.error.is_none());
        assert!(outcome.skip_request);
        assert_eq!(outcome.scripts_run, 1);
        assert_eq!(outcome.header_ops, vec![HeaderOp::Set("X-Id".into(), "42".into())]);
        assert_eq!(outcome.next_request, Some(NextRequest::EndIteration));
        assert_eq!(
            outcome.signals,
            vec![ScriptSignal::Console {
                level: ConsoleLevel::Info,
                message: "id=42".into()
            }]
        );
    }

    #[test]
    fn data_scope_is_read_only() {
        let mut scopes = VariableScopes::default();
        let pre = script(
            ScriptEvent::Prerequest,
            vec![ScriptStep::Set {
                scope: VariableScope::Data,
                key: "a".into(),
                value: "b".into(),
            }],
        );
        let mut ctx = ScriptContext {
            event: ScriptEvent::Prerequest,
            scopes: &mut scopes,
            response: None,
            cookies: &[],
        };
        let outcome = run_scripts(&[("item".into(), pre)], &mut ctx);
        assert!(outcome.error.is_some());
        assert!(scopes.data.is_empty());
    }

    #[test]
    fn extract_without_response_raises() {
        let mut scopes = VariableScopes::default();
        let test = script(
            ScriptEvent::Test,
            vec![ScriptStep::Extract {
                scope: VariableScope::Local,
                key: "s".into(),
                from: ExtractSource::StatusCode,
            }],
        );
        let mut ctx = ScriptContext {
            event: ScriptEvent::Test,
            scopes: &mut scopes,
            response: None,
            cookies: &[],
        };
        let outcome = run_scripts(&[("item".into(), test)], &mut ctx);
        assert!(outcome.error.unwrap().message.contains("No response"));
    }

    #[test]
    fn steps_deserialize() {
        let steps: Vec<ScriptStep> = serde_json::from_str(
            r#"[
                {"op":"set","scope":"environment","key":"a","value":"1"},
                {"op":"test","name":"ok","assert":{"target":"statusCode","operator":"equals","expected":"200"}},
                {"op":"setNextRequest","target":null},
                {"op":"extract","scope":"local","key":"id","from":{"source":"jsonPath","path":"$.id"}},
                {"op":"skipRequest"}
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 5);
        assert_eq!(steps[2], ScriptStep::SetNextRequest { target: None });
    }
}
