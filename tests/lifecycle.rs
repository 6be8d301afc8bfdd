//! Event ordering, variables, scripts and flow control across a run.

mod common;

use common::{collection, names, options_with_base, run_collection};
use runman::collections::{Entrypoint, EntrypointLookup};
use runman::summary::{FailureSource, RunStatus};
use runman::{Collection, RunEvent, RunError, RunOptions, Runner, RunnerOptions};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn status_test(expected: &str) -> serde_json::Value {
    json!({
        "listen": "test",
        "script": [{
            "op": "test",
            "name": format!("status is {expected}"),
            "assert": {"target": "statusCode", "operator": "equals", "expected": expected}
        }]
    })
}

#[tokio::test]
async fn single_item_emits_lifecycle_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
        .expect(1)
        .mount(&server)
        .await;

    let (events, summary) = run_collection(
        collection(json!([{
            "name": "Ping",
            "request": {"url": "{{base}}/ping"},
            "event": [status_test("200")]
        }])),
        options_with_base(&server.uri()),
    )
    .await;

    assert_eq!(
        names(&events),
        [
            "start",
            "beforeIteration",
            "beforeItem",
            "beforePrerequest",
            "prerequest",
            "beforeRequest",
            "request",
            "beforeTest",
            "assertion",
            "test",
            "item",
            "iteration",
            "done"
        ]
    );
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.stats.requests.total, 1);
    assert_eq!(summary.stats.assertions.total, 1);
    assert_eq!(summary.stats.test_scripts.total, 1);
    assert!(!summary.has_failures());

    let cursor = events.last().unwrap().cursor();
    assert_eq!(cursor.length, 1);
    assert_eq!(cursor.cycles, 1);
    assert!(cursor.eof);
}

#[tokio::test]
async fn extracted_variables_flow_into_later_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer abc"))
        .and(header("x-trace", "run-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "ada"})))
        .expect(1)
        .mount(&server)
        .await;

    let (_, summary) = run_collection(
        json!({
            "info": {"name": "auth flow"},
            "variable": [{"key": "trace", "value": "run-1"}],
            "item": [
                {
                    "name": "Login",
                    "request": {"method": "POST", "url": "{{base}}/login"},
                    "event": [{
                        "listen": "test",
                        "script": [{
                            "op": "extract",
                            "scope": "environment",
                            "key": "token",
                            "from": {"source": "jsonPath", "path": "$.token"}
                        }]
                    }]
                },
                {
                    "name": "Me",
                    "request": {
                        "url": "{{base}}/me",
                        "auth": {"type": "bearer", "token": "{{token}}"}
                    },
                    "event": [
                        {"listen": "prerequest", "script": [
                            {"op": "setHeader", "key": "X-Trace", "value": "{{trace}}"}
                        ]},
                        {"listen": "test", "script": [{
                            "op": "test",
                            "name": "name is ada",
                            "assert": {"target": "jsonPath", "path": "name", "operator": "equals", "expected": "ada"}
                        }]}
                    ]
                }
            ]
        }),
        options_with_base(&server.uri()),
    )
    .await;

    assert!(!summary.has_failures(), "{:?}", summary.failures);
    assert_eq!(summary.environment.get("token"), Some("abc"));
    assert_eq!(summary.stats.assertions.total, 1);
}

#[tokio::test]
async fn data_rows_drive_iterations() {
    let server = MockServer::start().await;
    for id in ["1", "2"] {
        Mock::given(method("GET"))
            .and(path(format!("/users/{id}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
    }

    let mut options = options_with_base(&server.uri());
    options.data = vec![
        json!({"id": 1}).as_object().unwrap().clone(),
        json!({"id": "2"}).as_object().unwrap().clone(),
    ];

    let (events, summary) = run_collection(
        collection(json!([{"name": "User", "request": {"url": "{{base}}/users/{{id}}"}}])),
        options,
    )
    .await;

    assert_eq!(summary.stats.iterations.total, 2);
    let iterations: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Iteration { cursor } => Some(cursor.iteration),
            _ => None,
        })
        .collect();
    assert_eq!(iterations, [0, 1]);
}

#[tokio::test]
async fn skip_request_skips_request_and_tests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (events, summary) = run_collection(
        collection(json!([{
            "name": "Skipped",
            "request": {"url": "{{base}}/never"},
            "event": [
                {"listen": "prerequest", "script": [{"op": "skipRequest"}]},
                status_test("200")
            ]
        }])),
        options_with_base(&server.uri()),
    )
    .await;

    assert_eq!(
        names(&events),
        [
            "start",
            "beforeIteration",
            "beforeItem",
            "beforePrerequest",
            "prerequest",
            "item",
            "iteration",
            "done"
        ]
    );
    assert!(matches!(events[5], RunEvent::Item { skipped: true, .. }));
    assert_eq!(summary.stats.skipped_items, 1);
    assert_eq!(summary.stats.requests.total, 0);
}

#[tokio::test]
async fn set_next_request_jumps_and_ends_iteration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/d"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (events, _) = run_collection(
        collection(json!([
            {
                "name": "A",
                "request": {"url": "{{base}}/a"},
                "event": [{"listen": "test", "script": [{"op": "setNextRequest", "target": "C"}]}]
            },
            {"name": "B", "request": {"url": "{{base}}/b"}},
            {
                "name": "C",
                "request": {"url": "{{base}}/c"},
                "event": [{"listen": "test", "script": [{"op": "setNextRequest", "target": null}]}]
            },
            {"name": "D", "request": {"url": "{{base}}/d"}}
        ])),
        options_with_base(&server.uri()),
    )
    .await;

    let items: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Item { item, .. } => Some(item.name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(items, ["A", "C"]);
}

#[tokio::test]
async fn request_error_still_runs_tests_without_response() {
    let (events, summary) = run_collection(
        collection(json!([{
            "name": "Down",
            "request": {"url": "http://127.0.0.1:1/down"},
            "event": [status_test("200")]
        }])),
        RunOptions::default(),
    )
    .await;

    let request_error = events.iter().find_map(|e| match e {
        RunEvent::Request { error, .. } => error.clone(),
        _ => None,
    });
    assert!(request_error.is_some());

    let assertion = events
        .iter()
        .find_map(|e| match e {
            RunEvent::Assertion { assertion, .. } => Some(assertion.clone()),
            _ => None,
        })
        .expect("test script should still run");
    assert!(!assertion.passed);
    assert_eq!(assertion.message.as_deref(), Some("No response available"));

    assert_eq!(summary.status, RunStatus::Completed);
    let sources: Vec<FailureSource> = summary.failures.iter().map(|f| f.source).collect();
    assert_eq!(sources, [FailureSource::Request, FailureSource::Assertion]);
    assert!(names(&events).contains(&"item"));
}

#[tokio::test]
async fn stop_on_failure_finishes_item_and_iteration() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/first"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/second"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut options = options_with_base(&server.uri());
    options.stop_on_failure = true;
    options.iteration_count = Some(2);

    let (events, summary) = run_collection(
        collection(json!([
            {"name": "First", "request": {"url": "{{base}}/first"}, "event": [status_test("200")]},
            {"name": "Second", "request": {"url": "{{base}}/second"}}
        ])),
        options,
    )
    .await;

    let tail: Vec<&str> = names(&events).into_iter().rev().take(4).collect();
    assert_eq!(tail, ["done", "iteration", "item", "test"]);
    assert_eq!(summary.status, RunStatus::Stopped);
    assert_eq!(summary.stats.iterations.total, 1);
}

#[tokio::test]
async fn abort_on_error_stops_right_after_failing_step() {
    let mut options = RunOptions::default();
    options.abort_on_error = true;

    let (events, summary) = run_collection(
        collection(json!([
            {"name": "Down", "request": {"url": "http://127.0.0.1:1/down"}},
            {"name": "Never", "request": {"url": "http://127.0.0.1:1/never"}}
        ])),
        options,
    )
    .await;

    let tail: Vec<&str> = names(&events).into_iter().rev().take(3).collect();
    assert_eq!(tail, ["done", "abort", "request"]);
    assert!(!names(&events).contains(&"item"));
    assert_eq!(summary.status, RunStatus::Aborted);
}

#[tokio::test]
async fn script_exception_is_reported_and_run_continues() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (events, summary) = run_collection(
        collection(json!([{
            "name": "Broken",
            "request": {"url": "{{base}}/x"},
            "event": [{"listen": "prerequest", "script": [
                {"op": "log", "level": "warn", "message": "about to fail"},
                {"op": "fail", "message": "bad setup"}
            ]}]
        }])),
        options_with_base(&server.uri()),
    )
    .await;

    let seq = names(&events);
    let pre = seq.iter().position(|n| *n == "prerequest").unwrap();
    assert_eq!(&seq[pre - 2..=pre], ["console", "exception", "prerequest"]);
    match &events[pre] {
        RunEvent::Prerequest { error: Some(error), .. } => {
            assert_eq!(error.message, "bad setup");
            assert_eq!(error.source_name, "item \"Broken\"");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(summary.stats.prerequest_scripts.failed, 1);
    assert_eq!(summary.stats.requests.total, 1);
}

#[tokio::test]
async fn entrypoint_runs_only_selected_folder() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut options = options_with_base(&server.uri());
    options.entrypoint = Some(Entrypoint {
        targets: vec!["Users".into()],
        lookup: EntrypointLookup::Path,
        follow_order: false,
    });

    let (_, summary) = run_collection(
        collection(json!([
            {"name": "Users", "item": [{"name": "List", "request": {"url": "{{base}}/users"}}]},
            {"name": "Health", "request": {"url": "{{base}}/health"}}
        ])),
        options,
    )
    .await;
    assert_eq!(summary.stats.items.total, 1);
}

#[tokio::test]
async fn setup_errors_are_returned_before_any_event() {
    let collection = Collection::from_json(
        &collection(json!([{"name": "Only", "request": {"url": "http://localhost/"}}])).to_string(),
    )
    .unwrap();

    let mut options = RunOptions::default();
    options.entrypoint = Some(Entrypoint::id_or_name("missing"));
    let result = Runner::new(RunnerOptions::default()).run(&collection, options);
    assert!(matches!(result, Err(RunError::Collection(_))));

    let mut options = RunOptions::default();
    options.abort_on_error = true;
    options.stop_on_error = true;
    let result = Runner::new(RunnerOptions::default()).run(&collection, options);
    assert!(matches!(result, Err(RunError::Options(_))));
}
