#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use runman::{Collection, Run, RunEvent, RunOptions, RunSummary, Runner, RunnerOptions};
use serde_json::Value;
use tokio::sync::mpsc;
use wiremock::{Match, Request};

/// Run `collection` to completion and return every emitted event.
pub async fn run_collection(collection: Value, options: RunOptions) -> (Vec<RunEvent>, RunSummary) {
    let collection = Collection::from_json(&collection.to_string()).expect("invalid collection");
    let run = Runner::new(RunnerOptions::default())
        .run(&collection, options)
        .expect("run setup failed");
    drain(start_collecting(run).await)
}

pub async fn start_collecting(run: Run) -> (mpsc::UnboundedReceiver<RunEvent>, RunSummary) {
    let (tx, rx) = mpsc::unbounded_channel();
    let summary = run.start(tx).await;
    (rx, summary)
}

pub fn drain((mut rx, summary): (mpsc::UnboundedReceiver<RunEvent>, RunSummary)) -> (Vec<RunEvent>, RunSummary) {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let done = events.iter().filter(|e| matches!(e, RunEvent::Done { .. })).count();
    assert_eq!(done, 1, "done must be emitted exactly once");
    assert!(
        matches!(events.last(), Some(RunEvent::Done { .. })),
        "done must be the last event"
    );
    (events, summary)
}

pub fn names(events: &[RunEvent]) -> Vec<&'static str> {
    events.iter().map(RunEvent::name).collect()
}

pub fn options_with_base(base: &str) -> RunOptions {
    let mut options = RunOptions::default();
    options.environment.set("base", base);
    options
}

/// Collection with a single folder-less list of items.
pub fn collection(items: Value) -> Value {
    serde_json::json!({
        "info": {"name": "integration"},
        "item": items,
    })
}

/// Matches requests whose `Authorization` header starts with a prefix, or
/// requests with no `Authorization` header at all.
pub struct AuthorizationPrefix(Option<String>);

impl AuthorizationPrefix {
    pub fn absent() -> Self {
        Self(None)
    }

    pub fn starting_with(prefix: impl Into<String>) -> Self {
        Self(Some(prefix.into()))
    }
}

impl Match for AuthorizationPrefix {
    fn matches(&self, request: &Request) -> bool {
        let value = request
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        match (&self.0, value) {
            (None, None) => true,
            (Some(prefix), Some(value)) => value.starts_with(prefix.as_str()),
            _ => false,
        }
    }
}

/// Base64 NTLM Type 2 message with a fixed server challenge and an NT
/// domain target info entry.
pub fn ntlm_challenge_token() -> String {
    const UNICODE_AND_NTLM: u32 = 0x0000_0201;
    let domain: Vec<u8> = "CORP".encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut target_info = Vec::new();
    target_info.extend_from_slice(&2u16.to_le_bytes());
    target_info.extend_from_slice(&(domain.len() as u16).to_le_bytes());
    target_info.extend_from_slice(&domain);
    target_info.extend_from_slice(&[0, 0, 0, 0]);

    let header_len = 56u32;
    let mut bytes = b"NTLMSSP\0".to_vec();
    bytes.extend_from_slice(&2u32.to_le_bytes());
    for len in [domain.len() as u16; 2] {
        bytes.extend_from_slice(&len.to_le_bytes());
    }
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(&UNICODE_AND_NTLM.to_le_bytes());
    bytes.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    bytes.extend_from_slice(&[0; 8]);
    for len in [target_info.len() as u16; 2] {
        bytes.extend_from_slice(&len.to_le_bytes());
    }
    bytes.extend_from_slice(&(header_len + domain.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&[0; 8]);
    bytes.extend_from_slice(&domain);
    bytes.extend_from_slice(&target_info);
    BASE64.encode(bytes)
}
